//! CentOS/Docker/EPEL mirror sync
//!
//! Periodically checks a set of configured upstream RPM repositories for
//! changes, pulls whatever packages are new or corrupt (deduping against
//! sibling local mirrors first), and keeps each mirror's metadata valid.

#![warn(missing_docs)]

use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use structopt::StructOpt;

mod cache;
mod config;
mod detect;
mod error;
mod fetch;
mod generate;
mod hash;
mod metadata;
mod orchestrator;
mod sync;

use config::Config;

#[derive(Debug, StructOpt)]
#[structopt(name = "centos-mirror-sync", about = "Mirrors RPM repositories locally")]
struct Opt {
    /// Path to a TOML configuration file. Falls back to the conventional
    /// per-program default locations, then to built-in defaults.
    #[structopt(long, short, parse(from_os_str))]
    config: Option<PathBuf>,

    /// Run a single sync cycle and exit, instead of looping forever.
    #[structopt(long)]
    once: bool,
}

fn load_config(path: Option<&Path>) -> error::Result<Config> {
    let mut config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            toml::from_str(&raw)?
        }
        None => loadconf::Load::try_load(env!("CARGO_PKG_NAME")).unwrap_or_default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

fn apply_env_overrides(config: &mut Config) {
    if let Some(v) = parsed_env("CENTOS_MIRROR_SYNC_INTERVAL_SECONDS") {
        config.sync_interval_seconds = v;
    }
    if let Some(v) = parsed_env("CENTOS_MIRROR_MAX_CONCURRENT_DOWNLOADS") {
        config.max_concurrent_downloads = v;
    }
    if let Some(v) = parsed_env("CENTOS_MIRROR_HTTP_TIMEOUT_SECONDS") {
        config.http_timeout_seconds = v;
    }
    if let Ok(v) = std::env::var("CENTOS_MIRROR_LOG_LEVEL") {
        config.log_level = v;
    }
}

fn parsed_env<T: std::str::FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}

fn init_logging(config: &Config) {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var(
            "RUST_LOG",
            format!("{}={}", env!("CARGO_PKG_NAME").replace('-', "_"), config.log_level),
        );
    }
    env_logger::init();
}

/// Waits for either Ctrl-C or (on Unix) SIGTERM.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                warn!("Could not install SIGTERM handler: {}", e);
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn wait_for_cancellation(mut rx: tokio::sync::watch::Receiver<bool>) {
    while let Some(cancelled) = rx.recv().await {
        if cancelled {
            return;
        }
    }
}

async fn run(opt: Opt) -> error::Result<()> {
    let config = load_config(opt.config.as_deref())?;
    init_logging(&config);

    debug!("Loaded configuration: {:?}", config);
    let client = fetch::client(config.http_timeout())?;

    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("Shutdown signal received, stopping after the current cycle");
        let _ = cancel_tx.broadcast(true);
    });

    loop {
        orchestrator::run_cycle(&client, &config).await;

        if opt.once || *cancel_rx.borrow() {
            break;
        }

        let sleep = tokio::time::delay_for(config.sync_interval());
        tokio::pin!(sleep);
        tokio::select! {
            _ = &mut sleep => {}
            _ = wait_for_cancellation(cancel_rx.clone()) => {}
        }

        if *cancel_rx.borrow() {
            break;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();
    if let Err(e) = run(opt).await {
        eprintln!("Fatal error: {}", e);
        std::process::exit(1);
    }
}

