//! Layered configuration for the mirror tool.
//!
//! Loaded once at startup via [`loadconf`], which resolves a config file
//! from the conventional locations for the running program and lets any
//! field be overridden by an environment variable prefixed with the
//! program name. Nothing here is hot-reloaded.

use log::warn;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{ErrorKind, Result};

fn default_sync_interval_seconds() -> u64 {
    86400
}

fn default_max_concurrent_downloads() -> usize {
    5
}

fn default_http_timeout_seconds() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Static description of one mirrored repository.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RepoDescriptor {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub local_path: String,
}

impl RepoDescriptor {
    /// A repo descriptor is only usable once it names both ends of the
    /// mirror; a missing field disables just this repo, not the process.
    pub fn validate(&self) -> Result<()> {
        if self.base_url.is_empty() {
            return Err(ErrorKind::MissingField(self.name.clone(), "base_url").into());
        }
        if self.local_path.is_empty() {
            return Err(ErrorKind::MissingField(self.name.clone(), "local_path").into());
        }
        Ok(())
    }
}

/// Top level configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_sync_interval_seconds")]
    pub sync_interval_seconds: u64,
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub centos: Vec<RepoDescriptor>,
    #[serde(default)]
    pub docker: Option<RepoDescriptor>,
    #[serde(default)]
    pub epel: Option<RepoDescriptor>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            sync_interval_seconds: default_sync_interval_seconds(),
            max_concurrent_downloads: default_max_concurrent_downloads(),
            http_timeout_seconds: default_http_timeout_seconds(),
            log_level: default_log_level(),
            centos: Vec::new(),
            docker: None,
            epel: None,
        }
    }
}

impl Config {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_seconds)
    }

    /// All configured repos, CentOS variants plus the optional Docker and
    /// EPEL singletons, in configuration order.
    pub fn repos(&self) -> Vec<RepoDescriptor> {
        let mut repos = self.centos.clone();
        if let Some(docker) = &self.docker {
            repos.push(docker.clone());
        }
        if let Some(epel) = &self.epel {
            repos.push(epel.clone());
        }
        repos
    }

    /// Repos that have both a `base_url` and `local_path`; repos that fail
    /// validation are logged and dropped rather than aborting startup.
    pub fn valid_repos(&self) -> Vec<RepoDescriptor> {
        self.repos()
            .into_iter()
            .filter(|repo| match repo.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!("Skipping repo '{}': {}", repo.name, e);
                    false
                }
            })
            .collect()
    }
}
