//! One full pass over every configured repository.
//!
//! Builds the content cache once, then runs change-detect → sync →
//! metadata-ensure for each repo in turn. A single repo's failure is
//! logged and never aborts the remaining repos in the cycle.

use log::{info, warn};
use reqwest::{Client, Url};
use std::path::Path;
use std::sync::Arc;
use walkdir::WalkDir;

use crate::cache::ContentCache;
use crate::config::{Config, RepoDescriptor};
use crate::detect;
use crate::generate;
use crate::sync::{self, SyncReport};

/// Aggregate counts across every repo processed this cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleReport {
    pub repos_checked: usize,
    pub repos_synced: usize,
    pub network_downloaded: usize,
    pub local_copied: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl CycleReport {
    fn absorb(&mut self, sync: SyncReport) {
        self.repos_synced += 1;
        self.network_downloaded += sync.network_downloaded;
        self.local_copied += sync.local_copied;
        self.failed += sync.failed;
        self.skipped += sync.skipped;
    }
}

/// Run one full cycle across every valid repo in `config`.
pub async fn run_cycle(client: &Client, config: &Config) -> CycleReport {
    let repos = config.valid_repos();
    let cache = Arc::new(ContentCache::new());
    for repo in &repos {
        cache.index_directory(Path::new(&repo.local_path));
    }

    let mut report = CycleReport::default();

    for repo in &repos {
        report.repos_checked += 1;
        if let Err(e) = process_repo(client, repo, &cache, config.max_concurrent_downloads, &mut report).await {
            warn!("Repo '{}': cycle processing failed: {}", repo.name, e);
        }
    }

    for repo in &repos {
        log_directory_size(&repo.name, Path::new(&repo.local_path));
    }

    info!(
        "Cycle complete: checked={} synced={} network={} local={} failed={} skipped={}",
        report.repos_checked,
        report.repos_synced,
        report.network_downloaded,
        report.local_copied,
        report.failed,
        report.skipped
    );

    report
}

async fn process_repo(
    client: &Client,
    repo: &RepoDescriptor,
    cache: &Arc<ContentCache>,
    max_concurrent_downloads: usize,
    report: &mut CycleReport,
) -> crate::error::Result<()> {
    let base_url = Url::parse(&repo.base_url)?;
    let remote_repomd = base_url.join(sync::REPOMD_PATH)?;
    let local_repomd = Path::new(&repo.local_path).join(sync::REPOMD_PATH);

    if detect::has_changed(client, &remote_repomd, &local_repomd).await {
        info!("Repo '{}': change detected, syncing", repo.name);
        let sync_report = sync::sync(client, repo, cache, max_concurrent_downloads).await?;
        report.absorb(sync_report);
    } else {
        info!("Repo '{}': no change, skipping sync", repo.name);
    }

    if let Err(e) = generate::ensure_metadata(Path::new(&repo.local_path), &repo.name) {
        warn!("Repo '{}': metadata generation failed: {}", repo.name, e);
    }

    Ok(())
}

fn log_directory_size(repo_name: &str, local_root: &Path) {
    let total: u64 = WalkDir::new(local_root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum();

    info!("Repo '{}': {} on disk", repo_name, human_readable(total));
}

fn human_readable(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}
