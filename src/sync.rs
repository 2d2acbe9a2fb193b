//! The repository sync engine (one repo per call).
//!
//! `sync` assumes the caller has already decided, via the change detector,
//! that this repo is worth syncing. It fetches metadata, diffs the
//! resulting package list against what is already on disk, and fetches
//! whatever is missing or corrupt — deduping against any other mirrored
//! repo's content cache first.

use log::{debug, info, warn};
use reqwest::{Client, Url};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

use crate::cache::ContentCache;
use crate::config::RepoDescriptor;
use crate::error::Result;
use crate::fetch;
use crate::hash::{self, Algorithm};
use crate::metadata::{Package, RepoMd};

pub const METADATA_DIR: &str = "repodata";
pub const REPOMD_PATH: &str = "repodata/repomd.xml";

/// Outcome of one `sync` call, reported by the orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub network_downloaded: usize,
    pub local_copied: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl SyncReport {
    fn merge(&mut self, other: SyncReport) {
        self.network_downloaded += other.network_downloaded;
        self.local_copied += other.local_copied;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

/// Sync one configured repo: pull metadata, diff packages, dedupe, fetch,
/// verify, commit. Per-artifact and per-package failures are logged and
/// counted rather than propagated; only a repo-fatal condition (no
/// parseable primary index) returns early with a partial report.
pub async fn sync(
    client: &Client,
    repo: &RepoDescriptor,
    cache: &Arc<ContentCache>,
    max_concurrent_downloads: usize,
) -> Result<SyncReport> {
    let local_root = PathBuf::from(&repo.local_path);
    let base_url = Url::parse(&repo.base_url)?;

    prepare_directories(&local_root).await?;

    let repomd = match fetch_repomd(client, &base_url, &local_root).await {
        Ok(repomd) => repomd,
        Err(e) => {
            warn!("Repo '{}': failed to fetch repomd.xml: {}", repo.name, e);
            return Ok(SyncReport::default());
        }
    };

    fetch_companion_metadata(client, &base_url, &local_root, &repomd).await;

    let primary_href = match repomd.data_href("primary") {
        Some(href) => href.to_string(),
        None => {
            warn!("Repo '{}': repomd.xml has no primary data entry", repo.name);
            return Ok(SyncReport::default());
        }
    };

    let primary_path = local_root.join(&primary_href);
    if !primary_path.exists() {
        warn!(
            "Repo '{}': primary metadata file {:?} was not fetched",
            repo.name, primary_path
        );
        return Ok(SyncReport::default());
    }

    let primary = match crate::metadata::Primary::load(&primary_path) {
        Ok(primary) => primary,
        Err(e) => {
            warn!("Repo '{}': failed to parse primary.xml: {}", repo.name, e);
            return Ok(SyncReport::default());
        }
    };

    info!(
        "Repo '{}': {} packages listed in primary metadata",
        repo.name,
        primary.packages.len()
    );

    let packages = reject_invalid_packages(&repo.name, primary.packages);

    let (needs_fetch, skipped) = diff_phase(&local_root, packages).await;

    let mut report = SyncReport {
        skipped,
        ..SyncReport::default()
    };
    report.merge(
        fetch_phase(
            client,
            &base_url,
            &local_root,
            needs_fetch,
            cache,
            max_concurrent_downloads,
        )
        .await,
    );

    info!(
        "Repo '{}': network={} local={} failed={} skipped={}",
        repo.name, report.network_downloaded, report.local_copied, report.failed, report.skipped
    );

    Ok(report)
}

/// Ensure the directories a mirror needs exist before anything is written.
pub async fn prepare_directories(local_root: &Path) -> Result<()> {
    tokio::fs::create_dir_all(local_root).await?;
    tokio::fs::create_dir_all(local_root.join("Packages")).await?;
    tokio::fs::create_dir_all(local_root.join(METADATA_DIR)).await?;
    Ok(())
}

async fn fetch_repomd(client: &Client, base_url: &Url, local_root: &Path) -> Result<RepoMd> {
    let url = base_url.join(REPOMD_PATH)?;
    let raw = fetch::fetch_string(client, &url).await?;
    tokio::fs::write(local_root.join(REPOMD_PATH), &raw).await?;
    RepoMd::from_str(&raw)
}

/// Fetch every companion metadata file (`primary`, `filelists`, `other`,
/// `group`, ...) that isn't already present with a matching SHA-256.
/// Per-entry failures are logged and do not stop the remaining entries.
async fn fetch_companion_metadata(
    client: &Client,
    base_url: &Url,
    local_root: &Path,
    repomd: &RepoMd,
) {
    for entry in &repomd.data {
        let href = entry.href();
        if href.is_empty() {
            continue;
        }
        let target = local_root.join(href);

        if target.exists() {
            match hash::sha256_file(&target).await {
                Ok(digest) if digest.eq_ignore_ascii_case(&entry.checksum.value) => {
                    debug!("Metadata {:?} already up to date", target);
                    continue;
                }
                Ok(_) => debug!("Metadata {:?} checksum stale, refetching", target),
                Err(e) => warn!("Could not hash existing {:?}: {}", target, e),
            }
        }

        let url = match base_url.join(href) {
            Ok(url) => url,
            Err(e) => {
                warn!("Bad metadata href '{}': {}", href, e);
                continue;
            }
        };

        if let Some(parent) = target.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!("Could not create {:?}: {}", parent, e);
                continue;
            }
        }

        match fetch::fetch_bytes(client, &url).await {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&target, &bytes).await {
                    warn!("Could not write metadata {:?}: {}", target, e);
                }
            }
            Err(e) => warn!("Failed to fetch metadata '{}': {}", url, e),
        }
    }
}

/// Drop any package record whose `locationHref` isn't structurally valid
/// (empty, escapes the repo root, or isn't a `.rpm`) before it ever
/// reaches a `local_root.join(...)` call. A malicious or malformed
/// `primary.xml` must not be able to steer a write outside `local_root`.
fn reject_invalid_packages(repo_name: &str, packages: Vec<Package>) -> Vec<Package> {
    let (valid, invalid): (Vec<Package>, Vec<Package>) =
        packages.into_iter().partition(|p| p.is_valid());

    for package in &invalid {
        warn!(
            "Repo '{}': dropping package '{}' with invalid location '{}'",
            repo_name,
            package.name,
            package.location_href()
        );
    }

    valid
}

/// Diff the parsed package list against the local tree. Runs with a
/// worker pool bounded at the host's logical CPU count, since this phase
/// is dominated by hashing existing files rather than network I/O.
async fn diff_phase(local_root: &Path, packages: Vec<Package>) -> (Vec<Package>, usize) {
    let queue = Arc::new(AsyncMutex::new(VecDeque::from(packages)));
    let needs_fetch = Arc::new(AsyncMutex::new(Vec::new()));
    let skipped = Arc::new(AtomicUsize::new(0));
    let corrupted = Arc::new(AtomicUsize::new(0));

    let width = num_cpus::get().max(1);
    let mut handles = Vec::with_capacity(width);

    for _ in 0..width {
        let queue = queue.clone();
        let needs_fetch = needs_fetch.clone();
        let skipped = skipped.clone();
        let corrupted = corrupted.clone();
        let local_root = local_root.to_path_buf();

        handles.push(tokio::spawn(async move {
            loop {
                let package = {
                    let mut queue = queue.lock().await;
                    match queue.pop_front() {
                        Some(package) => package,
                        None => break,
                    }
                };

                match check_package(&local_root, &package).await {
                    PackageState::Ok => {
                        skipped.fetch_add(1, Ordering::Relaxed);
                    }
                    PackageState::Corrupted => {
                        corrupted.fetch_add(1, Ordering::Relaxed);
                        needs_fetch.lock().await.push(package);
                    }
                    PackageState::Missing => {
                        needs_fetch.lock().await.push(package);
                    }
                }
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }

    let needs_fetch = Arc::try_unwrap(needs_fetch)
        .map(|m| m.into_inner())
        .unwrap_or_default();

    debug!(
        "Diff phase: skipped={} corrupted={} to_fetch={}",
        skipped.load(Ordering::Relaxed),
        corrupted.load(Ordering::Relaxed),
        needs_fetch.len()
    );

    (needs_fetch, skipped.load(Ordering::Relaxed))
}

enum PackageState {
    Ok,
    Corrupted,
    Missing,
}

/// Completeness snapshot of a repo's local tree against a primary index,
/// without fetching or mutating anything. Used to report how many
/// packages a cycle left needing a retry on the next pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletenessReport {
    pub complete: usize,
    pub missing: usize,
    pub corrupted: usize,
}

impl CompletenessReport {
    pub fn total(&self) -> usize {
        self.complete + self.missing + self.corrupted
    }
}

/// Read-only completeness check: for each package in `packages`, verify it
/// against the local tree the same way the diff phase would, but only
/// count the result rather than scheduling a fetch. Safe to call at any
/// time, including outside a sync cycle.
pub async fn check_local_completeness(
    local_root: &Path,
    packages: &[Package],
) -> CompletenessReport {
    let mut report = CompletenessReport::default();
    for package in packages {
        match check_package(local_root, package).await {
            PackageState::Ok => report.complete += 1,
            PackageState::Corrupted => report.corrupted += 1,
            PackageState::Missing => report.missing += 1,
        }
    }
    report
}

async fn check_package(local_root: &Path, package: &Package) -> PackageState {
    let target = local_root.join(package.location_href());

    let metadata = match tokio::fs::metadata(&target).await {
        Ok(metadata) => metadata,
        Err(_) => return PackageState::Missing,
    };

    if metadata.len() != package.package_size() {
        return PackageState::Corrupted;
    }

    if package.checksum.value.is_empty() {
        return PackageState::Ok;
    }

    let algorithm = match Algorithm::parse(&package.checksum.algorithm) {
        Ok(algorithm) => algorithm,
        Err(_) => Algorithm::Sha256,
    };

    match hash::hash_file(&target, algorithm).await {
        Ok(digest) if digest.eq_ignore_ascii_case(&package.checksum.value) => PackageState::Ok,
        Ok(_) => PackageState::Corrupted,
        Err(_) => PackageState::Corrupted,
    }
}

/// Fetch phase: bounded-parallelism worker pool, width
/// `max_concurrent_downloads`. Each worker owns its package and target
/// path exclusively; dedup is attempted via the shared content cache
/// before falling back to a network GET.
async fn fetch_phase(
    client: &Client,
    base_url: &Url,
    local_root: &Path,
    packages: Vec<Package>,
    cache: &Arc<ContentCache>,
    max_concurrent_downloads: usize,
) -> SyncReport {
    let total = packages.len();
    if total == 0 {
        return SyncReport::default();
    }

    let queue = Arc::new(AsyncMutex::new(VecDeque::from(packages)));
    let network_downloaded = Arc::new(AtomicUsize::new(0));
    let local_copied = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));

    let width = max_concurrent_downloads.max(1);
    let mut handles = Vec::with_capacity(width);

    for _ in 0..width {
        let queue = queue.clone();
        let client = client.clone();
        let base_url = base_url.clone();
        let local_root = local_root.to_path_buf();
        let cache = cache.clone();
        let network_downloaded = network_downloaded.clone();
        let local_copied = local_copied.clone();
        let failed = failed.clone();

        handles.push(tokio::spawn(async move {
            loop {
                let package = {
                    let mut queue = queue.lock().await;
                    match queue.pop_front() {
                        Some(package) => package,
                        None => break,
                    }
                };

                match fetch_one_package(&client, &base_url, &local_root, &package, &cache).await {
                    Ok(Outcome::Network) => {
                        let n = network_downloaded.fetch_add(1, Ordering::Relaxed) + 1;
                        if n % 50 == 0 {
                            info!("Fetched {} packages over the network so far", n);
                        }
                    }
                    Ok(Outcome::LocalCopy) => {
                        let n = local_copied.fetch_add(1, Ordering::Relaxed) + 1;
                        if n % 100 == 0 {
                            info!("Copied {} packages from the local cache so far", n);
                        }
                    }
                    Err(e) => {
                        warn!(
                            "Failed to fetch package '{}': {}",
                            package.location_href(),
                            e
                        );
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }

    SyncReport {
        network_downloaded: network_downloaded.load(Ordering::Relaxed),
        local_copied: local_copied.load(Ordering::Relaxed),
        failed: failed.load(Ordering::Relaxed),
        skipped: 0,
    }
}

enum Outcome {
    Network,
    LocalCopy,
}

async fn fetch_one_package(
    client: &Client,
    base_url: &Url,
    local_root: &Path,
    package: &Package,
    cache: &Arc<ContentCache>,
) -> Result<Outcome> {
    let target = local_root.join(package.location_href());
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let algorithm = Algorithm::parse(&package.checksum.algorithm).unwrap_or(Algorithm::Sha256);

    if !package.checksum.value.is_empty() {
        if let Some(existing) = cache
            .find_matching_file(package.package_size(), &package.checksum.value, algorithm)
            .await
        {
            if existing != target {
                tokio::fs::copy(&existing, &target).await?;
                cache.register_file(&target);
                return Ok(Outcome::LocalCopy);
            }
        }
    }

    let url = base_url.join(package.location_href())?;
    let temp_path = fetch::downloading_path(&target);
    let downloaded_size = fetch::fetch_to_file(client, &url, &target).await?;

    if downloaded_size != package.package_size() {
        fetch::discard(&temp_path).await?;
        return Err(crate::error::ErrorKind::SizeMismatch(target.display().to_string()).into());
    }

    if !package.checksum.value.is_empty() {
        let digest = hash::hash_file(&temp_path, algorithm).await?;
        if !digest.eq_ignore_ascii_case(&package.checksum.value) {
            fetch::discard(&temp_path).await?;
            return Err(
                crate::error::ErrorKind::ChecksumMismatch(target.display().to_string()).into(),
            );
        }
    }

    fetch::promote(&temp_path, &target).await?;
    cache.register_file(&target);

    Ok(Outcome::Network)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::metadata::Primary;

    const PRIMARY_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<metadata xmlns="http://linux.duke.edu/metadata/common" xmlns:rpm="http://linux.duke.edu/metadata/rpm" packages="2">
  <package type="rpm">
    <name>a</name>
    <arch>x86_64</arch>
    <version epoch="0" ver="1" rel="1.el7"/>
    <checksum type="sha256">aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa</checksum>
    <summary>a</summary>
    <description>a</description>
    <packager></packager>
    <url></url>
    <time file="1" build="1"/>
    <size package="5" installed="5" archive="5"/>
    <location href="Packages/a.rpm"/>
    <format>
      <rpm:license>GPLv2</rpm:license>
      <rpm:vendor></rpm:vendor>
      <rpm:group></rpm:group>
      <rpm:buildhost></rpm:buildhost>
      <rpm:sourcerpm></rpm:sourcerpm>
      <rpm:header-range start="0" end="0"/>
    </format>
  </package>
  <package type="rpm">
    <name>b</name>
    <arch>noarch</arch>
    <version epoch="0" ver="2" rel="1.el7"/>
    <checksum type="sha256">bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb</checksum>
    <summary>b</summary>
    <description>b</description>
    <packager></packager>
    <url></url>
    <time file="1" build="1"/>
    <size package="7" installed="7" archive="7"/>
    <location href="Packages/b.rpm"/>
    <format>
      <rpm:license>GPLv2</rpm:license>
      <rpm:vendor></rpm:vendor>
      <rpm:group></rpm:group>
      <rpm:buildhost></rpm:buildhost>
      <rpm:sourcerpm></rpm:sourcerpm>
      <rpm:header-range start="0" end="0"/>
    </format>
  </package>
</metadata>"#;

    #[tokio::test]
    async fn diff_phase_flags_missing_and_corrupted() {
        let dir = tempdir::TempDir::new("sync-test").unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("Packages")).unwrap();
        // "a" exists with the wrong size -> corrupted.
        std::fs::write(root.join("Packages/a.rpm"), b"xx").unwrap();
        // "b" does not exist on disk at all -> missing.

        let primary: Primary = serde_xml_rs::from_str(PRIMARY_XML).unwrap();
        let (needs_fetch, skipped) = diff_phase(root, primary.packages).await;

        assert_eq!(skipped, 0);
        assert_eq!(needs_fetch.len(), 2);
    }

    #[tokio::test]
    async fn diff_phase_skips_matching_package() {
        let dir = tempdir::TempDir::new("sync-test").unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("Packages")).unwrap();
        std::fs::write(root.join("Packages/a.rpm"), b"aaaaa").unwrap();
        std::fs::write(root.join("Packages/b.rpm"), b"bbbbbbb").unwrap();

        let mut primary: Primary = serde_xml_rs::from_str(PRIMARY_XML).unwrap();
        // Strip the checksums so size equality alone decides the outcome.
        for package in primary.packages.iter_mut() {
            package.checksum.value = String::new();
        }

        let (needs_fetch, skipped) = diff_phase(root, primary.packages).await;
        assert_eq!(needs_fetch.len(), 0);
        assert_eq!(skipped, 2);
    }

    #[tokio::test]
    async fn completeness_report_counts_each_outcome() {
        let dir = tempdir::TempDir::new("sync-test").unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("Packages")).unwrap();
        // "a" on disk but wrong size -> corrupted; "b" absent -> missing.
        std::fs::write(root.join("Packages/a.rpm"), b"xx").unwrap();

        let primary: Primary = serde_xml_rs::from_str(PRIMARY_XML).unwrap();
        let report = check_local_completeness(root, &primary.packages).await;

        assert_eq!(report.corrupted, 1);
        assert_eq!(report.missing, 1);
        assert_eq!(report.complete, 0);
        assert_eq!(report.total(), 2);
    }

    #[test]
    fn reject_invalid_packages_drops_path_traversal_and_keeps_the_rest() {
        let xml = PRIMARY_XML.replace("Packages/a.rpm", "../../../../tmp/pwned.rpm");
        let primary: Primary = serde_xml_rs::from_str(&xml).unwrap();
        assert_eq!(primary.packages.len(), 2);

        let valid = reject_invalid_packages("test-repo", primary.packages);

        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].location_href(), "Packages/b.rpm");
    }

    #[tokio::test]
    async fn dedup_copies_from_another_repo_without_a_network_fetch() {
        let source_dir = tempdir::TempDir::new("sync-dedup-source").unwrap();
        let dest_dir = tempdir::TempDir::new("sync-dedup-dest").unwrap();

        let source_path = source_dir.path().join("a.rpm");
        std::fs::write(&source_path, b"aaaaa").unwrap();

        let cache = Arc::new(ContentCache::new());
        cache.register_file(&source_path);

        // Package "a" in the fixture is 5 bytes with checksum a*64, which
        // is exactly what was just written to `source_path` above.
        let primary: Primary = serde_xml_rs::from_str(PRIMARY_XML).unwrap();
        let package = primary
            .packages
            .into_iter()
            .find(|p| p.location_href() == "Packages/a.rpm")
            .unwrap();

        // An unreachable base URL: if the dedup path failed to trigger
        // and fell through to a network fetch, this would error out
        // instead of returning a local copy.
        let client = Client::new();
        let base_url = Url::parse("http://127.0.0.1:1/").unwrap();

        let outcome = fetch_one_package(&client, &base_url, dest_dir.path(), &package, &cache)
            .await
            .unwrap();

        assert!(matches!(outcome, Outcome::LocalCopy));
        let target = dest_dir.path().join("Packages/a.rpm");
        assert_eq!(std::fs::read(&target).unwrap(), b"aaaaa");
    }
}
