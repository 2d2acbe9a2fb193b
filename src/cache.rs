//! Content-addressed lookup across every locally mirrored repository.
//!
//! Built once per orchestrator cycle by walking every configured
//! `local_root`. The size-bucket pre-filter is what keeps dedup cheap:
//! package size is a strong (not perfect) fingerprint, so most lookups
//! resolve to "no candidates" or "one candidate" without hashing anything.

use log::{debug, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use walkdir::WalkDir;

use crate::hash::Algorithm;

/// Key for the digest memo: a specific file, hashed with a specific
/// algorithm. The memo is invalidated (not trusted) per-lookup if the
/// file's size has since changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DigestKey {
    path: PathBuf,
    algorithm: Algorithm,
}

struct DigestMemo {
    size_at_digest: u64,
    hex: String,
}

/// Size-indexed, checksum-verified cache of every `.rpm` file already
/// present under any configured mirror root.
pub struct ContentCache {
    by_size: Mutex<HashMap<u64, Vec<PathBuf>>>,
    digests: Mutex<HashMap<DigestKey, DigestMemo>>,
}

impl ContentCache {
    pub fn new() -> ContentCache {
        ContentCache {
            by_size: Mutex::new(HashMap::new()),
            digests: Mutex::new(HashMap::new()),
        }
    }

    /// Walk `root` recursively and register every `.rpm` file found.
    pub fn index_directory(&self, root: &Path) {
        if !root.exists() {
            return;
        }

        let mut count = 0;
        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.path().extension().and_then(|e| e.to_str()) != Some("rpm") {
                continue;
            }
            self.register_file(entry.path());
            count += 1;
        }
        debug!("Indexed {} existing package(s) under {:?}", count, root);
    }

    /// Add a single file to the index. Thread-safe against concurrent
    /// downloads registering their own new files.
    pub fn register_file(&self, path: &Path) {
        let size = match std::fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!("Could not stat {:?} while indexing: {}", path, e);
                return;
            }
        };

        let mut by_size = self.by_size.lock().expect("cache index lock poisoned");
        let bucket = by_size.entry(size).or_insert_with(Vec::new);
        if !bucket.contains(&path.to_path_buf()) {
            bucket.push(path.to_path_buf());
        }
    }

    /// Find an existing file matching `expected_size` and `expected_checksum`
    /// under `checksum_type`. Returns `None` for an empty checksum or a
    /// non-positive size, per the dedup contract.
    pub async fn find_matching_file(
        &self,
        expected_size: u64,
        expected_checksum: &str,
        checksum_type: Algorithm,
    ) -> Option<PathBuf> {
        if expected_size == 0 || expected_checksum.is_empty() {
            return None;
        }

        let candidates: Vec<PathBuf> = {
            let by_size = self.by_size.lock().expect("cache index lock poisoned");
            by_size.get(&expected_size)?.clone()
        };

        for candidate in candidates {
            if !candidate.exists() {
                continue;
            }

            match self.digest_of(&candidate, checksum_type).await {
                Ok(hex) if hex.eq_ignore_ascii_case(expected_checksum) => {
                    return Some(candidate);
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!("Could not hash candidate {:?}: {}", candidate, e);
                    continue;
                }
            }
        }

        None
    }

    async fn digest_of(&self, path: &Path, algorithm: Algorithm) -> crate::error::Result<String> {
        let size = std::fs::metadata(path)?.len();

        let key = DigestKey {
            path: path.to_path_buf(),
            algorithm,
        };

        if let Some(memo) = self.digests.lock().expect("digest memo lock poisoned").get(&key) {
            if memo.size_at_digest == size {
                return Ok(memo.hex.clone());
            }
        }

        let hex = crate::hash::hash_file(path, algorithm).await?;

        self.digests.lock().expect("digest memo lock poisoned").insert(
            key,
            DigestMemo {
                size_at_digest: size,
                hex: hex.clone(),
            },
        );

        Ok(hex)
    }
}

impl Default for ContentCache {
    fn default() -> ContentCache {
        ContentCache::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        path
    }

    #[tokio::test]
    async fn miss_on_empty_checksum() {
        let cache = ContentCache::new();
        let dir = tempdir::TempDir::new("cache-test").unwrap();
        let path = write_file(dir.path(), "a.rpm", b"abcdef");
        cache.register_file(&path);

        let found = cache.find_matching_file(6, "", Algorithm::Sha256).await;
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn finds_matching_file_by_size_and_digest() {
        let cache = ContentCache::new();
        let dir = tempdir::TempDir::new("cache-test").unwrap();
        let path = write_file(dir.path(), "a.rpm", b"package-bytes");
        cache.register_file(&path);

        let digest = crate::hash::digest_bytes(b"package-bytes", Algorithm::Sha256).unwrap();
        let found = cache
            .find_matching_file(13, &digest, Algorithm::Sha256)
            .await;
        assert_eq!(found, Some(path));
    }

    #[tokio::test]
    async fn no_match_when_digest_differs() {
        let cache = ContentCache::new();
        let dir = tempdir::TempDir::new("cache-test").unwrap();
        let path = write_file(dir.path(), "a.rpm", b"package-bytes");
        cache.register_file(&path);

        let found = cache
            .find_matching_file(13, "0".repeat(64).as_str(), Algorithm::Sha256)
            .await;
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn index_directory_walks_recursively() {
        let cache = ContentCache::new();
        let dir = tempdir::TempDir::new("cache-test").unwrap();
        std::fs::create_dir_all(dir.path().join("Packages")).unwrap();
        write_file(&dir.path().join("Packages"), "a.rpm", b"hello");
        write_file(dir.path(), "notes.txt", b"ignored");

        cache.index_directory(dir.path());

        let digest = crate::hash::digest_bytes(b"hello", Algorithm::Sha256).unwrap();
        let found = cache.find_matching_file(5, &digest, Algorithm::Sha256).await;
        assert!(found.is_some());
    }
}
