//! Cheap change detection ahead of a full sync.
//!
//! `repomd.xml` is small, so the detector just fetches it fresh every
//! cycle and compares an MD5 of the bytes; MD5 here is an identity
//! witness, not a security boundary — the sync engine verifies packages
//! against the strong checksums repomd and primary actually publish.

use log::debug;
use reqwest::{Client, Url};
use std::path::Path;

use crate::fetch::fetch_bytes;
use crate::hash::md5_bytes;

/// Has the upstream `repomd.xml` changed relative to the local copy?
/// Defaults to `true` (sync) whenever that can't be determined cheaply:
/// no local copy, or the remote GET itself fails.
pub async fn has_changed(client: &Client, remote_url: &Url, local_path: &Path) -> bool {
    if !local_path.exists() {
        debug!("No local copy at {:?}, treating as changed", local_path);
        return true;
    }

    let remote_bytes = match fetch_bytes(client, remote_url).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("Failed to fetch '{}' for change check: {}", remote_url, e);
            return true;
        }
    };

    let local_bytes = match tokio::fs::read(local_path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("Failed to read {:?} for change check: {}", local_path, e);
            return true;
        }
    };

    let remote_digest = match md5_bytes(&remote_bytes) {
        Ok(digest) => digest,
        Err(_) => return true,
    };
    let local_digest = match md5_bytes(&local_bytes) {
        Ok(digest) => digest,
        Err(_) => return true,
    };

    let changed = remote_digest != local_digest;
    debug!(
        "repomd.xml comparison: remote={} local={} changed={}",
        remote_digest, local_digest, changed
    );
    changed
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn missing_local_file_is_always_changed() {
        let client = Client::new();
        let url = Url::parse("http://127.0.0.1:1/repodata/repomd.xml").unwrap();
        let changed = has_changed(&client, &url, Path::new("/nonexistent/repomd.xml")).await;
        assert!(changed);
    }
}
