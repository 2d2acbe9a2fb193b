//! HTTP fetching of repository metadata and package files.
//!
//! All three operations share a single [`reqwest::Client`] built with a
//! coarse per-request timeout; none of them retry on failure, that is left
//! to the sync engine, which knows which failures are safe to ignore.

use log::{debug, info};
use reqwest::{Client, Url};
use std::path::Path;
use std::time::Duration;
use tokio::fs::{remove_file, rename, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::{ErrorKind, Result};

/// Identifies this tool to upstream mirrors.
pub const USER_AGENT: &str = concat!("centos-mirror-sync/", env!("CARGO_PKG_VERSION"));

/// Build the shared client used for a whole sync cycle.
pub fn client(timeout: Duration) -> Result<Client> {
    Ok(Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()?)
}

fn check_status(url: &Url, status: reqwest::StatusCode) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else {
        Err(ErrorKind::HttpStatus(url.to_string(), status.as_u16()).into())
    }
}

/// GET a small text document such as `repomd.xml`.
pub async fn fetch_string(client: &Client, url: &Url) -> Result<String> {
    debug!("GET {} (text)", url);
    let response = client.get(url.clone()).send().await?;
    check_status(url, response.status())?;
    Ok(response.text().await?)
}

/// GET a mid-size binary document such as `primary.xml.gz`.
pub async fn fetch_bytes(client: &Client, url: &Url) -> Result<Vec<u8>> {
    debug!("GET {} (bytes)", url);
    let response = client.get(url.clone()).send().await?;
    check_status(url, response.status())?;
    Ok(response.bytes().await?.to_vec())
}

/// GET a file, writing it to `{dest}.downloading` and returning the number
/// of bytes written. The caller is responsible for verifying and renaming
/// the temp file into place; this function never promotes a partial write.
pub async fn fetch_to_file(client: &Client, url: &Url, dest: &Path) -> Result<u64> {
    let temp_path = downloading_path(dest);
    info!("Downloading '{}' to {:?}", url, dest);

    let mut response = client.get(url.clone()).send().await?;
    check_status(url, response.status())?;

    if let Some(parent) = temp_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&temp_path)
        .await?;

    let mut written: u64 = 0;
    while let Some(chunk) = response.chunk().await? {
        written += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    Ok(written)
}

/// Path of the temporary file a download is staged at before it is
/// verified and renamed into place.
pub fn downloading_path(dest: &Path) -> std::path::PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".downloading");
    dest.with_file_name(name)
}

/// Promote a verified temp file to its final path, removing any existing
/// file at the destination first.
pub async fn promote(temp_path: &Path, dest: &Path) -> Result<()> {
    if dest.exists() {
        remove_file(dest).await?;
    }
    rename(temp_path, dest).await?;
    Ok(())
}

/// Discard a temp file that failed verification.
pub async fn discard(temp_path: &Path) -> Result<()> {
    if temp_path.exists() {
        remove_file(temp_path).await?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn downloading_path_appends_suffix() {
        let dest = Path::new("/srv/mirror/Packages/a-1-1.el7.x86_64.rpm");
        let temp = downloading_path(dest);
        assert_eq!(
            temp,
            Path::new("/srv/mirror/Packages/a-1-1.el7.x86_64.rpm.downloading")
        );
    }
}
