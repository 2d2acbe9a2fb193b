//! Streaming checksums over files and byte strings.
//!
//! Hashing always runs over the raw bytes as they sit on disk or on the
//! wire; nothing here is a security primitive, it is an identity witness
//! used to decide whether two copies of a file are the same copy.

use openssl::hash::{Hasher, MessageDigest};
use std::io::Read;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::error::{ErrorKind, Result};

const BLOCK_SIZE: usize = 1024 * 1024 * 8;

/// Checksum algorithms understood by the repository metadata format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl Algorithm {
    pub fn parse(name: &str) -> Result<Algorithm> {
        Ok(match name {
            "md5" => Algorithm::Md5,
            "sha1" => Algorithm::Sha1,
            "sha224" => Algorithm::Sha224,
            "sha256" => Algorithm::Sha256,
            "sha384" => Algorithm::Sha384,
            "sha512" => Algorithm::Sha512,
            other => return Err(ErrorKind::UnknownChecksumAlgorithm(other.to_string()).into()),
        })
    }

    fn digest(self) -> MessageDigest {
        match self {
            Algorithm::Md5 => MessageDigest::md5(),
            Algorithm::Sha1 => MessageDigest::sha1(),
            Algorithm::Sha224 => MessageDigest::sha224(),
            Algorithm::Sha256 => MessageDigest::sha256(),
            Algorithm::Sha384 => MessageDigest::sha384(),
            Algorithm::Sha512 => MessageDigest::sha512(),
        }
    }
}

/// Hash a file on disk, streaming it in fixed-size blocks.
pub async fn hash_file(path: impl AsRef<Path>, algorithm: Algorithm) -> Result<String> {
    let mut hasher = Hasher::new(algorithm.digest())?;
    let mut file = File::open(path.as_ref()).await?;
    let mut block = vec![0u8; BLOCK_SIZE];

    loop {
        let read = file.read(&mut block).await?;
        if read == 0 {
            break;
        }
        hasher.update(&block[..read])?;
    }

    Ok(hex::encode(hasher.finish()?))
}

/// Convenience wrapper used by the change detector and cache, always SHA-256.
pub async fn sha256_file(path: impl AsRef<Path>) -> Result<String> {
    hash_file(path, Algorithm::Sha256).await
}

/// Convenience wrapper used by the change detector, always MD5.
pub async fn md5_file(path: impl AsRef<Path>) -> Result<String> {
    hash_file(path, Algorithm::Md5).await
}

/// Hash an in-memory byte string (used for the change detector's remote
/// fetch, which already has the bytes resident).
pub fn md5_bytes(data: &[u8]) -> Result<String> {
    digest_bytes(data, Algorithm::Md5)
}

/// Hash an in-memory byte string with an arbitrary algorithm.
pub fn digest_bytes(data: &[u8], algorithm: Algorithm) -> Result<String> {
    let mut hasher = Hasher::new(algorithm.digest())?;
    hasher.update(data)?;
    Ok(hex::encode(hasher.finish()?))
}

/// Blocking variant used by the synchronous metadata generator, which reads
/// whole files through `std::io` rather than the async runtime.
pub fn sha256_file_blocking(path: impl AsRef<Path>) -> Result<String> {
    let mut hasher = Hasher::new(MessageDigest::sha256())?;
    let mut file = std::fs::File::open(path.as_ref())?;
    let mut block = vec![0u8; BLOCK_SIZE];

    loop {
        let read = file.read(&mut block)?;
        if read == 0 {
            break;
        }
        hasher.update(&block[..read])?;
    }

    Ok(hex::encode(hasher.finish()?))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn bytes_digest_known_value() {
        let digest = md5_bytes(b"hello world").unwrap();
        assert_eq!(digest, "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn unknown_algorithm_errors() {
        assert!(Algorithm::parse("crc32").is_err());
    }

    #[tokio::test]
    async fn file_digest_matches_bytes_digest() {
        let dir = tempdir::TempDir::new("hash-test").unwrap();
        let path = dir.path().join("data.bin");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"some package bytes").unwrap();
        drop(file);

        let expected = digest_bytes(b"some package bytes", Algorithm::Sha256).unwrap();
        let actual = sha256_file(&path).await.unwrap();
        assert_eq!(expected, actual);
    }
}
