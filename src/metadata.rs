//! Parsing of `repomd.xml` and `primary.xml[.gz|.xz]`.
//!
//! The canonical namespaces (`repo`, `rpm`, `common`) are accepted but not
//! enforced by `serde-xml-rs`, which is namespace-unaware; the field
//! layout below matches what upstream CentOS/EPEL/Docker mirrors publish.

use flate2::read::GzDecoder;
use log::debug;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use xz2::read::XzDecoder;

use crate::error::{ErrorKind, Result};

/// A single `<checksum>` element: an algorithm name plus hex value.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Checksum {
    #[serde(rename = "type", default = "default_checksum_type")]
    pub algorithm: String,
    #[serde(rename = "$value", default)]
    pub value: String,
}

fn default_checksum_type() -> String {
    "sha256".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct Location {
    #[serde(default)]
    href: String,
}

/// One `<data>` entry in `repomd.xml`.
#[derive(Debug, Clone, Deserialize)]
pub struct DataEntry {
    #[serde(rename = "type")]
    pub kind: String,
    location: Location,
    pub checksum: Checksum,
    #[serde(rename = "open-checksum")]
    pub open_checksum: Option<Checksum>,
    #[serde(default)]
    pub size: u64,
    #[serde(rename = "open-size", default)]
    pub open_size: u64,
    #[serde(default)]
    pub timestamp: u64,
}

impl DataEntry {
    pub fn href(&self) -> &str {
        &self.location.href
    }
}

/// Parsed `repomd.xml`.
#[derive(Debug, Clone, Deserialize)]
pub struct RepoMd {
    #[serde(default)]
    pub revision: String,
    #[serde(rename = "data", default)]
    pub data: Vec<DataEntry>,
}

impl RepoMd {
    pub fn from_str(raw: &str) -> Result<RepoMd> {
        Ok(serde_xml_rs::from_str(raw)?)
    }

    /// Href of the `<data type="...">` entry, if present.
    pub fn data_href(&self, kind: &str) -> Option<&str> {
        self.data
            .iter()
            .find(|entry| entry.kind == kind)
            .map(DataEntry::href)
    }

    pub fn data_entry(&self, kind: &str) -> Option<&DataEntry> {
        self.data.iter().find(|entry| entry.kind == kind)
    }

    /// Every metadata file this repomd references, `repomd.xml` itself
    /// first. `group` entries are included whether or not their href sits
    /// under `repodata/`, per the mirror-layout special case.
    pub fn referenced_files(&self) -> Vec<&str> {
        let mut files = vec!["repodata/repomd.xml"];
        files.extend(self.data.iter().map(DataEntry::href));
        files
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Version {
    #[serde(default = "default_epoch")]
    epoch: String,
    #[serde(rename = "ver", default)]
    ver: String,
    #[serde(rename = "rel", default)]
    rel: String,
}

impl Default for Version {
    fn default() -> Version {
        Version {
            epoch: default_epoch(),
            ver: String::new(),
            rel: String::new(),
        }
    }
}

fn default_epoch() -> String {
    "0".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
struct Size {
    #[serde(rename = "package", default)]
    package: u64,
    #[serde(rename = "installed", default)]
    installed: u64,
    #[serde(rename = "archive", default)]
    archive: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct Time {
    #[serde(rename = "file", default)]
    file: u64,
    #[serde(rename = "build", default)]
    build: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct HeaderRange {
    #[serde(rename = "start", default)]
    start: u64,
    #[serde(rename = "end", default)]
    end: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct Format {
    #[serde(default)]
    license: String,
    #[serde(default)]
    vendor: String,
    #[serde(default)]
    group: String,
    #[serde(default)]
    buildhost: String,
    #[serde(default)]
    sourcerpm: String,
    #[serde(rename = "header-range")]
    header_range: Option<HeaderRange>,
}

/// A single `<package>` entry in `primary.xml`, with descriptive fields
/// carried through so the metadata generator can round-trip them.
#[derive(Debug, Clone, Deserialize)]
pub struct Package {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    version: Version,
    location: Location,
    pub checksum: Checksum,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub packager: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    time: Time,
    #[serde(default)]
    size: Size,
    #[serde(default)]
    format: Format,
}

impl Package {
    pub fn epoch(&self) -> &str {
        &self.version.epoch
    }

    pub fn ver(&self) -> &str {
        &self.version.ver
    }

    pub fn rel(&self) -> &str {
        &self.version.rel
    }

    pub fn location_href(&self) -> &str {
        &self.location.href
    }

    pub fn package_size(&self) -> u64 {
        self.size.package
    }

    pub fn installed_size(&self) -> u64 {
        self.size.installed
    }

    pub fn archive_size(&self) -> u64 {
        self.size.archive
    }

    pub fn file_time(&self) -> u64 {
        self.time.file
    }

    pub fn build_time(&self) -> u64 {
        self.time.build
    }

    pub fn license(&self) -> &str {
        &self.format.license
    }

    pub fn vendor(&self) -> &str {
        &self.format.vendor
    }

    pub fn group(&self) -> &str {
        &self.format.group
    }

    pub fn buildhost(&self) -> &str {
        &self.format.buildhost
    }

    pub fn sourcerpm(&self) -> &str {
        &self.format.sourcerpm
    }

    pub fn header_range(&self) -> (u64, u64) {
        self.format
            .header_range
            .as_ref()
            .map(|r| (r.start, r.end))
            .unwrap_or((0, 0))
    }

    /// Is this a structurally valid package record: non-empty, repo-rooted,
    /// `.rpm` location and a positive size?
    pub fn is_valid(&self) -> bool {
        let href = self.location_href();
        !href.is_empty()
            && !href.contains("..")
            && href.ends_with(".rpm")
            && self.package_size() > 0
    }
}

/// Parsed `primary.xml`.
#[derive(Debug, Clone, Deserialize)]
pub struct Primary {
    #[serde(rename = "package", default)]
    pub packages: Vec<Package>,
}

impl Primary {
    /// Decode a `primary.xml[.gz|.xz]` file, selecting decompression by
    /// file extension. An unrecognised extension is treated as a raw,
    /// uncompressed XML stream.
    pub fn load(path: &Path) -> Result<Primary> {
        debug!("Parsing primary metadata from {:?}", path);
        let file = std::fs::File::open(path)?;
        let raw = decompress(path, file)?;
        Ok(serde_xml_rs::from_reader(raw.as_slice())?)
    }
}

fn decompress(path: &Path, file: std::fs::File) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    match path.extension().and_then(|e| e.to_str()) {
        Some("gz") => {
            GzDecoder::new(file).read_to_end(&mut buf)?;
        }
        Some("xz") => {
            XzDecoder::new(file).read_to_end(&mut buf)?;
        }
        Some("xml") | None => {
            let mut file = file;
            file.read_to_end(&mut buf)?;
        }
        Some(other) => {
            return Err(ErrorKind::UnsupportedCompression(other.to_string()).into());
        }
    }
    Ok(buf)
}

/// Group packages by their declared location so callers can detect
/// duplicate entries (upstream primary indices are not guaranteed unique
/// by location, though well-formed ones are).
pub fn packages_by_location(primary: &Primary) -> BTreeMap<&str, &Package> {
    primary
        .packages
        .iter()
        .map(|p| (p.location_href(), p))
        .collect()
}
