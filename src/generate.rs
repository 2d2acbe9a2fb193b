//! Fallback metadata generation.
//!
//! Upstream-supplied `repomd.xml`/`primary.xml` are always preferred; this
//! module only runs when an existing `repomd.xml` is missing or references
//! files that are no longer present, and reconstructs a minimal pair good
//! enough for install-time resolution (not for `yum provides`).

use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, info, warn};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

use crate::error::Result;
use crate::hash::sha256_file_blocking;
use crate::metadata::RepoMd;

const KNOWN_ARCHES: &[&str] = &[
    "x86_64", "noarch", "i686", "i386", "aarch64", "ppc64le", "s390x",
];

/// Ensure `local_root/repodata/repomd.xml` exists and references only
/// files that are actually present, regenerating it from the `.rpm` files
/// on disk if not.
pub fn ensure_metadata(local_root: &Path, repo_name: &str) -> Result<()> {
    let repomd_path = local_root.join("repodata/repomd.xml");

    if repomd_path.exists() {
        if let Ok(raw) = std::fs::read_to_string(&repomd_path) {
            if let Ok(repomd) = RepoMd::from_str(&raw) {
                let all_present = repomd
                    .referenced_files()
                    .iter()
                    .all(|href| local_root.join(href).exists());
                if all_present {
                    debug!("Repo '{}': existing repomd.xml is complete", repo_name);
                    return Ok(());
                }
                warn!(
                    "Repo '{}': repomd.xml references missing files, regenerating",
                    repo_name
                );
            } else {
                warn!("Repo '{}': repomd.xml is unparseable, regenerating", repo_name);
            }
        }
    } else {
        info!("Repo '{}': no repomd.xml present, generating fallback metadata", repo_name);
    }

    regenerate(local_root, repo_name)
}

struct ScannedPackage {
    relative_href: String,
    name: String,
    version: String,
    release: String,
    arch: String,
    sha256: String,
    size: u64,
    mtime: u64,
}

fn regenerate(local_root: &Path, repo_name: &str) -> Result<()> {
    let packages = scan_packages(local_root)?;
    info!(
        "Repo '{}': regenerating metadata for {} package(s)",
        repo_name,
        packages.len()
    );

    let primary_xml = render_primary_xml(&packages);

    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(primary_xml.as_bytes())?;
    let compressed = encoder.finish()?;

    std::fs::create_dir_all(local_root.join("repodata"))?;
    let primary_gz_path = local_root.join("repodata/primary.xml.gz");
    std::fs::write(&primary_gz_path, &compressed)?;

    let compressed_sha256 = crate::hash::digest_bytes(&compressed, crate::hash::Algorithm::Sha256)?;
    let open_sha256 = crate::hash::digest_bytes(primary_xml.as_bytes(), crate::hash::Algorithm::Sha256)?;
    let revision = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let repomd_xml = render_repomd_xml(
        revision,
        &compressed_sha256,
        compressed.len() as u64,
        &open_sha256,
        primary_xml.len() as u64,
    );

    std::fs::write(local_root.join("repodata/repomd.xml"), repomd_xml)?;

    Ok(())
}

fn scan_packages(local_root: &Path) -> Result<Vec<ScannedPackage>> {
    let repodata_dir = local_root.join("repodata");
    let mut packages = Vec::new();

    for entry in WalkDir::new(local_root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.path().starts_with(&repodata_dir) {
            continue;
        }
        if entry.path().extension().and_then(|e| e.to_str()) != Some("rpm") {
            continue;
        }

        let metadata = entry.metadata()?;
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let file_name = entry.file_name().to_string_lossy().to_string();
        let (name, version, release, arch) = parse_filename(&file_name);
        let sha256 = sha256_file_blocking(entry.path())?;
        let relative_href = relative_href(local_root, entry.path());

        packages.push(ScannedPackage {
            relative_href,
            name,
            version,
            release,
            arch,
            sha256,
            size: metadata.len(),
            mtime,
        });
    }

    Ok(packages)
}

fn relative_href(local_root: &Path, path: &Path) -> String {
    path.strip_prefix(local_root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// Split a `name-version-release.arch.rpm` filename into its parts. Falls
/// back to `x86_64`/`version=0`/`release=0` when the shape doesn't match.
fn parse_filename(file_name: &str) -> (String, String, String, String) {
    let stem = file_name.strip_suffix(".rpm").unwrap_or(file_name);

    let (remainder, arch) = match stem.rfind('.') {
        Some(idx) if KNOWN_ARCHES.contains(&&stem[idx + 1..]) => {
            (&stem[..idx], stem[idx + 1..].to_string())
        }
        _ => (stem, "x86_64".to_string()),
    };

    let parts: Vec<&str> = remainder.rsplitn(3, '-').collect();
    if parts.len() == 3 {
        (parts[2].to_string(), parts[1].to_string(), parts[0].to_string(), arch)
    } else {
        (remainder.to_string(), "0".to_string(), "0".to_string(), arch)
    }
}

fn escape_xml(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn render_primary_xml(packages: &[ScannedPackage]) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str(&format!(
        "<metadata xmlns=\"http://linux.duke.edu/metadata/common\" xmlns:rpm=\"http://linux.duke.edu/metadata/rpm\" packages=\"{}\">\n",
        packages.len()
    ));

    for package in packages {
        let header_end = package.size.min(65536);
        out.push_str("  <package type=\"rpm\">\n");
        out.push_str(&format!("    <name>{}</name>\n", escape_xml(&package.name)));
        out.push_str(&format!("    <arch>{}</arch>\n", escape_xml(&package.arch)));
        out.push_str(&format!(
            "    <version epoch=\"0\" ver=\"{}\" rel=\"{}\"/>\n",
            escape_xml(&package.version),
            escape_xml(&package.release)
        ));
        out.push_str(&format!(
            "    <checksum type=\"sha256\" pkgid=\"YES\">{}</checksum>\n",
            package.sha256
        ));
        out.push_str(&format!("    <summary>{}</summary>\n", escape_xml(&package.name)));
        out.push_str(&format!("    <description>{}</description>\n", escape_xml(&package.name)));
        out.push_str("    <packager></packager>\n");
        out.push_str("    <url></url>\n");
        out.push_str(&format!(
            "    <time file=\"{}\" build=\"{}\"/>\n",
            package.mtime, package.mtime
        ));
        out.push_str(&format!(
            "    <size package=\"{}\" installed=\"{}\" archive=\"{}\"/>\n",
            package.size, package.size, package.size
        ));
        out.push_str(&format!(
            "    <location href=\"{}\"/>\n",
            escape_xml(&package.relative_href)
        ));
        out.push_str("    <format>\n");
        out.push_str("      <rpm:license>Unknown</rpm:license>\n");
        out.push_str("      <rpm:vendor></rpm:vendor>\n");
        out.push_str("      <rpm:group>Unspecified</rpm:group>\n");
        out.push_str("      <rpm:buildhost></rpm:buildhost>\n");
        out.push_str("      <rpm:sourcerpm></rpm:sourcerpm>\n");
        out.push_str(&format!(
            "      <rpm:header-range start=\"0\" end=\"{}\"/>\n",
            header_end
        ));
        out.push_str("    </format>\n");
        out.push_str("  </package>\n");
    }

    out.push_str("</metadata>\n");
    out
}

fn render_repomd_xml(
    revision: u64,
    compressed_sha256: &str,
    compressed_size: u64,
    open_sha256: &str,
    open_size: u64,
) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
<repomd xmlns=\"http://linux.duke.edu/metadata/repo\">\n  \
<revision>{revision}</revision>\n  \
<data type=\"primary\">\n    \
<checksum type=\"sha256\">{compressed_sha256}</checksum>\n    \
<open-checksum type=\"sha256\">{open_sha256}</open-checksum>\n    \
<location href=\"repodata/primary.xml.gz\"/>\n    \
<timestamp>{revision}</timestamp>\n    \
<size>{compressed_size}</size>\n    \
<open-size>{open_size}</open-size>\n  \
</data>\n\
</repomd>\n",
        revision = revision,
        compressed_sha256 = compressed_sha256,
        open_sha256 = open_sha256,
        compressed_size = compressed_size,
        open_size = open_size,
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_standard_filename() {
        let (name, version, release, arch) = parse_filename("httpd-2.4.6-97.el7.centos.x86_64.rpm");
        assert_eq!(name, "httpd");
        assert_eq!(version, "2.4.6");
        assert_eq!(release, "97.el7.centos");
        assert_eq!(arch, "x86_64");
    }

    #[test]
    fn parses_simple_three_segment_filename() {
        let (name, version, release, arch) = parse_filename("foo-1.0-1.noarch.rpm");
        assert_eq!(name, "foo");
        assert_eq!(version, "1.0");
        assert_eq!(release, "1");
        assert_eq!(arch, "noarch");
    }

    #[test]
    fn falls_back_to_x86_64_when_arch_unrecognised() {
        let (name, version, release, arch) = parse_filename("weird-name-thing.rpm");
        assert_eq!(arch, "x86_64");
        assert_eq!(release, "thing");
        assert_eq!(version, "name");
        assert_eq!(name, "weird");
    }

    #[test]
    fn too_few_segments_falls_back_to_zero_version_release() {
        let (name, version, release, arch) = parse_filename("standalone.noarch.rpm");
        assert_eq!(name, "standalone");
        assert_eq!(version, "0");
        assert_eq!(release, "0");
        assert_eq!(arch, "noarch");
    }

    #[test]
    fn render_primary_xml_is_well_formed_enough_to_reparse() {
        let packages = vec![ScannedPackage {
            relative_href: "foo-1.0-1.noarch.rpm".to_string(),
            name: "foo".to_string(),
            version: "1.0".to_string(),
            release: "1".to_string(),
            arch: "noarch".to_string(),
            sha256: "0".repeat(64),
            size: 1024,
            mtime: 1595923200,
        }];

        let xml = render_primary_xml(&packages);
        let primary: crate::metadata::Primary = serde_xml_rs::from_str(&xml).unwrap();
        assert_eq!(primary.packages.len(), 1);
        assert_eq!(primary.packages[0].name, "foo");
        assert_eq!(primary.packages[0].license(), "Unknown");
    }

    #[test]
    fn ensure_metadata_regenerates_a_repomd_with_matching_checksums() {
        use flate2::read::GzDecoder;
        use std::io::Read;

        let dir = tempdir::TempDir::new("generate-test").unwrap();
        let root = dir.path();
        std::fs::write(root.join("pkg-1.0-2.el7.x86_64.rpm"), b"0123456789").unwrap();

        ensure_metadata(root, "test-repo").unwrap();

        let primary_gz_path = root.join("repodata/primary.xml.gz");
        assert!(primary_gz_path.exists());
        let repomd_path = root.join("repodata/repomd.xml");
        assert!(repomd_path.exists());

        let compressed = std::fs::read(&primary_gz_path).unwrap();
        let mut primary_xml = Vec::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_end(&mut primary_xml)
            .unwrap();

        let actual_compressed_sha256 =
            crate::hash::digest_bytes(&compressed, crate::hash::Algorithm::Sha256).unwrap();
        let actual_open_sha256 =
            crate::hash::digest_bytes(&primary_xml, crate::hash::Algorithm::Sha256).unwrap();

        let repomd_raw = std::fs::read_to_string(&repomd_path).unwrap();
        let repomd = RepoMd::from_str(&repomd_raw).unwrap();
        let primary_entry = repomd.data_entry("primary").unwrap();

        assert_eq!(primary_entry.checksum.value, actual_compressed_sha256);
        assert_eq!(primary_entry.size, compressed.len() as u64);
        assert_eq!(
            primary_entry.open_checksum.as_ref().unwrap().value,
            actual_open_sha256
        );
        assert_eq!(primary_entry.open_size, primary_xml.len() as u64);

        let primary: crate::metadata::Primary =
            serde_xml_rs::from_reader(primary_xml.as_slice()).unwrap();
        assert_eq!(primary.packages.len(), 1);
        let pkg = &primary.packages[0];
        assert_eq!(pkg.name, "pkg");
        assert_eq!(pkg.ver(), "1.0");
        assert_eq!(pkg.rel(), "2.el7");
        assert_eq!(pkg.arch, "x86_64");
        assert_eq!(pkg.package_size(), 10);
    }
}
