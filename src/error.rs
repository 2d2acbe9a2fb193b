//! Errors generated.

use error_chain::error_chain;

error_chain! {
    foreign_links {
        Url(::url::ParseError);
        Xml(::serde_xml_rs::Error);
        Io(::std::io::Error);
        Reqwest(::reqwest::Error);
        Format(::std::fmt::Error);
        WalkDir(::walkdir::Error);
        StripPrefix(::std::path::StripPrefixError);
        OpenSsl(::openssl::error::ErrorStack);
        Toml(::toml::de::Error);
    }

    errors {
        NoPrimaryMeta {
            description("no primary repository metadata found in repomd.xml")
        }
        UnsupportedCompression(ext: String) {
            description("unsupported metadata compression")
            display("unsupported metadata compression: '{}'", ext)
        }
        UnknownChecksumAlgorithm(algorithm: String) {
            description("unknown checksum algorithm")
            display("unknown checksum algorithm: '{}'", algorithm)
        }
        ChecksumMismatch(path: String) {
            description("downloaded file failed checksum verification")
            display("checksum mismatch for '{}'", path)
        }
        SizeMismatch(path: String) {
            description("downloaded file failed size verification")
            display("size mismatch for '{}'", path)
        }
        MissingField(repo: String, field: &'static str) {
            description("repository descriptor is missing a required field")
            display("repo '{}' is missing required field '{}'", repo, field)
        }
        HttpStatus(url: String, status: u16) {
            description("non-2xx HTTP response")
            display("GET '{}' returned HTTP {}", url, status)
        }
    }
}
