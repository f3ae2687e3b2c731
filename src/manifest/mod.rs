//! Per-item file listings.
//!
//! A [`ManifestResolver`] turns an item identifier into the ordered list of
//! [`RemoteFile`] descriptors the repository publishes for it. Listings are
//! fetched on demand and never cached; the filter pipeline and the
//! reconciliation engine both start from a fresh listing.

mod archive;
mod error;

pub use archive::ArchiveResolver;
pub use error::ManifestError;

use async_trait::async_trait;
use url::Url;

/// Public metadata endpoint of archive.org.
pub const DEFAULT_METADATA_BASE: &str = "https://archive.org/metadata";

/// Public download endpoint of archive.org.
pub const DEFAULT_DOWNLOAD_BASE: &str = "https://archive.org/download";

/// Item landing page prefix, used in generated READMEs.
pub const DETAILS_BASE: &str = "https://archive.org/details";

/// One file listed in an item's manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub item_id: String,
    /// Name relative to the item, may contain `/`.
    pub name: String,
    /// Declared size; `None` when the listing omits it or it does not parse.
    pub size_bytes: Option<u64>,
    /// Lowercase final extension, empty when the name has none.
    pub kind: String,
    /// Server-side format label, e.g. `VBR MP3`.
    pub format: Option<String>,
}

impl RemoteFile {
    #[must_use]
    pub fn new(item_id: impl Into<String>, name: impl Into<String>, size_bytes: Option<u64>) -> Self {
        let name = name.into();
        Self {
            item_id: item_id.into(),
            kind: file_kind(&name),
            name,
            size_bytes,
            format: None,
        }
    }

    #[must_use]
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }
}

/// Lowercase extension of the last path segment of `name`.
#[must_use]
pub fn file_kind(name: &str) -> String {
    let last = name.rsplit('/').next().unwrap_or(name);
    match last.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_ascii_lowercase(),
        _ => String::new(),
    }
}

/// Resolves item identifiers to file listings.
#[async_trait]
pub trait ManifestResolver: Send + Sync {
    /// Fetches the ordered file listing of `item_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Unavailable`] on any failure.
    async fn resolve(&self, item_id: &str) -> Result<Vec<RemoteFile>, ManifestError>;
}

/// Base URLs for metadata and file downloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEndpoints {
    metadata_base: String,
    download_base: String,
}

impl Default for ArchiveEndpoints {
    fn default() -> Self {
        Self {
            metadata_base: DEFAULT_METADATA_BASE.to_string(),
            download_base: DEFAULT_DOWNLOAD_BASE.to_string(),
        }
    }
}

impl ArchiveEndpoints {
    /// Creates endpoints from explicit base URLs.
    ///
    /// # Errors
    ///
    /// Returns a parse error when either base is not an absolute URL.
    pub fn new(metadata_base: &str, download_base: &str) -> Result<Self, url::ParseError> {
        Url::parse(metadata_base)?;
        Url::parse(download_base)?;
        Ok(Self {
            metadata_base: metadata_base.trim_end_matches('/').to_string(),
            download_base: download_base.trim_end_matches('/').to_string(),
        })
    }

    /// Endpoints rooted at one server using the archive.org path layout
    /// (`/metadata/<id>`, `/download/<id>/<name>`).
    ///
    /// # Errors
    ///
    /// Returns a parse error when `root` is not an absolute URL.
    pub fn with_root(root: &str) -> Result<Self, url::ParseError> {
        let root = root.trim_end_matches('/');
        Self::new(&format!("{root}/metadata"), &format!("{root}/download"))
    }

    /// Metadata URL of an item.
    #[must_use]
    pub fn metadata_url(&self, item_id: &str) -> String {
        format!("{}/{}", self.metadata_base, urlencoding::encode(item_id))
    }

    /// Download URL of one file; each `/`-separated segment is percent-encoded.
    #[must_use]
    pub fn download_url(&self, item_id: &str, file_name: &str) -> String {
        let encoded_name = file_name
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        format!(
            "{}/{}/{}",
            self.download_base,
            urlencoding::encode(item_id),
            encoded_name
        )
    }
}

/// Landing page of an item.
#[must_use]
pub fn details_url(item_id: &str) -> String {
    format!("{DETAILS_BASE}/{}", urlencoding::encode(item_id))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_file_kind_uses_last_segment_extension() {
        assert_eq!(file_kind("a.MP3"), "mp3");
        assert_eq!(file_kind("dir.v2/readme"), "");
        assert_eq!(file_kind("archive.tar.gz"), "gz");
        assert_eq!(file_kind(".hidden"), "");
    }

    #[test]
    fn test_download_url_encodes_segments_but_keeps_slashes() {
        let endpoints = ArchiveEndpoints::default();
        assert_eq!(
            endpoints.download_url("my item", "disc 1/01 #intro.mp3"),
            "https://archive.org/download/my%20item/disc%201/01%20%23intro.mp3"
        );
    }

    #[test]
    fn test_metadata_url() {
        let endpoints = ArchiveEndpoints::with_root("http://127.0.0.1:9000/").unwrap();
        assert_eq!(
            endpoints.metadata_url("item"),
            "http://127.0.0.1:9000/metadata/item"
        );
    }

    #[test]
    fn test_endpoints_reject_relative_urls() {
        assert!(ArchiveEndpoints::new("metadata", "download").is_err());
    }

    #[test]
    fn test_remote_file_new_derives_kind() {
        let file = RemoteFile::new("item", "Track.FLAC", Some(3)).with_format("Flac");
        assert_eq!(file.kind, "flac");
        assert_eq!(file.format.as_deref(), Some("Flac"));
    }
}
