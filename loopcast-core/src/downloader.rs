//! Entry downloads with fallback endpoint and collision-safe naming.
//!
//! A transfer first goes to the primary endpoint; any failure there is
//! retried exactly once against the fallback endpoint. Bodies are streamed
//! to disk and a failed attempt removes whatever it wrote.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use crate::config::DownloadConfig;
use crate::indexer::is_plausible_identifier;
use crate::transport::{TransferResponse, Transport, TransportError};

/// Errors that can occur while downloading an entry
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Identifier is a placeholder or too short to be real
    #[error("Identifier not resolved: '{identifier}'")]
    IdentifierUnresolved { identifier: String },

    /// Target name is empty or names something other than a plain file
    #[error("Invalid target name: '{name}'")]
    InvalidTargetName { name: String },

    /// Endpoint answered with a non-success status
    #[error("Transfer from {url} returned status {status}")]
    Status { url: String, status: u16 },

    /// Endpoint answered with a page instead of file bytes
    #[error("Transfer from {url} returned {content_type} instead of media")]
    UnexpectedContent { url: String, content_type: String },

    #[error("Transfer failed: {0}")]
    Transport(#[from] TransportError),

    #[error("I/O error during {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: io::Error,
    },
}

impl DownloadError {
    fn io(operation: &str, source: io::Error) -> Self {
        Self::Io {
            operation: operation.to_string(),
            source,
        }
    }
}

/// Fetches entry bytes into a target directory.
pub struct EntryDownloader {
    transport: Arc<dyn Transport>,
    config: DownloadConfig,
    target_dir: PathBuf,
}

impl EntryDownloader {
    /// Creates a downloader writing into `target_dir`.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: DownloadConfig,
        target_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            transport,
            config,
            target_dir: target_dir.into(),
        }
    }

    /// Downloads one entry and returns the path actually written.
    ///
    /// If `target_name` already exists, `_1`, `_2`, ... is inserted before
    /// the extension until a free name is found.
    ///
    /// # Errors
    ///
    /// - `DownloadError::IdentifierUnresolved` - Placeholder or implausible identifier; no request is made
    /// - `DownloadError::InvalidTargetName` - Empty name or a name with path components
    /// - `DownloadError::Status` / `UnexpectedContent` / `Transport` - Both endpoints failed
    /// - `DownloadError::Io` - Local file could not be created or written
    pub async fn download(
        &self,
        identifier: &str,
        target_name: &str,
    ) -> Result<PathBuf, DownloadError> {
        if !is_plausible_identifier(identifier) {
            return Err(DownloadError::IdentifierUnresolved {
                identifier: identifier.to_string(),
            });
        }
        let name = validate_target_name(target_name)?;

        let primary = self.config.primary_url_template.replace("{id}", identifier);
        match self.attempt(&primary, name).await {
            Ok(path) => Ok(path),
            Err(e @ DownloadError::Io { .. }) => Err(e),
            Err(e) => {
                warn!("Primary transfer failed for {}: {}, trying fallback", name, e);
                let fallback = self.config.fallback_url_template.replace("{id}", identifier);
                self.attempt(&fallback, name).await
            }
        }
    }

    async fn attempt(&self, url: &str, name: &str) -> Result<PathBuf, DownloadError> {
        debug!("Requesting {}", url);
        let response = self.transport.get_body(url).await?;

        if !response.is_success() {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status: response.status,
            });
        }
        if let Some(content_type) = response
            .content_type
            .as_deref()
            .filter(|ct| ct.starts_with("text/html"))
        {
            return Err(DownloadError::UnexpectedContent {
                url: url.to_string(),
                content_type: content_type.to_string(),
            });
        }

        let (path, file) = claim_free_path(&self.target_dir, name).await?;
        match self.write_body(file, response).await {
            Ok(bytes) => {
                info!("Downloaded {} bytes to {}", bytes, path.display());
                Ok(path)
            }
            Err(e) => {
                if let Err(remove_error) = fs::remove_file(&path).await {
                    warn!(
                        "Failed to remove partial download {}: {}",
                        path.display(),
                        remove_error
                    );
                }
                Err(e)
            }
        }
    }

    async fn write_body(
        &self,
        file: File,
        mut response: TransferResponse,
    ) -> Result<u64, DownloadError> {
        let mut writer = BufWriter::with_capacity(self.config.write_chunk_size, file);
        let mut written = 0u64;

        while let Some(chunk) = response.chunks.next().await {
            let chunk = chunk?;
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| DownloadError::io("write download", e))?;
            written += chunk.len() as u64;
        }

        writer
            .flush()
            .await
            .map_err(|e| DownloadError::io("flush download", e))?;
        Ok(written)
    }
}

/// Rejects names that are empty or would escape the target directory.
fn validate_target_name(name: &str) -> Result<&str, DownloadError> {
    let trimmed = name.trim();
    let is_plain = Path::new(trimmed).file_name().is_some_and(|f| f == trimmed);
    if trimmed.is_empty() || !is_plain || trimmed.contains(['/', '\\']) {
        return Err(DownloadError::InvalidTargetName {
            name: name.to_string(),
        });
    }
    Ok(trimmed)
}

/// Candidate file name for the `index`-th collision (`0` is the name itself).
pub fn numbered_name(name: &str, index: u32) -> String {
    if index == 0 {
        return name.to_string();
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}_{index}.{ext}"),
        _ => format!("{name}_{index}"),
    }
}

/// Creates the first free `numbered_name` in `dir`.
///
/// Uses exclusive creation, so two concurrent downloads of the same title
/// never end up sharing a file.
async fn claim_free_path(dir: &Path, name: &str) -> Result<(PathBuf, File), DownloadError> {
    let mut index = 0u32;
    loop {
        let path = dir.join(numbered_name(name, index));
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => index += 1,
            Err(e) => return Err(DownloadError::io("create download file", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use proptest::prelude::*;
    use tempfile::TempDir;

    use super::*;
    use crate::transport::{MockResponse, MockTransport};

    const ID: &str = "1AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";

    fn urls() -> (String, String) {
        let config = DownloadConfig::default();
        (
            config.primary_url_template.replace("{id}", ID),
            config.fallback_url_template.replace("{id}", ID),
        )
    }

    fn downloader(transport: &MockTransport, dir: &TempDir) -> EntryDownloader {
        EntryDownloader::new(
            Arc::new(transport.clone()),
            DownloadConfig::default(),
            dir.path(),
        )
    }

    #[test]
    fn test_numbered_name_inserts_before_extension() {
        assert_eq!(numbered_name("title.mp4", 0), "title.mp4");
        assert_eq!(numbered_name("title.mp4", 1), "title_1.mp4");
        assert_eq!(numbered_name("my.clip.mov", 2), "my.clip_2.mov");
        assert_eq!(numbered_name("noext", 3), "noext_3");
        assert_eq!(numbered_name(".hidden", 1), ".hidden_1");
    }

    #[test]
    fn test_target_name_validation() {
        assert_eq!(validate_target_name(" clip.mp4 ").unwrap(), "clip.mp4");
        assert!(validate_target_name("").is_err());
        assert!(validate_target_name("../clip.mp4").is_err());
        assert!(validate_target_name("dir/clip.mp4").is_err());
        assert!(validate_target_name("..").is_err());
    }

    proptest! {
        #[test]
        fn numbered_names_are_distinct(stem in "[a-z]{1,8}", ext in "[a-z0-9]{1,4}", a in 0u32..50, b in 0u32..50) {
            let name = format!("{stem}.{ext}");
            prop_assume!(a != b);
            prop_assert_ne!(numbered_name(&name, a), numbered_name(&name, b));
            let suffix = format!(".{}", ext);
            prop_assert!(numbered_name(&name, a).ends_with(&suffix));
        }
    }

    #[tokio::test]
    async fn test_placeholder_identifier_makes_no_request() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new();

        let result = downloader(&transport, &dir).download("short", "x.mp4").await;

        assert!(matches!(
            result,
            Err(DownloadError::IdentifierUnresolved { .. })
        ));
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_collision_keeps_first_file() {
        let dir = TempDir::new().unwrap();
        let (primary, _) = urls();
        let transport = MockTransport::new().with_page(&primary, "second");
        std::fs::write(dir.path().join("title.mp4"), "first").unwrap();

        let path = downloader(&transport, &dir)
            .download(ID, "title.mp4")
            .await
            .unwrap();

        assert_eq!(path, dir.path().join("title_1.mp4"));
        assert_eq!(std::fs::read_to_string(dir.path().join("title.mp4")).unwrap(), "first");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
    }

    #[tokio::test]
    async fn test_fallback_used_after_failed_primary() {
        let dir = TempDir::new().unwrap();
        let (primary, fallback) = urls();
        let transport = MockTransport::new()
            .with_status(&primary, 403)
            .with_page(&fallback, "video-bytes");

        let path = downloader(&transport, &dir)
            .download(ID, "clip.mp4")
            .await
            .unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"video-bytes");
        assert_eq!(transport.requested_urls(), vec![primary, fallback]);
    }

    #[tokio::test]
    async fn test_interstitial_page_falls_back() {
        let dir = TempDir::new().unwrap();
        let (primary, fallback) = urls();
        let transport = MockTransport::new()
            .with_response(
                &primary,
                MockResponse::Html {
                    body: "<html>virus scan warning</html>".to_string(),
                },
            )
            .with_page(&fallback, "payload");

        let path = downloader(&transport, &dir)
            .download(ID, "big.mkv")
            .await
            .unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_both_attempts_failing_leaves_no_files() {
        let dir = TempDir::new().unwrap();
        let (primary, fallback) = urls();
        let transport = MockTransport::new()
            .with_response(
                &primary,
                MockResponse::Truncated {
                    chunks: vec![Bytes::from_static(b"partial")],
                },
            )
            .with_status(&fallback, 500);

        let result = downloader(&transport, &dir).download(ID, "clip.mp4").await;

        assert!(matches!(
            result,
            Err(DownloadError::Status { status: 500, .. })
        ));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn test_connection_failure_surfaces_transport_error() {
        let dir = TempDir::new().unwrap();
        let (primary, fallback) = urls();
        let transport = MockTransport::new()
            .with_response(&primary, MockResponse::ConnectionFailure)
            .with_response(&fallback, MockResponse::ConnectionFailure);

        let result = downloader(&transport, &dir).download(ID, "clip.mp4").await;

        assert!(matches!(result, Err(DownloadError::Transport(_))));
    }
}
