//! Video sources and how they are obtained.

use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::downloader::{DownloadError, EntryDownloader};
use crate::indexer::{RemoteEntry, has_video_extension};

/// Where a source's file came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceOrigin {
    Local,
    Remote,
    Uploaded,
}

/// A local file ready to be streamed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VideoSource {
    pub origin: SourceOrigin,
    pub display_name: String,
    pub local_path: PathBuf,
}

impl VideoSource {
    /// Whether the backing file belongs to the session and is removed with it.
    ///
    /// Only downloads are transient; local and uploaded files stay.
    pub fn is_transient(&self) -> bool {
        self.origin == SourceOrigin::Remote
    }

    /// Whether `local_path` currently points at a regular file.
    pub fn is_available(&self) -> bool {
        self.local_path.is_file()
    }
}

/// How the operator wants to obtain a source.
#[derive(Debug, Clone)]
pub enum SourceRequest {
    UseLocal(PathBuf),
    UseRemote(RemoteEntry),
    UseUploaded { bytes: Vec<u8>, name: String },
}

/// Errors that can occur while resolving a source
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Source not found: {path}")]
    SourceNotFound { path: PathBuf },

    #[error("Invalid file name: '{name}'")]
    InvalidName { name: String },

    #[error("Download failed: {0}")]
    Download(#[from] DownloadError),

    #[error("I/O error during {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: io::Error,
    },
}

/// Turns a `SourceRequest` into a `VideoSource` inside the working directory.
pub struct SourceResolver {
    working_dir: PathBuf,
    downloader: EntryDownloader,
}

impl SourceResolver {
    pub fn new(working_dir: impl Into<PathBuf>, downloader: EntryDownloader) -> Self {
        Self {
            working_dir: working_dir.into(),
            downloader,
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Resolves one request.
    ///
    /// Resolving never touches a running session; replacing the streamed
    /// file is the session controller's concern.
    ///
    /// # Errors
    ///
    /// - `SourceError::SourceNotFound` - Local path is not an existing file
    /// - `SourceError::InvalidName` - Upload name is empty or not a plain file name
    /// - `SourceError::Download` - Remote entry could not be fetched
    /// - `SourceError::Io` - Upload could not be written
    pub async fn resolve(&self, request: SourceRequest) -> Result<VideoSource, SourceError> {
        match request {
            SourceRequest::UseLocal(path) => self.resolve_local(path).await,
            SourceRequest::UseRemote(entry) => {
                let local_path = self
                    .downloader
                    .download(&entry.identifier, &entry.title)
                    .await?;
                info!("Remote entry '{}' stored at {}", entry.title, local_path.display());
                Ok(VideoSource {
                    origin: SourceOrigin::Remote,
                    display_name: entry.title,
                    local_path,
                })
            }
            SourceRequest::UseUploaded { bytes, name } => self.store_upload(&bytes, &name).await,
        }
    }

    async fn resolve_local(&self, path: PathBuf) -> Result<VideoSource, SourceError> {
        let path = if path.is_relative() {
            self.working_dir.join(path)
        } else {
            path
        };

        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => {}
            _ => return Err(SourceError::SourceNotFound { path }),
        }

        let display_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        debug!("Using local source {}", path.display());

        Ok(VideoSource {
            origin: SourceOrigin::Local,
            display_name,
            local_path: path,
        })
    }

    async fn store_upload(&self, bytes: &[u8], name: &str) -> Result<VideoSource, SourceError> {
        let file_name = Path::new(name.trim())
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .filter(|f| !f.is_empty() && f != "." && f != "..")
            .ok_or_else(|| SourceError::InvalidName {
                name: name.to_string(),
            })?;

        let path = self.working_dir.join(&file_name);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|source| SourceError::Io {
                operation: format!("write upload {}", path.display()),
                source,
            })?;
        info!("Stored upload '{}' ({} bytes)", file_name, bytes.len());

        Ok(VideoSource {
            origin: SourceOrigin::Uploaded,
            display_name: file_name,
            local_path: path,
        })
    }
}

/// Removes the backing file of a transient source. Failures are logged only.
pub async fn release_transient(source: &VideoSource) {
    if !source.is_transient() {
        return;
    }
    match tokio::fs::remove_file(&source.local_path).await {
        Ok(()) => debug!("Removed transient file {}", source.local_path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            "Failed to remove transient file {}: {}",
            source.local_path.display(),
            e
        ),
    }
}

/// Video files directly inside `dir`, sorted by name.
///
/// # Errors
///
/// - `SourceError::Io` - Directory could not be read
pub async fn list_local_videos(dir: &Path) -> Result<Vec<PathBuf>, SourceError> {
    let io_error = |source| SourceError::Io {
        operation: format!("list {}", dir.display()),
        source,
    };
    let mut entries = tokio::fs::read_dir(dir).await.map_err(io_error)?;
    let mut videos = Vec::new();

    while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
        let path = entry.path();
        let is_video = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(has_video_extension);
        if is_video && path.is_file() {
            videos.push(path);
        }
    }

    videos.sort();
    Ok(videos)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::config::DownloadConfig;
    use crate::transport::MockTransport;

    fn resolver(dir: &TempDir, transport: &MockTransport) -> SourceResolver {
        let downloader = EntryDownloader::new(
            Arc::new(transport.clone()),
            DownloadConfig::default(),
            dir.path(),
        );
        SourceResolver::new(dir.path(), downloader)
    }

    #[tokio::test]
    async fn test_local_relative_path_resolves_against_working_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("clip.mp4"), b"x").unwrap();
        let resolver = resolver(&dir, &MockTransport::new());

        let source = resolver
            .resolve(SourceRequest::UseLocal(PathBuf::from("clip.mp4")))
            .await
            .unwrap();

        assert_eq!(source.origin, SourceOrigin::Local);
        assert_eq!(source.display_name, "clip.mp4");
        assert_eq!(source.local_path, dir.path().join("clip.mp4"));
        assert!(!source.is_transient());
    }

    #[tokio::test]
    async fn test_missing_local_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&dir, &MockTransport::new());

        let missing = resolver
            .resolve(SourceRequest::UseLocal(PathBuf::from("gone.mp4")))
            .await;
        let directory = resolver
            .resolve(SourceRequest::UseLocal(dir.path().to_path_buf()))
            .await;

        assert!(matches!(missing, Err(SourceError::SourceNotFound { .. })));
        assert!(matches!(directory, Err(SourceError::SourceNotFound { .. })));
    }

    #[tokio::test]
    async fn test_upload_overwrites_existing_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("up.mp4"), b"old").unwrap();
        let resolver = resolver(&dir, &MockTransport::new());

        let source = resolver
            .resolve(SourceRequest::UseUploaded {
                bytes: b"new".to_vec(),
                name: "up.mp4".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(source.origin, SourceOrigin::Uploaded);
        assert_eq!(std::fs::read(&source.local_path).unwrap(), b"new");
        assert!(!source.is_transient());
    }

    #[tokio::test]
    async fn test_upload_name_is_reduced_to_file_name() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&dir, &MockTransport::new());

        let source = resolver
            .resolve(SourceRequest::UseUploaded {
                bytes: vec![1, 2, 3],
                name: "../../etc/clip.mp4".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(source.local_path, dir.path().join("clip.mp4"));

        let invalid = resolver
            .resolve(SourceRequest::UseUploaded {
                bytes: vec![],
                name: "  ".to_string(),
            })
            .await;
        assert!(matches!(invalid, Err(SourceError::InvalidName { .. })));
    }

    #[tokio::test]
    async fn test_remote_placeholder_propagates_unresolved() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new();
        let resolver = resolver(&dir, &transport);
        let entry = RemoteEntry {
            title: "holiday.mkv".to_string(),
            identifier: crate::indexer::PLACEHOLDER_IDENTIFIER.to_string(),
        };

        let result = resolver.resolve(SourceRequest::UseRemote(entry)).await;

        assert!(matches!(
            result,
            Err(SourceError::Download(DownloadError::IdentifierUnresolved { .. }))
        ));
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_release_removes_only_remote_files() {
        let dir = TempDir::new().unwrap();
        let remote = dir.path().join("remote.mp4");
        let uploaded = dir.path().join("uploaded.mp4");
        std::fs::write(&remote, b"r").unwrap();
        std::fs::write(&uploaded, b"u").unwrap();

        release_transient(&VideoSource {
            origin: SourceOrigin::Remote,
            display_name: "remote.mp4".to_string(),
            local_path: remote.clone(),
        })
        .await;
        release_transient(&VideoSource {
            origin: SourceOrigin::Uploaded,
            display_name: "uploaded.mp4".to_string(),
            local_path: uploaded.clone(),
        })
        .await;

        assert!(!remote.exists());
        assert!(uploaded.exists());
    }

    #[tokio::test]
    async fn test_list_local_videos_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        for name in ["b.MKV", "a.mp4", "notes.txt", ".mp4"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("folder.mp4")).unwrap();

        let videos = list_local_videos(dir.path()).await.unwrap();

        assert_eq!(
            videos,
            vec![dir.path().join("a.mp4"), dir.path().join("b.MKV")]
        );
    }
}
