//! Loopcast Core - Source resolution and encoder session control
//!
//! This crate turns an operator's choice of video (local file, remote
//! shared-folder entry, or upload) into a local file and drives an external
//! encoder that pushes it as a looping live feed, relaying its output into a
//! bounded log.

pub mod config;
pub mod downloader;
pub mod encoder;
pub mod indexer;
pub mod log_relay;
pub mod session;
pub mod source;
pub mod tracing_setup;
pub mod transport;

// Re-export main types for convenient access
pub use config::LoopcastConfig;
pub use downloader::{DownloadError, EntryDownloader};
pub use encoder::{
    EncoderCommandBuilder, EncoderError, EncoderInvocation, EncoderLauncher,
    ProcessEncoderLauncher, ScriptedEncoderLauncher, StreamConfig, StreamKey,
};
pub use indexer::{FolderIndexer, IndexError, RemoteEntry};
pub use log_relay::{LogBuffer, LogRelay};
pub use session::{SessionController, SessionError, SessionSnapshot, SessionState};
pub use source::{SourceError, SourceOrigin, SourceRequest, SourceResolver, VideoSource};
pub use transport::{HttpTransport, MockTransport, Transport, TransportError};

/// Core errors that can bubble up from any Loopcast subsystem.
#[derive(Debug, thiserror::Error)]
pub enum LoopcastError {
    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Download error: {0}")]
    Download(#[from] DownloadError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Encoder error: {0}")]
    Encoder(#[from] EncoderError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server error: {reason}")]
    Server { reason: String },
}

impl LoopcastError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            LoopcastError::Index(e) => match e {
                IndexError::InvalidFolderReference { reference, .. } => {
                    format!("Not a shared folder link: {reference}")
                }
                IndexError::InvalidEntry { title, reason } => {
                    format!("Entry '{title}' is not usable: {reason}")
                }
                IndexError::IdentifierNotFound { title } => {
                    format!("No identifier found for '{title}'; enter it manually")
                }
                IndexError::Transport(_) => "Could not reach the shared folder".to_string(),
            },
            LoopcastError::Download(e) | LoopcastError::Source(SourceError::Download(e)) => {
                match e {
                    DownloadError::IdentifierUnresolved { .. } => {
                        "Entry identifier not resolved; resolve it before downloading".to_string()
                    }
                    DownloadError::InvalidTargetName { name } => {
                        format!("Cannot save a file named '{name}'")
                    }
                    _ => "Download failed".to_string(),
                }
            }
            LoopcastError::Source(SourceError::SourceNotFound { path }) => {
                format!("Video not found: {}", path.display())
            }
            LoopcastError::Source(SourceError::InvalidName { name }) => {
                format!("Invalid file name: '{name}'")
            }
            LoopcastError::Source(SourceError::Io { .. }) => "File system error occurred".to_string(),
            LoopcastError::Session(e) => match e {
                SessionError::InvalidRequest { reason } => format!("Cannot start: {reason}"),
                SessionError::SessionBusy { state } => {
                    format!("A stream is already {state}; stop it first")
                }
                SessionError::FailureNotAcknowledged => {
                    "The last stream failed; acknowledge it first".to_string()
                }
                SessionError::StartCancelled => "Start was cancelled".to_string(),
                SessionError::ProcessFailure { reason, .. } => format!("Encoder failed: {reason}"),
            },
            LoopcastError::Encoder(_) => "Encoder is not available".to_string(),
            LoopcastError::Transport(_) => "Network error occurred".to_string(),
            LoopcastError::Configuration { .. } => "Configuration error occurred".to_string(),
            LoopcastError::Io(_) => "File system error occurred".to_string(),
            LoopcastError::Server { reason } => format!("Web server error: {reason}"),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            LoopcastError::Configuration { .. }
                | LoopcastError::Index(IndexError::InvalidFolderReference { .. })
                | LoopcastError::Index(IndexError::InvalidEntry { .. })
                | LoopcastError::Download(DownloadError::IdentifierUnresolved { .. })
                | LoopcastError::Download(DownloadError::InvalidTargetName { .. })
                | LoopcastError::Source(SourceError::SourceNotFound { .. })
                | LoopcastError::Source(SourceError::InvalidName { .. })
                | LoopcastError::Source(SourceError::Download(
                    DownloadError::IdentifierUnresolved { .. }
                ))
                | LoopcastError::Session(SessionError::InvalidRequest { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, LoopcastError>;

impl LoopcastError {
    /// Wraps a failure of the API server.
    pub fn from_server_error(error: impl std::fmt::Display) -> Self {
        LoopcastError::Server {
            reason: error.to_string(),
        }
    }
}
