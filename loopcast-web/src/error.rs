//! HTTP mapping for core errors.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use loopcast_core::downloader::DownloadError;
use loopcast_core::{IndexError, LoopcastError, SessionError, SourceError};
use serde_json::json;
use tracing::warn;

/// Error returned by API handlers.
///
/// The body carries the user-facing message plus the technical detail.
/// Neither ever contains the destination key.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Failure reported by the core
    #[error(transparent)]
    Core(#[from] LoopcastError),

    /// Request is well-formed JSON but semantically unusable
    #[error("Bad request: {reason}")]
    BadRequest {
        /// What was wrong with the request
        reason: String,
    },
}

impl ApiError {
    /// Builds a `BadRequest` error.
    pub fn bad_request(reason: impl Into<String>) -> Self {
        ApiError::BadRequest {
            reason: reason.into(),
        }
    }

    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        let core = match self {
            ApiError::BadRequest { .. } => return StatusCode::BAD_REQUEST,
            ApiError::Core(core) => core,
        };

        match core {
            LoopcastError::Source(SourceError::SourceNotFound { .. })
            | LoopcastError::Index(IndexError::IdentifierNotFound { .. }) => StatusCode::NOT_FOUND,
            LoopcastError::Session(
                SessionError::SessionBusy { .. }
                | SessionError::FailureNotAcknowledged
                | SessionError::StartCancelled,
            ) => StatusCode::CONFLICT,
            LoopcastError::Index(IndexError::Transport(_))
            | LoopcastError::Transport(_)
            | LoopcastError::Download(
                DownloadError::Status { .. }
                | DownloadError::UnexpectedContent { .. }
                | DownloadError::Transport(_),
            )
            | LoopcastError::Source(SourceError::Download(
                DownloadError::Status { .. }
                | DownloadError::UnexpectedContent { .. }
                | DownloadError::Transport(_),
            )) => StatusCode::BAD_GATEWAY,
            error if error.is_user_error() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Lets handlers use `?` directly on any core error.
macro_rules! from_core {
    ($($error:ty),+) => {
        $(impl From<$error> for ApiError {
            fn from(error: $error) -> Self {
                ApiError::Core(error.into())
            }
        })+
    };
}

from_core!(IndexError, DownloadError, SourceError, SessionError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (message, detail) = match &self {
            ApiError::Core(core) => (core.user_message(), core.to_string()),
            ApiError::BadRequest { reason } => (reason.clone(), self.to_string()),
        };
        if status.is_server_error() {
            warn!("Request failed: {}", detail);
        }

        (status, Json(json!({ "error": message, "detail": detail }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use loopcast_core::SessionState;

    use super::*;

    #[test]
    fn test_status_mapping() {
        let not_found: ApiError = SourceError::SourceNotFound {
            path: PathBuf::from("x.mp4"),
        }
        .into();
        let busy: ApiError = SessionError::SessionBusy {
            state: SessionState::Running,
        }
        .into();
        let unresolved: ApiError = DownloadError::IdentifierUnresolved {
            identifier: "short".to_string(),
        }
        .into();
        let upstream: ApiError = DownloadError::Status {
            url: "https://example.com".to_string(),
            status: 500,
        }
        .into();

        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);
        assert_eq!(busy.status(), StatusCode::CONFLICT);
        assert_eq!(unresolved.status(), StatusCode::BAD_REQUEST);
        assert_eq!(upstream.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            ApiError::bad_request("no source").status(),
            StatusCode::BAD_REQUEST
        );
    }
}
