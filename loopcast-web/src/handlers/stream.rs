//! Handlers for session control.

use axum::extract::State;
use axum::response::Json;
use loopcast_core::{SessionSnapshot, StreamConfig};
use tracing::info;

use crate::error::ApiError;
use crate::server::AppState;

/// Starts streaming the selected source.
///
/// The body is a `StreamConfig`: `{"destination_key": "...", "vertical_mode": false}`.
///
/// # Errors
///
/// - `ApiError::BadRequest` - No source selected
/// - `ApiError::Core` - Invalid request, session busy, or encoder launch failure
pub async fn api_start_stream(
    State(state): State<AppState>,
    Json(config): Json<StreamConfig>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let source = state
        .selection
        .read()
        .await
        .clone()
        .ok_or_else(|| ApiError::bad_request("no source selected"))?;

    let session_id = state.controller.start(source, config).await?;
    info!("API started session {}", session_id);
    Ok(Json(state.controller.snapshot()))
}

/// Stops the session. Succeeds when nothing is running.
///
/// # Errors
///
/// - `ApiError::Core` - Never in practice; stop is idempotent
pub async fn api_stop_stream(
    State(state): State<AppState>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    state.controller.stop().await?;
    Ok(Json(state.controller.snapshot()))
}

/// Clears a failed session.
///
/// # Errors
///
/// - `ApiError::Core` - A session is still active
pub async fn api_acknowledge(
    State(state): State<AppState>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    state.controller.acknowledge().await?;
    Ok(Json(state.controller.snapshot()))
}

/// Current session state and buffered encoder log.
pub async fn api_stream_status(State(state): State<AppState>) -> Json<SessionSnapshot> {
    Json(state.controller.snapshot())
}
