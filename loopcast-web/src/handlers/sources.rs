//! Handlers for finding videos and selecting the streamed source.

use std::path::PathBuf;

use axum::extract::{Query, State};
use axum::response::Json;
use bytes::Bytes;
use loopcast_core::source::list_local_videos;
use loopcast_core::{RemoteEntry, SourceRequest, VideoSource};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ApiError;
use crate::server::AppState;

/// One video in the working directory.
#[derive(Debug, Serialize)]
pub struct LocalVideo {
    /// File name
    pub name: String,
    /// Full path
    pub path: PathBuf,
}

/// Body of `POST /api/index`.
#[derive(Debug, Deserialize)]
pub struct IndexRequest {
    /// Shared folder URL
    pub folder: String,
}

/// Body of `POST /api/entries/manual`.
#[derive(Debug, Deserialize)]
pub struct ManualEntryRequest {
    /// Video title including its extension
    pub title: String,
    /// Opaque entry identifier
    pub identifier: String,
}

/// Body of `POST /api/entries/resolve`.
#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    /// Shared folder URL the entry was listed in
    pub folder: String,
    /// Entry whose identifier is missing
    pub entry: RemoteEntry,
}

/// Body of `POST /api/source/local`.
#[derive(Debug, Deserialize)]
pub struct LocalSourceRequest {
    /// Absolute path or path relative to the working directory
    pub path: PathBuf,
}

/// Query of `POST /api/source/upload`.
#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    /// File name to store the upload under
    pub name: String,
}

/// Currently selected source.
#[derive(Debug, Serialize)]
pub struct SelectedSource {
    /// Selected source, if any
    pub source: Option<VideoSource>,
    /// Whether the source file is still on disk
    pub available: bool,
}

/// Lists the videos in the working directory.
///
/// # Errors
///
/// - `ApiError::Core` - Working directory unreadable
pub async fn api_local_videos(
    State(state): State<AppState>,
) -> Result<Json<Vec<LocalVideo>>, ApiError> {
    let videos = list_local_videos(state.working_dir())
        .await?
        .into_iter()
        .map(|path| LocalVideo {
            name: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path,
        })
        .collect();
    Ok(Json(videos))
}

/// Scrapes a shared folder. An empty list is a normal result.
///
/// # Errors
///
/// - `ApiError::Core` - Folder reference rejected
pub async fn api_index_folder(
    State(state): State<AppState>,
    Json(request): Json<IndexRequest>,
) -> Result<Json<Vec<RemoteEntry>>, ApiError> {
    let entries = state.indexer.index(&request.folder).await?;
    Ok(Json(entries))
}

/// Builds an entry from operator input without scraping.
///
/// # Errors
///
/// - `ApiError::Core` - Title empty or identifier implausible
pub async fn api_create_manual_entry(
    Json(request): Json<ManualEntryRequest>,
) -> Result<Json<RemoteEntry>, ApiError> {
    let entry = RemoteEntry::manual(&request.title, &request.identifier)?;
    Ok(Json(entry))
}

/// Looks up the identifier of a placeholder entry.
///
/// # Errors
///
/// - `ApiError::Core` - Folder rejected, listing unavailable, or no identifier found
pub async fn api_resolve_entry(
    State(state): State<AppState>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<RemoteEntry>, ApiError> {
    let mut entry = request.entry;
    state
        .indexer
        .resolve_identifier(&request.folder, &mut entry)
        .await?;
    Ok(Json(entry))
}

/// Selects a file from the working directory.
///
/// # Errors
///
/// - `ApiError::Core` - File does not exist
pub async fn api_select_local(
    State(state): State<AppState>,
    Json(request): Json<LocalSourceRequest>,
) -> Result<Json<VideoSource>, ApiError> {
    let source = state
        .resolver
        .resolve(SourceRequest::UseLocal(request.path))
        .await?;
    state.select(source.clone()).await;
    Ok(Json(source))
}

/// Downloads a remote entry and selects it.
///
/// # Errors
///
/// - `ApiError::Core` - Identifier unresolved or both transfer attempts failed
pub async fn api_select_remote(
    State(state): State<AppState>,
    Json(entry): Json<RemoteEntry>,
) -> Result<Json<VideoSource>, ApiError> {
    let source = state
        .resolver
        .resolve(SourceRequest::UseRemote(entry))
        .await?;
    state.select(source.clone()).await;
    Ok(Json(source))
}

/// Stores the request body as a file and selects it.
///
/// # Errors
///
/// - `ApiError::BadRequest` - Empty body
/// - `ApiError::Core` - Invalid name or write failure
pub async fn api_upload_source(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> Result<Json<VideoSource>, ApiError> {
    if body.is_empty() {
        return Err(ApiError::bad_request("upload body is empty"));
    }
    info!("Receiving upload '{}' ({} bytes)", query.name, body.len());

    let source = state
        .resolver
        .resolve(SourceRequest::UseUploaded {
            bytes: body.to_vec(),
            name: query.name,
        })
        .await?;
    state.select(source.clone()).await;
    Ok(Json(source))
}

/// Reports the selected source.
pub async fn api_selected_source(State(state): State<AppState>) -> Json<SelectedSource> {
    let source = state.selection.read().await.clone();
    let available = source.as_ref().is_some_and(VideoSource::is_available);
    Json(SelectedSource { source, available })
}
