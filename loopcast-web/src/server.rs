//! JSON API server for Loopcast
//!
//! Holds the single injected `SessionController` and the currently selected
//! source. Every route is a thin adapter over `loopcast-core`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use loopcast_core::config::LoopcastConfig;
use loopcast_core::source::release_transient;
use loopcast_core::{
    EntryDownloader, FolderIndexer, HttpTransport, SessionController, SourceResolver,
    VideoSource,
};
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::handlers::{
    api_acknowledge, api_create_manual_entry, api_index_folder, api_local_videos,
    api_resolve_entry, api_select_local, api_select_remote, api_selected_source,
    api_start_stream, api_stop_stream, api_stream_status, api_upload_source,
};

/// Largest accepted upload body.
const UPLOAD_LIMIT: usize = 1024 * 1024 * 1024; // 1 GiB

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// The one session controller of this server
    pub controller: SessionController,
    /// Remote folder scraper
    pub indexer: Arc<FolderIndexer>,
    /// Turns selections into local files
    pub resolver: Arc<SourceResolver>,
    /// Source picked by the operator for the next start
    pub selection: Arc<RwLock<Option<VideoSource>>>,
}

impl AppState {
    /// Creates state around already constructed core components.
    pub fn new(
        controller: SessionController,
        indexer: FolderIndexer,
        resolver: SourceResolver,
    ) -> Self {
        Self {
            controller,
            indexer: Arc::new(indexer),
            resolver: Arc::new(resolver),
            selection: Arc::new(RwLock::new(None)),
        }
    }

    /// Creates state with real HTTP transports and the configured encoder.
    pub fn from_config(config: &LoopcastConfig) -> Self {
        let index_transport = HttpTransport::new(
            &config.indexer.user_agent,
            config.indexer.request_timeout,
            config.download.connect_timeout,
        );
        let download_transport = HttpTransport::new(
            &config.indexer.user_agent,
            config.download.request_timeout,
            config.download.connect_timeout,
        );

        let indexer = FolderIndexer::new(Arc::new(index_transport), config.indexer.clone());
        let downloader = EntryDownloader::new(
            Arc::new(download_transport),
            config.download.clone(),
            &config.working_dir,
        );
        let resolver = SourceResolver::new(&config.working_dir, downloader);
        let controller = SessionController::with_process_launcher(
            config.session.clone(),
            config.encoder.clone(),
        );

        Self::new(controller, indexer, resolver)
    }

    /// Directory listed by `/api/local` and used for downloads and uploads.
    pub fn working_dir(&self) -> &Path {
        self.resolver.working_dir()
    }

    /// Replaces the selected source.
    ///
    /// A previously selected download is removed unless it is the new
    /// selection or the running session still streams it.
    pub async fn select(&self, source: VideoSource) {
        let previous = self.selection.write().await.replace(source.clone());
        let Some(previous) = previous else {
            return;
        };
        if previous.local_path == source.local_path {
            return;
        }
        let in_use = self
            .controller
            .active_source()
            .is_some_and(|active| active.local_path == previous.local_path);
        if !in_use {
            release_transient(&previous).await;
        }
    }
}

/// Builds the API router for `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Source discovery
        .route("/api/local", get(api_local_videos))
        .route("/api/index", post(api_index_folder))
        .route("/api/entries/manual", post(api_create_manual_entry))
        .route("/api/entries/resolve", post(api_resolve_entry))
        // Source selection
        .route("/api/source", get(api_selected_source))
        .route("/api/source/local", post(api_select_local))
        .route("/api/source/remote", post(api_select_remote))
        .route(
            "/api/source/upload",
            post(api_upload_source).layer(DefaultBodyLimit::max(UPLOAD_LIMIT)),
        )
        // Session control
        .route("/api/stream", get(api_stream_status))
        .route("/api/stream/start", post(api_start_stream))
        .route("/api/stream/stop", post(api_stop_stream))
        .route("/api/stream/acknowledge", post(api_acknowledge))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Runs the API server until the process is interrupted.
///
/// A running session is stopped before the function returns.
///
/// # Errors
///
/// - `Box<dyn std::error::Error>` - Listener could not bind or the server failed
pub async fn run_server(
    config: LoopcastConfig,
    address: SocketAddr,
) -> Result<(), Box<dyn std::error::Error>> {
    let working_dir: PathBuf = config.working_dir.clone();
    let state = AppState::from_config(&config);
    let controller = state.controller.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(address).await?;
    info!(
        "Loopcast API listening on http://{} (videos in {})",
        listener.local_addr()?,
        working_dir.display()
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    controller.stop().await?;
    Ok(())
}
