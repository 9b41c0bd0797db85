//! CLI command implementations

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Subcommand;
use loopcast_core::config::LoopcastConfig;
use loopcast_core::encoder;
use loopcast_core::indexer::PLACEHOLDER_IDENTIFIER;
use loopcast_core::session::SessionFailure;
use loopcast_core::source::list_local_videos;
use loopcast_core::{
    EntryDownloader, FolderIndexer, HttpTransport, LoopcastError, RemoteEntry, Result,
    SessionController, SessionError, SessionSnapshot, SessionState, SourceRequest,
    SourceResolver, StreamConfig,
};
use tracing::{info, warn};

/// How often the stream command prints new encoder output.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start the JSON API server
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: IpAddr,
        /// Port to bind to
        #[arg(short, long, default_value = "3000")]
        port: u16,
    },
    /// List videos in the working directory
    Local,
    /// List the videos of a shared folder
    Index {
        /// Shared folder URL
        folder: String,
    },
    /// Download one shared-folder entry into the working directory
    Download {
        /// Entry title, used as the file name
        title: String,
        /// Entry identifier; looked up in --folder when omitted
        #[arg(long)]
        id: Option<String>,
        /// Shared folder URL to resolve the identifier from
        #[arg(long)]
        folder: Option<String>,
    },
    /// Stream a video until interrupted
    Stream {
        /// Local video path, or entry title when --id is given
        video: String,
        /// Destination stream key
        #[arg(short, long, env = "LOOPCAST_STREAM_KEY", hide_env_values = true)]
        key: String,
        /// Scale output for vertical short-form destinations
        #[arg(long)]
        vertical: bool,
        /// Download the entry with this identifier first; removed again on exit
        #[arg(long)]
        id: Option<String>,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands, config: LoopcastConfig) -> Result<()> {
    match command {
        Commands::Serve { host, port } => serve(config, SocketAddr::new(host, port)).await,
        Commands::Local => list_local(&config).await,
        Commands::Index { folder } => index_folder(&config, &folder).await,
        Commands::Download { title, id, folder } => {
            download_entry(&config, title, id, folder).await
        }
        Commands::Stream {
            video,
            key,
            vertical,
            id,
        } => stream(&config, video, StreamConfig::new(key, vertical), id).await,
    }
}

/// Run the API server
///
/// # Errors
/// - `LoopcastError::Server` - Server could not bind or failed while running
pub async fn serve(config: LoopcastConfig, address: SocketAddr) -> Result<()> {
    warn_if_encoder_missing(&config).await;
    loopcast_web::run_server(config, address)
        .await
        .map_err(LoopcastError::from_server_error)
}

/// Print the videos in the working directory
///
/// # Errors
/// - `LoopcastError::Source` - Working directory unreadable
pub async fn list_local(config: &LoopcastConfig) -> Result<()> {
    let videos = list_local_videos(&config.working_dir).await?;
    if videos.is_empty() {
        println!("No videos in {}", config.working_dir.display());
    }
    for video in videos {
        println!("{}", video.display());
    }
    Ok(())
}

/// Print the entries of a shared folder
///
/// # Errors
/// - `LoopcastError::Index` - Folder reference rejected
pub async fn index_folder(config: &LoopcastConfig, folder: &str) -> Result<()> {
    let entries = indexer(config).index(folder).await?;

    if entries.is_empty() {
        println!("No videos recognised. Use `loopcast download <title> --id <id>` instead.");
        return Ok(());
    }

    println!("{:<34} TITLE", "IDENTIFIER");
    for entry in entries {
        let identifier = if entry.is_resolved() {
            entry.identifier.as_str()
        } else {
            "(unresolved)"
        };
        println!("{:<34} {}", identifier, entry.title);
    }
    Ok(())
}

/// Download one entry, resolving its identifier first if needed
///
/// # Errors
/// - `LoopcastError::Configuration` - Neither identifier nor folder given
/// - `LoopcastError::Index` - Identifier could not be resolved
/// - `LoopcastError::Download` - Transfer failed
pub async fn download_entry(
    config: &LoopcastConfig,
    title: String,
    id: Option<String>,
    folder: Option<String>,
) -> Result<()> {
    let entry = match (id, folder) {
        (Some(id), _) => RemoteEntry::manual(&title, &id)?,
        (None, Some(folder)) => {
            let mut entry = RemoteEntry {
                title,
                identifier: PLACEHOLDER_IDENTIFIER.to_string(),
            };
            indexer(config)
                .resolve_identifier(&folder, &mut entry)
                .await?;
            entry
        }
        (None, None) => {
            return Err(LoopcastError::Configuration {
                reason: "either --id or --folder is required".to_string(),
            });
        }
    };

    let path = downloader(config)
        .download(&entry.identifier, &entry.title)
        .await?;
    println!("Saved {}", path.display());
    Ok(())
}

/// Stream a video and print encoder output until interrupted
///
/// # Errors
/// - `LoopcastError::Source` - Video missing or download failed
/// - `LoopcastError::Session` - Session could not start or the encoder failed
pub async fn stream(
    config: &LoopcastConfig,
    video: String,
    stream_config: StreamConfig,
    id: Option<String>,
) -> Result<()> {
    warn_if_encoder_missing(config).await;

    let request = match id {
        Some(id) => SourceRequest::UseRemote(RemoteEntry::manual(&video, &id)?),
        None => SourceRequest::UseLocal(PathBuf::from(video)),
    };
    let resolver = SourceResolver::new(&config.working_dir, downloader(config));
    let source = resolver.resolve(request).await?;

    let controller =
        SessionController::with_process_launcher(config.session.clone(), config.encoder.clone());
    let session_id = controller.start(source.clone(), stream_config).await?;
    println!("Streaming {} (session {})", source.display_name, session_id);
    println!("Press Ctrl+C to stop");

    let outcome = follow(&controller).await;
    controller.stop().await?;
    outcome
}

/// Prints new log lines until Ctrl+C, a clean exit, or a failure.
async fn follow(controller: &SessionController) -> Result<()> {
    let mut printed = 0u64;
    let mut ticker = tokio::time::interval(POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping stream");
                return Ok(());
            }
            _ = ticker.tick() => {}
        }

        let snapshot = controller.snapshot();
        printed = print_new_lines(&snapshot, printed);

        match snapshot.state {
            SessionState::Failed => {
                let failure = snapshot.failure.unwrap_or_else(|| SessionFailure {
                    reason: "encoder failed".to_string(),
                    log_tail: Vec::new(),
                });
                return Err(SessionError::ProcessFailure {
                    reason: failure.reason,
                    log_tail: failure.log_tail,
                }
                .into());
            }
            SessionState::Running if snapshot.exit_code == Some(0) => {
                println!("Encoder finished");
                return Ok(());
            }
            _ => {}
        }
    }
}

/// Prints lines relayed after the first `printed` ones; returns the new count.
fn print_new_lines(snapshot: &SessionSnapshot, printed: u64) -> u64 {
    let fresh = snapshot.lines_relayed.saturating_sub(printed);
    let available = snapshot.log.len() as u64;
    if fresh > available {
        println!("... {} lines skipped", fresh - available);
    }
    let skip = snapshot.log.len() - fresh.min(available) as usize;
    for line in &snapshot.log[skip..] {
        println!("{line}");
    }
    snapshot.lines_relayed
}

async fn warn_if_encoder_missing(config: &LoopcastConfig) {
    match encoder::probe(&config.encoder.program).await {
        Ok(version) => info!("Using {}", version),
        Err(e) => warn!("{}; streaming will fail until it is installed", e),
    }
}

fn indexer(config: &LoopcastConfig) -> FolderIndexer {
    let transport = HttpTransport::new(
        &config.indexer.user_agent,
        config.indexer.request_timeout,
        config.download.connect_timeout,
    );
    FolderIndexer::new(Arc::new(transport), config.indexer.clone())
}

fn downloader(config: &LoopcastConfig) -> EntryDownloader {
    let transport = HttpTransport::new(
        &config.indexer.user_agent,
        config.download.request_timeout,
        config.download.connect_timeout,
    );
    EntryDownloader::new(
        Arc::new(transport),
        config.download.clone(),
        &config.working_dir,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(log: &[&str], lines_relayed: u64) -> SessionSnapshot {
        SessionSnapshot {
            state: SessionState::Running,
            session_id: None,
            source: None,
            vertical_mode: false,
            started_at: None,
            pid: None,
            exit_code: None,
            failure: None,
            log: log.iter().map(|l| l.to_string()).collect(),
            lines_relayed,
        }
    }

    #[test]
    fn test_print_new_lines_tracks_relayed_count() {
        let first = snapshot(&["frame=1", "frame=2"], 2);
        assert_eq!(print_new_lines(&first, 0), 2);

        let second = snapshot(&["frame=2", "frame=3"], 3);
        assert_eq!(print_new_lines(&second, 2), 3);

        let unchanged = snapshot(&["frame=2", "frame=3"], 3);
        assert_eq!(print_new_lines(&unchanged, 3), 3);
    }

    #[tokio::test]
    async fn test_download_requires_id_or_folder() {
        let config = LoopcastConfig::for_testing(std::env::temp_dir());

        let result = download_entry(&config, "clip.mp4".to_string(), None, None).await;

        assert!(matches!(result, Err(LoopcastError::Configuration { .. })));
    }
}
