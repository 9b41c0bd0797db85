//! Runtime settings for indexing, downloading, encoding and sessions.
//!
//! Endpoint templates, encoder presets and timeouts live here. The
//! destination key never does; it is supplied per start request.

use std::path::PathBuf;
use std::time::Duration;

/// Smallest log buffer the session controller will accept.
pub const MIN_LOG_CAPACITY: usize = 30;

/// Settings for every Loopcast component, one section per subsystem.
#[derive(Debug, Clone)]
pub struct LoopcastConfig {
    /// Directory holding local videos; also the sink for downloads and uploads
    pub working_dir: PathBuf,
    pub indexer: IndexerConfig,
    pub download: DownloadConfig,
    pub encoder: EncoderConfig,
    pub session: SessionConfig,
}

impl Default for LoopcastConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            indexer: IndexerConfig::default(),
            download: DownloadConfig::default(),
            encoder: EncoderConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

/// Remote folder listing configuration.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Listing page URL, `{id}` is replaced by the folder identifier
    pub index_url_template: String,
    /// Upper bound for fetching one listing page
    pub request_timeout: Duration,
    /// Browser-like user agent; the listing serves a stripped page to bots
    pub user_agent: String,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            index_url_template: "https://drive.google.com/drive/folders/{id}".to_string(),
            request_timeout: Duration::from_secs(20),
            user_agent: BROWSER_USER_AGENT.to_string(),
        }
    }
}

/// Entry transfer configuration.
///
/// Controls the two transfer endpoints, timeouts, and disk write sizing.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Primary transfer endpoint, `{id}` is replaced by the entry identifier
    pub primary_url_template: String,
    /// Fallback endpoint tried once when the primary attempt fails
    pub fallback_url_template: String,
    /// Whole-request timeout for one transfer attempt
    pub request_timeout: Duration,
    /// Connection establishment timeout
    pub connect_timeout: Duration,
    /// Buffer size for streaming the body to disk
    pub write_chunk_size: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            primary_url_template: "https://drive.google.com/uc?id={id}&export=download"
                .to_string(),
            fallback_url_template:
                "https://drive.usercontent.google.com/download?id={id}&export=download&confirm=t"
                    .to_string(),
            request_timeout: Duration::from_secs(600),
            connect_timeout: Duration::from_secs(15),
            write_chunk_size: 65536, // 64 KiB
        }
    }
}

/// External encoder invocation preset.
///
/// The preset targets a continuous low-latency push; only the vertical
/// scale is switched per session.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Encoder executable
    pub program: PathBuf,
    /// Ingestion URL prefix, the destination key is appended as last segment
    pub ingest_url: String,
    pub video_codec: String,
    pub video_preset: String,
    pub video_bitrate: String,
    pub video_maxrate: String,
    pub video_bufsize: String,
    /// Keyframe interval in frames
    pub keyframe_interval: u32,
    pub audio_codec: String,
    pub audio_bitrate: String,
    /// Output container expected by the ingestion endpoint
    pub container: String,
    /// Scale filter target used in vertical mode
    pub vertical_scale: String,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            ingest_url: "rtmp://a.rtmp.youtube.com/live2".to_string(),
            video_codec: "libx264".to_string(),
            video_preset: "veryfast".to_string(),
            video_bitrate: "2500k".to_string(),
            video_maxrate: "2500k".to_string(),
            video_bufsize: "5000k".to_string(),
            keyframe_interval: 60,
            audio_codec: "aac".to_string(),
            audio_bitrate: "128k".to_string(),
            container: "flv".to_string(),
            vertical_scale: "720:1280".to_string(),
        }
    }
}

/// Streaming session lifecycle configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Time the encoder gets to exit after a termination request
    pub stop_grace: Duration,
    /// Number of most recent encoder output lines retained
    pub log_capacity: usize,
    /// Lines of log tail attached to a process failure
    pub failure_tail_lines: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(5),
            log_capacity: 200,
            failure_tail_lines: 10,
        }
    }
}

impl SessionConfig {
    /// Log capacity clamped to the supported minimum.
    pub fn effective_log_capacity(&self) -> usize {
        self.log_capacity.max(MIN_LOG_CAPACITY)
    }
}

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

impl LoopcastConfig {
    /// Defaults overridden by any `LOOPCAST_*` variables that are set.
    ///
    /// Unparsable numeric values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("LOOPCAST_WORKING_DIR") {
            config.working_dir = PathBuf::from(dir);
        }

        if let Ok(program) = std::env::var("LOOPCAST_FFMPEG") {
            config.encoder.program = PathBuf::from(program);
        }

        if let Ok(ingest) = std::env::var("LOOPCAST_INGEST_URL") {
            config.encoder.ingest_url = ingest.trim_end_matches('/').to_string();
        }

        if let Ok(timeout) = std::env::var("LOOPCAST_HTTP_TIMEOUT") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.indexer.request_timeout = Duration::from_secs(seconds);
                config.download.request_timeout = Duration::from_secs(seconds);
            }
        }

        if let Ok(grace) = std::env::var("LOOPCAST_STOP_GRACE") {
            if let Ok(seconds) = grace.parse::<u64>() {
                config.session.stop_grace = Duration::from_secs(seconds);
            }
        }

        if let Ok(capacity) = std::env::var("LOOPCAST_LOG_CAPACITY") {
            if let Ok(lines) = capacity.parse::<usize>() {
                config.session.log_capacity = lines;
            }
        }

        config
    }

    /// Creates a configuration rooted at `working_dir` with short timeouts.
    pub fn for_testing(working_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self {
            working_dir: working_dir.into(),
            ..Default::default()
        };
        config.indexer.request_timeout = Duration::from_secs(2);
        config.download.request_timeout = Duration::from_secs(2);
        config.download.connect_timeout = Duration::from_secs(1);
        config.session.stop_grace = Duration::from_millis(500);
        config
    }
}
