//! Logging for the `loopcast` binary.
//!
//! Two sinks: the console shows lifecycle messages at the operator's chosen
//! level, and a per-run file records everything, including relayed encoder
//! output, so a failed stream can be diagnosed afterwards.

use std::fs::{File, create_dir_all};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Target used for relayed encoder output lines.
pub const ENCODER_TARGET: &str = "loopcast::encoder";

/// Name of the per-run log file inside the logs directory.
pub const RUN_LOG_FILE: &str = "loopcast-last-run.log";

/// Crates whose chatter is capped on both sinks.
const NOISY_DEPENDENCIES: &[&str] = &["hyper", "hyper_util", "reqwest", "h2", "rustls"];

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("cannot prepare log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid log filter: {reason}")]
    Filter { reason: String },

    #[error("a global subscriber is already installed")]
    AlreadyInitialized,
}

/// Installs the console and run-log subscribers.
///
/// `RUST_LOG` replaces the console filter when set. Encoder output only
/// reaches the console at `trace`; the run log at `<logs_dir>/loopcast-last-run.log`
/// always has it. The file is truncated on every run.
///
/// Returns the path of the run log.
///
/// # Errors
///
/// - `TracingError::LogFile` - Logs directory or file could not be created
/// - `TracingError::Filter` - `RUST_LOG` holds an unparsable directive
/// - `TracingError::AlreadyInitialized` - Called twice in one process
pub fn init_tracing(console_level: Level, logs_dir: Option<&Path>) -> Result<PathBuf, TracingError> {
    let logs_dir = logs_dir.unwrap_or_else(|| Path::new("logs"));
    let log_path = logs_dir.join(RUN_LOG_FILE);
    let log_file = create_dir_all(logs_dir)
        .and_then(|()| File::create(&log_path))
        .map_err(|source| TracingError::LogFile {
            path: log_path.clone(),
            source,
        })?;

    let console_filter = match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.trim().is_empty() => {
            EnvFilter::try_new(&directives).map_err(|e| TracingError::Filter {
                reason: e.to_string(),
            })?
        }
        _ => EnvFilter::new(console_directives(console_level)),
    };

    let console_layer = fmt::layer()
        .with_target(false)
        .compact()
        .with_filter(console_filter);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(EnvFilter::new(file_directives()));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|_| TracingError::AlreadyInitialized)?;

    tracing::debug!("Run log at {}", log_path.display());
    Ok(log_path)
}

/// Filter directives for the console at `level`.
pub fn console_directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    let mut directives = vec![level.clone()];
    if level != "trace" {
        directives.push(format!("{ENCODER_TARGET}=off"));
    }
    directives.extend(NOISY_DEPENDENCIES.iter().map(|krate| format!("{krate}=warn")));
    directives.join(",")
}

/// Filter directives for the run log: everything from loopcast, less from dependencies.
pub fn file_directives() -> String {
    let mut directives = vec!["debug".to_string(), "loopcast=trace".to_string()];
    directives.extend(
        ["loopcast_core", "loopcast_web", "loopcast_cli"]
            .iter()
            .map(|krate| format!("{krate}=trace")),
    );
    directives.extend(NOISY_DEPENDENCIES.iter().map(|krate| format!("{krate}=info")));
    directives.join(",")
}

/// Console verbosity accepted by `--log-level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    Info,
    Debug,
    /// Also shows every encoder output line
    Trace,
}

impl CliLogLevel {
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_tracing_level().as_str().to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_hides_encoder_output_below_trace() {
        let info = console_directives(Level::INFO);
        let trace = console_directives(Level::TRACE);

        assert!(info.starts_with("info,"));
        assert!(info.contains("loopcast::encoder=off"));
        assert!(!trace.contains("loopcast::encoder"));
        assert!(EnvFilter::try_new(&info).is_ok());
        assert!(EnvFilter::try_new(&trace).is_ok());
    }

    #[test]
    fn test_file_directives_parse() {
        let directives = file_directives();

        assert!(directives.contains("loopcast_core=trace"));
        assert!(EnvFilter::try_new(&directives).is_ok());
    }

    #[test]
    fn test_cli_level_display_matches_filter_syntax() {
        assert_eq!(CliLogLevel::Warn.to_string(), "warn");
        assert_eq!(CliLogLevel::Trace.as_tracing_level(), Level::TRACE);
    }
}
