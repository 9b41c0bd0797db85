//! Encoder invocation building and process launching.
//!
//! The builder is pure: the same source and config always produce the same
//! argument list. The destination key lives only inside that list and is
//! masked everywhere it could be printed.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::{Child, Command};

use crate::config::EncoderConfig;
use crate::source::VideoSource;

/// Placeholder shown wherever the destination key would be printed.
pub const REDACTED: &str = "****";

/// Secret destination key.
///
/// `Debug` and `Display` never reveal the value; callers that need it must
/// go through `expose()`.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct StreamKey(String);

impl StreamKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Raw key value. Only the command builder and the log redactor use it.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamKey({REDACTED})")
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

/// Per-session output settings. Supplied fresh on every start, never persisted.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    pub destination_key: StreamKey,
    #[serde(default)]
    pub vertical_mode: bool,
}

impl StreamConfig {
    pub fn new(destination_key: impl Into<String>, vertical_mode: bool) -> Self {
        Self {
            destination_key: StreamKey::new(destination_key),
            vertical_mode,
        }
    }
}

/// Fully built encoder command line.
#[derive(Clone)]
pub struct EncoderInvocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    key: StreamKey,
}

impl EncoderInvocation {
    /// Command line as a single string with the destination key masked.
    pub fn redacted_preview(&self) -> String {
        let mut preview = self.program.display().to_string();
        for arg in &self.args {
            preview.push(' ');
            preview.push_str(&redact(&arg.to_string_lossy(), &self.key));
        }
        preview
    }
}

impl fmt::Debug for EncoderInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderInvocation")
            .field("command", &self.redacted_preview())
            .finish()
    }
}

/// Replaces every occurrence of the key in `text`.
pub fn redact(text: &str, key: &StreamKey) -> String {
    if key.is_blank() {
        return text.to_string();
    }
    text.replace(key.expose(), REDACTED)
}

/// Builds encoder invocations from a fixed preset.
#[derive(Debug, Clone)]
pub struct EncoderCommandBuilder {
    config: EncoderConfig,
}

impl EncoderCommandBuilder {
    pub fn new(config: EncoderConfig) -> Self {
        Self { config }
    }

    /// Builds the argument list for looping `source` to the destination.
    ///
    /// Input is played in real time and looped forever. In vertical mode a
    /// scale filter is inserted right before the output sink.
    pub fn build(&self, source: &VideoSource, stream: &StreamConfig) -> EncoderInvocation {
        let c = &self.config;
        let keyframes = c.keyframe_interval.to_string();

        let mut args: Vec<OsString> = vec!["-re".into(), "-stream_loop".into(), "-1".into()];
        args.push("-i".into());
        args.push(source.local_path.clone().into_os_string());

        let preset = [
            ("-c:v", c.video_codec.as_str()),
            ("-preset", c.video_preset.as_str()),
            ("-b:v", c.video_bitrate.as_str()),
            ("-maxrate", c.video_maxrate.as_str()),
            ("-bufsize", c.video_bufsize.as_str()),
            ("-g", keyframes.as_str()),
            ("-keyint_min", keyframes.as_str()),
            ("-c:a", c.audio_codec.as_str()),
            ("-b:a", c.audio_bitrate.as_str()),
            ("-f", c.container.as_str()),
        ];
        for (flag, value) in preset {
            args.push(flag.into());
            args.push(value.into());
        }

        if stream.vertical_mode {
            args.push("-vf".into());
            args.push(format!("scale={}", c.vertical_scale).into());
        }

        let destination = format!(
            "{}/{}",
            c.ingest_url.trim_end_matches('/'),
            stream.destination_key.expose()
        );
        args.push(OsString::from(destination));

        EncoderInvocation {
            program: c.program.clone(),
            args,
            key: stream.destination_key.clone(),
        }
    }
}

/// Errors raised while launching or probing the encoder.
#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("Failed to launch encoder {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Encoder {program} is not usable: {reason}")]
    Unavailable { program: String, reason: String },
}

/// Spawns the process for an invocation.
///
/// The returned child must have piped stdout and stderr.
#[async_trait]
pub trait EncoderLauncher: Send + Sync {
    /// # Errors
    ///
    /// - `EncoderError::Launch` - Process could not be spawned
    async fn launch(&self, invocation: &EncoderInvocation) -> Result<Child, EncoderError>;
}

/// Launches the real encoder executable in its own process group.
#[derive(Debug, Default, Clone)]
pub struct ProcessEncoderLauncher;

#[async_trait]
impl EncoderLauncher for ProcessEncoderLauncher {
    async fn launch(&self, invocation: &EncoderInvocation) -> Result<Child, EncoderError> {
        let mut command = Command::new(&invocation.program);
        command.args(&invocation.args);
        spawn_grouped(command, &invocation.program)
    }
}

/// Runs a shell script in place of the encoder.
///
/// The invocation's arguments are passed as positional parameters, so the
/// script can inspect them. Used by tests and dry runs.
#[derive(Debug, Clone)]
pub struct ScriptedEncoderLauncher {
    script: String,
}

impl ScriptedEncoderLauncher {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

#[async_trait]
impl EncoderLauncher for ScriptedEncoderLauncher {
    async fn launch(&self, invocation: &EncoderInvocation) -> Result<Child, EncoderError> {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.script)
            .arg("encoder")
            .args(&invocation.args);
        spawn_grouped(command, Path::new("sh"))
    }
}

fn spawn_grouped(mut command: Command, program: &Path) -> Result<Child, EncoderError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // The encoder may fork helpers; a dedicated group lets stop reach all of them
    #[cfg(unix)]
    command.process_group(0);

    command.spawn().map_err(|source| EncoderError::Launch {
        program: program.display().to_string(),
        source,
    })
}

/// Checks that `program` runs, returning the first line of its version banner.
///
/// # Errors
///
/// - `EncoderError::Unavailable` - Program missing or exited unsuccessfully
pub async fn probe(program: &Path) -> Result<String, EncoderError> {
    let output = Command::new(program)
        .arg("-version")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| EncoderError::Unavailable {
            program: program.display().to_string(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(EncoderError::Unavailable {
            program: program.display().to_string(),
            reason: format!("exited with {}", output.status),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .unwrap_or_default()
        .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceOrigin;

    fn source() -> VideoSource {
        VideoSource {
            origin: SourceOrigin::Local,
            display_name: "clip.mp4".to_string(),
            local_path: PathBuf::from("/videos/clip.mp4"),
        }
    }

    fn args_of(invocation: &EncoderInvocation) -> Vec<String> {
        invocation
            .args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_build_produces_looped_realtime_push() {
        let builder = EncoderCommandBuilder::new(EncoderConfig::default());
        let invocation = builder.build(&source(), &StreamConfig::new("abc123", false));
        let args = args_of(&invocation);

        assert_eq!(&args[..5], ["-re", "-stream_loop", "-1", "-i", "/videos/clip.mp4"]);
        assert!(args.windows(2).any(|w| w == ["-c:v", "libx264"]));
        assert!(args.windows(2).any(|w| w == ["-g", "60"]));
        assert!(args.windows(2).any(|w| w == ["-f", "flv"]));
        assert_eq!(
            args.last().map(String::as_str),
            Some("rtmp://a.rtmp.youtube.com/live2/abc123")
        );
        assert_eq!(invocation.program, PathBuf::from("ffmpeg"));
    }

    #[test]
    fn test_scale_filter_only_in_vertical_mode() {
        let builder = EncoderCommandBuilder::new(EncoderConfig::default());

        let vertical = builder.build(&source(), &StreamConfig::new("k", true));
        let args = args_of(&vertical);
        let position = args.iter().position(|a| a == "-vf").unwrap();
        assert_eq!(args[position + 1], "scale=720:1280");
        assert_eq!(position + 3, args.len(), "filter must precede the sink");

        let landscape = builder.build(&source(), &StreamConfig::new("k", false));
        assert!(!args_of(&landscape).iter().any(|a| a == "-vf"));
        assert!(!args_of(&landscape).iter().any(|a| a.starts_with("scale=")));
    }

    #[test]
    fn test_build_is_deterministic() {
        let builder = EncoderCommandBuilder::new(EncoderConfig::default());
        let config = StreamConfig::new("abc123", true);

        assert_eq!(
            builder.build(&source(), &config).args,
            builder.build(&source(), &config).args
        );
    }

    #[test]
    fn test_key_never_printed() {
        let builder = EncoderCommandBuilder::new(EncoderConfig::default());
        let config = StreamConfig::new("s3cr3t-key", false);
        let invocation = builder.build(&source(), &config);

        assert!(!format!("{invocation:?}").contains("s3cr3t-key"));
        assert!(!format!("{config:?}").contains("s3cr3t-key"));
        assert!(!config.destination_key.to_string().contains("s3cr3t-key"));
        assert!(invocation.redacted_preview().ends_with("live2/****"));
    }

    #[test]
    fn test_redact_ignores_blank_key() {
        assert_eq!(redact("frame=1", &StreamKey::new("")), "frame=1");
        assert_eq!(
            redact("rtmp://x/live2/abc error", &StreamKey::new("abc")),
            "rtmp://x/live2/**** error"
        );
    }

    #[tokio::test]
    async fn test_probe_missing_program() {
        let result = probe(Path::new("/nonexistent/loopcast-encoder")).await;
        assert!(matches!(result, Err(EncoderError::Unavailable { .. })));
    }
}
