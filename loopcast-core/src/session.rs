//! Streaming session state machine and encoder supervision.
//!
//! One `SessionController` owns at most one encoder process. The foreground
//! calls `start`, `stop`, and `snapshot`; a single background task per
//! session relays output and watches for exit. Shared state is only touched
//! in short critical sections, never across I/O.

use std::fmt;
use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::process::Child;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{EncoderConfig, SessionConfig};
use crate::encoder::{
    EncoderCommandBuilder, EncoderLauncher, ProcessEncoderLauncher, StreamConfig, StreamKey,
};
use crate::log_relay::{LogBuffer, LogRelay};
use crate::source::{VideoSource, release_transient};

/// Extra time a stop waits for the supervisor beyond the grace period.
const STOP_MARGIN: Duration = Duration::from_secs(2);

/// How long output is still drained once the encoder has exited or been terminated.
const RELAY_DRAIN: Duration = Duration::from_millis(500);

/// Lifecycle state of the controller's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
    /// Encoder exited on its own with an error; needs acknowledgement
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Errors returned by session control operations
#[derive(Debug, Error)]
pub enum SessionError {
    /// Precondition violated; state is unchanged
    #[error("Invalid start request: {reason}")]
    InvalidRequest { reason: String },

    /// Another session is active; stop it first
    #[error("Session busy ({state})")]
    SessionBusy { state: SessionState },

    /// Previous session failed and has not been acknowledged
    #[error("Previous session failed; acknowledge or stop it first")]
    FailureNotAcknowledged,

    /// Stop was requested while the encoder was being launched
    #[error("Start cancelled by stop request")]
    StartCancelled,

    #[error("Encoder process failed: {reason}")]
    ProcessFailure {
        reason: String,
        log_tail: Vec<String>,
    },
}

/// Why the last session failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionFailure {
    pub reason: String,
    /// Last encoder lines before the failure
    pub log_tail: Vec<String>,
}

/// Read-only view of the controller for the presentation layer.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub session_id: Option<Uuid>,
    pub source: Option<VideoSource>,
    pub vertical_mode: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
    /// Set once the encoder has exited
    pub exit_code: Option<i32>,
    pub failure: Option<SessionFailure>,
    pub log: Vec<String>,
    /// Lines relayed this session, including ones already evicted from `log`
    pub lines_relayed: u64,
}

struct ActiveSession {
    id: Uuid,
    source: VideoSource,
    vertical_mode: bool,
    started_at: DateTime<Utc>,
    pid: Option<u32>,
    exit_code: Option<i32>,
    stop_tx: Option<oneshot::Sender<()>>,
    supervisor: Option<JoinHandle<()>>,
}

struct Inner {
    state: SessionState,
    active: Option<ActiveSession>,
    failure: Option<SessionFailure>,
    stop_requested: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<SessionState>,
    log: LogBuffer,
    builder: EncoderCommandBuilder,
    launcher: Arc<dyn EncoderLauncher>,
    config: SessionConfig,
}

/// Owns the single streaming session.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct SessionController {
    shared: Arc<Shared>,
}

impl SessionController {
    /// Creates an idle controller launching encoders through `launcher`.
    pub fn new(
        config: SessionConfig,
        encoder: EncoderConfig,
        launcher: Arc<dyn EncoderLauncher>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: SessionState::Idle,
                    active: None,
                    failure: None,
                    stop_requested: false,
                }),
                state_tx,
                log: LogBuffer::new(config.effective_log_capacity()),
                builder: EncoderCommandBuilder::new(encoder),
                launcher,
                config,
            }),
        }
    }

    /// Creates an idle controller running the configured encoder executable.
    pub fn with_process_launcher(config: SessionConfig, encoder: EncoderConfig) -> Self {
        Self::new(config, encoder, Arc::new(ProcessEncoderLauncher))
    }

    /// Starts streaming `source` and returns the new session id.
    ///
    /// Returns as soon as the encoder process has been spawned.
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidRequest` - Source file missing or empty destination key
    /// - `SessionError::SessionBusy` - A session is starting, running, or stopping
    /// - `SessionError::FailureNotAcknowledged` - Last session failed and was not acknowledged
    /// - `SessionError::StartCancelled` - `stop()` arrived while launching
    /// - `SessionError::ProcessFailure` - Encoder could not be spawned
    pub async fn start(
        &self,
        source: VideoSource,
        stream: StreamConfig,
    ) -> Result<Uuid, SessionError> {
        if !source.is_available() {
            return Err(SessionError::InvalidRequest {
                reason: format!("source file {} does not exist", source.local_path.display()),
            });
        }
        if stream.destination_key.is_blank() {
            return Err(SessionError::InvalidRequest {
                reason: "destination key is empty".to_string(),
            });
        }

        let id = Uuid::new_v4();
        {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                SessionState::Idle => {}
                SessionState::Failed => return Err(SessionError::FailureNotAcknowledged),
                state => return Err(SessionError::SessionBusy { state }),
            }
            inner.failure = None;
            inner.stop_requested = false;
            inner.active = Some(ActiveSession {
                id,
                source: source.clone(),
                vertical_mode: stream.vertical_mode,
                started_at: Utc::now(),
                pid: None,
                exit_code: None,
                stop_tx: None,
                supervisor: None,
            });
            self.shared.set_state(&mut inner, SessionState::Starting);
        }
        self.shared.log.clear();

        let invocation = self.shared.builder.build(&source, &stream);
        info!("Starting session {} for '{}'", id, source.display_name);
        debug!("Encoder command: {}", invocation.redacted_preview());

        let child = match self.shared.launcher.launch(&invocation).await {
            Ok(child) => child,
            Err(e) => {
                let reason = e.to_string();
                error!("Session {} failed to launch: {}", id, reason);
                {
                    let mut inner = self.shared.inner.lock();
                    inner.failure = Some(SessionFailure {
                        reason: reason.clone(),
                        log_tail: Vec::new(),
                    });
                    self.shared.set_state(&mut inner, SessionState::Failed);
                }
                return Err(SessionError::ProcessFailure {
                    reason,
                    log_tail: Vec::new(),
                });
            }
        };

        let pid = child.id();
        let cancelled = {
            let mut inner = self.shared.inner.lock();
            if inner.stop_requested {
                Some(child)
            } else {
                let (stop_tx, stop_rx) = oneshot::channel();
                let handle = tokio::spawn(supervise(
                    Arc::clone(&self.shared),
                    id,
                    child,
                    stream.destination_key.clone(),
                    stop_rx,
                ));
                if let Some(active) = inner.active.as_mut() {
                    active.pid = pid;
                    active.stop_tx = Some(stop_tx);
                    active.supervisor = Some(handle);
                }
                self.shared.set_state(&mut inner, SessionState::Running);
                None
            }
        };

        if let Some(mut child) = cancelled {
            info!("Session {} cancelled during start", id);
            terminate(&mut child, self.shared.config.stop_grace).await;
            self.shared.finish_idle().await;
            return Err(SessionError::StartCancelled);
        }

        info!("Session {} running (pid {:?})", id, pid);
        Ok(id)
    }

    /// Stops the session and returns once it is idle.
    ///
    /// Safe to call in any state and any number of times. Termination goes
    /// to the encoder's whole process group; waiting is bounded by the
    /// configured grace period.
    pub async fn stop(&self) -> Result<(), SessionError> {
        enum Plan {
            Nothing,
            Terminate(Option<oneshot::Sender<()>>, Option<JoinHandle<()>>),
            AwaitSettled,
            Cleanup,
        }

        let plan = {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                SessionState::Idle => Plan::Nothing,
                SessionState::Running => {
                    self.shared.set_state(&mut inner, SessionState::Stopping);
                    let (stop_tx, supervisor) = inner
                        .active
                        .as_mut()
                        .map_or((None, None), |a| (a.stop_tx.take(), a.supervisor.take()));
                    Plan::Terminate(stop_tx, supervisor)
                }
                SessionState::Starting => {
                    inner.stop_requested = true;
                    Plan::AwaitSettled
                }
                SessionState::Stopping => Plan::AwaitSettled,
                SessionState::Failed => Plan::Cleanup,
            }
        };

        let budget = self.shared.config.stop_grace + STOP_MARGIN;
        match plan {
            Plan::Nothing => {
                debug!("Stop requested while idle");
            }
            Plan::Terminate(stop_tx, supervisor) => {
                info!("Stopping session");
                if let Some(stop_tx) = stop_tx {
                    // Supervisor may already be gone after a clean exit
                    let _ = stop_tx.send(());
                }
                if let Some(handle) = supervisor {
                    match timeout(budget, handle).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!("Supervisor task failed: {}", e),
                        Err(_) => warn!("Supervisor did not finish within {:?}", budget),
                    }
                }
                self.shared.finish_idle().await;
            }
            Plan::AwaitSettled => {
                let mut rx = self.shared.state_tx.subscribe();
                let settled = timeout(budget, async {
                    rx.wait_for(|s| matches!(s, SessionState::Idle | SessionState::Failed))
                        .await
                        .map(|state| *state)
                })
                .await;
                match settled {
                    Ok(Ok(SessionState::Failed)) => self.shared.finish_idle().await,
                    Ok(_) => {}
                    Err(_) => warn!("Session did not settle within {:?}", budget),
                }
            }
            Plan::Cleanup => {
                self.shared.finish_idle().await;
            }
        }

        Ok(())
    }

    /// Clears a failed session so a new one can start.
    ///
    /// # Errors
    ///
    /// - `SessionError::SessionBusy` - A session is starting, running, or stopping
    pub async fn acknowledge(&self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Failed => {
                info!("Failure acknowledged");
                self.shared.finish_idle().await;
                Ok(())
            }
            SessionState::Idle => Ok(()),
            state => Err(SessionError::SessionBusy { state }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.inner.lock().state
    }

    /// Source of the current session, if any.
    pub fn active_source(&self) -> Option<VideoSource> {
        let inner = self.shared.inner.lock();
        inner.active.as_ref().map(|active| active.source.clone())
    }

    /// Consistent copy of the session record plus the buffered log.
    pub fn snapshot(&self) -> SessionSnapshot {
        let mut snapshot = {
            let inner = self.shared.inner.lock();
            let active = inner.active.as_ref();
            SessionSnapshot {
                state: inner.state,
                session_id: active.map(|a| a.id),
                source: active.map(|a| a.source.clone()),
                vertical_mode: active.is_some_and(|a| a.vertical_mode),
                started_at: active.map(|a| a.started_at),
                pid: active.and_then(|a| a.pid),
                exit_code: active.and_then(|a| a.exit_code),
                failure: inner.failure.clone(),
                log: Vec::new(),
                lines_relayed: 0,
            }
        };
        snapshot.log = self.shared.log.snapshot();
        snapshot.lines_relayed = self.shared.log.total_appended();
        snapshot
    }

    /// Snapshot of the buffered encoder output only.
    pub fn log_lines(&self) -> Vec<String> {
        self.shared.log.snapshot()
    }

    /// Receiver notified on every state transition.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }
}

impl fmt::Debug for SessionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionController")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn set_state(&self, inner: &mut Inner, state: SessionState) {
        if inner.state != state {
            debug!("Session state {} -> {}", inner.state, state);
        }
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    /// Records the natural end of the encoder for session `id`.
    ///
    /// A clean exit keeps the session running until it is stopped; any
    /// other exit moves it to `Failed` with the log tail attached.
    fn record_exit(&self, id: Uuid, status: io::Result<ExitStatus>) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.state != SessionState::Running {
            return;
        }
        let Some(active) = inner.active.as_mut().filter(|active| active.id == id) else {
            return;
        };

        let reason = match &status {
            Ok(status) if status.success() => {
                active.exit_code = Some(0);
                info!("Encoder for session {} exited cleanly", id);
                return;
            }
            Ok(status) => {
                active.exit_code = status.code();
                format!("encoder exited with {status}")
            }
            Err(e) => format!("waiting for encoder failed: {e}"),
        };

        let log_tail = self.log.tail(self.config.failure_tail_lines);
        error!("Session {} failed: {}", id, reason);
        inner.failure = Some(SessionFailure { reason, log_tail });
        self.set_state(inner, SessionState::Failed);
    }

    /// Clears the session record, releases a transient source, and goes idle.
    async fn finish_idle(&self) {
        let released = {
            let mut inner = self.inner.lock();
            inner.stop_requested = false;
            inner.active.take().map(|active| active.source)
        };

        if let Some(source) = released {
            release_transient(&source).await;
        }

        let mut inner = self.inner.lock();
        inner.failure = None;
        self.set_state(&mut inner, SessionState::Idle);
        info!("Session idle");
    }
}

/// Background unit for one session: relays output and reports the exit.
async fn supervise(
    shared: Arc<Shared>,
    id: Uuid,
    mut child: Child,
    key: StreamKey,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let pid = child.id();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let relay = LogRelay::new(shared.log.clone(), key).run(stdout, stderr);
    tokio::pin!(relay);
    let mut relay_done = false;

    let exit = loop {
        tokio::select! {
            relayed = &mut relay, if !relay_done => {
                debug!("Encoder output closed after {} lines", relayed);
                relay_done = true;
            }
            status = child.wait() => break Some(status),
            _ = &mut stop_rx => break None,
        }
    };

    match exit {
        Some(status) => {
            // Leftover group members may still hold the output pipes
            if let Some(pid) = pid {
                sweep_group(pid);
            }
            if !relay_done && timeout(RELAY_DRAIN, &mut relay).await.is_err() {
                debug!("Encoder output still open after exit");
            }
            shared.record_exit(id, status);
        }
        None => {
            terminate(&mut child, shared.config.stop_grace).await;
            if !relay_done && timeout(RELAY_DRAIN, &mut relay).await.is_err() {
                debug!("Encoder output still open after termination");
            }
        }
    }
}

/// Kills whatever is left in the process group of an exited encoder.
#[cfg(unix)]
fn sweep_group(pid: u32) {
    signal_group(pid, libc::SIGKILL);
}

#[cfg(not(unix))]
fn sweep_group(_pid: u32) {}

/// Terminates the encoder and everything in its process group.
///
/// Sends a polite termination first and escalates to a kill once `grace`
/// has elapsed.
async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        signal_group(pid, libc::SIGTERM);
    }
    #[cfg(not(unix))]
    if let Err(e) = child.start_kill() {
        warn!("Failed to terminate encoder: {}", e);
    }

    match timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!("Encoder exited with {} after termination request", status);
            Some(status)
        }
        _ => {
            warn!("Encoder still alive after {:?}, killing", grace);
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                signal_group(pid, libc::SIGKILL);
            }
            if let Err(e) = child.kill().await {
                warn!("Failed to kill encoder: {}", e);
            }
            child.try_wait().ok().flatten()
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions; a negative pid
    // addresses the process group the encoder was spawned into.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc != 0 {
        debug!(
            "Signal {} to process group {} failed: {}",
            signal,
            pgid,
            io::Error::last_os_error()
        );
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::Path;

    use tempfile::TempDir;

    use super::*;
    use crate::encoder::{EncoderError, EncoderInvocation, ScriptedEncoderLauncher};
    use crate::source::SourceOrigin;

    fn test_config() -> SessionConfig {
        SessionConfig {
            stop_grace: Duration::from_millis(500),
            ..SessionConfig::default()
        }
    }

    fn controller(script: &str) -> SessionController {
        SessionController::new(
            test_config(),
            EncoderConfig::default(),
            Arc::new(ScriptedEncoderLauncher::new(script)),
        )
    }

    fn source_in(dir: &Path, origin: SourceOrigin) -> VideoSource {
        let local_path = dir.join("clip.mp4");
        std::fs::write(&local_path, b"video").unwrap();
        VideoSource {
            origin,
            display_name: "clip.mp4".to_string(),
            local_path,
        }
    }

    async fn wait_for_state(controller: &SessionController, state: SessionState) {
        let mut rx = controller.subscribe();
        timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .expect("state not reached in time")
            .unwrap();
    }

    async fn wait_for_exit(controller: &SessionController) {
        timeout(Duration::from_secs(5), async {
            while controller.snapshot().exit_code.is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("encoder did not exit in time");
    }

    struct FailingLauncher;

    #[async_trait::async_trait]
    impl EncoderLauncher for FailingLauncher {
        async fn launch(&self, invocation: &EncoderInvocation) -> Result<Child, EncoderError> {
            Err(EncoderError::Launch {
                program: invocation.program.display().to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
            })
        }
    }

    #[tokio::test]
    async fn test_stop_while_idle_is_noop() {
        let controller = controller("exit 0");

        controller.stop().await.unwrap();
        controller.stop().await.unwrap();

        assert_eq!(controller.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_start_rejects_missing_file_and_blank_key() {
        let dir = TempDir::new().unwrap();
        let controller = controller("exit 0");
        let mut source = source_in(dir.path(), SourceOrigin::Local);

        let blank = controller.start(source.clone(), StreamConfig::new("  ", false)).await;
        source.local_path = dir.path().join("missing.mp4");
        let missing = controller.start(source, StreamConfig::new("abc", false)).await;

        assert!(matches!(blank, Err(SessionError::InvalidRequest { .. })));
        assert!(matches!(missing, Err(SessionError::InvalidRequest { .. })));
        assert_eq!(controller.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_clean_exit_keeps_log_and_stops_to_idle() {
        let dir = TempDir::new().unwrap();
        let controller = controller("echo frame=1; echo frame=2; exit 0");
        let source = source_in(dir.path(), SourceOrigin::Local);

        controller
            .start(source, StreamConfig::new("abc123", false))
            .await
            .unwrap();
        assert_eq!(controller.state(), SessionState::Running);

        wait_for_exit(&controller).await;
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.state, SessionState::Running);
        assert_eq!(snapshot.log, vec!["frame=1", "frame=2"]);
        assert_eq!(snapshot.exit_code, Some(0));

        let mut rx = controller.subscribe();
        controller.stop().await.unwrap();
        assert_eq!(controller.state(), SessionState::Idle);
        assert_eq!(*rx.borrow_and_update(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_with_log_tail() {
        let dir = TempDir::new().unwrap();
        let controller = controller("echo connecting; echo 'rejected key' >&2; exit 3");
        let source = source_in(dir.path(), SourceOrigin::Local);

        controller
            .start(source.clone(), StreamConfig::new("abc123", false))
            .await
            .unwrap();
        wait_for_state(&controller, SessionState::Failed).await;

        let snapshot = controller.snapshot();
        let failure = snapshot.failure.unwrap();
        assert!(failure.reason.contains('3'));
        assert!(failure.log_tail.contains(&"rejected key".to_string()));
        assert_eq!(snapshot.exit_code, Some(3));

        let again = controller.start(source, StreamConfig::new("abc123", false)).await;
        assert!(matches!(again, Err(SessionError::FailureNotAcknowledged)));

        controller.acknowledge().await.unwrap();
        assert_eq!(controller.state(), SessionState::Idle);
        assert!(controller.snapshot().failure.is_none());
    }

    #[tokio::test]
    async fn test_non_utf8_output_keeps_session_alive() {
        let dir = TempDir::new().unwrap();
        let controller = controller(
            r#"echo frame=1; printf 'title: caf\351\n' >&2; i=0; while [ $i -lt 50 ]; do echo line=$i >&2; i=$((i+1)); done; exit 0"#,
        );
        let source = source_in(dir.path(), SourceOrigin::Local);

        controller
            .start(source, StreamConfig::new("abc123", false))
            .await
            .unwrap();
        wait_for_exit(&controller).await;

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.state, SessionState::Running);
        assert_eq!(snapshot.exit_code, Some(0));
        assert_eq!(snapshot.log.len(), 52);
        assert!(snapshot.log.contains(&"title: caf\u{FFFD}".to_string()));
        assert!(snapshot.log.contains(&"line=49".to_string()));
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_encoder_leaves_no_helpers_behind() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("helper-survived");
        // The helper inherits the output pipes and outlives the encoder
        let controller = controller(&format!(
            "(sleep 1; echo late > '{}') & echo frame=1; exit 3",
            marker.display()
        ));
        let source = source_in(dir.path(), SourceOrigin::Local);

        controller
            .start(source, StreamConfig::new("abc123", false))
            .await
            .unwrap();
        wait_for_state(&controller, SessionState::Failed).await;

        assert_eq!(controller.snapshot().log, vec!["frame=1"]);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
        controller.acknowledge().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_start_is_busy() {
        let dir = TempDir::new().unwrap();
        let controller = controller("sleep 30");
        let source = source_in(dir.path(), SourceOrigin::Local);

        let (first, second) = tokio::join!(
            controller.start(source.clone(), StreamConfig::new("k1", false)),
            controller.start(source.clone(), StreamConfig::new("k2", false)),
        );

        assert_eq!(
            [first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(),
            1
        );
        let rejected = first.err().or(second.err()).unwrap();
        assert!(matches!(rejected, SessionError::SessionBusy { .. }));
        assert_eq!(controller.state(), SessionState::Running);

        controller.stop().await.unwrap();
        assert_eq!(controller.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_stop_terminates_stubborn_encoder() {
        let dir = TempDir::new().unwrap();
        let controller = controller("trap '' TERM; while true; do sleep 0.1; done");
        let source = source_in(dir.path(), SourceOrigin::Local);

        controller
            .start(source, StreamConfig::new("abc", false))
            .await
            .unwrap();

        let stopped = timeout(Duration::from_secs(5), controller.stop()).await;

        assert!(stopped.is_ok(), "stop must not hang on an encoder ignoring TERM");
        assert_eq!(controller.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_stop_releases_remote_file_only() {
        let dir = TempDir::new().unwrap();
        let controller = controller("sleep 30");
        let remote = source_in(dir.path(), SourceOrigin::Remote);

        controller
            .start(remote.clone(), StreamConfig::new("abc", false))
            .await
            .unwrap();
        controller.stop().await.unwrap();

        assert!(!remote.local_path.exists());
    }

    #[tokio::test]
    async fn test_launch_failure_moves_to_failed() {
        let dir = TempDir::new().unwrap();
        let controller = SessionController::new(
            test_config(),
            EncoderConfig::default(),
            Arc::new(FailingLauncher),
        );
        let source = source_in(dir.path(), SourceOrigin::Local);

        let result = controller.start(source, StreamConfig::new("abc", false)).await;

        assert!(matches!(result, Err(SessionError::ProcessFailure { .. })));
        assert_eq!(controller.state(), SessionState::Failed);
        controller.stop().await.unwrap();
        assert_eq!(controller.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_key_not_in_snapshot_log() {
        let dir = TempDir::new().unwrap();
        // Positional parameters carry the encoder arguments; the last one is the destination
        let controller = controller(r#"for a in "$@"; do last="$a"; done; echo "pushing to $last""#);
        let source = source_in(dir.path(), SourceOrigin::Local);

        controller
            .start(source, StreamConfig::new("s3cr3t", false))
            .await
            .unwrap();
        wait_for_exit(&controller).await;

        let log = controller.log_lines();
        assert_eq!(log, vec!["pushing to rtmp://a.rtmp.youtube.com/live2/****"]);
        controller.stop().await.unwrap();
    }
}
