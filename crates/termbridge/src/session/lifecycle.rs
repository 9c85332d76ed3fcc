//! Session lifecycle: state machine, one-shot teardown, and resource release.
//!
//! A session moves `Created → Active → Terminating → Closed`, or straight
//! from `Created` to `Terminating` when the shell cannot be spawned. Any
//! party may ask for teardown: the output pump on EOF, the input pump on a
//! close frame, the idle watchdog, or the server on shutdown. Exactly one
//! request wins; the rest are no-ops. Only the session task releases
//! resources, and it does so once, in a fixed order.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use futures_util::{Sink, SinkExt, StreamExt};
use protocol::ErrorNotice;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use super::pty::{ExitState, PtyHost, PtyOptions, SessionError};
use super::relay::{self, Activity};
use crate::config::SessionConfig;

/// Unique identifier for a terminal session.
pub type SessionId = String;

/// Where a session is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Connection accepted, shell not yet running.
    Created = 0,
    /// Shell running, both directions relaying.
    Active = 1,
    /// Teardown has begun; no new data is relayed.
    Terminating = 2,
    /// Process reaped, transport closed.
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Created,
            1 => SessionState::Active,
            2 => SessionState::Terminating,
            _ => SessionState::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Created => "created",
            SessionState::Active => "active",
            SessionState::Terminating => "terminating",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a session ended. Recorded by whoever triggered teardown first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The shell could not be started.
    SpawnFailed,
    /// The shell exited and its terminal reported end of file.
    ProcessExited,
    /// Reading from or writing to the terminal failed.
    ProcessIo,
    /// The WebSocket failed to send or receive.
    Transport,
    /// The client closed the connection.
    ClientClosed,
    /// No traffic in either direction for the configured period.
    IdleTimeout,
    /// The server is shutting down.
    Shutdown,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TerminationReason::SpawnFailed => "spawn failed",
            TerminationReason::ProcessExited => "process exited",
            TerminationReason::ProcessIo => "process I/O error",
            TerminationReason::Transport => "transport error",
            TerminationReason::ClientClosed => "client closed",
            TerminationReason::IdleTimeout => "idle timeout",
            TerminationReason::Shutdown => "server shutdown",
        };
        f.write_str(text)
    }
}

/// Shared state machine and one-shot teardown guard for a session.
#[derive(Debug)]
pub struct Lifecycle {
    id: SessionId,
    state: AtomicU8,
    reason: OnceLock<TerminationReason>,
    pid: OnceLock<u32>,
    notify: Notify,
}

impl Lifecycle {
    /// Creates a lifecycle in the `Created` state.
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            state: AtomicU8::new(SessionState::Created as u8),
            reason: OnceLock::new(),
            pid: OnceLock::new(),
            notify: Notify::new(),
        }
    }

    /// Session identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// The recorded termination reason, once teardown has begun.
    pub fn reason(&self) -> Option<TerminationReason> {
        self.reason.get().copied()
    }

    /// Records the shell's process ID.
    pub fn set_pid(&self, pid: u32) {
        let _ = self.pid.set(pid);
    }

    /// The shell's process ID, if it was spawned.
    pub fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    /// Moves `Created → Active`. Returns false if teardown already began.
    pub fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Created as u8,
                SessionState::Active as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Requests teardown.
    ///
    /// Returns `true` for exactly one caller over the life of the session;
    /// that caller's reason is the one recorded.
    pub fn begin_teardown(&self, reason: TerminationReason) -> bool {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if current >= SessionState::Terminating as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                SessionState::Terminating as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let _ = self.reason.set(reason);
        tracing::info!(session_id = %self.id, reason = %reason, "Session terminating");
        self.notify.notify_waiters();
        true
    }

    /// Returns whether teardown has begun.
    pub fn is_terminating(&self) -> bool {
        self.state.load(Ordering::SeqCst) >= SessionState::Terminating as u8
    }

    /// Resolves once teardown has begun.
    pub async fn terminating(&self) {
        loop {
            // Registered before the check so a concurrent notify is not lost.
            let notified = self.notify.notified();
            if self.is_terminating() {
                return;
            }
            notified.await;
        }
    }

    /// Moves to `Closed`. Only valid after teardown began.
    pub fn mark_closed(&self) {
        self.state.store(SessionState::Closed as u8, Ordering::SeqCst);
        tracing::debug!(session_id = %self.id, "Session closed");
    }
}

/// Per-session settings derived from configuration.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Shell to launch.
    pub shell: String,
    /// Arguments passed to the shell.
    pub args: Vec<String>,
    /// Value exported as `TERM`.
    pub term: String,
    /// Working directory for the shell.
    pub cwd: Option<PathBuf>,
    /// Maximum bytes per PTY read.
    pub read_chunk_size: usize,
    /// Idle cutoff, if enabled.
    pub idle_timeout: Option<Duration>,
    /// Bound on each teardown wait.
    pub teardown_timeout: Duration,
}

impl SessionSettings {
    /// Settings for an interactive `shell` with default limits.
    pub fn new(shell: impl Into<String>) -> Self {
        Self::from_config(&SessionConfig {
            shell: shell.into(),
            ..SessionConfig::default()
        })
    }

    /// Builds settings from the `[session]` config section.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            args: Vec::new(),
            term: config.term.clone(),
            cwd: config.cwd.clone(),
            read_chunk_size: config.read_chunk_size.max(1),
            idle_timeout: config.idle_timeout(),
            teardown_timeout: config.teardown_timeout(),
        }
    }

    /// PTY spawn options for these settings.
    pub fn pty_options(&self) -> PtyOptions {
        let mut options = PtyOptions::new(self.shell.clone()).with_args(self.args.clone());
        options.term = self.term.clone();
        options.cwd = self.cwd.clone();
        options
    }
}

/// Summary of a finished session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    /// Session identifier.
    pub id: SessionId,
    /// Why the session ended.
    pub reason: Option<TerminationReason>,
    /// How the shell ended, if it was spawned and reaped.
    pub exit: Option<ExitState>,
    /// Bytes written to the shell.
    pub bytes_in: u64,
    /// Bytes sent to the client.
    pub bytes_out: u64,
    /// Time from start to close.
    pub duration: Duration,
}

/// One terminal connection.
pub struct Session {
    lifecycle: Arc<Lifecycle>,
    activity: Arc<Activity>,
}

impl Session {
    /// Creates a session with a fresh random identifier.
    pub fn new() -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string())
    }

    /// Creates a session with the given identifier.
    pub fn with_id(id: SessionId) -> Self {
        Self {
            lifecycle: Arc::new(Lifecycle::new(id)),
            activity: Arc::new(Activity::new()),
        }
    }

    /// Session identifier.
    pub fn id(&self) -> &str {
        self.lifecycle.id()
    }

    /// Shared lifecycle handle, used by the registry to observe and stop the session.
    pub fn lifecycle(&self) -> Arc<Lifecycle> {
        Arc::clone(&self.lifecycle)
    }

    /// Runs the session to completion over an upgraded WebSocket.
    ///
    /// Never returns an error: every failure becomes a termination reason.
    pub async fn run<S>(self, ws: WebSocketStream<S>, settings: &SessionSettings) -> SessionReport
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let started = Instant::now();

        let (host, reader, writer) = match PtyHost::start(&settings.pty_options()) {
            Ok(parts) => parts,
            Err(e) => {
                self.fail_spawn(ws, &e, settings.teardown_timeout).await;
                return self.report(None, started);
            }
        };

        if let Some(pid) = host.pid() {
            self.lifecycle.set_pid(pid);
        }
        let host = Arc::new(host);

        if !self.lifecycle.activate() {
            // Shut down between accept and spawn.
            let (sink, _stream) = ws.split();
            let output = tokio::spawn(async move { sink });
            let exit = self.release(host, output, settings.teardown_timeout).await;
            return self.report(exit, started);
        }

        tracing::info!(
            session_id = %self.id(),
            pid = ?host.pid(),
            shell = %settings.shell,
            "Session active"
        );

        let (sink, stream) = ws.split();

        let output = {
            let lifecycle = Arc::clone(&self.lifecycle);
            let activity = Arc::clone(&self.activity);
            let chunk_size = settings.read_chunk_size;
            tokio::spawn(async move {
                relay::pump_output(reader, sink, &lifecycle, &activity, chunk_size).await
            })
        };

        tokio::select! {
            _ = relay::pump_input(stream, writer, &host, &self.lifecycle, &self.activity) => {}
            _ = idle_watchdog(&self.lifecycle, &self.activity, settings.idle_timeout) => {}
        }

        let exit = self.release(host, output, settings.teardown_timeout).await;
        self.report(exit, started)
    }

    /// Reports a spawn failure to the client and closes the connection.
    async fn fail_spawn<S>(&self, mut ws: WebSocketStream<S>, error: &SessionError, limit: Duration)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tracing::error!(session_id = %self.id(), error = %error, "Failed to start terminal");
        self.lifecycle.begin_teardown(TerminationReason::SpawnFailed);

        match ErrorNotice::spawn_failed().to_json() {
            Ok(text) => {
                if let Ok(Err(e)) = tokio::time::timeout(limit, ws.send(Message::Text(text))).await {
                    tracing::debug!(session_id = %self.id(), error = %e, "Failed to send error notice");
                }
            }
            Err(e) => {
                tracing::warn!(session_id = %self.id(), error = %e, "Failed to encode error notice");
            }
        }

        let _ = tokio::time::timeout(limit, ws.close(None)).await;
        self.lifecycle.mark_closed();
    }

    /// Releases session resources in order: process, output pump, transport.
    async fn release<S>(
        &self,
        host: Arc<PtyHost>,
        mut output: JoinHandle<S>,
        limit: Duration,
    ) -> Option<ExitState>
    where
        S: Sink<Message, Error = WsError> + Unpin,
    {
        // Normally already set by whoever stopped the pumps.
        self.lifecycle.begin_teardown(TerminationReason::Shutdown);

        let exit = {
            let host = Arc::clone(&host);
            match tokio::task::spawn_blocking(move || host.close()).await {
                Ok(exit) => exit,
                Err(e) => {
                    tracing::error!(session_id = %self.id(), error = %e, "Process close task failed");
                    None
                }
            }
        };

        let sink = match tokio::time::timeout(limit, &mut output).await {
            Ok(Ok(sink)) => Some(sink),
            Ok(Err(e)) => {
                tracing::error!(session_id = %self.id(), error = %e, "Output pump task failed");
                None
            }
            Err(_) => {
                tracing::warn!(session_id = %self.id(), "Output pump did not stop in time; aborting");
                output.abort();
                None
            }
        };

        if let Some(mut sink) = sink {
            match tokio::time::timeout(limit, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(session_id = %self.id(), error = %e, "WebSocket close failed")
                }
                Err(_) => tracing::debug!(session_id = %self.id(), "WebSocket close timed out"),
            }
        }

        self.lifecycle.mark_closed();
        exit
    }

    fn report(&self, exit: Option<ExitState>, started: Instant) -> SessionReport {
        let report = SessionReport {
            id: self.id().to_string(),
            reason: self.lifecycle.reason(),
            exit,
            bytes_in: self.activity.bytes_in(),
            bytes_out: self.activity.bytes_out(),
            duration: started.elapsed(),
        };

        tracing::info!(
            session_id = %report.id,
            reason = ?report.reason,
            exit = ?report.exit,
            bytes_in = report.bytes_in,
            bytes_out = report.bytes_out,
            duration_ms = report.duration.as_millis() as u64,
            "Session ended"
        );
        report
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Triggers `IdleTimeout` once neither direction has moved for `timeout`.
/// Resolves when teardown begins for any reason.
async fn idle_watchdog(lifecycle: &Lifecycle, activity: &Activity, timeout: Option<Duration>) {
    let Some(timeout) = timeout else {
        lifecycle.terminating().await;
        return;
    };

    loop {
        let remaining = timeout.saturating_sub(activity.idle_for());
        if remaining.is_zero() {
            tracing::info!(session_id = %lifecycle.id(), "Session idle for {:?}", timeout);
            lifecycle.begin_teardown(TerminationReason::IdleTimeout);
            return;
        }

        tokio::select! {
            _ = lifecycle.terminating() => return,
            _ = tokio::time::sleep(remaining) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::SinkExt;
    use tokio::io::DuplexStream;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (server, client) = tokio::io::duplex(256 * 1024);
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        (server, client)
    }

    fn sh_settings() -> SessionSettings {
        let mut settings = SessionSettings::new("/bin/sh");
        settings.teardown_timeout = Duration::from_secs(2);
        settings
    }

    #[test]
    fn test_state_transitions() {
        let lifecycle = Lifecycle::new("s1".to_string());
        assert_eq!(lifecycle.state(), SessionState::Created);

        assert!(lifecycle.activate());
        assert_eq!(lifecycle.state(), SessionState::Active);
        assert!(!lifecycle.activate());

        assert!(lifecycle.begin_teardown(TerminationReason::ClientClosed));
        assert_eq!(lifecycle.state(), SessionState::Terminating);
        assert!(!lifecycle.activate());

        lifecycle.mark_closed();
        assert_eq!(lifecycle.state(), SessionState::Closed);
        assert!(!lifecycle.begin_teardown(TerminationReason::Transport));
        assert_eq!(lifecycle.reason(), Some(TerminationReason::ClientClosed));
    }

    #[test]
    fn test_teardown_from_created() {
        let lifecycle = Lifecycle::new("s2".to_string());
        assert!(lifecycle.begin_teardown(TerminationReason::SpawnFailed));
        assert_eq!(lifecycle.state(), SessionState::Terminating);
        assert_eq!(lifecycle.reason(), Some(TerminationReason::SpawnFailed));
    }

    #[test]
    fn test_concurrent_teardown_has_one_winner() {
        let lifecycle = Arc::new(Lifecycle::new("race".to_string()));
        lifecycle.activate();

        let reasons = [
            TerminationReason::ProcessExited,
            TerminationReason::ClientClosed,
            TerminationReason::Transport,
            TerminationReason::IdleTimeout,
            TerminationReason::Shutdown,
            TerminationReason::ProcessIo,
        ];
        let handles: Vec<_> = reasons
            .iter()
            .map(|&reason| {
                let lifecycle = Arc::clone(&lifecycle);
                std::thread::spawn(move || (reason, lifecycle.begin_teardown(reason)))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners: Vec<_> = results.iter().filter(|(_, won)| *won).collect();

        assert_eq!(winners.len(), 1);
        assert_eq!(lifecycle.reason(), Some(winners[0].0));
    }

    #[tokio::test]
    async fn test_terminating_wakes_waiters() {
        let lifecycle = Arc::new(Lifecycle::new("wake".to_string()));
        lifecycle.activate();

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let lifecycle = Arc::clone(&lifecycle);
                tokio::spawn(async move { lifecycle.terminating().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        lifecycle.begin_teardown(TerminationReason::Shutdown);

        for waiter in waiters {
            timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter not woken")
                .unwrap();
        }

        // Already terminating: resolves immediately.
        timeout(Duration::from_millis(100), lifecycle.terminating())
            .await
            .unwrap();
    }

    #[test]
    fn test_settings_from_config() {
        let config = SessionConfig {
            shell: "/bin/bash".to_string(),
            idle_timeout_secs: 5,
            teardown_timeout_ms: 250,
            ..SessionConfig::default()
        };
        let settings = SessionSettings::from_config(&config);
        assert_eq!(settings.shell, "/bin/bash");
        assert_eq!(settings.idle_timeout, Some(Duration::from_secs(5)));
        assert_eq!(settings.teardown_timeout, Duration::from_millis(250));

        let options = settings.pty_options();
        assert_eq!(options.shell, "/bin/bash");
        assert_eq!(options.term, "xterm-256color");
    }

    #[tokio::test]
    async fn test_spawn_failure_sends_notice_and_closes() {
        let (server, mut client) = ws_pair().await;
        let session = Session::with_id("spawn-fail".to_string());
        let lifecycle = session.lifecycle();
        let settings = SessionSettings::new("/nonexistent/definitely-not-a-shell");

        let report = timeout(Duration::from_secs(5), session.run(server, &settings))
            .await
            .expect("session did not finish");

        assert_eq!(report.reason, Some(TerminationReason::SpawnFailed));
        assert!(report.exit.is_none());
        assert_eq!(lifecycle.state(), SessionState::Closed);

        match client.next().await {
            Some(Ok(Message::Text(text))) => {
                assert_eq!(text, r#"{"error":"failed to start terminal"}"#);
            }
            other => panic!("expected error notice, got {other:?}"),
        }
        match client.next().await {
            Some(Ok(Message::Close(_))) => {}
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_client_close_reaps_process() {
        let (server, mut client) = ws_pair().await;
        let session = Session::new();
        let lifecycle = session.lifecycle();
        let settings = sh_settings();

        let run = tokio::spawn(async move { session.run(server, &settings).await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(lifecycle.state(), SessionState::Active);
        let pid = lifecycle.pid().expect("pid recorded");

        client.send(Message::Close(None)).await.unwrap();
        let report = timeout(Duration::from_secs(5), run)
            .await
            .expect("session did not finish")
            .unwrap();

        assert_eq!(report.reason, Some(TerminationReason::ClientClosed));
        assert!(report.exit.is_some());
        assert_eq!(lifecycle.state(), SessionState::Closed);
        assert!(!std::path::Path::new(&format!("/proc/{pid}")).exists());
    }

    #[tokio::test]
    async fn test_exit_and_close_race_releases_once() {
        let (server, mut client) = ws_pair().await;
        let session = Session::new();
        let lifecycle = session.lifecycle();
        let settings = sh_settings();

        let run = tokio::spawn(async move { session.run(server, &settings).await });
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Shell exit and client close arrive together; either may win.
        client.send(Message::Binary(b"exit\n".to_vec())).await.unwrap();
        let _ = client.send(Message::Close(None)).await;

        let report = timeout(Duration::from_secs(5), run)
            .await
            .expect("session did not finish")
            .unwrap();

        assert!(matches!(
            report.reason,
            Some(TerminationReason::ProcessExited) | Some(TerminationReason::ClientClosed)
        ));
        assert!(report.exit.is_some());
        assert_eq!(lifecycle.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_shutdown_request_ends_session() {
        let (server, _client) = ws_pair().await;
        let session = Session::new();
        let lifecycle = session.lifecycle();
        let settings = sh_settings();

        let run = tokio::spawn(async move { session.run(server, &settings).await });
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(lifecycle.begin_teardown(TerminationReason::Shutdown));
        let report = timeout(Duration::from_secs(5), run)
            .await
            .expect("session did not finish")
            .unwrap();

        assert_eq!(report.reason, Some(TerminationReason::Shutdown));
        assert_eq!(lifecycle.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let (server, _client) = ws_pair().await;
        let session = Session::new();
        let mut settings = SessionSettings::new("/bin/cat");
        settings.idle_timeout = Some(Duration::from_millis(300));

        let report = timeout(Duration::from_secs(5), session.run(server, &settings))
            .await
            .expect("idle session was not closed");
        assert_eq!(report.reason, Some(TerminationReason::IdleTimeout));
    }
}
