//! Pseudo-terminal process host.
//!
//! A [`PtyHost`] owns one shell process attached to a freshly allocated
//! pseudo-terminal. Output and input are exposed as separate blocking halves
//! ([`PtyReader`] and [`PtyWriter`]) so each relay direction owns exactly one
//! of them. The host itself keeps the master side (for resize) and the child
//! handle (for kill and reap).

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use nix::errno::Errno;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use protocol::TERM_TYPE;
use thiserror::Error;

/// Errors that can occur while hosting a shell process.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The process or the pseudo-terminal could not be created.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// How the shell process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    /// The process was reaped with this exit code.
    Exited(u32),
    /// The process was gone but its status could not be collected.
    Unknown,
}

/// Parameters for spawning a shell.
#[derive(Debug, Clone)]
pub struct PtyOptions {
    /// Executable to launch.
    pub shell: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Initial terminal width in columns.
    pub cols: u16,
    /// Initial terminal height in rows.
    pub rows: u16,
    /// Value exported as `TERM`.
    pub term: String,
    /// Extra environment variables, applied after `TERM`.
    pub env: Vec<(String, String)>,
    /// Working directory. Defaults to the bridge's own working directory.
    pub cwd: Option<PathBuf>,
}

impl PtyOptions {
    /// Options for an interactive shell with an 80x24 terminal.
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            args: Vec::new(),
            cols: 80,
            rows: 24,
            term: TERM_TYPE.to_string(),
            env: Vec::new(),
            cwd: None,
        }
    }

    /// Sets the arguments passed to the shell.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the initial terminal size.
    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Result of a single read from the pseudo-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many bytes were placed at the start of the buffer.
    Data(usize),
    /// The process side of the terminal is closed.
    Eof,
}

/// Output half of a pseudo-terminal. Reads block.
pub struct PtyReader {
    inner: Box<dyn Read + Send>,
}

impl PtyReader {
    /// Reads available output bytes into `buf`.
    ///
    /// Linux reports `EIO` instead of a zero-length read once every slave
    /// descriptor is closed; both map to [`ReadOutcome::Eof`].
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        loop {
            match self.inner.read(buf) {
                Ok(0) => return Ok(ReadOutcome::Eof),
                Ok(n) => return Ok(ReadOutcome::Data(n)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.raw_os_error() == Some(Errno::EIO as i32) => {
                    return Ok(ReadOutcome::Eof)
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Input half of a pseudo-terminal. Writes block under backpressure.
pub struct PtyWriter {
    inner: Box<dyn Write + Send>,
}

impl PtyWriter {
    /// Writes all of `data` to the process's terminal and flushes.
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(data)?;
        self.inner.flush()
    }
}

/// A shell process running on a pseudo-terminal.
///
/// Dropping the host closes it, so every exit path kills and reaps the
/// process.
pub struct PtyHost {
    /// The PTY master handle.
    master: Mutex<Box<dyn MasterPty + Send>>,

    /// The child process.
    child: Mutex<Box<dyn Child + Send + Sync>>,

    /// Process ID, which is also the process group ID (the shell is a session leader).
    pid: Option<u32>,

    /// Set by the first call to [`PtyHost::close`].
    closed: AtomicBool,
}

impl PtyHost {
    /// Spawns a shell attached to a new pseudo-terminal.
    ///
    /// The child inherits this process's environment plus `TERM` and any
    /// extra variables from `options`.
    pub fn start(options: &PtyOptions) -> Result<(Self, PtyReader, PtyWriter), SessionError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: options.rows,
                cols: options.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&options.shell);
        cmd.args(&options.args);
        cmd.env("TERM", &options.term);
        for (key, value) in &options.env {
            cmd.env(key, value);
        }
        match &options.cwd {
            Some(dir) => cmd.cwd(dir),
            None => {
                if let Ok(dir) = std::env::current_dir() {
                    cmd.cwd(dir);
                }
            }
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        // Our copy of the slave must go, otherwise reads never see EOF.
        drop(pair.slave);

        let pid = child.process_id();
        let host = PtyHost {
            master: Mutex::new(pair.master),
            child: Mutex::new(child),
            pid,
            closed: AtomicBool::new(false),
        };

        let reader = lock(&host.master)
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let writer = lock(&host.master)
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        tracing::debug!(
            pid = ?pid,
            shell = %options.shell,
            cols = options.cols,
            rows = options.rows,
            "Spawned shell on PTY"
        );

        Ok((
            host,
            PtyReader { inner: reader },
            PtyWriter { inner: writer },
        ))
    }

    /// Returns the process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns whether [`PtyHost::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Applies new terminal dimensions.
    ///
    /// Best-effort: failures are logged and reported as `false`, never
    /// propagated.
    pub fn resize(&self, cols: u16, rows: u16) -> bool {
        if self.is_closed() {
            tracing::debug!(pid = ?self.pid, "Ignoring resize on closed PTY");
            return false;
        }

        let result = lock(&self.master).resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        });

        match result {
            Ok(()) => {
                tracing::debug!(pid = ?self.pid, cols = cols, rows = rows, "Resized PTY");
                true
            }
            Err(e) => {
                tracing::warn!(pid = ?self.pid, error = %e, "Failed to resize PTY");
                false
            }
        }
    }

    /// Returns the terminal size as reported by the device, as `(cols, rows)`.
    pub fn size(&self) -> Option<(u16, u16)> {
        lock(&self.master)
            .get_size()
            .ok()
            .map(|size| (size.cols, size.rows))
    }

    /// Kills the process, reaps it, and releases the terminal.
    ///
    /// Only the first call does any work and returns `Some`; later calls
    /// return `None`. Safe to call after the process has already exited.
    /// Blocks until the process is reaped.
    pub fn close(&self) -> Option<ExitState> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return None;
        }

        // The leader is not reaped yet, so its process group id cannot have been reused.
        self.kill_process_groups();

        let mut child = lock(&self.child);
        let status = match child.try_wait() {
            Ok(Some(status)) => Ok(status),
            _ => {
                if let Err(e) = child.kill() {
                    tracing::debug!(pid = ?self.pid, error = %e, "Kill reported an error");
                }
                child.wait()
            }
        };

        let exit = match status {
            Ok(status) => ExitState::Exited(status.exit_code()),
            Err(e) => {
                tracing::warn!(pid = ?self.pid, error = %e, "Failed to reap shell process");
                ExitState::Unknown
            }
        };

        tracing::info!(pid = ?self.pid, exit = ?exit, "Shell process reaped");
        Some(exit)
    }

    /// Sends SIGKILL to the shell's process group and to the terminal's
    /// foreground process group, so no descendant keeps the slave open.
    fn kill_process_groups(&self) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return;
        };
        let shell_group = pid as i32;
        let foreground = lock(&self.master).process_group_leader();

        for group in std::iter::once(shell_group).chain(foreground.filter(|g| *g != shell_group)) {
            match killpg(Pid::from_raw(group), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => tracing::debug!(pgid = group, error = %e, "killpg failed"),
            }
        }
    }
}

impl Drop for PtyHost {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
