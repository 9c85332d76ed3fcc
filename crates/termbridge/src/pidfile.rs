//! PID file utilities for server running detection.
//!
//! The `start` command records its PID so `stop` and `status` can find the
//! server later.
//!
//! ## PID File Location
//!
//! The PID file is stored at:
//! - `$XDG_DATA_HOME/termbridge/termbridge.pid` if XDG_DATA_HOME is set
//! - `~/.local/share/termbridge/termbridge.pid` otherwise

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Get the path to the server PID file.
pub fn get_pid_file_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .ok()
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local/share")
        });
    data_dir.join("termbridge").join("termbridge.pid")
}

/// Writes the current process ID to `path`, creating parent directories.
pub fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create PID directory: {}", parent.display()))?;
    }

    fs::write(path, format!("{}\n", std::process::id()))
        .with_context(|| format!("Failed to write PID file: {}", path.display()))?;

    tracing::debug!("PID file written to {:?}", path);
    Ok(())
}

/// Removes the PID file if it still names this process.
pub fn remove_pid_file(path: &Path) {
    let ours = fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .is_some_and(|pid| pid == std::process::id());

    if ours {
        cleanup_stale_pid_file(path);
    }
}

/// Reads a running server's PID from `path`.
///
/// Returns `None` if the file is missing, malformed, or names a dead
/// process. The last two cases remove the file.
pub fn read_pid(path: &Path) -> Option<u32> {
    let pid_str = fs::read_to_string(path).ok()?;

    let pid: u32 = match pid_str.trim().parse() {
        Ok(p) => p,
        Err(_) => {
            cleanup_stale_pid_file(path);
            return None;
        }
    };

    if is_process_running(pid) {
        Some(pid)
    } else {
        cleanup_stale_pid_file(path);
        None
    }
}

/// Get the PID of the running server, if any.
pub fn get_server_pid() -> Option<u32> {
    read_pid(&get_pid_file_path())
}

/// Check if a server process is currently running.
pub fn is_server_running() -> bool {
    get_server_pid().is_some()
}

/// Check if a process with the given PID is running.
///
/// On Linux, this checks if `/proc/{pid}/stat` exists.
/// On other Unix systems, this probes with a null signal.
pub fn is_process_running(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        let proc_path = format!("/proc/{}/stat", pid);
        Path::new(&proc_path).exists()
    }

    #[cfg(not(target_os = "linux"))]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        match i32::try_from(pid) {
            Ok(raw) => kill(Pid::from_raw(raw), None).is_ok(),
            Err(_) => false,
        }
    }
}

/// Remove a stale PID file.
fn cleanup_stale_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}
