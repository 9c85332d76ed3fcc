//! Registry of live terminal sessions.
//!
//! The registry tracks every connection between upgrade and close so the
//! server can enforce a session limit, report status, and stop everything
//! on shutdown. A connection first reserves a [`SessionSlot`]; the slot is
//! released when dropped, so a session leaves the registry on every exit
//! path of its task.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use tokio::sync::Notify;

use super::lifecycle::{Lifecycle, Session, SessionId, SessionState, TerminationReason};

/// Information about a live session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: SessionId,
    /// Process ID of the shell, once spawned.
    pub pid: Option<u32>,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Remote address of the client.
    pub peer: Option<SocketAddr>,
    /// When the connection was registered.
    pub started_at: SystemTime,
}

struct Entry {
    lifecycle: Arc<Lifecycle>,
    peer: Option<SocketAddr>,
    started_at: SystemTime,
}

impl Entry {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.lifecycle.id().to_string(),
            pid: self.lifecycle.pid(),
            state: self.lifecycle.state(),
            peer: self.peer,
            started_at: self.started_at,
        }
    }
}

/// Thread-safe registry of live sessions using DashMap.
pub struct SessionRegistry {
    /// Map of session ID to entry.
    sessions: DashMap<SessionId, Entry>,
    /// Reserved slots, including ones not yet registered.
    reserved: AtomicUsize,
    /// Upper bound on `reserved`.
    max_sessions: usize,
    /// Signalled whenever a slot is released.
    released: Notify,
}

impl SessionRegistry {
    /// Creates a registry that admits at most `max_sessions` sessions.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            reserved: AtomicUsize::new(0),
            max_sessions,
            released: Notify::new(),
        }
    }

    /// Reserves capacity for one session, or returns `None` when full.
    pub fn try_reserve(self: &Arc<Self>) -> Option<SessionSlot> {
        let mut current = self.reserved.load(Ordering::SeqCst);
        loop {
            if current >= self.max_sessions {
                tracing::warn!(
                    max_sessions = self.max_sessions,
                    "Session limit reached, rejecting connection"
                );
                return None;
            }
            match self.reserved.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        Some(SessionSlot {
            registry: Arc::clone(self),
            id: None,
        })
    }

    /// Maximum number of concurrent sessions.
    pub fn capacity(&self) -> usize {
        self.max_sessions
    }

    /// Lists all registered sessions.
    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|entry| entry.value().info()).collect()
    }

    /// Gets information about a specific session.
    pub fn get(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.get(session_id).map(|entry| entry.value().info())
    }

    /// Returns the number of reserved sessions.
    pub fn count(&self) -> usize {
        self.reserved.load(Ordering::SeqCst)
    }

    /// Requests `Shutdown` teardown on every registered session.
    ///
    /// Returns how many sessions accepted the request.
    pub fn shutdown_all(&self) -> usize {
        let lifecycles: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(&entry.value().lifecycle))
            .collect();

        let stopped = lifecycles
            .iter()
            .filter(|lifecycle| lifecycle.begin_teardown(TerminationReason::Shutdown))
            .count();

        tracing::info!(sessions = stopped, "Requested shutdown of live sessions");
        stopped
    }

    /// Waits until every slot is released or `timeout` passes.
    ///
    /// Returns `true` if the registry drained.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.released.notified();
                if self.count() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }

    fn release(&self, id: Option<&str>) {
        if let Some(id) = id {
            if self.sessions.remove(id).is_some() {
                tracing::debug!(session_id = %id, "Session removed from registry");
            }
        }
        self.reserved.fetch_sub(1, Ordering::SeqCst);
        self.released.notify_waiters();
    }
}

/// A reserved place in the registry. Dropping it frees the place.
pub struct SessionSlot {
    registry: Arc<SessionRegistry>,
    id: Option<SessionId>,
}

impl SessionSlot {
    /// Records `session` in the registry under this slot.
    pub fn register(&mut self, session: &Session, peer: Option<SocketAddr>) {
        let id = session.id().to_string();
        self.registry.sessions.insert(
            id.clone(),
            Entry {
                lifecycle: session.lifecycle(),
                peer,
                started_at: SystemTime::now(),
            },
        );
        tracing::debug!(session_id = %id, peer = ?peer, "Session registered");
        self.id = Some(id);
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.registry.release(self.id.as_deref());
    }
}
