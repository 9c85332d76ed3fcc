//! Session management module.
//!
//! This module hosts a shell on a pseudo-terminal, relays it over a
//! WebSocket, and tears everything down exactly once when either side goes
//! away.

pub mod control;
pub mod lifecycle;
pub mod manager;
pub mod pty;
pub mod relay;

pub use control::{ControlOutcome, Resizable};
pub use lifecycle::{
    Lifecycle, Session, SessionId, SessionReport, SessionSettings, SessionState,
    TerminationReason,
};
pub use manager::{SessionInfo, SessionRegistry, SessionSlot};
pub use pty::{ExitState, PtyHost, PtyOptions, PtyReader, PtyWriter, ReadOutcome, SessionError};
pub use relay::{Activity, READ_BUFFER_SIZE};
