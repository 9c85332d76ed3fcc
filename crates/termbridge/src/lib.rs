//! # termbridge
//!
//! Relays an interactive shell on a pseudo-terminal over a WebSocket.
//!
//! ## Overview
//!
//! Every connection upgraded at `/api/terminal/ws` gets its own shell.
//! Binary frames carry raw terminal bytes in both directions. Text frames
//! from the client carry JSON control envelopes; only
//! `{"type":"resize","cols":N,"rows":M}` is acted on. When either side goes
//! away the shell is killed and reaped, and the socket is closed, exactly
//! once.
//!
//! ```text
//!  client ──Binary──▶ pump_input ──▶ PtyWriter ──▶ shell
//!         ──Text────▶ control::apply ──▶ resize
//!  client ◀─Binary── pump_output ◀── PtyReader ◀── shell
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTY hosting, relay, and session lifecycle
//! - [`server`]: WebSocket endpoint
//! - [`client`]: WebSocket client and interactive attach
//! - [`pidfile`]: Running-server detection

pub mod client;
pub mod config;
pub mod pidfile;
pub mod server;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use client::{ClientEvent, TerminalClient};
pub use config::Config;
pub use server::TerminalServer;
pub use session::{
    Session, SessionError, SessionId, SessionInfo, SessionRegistry, SessionReport,
    SessionSettings, SessionState, TerminationReason,
};
