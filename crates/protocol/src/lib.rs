//! # Taskboard Terminal Protocol
//!
//! Wire types shared by the terminal bridge and its clients.
//!
//! A terminal connection is a single WebSocket. Binary frames carry raw
//! terminal bytes in both directions; text frames carry JSON:
//!
//! ```text
//! client -> bridge   binary  keystrokes, pasted text (opaque)
//! client -> bridge   text    {"type":"resize","cols":120,"rows":40}
//! bridge -> client   binary  shell output (opaque)
//! bridge -> client   text    {"error":"failed to start terminal"}
//! ```
//!
//! ## Example
//!
//! ```rust
//! use protocol::{ControlEnvelope, ControlMessage};
//!
//! let env = ControlEnvelope::from_json(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap();
//! assert_eq!(env.interpret(), Some(ControlMessage::Resize { cols: 120, rows: 40 }));
//! ```

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use framing::Frame;
pub use messages::{
    ControlEnvelope, ControlMessage, ErrorNotice, RESIZE_TYPE, SPAWN_FAILED_MESSAGE,
    TERMINAL_PATH, TERM_TYPE,
};
