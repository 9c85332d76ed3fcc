//! Structured messages carried in text frames.
//!
//! Terminal bytes travel in binary frames and are never inspected. Text frames
//! carry small JSON objects: control envelopes from the client and error
//! notices from the bridge.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Path the bridge upgrades to a terminal connection.
pub const TERMINAL_PATH: &str = "/api/terminal/ws";

/// Terminal type exported to the spawned shell.
pub const TERM_TYPE: &str = "xterm-256color";

/// The only control envelope type currently acted upon.
pub const RESIZE_TYPE: &str = "resize";

/// Message sent to the client when the shell cannot be started.
pub const SPAWN_FAILED_MESSAGE: &str = "failed to start terminal";

/// Out-of-band control message sent by the client.
///
/// Unknown `type` values are accepted and ignored, so dimensions default to
/// zero when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlEnvelope {
    /// Envelope discriminator, e.g. `"resize"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Terminal width in columns.
    #[serde(default)]
    pub cols: u16,
    /// Terminal height in rows.
    #[serde(default)]
    pub rows: u16,
}

impl ControlEnvelope {
    /// Creates a resize envelope.
    pub fn resize(cols: u16, rows: u16) -> Self {
        Self {
            kind: RESIZE_TYPE.to_string(),
            cols,
            rows,
        }
    }

    /// Parses an envelope from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serializes the envelope to JSON text.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Interprets the envelope as an actionable control message.
    ///
    /// Returns `None` for unknown types. Resize dimensions are passed through
    /// as given; missing ones read as zero.
    pub fn interpret(&self) -> Option<ControlMessage> {
        if self.kind != RESIZE_TYPE {
            return None;
        }
        Some(ControlMessage::Resize {
            cols: self.cols,
            rows: self.rows,
        })
    }
}

/// A control message the bridge knows how to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Change the pseudo-terminal window size.
    Resize { cols: u16, rows: u16 },
}

/// Error notification sent by the bridge before it closes a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    /// Human-readable reason.
    pub error: String,
}

impl ErrorNotice {
    /// Creates a notice with the given message.
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }

    /// The notice sent when the shell could not be spawned.
    pub fn spawn_failed() -> Self {
        Self::new(SPAWN_FAILED_MESSAGE)
    }

    /// Parses a notice from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serializes the notice to JSON text.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
