//! Control-frame decoder.
//!
//! Text frames on a terminal connection are never terminal input. They are
//! parsed as control envelopes and either applied (resize) or dropped.
//! Malformed JSON and unknown envelope types are ignored without error.

use protocol::{ControlEnvelope, ControlMessage};

use super::pty::PtyHost;

/// Something whose terminal dimensions can be changed.
pub trait Resizable {
    /// Applies new dimensions, returning whether the change took effect.
    fn resize(&self, cols: u16, rows: u16) -> bool;
}

impl Resizable for PtyHost {
    fn resize(&self, cols: u16, rows: u16) -> bool {
        PtyHost::resize(self, cols, rows)
    }
}

/// What the decoder did with a text frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    /// A resize was requested; `applied` is false if the terminal refused it.
    Resize { cols: u16, rows: u16, applied: bool },
    /// Malformed or unrecognised; nothing happened.
    Ignored,
}

/// Parses a text frame into an actionable control message.
pub fn decode(text: &str) -> Option<ControlMessage> {
    ControlEnvelope::from_json(text)
        .ok()
        .and_then(|envelope| envelope.interpret())
}

/// Decodes a text frame and applies it to `target`.
pub fn apply<R: Resizable + ?Sized>(text: &str, target: &R) -> ControlOutcome {
    match decode(text) {
        Some(ControlMessage::Resize { cols, rows }) => {
            let applied = target.resize(cols, rows);
            ControlOutcome::Resize {
                cols,
                rows,
                applied,
            }
        }
        None => {
            tracing::trace!(len = text.len(), "Ignoring unrecognised control frame");
            ControlOutcome::Ignored
        }
    }
}
