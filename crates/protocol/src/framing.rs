//! Transport-level frame tag.
//!
//! Every unit on a terminal connection is either raw terminal bytes or a
//! structured JSON message. The tag comes from the transport (binary versus
//! text WebSocket frames), so raw bytes are never parsed as JSON.

use crate::error::Result;
use crate::messages::ControlEnvelope;

/// One unit of data on a terminal connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Opaque terminal bytes, relayed verbatim.
    Raw(Vec<u8>),
    /// UTF-8 JSON message: a control envelope or an error notice.
    Structured(String),
}

impl Frame {
    /// Builds a structured frame carrying a resize envelope.
    pub fn resize(cols: u16, rows: u16) -> Result<Self> {
        Ok(Frame::Structured(ControlEnvelope::resize(cols, rows).to_json()?))
    }

    /// Returns whether this frame carries raw terminal bytes.
    pub fn is_raw(&self) -> bool {
        matches!(self, Frame::Raw(_))
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Frame::Raw(bytes) => bytes.len(),
            Frame::Structured(text) => text.len(),
        }
    }

    /// Returns whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_frame_is_structured() {
        let frame = Frame::resize(100, 30).unwrap();
        assert!(!frame.is_raw());
        match frame {
            Frame::Structured(text) => {
                let env = ControlEnvelope::from_json(&text).unwrap();
                assert_eq!((env.cols, env.rows), (100, 30));
            }
            Frame::Raw(_) => panic!("expected structured frame"),
        }
    }

    #[test]
    fn test_raw_frame_len() {
        let frame = Frame::Raw(b"ls\n".to_vec());
        assert!(frame.is_raw());
        assert_eq!(frame.len(), 3);
        assert!(!frame.is_empty());
        assert!(Frame::Raw(Vec::new()).is_empty());
    }
}
