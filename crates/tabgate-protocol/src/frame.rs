//! Line framing and classification of inbound frames.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::control::ControlMessage;
use crate::message::Envelope;

/// Maximum size of a single frame (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Frame too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
}

/// An inbound line after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Control(ControlMessage),
    Request(Envelope),
    /// Anything else; the string describes why it was not understood.
    Unrecognized(String),
}

impl Frame {
    /// Classifies one line of input.
    ///
    /// Control messages are recognized by `type` first, then requests
    /// (objects with both `id` and `type`). Everything else is
    /// `Unrecognized`.
    pub fn classify(line: &str) -> Frame {
        if line.len() > MAX_MESSAGE_SIZE {
            return Frame::Unrecognized(format!("frame of {} bytes exceeds limit", line.len()));
        }

        let value: Value = match serde_json::from_str(line.trim()) {
            Ok(value) => value,
            Err(e) => return Frame::Unrecognized(format!("invalid JSON: {e}")),
        };

        let kind = match value.get("type").and_then(Value::as_str) {
            Some(kind) => kind.to_string(),
            None => return Frame::Unrecognized("missing type".to_string()),
        };

        if ControlMessage::is_control_type(&kind) {
            return match serde_json::from_value(value) {
                Ok(msg) => Frame::Control(msg),
                Err(e) => Frame::Unrecognized(format!("malformed {kind}: {e}")),
            };
        }

        if value.get("id").is_none() {
            return Frame::Unrecognized(format!("{kind} without id"));
        }

        match serde_json::from_value(value) {
            Ok(envelope) => Frame::Request(envelope),
            Err(e) => Frame::Unrecognized(format!("malformed request: {e}")),
        }
    }
}

/// Serializes `value` as a single `\n`-terminated line.
pub fn encode_line<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(value)?;
    if line.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::TooLarge {
            size: line.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    line.push('\n');
    Ok(line)
}
