//! tabgate protocol - wire format for controller connections
//!
//! Every frame is a single JSON object terminated by `\n`. This crate
//! defines the request/response envelopes, the control messages used for
//! handshake, heartbeat and port discovery, and the classification of
//! inbound lines into one of those shapes.

pub mod control;
pub mod frame;
pub mod kind;
pub mod message;

pub use control::ControlMessage;
pub use frame::{encode_line, Frame, ProtocolError, MAX_MESSAGE_SIZE};
pub use kind::MessageKind;
pub use message::{Envelope, ErrorBody, ErrorCode, Response};
