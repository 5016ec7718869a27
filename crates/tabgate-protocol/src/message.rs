//! Request and response envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tabgate_core::ResourceId;

/// Payload keys that name the target resource, in lookup order.
const RESOURCE_KEYS: [&str; 2] = ["resourceId", "tabId"];

/// Inbound request: `{ id, type, payload }`.
///
/// `id` is any JSON value and is echoed back verbatim in the response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Value,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(id: impl Into<Value>, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            payload,
        }
    }

    /// Returns the resource named explicitly in the payload, if any.
    ///
    /// Looks at `payload.resourceId` first, then `payload.tabId`.
    pub fn resource_hint(&self) -> Option<ResourceId> {
        RESOURCE_KEYS
            .iter()
            .filter_map(|key| self.payload.get(key))
            .find_map(ResourceId::from_json)
    }
}

/// Error codes surfaced to the remote client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    UnknownMessageType,
    ResourceBusy,
    MissingResource,
    SessionAttachFailed,
    SessionDetachFailed,
    InvalidStateTransition,
    HandlerFailed,
}

/// Body of an error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    /// 1-based position in the lock queue when the lock wait timed out.
    #[serde(
        rename = "queuePosition",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub queue_position: Option<usize>,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            queue_position: None,
        }
    }

    #[must_use]
    pub fn with_queue_position(mut self, position: Option<usize>) -> Self {
        self.queue_position = position;
        self
    }
}

/// Outbound response: `{ id, type, payload }` or `{ id, error }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: Value,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    /// Creates a success response echoing the request type.
    pub fn success(id: Value, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id,
            kind: Some(kind.into()),
            payload: Some(payload),
            error: None,
        }
    }

    /// Creates an error response.
    pub fn failure(id: Value, error: ErrorBody) -> Self {
        Self {
            id,
            kind: None,
            payload: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
