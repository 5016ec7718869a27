//! Control messages: handshake, heartbeat and port discovery.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Identity field requested in `hello`.
pub const WANTS_INSTANCE_ID: &str = "instanceId";

/// Wire `type` values that are control messages rather than requests.
pub const CONTROL_TYPES: [&str; 6] = [
    "hello",
    "helloAck",
    "ping",
    "pong",
    "portListRequest",
    "portListResponse",
];

/// Connection-level messages exchanged outside the request/response flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    /// Sent by the coordinator right after the transport opens.
    Hello { wants: String },

    /// Peer's reply carrying its stable identity.
    HelloAck {
        #[serde(rename = "instanceId")]
        instance_id: String,
    },

    Ping,

    Pong {
        /// Milliseconds since the Unix epoch.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },

    PortListRequest,

    /// Ports on which peers are currently listening.
    PortListResponse {
        #[serde(default)]
        ports: Vec<u16>,
    },
}

impl ControlMessage {
    pub fn hello() -> Self {
        Self::Hello {
            wants: WANTS_INSTANCE_ID.to_string(),
        }
    }

    pub fn hello_ack(instance_id: impl Into<String>) -> Self {
        Self::HelloAck {
            instance_id: instance_id.into(),
        }
    }

    /// Creates a pong stamped with the current time.
    pub fn pong_now() -> Self {
        Self::Pong {
            timestamp: Some(Utc::now().timestamp_millis()),
        }
    }

    pub fn port_list_response(ports: Vec<u16>) -> Self {
        Self::PortListResponse { ports }
    }

    /// Returns true if `kind` is the wire type of a control message.
    pub fn is_control_type(kind: &str) -> bool {
        CONTROL_TYPES.contains(&kind)
    }
}
