//! Registry actor commands, errors, and events.
//!
//! - `RegistryCommand`: Commands sent to the `RegistryActor`
//! - `ConnectionError`: Transport and handshake failures
//! - `RegistryEvent`: Connection lifecycle events for subscribers
//! - `InboundRequest`: A request read off a connection, bound for the router

use std::time::Duration;

use chrono::{DateTime, Utc};
use tabgate_core::{ConnectionId, ConnectionState, Endpoint, ResourceId};
use tabgate_protocol::{Envelope, ProtocolError};
use thiserror::Error;
use tokio::sync::oneshot;

use super::transport::Link;

// ============================================================================
// Registry Commands
// ============================================================================

#[derive(Debug)]
pub enum RegistryCommand {
    /// Probe every candidate port that is free, idle and not backing off.
    ///
    /// Replies with the ports a probe was started for.
    Scan {
        respond_to: Option<oneshot::Sender<Vec<u16>>>,
    },

    /// A probe finished its handshake.
    ProbeSucceeded {
        port: u16,
        link: Link,
        instance_id: String,
    },

    /// A probe failed to connect or handshake.
    ProbeFailed { port: u16, error: ConnectionError },

    /// Ping every open connection and close the silent ones.
    Heartbeat,

    /// A frame arrived on a connection.
    Touch { id: ConnectionId, epoch: u64 },

    /// A peer reported the ports peers are listening on.
    PortsDiscovered { ports: Vec<u16> },

    /// The reader or writer of a connection stopped.
    LinkClosed {
        id: ConnectionId,
        epoch: u64,
        reason: CloseReason,
    },

    /// Close a connection on request. Replies `true` if a close was started.
    Close {
        id: ConnectionId,
        reason: CloseReason,
        respond_to: oneshot::Sender<bool>,
    },

    /// Lock release and detach scheduling for a closing connection are done.
    CleanupFinished {
        id: ConnectionId,
        epoch: u64,
        reason: CloseReason,
        released: Vec<ResourceId>,
    },

    /// Queue a line on one connection.
    ///
    /// With `epoch` set, the line is only delivered to that generation.
    SendTo {
        id: ConnectionId,
        epoch: Option<u64>,
        line: String,
        respond_to: oneshot::Sender<Result<(), ConnectionError>>,
    },

    /// Queue a line on every open connection. Replies with the count.
    Broadcast {
        line: String,
        respond_to: oneshot::Sender<usize>,
    },

    Snapshot {
        respond_to: oneshot::Sender<Vec<ConnectionSnapshot>>,
    },

    PortStatus {
        respond_to: oneshot::Sender<PortReport>,
    },

    /// Close every connection and reply once all cleanups have finished.
    Shutdown { respond_to: oneshot::Sender<()> },
}

// ============================================================================
// Connection Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("Instance {0} is already connected")]
    DuplicateInstance(ConnectionId),

    #[error("Connection {0} is not open")]
    NotConnected(ConnectionId),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Encode error: {0}")]
    Encode(String),

    /// The response channel was closed before receiving a response.
    #[error("registry channel closed")]
    ChannelClosed,
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::TooLarge { size, max } => Self::MessageTooLarge { size, max },
            ProtocolError::Encode(e) => Self::Encode(e.to_string()),
        }
    }
}

// ============================================================================
// Events and Views
// ============================================================================

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the transport or a read failed.
    PeerClosed,
    /// No frame arrived within the heartbeat timeout.
    HeartbeatTimeout,
    /// A write failed or timed out.
    WriteFailed,
    /// The coordinator is shutting down.
    Shutdown,
    /// The same instance completed a handshake on another port.
    Replaced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Opened {
        id: ConnectionId,
        epoch: u64,
        endpoint: Endpoint,
    },
    Closed {
        id: ConnectionId,
        epoch: u64,
        reason: CloseReason,
        released: Vec<ResourceId>,
    },
}

/// A request read off a connection.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub connection: ConnectionId,
    pub epoch: u64,
    pub envelope: Envelope,
}

/// Point-in-time view of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub epoch: u64,
    pub endpoint: Endpoint,
    pub state: ConnectionState,
    pub opened_at: DateTime<Utc>,
    pub idle_for: Duration,
    /// Filled from the lock manager's reverse index.
    pub owned_resources: Vec<ResourceId>,
}

/// Backoff state of one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBackoff {
    pub port: u16,
    pub fail_count: u32,
    pub next_retry_delay: Duration,
    /// Time left until the port may be probed again.
    pub retry_in: Duration,
}

/// Discovery diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortReport {
    pub candidates: Vec<u16>,
    pub probing: Vec<u16>,
    pub backoff: Vec<PortBackoff>,
}
