//! Lock actor commands, errors, and events.
//!
//! - `LockCommand`: Commands sent to the `LockActor`
//! - `LockError`: Errors surfaced to callers of `acquire`
//! - `LockEvent`: Events published for observers

use std::time::Duration;

use chrono::{DateTime, Utc};
use tabgate_core::{ConnectionId, ResourceId};
use thiserror::Error;
use tokio::sync::oneshot;

// ============================================================================
// Lock Commands
// ============================================================================

/// Commands sent to the lock actor.
///
/// Request/response commands carry a oneshot sender; the actor ignores
/// send failures because the caller may have stopped waiting.
#[derive(Debug)]
pub enum LockCommand {
    /// Acquire the lock on `resource` for `connection`, waiting up to `timeout`.
    Acquire {
        resource: ResourceId,
        connection: ConnectionId,
        timeout: Duration,
        respond_to: oneshot::Sender<Result<Grant, LockError>>,
    },

    /// Release the lock if `connection` holds it. Replies `true` on release.
    Release {
        resource: ResourceId,
        connection: ConnectionId,
        respond_to: oneshot::Sender<bool>,
    },

    /// Release every lock held by `connection` and drop its queued waiters.
    ///
    /// Replies with the resources that were released.
    ForceReleaseAllOwnedBy {
        connection: ConnectionId,
        respond_to: oneshot::Sender<Vec<ResourceId>>,
    },

    /// A waiter's deadline passed. Scheduled by the actor itself.
    ExpireWaiter { resource: ResourceId, ticket: u64 },

    /// Release locks whose holder is dead and older than the stale threshold.
    ///
    /// Fire-and-forget, sent by the sweep task.
    SweepStale,

    Holder {
        resource: ResourceId,
        respond_to: oneshot::Sender<Option<ConnectionId>>,
    },

    QueueLen {
        resource: ResourceId,
        respond_to: oneshot::Sender<usize>,
    },

    OwnedBy {
        connection: ConnectionId,
        respond_to: oneshot::Sender<Vec<ResourceId>>,
    },

    Snapshot {
        respond_to: oneshot::Sender<Vec<LockSnapshot>>,
    },
}

// ============================================================================
// Grants
// ============================================================================

/// How a lock was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    /// The resource was free.
    Immediate,
    /// The caller already held the lock; its timestamp was refreshed.
    Reentrant,
    /// A stale holder was force-released in favour of the caller.
    Recovered,
    /// The caller waited in the queue and was promoted on release.
    Promoted,
}

impl Grant {
    /// Returns true if this acquisition did not create a new hold.
    ///
    /// Callers that receive a re-entrant grant must not release; the
    /// outermost acquisition owns the release.
    pub fn is_reentrant(&self) -> bool {
        matches!(self, Self::Reentrant)
    }
}

/// Point-in-time view of one lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSnapshot {
    pub resource: ResourceId,
    pub holder: ConnectionId,
    pub acquired_at: DateTime<Utc>,
    pub held_for: Duration,
    /// Queued connections, earliest first.
    pub waiters: Vec<ConnectionId>,
}

// ============================================================================
// Lock Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The lock was not granted before the deadline.
    #[error("timed out after {waited:?} waiting for {resource} (queue position {position})")]
    Timeout {
        resource: ResourceId,
        waited: Duration,
        /// 1-based position in the queue at the moment of expiry.
        position: usize,
    },

    /// The waiting connection closed before the lock was granted.
    #[error("connection closed while waiting for {resource}")]
    HolderGone { resource: ResourceId },

    /// The response channel was closed before receiving a response.
    #[error("lock manager channel closed")]
    ChannelClosed,
}

impl LockError {
    /// Queue position reported with the error, if any.
    pub fn queue_position(&self) -> Option<usize> {
        match self {
            Self::Timeout { position, .. } => Some(*position),
            _ => None,
        }
    }
}

// ============================================================================
// Lock Events
// ============================================================================

/// Why a lock was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// The holder released it.
    Explicit,
    /// The holder's connection closed.
    ConnectionClosed,
    /// The holder was found dead and the lock was recovered.
    Stale,
}

/// Events published by the lock manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    Acquired {
        resource: ResourceId,
        connection: ConnectionId,
        grant: Grant,
    },
    Released {
        resource: ResourceId,
        connection: ConnectionId,
        reason: ReleaseReason,
    },
    WaiterExpired {
        resource: ResourceId,
        connection: ConnectionId,
        position: usize,
    },
}
