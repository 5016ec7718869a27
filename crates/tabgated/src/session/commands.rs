//! Session operations, errors, and events.

use tabgate_core::{RecordedEvent, ResourceId, SessionPhase};
use thiserror::Error;
use tokio::sync::oneshot;

use super::backend::AttachOptions;

/// Session state reported by the resource itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedState {
    Attached,
    Detached,
}

/// One entry on a resource's operation queue.
#[derive(Debug)]
pub enum SessionOp {
    EnsureAttached {
        options: AttachOptions,
        respond_to: oneshot::Sender<Result<SessionPhase, SessionError>>,
    },
    EnsureDetached {
        respond_to: oneshot::Sender<Result<SessionPhase, SessionError>>,
    },
    /// Reconcile with a state change the resource reported on its own.
    Reconcile {
        observed: ObservedState,
        respond_to: oneshot::Sender<Result<SessionPhase, SessionError>>,
    },
    RecordEvent {
        event: RecordedEvent,
    },
    Events {
        respond_to: oneshot::Sender<Vec<RecordedEvent>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("failed to attach to {resource} after {attempts} attempts: {last_error}")]
    AttachFailed {
        resource: ResourceId,
        attempts: u32,
        last_error: String,
    },

    #[error("failed to detach from {resource} after {attempts} attempts: {last_error}")]
    DetachFailed {
        resource: ResourceId,
        attempts: u32,
        last_error: String,
    },

    #[error("invalid session transition on {resource}: {from} -> {to}")]
    InvalidTransition {
        resource: ResourceId,
        from: SessionPhase,
        to: SessionPhase,
    },

    #[error("session worker channel closed")]
    ChannelClosed,
}

/// Events published by session workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Transition {
        resource: ResourceId,
        from: SessionPhase,
        to: SessionPhase,
    },
}
