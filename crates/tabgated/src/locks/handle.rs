//! Client interface for the lock actor.
//!
//! Channel errors are mapped to `LockError::ChannelClosed`; queries fall
//! back to an empty answer when the actor is gone.

use std::time::Duration;

use tabgate_core::{ConnectionId, ResourceId};
use tokio::sync::{broadcast, mpsc, oneshot};

use super::commands::{Grant, LockCommand, LockError, LockEvent, LockSnapshot};

/// Cheap-to-clone handle to the lock manager.
#[derive(Clone)]
pub struct LockHandle {
    sender: mpsc::Sender<LockCommand>,
    event_sender: broadcast::Sender<LockEvent>,
}

impl LockHandle {
    pub fn new(sender: mpsc::Sender<LockCommand>, event_sender: broadcast::Sender<LockEvent>) -> Self {
        Self {
            sender,
            event_sender,
        }
    }

    /// Acquires the exclusive lock on `resource` for `connection`.
    ///
    /// Resolves as soon as the lock is granted, or fails with
    /// `LockError::Timeout` once `timeout` has passed in the queue.
    ///
    /// # Errors
    ///
    /// - `LockError::Timeout` if the lock was not granted in time
    /// - `LockError::HolderGone` if `connection` was closed while waiting
    /// - `LockError::ChannelClosed` if the actor has shut down
    pub async fn acquire(
        &self,
        resource: ResourceId,
        connection: ConnectionId,
        timeout: Duration,
    ) -> Result<Grant, LockError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(LockCommand::Acquire {
                resource,
                connection,
                timeout,
                respond_to: tx,
            })
            .await
            .map_err(|_| LockError::ChannelClosed)?;

        rx.await.map_err(|_| LockError::ChannelClosed)?
    }

    /// Releases the lock if `connection` holds it.
    ///
    /// Returns `true` if the lock was held and has been released.
    pub async fn release(&self, resource: ResourceId, connection: ConnectionId) -> bool {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(LockCommand::Release {
                resource,
                connection,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return false;
        }

        rx.await.unwrap_or(false)
    }

    /// Releases every lock held by `connection` and drops its queued waiters.
    ///
    /// Returns the resources that were released.
    pub async fn force_release_all_owned_by(&self, connection: ConnectionId) -> Vec<ResourceId> {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(LockCommand::ForceReleaseAllOwnedBy {
                connection,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return Vec::new();
        }

        rx.await.unwrap_or_default()
    }

    /// Triggers a stale-lock sweep.
    pub async fn sweep_stale(&self) {
        let _ = self.sender.send(LockCommand::SweepStale).await;
    }

    pub async fn holder(&self, resource: ResourceId) -> Option<ConnectionId> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(LockCommand::Holder {
                resource,
                respond_to: tx,
            })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn queue_len(&self, resource: ResourceId) -> usize {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(LockCommand::QueueLen {
                resource,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Resources currently locked by `connection`, sorted.
    pub async fn owned_by(&self, connection: ConnectionId) -> Vec<ResourceId> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(LockCommand::OwnedBy {
                connection,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn snapshot(&self) -> Vec<LockSnapshot> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(LockCommand::Snapshot { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Subscribe to lock events.
    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.event_sender.subscribe()
    }
}
