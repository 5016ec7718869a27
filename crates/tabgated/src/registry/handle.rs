//! Client interface for interacting with the RegistryActor.
//!
//! Channel errors are mapped to `ConnectionError::ChannelClosed`.

use serde::Serialize;
use tabgate_core::ConnectionId;
use tabgate_protocol::encode_line;
use tokio::sync::{broadcast, mpsc, oneshot};

use super::commands::{
    CloseReason, ConnectionError, ConnectionSnapshot, PortReport, RegistryCommand, RegistryEvent,
};
use crate::locks::LockHandle;

/// Cheap-to-clone handle to the connection registry.
#[derive(Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
    event_sender: broadcast::Sender<RegistryEvent>,
    locks: LockHandle,
}

impl RegistryHandle {
    pub fn new(
        sender: mpsc::Sender<RegistryCommand>,
        event_sender: broadcast::Sender<RegistryEvent>,
        locks: LockHandle,
    ) -> Self {
        Self {
            sender,
            event_sender,
            locks,
        }
    }

    /// Probes every eligible candidate port.
    ///
    /// Returns the ports a probe was started for. Ports already being
    /// probed, already connected, or backing off are skipped, so
    /// overlapping scans never probe the same port twice.
    pub async fn scan(&self) -> Result<Vec<u16>, ConnectionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryCommand::Scan {
                respond_to: Some(tx),
            })
            .await
            .map_err(|_| ConnectionError::ChannelClosed)?;
        rx.await.map_err(|_| ConnectionError::ChannelClosed)
    }

    /// Triggers a heartbeat round.
    pub async fn heartbeat(&self) {
        let _ = self.sender.send(RegistryCommand::Heartbeat).await;
    }

    /// Sends `message` to a connection.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::NotConnected` if the connection is not open
    /// - `ConnectionError::MessageTooLarge` / `Encode` if the message cannot be framed
    /// - `ConnectionError::ChannelClosed` if the actor has shut down
    pub async fn send<T: Serialize>(&self, id: &ConnectionId, message: &T) -> Result<(), ConnectionError> {
        self.send_line(id, None, encode_line(message)?).await
    }

    /// Sends `message` only if `id` is still at handshake generation `epoch`.
    pub async fn send_to<T: Serialize>(
        &self,
        id: &ConnectionId,
        epoch: u64,
        message: &T,
    ) -> Result<(), ConnectionError> {
        self.send_line(id, Some(epoch), encode_line(message)?).await
    }

    async fn send_line(
        &self,
        id: &ConnectionId,
        epoch: Option<u64>,
        line: String,
    ) -> Result<(), ConnectionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryCommand::SendTo {
                id: id.clone(),
                epoch,
                line,
                respond_to: tx,
            })
            .await
            .map_err(|_| ConnectionError::ChannelClosed)?;
        rx.await.map_err(|_| ConnectionError::ChannelClosed)?
    }

    /// Sends `message` to every open connection. Returns how many were reached.
    pub async fn broadcast<T: Serialize>(&self, message: &T) -> Result<usize, ConnectionError> {
        let line = encode_line(message)?;
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryCommand::Broadcast {
                line,
                respond_to: tx,
            })
            .await
            .map_err(|_| ConnectionError::ChannelClosed)?;
        rx.await.map_err(|_| ConnectionError::ChannelClosed)
    }

    /// Closes a connection, releasing its locks.
    ///
    /// Returns `true` if a close was started.
    pub async fn close(&self, id: &ConnectionId, reason: CloseReason) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(RegistryCommand::Close {
                id: id.clone(),
                reason,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Connections with their owned resources, ordered by port.
    pub async fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(RegistryCommand::Snapshot { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }

        let mut snapshots = rx.await.unwrap_or_default();
        for snapshot in &mut snapshots {
            snapshot.owned_resources = self.locks.owned_by(snapshot.id.clone()).await;
        }
        snapshots
    }

    pub async fn port_status(&self) -> PortReport {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(RegistryCommand::PortStatus { respond_to: tx })
            .await
            .is_err()
        {
            return PortReport::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Closes every connection and waits until their cleanup has finished.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(RegistryCommand::Shutdown { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Subscribe to connection lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }
}
