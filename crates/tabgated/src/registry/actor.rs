//! Registry actor - owns connections, probe state and port backoff.
//!
//! Network I/O never runs inside the actor loop. Probes, readers, writers
//! and close cleanups are spawned tasks that report back with commands.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tabgate_core::{ConnectionId, ConnectionState, Endpoint, ResourceId};
use tabgate_protocol::{encode_line, ControlMessage};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::commands::{
    CloseReason, ConnectionError, ConnectionSnapshot, InboundRequest, PortBackoff, PortReport,
    RegistryCommand, RegistryEvent,
};
use super::directory::ConnectionDirectory;
use super::link::{self, LinkContext};
use super::transport::{Connector, Link};
use super::RegistrySettings;
use crate::backoff;
use crate::locks::LockHandle;
use crate::session::SessionHandle;

// ============================================================================
// State
// ============================================================================

/// A registered connection.
struct Connection {
    epoch: u64,
    endpoint: Endpoint,
    state: ConnectionState,
    opened_at: DateTime<Utc>,
    last_activity: Instant,
    /// Dropped when the connection starts closing so the writer drains and exits.
    outbound: Option<mpsc::UnboundedSender<String>>,
    reader: JoinHandle<()>,
}

impl Connection {
    fn send_line(&self, line: String) -> bool {
        self.outbound
            .as_ref()
            .is_some_and(|tx| tx.send(line).is_ok())
    }
}

/// Probe failure history of one port.
#[derive(Debug, Clone, Copy)]
struct PortFailureRecord {
    fail_count: u32,
    last_attempt: Instant,
    next_retry_delay: std::time::Duration,
}

impl PortFailureRecord {
    fn retry_at(&self) -> Instant {
        self.last_attempt + self.next_retry_delay
    }
}

/// Collaborators the registry hands work to.
pub struct RegistryDeps {
    pub connector: Arc<dyn Connector>,
    pub locks: LockHandle,
    pub sessions: SessionHandle,
    pub directory: ConnectionDirectory,
    pub inbound: mpsc::Sender<InboundRequest>,
}

// ============================================================================
// Registry Actor
// ============================================================================

pub struct RegistryActor {
    receiver: mpsc::Receiver<RegistryCommand>,
    self_sender: mpsc::WeakSender<RegistryCommand>,
    settings: RegistrySettings,
    deps: RegistryDeps,

    connections: HashMap<ConnectionId, Connection>,
    /// Ports with a probe in flight.
    probing: HashSet<u16>,
    failures: HashMap<u16, PortFailureRecord>,
    /// Latest port list reported by a peer, with its arrival time.
    discovered: Option<(Vec<u16>, Instant)>,
    next_epoch: u64,
    shutdown_waiters: Vec<oneshot::Sender<()>>,

    event_publisher: broadcast::Sender<RegistryEvent>,
}

impl RegistryActor {
    pub fn new(
        receiver: mpsc::Receiver<RegistryCommand>,
        self_sender: mpsc::WeakSender<RegistryCommand>,
        settings: RegistrySettings,
        deps: RegistryDeps,
        event_publisher: broadcast::Sender<RegistryEvent>,
    ) -> Self {
        Self {
            receiver,
            self_sender,
            settings,
            deps,
            connections: HashMap::new(),
            probing: HashSet::new(),
            failures: HashMap::new(),
            discovered: None,
            next_epoch: 1,
            shutdown_waiters: Vec::new(),
            event_publisher,
        }
    }

    pub async fn run(mut self) {
        info!(
            host = %self.settings.host,
            port_start = self.settings.port_start,
            port_end = self.settings.port_end,
            "Connection registry starting"
        );

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(connections = self.connections.len(), "Connection registry stopped");
    }

    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Scan { respond_to } => {
                let started = self.handle_scan();
                if let Some(tx) = respond_to {
                    let _ = tx.send(started);
                }
            }
            RegistryCommand::ProbeSucceeded {
                port,
                link,
                instance_id,
            } => {
                self.handle_probe_succeeded(port, link, instance_id);
            }
            RegistryCommand::ProbeFailed { port, error } => {
                self.probing.remove(&port);
                self.record_failure(port, &error);
            }
            RegistryCommand::Heartbeat => {
                self.handle_heartbeat();
            }
            RegistryCommand::Touch { id, epoch } => {
                if let Some(conn) = self.connections.get_mut(&id) {
                    if conn.epoch == epoch {
                        conn.last_activity = Instant::now();
                    }
                }
            }
            RegistryCommand::PortsDiscovered { ports } => {
                debug!(ports = ?ports, "Port list received");
                self.discovered = Some((ports, Instant::now()));
            }
            RegistryCommand::LinkClosed { id, epoch, reason } => {
                self.begin_close(&id, Some(epoch), reason);
            }
            RegistryCommand::Close {
                id,
                reason,
                respond_to,
            } => {
                let started = self.begin_close(&id, None, reason);
                let _ = respond_to.send(started);
            }
            RegistryCommand::CleanupFinished {
                id,
                epoch,
                reason,
                released,
            } => {
                self.handle_cleanup_finished(id, epoch, reason, released);
            }
            RegistryCommand::SendTo {
                id,
                epoch,
                line,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_send_to(&id, epoch, line));
            }
            RegistryCommand::Broadcast { line, respond_to } => {
                let sent = self
                    .connections
                    .values()
                    .filter(|c| c.state.is_open())
                    .filter(|c| c.send_line(line.clone()))
                    .count();
                let _ = respond_to.send(sent);
            }
            RegistryCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
            RegistryCommand::PortStatus { respond_to } => {
                let _ = respond_to.send(self.port_report());
            }
            RegistryCommand::Shutdown { respond_to } => {
                self.handle_shutdown(respond_to);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------------

    fn handle_scan(&mut self) -> Vec<u16> {
        self.request_port_lists();

        let now = Instant::now();
        let mut started = Vec::new();

        for port in self.candidate_ports(now) {
            if self.probing.contains(&port)
                || self.port_in_use(port)
                || self.under_backoff(port, now)
            {
                continue;
            }

            self.probing.insert(port);
            self.spawn_probe(port);
            started.push(port);
        }

        if !started.is_empty() {
            debug!(ports = ?started, "Probing ports");
        }
        started
    }

    /// Asks every open peer for the ports peers are listening on.
    fn request_port_lists(&self) {
        let Ok(line) = encode_line(&ControlMessage::PortListRequest) else {
            return;
        };
        for conn in self.connections.values().filter(|c| c.state.is_open()) {
            conn.send_line(line.clone());
        }
    }

    /// Fresh discovered ports, else the static range, plus one port past the maximum.
    fn candidate_ports(&self, now: Instant) -> Vec<u16> {
        let mut ports: BTreeSet<u16> = match &self.discovered {
            Some((ports, at))
                if !ports.is_empty()
                    && now.saturating_duration_since(*at) < self.settings.discovery_ttl =>
            {
                ports.iter().copied().collect()
            }
            _ => (self.settings.port_start..=self.settings.port_end).collect(),
        };

        if let Some(next) = ports.last().and_then(|max| max.checked_add(1)) {
            ports.insert(next);
        }
        ports.into_iter().collect()
    }

    fn port_in_use(&self, port: u16) -> bool {
        self.connections.values().any(|c| c.endpoint.port == port)
    }

    fn under_backoff(&self, port: u16, now: Instant) -> bool {
        self.failures
            .get(&port)
            .is_some_and(|record| now < record.retry_at())
    }

    fn spawn_probe(&self, port: u16) {
        let endpoint = Endpoint::new(self.settings.host.clone(), port);
        let connector = Arc::clone(&self.deps.connector);
        let handshake_timeout = self.settings.handshake_timeout;
        let sender = self.self_sender.clone();

        tokio::spawn(async move {
            let result = async {
                let mut link = connector.connect(&endpoint).await?;
                let instance_id = link::handshake(&mut link, handshake_timeout).await?;
                Ok::<_, ConnectionError>((link, instance_id))
            }
            .await;

            let cmd = match result {
                Ok((link, instance_id)) => RegistryCommand::ProbeSucceeded {
                    port,
                    link,
                    instance_id,
                },
                Err(error) => RegistryCommand::ProbeFailed { port, error },
            };

            if let Some(sender) = sender.upgrade() {
                let _ = sender.send(cmd).await;
            }
        });
    }

    fn record_failure(&mut self, port: u16, error: &ConnectionError) {
        let now = Instant::now();
        let fail_count = self.failures.get(&port).map_or(0, |r| r.fail_count);
        let delay = backoff::exponential(
            self.settings.reconnect_base,
            fail_count,
            self.settings.reconnect_max,
        );

        self.failures.insert(
            port,
            PortFailureRecord {
                fail_count: fail_count.saturating_add(1),
                last_attempt: now,
                next_retry_delay: delay,
            },
        );

        debug!(
            port,
            fail_count = fail_count + 1,
            retry_in = ?delay,
            error = %error,
            "Probe failed"
        );
    }

    fn handle_probe_succeeded(&mut self, port: u16, link: Link, instance_id: String) {
        self.probing.remove(&port);
        let id = ConnectionId::new(instance_id);

        if let Some(existing) = self.connections.get(&id) {
            let silent = existing.last_activity.elapsed() >= self.settings.heartbeat_interval;
            if existing.state.is_open() && existing.endpoint.port != port && silent {
                info!(
                    connection_id = %id,
                    old_port = existing.endpoint.port,
                    new_port = port,
                    "Instance reappeared on another port, replacing silent connection"
                );
                self.begin_close(&id, None, CloseReason::Replaced);
            }
            // The link is dropped; the port is retried once the old connection is gone.
            self.record_failure(port, &ConnectionError::DuplicateInstance(id));
            return;
        }

        self.failures.remove(&port);
        self.open_connection(id, Endpoint::new(self.settings.host.clone(), port), link);
    }

    fn open_connection(&mut self, id: ConnectionId, endpoint: Endpoint, link: Link) {
        let epoch = self.next_epoch;
        self.next_epoch = self.next_epoch.wrapping_add(1);

        let ctx = LinkContext {
            id: id.clone(),
            epoch,
            registry: self.self_sender.clone(),
        };
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(link::run_writer(ctx.clone(), link.writer, outbound_rx));
        let reader = tokio::spawn(link::run_reader(
            ctx,
            link.reader,
            outbound_tx.clone(),
            self.deps.inbound.clone(),
        ));

        self.connections.insert(
            id.clone(),
            Connection {
                epoch,
                endpoint: endpoint.clone(),
                state: ConnectionState::Open,
                opened_at: Utc::now(),
                last_activity: Instant::now(),
                outbound: Some(outbound_tx),
                reader,
            },
        );
        self.deps.directory.set(&id, epoch, ConnectionState::Open);

        info!(
            connection_id = %id,
            port = endpoint.port,
            epoch,
            total = self.connections.len(),
            "Connection opened"
        );

        let _ = self.event_publisher.send(RegistryEvent::Opened { id, epoch, endpoint });
    }

    // ------------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------------

    fn handle_heartbeat(&mut self) {
        let Ok(ping) = encode_line(&ControlMessage::Ping) else {
            return;
        };

        let timeout = self.settings.heartbeat_timeout;
        let mut dead = Vec::new();

        for (id, conn) in self.connections.iter().filter(|(_, c)| c.state.is_open()) {
            let idle = conn.last_activity.elapsed();
            if idle >= timeout {
                warn!(connection_id = %id, idle = ?idle, "Heartbeat timeout");
                dead.push(id.clone());
            } else {
                conn.send_line(ping.clone());
            }
        }

        for id in dead {
            self.begin_close(&id, None, CloseReason::HeartbeatTimeout);
        }
    }

    // ------------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------------

    /// Starts closing a connection. Idempotent: unknown ids, other epochs
    /// and connections already closing are ignored.
    fn begin_close(&mut self, id: &ConnectionId, epoch: Option<u64>, reason: CloseReason) -> bool {
        let Some(conn) = self.connections.get_mut(id) else {
            return false;
        };
        if epoch.is_some_and(|e| e != conn.epoch) || conn.state.is_terminating() {
            return false;
        }

        conn.state = ConnectionState::Closing;
        conn.outbound = None;
        conn.reader.abort();
        let epoch = conn.epoch;

        self.deps.directory.set(id, epoch, ConnectionState::Closing);
        info!(connection_id = %id, epoch, reason = ?reason, "Connection closing");

        self.spawn_cleanup(id.clone(), epoch, reason);
        true
    }

    /// Schedules detaches for owned resources, then releases their locks.
    ///
    /// Detaches are queued before the release so a promoted waiter's attach
    /// runs after them.
    fn spawn_cleanup(&self, id: ConnectionId, epoch: u64, reason: CloseReason) {
        let locks = self.deps.locks.clone();
        let sessions = self.deps.sessions.clone();
        let sender = self.self_sender.clone();

        tokio::spawn(async move {
            for resource in locks.owned_by(id.clone()).await {
                sessions.detach_in_background(&resource);
            }
            let released = locks.force_release_all_owned_by(id.clone()).await;

            if let Some(sender) = sender.upgrade() {
                let _ = sender
                    .send(RegistryCommand::CleanupFinished {
                        id,
                        epoch,
                        reason,
                        released,
                    })
                    .await;
            }
        });
    }

    fn handle_cleanup_finished(
        &mut self,
        id: ConnectionId,
        epoch: u64,
        reason: CloseReason,
        released: Vec<ResourceId>,
    ) {
        let matches = self
            .connections
            .get(&id)
            .is_some_and(|c| c.epoch == epoch && c.state == ConnectionState::Closing);
        if !matches {
            return;
        }

        self.connections.remove(&id);
        self.deps.directory.remove(&id, epoch);

        info!(
            connection_id = %id,
            epoch,
            reason = ?reason,
            released = released.len(),
            "Connection closed"
        );

        let _ = self.event_publisher.send(RegistryEvent::Closed {
            id,
            epoch,
            reason,
            released,
        });

        if self.connections.is_empty() {
            for waiter in self.shutdown_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    fn handle_shutdown(&mut self, respond_to: oneshot::Sender<()>) {
        let ids: Vec<ConnectionId> = self.connections.keys().cloned().collect();
        for id in &ids {
            self.begin_close(id, None, CloseReason::Shutdown);
        }

        if self.connections.is_empty() {
            let _ = respond_to.send(());
        } else {
            self.shutdown_waiters.push(respond_to);
        }
    }

    // ------------------------------------------------------------------------
    // Outbound and queries
    // ------------------------------------------------------------------------

    fn handle_send_to(
        &self,
        id: &ConnectionId,
        epoch: Option<u64>,
        line: String,
    ) -> Result<(), ConnectionError> {
        let conn = self
            .connections
            .get(id)
            .filter(|c| c.state.is_open())
            .filter(|c| epoch.map_or(true, |e| e == c.epoch))
            .ok_or_else(|| ConnectionError::NotConnected(id.clone()))?;

        if conn.send_line(line) {
            Ok(())
        } else {
            Err(ConnectionError::NotConnected(id.clone()))
        }
    }

    fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let mut snapshots: Vec<ConnectionSnapshot> = self
            .connections
            .iter()
            .map(|(id, conn)| ConnectionSnapshot {
                id: id.clone(),
                epoch: conn.epoch,
                endpoint: conn.endpoint.clone(),
                state: conn.state,
                opened_at: conn.opened_at,
                idle_for: conn.last_activity.elapsed(),
                owned_resources: Vec::new(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.endpoint.port.cmp(&b.endpoint.port));
        snapshots
    }

    fn port_report(&self) -> PortReport {
        let now = Instant::now();
        let mut probing: Vec<u16> = self.probing.iter().copied().collect();
        probing.sort_unstable();

        let mut backoff: Vec<PortBackoff> = self
            .failures
            .iter()
            .map(|(port, record)| PortBackoff {
                port: *port,
                fail_count: record.fail_count,
                next_retry_delay: record.next_retry_delay,
                retry_in: record.retry_at().saturating_duration_since(now),
            })
            .collect();
        backoff.sort_by_key(|b| b.port);

        PortReport {
            candidates: self.candidate_ports(now),
            probing,
            backoff,
        }
    }
}
