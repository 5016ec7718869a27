//! Shared helpers: an in-memory network of fake peers.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tabgate_core::{ConnectionId, Endpoint};
use tabgated::locks::{spawn_lock_manager, LivenessProbe, LockHandle, LockSettings};
use tabgated::registry::{
    spawn_registry, CloseReason, ConnectionDirectory, ConnectionError, Connector, InboundRequest,
    Link, RegistryDeps, RegistryEvent, RegistryHandle, RegistrySettings,
};
use tabgated::session::{NoopBackend, SessionHandle, SessionSettings};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Fake peers
// ============================================================================

/// How a fake peer behaves.
#[derive(Debug, Clone)]
pub struct PeerBehavior {
    pub instance_id: String,
    pub answer_pings: bool,
    /// Reply to `portListRequest` with these ports.
    pub port_list: Option<Vec<u16>>,
}

impl PeerBehavior {
    pub fn new(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            answer_pings: true,
            port_list: None,
        }
    }

    pub fn silent(mut self) -> Self {
        self.answer_pings = false;
        self
    }

    pub fn with_port_list(mut self, ports: Vec<u16>) -> Self {
        self.port_list = Some(ports);
        self
    }
}

pub enum PeerCmd {
    Send(Value),
    /// Bytes written as-is.
    Raw(Vec<u8>),
    Close,
}

/// Ports with fake peers listening, plus what they received.
pub struct FakeNetwork {
    peers: Mutex<HashMap<u16, PeerBehavior>>,
    attempts: Mutex<HashMap<u16, u32>>,
    controls: Mutex<HashMap<u16, mpsc::UnboundedSender<PeerCmd>>>,
    received: mpsc::UnboundedSender<(u16, Value)>,
}

impl FakeNetwork {
    /// Returns the network and a receiver of frames peers got from the coordinator.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(u16, Value)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let net = Arc::new(Self {
            peers: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            controls: Mutex::new(HashMap::new()),
            received: tx,
        });
        (net, rx)
    }

    pub fn listen(&self, port: u16, behavior: PeerBehavior) {
        self.peers.lock().unwrap().insert(port, behavior);
    }

    /// Refuses future connections on `port`; an existing connection stays up.
    pub fn unlisten(&self, port: u16) {
        self.peers.lock().unwrap().remove(&port);
    }

    pub fn attempts(&self, port: u16) -> u32 {
        self.attempts.lock().unwrap().get(&port).copied().unwrap_or(0)
    }

    /// Makes the peer on `port` write a frame to the coordinator.
    pub fn send_from(&self, port: u16, frame: Value) {
        let controls = self.controls.lock().unwrap();
        controls
            .get(&port)
            .expect("peer connected")
            .send(PeerCmd::Send(frame))
            .ok();
    }

    /// Makes the peer on `port` write raw bytes to the coordinator.
    pub fn send_raw_from(&self, port: u16, bytes: &[u8]) {
        let controls = self.controls.lock().unwrap();
        controls
            .get(&port)
            .expect("peer connected")
            .send(PeerCmd::Raw(bytes.to_vec()))
            .ok();
    }

    /// Closes the peer side of the connection on `port`.
    pub fn close(&self, port: u16) {
        if let Some(tx) = self.controls.lock().unwrap().remove(&port) {
            let _ = tx.send(PeerCmd::Close);
        }
    }
}

#[async_trait]
impl Connector for FakeNetwork {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Link, ConnectionError> {
        *self.attempts.lock().unwrap().entry(endpoint.port).or_default() += 1;

        let behavior = self
            .peers
            .lock()
            .unwrap()
            .get(&endpoint.port)
            .cloned()
            .ok_or_else(|| ConnectionError::Io("connection refused".to_string()))?;

        let (coordinator_side, peer_side) = tokio::io::duplex(64 * 1024);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        self.controls.lock().unwrap().insert(endpoint.port, cmd_tx);
        tokio::spawn(run_peer(
            endpoint.port,
            behavior,
            peer_side,
            cmd_rx,
            self.received.clone(),
        ));

        let (reader, writer) = tokio::io::split(coordinator_side);
        Ok(Link::new(reader, writer))
    }
}

async fn run_peer(
    port: u16,
    behavior: PeerBehavior,
    stream: tokio::io::DuplexStream,
    mut cmds: mpsc::UnboundedReceiver<PeerCmd>,
    received: mpsc::UnboundedSender<(u16, Value)>,
) {
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let Ok(frame) = serde_json::from_str::<Value>(&line) else { continue };

                let reply = match frame["type"].as_str() {
                    Some("hello") => Some(json!({"type": "helloAck", "instanceId": behavior.instance_id})),
                    Some("ping") if behavior.answer_pings => Some(json!({"type": "pong", "timestamp": 0})),
                    Some("ping") => None,
                    Some("portListRequest") => behavior
                        .port_list
                        .as_ref()
                        .map(|ports| json!({"type": "portListResponse", "ports": ports})),
                    _ => {
                        let _ = received.send((port, frame));
                        None
                    }
                };

                if let Some(reply) = reply {
                    if write_frame(&mut writer, &reply).await.is_err() {
                        break;
                    }
                }
            }
            cmd = cmds.recv() => match cmd {
                Some(PeerCmd::Send(frame)) => {
                    if write_frame(&mut writer, &frame).await.is_err() {
                        break;
                    }
                }
                Some(PeerCmd::Raw(bytes)) => {
                    if writer.write_all(&bytes).await.is_err() || writer.flush().await.is_err() {
                        break;
                    }
                }
                Some(PeerCmd::Close) | None => break,
            }
        }
    }
}

async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, frame: &Value) -> std::io::Result<()> {
    let mut line = serde_json::to_string(frame).unwrap();
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

// ============================================================================
// Registry fixtures
// ============================================================================

/// Settings with tickers slow enough that tests drive scans themselves.
pub fn registry_settings(port_start: u16, port_end: u16) -> RegistrySettings {
    RegistrySettings {
        host: "127.0.0.1".to_string(),
        port_start,
        port_end,
        scan_interval: Duration::from_secs(3600),
        handshake_timeout: Duration::from_secs(3),
        reconnect_base: Duration::from_millis(1000),
        reconnect_max: Duration::from_millis(30_000),
        discovery_ttl: Duration::from_secs(30),
        heartbeat_interval: Duration::from_secs(3600),
        heartbeat_timeout: Duration::from_secs(3600 * 3),
    }
}

pub struct RegistryFixture {
    pub registry: RegistryHandle,
    pub locks: LockHandle,
    pub sessions: SessionHandle,
    pub directory: ConnectionDirectory,
    pub events: broadcast::Receiver<RegistryEvent>,
    pub inbound: mpsc::Receiver<InboundRequest>,
    pub cancel: CancellationToken,
}

pub fn spawn_fixture(settings: RegistrySettings, net: Arc<FakeNetwork>) -> RegistryFixture {
    let cancel = CancellationToken::new();
    let directory = ConnectionDirectory::new();
    let liveness: Arc<dyn LivenessProbe> = Arc::new(directory.clone());
    let locks = spawn_lock_manager(LockSettings::default(), liveness, cancel.clone());
    let sessions = SessionHandle::new(Arc::new(NoopBackend), SessionSettings::default());
    let (inbound_tx, inbound) = mpsc::channel(64);

    let registry = spawn_registry(
        settings,
        RegistryDeps {
            connector: net,
            locks: locks.clone(),
            sessions: sessions.clone(),
            directory: directory.clone(),
            inbound: inbound_tx,
        },
        cancel.clone(),
    );
    let events = registry.subscribe();

    RegistryFixture {
        registry,
        locks,
        sessions,
        directory,
        events,
        inbound,
        cancel,
    }
}

/// Waits for the next `Opened` event.
pub async fn next_opened(events: &mut broadcast::Receiver<RegistryEvent>) -> (ConnectionId, u64, u16) {
    timeout(Duration::from_secs(60), async {
        loop {
            if let RegistryEvent::Opened { id, epoch, endpoint } = events.recv().await.unwrap() {
                return (id, epoch, endpoint.port);
            }
        }
    })
    .await
    .expect("connection should open")
}

/// Waits for the next `Closed` event.
pub async fn next_closed(
    events: &mut broadcast::Receiver<RegistryEvent>,
) -> (ConnectionId, CloseReason, Vec<tabgate_core::ResourceId>) {
    timeout(Duration::from_secs(120), async {
        loop {
            if let RegistryEvent::Closed {
                id,
                reason,
                released,
                ..
            } = events.recv().await.unwrap()
            {
                return (id, reason, released);
            }
        }
    })
    .await
    .expect("connection should close")
}
