//! Connection registry using the actor pattern.
//!
//! The registry discovers peers across a port range, performs the
//! `hello`/`helloAck` handshake, keeps connections alive with heartbeats
//! and runs the close sequence that hands a connection's locks back.
//!
//! ```text
//!  scan ticker ──Scan──────┐
//!  heartbeat ticker ──Heartbeat─▶ RegistryActor ──RegistryEvent──▶ subscribers
//!  probe / reader / writer ─┘        │
//!                                    ├─ spawn probe ─▶ Connector ─▶ Link
//!                                    └─ on close ─▶ SessionHandle (detach) + LockHandle (release)
//! ```

use std::sync::Arc;
use std::time::Duration;

use tabgate_core::TabgateConfig;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

mod actor;
mod commands;
mod directory;
mod handle;
mod link;
mod transport;

pub use actor::{RegistryActor, RegistryDeps};
pub use commands::{
    CloseReason, ConnectionError, ConnectionSnapshot, InboundRequest, PortBackoff, PortReport,
    RegistryCommand, RegistryEvent,
};
pub use directory::ConnectionDirectory;
pub use handle::RegistryHandle;
pub use link::WRITE_TIMEOUT;
pub use transport::{Connector, Link, TcpConnector};

const COMMAND_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 100;

/// Discovery, handshake and heartbeat parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySettings {
    pub host: String,
    pub port_start: u16,
    pub port_end: u16,
    pub scan_interval: Duration,
    pub handshake_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub discovery_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl RegistrySettings {
    pub fn from_config(config: &TabgateConfig) -> Self {
        Self {
            host: config.host.clone(),
            port_start: config.port_start,
            port_end: config.port_end,
            scan_interval: config.scan_interval(),
            handshake_timeout: config.handshake_timeout(),
            reconnect_base: config.reconnect_base(),
            reconnect_max: config.reconnect_max(),
            discovery_ttl: config.discovery_ttl(),
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self::from_config(&TabgateConfig::default())
    }
}

/// Spawn the registry actor plus its scan and heartbeat tickers.
///
/// The tickers stop when `cancel` fires.
pub fn spawn_registry(
    settings: RegistrySettings,
    deps: RegistryDeps,
    cancel: CancellationToken,
) -> RegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let locks = deps.locks.clone();
    let scan_every = settings.scan_interval;
    let heartbeat_every = settings.heartbeat_interval;

    let actor = RegistryActor::new(cmd_rx, cmd_tx.downgrade(), settings, deps, event_tx.clone());
    tokio::spawn(actor.run());

    spawn_ticker(cmd_tx.clone(), scan_every, cancel.clone(), "scan", || {
        RegistryCommand::Scan { respond_to: None }
    });
    spawn_ticker(cmd_tx.clone(), heartbeat_every, cancel, "heartbeat", || {
        RegistryCommand::Heartbeat
    });

    RegistryHandle::new(cmd_tx, event_tx, locks)
}

/// Sends a fire-and-forget command every `every` until cancelled.
fn spawn_ticker<F>(
    sender: mpsc::Sender<RegistryCommand>,
    every: Duration,
    cancel: CancellationToken,
    name: &'static str,
    make: F,
) where
    F: Fn() -> RegistryCommand + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(ticker = name, "Ticker stopping: cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    if sender.send(make()).await.is_err() {
                        debug!(ticker = name, "Ticker stopping: registry channel closed");
                        break;
                    }
                }
            }
        }
    });
}

/// Shared `Arc` form of a connector.
pub fn tcp_connector(config: &TabgateConfig) -> Arc<dyn Connector> {
    Arc::new(TcpConnector::new(config.connect_timeout()))
}
