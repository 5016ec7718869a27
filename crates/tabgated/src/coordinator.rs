//! Wires the registry, lock manager, session workers and router together.

use std::sync::Arc;

use tabgate_core::TabgateConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::locks::{spawn_lock_manager, LivenessProbe, LockHandle, LockSettings};
use crate::registry::{
    spawn_registry, ConnectionDirectory, Connector, RegistryDeps, RegistryHandle, RegistrySettings,
};
use crate::router::{spawn_router, HandlerRegistry, Router};
use crate::session::{SessionBackend, SessionHandle, SessionSettings};

/// Inbound requests buffered between connection readers and the router.
const INBOUND_BUFFER: usize = 256;

/// A running coordinator.
pub struct Coordinator {
    pub registry: RegistryHandle,
    pub locks: LockHandle,
    pub sessions: SessionHandle,
    pub router: Router,
    pub directory: ConnectionDirectory,
    cancel: CancellationToken,
    router_task: JoinHandle<()>,
}

impl Coordinator {
    /// Spawns every component on the current runtime.
    pub fn spawn(
        config: &TabgateConfig,
        connector: Arc<dyn Connector>,
        backend: Arc<dyn SessionBackend>,
        handlers: HandlerRegistry,
    ) -> Self {
        let cancel = CancellationToken::new();
        let directory = ConnectionDirectory::new();

        let liveness: Arc<dyn LivenessProbe> = Arc::new(directory.clone());
        let locks = spawn_lock_manager(LockSettings::from_config(config), liveness, cancel.clone());
        let sessions = SessionHandle::new(backend, SessionSettings::from_config(config));

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let registry = spawn_registry(
            RegistrySettings::from_config(config),
            RegistryDeps {
                connector,
                locks: locks.clone(),
                sessions: sessions.clone(),
                directory: directory.clone(),
                inbound: inbound_tx,
            },
            cancel.clone(),
        );

        let router = Router::from_config(handlers, locks.clone(), sessions.clone(), config);
        let router_task = spawn_router(router.clone(), registry.clone(), inbound_rx, cancel.clone());

        info!(
            port_start = config.port_start,
            port_end = config.port_end,
            "Coordinator started"
        );

        Self {
            registry,
            locks,
            sessions,
            router,
            directory,
            cancel,
            router_task,
        }
    }

    /// Token that stops the tickers and the router when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops background work, closes every connection and waits for cleanup.
    pub async fn shutdown(self) {
        info!("Coordinator shutting down");
        self.cancel.cancel();
        self.registry.shutdown().await;
        let _ = self.router_task.await;
        info!("Coordinator stopped");
    }
}
