//! Per-resource exclusive locks with FIFO waiters.
//!
//! The lock table, wait queues and the connection → resources reverse
//! index are owned by a single `LockActor`. Callers talk to it through a
//! `LockHandle`; a background ticker asks it to sweep stale locks.
//!
//! ```text
//! Router ──acquire/release──▶ LockActor ──LockEvent──▶ subscribers
//! Registry ──force_release──▶    │
//!                                └─ is_alive? ──▶ LivenessProbe
//! ```

use std::sync::Arc;
use std::time::Duration;

use tabgate_core::{ConnectionId, TabgateConfig};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

mod actor;
mod commands;
mod handle;

pub use actor::LockActor;
pub use commands::{Grant, LockCommand, LockError, LockEvent, LockSnapshot, ReleaseReason};
pub use handle::LockHandle;

const COMMAND_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 256;

/// Answers whether a connection is still live.
///
/// Consulted before a held lock is force-released.
pub trait LivenessProbe: Send + Sync {
    fn is_alive(&self, connection: &ConnectionId) -> bool;
}

impl<F> LivenessProbe for F
where
    F: Fn(&ConnectionId) -> bool + Send + Sync,
{
    fn is_alive(&self, connection: &ConnectionId) -> bool {
        self(connection)
    }
}

/// Staleness thresholds and sweep cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    /// Hold age after which a dead holder's lock is recovered.
    pub stale: Duration,
    /// Hold age after which a requester that already timed out may recover the lock.
    pub hard_stale: Duration,
    pub sweep_interval: Duration,
}

impl LockSettings {
    pub fn from_config(config: &TabgateConfig) -> Self {
        Self {
            stale: config.lock_stale(),
            hard_stale: config.lock_hard_stale(),
            sweep_interval: config.lock_sweep_interval(),
        }
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self::from_config(&TabgateConfig::default())
    }
}

/// Spawn the lock actor and its sweep task and return a handle.
///
/// The sweep task stops when `cancel` fires; the actor stops once the
/// sweep task and every handle are gone.
pub fn spawn_lock_manager(
    settings: LockSettings,
    liveness: Arc<dyn LivenessProbe>,
    cancel: CancellationToken,
) -> LockHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let actor = LockActor::new(
        cmd_rx,
        cmd_tx.downgrade(),
        settings,
        liveness,
        event_tx.clone(),
    );
    tokio::spawn(actor.run());

    spawn_sweep_task(cmd_tx.clone(), settings.sweep_interval, cancel);

    LockHandle::new(cmd_tx, event_tx)
}

/// Periodically asks the actor to release stale locks.
fn spawn_sweep_task(
    sender: mpsc::Sender<LockCommand>,
    every: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Lock sweep task stopping: cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    if sender.send(LockCommand::SweepStale).await.is_err() {
                        debug!("Lock sweep task stopping: lock channel closed");
                        break;
                    }
                }
            }
        }
    });
}
