//! Per-resource attach/detach state machine.
//!
//! Each resource gets a worker task, created on first use, that drains a
//! FIFO operation queue. Enqueueing is synchronous, so the order in which
//! callers submit operations is the order in which they run. A worker that
//! sits `DETACHED` with nothing queued and nobody watching its phase for
//! `idle_retire` removes itself; the next operation starts a fresh one.
//!
//! ```text
//! ensure_attached ─┐
//! ensure_detached ─┼─▶ [op queue: tab-1] ─▶ SessionWorker(tab-1) ─▶ SessionBackend
//! record_event ────┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tabgate_core::{RecordedEvent, ResourceId, SessionPhase, TabgateConfig};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, warn};

mod backend;
mod commands;
mod worker;

pub use backend::{AttachOptions, BackendError, NoopBackend, SessionBackend, DEFAULT_PROTOCOL_VERSION};
pub use commands::{ObservedState, SessionError, SessionEvent};

use commands::SessionOp;

use worker::SessionWorker;

const EVENT_BUFFER: usize = 256;

/// How long a detached, unused worker lingers before retiring.
pub const WORKER_IDLE_RETIRE: Duration = Duration::from_secs(300);

/// Retry policy and buffer sizes for session workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Total attempts per attach or detach.
    pub max_attempts: u32,
    pub retry_base: Duration,
    pub event_capacity: usize,
    /// Events kept after a detach.
    pub post_mortem_retain: usize,
    pub idle_retire: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &TabgateConfig) -> Self {
        Self {
            max_attempts: config.max_attach_retries.max(1),
            retry_base: config.attach_retry_base(),
            event_capacity: config.event_buffer_capacity,
            post_mortem_retain: config.post_mortem_retain,
            idle_retire: WORKER_IDLE_RETIRE,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&TabgateConfig::default())
    }
}

struct WorkerEntry {
    generation: u64,
    ops: mpsc::UnboundedSender<SessionOp>,
    phase: watch::Receiver<SessionPhase>,
}

pub(crate) struct Inner {
    workers: Mutex<HashMap<ResourceId, WorkerEntry>>,
    next_generation: AtomicU64,
    backend: Arc<dyn SessionBackend>,
    settings: SessionSettings,
    event_sender: broadcast::Sender<SessionEvent>,
}

/// Answer to an idle worker asking to retire.
pub(crate) enum Retirement {
    Retired,
    /// An operation arrived in the meantime.
    Pending(SessionOp),
    /// Someone still watches the phase.
    Watched,
}

impl Inner {
    /// Removes the worker's entry unless work or watchers showed up.
    ///
    /// Runs under the map lock, which every enqueue and `watch_phase` also
    /// takes, so nothing can slip in between the checks and the removal.
    pub(crate) fn retire(
        &self,
        resource: &ResourceId,
        generation: u64,
        ops: &mut mpsc::UnboundedReceiver<SessionOp>,
        phase_tx: &watch::Sender<SessionPhase>,
    ) -> Retirement {
        let mut workers = lock_map(&self.workers);

        if let Ok(op) = ops.try_recv() {
            return Retirement::Pending(op);
        }
        // The map entry holds one receiver itself.
        if phase_tx.receiver_count() > 1 {
            return Retirement::Watched;
        }

        if workers
            .get(resource)
            .is_some_and(|entry| entry.generation == generation)
        {
            workers.remove(resource);
        }
        Retirement::Retired
    }
}

fn lock_map(
    workers: &Mutex<HashMap<ResourceId, WorkerEntry>>,
) -> MutexGuard<'_, HashMap<ResourceId, WorkerEntry>> {
    workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cheap-to-clone handle to all session workers.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<Inner>,
}

impl SessionHandle {
    pub fn new(backend: Arc<dyn SessionBackend>, settings: SessionSettings) -> Self {
        let (event_sender, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                workers: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                backend,
                settings,
                event_sender,
            }),
        }
    }

    /// Attaches a session to `resource` unless one is already attached.
    ///
    /// # Errors
    ///
    /// - `SessionError::AttachFailed` once every attempt failed
    /// - `SessionError::InvalidTransition` if the worker is in an unexpected phase
    /// - `SessionError::ChannelClosed` if the worker is gone
    pub async fn ensure_attached(
        &self,
        resource: &ResourceId,
        options: AttachOptions,
    ) -> Result<SessionPhase, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(
            resource,
            SessionOp::EnsureAttached {
                options,
                respond_to: tx,
            },
        )?;
        rx.await.map_err(|_| SessionError::ChannelClosed)?
    }

    /// Detaches the session on `resource` if one is attached.
    pub async fn ensure_detached(&self, resource: &ResourceId) -> Result<SessionPhase, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(resource, SessionOp::EnsureDetached { respond_to: tx })?;
        rx.await.map_err(|_| SessionError::ChannelClosed)?
    }

    /// Queues a best-effort detach and returns immediately.
    ///
    /// Only resources that already have a worker are touched; failures are
    /// logged.
    pub fn detach_in_background(&self, resource: &ResourceId) {
        if !self.is_tracked(resource) {
            return;
        }

        let (tx, rx) = oneshot::channel();
        if let Err(e) = self.enqueue(resource, SessionOp::EnsureDetached { respond_to: tx }) {
            warn!(resource_id = %resource, error = %e, "Could not schedule cleanup detach");
            return;
        }

        let resource = resource.clone();
        tokio::spawn(async move {
            match rx.await {
                Ok(Ok(_)) => debug!(resource_id = %resource, "Cleanup detach finished"),
                Ok(Err(e)) => warn!(resource_id = %resource, error = %e, "Cleanup detach failed"),
                Err(_) => debug!(resource_id = %resource, "Cleanup detach dropped"),
            }
        });
    }

    /// Reconciles with a state change the resource reported itself.
    pub async fn on_external_state_change(
        &self,
        resource: &ResourceId,
        observed: ObservedState,
    ) -> Result<SessionPhase, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(
            resource,
            SessionOp::Reconcile {
                observed,
                respond_to: tx,
            },
        )?;
        rx.await.map_err(|_| SessionError::ChannelClosed)?
    }

    /// Appends an event to the resource's bounded buffer.
    pub fn record_event(&self, resource: &ResourceId, event: RecordedEvent) {
        if let Err(e) = self.enqueue(resource, SessionOp::RecordEvent { event }) {
            debug!(resource_id = %resource, error = %e, "Dropped session event");
        }
    }

    /// Buffered events for `resource`, oldest first.
    ///
    /// Answered in queue order, after any operation submitted earlier. A
    /// resource without a worker has no events and does not get a worker.
    pub async fn events(&self, resource: &ResourceId) -> Vec<RecordedEvent> {
        let (tx, rx) = oneshot::channel();
        {
            let workers = self.lock_workers();
            let Some(entry) = workers.get(resource) else {
                return Vec::new();
            };
            if entry.ops.send(SessionOp::Events { respond_to: tx }).is_err() {
                return Vec::new();
            }
        }
        rx.await.unwrap_or_default()
    }

    /// Current phase of `resource`; `DETACHED` if it was never used.
    pub fn phase(&self, resource: &ResourceId) -> SessionPhase {
        self.lock_workers()
            .get(resource)
            .map(|entry| *entry.phase.borrow())
            .unwrap_or_default()
    }

    /// Watches phase changes of `resource`, creating its worker if needed.
    ///
    /// The worker stays alive while the receiver does.
    pub fn watch_phase(&self, resource: &ResourceId) -> watch::Receiver<SessionPhase> {
        let mut workers = self.lock_workers();
        self.entry(&mut workers, resource).phase.clone()
    }

    /// Number of live workers.
    pub fn worker_count(&self) -> usize {
        self.lock_workers().len()
    }

    /// Subscribe to session transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.event_sender.subscribe()
    }

    fn is_tracked(&self, resource: &ResourceId) -> bool {
        self.lock_workers().contains_key(resource)
    }

    fn enqueue(&self, resource: &ResourceId, op: SessionOp) -> Result<(), SessionError> {
        let mut workers = self.lock_workers();
        self.entry(&mut workers, resource)
            .ops
            .send(op)
            .map_err(|_| SessionError::ChannelClosed)
    }

    fn entry<'a>(
        &self,
        workers: &'a mut HashMap<ResourceId, WorkerEntry>,
        resource: &ResourceId,
    ) -> &'a WorkerEntry {
        workers.entry(resource.clone()).or_insert_with(|| {
            let (ops_tx, ops_rx) = mpsc::unbounded_channel();
            let (phase_tx, phase_rx) = watch::channel(SessionPhase::Detached);
            let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
            let worker = SessionWorker::new(
                resource.clone(),
                generation,
                Arc::downgrade(&self.inner),
                phase_tx,
                Arc::clone(&self.inner.backend),
                self.inner.settings,
                ops_rx,
                self.inner.event_sender.clone(),
            );
            tokio::spawn(worker.run());
            WorkerEntry {
                generation,
                ops: ops_tx,
                phase: phase_rx,
            }
        })
    }

    fn lock_workers(&self) -> MutexGuard<'_, HashMap<ResourceId, WorkerEntry>> {
        lock_map(&self.inner.workers)
    }
}
