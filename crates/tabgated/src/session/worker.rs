//! Per-resource session worker.
//!
//! One task per resource drains that resource's operation queue in order.
//! An operation runs to completion before the next one starts, so a
//! second `ensure_attached` queued behind an in-flight attach simply finds
//! the session `ATTACHED`.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tabgate_core::{EventRing, RecordedEvent, ResourceId, SessionPhase};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::backend::{AttachOptions, BackendError, SessionBackend};
use super::commands::{ObservedState, SessionError, SessionEvent, SessionOp};
use super::{Inner, Retirement, SessionSettings};
use crate::backoff;

/// Upper bound for the delay between attach or detach attempts.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

pub(crate) struct SessionWorker {
    resource: ResourceId,
    generation: u64,
    owner: Weak<Inner>,
    phase: SessionPhase,
    phase_tx: watch::Sender<SessionPhase>,
    events: EventRing<RecordedEvent>,
    backend: Arc<dyn SessionBackend>,
    settings: SessionSettings,
    ops: mpsc::UnboundedReceiver<SessionOp>,
    event_publisher: broadcast::Sender<SessionEvent>,
}

impl SessionWorker {
    pub(crate) fn new(
        resource: ResourceId,
        generation: u64,
        owner: Weak<Inner>,
        phase_tx: watch::Sender<SessionPhase>,
        backend: Arc<dyn SessionBackend>,
        settings: SessionSettings,
        ops: mpsc::UnboundedReceiver<SessionOp>,
        event_publisher: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            resource,
            generation,
            owner,
            phase: SessionPhase::Detached,
            phase_tx,
            events: EventRing::new(settings.event_capacity),
            backend,
            settings,
            ops,
            event_publisher,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(resource_id = %self.resource, "Session worker started");

        loop {
            let op = if self.phase == SessionPhase::Detached {
                match timeout(self.settings.idle_retire, self.ops.recv()).await {
                    Ok(op) => op,
                    Err(_) => match self.try_retire() {
                        Retirement::Retired => break,
                        Retirement::Pending(op) => Some(op),
                        Retirement::Watched => continue,
                    },
                }
            } else {
                self.ops.recv().await
            };

            let Some(op) = op else { break };
            self.handle(op).await;
        }

        debug!(resource_id = %self.resource, phase = %self.phase, "Session worker stopped");
    }

    fn try_retire(&mut self) -> Retirement {
        let Some(owner) = self.owner.upgrade() else {
            return Retirement::Retired;
        };
        let retirement = owner.retire(&self.resource, self.generation, &mut self.ops, &self.phase_tx);
        if matches!(retirement, Retirement::Retired) {
            debug!(resource_id = %self.resource, "Idle session worker retiring");
        }
        retirement
    }

    async fn handle(&mut self, op: SessionOp) {
        match op {
            SessionOp::EnsureAttached {
                options,
                respond_to,
            } => {
                let result = self.ensure_attached(&options).await;
                let _ = respond_to.send(result);
            }
            SessionOp::EnsureDetached { respond_to } => {
                let result = self.ensure_detached().await;
                let _ = respond_to.send(result);
            }
            SessionOp::Reconcile {
                observed,
                respond_to,
            } => {
                let result = self.reconcile(observed);
                let _ = respond_to.send(result);
            }
            SessionOp::RecordEvent { event } => {
                self.events.push(event);
            }
            SessionOp::Events { respond_to } => {
                let _ = respond_to.send(self.events.to_vec());
            }
        }
    }

    // ------------------------------------------------------------------------
    // Attach / Detach
    // ------------------------------------------------------------------------

    async fn ensure_attached(&mut self, options: &AttachOptions) -> Result<SessionPhase, SessionError> {
        match self.phase {
            SessionPhase::Attached => return Ok(SessionPhase::Attached),
            SessionPhase::Error => self.transition(SessionPhase::Detached)?,
            _ => {}
        }

        self.transition(SessionPhase::Attaching)?;

        let max_attempts = self.settings.max_attempts;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.backend.attach(&self.resource, options).await {
                Ok(()) | Err(BackendError::AlreadyAttached) => {
                    self.transition(SessionPhase::Attached)?;
                    self.events = EventRing::new(self.settings.event_capacity);
                    info!(resource_id = %self.resource, attempt, "Session attached");
                    return Ok(SessionPhase::Attached);
                }
                Err(e) => {
                    debug!(resource_id = %self.resource, attempt, error = %e, "Attach attempt failed");
                    last_error = e.to_string();
                    self.pause_before_retry(attempt).await;
                }
            }
        }

        warn!(
            resource_id = %self.resource,
            attempts = max_attempts,
            error = %last_error,
            "Attach retries exhausted"
        );
        self.transition(SessionPhase::Error)?;
        self.transition(SessionPhase::Detached)?;

        Err(SessionError::AttachFailed {
            resource: self.resource.clone(),
            attempts: max_attempts,
            last_error,
        })
    }

    async fn ensure_detached(&mut self) -> Result<SessionPhase, SessionError> {
        match self.phase {
            SessionPhase::Detached => return Ok(SessionPhase::Detached),
            SessionPhase::Error => {
                self.transition(SessionPhase::Detached)?;
                return Ok(SessionPhase::Detached);
            }
            _ => {}
        }

        self.transition(SessionPhase::Detaching)?;

        let max_attempts = self.settings.max_attempts;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.backend.detach(&self.resource).await {
                Ok(()) | Err(BackendError::NotAttached) => {
                    self.transition(SessionPhase::Detached)?;
                    self.events.retain_last(self.settings.post_mortem_retain);
                    info!(resource_id = %self.resource, attempt, "Session detached");
                    return Ok(SessionPhase::Detached);
                }
                Err(e) => {
                    debug!(resource_id = %self.resource, attempt, error = %e, "Detach attempt failed");
                    last_error = e.to_string();
                    self.pause_before_retry(attempt).await;
                }
            }
        }

        warn!(
            resource_id = %self.resource,
            attempts = max_attempts,
            error = %last_error,
            "Detach retries exhausted"
        );
        self.transition(SessionPhase::Error)?;
        self.transition(SessionPhase::Detached)?;
        self.events.retain_last(self.settings.post_mortem_retain);

        Err(SessionError::DetachFailed {
            resource: self.resource.clone(),
            attempts: max_attempts,
            last_error,
        })
    }

    /// Sleeps before the next attempt; no sleep after the last one.
    async fn pause_before_retry(&self, attempt: u32) {
        if attempt < self.settings.max_attempts {
            let delay = backoff::exponential(self.settings.retry_base, attempt - 1, MAX_RETRY_DELAY);
            tokio::time::sleep(delay).await;
        }
    }

    /// Follows a change the resource made on its own, without calling the backend.
    fn reconcile(&mut self, observed: ObservedState) -> Result<SessionPhase, SessionError> {
        match (observed, self.phase) {
            (ObservedState::Detached, SessionPhase::Attached) => {
                info!(resource_id = %self.resource, "Session detached externally");
                self.transition(SessionPhase::Detaching)?;
                self.transition(SessionPhase::Detached)?;
                self.events.retain_last(self.settings.post_mortem_retain);
            }
            (ObservedState::Attached, SessionPhase::Detached) => {
                info!(resource_id = %self.resource, "Session attached externally");
                self.transition(SessionPhase::Attaching)?;
                self.transition(SessionPhase::Attached)?;
                self.events = EventRing::new(self.settings.event_capacity);
            }
            _ => {}
        }
        Ok(self.phase)
    }

    fn transition(&mut self, next: SessionPhase) -> Result<(), SessionError> {
        let from = self.phase;
        if !from.can_transition_to(next) {
            warn!(resource_id = %self.resource, from = %from, to = %next, "Rejected session transition");
            return Err(SessionError::InvalidTransition {
                resource: self.resource.clone(),
                from,
                to: next,
            });
        }

        self.phase = next;
        self.phase_tx.send_replace(next);
        debug!(resource_id = %self.resource, from = %from, to = %next, "Session transition");

        let _ = self.event_publisher.send(SessionEvent::Transition {
            resource: self.resource.clone(),
            from,
            to: next,
        });
        Ok(())
    }
}
