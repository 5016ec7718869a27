//! Lock actor - owns the lock table, wait queues and reverse index.
//!
//! Every mutation happens inside this task, so a release and the promotion
//! of the next waiter are a single step that no other request can observe
//! half-done.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tabgate_core::{ConnectionId, ResourceId};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::commands::{Grant, LockCommand, LockError, LockEvent, LockSnapshot, ReleaseReason};
use super::{LivenessProbe, LockSettings};

/// Current holder of a resource.
#[derive(Debug)]
struct Hold {
    holder: ConnectionId,
    acquired_at: Instant,
    acquired_wall: DateTime<Utc>,
}

/// A queued acquire.
#[derive(Debug)]
struct Waiter {
    ticket: u64,
    connection: ConnectionId,
    requested_at: Instant,
    respond_to: oneshot::Sender<Result<Grant, LockError>>,
}

/// The lock actor.
///
/// Owns:
/// - `holds`: resource → current holder
/// - `queues`: resource → FIFO of waiters
/// - `owned`: connection → resources it holds (reverse index of `holds`)
/// - `timed_out`: (resource, connection) pairs whose last wait expired
pub struct LockActor {
    receiver: mpsc::Receiver<LockCommand>,

    /// Used by waiter timers to report expiry without keeping the actor alive.
    self_sender: mpsc::WeakSender<LockCommand>,

    settings: LockSettings,
    liveness: Arc<dyn LivenessProbe>,

    holds: HashMap<ResourceId, Hold>,
    queues: HashMap<ResourceId, VecDeque<Waiter>>,
    owned: HashMap<ConnectionId, HashSet<ResourceId>>,
    timed_out: HashSet<(ResourceId, ConnectionId)>,
    next_ticket: u64,

    event_publisher: broadcast::Sender<LockEvent>,
}

impl LockActor {
    pub fn new(
        receiver: mpsc::Receiver<LockCommand>,
        self_sender: mpsc::WeakSender<LockCommand>,
        settings: LockSettings,
        liveness: Arc<dyn LivenessProbe>,
        event_publisher: broadcast::Sender<LockEvent>,
    ) -> Self {
        Self {
            receiver,
            self_sender,
            settings,
            liveness,
            holds: HashMap::new(),
            queues: HashMap::new(),
            owned: HashMap::new(),
            timed_out: HashSet::new(),
            next_ticket: 0,
            event_publisher,
        }
    }

    /// Runs the actor until every handle is dropped.
    pub async fn run(mut self) {
        info!("Lock manager starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(held = self.holds.len(), "Lock manager stopped");
    }

    fn handle_command(&mut self, cmd: LockCommand) {
        match cmd {
            LockCommand::Acquire {
                resource,
                connection,
                timeout,
                respond_to,
            } => {
                self.handle_acquire(resource, connection, timeout, respond_to);
            }
            LockCommand::Release {
                resource,
                connection,
                respond_to,
            } => {
                let released = self.handle_release(&resource, &connection);
                let _ = respond_to.send(released);
            }
            LockCommand::ForceReleaseAllOwnedBy {
                connection,
                respond_to,
            } => {
                let released = self.handle_force_release_all(&connection);
                let _ = respond_to.send(released);
            }
            LockCommand::ExpireWaiter { resource, ticket } => {
                self.handle_expire_waiter(&resource, ticket);
            }
            LockCommand::SweepStale => {
                self.handle_sweep_stale();
            }
            LockCommand::Holder {
                resource,
                respond_to,
            } => {
                let holder = self.holds.get(&resource).map(|h| h.holder.clone());
                let _ = respond_to.send(holder);
            }
            LockCommand::QueueLen {
                resource,
                respond_to,
            } => {
                let len = self.queues.get(&resource).map_or(0, VecDeque::len);
                let _ = respond_to.send(len);
            }
            LockCommand::OwnedBy {
                connection,
                respond_to,
            } => {
                let _ = respond_to.send(self.owned_by(&connection));
            }
            LockCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
        }
    }

    // ------------------------------------------------------------------------
    // Acquire
    // ------------------------------------------------------------------------

    fn handle_acquire(
        &mut self,
        resource: ResourceId,
        connection: ConnectionId,
        timeout: Duration,
        respond_to: oneshot::Sender<Result<Grant, LockError>>,
    ) {
        let now = Instant::now();

        match self.holds.get_mut(&resource) {
            None => {
                self.grant(&resource, &connection, Grant::Immediate, respond_to);
                return;
            }
            Some(hold) if hold.holder == connection => {
                hold.acquired_at = now;
                hold.acquired_wall = Utc::now();
                debug!(resource_id = %resource, connection_id = %connection, "Re-entrant acquire");
                let _ = respond_to.send(Ok(Grant::Reentrant));
                self.publish(LockEvent::Acquired {
                    resource,
                    connection,
                    grant: Grant::Reentrant,
                });
                return;
            }
            Some(_) => {}
        }

        let recover = self
            .holds
            .get(&resource)
            .is_some_and(|hold| self.is_stale_for(&resource, hold, &connection, now));

        if recover {
            self.release_held(&resource, ReleaseReason::Stale);
            if !self.holds.contains_key(&resource) {
                self.grant(&resource, &connection, Grant::Recovered, respond_to);
                return;
            }
        }

        self.enqueue(resource, connection, timeout, respond_to, now);
    }

    /// Decides whether `hold` may be force-released for `requester`.
    ///
    /// The holder must be past the stale threshold and confirmed dead, or past
    /// the hard threshold while the requester has already timed out once on
    /// this resource.
    fn is_stale_for(
        &self,
        resource: &ResourceId,
        hold: &Hold,
        requester: &ConnectionId,
        now: Instant,
    ) -> bool {
        let age = now.saturating_duration_since(hold.acquired_at);

        if age >= self.settings.stale && !self.liveness.is_alive(&hold.holder) {
            return true;
        }

        age >= self.settings.hard_stale
            && self
                .timed_out
                .contains(&(resource.clone(), requester.clone()))
    }

    fn enqueue(
        &mut self,
        resource: ResourceId,
        connection: ConnectionId,
        timeout: Duration,
        respond_to: oneshot::Sender<Result<Grant, LockError>>,
        now: Instant,
    ) {
        let ticket = self.next_ticket;
        self.next_ticket = self.next_ticket.wrapping_add(1);

        let queue = self.queues.entry(resource.clone()).or_default();
        queue.push_back(Waiter {
            ticket,
            connection: connection.clone(),
            requested_at: now,
            respond_to,
        });

        debug!(
            resource_id = %resource,
            connection_id = %connection,
            position = queue.len(),
            "Queued for lock"
        );

        self.schedule_expiry(resource, ticket, now + timeout);
    }

    fn schedule_expiry(&self, resource: ResourceId, ticket: u64, deadline: Instant) {
        let sender = self.self_sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(sender) = sender.upgrade() {
                let _ = sender
                    .send(LockCommand::ExpireWaiter { resource, ticket })
                    .await;
            }
        });
    }

    /// Records `connection` as holder and resolves its caller.
    ///
    /// Returns false (and leaves the resource free) if the caller is gone.
    fn grant(
        &mut self,
        resource: &ResourceId,
        connection: &ConnectionId,
        grant: Grant,
        respond_to: oneshot::Sender<Result<Grant, LockError>>,
    ) -> bool {
        if respond_to.send(Ok(grant)).is_err() {
            debug!(resource_id = %resource, connection_id = %connection, "Grant target gone, skipping");
            return false;
        }

        self.holds.insert(
            resource.clone(),
            Hold {
                holder: connection.clone(),
                acquired_at: Instant::now(),
                acquired_wall: Utc::now(),
            },
        );
        self.owned
            .entry(connection.clone())
            .or_default()
            .insert(resource.clone());
        self.timed_out
            .remove(&(resource.clone(), connection.clone()));

        debug!(resource_id = %resource, connection_id = %connection, grant = ?grant, "Lock granted");
        self.publish(LockEvent::Acquired {
            resource: resource.clone(),
            connection: connection.clone(),
            grant,
        });
        true
    }

    // ------------------------------------------------------------------------
    // Release
    // ------------------------------------------------------------------------

    fn handle_release(&mut self, resource: &ResourceId, connection: &ConnectionId) -> bool {
        match self.holds.get(resource) {
            Some(hold) if &hold.holder == connection => {
                self.release_held(resource, ReleaseReason::Explicit);
                true
            }
            _ => false,
        }
    }

    /// Removes the current hold on `resource` and promotes the next waiter.
    fn release_held(&mut self, resource: &ResourceId, reason: ReleaseReason) {
        let Some(hold) = self.holds.remove(resource) else {
            return;
        };

        if let Some(set) = self.owned.get_mut(&hold.holder) {
            set.remove(resource);
            if set.is_empty() {
                self.owned.remove(&hold.holder);
            }
        }

        match reason {
            ReleaseReason::Stale => warn!(
                resource_id = %resource,
                connection_id = %hold.holder,
                held_for = ?hold.acquired_at.elapsed(),
                "Force-released stale lock"
            ),
            _ => debug!(
                resource_id = %resource,
                connection_id = %hold.holder,
                reason = ?reason,
                "Lock released"
            ),
        }

        self.publish(LockEvent::Released {
            resource: resource.clone(),
            connection: hold.holder,
            reason,
        });

        self.promote_next(resource);
    }

    /// Grants the lock to the earliest waiter whose caller is still listening.
    fn promote_next(&mut self, resource: &ResourceId) {
        loop {
            let Some(waiter) = self.queues.get_mut(resource).and_then(VecDeque::pop_front) else {
                break;
            };

            if self.grant(resource, &waiter.connection, Grant::Promoted, waiter.respond_to) {
                break;
            }
        }

        if self.queues.get(resource).is_some_and(VecDeque::is_empty) {
            self.queues.remove(resource);
        }
    }

    fn handle_force_release_all(&mut self, connection: &ConnectionId) -> Vec<ResourceId> {
        // Drop the connection's own waiters first so promotion cannot pick them.
        for (resource, queue) in self.queues.iter_mut() {
            let mut kept = VecDeque::with_capacity(queue.len());
            for waiter in queue.drain(..) {
                if &waiter.connection == connection {
                    let _ = waiter.respond_to.send(Err(LockError::HolderGone {
                        resource: resource.clone(),
                    }));
                } else {
                    kept.push_back(waiter);
                }
            }
            *queue = kept;
        }
        self.queues.retain(|_, queue| !queue.is_empty());
        self.timed_out.retain(|(_, c)| c != connection);

        let mut released: Vec<ResourceId> = self
            .owned
            .get(connection)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        released.sort();

        for resource in &released {
            self.release_held(resource, ReleaseReason::ConnectionClosed);
        }

        if !released.is_empty() {
            info!(
                connection_id = %connection,
                count = released.len(),
                "Released locks of closed connection"
            );
        }

        released
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    fn handle_expire_waiter(&mut self, resource: &ResourceId, ticket: u64) {
        let Some(queue) = self.queues.get_mut(resource) else {
            return;
        };
        let Some(index) = queue.iter().position(|w| w.ticket == ticket) else {
            // Already granted or cancelled.
            return;
        };
        let Some(waiter) = queue.remove(index) else {
            return;
        };
        if queue.is_empty() {
            self.queues.remove(resource);
        }

        let position = index + 1;
        let waited = waiter.requested_at.elapsed();

        debug!(
            resource_id = %resource,
            connection_id = %waiter.connection,
            position,
            "Lock wait timed out"
        );

        self.timed_out
            .insert((resource.clone(), waiter.connection.clone()));

        let _ = waiter.respond_to.send(Err(LockError::Timeout {
            resource: resource.clone(),
            waited,
            position,
        }));

        self.publish(LockEvent::WaiterExpired {
            resource: resource.clone(),
            connection: waiter.connection,
            position,
        });
    }

    fn handle_sweep_stale(&mut self) {
        let now = Instant::now();
        let stale: Vec<ResourceId> = self
            .holds
            .iter()
            .filter(|(_, hold)| {
                now.saturating_duration_since(hold.acquired_at) >= self.settings.stale
                    && !self.liveness.is_alive(&hold.holder)
            })
            .map(|(resource, _)| resource.clone())
            .collect();

        for resource in stale {
            self.release_held(&resource, ReleaseReason::Stale);
        }
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    fn owned_by(&self, connection: &ConnectionId) -> Vec<ResourceId> {
        let mut resources: Vec<ResourceId> = self
            .owned
            .get(connection)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        resources.sort();
        resources
    }

    fn snapshot(&self) -> Vec<LockSnapshot> {
        let mut locks: Vec<LockSnapshot> = self
            .holds
            .iter()
            .map(|(resource, hold)| LockSnapshot {
                resource: resource.clone(),
                holder: hold.holder.clone(),
                acquired_at: hold.acquired_wall,
                held_for: hold.acquired_at.elapsed(),
                waiters: self
                    .queues
                    .get(resource)
                    .map(|q| q.iter().map(|w| w.connection.clone()).collect())
                    .unwrap_or_default(),
            })
            .collect();
        locks.sort_by(|a, b| a.resource.cmp(&b.resource));
        locks
    }

    fn publish(&self, event: LockEvent) {
        // No subscribers is fine.
        let _ = self.event_publisher.send(event);
    }
}
