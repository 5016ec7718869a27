//! Request routing.
//!
//! For each inbound request the router resolves the handler and the target
//! resource, holds the resource lock around lock-requiring kinds, and sends
//! exactly one correlated response back to the connection generation that
//! asked.
//!
//! Requests from one connection for one resource take turns: the next one
//! starts only after the previous one released its lock. Without that, two
//! overlapping requests from the same connection would share one lock and
//! the first to finish would release it under the second.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tabgate_core::{ConnectionId, ResourceId, TabgateConfig};
use tabgate_protocol::{Envelope, ErrorBody, ErrorCode, MessageKind, Response};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod handler;

pub use handler::{Handler, HandlerContext, HandlerError, HandlerRegistry};

use crate::locks::{LockError, LockHandle};
use crate::registry::{InboundRequest, RegistryEvent, RegistryHandle};
use crate::session::{SessionError, SessionHandle};

// ============================================================================
// Router Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("resource {resource} is busy: {source}")]
    ResourceBusy {
        resource: ResourceId,
        position: Option<usize>,
        source: LockError,
    },

    #[error("{0} requires a resourceId or tabId")]
    MissingResource(MessageKind),

    #[error(transparent)]
    Session(SessionError),

    #[error("handler failed: {0}")]
    Handler(HandlerError),
}

impl RouterError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownMessageType(_) => ErrorCode::UnknownMessageType,
            Self::ResourceBusy { .. } => ErrorCode::ResourceBusy,
            Self::MissingResource(_) => ErrorCode::MissingResource,
            Self::Session(e) | Self::Handler(HandlerError::Session(e)) => session_code(e),
            Self::Handler(_) => ErrorCode::HandlerFailed,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        let position = match self {
            Self::ResourceBusy { position, .. } => *position,
            _ => None,
        };
        ErrorBody::new(self.code(), self.to_string()).with_queue_position(position)
    }
}

fn session_code(e: &SessionError) -> ErrorCode {
    match e {
        SessionError::AttachFailed { .. } => ErrorCode::SessionAttachFailed,
        SessionError::DetachFailed { .. } => ErrorCode::SessionDetachFailed,
        SessionError::InvalidTransition { .. } => ErrorCode::InvalidStateTransition,
        SessionError::ChannelClosed => ErrorCode::HandlerFailed,
    }
}

impl From<HandlerError> for RouterError {
    fn from(e: HandlerError) -> Self {
        match e {
            HandlerError::Session(e) => Self::Session(e),
            other => Self::Handler(other),
        }
    }
}

// ============================================================================
// Router
// ============================================================================

struct RouterInner {
    handlers: HandlerRegistry,
    locks: LockHandle,
    sessions: SessionHandle,
    lock_timeout: Duration,
    /// Resource each connection addressed most recently.
    last_used: Mutex<HashMap<ConnectionId, ResourceId>>,
    turns: Mutex<HashMap<TurnKey, Arc<AsyncMutex<()>>>>,
}

type TurnKey = (ConnectionId, ResourceId);

impl RouterInner {
    fn lock_turns(&self) -> std::sync::MutexGuard<'_, HashMap<TurnKey, Arc<AsyncMutex<()>>>> {
        self.turns
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A connection's exclusive turn on a resource; dropping it lets the next
/// request from the same connection in.
struct Turn {
    inner: Arc<RouterInner>,
    key: TurnKey,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for Turn {
    fn drop(&mut self) {
        let mut turns = self.inner.lock_turns();
        // The map and our guard are the only owners: nobody is waiting.
        if turns
            .get(&self.key)
            .is_some_and(|slot| Arc::strong_count(slot) == 2)
        {
            turns.remove(&self.key);
        }
    }
}

/// Cheap-to-clone request router.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    pub fn new(
        handlers: HandlerRegistry,
        locks: LockHandle,
        sessions: SessionHandle,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                handlers,
                locks,
                sessions,
                lock_timeout,
                last_used: Mutex::new(HashMap::new()),
                turns: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn from_config(
        handlers: HandlerRegistry,
        locks: LockHandle,
        sessions: SessionHandle,
        config: &TabgateConfig,
    ) -> Self {
        Self::new(handlers, locks, sessions, config.lock_timeout())
    }

    /// Handles one request and builds its response.
    pub async fn dispatch(&self, connection: &ConnectionId, envelope: Envelope) -> Response {
        let id = envelope.id.clone();
        let wire_kind = envelope.kind.clone();

        match self.route(connection, envelope).await {
            Ok(payload) => Response::success(id, wire_kind, payload),
            Err(e) => {
                debug!(connection_id = %connection, kind = %wire_kind, error = %e, "Request failed");
                Response::failure(id, e.to_body())
            }
        }
    }

    async fn route(
        &self,
        connection: &ConnectionId,
        envelope: Envelope,
    ) -> Result<serde_json::Value, RouterError> {
        let kind = MessageKind::from_wire(&envelope.kind)
            .ok_or_else(|| RouterError::UnknownMessageType(envelope.kind.clone()))?;
        let handler = self
            .inner
            .handlers
            .get(kind)
            .ok_or_else(|| RouterError::UnknownMessageType(envelope.kind.clone()))?;

        let resource = self.resolve_resource(connection, &envelope);

        let (lock, _turn) = if kind.requires_lock() {
            let resource = resource.clone().ok_or(RouterError::MissingResource(kind))?;
            let turn = self.take_turn(connection, &resource).await;
            let grant = self
                .inner
                .locks
                .acquire(resource.clone(), connection.clone(), self.inner.lock_timeout)
                .await
                .map_err(|e| RouterError::ResourceBusy {
                    resource: resource.clone(),
                    position: e.queue_position(),
                    source: e,
                })?;
            // A lock taken outside the router stays with whoever took it.
            ((!grant.is_reentrant()).then_some(resource), Some(turn))
        } else {
            (None, None)
        };

        let ctx = HandlerContext {
            connection: connection.clone(),
            kind,
            resource,
            sessions: self.inner.sessions.clone(),
        };

        // Run on its own task so a panicking handler still releases the lock.
        let result = tokio::spawn(async move { handler.handle(ctx, envelope.payload).await })
            .await
            .unwrap_or_else(|e| Err(HandlerError::Failed(format!("handler aborted: {e}"))));

        if let Some(resource) = lock {
            if !self.inner.locks.release(resource.clone(), connection.clone()).await {
                debug!(connection_id = %connection, resource_id = %resource, "Lock already gone at release");
            }
        }

        result.map_err(RouterError::from)
    }

    async fn take_turn(&self, connection: &ConnectionId, resource: &ResourceId) -> Turn {
        let key = (connection.clone(), resource.clone());
        let slot = Arc::clone(self.inner.lock_turns().entry(key.clone()).or_default());
        Turn {
            inner: Arc::clone(&self.inner),
            key,
            _guard: slot.lock_owned().await,
        }
    }

    /// Explicit `resourceId`/`tabId` wins and becomes the connection's
    /// last-used resource; otherwise the last-used resource is reused.
    fn resolve_resource(&self, connection: &ConnectionId, envelope: &Envelope) -> Option<ResourceId> {
        let mut last_used = self.lock_last_used();
        match envelope.resource_hint() {
            Some(resource) => {
                last_used.insert(connection.clone(), resource.clone());
                Some(resource)
            }
            None => last_used.get(connection).cloned(),
        }
    }

    /// Drops per-connection routing state.
    pub fn forget(&self, connection: &ConnectionId) {
        self.lock_last_used().remove(connection);
    }

    /// Resource `connection` addressed most recently.
    pub fn last_used(&self, connection: &ConnectionId) -> Option<ResourceId> {
        self.lock_last_used().get(connection).cloned()
    }

    fn lock_last_used(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, ResourceId>> {
        self.inner
            .last_used
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Dispatches a request and delivers the response to the same
    /// connection generation; a closed or replaced connection drops it.
    pub async fn serve(&self, registry: &RegistryHandle, request: InboundRequest) {
        let response = self.dispatch(&request.connection, request.envelope).await;

        if let Err(e) = registry
            .send_to(&request.connection, request.epoch, &response)
            .await
        {
            debug!(
                connection_id = %request.connection,
                epoch = request.epoch,
                error = %e,
                "Dropping response"
            );
        }
    }
}

/// Spawn the dispatcher: every inbound request is served on its own task so
/// lock waits never block other requests.
pub fn spawn_router(
    router: Router,
    registry: RegistryHandle,
    mut inbound: mpsc::Receiver<InboundRequest>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Router starting");
        let mut events = registry.subscribe();
        let mut events_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Router stopping: cancelled");
                    break;
                }
                request = inbound.recv() => {
                    let Some(request) = request else {
                        debug!("Router stopping: inbound channel closed");
                        break;
                    };
                    let router = router.clone();
                    let registry = registry.clone();
                    tokio::spawn(async move { router.serve(&registry, request).await });
                }
                event = events.recv(), if events_open => {
                    match event {
                        Ok(RegistryEvent::Closed { id, .. }) => router.forget(&id),
                        Ok(RegistryEvent::Opened { .. }) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "Router lagged on registry events");
                        }
                        Err(broadcast::error::RecvError::Closed) => events_open = false,
                    }
                }
            }
        }

        info!("Router stopped");
    })
}
