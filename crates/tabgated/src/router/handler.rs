//! Handler interface for external resource operations.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tabgate_core::{ConnectionId, RecordedEvent, ResourceId, SessionPhase};
use tabgate_protocol::MessageKind;
use thiserror::Error;

use crate::session::{AttachOptions, SessionError, SessionHandle};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("no resource resolved for this request")]
    NoResource,

    #[error("{0}")]
    Failed(String),
}

/// What a handler knows about the request it serves.
#[derive(Clone)]
pub struct HandlerContext {
    pub connection: ConnectionId,
    pub kind: MessageKind,
    /// Target resource; always set for kinds that require a lock.
    pub resource: Option<ResourceId>,
    pub sessions: SessionHandle,
}

impl HandlerContext {
    pub fn resource(&self) -> Result<&ResourceId, HandlerError> {
        self.resource.as_ref().ok_or(HandlerError::NoResource)
    }

    /// Attaches a session to the target resource with default options.
    pub async fn ensure_attached(&self) -> Result<SessionPhase, HandlerError> {
        let resource = self.resource()?;
        Ok(self
            .sessions
            .ensure_attached(resource, AttachOptions::default())
            .await?)
    }

    pub async fn ensure_detached(&self) -> Result<SessionPhase, HandlerError> {
        let resource = self.resource()?;
        Ok(self.sessions.ensure_detached(resource).await?)
    }

    pub fn record_event(&self, event: RecordedEvent) -> Result<(), HandlerError> {
        let resource = self.resource()?;
        self.sessions.record_event(resource, event);
        Ok(())
    }
}

/// Performs one kind of request once any required lock is held.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: HandlerContext, payload: Value) -> Result<Value, HandlerError>;
}

/// Handlers keyed by the request kind they serve.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<MessageKind, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: MessageKind, handler: Arc<dyn Handler>) -> &mut Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn get(&self, kind: MessageKind) -> Option<Arc<dyn Handler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
