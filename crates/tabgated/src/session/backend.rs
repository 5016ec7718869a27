//! External attach/detach operations.

use async_trait::async_trait;
use tabgate_core::ResourceId;
use thiserror::Error;
use tracing::info;

/// Debugger protocol version requested on attach.
pub const DEFAULT_PROTOCOL_VERSION: &str = "1.3";

/// Options passed through to the backend on attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachOptions {
    pub protocol_version: String,
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self {
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The resource already has a session attached. Treated as success on attach.
    #[error("already attached")]
    AlreadyAttached,

    /// The resource has no session attached. Treated as success on detach.
    #[error("not attached")]
    NotAttached,

    #[error("{0}")]
    Failed(String),
}

/// Performs the real attach/detach against a resource.
///
/// Calls for one resource never overlap; the session worker serializes them.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn attach(&self, resource: &ResourceId, options: &AttachOptions) -> Result<(), BackendError>;

    async fn detach(&self, resource: &ResourceId) -> Result<(), BackendError>;
}

/// Backend that only logs. Used when no embedder supplies one.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBackend;

#[async_trait]
impl SessionBackend for NoopBackend {
    async fn attach(&self, resource: &ResourceId, options: &AttachOptions) -> Result<(), BackendError> {
        info!(resource_id = %resource, protocol = %options.protocol_version, "Attach (noop)");
        Ok(())
    }

    async fn detach(&self, resource: &ResourceId) -> Result<(), BackendError> {
        info!(resource_id = %resource, "Detach (noop)");
        Ok(())
    }
}
