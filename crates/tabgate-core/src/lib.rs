//! tabgate core - shared types for the tab coordinator
//!
//! This crate provides the identifiers, lifecycle states, bounded event
//! buffer and configuration shared between the wire protocol and the
//! coordinator daemon (tabgated).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod config;
pub mod error;
pub mod ids;
pub mod ring;
pub mod state;

// Re-exports for convenience
pub use config::{default_config_path, TabgateConfig, CONFIG_ENV_VAR};
pub use error::{ConfigError, ConfigResult};
pub use ids::{ConnectionId, Endpoint, ResourceId};
pub use ring::{EventRing, RecordedEvent, DEFAULT_EVENT_CAPACITY};
pub use state::{ConnectionState, SessionPhase};
