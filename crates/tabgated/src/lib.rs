//! tabgated - multi-client coordination for exclusive resources
//!
//! This crate provides the coordinator that lets several controllers share
//! a small pool of exclusive, stateful resources (browser tabs with an
//! attached debugging session):
//! - `registry` - Connection discovery, handshake, heartbeat and close handling
//! - `locks` - Per-resource exclusive locks with FIFO waiters and stale recovery
//! - `session` - Per-resource attach/detach state machine with an event buffer
//! - `router` - Request dispatch with lock acquisition around handlers
//! - `coordinator` - Wires the components together
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          tabgated                                │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌────────────────┐  InboundRequest  ┌──────────────┐            │
//! │  │ RegistryActor  │─────────────────▶│    Router    │            │
//! │  │ (connections)  │◀─────────────────│  (dispatch)  │            │
//! │  └───────┬────────┘   send_to(epoch) └──────┬───────┘            │
//! │          │ on close                         │ acquire/release    │
//! │          ▼                                  ▼                    │
//! │  ┌────────────────┐                  ┌──────────────┐            │
//! │  │ SessionWorkers │◀── ensure_* ─────│  LockActor   │            │
//! │  │ (per resource) │   (handlers)     │ (FIFO locks) │            │
//! │  └────────────────┘                  └──────────────┘            │
//! │                                                                  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! Production code follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod backoff;
pub mod coordinator;
pub mod locks;
pub mod registry;
pub mod router;
pub mod session;

pub use coordinator::Coordinator;
