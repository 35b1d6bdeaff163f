//! `tillpoint-core`: shared primitives for the offline-first POS client.
//!
//! This crate contains **pure** building blocks (no I/O): identifiers, the
//! resource/operation vocabulary shared by the queue and the API mapping, and
//! the domain error model.

pub mod error;
pub mod id;
pub mod resource;

pub use error::{DomainError, DomainResult};
pub use id::{IdempotencyKey, SyncRunId, local_reference};
pub use resource::{Action, OperationKind, Resource};
