//! # Outbox Protocol
//!
//! Shared types for the outbox sync engine.
//!
//! This crate provides:
//! - `SyncOperation`, the queued mutation and its persisted record shape
//! - `ExecuteResponse`, the contract with the remote operation executor
//! - Conflict resolution strategies and the per-entity-type registry
//!
//! This is a pure crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod error;
mod operation;
mod response;

pub use conflict::{
    ConflictContext, ConflictPolicy, ConflictResolver, Resolution, ResolutionStrategy,
    ResolverDecision, ResolverRegistry, UPDATED_AT_FIELD,
};
pub use error::{ProtocolError, ProtocolResult};
pub use operation::{OperationId, OperationStatus, OperationType, Priority, SyncOperation};
pub use response::{ExecuteResponse, ExecuteStatus};
