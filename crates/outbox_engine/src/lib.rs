//! # Outbox Engine
//!
//! Offline-first sync engine: mutations are queued durably while the device
//! is offline and replayed against a remote service once connectivity
//! returns.
//!
//! This crate provides:
//! - [`QueueStore`], the crash-safe ordered queue over any `KvStore`
//! - [`SyncManager`], the single-flight apply loop with retry and conflict
//!   resolution
//! - [`NetworkMonitor`], debounced connectivity triggers
//! - [`StatusReporter`], push-based sync health for UIs
//! - [`RemoteExecutor`], the boundary to the server, plus [`MockExecutor`]
//!
//! ## Architecture
//!
//! ```text
//! enqueue ──▶ QueueStore (persist) ──▶ SyncManager::run ──▶ RemoteExecutor
//!                  ▲                          │
//!                  └── ack / requeue / fail ◀─┤── conflict ──▶ ResolverRegistry
//!                                             └── events ───▶ StatusReporter
//! ```
//!
//! ## Key Invariants
//!
//! - Operations on one entity reach the server in enqueue order
//! - `enqueue` returns only after the operation is durable
//! - An operation leaves the queue only when the server confirms it or it
//!   fails permanently
//! - Operation ids are stable across retries and crashes (idempotency keys)
//!
//! ## Example
//!
//! ```rust,no_run
//! use outbox_engine::{
//!     MockExecutor, NetworkConfig, NetworkMonitor, QueueConfig, QueueStore, SyncConfig,
//!     SyncManager,
//! };
//! use outbox_protocol::SyncOperation;
//! use outbox_storage::{FileStore, FileStoreOptions};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(FileStore::open(Path::new("outbox.log"), FileStoreOptions::default())?);
//! let queue = Arc::new(QueueStore::open(store, QueueConfig::default())?);
//! let network = Arc::new(NetworkMonitor::new(NetworkConfig::default(), true));
//! let manager = Arc::new(SyncManager::new(
//!     SyncConfig::default(),
//!     queue,
//!     Arc::new(MockExecutor::new()),
//!     network,
//! ));
//!
//! manager.enqueue(SyncOperation::create("resident", "1", serde_json::json!({"name": "Ada"})))?;
//! let _driver = manager.spawn();
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod executor;
mod manager;
mod network;
mod queue;
mod status;

pub use config::{CapacityPolicy, NetworkConfig, QueueConfig, RetryConfig, SyncConfig};
pub use error::{ErrorClass, SyncError, SyncResult};
pub use executor::{MockExecutor, RemoteExecutor};
pub use manager::{CycleSummary, OperationOutcome, OperationReport, SyncManager};
pub use network::{NetworkMonitor, TriggerReason, TriggerStream};
pub use queue::{QueueCounts, QueueSnapshot, QueueStore};
pub use status::{StatusReporter, SyncEvent, SyncStatus, DEFAULT_EVENT_BUFFER_SIZE};
