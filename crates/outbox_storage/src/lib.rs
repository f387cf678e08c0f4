//! # Outbox Storage
//!
//! Ordered key-value storage for the outbox sync queue.
//!
//! This crate provides the lowest-level storage abstraction used by the
//! durable queue. Stores are **opaque byte maps** - they do not interpret
//! the keys or values they hold.
//!
//! ## Design Principles
//!
//! - Keys are ordered bytewise; prefix scans double as secondary indexes
//! - Every write is an atomic batch of puts and deletes
//! - A write that returned `Ok` survives process termination
//! - Must be `Send + Sync` for concurrent access
//!
//! ## Available Stores
//!
//! - [`InMemoryStore`] - For testing and ephemeral queues
//! - [`FileStore`] - Append-only, checksummed log on the local file system
//!
//! ## Example
//!
//! ```rust
//! use outbox_storage::{InMemoryStore, KvStore, WriteBatch};
//!
//! let store = InMemoryStore::new();
//! let mut batch = WriteBatch::new();
//! batch.put(b"op/1".to_vec(), b"first".to_vec());
//! batch.put(b"op/2".to_vec(), b"second".to_vec());
//! store.write(batch).unwrap();
//!
//! let ops = store.scan_prefix(b"op/").unwrap();
//! assert_eq!(ops.len(), 2);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file;
mod memory;
mod record;
mod store;

pub use error::{StorageError, StorageResult};
pub use file::{FileStore, FileStoreOptions, VerifyReport};
pub use memory::InMemoryStore;
pub use record::{compute_crc32, LOG_MAGIC, LOG_VERSION};
pub use store::{BatchOp, KvStore, WriteBatch};
