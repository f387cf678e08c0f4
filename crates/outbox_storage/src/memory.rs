//! In-memory store for testing.

use crate::error::{StorageError, StorageResult};
use crate::store::{BatchOp, KvStore, WriteBatch};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// An in-memory key-value store.
///
/// This store keeps everything in a `BTreeMap` and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral queues that don't need persistence
///
/// An optional key limit makes it possible to exercise capacity handling
/// without touching the file system.
///
/// # Example
///
/// ```rust
/// use outbox_storage::{InMemoryStore, KvStore};
///
/// let store = InMemoryStore::new();
/// store.put(b"k", b"v").unwrap();
/// assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    max_keys: Option<usize>,
}

impl InMemoryStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that refuses writes growing it past `max_keys`.
    #[must_use]
    pub fn with_max_keys(max_keys: usize) -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            max_keys: Some(max_keys),
        }
    }

    /// Returns a copy of every entry.
    ///
    /// Useful for testing and debugging.
    #[must_use]
    pub fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.data
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Removes every key.
    pub fn clear(&self) {
        self.data.write().clear();
    }
}

impl KvStore for InMemoryStore {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn write(&self, batch: WriteBatch) -> StorageResult<()> {
        let mut data = self.data.write();

        if let Some(limit) = self.max_keys {
            // Simulate the batch against a copy of the key set first so a
            // rejected batch leaves nothing behind.
            let mut projected = data.len();
            let mut touched = BTreeMap::new();
            for op in batch.ops() {
                let existed = *touched
                    .entry(op.key().to_vec())
                    .or_insert_with(|| data.contains_key(op.key()));
                match op {
                    BatchOp::Put { .. } if !existed => projected += 1,
                    BatchOp::Delete { .. } if existed => projected -= 1,
                    _ => {}
                }
                touched.insert(op.key().to_vec(), matches!(op, BatchOp::Put { .. }));
            }
            if projected > limit {
                return Err(StorageError::Full {
                    used: data.len() as u64,
                    limit: limit as u64,
                });
            }
        }

        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let data = self.data.read();
        Ok(data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn len(&self) -> usize {
        self.data.read().len()
    }
}
