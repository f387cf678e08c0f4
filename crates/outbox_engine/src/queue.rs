//! Durable operation queue.
//!
//! The queue is the single source of truth for pending work. It keeps an
//! in-memory index of the active operations and mirrors every change to a
//! [`KvStore`] in one atomic batch before the change becomes visible.
//!
//! ## Key layout
//!
//! | Key | Value |
//! |-----|-------|
//! | `op/<sequence:020>` | active operation (JSON record) |
//! | `dead/<sequence:020>` | dead letter (JSON record, status `Failed`) |
//! | `meta/next_seq` | next sequence number (decimal) |
//!
//! Zero-padded sequences make byte order equal to enqueue order, so a
//! prefix scan reconstructs the queue in order.

use crate::config::QueueConfig;
use crate::error::{SyncError, SyncResult};
use outbox_protocol::{OperationId, OperationStatus, Priority, SyncOperation};
use outbox_storage::{KvStore, StorageError, WriteBatch};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const OP_PREFIX: &str = "op/";
const DEAD_PREFIX: &str = "dead/";
const NEXT_SEQ_KEY: &[u8] = b"meta/next_seq";

/// Ordered snapshot of the active operations.
pub type QueueSnapshot = Vec<SyncOperation>;

/// Operation counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    /// Operations waiting to be dispatched.
    pub pending: usize,
    /// Operations handed to the executor.
    pub in_flight: usize,
    /// Dead letters.
    pub failed: usize,
}

impl QueueCounts {
    /// Pending plus in-flight.
    pub fn active(&self) -> usize {
        self.pending + self.in_flight
    }
}

#[derive(Default)]
struct QueueState {
    /// Active operations by sequence.
    active: BTreeMap<u64, SyncOperation>,
    /// Operation id to sequence.
    index: HashMap<OperationId, u64>,
    /// Backoff deadlines. Not persisted: a restart retries immediately.
    backoff: HashMap<OperationId, Instant>,
    /// Dead letters by sequence.
    dead: BTreeMap<u64, SyncOperation>,
    next_seq: u64,
}

impl QueueState {
    fn get(&self, id: &OperationId) -> Option<&SyncOperation> {
        self.index.get(id).and_then(|seq| self.active.get(seq))
    }

    fn get_mut(&mut self, id: &OperationId) -> Option<&mut SyncOperation> {
        let seq = *self.index.get(id)?;
        self.active.get_mut(&seq)
    }

    fn remove(&mut self, id: &OperationId) -> Option<SyncOperation> {
        let seq = self.index.remove(id)?;
        self.backoff.remove(id);
        self.active.remove(&seq)
    }

    fn insert(&mut self, op: SyncOperation) {
        self.index.insert(op.id, op.sequence);
        self.active.insert(op.sequence, op);
    }
}

/// Crash-safe, ordered store of pending operations.
///
/// Ordering: operations of one entity (`entity_type` + `entity_id`) are
/// dispatched strictly in enqueue order; across entities the most urgent
/// priority goes first, ties broken by enqueue order.
pub struct QueueStore {
    store: Arc<dyn KvStore>,
    config: QueueConfig,
    state: Mutex<QueueState>,
}

impl QueueStore {
    /// Opens a queue over `store`, recovering any persisted operations.
    ///
    /// Operations persisted as in flight were interrupted by a crash and are
    /// reset to pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or holds an undecodable
    /// record.
    pub fn open(store: Arc<dyn KvStore>, config: QueueConfig) -> SyncResult<Self> {
        let mut state = QueueState::default();
        let mut highest = 0u64;
        let mut recovered = WriteBatch::new();

        for (key, value) in store.scan_prefix(OP_PREFIX.as_bytes())? {
            let mut op = SyncOperation::from_record(&value)?;
            check_key(&key, OP_PREFIX, op.sequence)?;
            if op.status == OperationStatus::InFlight {
                debug!(op_id = %op.id, entity = %op.entity_key(), "recovering in-flight operation");
                op.status = OperationStatus::Pending;
                recovered.put(key, op.to_record()?);
            }
            highest = highest.max(op.sequence);
            state.insert(op);
        }

        for (key, value) in store.scan_prefix(DEAD_PREFIX.as_bytes())? {
            let op = SyncOperation::from_record(&value)?;
            check_key(&key, DEAD_PREFIX, op.sequence)?;
            highest = highest.max(op.sequence);
            state.dead.insert(op.sequence, op);
        }

        let stored_next = match store.get(NEXT_SEQ_KEY)? {
            Some(bytes) => parse_seq(&bytes)?,
            None => 1,
        };
        state.next_seq = stored_next.max(highest + 1);

        if !recovered.is_empty() {
            info!(count = recovered.len(), "reset interrupted operations to pending");
            store.write(recovered)?;
        }

        debug!(
            active = state.active.len(),
            dead = state.dead.len(),
            next_seq = state.next_seq,
            "queue opened"
        );

        Ok(Self {
            store,
            config,
            state: Mutex::new(state),
        })
    }

    /// Returns the queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Durably appends an operation and returns its id.
    ///
    /// The operation is stored as pending with a fresh sequence number and
    /// no attempts; the call returns only after the write is crash-safe.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::CapacityExceeded`] if the queue is full or the
    /// backing store has no room left.
    pub fn enqueue(&self, mut op: SyncOperation) -> SyncResult<OperationId> {
        let mut state = self.state.lock();

        let pending = state.active.len();
        if pending >= self.config.max_pending {
            return Err(SyncError::CapacityExceeded {
                pending,
                limit: self.config.max_pending,
            });
        }

        op.sequence = state.next_seq;
        op.status = OperationStatus::Pending;
        op.attempt_count = 0;
        op.last_error = None;

        let mut batch = WriteBatch::new();
        batch.put(op_key(op.sequence), op.to_record()?);
        batch.put(NEXT_SEQ_KEY, (op.sequence + 1).to_string());
        self.write(batch, pending)?;

        debug!(
            op_id = %op.id,
            entity = %op.entity_key(),
            seq = op.sequence,
            priority = %op.priority,
            "enqueued"
        );

        let id = op.id;
        state.next_seq += 1;
        state.insert(op);
        Ok(id)
    }

    /// Marks the next eligible operation in flight and returns it.
    ///
    /// Eligible means pending, outside its backoff window, and the oldest
    /// active operation of its entity. The dispatch is persisted and counts
    /// as an attempt. The operation stays in the queue until it is acked,
    /// requeued or failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the status change cannot be persisted.
    pub fn dequeue_next(&self) -> SyncResult<Option<SyncOperation>> {
        let mut state = self.state.lock();
        let now = Instant::now();

        let mut seen: HashSet<(&str, &str)> = HashSet::new();
        let mut best: Option<&SyncOperation> = None;
        for op in state.active.values() {
            // Only the head of each entity's chain may run
            if !seen.insert((op.entity_type.as_str(), op.entity_id.as_str())) {
                continue;
            }
            if op.status != OperationStatus::Pending {
                continue;
            }
            if state.backoff.get(&op.id).is_some_and(|until| *until > now) {
                continue;
            }
            if best.map_or(true, |b| op.priority.outranks(b.priority)) {
                best = Some(op);
            }
        }

        let Some(mut op) = best.cloned() else {
            return Ok(None);
        };
        op.status = OperationStatus::InFlight;
        op.attempt_count += 1;
        self.store.put(&op_key(op.sequence), &op.to_record()?)?;

        debug!(op_id = %op.id, entity = %op.entity_key(), attempt = op.attempt_count, "dispatching");

        state.backoff.remove(&op.id);
        state.insert(op.clone());
        Ok(Some(op))
    }

    /// Removes a completed operation. Returns false if it was not queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the removal cannot be persisted.
    pub fn ack(&self, id: OperationId) -> SyncResult<bool> {
        let mut state = self.state.lock();
        let Some(seq) = state.index.get(&id).copied() else {
            return Ok(false);
        };

        self.store.delete(&op_key(seq))?;
        state.remove(&id);
        debug!(op_id = %id, "acked");
        Ok(true)
    }

    /// Returns an operation to pending after a failed attempt.
    ///
    /// The operation keeps its sequence, so it keeps its place relative to
    /// the rest of the queue. It is not dispatched again before `delay` has
    /// elapsed. Returns false if the operation is not queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the change cannot be persisted.
    pub fn requeue(&self, id: OperationId, error: &str, delay: Duration) -> SyncResult<bool> {
        let mut state = self.state.lock();
        let Some(mut op) = state.get(&id).cloned() else {
            return Ok(false);
        };

        op.status = OperationStatus::Pending;
        op.last_error = Some(error.to_string());
        self.store.put(&op_key(op.sequence), &op.to_record()?)?;

        debug!(op_id = %id, attempt = op.attempt_count, ?delay, "requeued");

        state.insert(op);
        if delay.is_zero() {
            state.backoff.remove(&id);
        } else {
            state.backoff.insert(id, Instant::now() + delay);
        }
        Ok(true)
    }

    /// Returns an in-flight operation to pending without touching the store.
    ///
    /// Used when the outcome of a dispatch could not be persisted. The stored
    /// record still says in flight, which recovery treats as pending too.
    /// Returns false if the operation is not in flight.
    pub fn release(&self, id: OperationId) -> bool {
        let mut state = self.state.lock();
        match state.get_mut(&id) {
            Some(op) if op.status == OperationStatus::InFlight => {
                op.status = OperationStatus::Pending;
                warn!(op_id = %id, "released in-flight operation");
                true
            }
            _ => false,
        }
    }

    /// Replaces the payload and base version of a queued operation, as
    /// decided by conflict resolution.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotFound`] if the operation is not queued.
    pub fn rewrite(
        &self,
        id: OperationId,
        payload: Option<Value>,
        base_version: Option<u64>,
    ) -> SyncResult<SyncOperation> {
        let mut state = self.state.lock();
        let mut op = state.get(&id).cloned().ok_or(SyncError::NotFound(id))?;

        op.payload = payload;
        op.base_version = base_version;
        self.store.put(&op_key(op.sequence), &op.to_record()?)?;

        if let Some(slot) = state.get_mut(&id) {
            *slot = op.clone();
        }
        Ok(op)
    }

    /// Moves an operation to the dead-letter view with status `Failed`.
    ///
    /// Returns the failed operation, or `None` if it was not queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the move cannot be persisted.
    pub fn fail(&self, id: OperationId, error: &str) -> SyncResult<Option<SyncOperation>> {
        let mut state = self.state.lock();
        self.fail_locked(&mut state, id, error)
    }

    fn fail_locked(
        &self,
        state: &mut QueueState,
        id: OperationId,
        error: &str,
    ) -> SyncResult<Option<SyncOperation>> {
        let Some(mut op) = state.get(&id).cloned() else {
            return Ok(None);
        };
        op.status = OperationStatus::Failed;
        op.last_error = Some(error.to_string());

        let mut batch = WriteBatch::new();
        batch.delete(op_key(op.sequence));
        let keep = self.config.dead_letter_capacity > 0;
        if keep {
            batch.put(dead_key(op.sequence), op.to_record()?);
        }

        // Evict the oldest dead letters beyond capacity
        let excess = (state.dead.len() + 1).saturating_sub(self.config.dead_letter_capacity);
        let evicted: Vec<u64> = state.dead.keys().take(excess).copied().collect();
        for seq in &evicted {
            batch.delete(dead_key(*seq));
        }
        self.store.write(batch)?;

        warn!(op_id = %id, entity = %op.entity_key(), error, "operation failed permanently");

        state.remove(&id);
        for seq in evicted {
            state.dead.remove(&seq);
        }
        if keep {
            state.dead.insert(op.sequence, op.clone());
        }
        Ok(Some(op))
    }

    /// Removes a pending operation before it is dispatched.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotFound`] for unknown ids and
    /// [`SyncError::InFlight`] if the operation is being executed.
    pub fn cancel(&self, id: OperationId) -> SyncResult<SyncOperation> {
        let mut state = self.state.lock();
        let op = state.get(&id).ok_or(SyncError::NotFound(id))?;
        if op.status == OperationStatus::InFlight {
            return Err(SyncError::InFlight(id));
        }

        self.store.delete(&op_key(op.sequence))?;
        info!(op_id = %id, "cancelled");
        state.remove(&id).ok_or(SyncError::NotFound(id))
    }

    /// Evicts the newest pending operation of the lowest priority strictly
    /// below `than`, moving it to the dead-letter view.
    ///
    /// # Errors
    ///
    /// Returns an error if the move cannot be persisted.
    pub fn evict_lowest_priority(&self, than: Priority) -> SyncResult<Option<SyncOperation>> {
        let mut state = self.state.lock();
        let victim = state
            .active
            .values()
            .filter(|op| op.status == OperationStatus::Pending && than.outranks(op.priority))
            .max_by_key(|op| (op.priority, op.sequence))
            .map(|op| op.id);

        match victim {
            Some(id) => self.fail_locked(&mut state, id, "evicted: queue at capacity"),
            None => Ok(None),
        }
    }

    /// Returns the active operations in enqueue order.
    pub fn list(&self) -> QueueSnapshot {
        self.state.lock().active.values().cloned().collect()
    }

    /// Returns a queued operation by id.
    pub fn get(&self, id: OperationId) -> Option<SyncOperation> {
        self.state.lock().get(&id).cloned()
    }

    /// Returns operation counts by state.
    pub fn counts(&self) -> QueueCounts {
        let state = self.state.lock();
        let in_flight = state
            .active
            .values()
            .filter(|op| op.status == OperationStatus::InFlight)
            .count();
        QueueCounts {
            pending: state.active.len() - in_flight,
            in_flight,
            failed: state.dead.len(),
        }
    }

    /// Returns true if any operation is waiting to be dispatched.
    pub fn has_pending(&self) -> bool {
        self.state
            .lock()
            .active
            .values()
            .any(|op| op.status == OperationStatus::Pending)
    }

    /// Returns the earliest future backoff deadline, if any.
    pub fn next_wakeup(&self) -> Option<Instant> {
        let state = self.state.lock();
        let now = Instant::now();
        state
            .backoff
            .iter()
            .filter(|(id, until)| {
                **until > now
                    && state
                        .get(id)
                        .is_some_and(|op| op.status == OperationStatus::Pending)
            })
            .map(|(_, until)| *until)
            .min()
    }

    /// Returns the dead letters, oldest first.
    pub fn dead_letters(&self) -> Vec<SyncOperation> {
        self.state.lock().dead.values().cloned().collect()
    }

    /// Moves a dead letter back to the tail of the queue with its attempts
    /// reset. The operation keeps its id.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotFound`] if there is no such dead letter and
    /// [`SyncError::CapacityExceeded`] if the queue is full.
    pub fn retry_dead_letter(&self, id: OperationId) -> SyncResult<OperationId> {
        let mut state = self.state.lock();
        let old_seq = state
            .dead
            .values()
            .find(|op| op.id == id)
            .map(|op| op.sequence)
            .ok_or(SyncError::NotFound(id))?;

        let pending = state.active.len();
        if pending >= self.config.max_pending {
            return Err(SyncError::CapacityExceeded {
                pending,
                limit: self.config.max_pending,
            });
        }

        let mut op = state.dead.get(&old_seq).cloned().ok_or(SyncError::NotFound(id))?;
        op.sequence = state.next_seq;
        op.status = OperationStatus::Pending;
        op.attempt_count = 0;
        op.last_error = None;

        let mut batch = WriteBatch::new();
        batch.delete(dead_key(old_seq));
        batch.put(op_key(op.sequence), op.to_record()?);
        batch.put(NEXT_SEQ_KEY, (op.sequence + 1).to_string());
        self.write(batch, pending)?;

        info!(op_id = %id, seq = op.sequence, "dead letter re-enqueued");

        state.dead.remove(&old_seq);
        state.next_seq += 1;
        state.insert(op);
        Ok(id)
    }

    /// Deletes every dead letter and returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the deletion cannot be persisted.
    pub fn purge_dead_letters(&self) -> SyncResult<usize> {
        let mut state = self.state.lock();
        if state.dead.is_empty() {
            return Ok(0);
        }

        let mut batch = WriteBatch::new();
        for seq in state.dead.keys() {
            batch.delete(dead_key(*seq));
        }
        self.store.write(batch)?;

        let purged = state.dead.len();
        state.dead.clear();
        info!(purged, "dead letters purged");
        Ok(purged)
    }

    fn write(&self, batch: WriteBatch, pending: usize) -> SyncResult<()> {
        match self.store.write(batch) {
            Err(StorageError::Full { used, limit }) => {
                warn!(used, limit, "queue storage is full");
                Err(SyncError::CapacityExceeded {
                    pending,
                    limit: self.config.max_pending,
                })
            }
            other => Ok(other?),
        }
    }
}

impl std::fmt::Debug for QueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueStore")
            .field("config", &self.config)
            .field("counts", &self.counts())
            .finish_non_exhaustive()
    }
}

fn op_key(seq: u64) -> Vec<u8> {
    format!("{OP_PREFIX}{seq:020}").into_bytes()
}

fn dead_key(seq: u64) -> Vec<u8> {
    format!("{DEAD_PREFIX}{seq:020}").into_bytes()
}

fn parse_seq(bytes: &[u8]) -> SyncResult<u64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| SyncError::permanent("corrupt sequence counter"))
}

fn check_key(key: &[u8], prefix: &str, seq: u64) -> SyncResult<()> {
    let stored = parse_seq(&key[prefix.len()..])?;
    if stored != seq {
        return Err(SyncError::permanent(format!(
            "record under sequence {stored} claims sequence {seq}"
        )));
    }
    Ok(())
}
