//! Sync manager.
//!
//! Drains the durable queue through a [`RemoteExecutor`] while online.
//!
//! ## Per-operation state machine
//!
//! ```text
//! Pending ──dequeue──▶ InFlight ──applied──────────────────────▶ Done
//!    ▲                    │
//!    │                    ├─conflict─▶ resolver ─client/merged─▶ InFlight (once)
//!    │                    │                    ├─server-wins───▶ Done
//!    │                    │                    └─abort─────────▶ Failed
//!    └──backoff───────────┼─transient (attempts left)
//!                         └─permanent / validation / exhausted ▶ Failed
//! ```
//!
//! ## Guarantees
//!
//! - At most one apply loop per manager; a reentrant `run` is a no-op
//! - At most one in-flight operation per entity
//! - An operation is acked only after the executor confirms it
//! - The queue lock is never held across an executor call

use crate::config::{CapacityPolicy, SyncConfig};
use crate::error::{ErrorClass, SyncError, SyncResult};
use crate::executor::RemoteExecutor;
use crate::network::NetworkMonitor;
use crate::queue::QueueStore;
use crate::status::{StatusReporter, SyncEvent, SyncStatus};
use outbox_protocol::{
    ConflictContext, ExecuteStatus, OperationId, OperationStatus, ResolutionStrategy,
    ResolverDecision, ResolverRegistry, SyncOperation,
};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

/// Terminal outcome of one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    /// The server applied the operation.
    Applied,
    /// A conflict was resolved and the result applied (or discarded in
    /// favor of the server).
    Resolved(ResolutionStrategy),
    /// The operation was moved to the dead-letter view.
    FailedPermanently {
        /// Why it failed.
        error: String,
    },
    /// The operation went back to the queue and will be retried.
    FailedRetryable {
        /// Why the attempt failed.
        error: String,
        /// Backoff before the next attempt.
        retry_in: Duration,
    },
}

impl OperationOutcome {
    /// Returns the error text for failed outcomes.
    pub fn error(&self) -> Option<&str> {
        match self {
            OperationOutcome::FailedPermanently { error }
            | OperationOutcome::FailedRetryable { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Returns the status the operation is left in.
    pub fn status(&self) -> OperationStatus {
        match self {
            OperationOutcome::Applied | OperationOutcome::Resolved(_) => OperationStatus::Done,
            OperationOutcome::FailedPermanently { .. } => OperationStatus::Failed,
            OperationOutcome::FailedRetryable { .. } => OperationStatus::Pending,
        }
    }
}

/// Outcome of one dispatch together with the operation it concerns.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationReport {
    /// Operation id.
    pub op_id: OperationId,
    /// Entity type.
    pub entity_type: String,
    /// Entity id.
    pub entity_id: String,
    /// Attempt number of this dispatch.
    pub attempt: u32,
    /// Status after this dispatch. `Done` operations are no longer queued.
    pub status: OperationStatus,
    /// What happened.
    pub outcome: OperationOutcome,
}

/// Totals for one run of the apply loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleSummary {
    /// Operations applied as sent.
    pub applied: usize,
    /// Operations settled through conflict resolution.
    pub resolved: usize,
    /// Operations moved to the dead-letter view.
    pub failed: usize,
    /// Attempts that were requeued for retry.
    pub retried: usize,
    /// The loop stopped because connectivity was lost.
    pub interrupted: bool,
    /// The loop stopped because of an internal error.
    pub error: Option<String>,
    /// Wall time spent in the loop.
    pub duration: Duration,
}

impl CycleSummary {
    fn record(&mut self, outcome: &OperationOutcome) {
        match outcome {
            OperationOutcome::Applied => self.applied += 1,
            OperationOutcome::Resolved(_) => self.resolved += 1,
            OperationOutcome::FailedPermanently { .. } => self.failed += 1,
            OperationOutcome::FailedRetryable { .. } => self.retried += 1,
        }
    }

    /// Operations that left the queue successfully.
    pub fn completed(&self) -> usize {
        self.applied + self.resolved
    }
}

/// Releases the single-flight flag when the loop ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Coordinates the queue, the executor, conflict resolution and status.
pub struct SyncManager {
    config: SyncConfig,
    queue: Arc<QueueStore>,
    executor: Arc<dyn RemoteExecutor>,
    network: Arc<NetworkMonitor>,
    resolvers: ResolverRegistry,
    reporter: Arc<StatusReporter>,
    running: AtomicBool,
    /// Wakes a loop that is waiting out a backoff when new work arrives.
    work: Notify,
}

impl SyncManager {
    /// Creates a manager. Conflicts default to server-wins.
    pub fn new(
        config: SyncConfig,
        queue: Arc<QueueStore>,
        executor: Arc<dyn RemoteExecutor>,
        network: Arc<NetworkMonitor>,
    ) -> Self {
        let reporter = Arc::new(StatusReporter::new(queue.clone()));
        Self {
            config,
            queue,
            executor,
            network,
            resolvers: ResolverRegistry::default(),
            reporter,
            running: AtomicBool::new(false),
            work: Notify::new(),
        }
    }

    /// Sets the conflict resolvers.
    pub fn with_resolvers(mut self, resolvers: ResolverRegistry) -> Self {
        self.resolvers = resolvers;
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the queue.
    pub fn queue(&self) -> &Arc<QueueStore> {
        &self.queue
    }

    /// Returns the network monitor.
    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    /// Returns the status reporter.
    pub fn reporter(&self) -> &Arc<StatusReporter> {
        &self.reporter
    }

    /// Returns the current status.
    pub fn status(&self) -> SyncStatus {
        self.reporter.status()
    }

    /// Returns true while the apply loop runs.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Validates and durably queues a mutation.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] for malformed operations and
    /// [`SyncError::CapacityExceeded`] when the queue is full and the
    /// capacity policy cannot make room.
    pub fn enqueue(&self, op: SyncOperation) -> SyncResult<OperationId> {
        op.validate(self.config.max_payload_bytes)?;
        let priority = op.priority;

        let id = match self.queue.enqueue(op.clone()) {
            Ok(id) => id,
            Err(err @ SyncError::CapacityExceeded { .. }) => {
                if self.config.capacity_policy != CapacityPolicy::DropLowestPriority {
                    return Err(err);
                }
                let Some(evicted) = self.queue.evict_lowest_priority(priority)? else {
                    return Err(err);
                };
                warn!(
                    op_id = %evicted.id,
                    entity = %evicted.entity_key(),
                    priority = %evicted.priority,
                    "evicted to make room"
                );
                self.reporter.record(SyncEvent::Error {
                    op_id: Some(evicted.id),
                    error: "evicted: queue at capacity".to_string(),
                });
                self.queue.enqueue(op)?
            }
            Err(err) => return Err(err),
        };

        self.reporter.refresh();
        self.work.notify_one();
        if self.network.is_online() {
            self.network.request_sync();
        }
        Ok(id)
    }

    /// Removes a pending operation.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InFlight`] if the operation is being executed.
    pub fn cancel(&self, id: OperationId) -> SyncResult<SyncOperation> {
        let op = self.queue.cancel(id)?;
        self.reporter.refresh();
        Ok(op)
    }

    /// Moves a dead letter back into the queue.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotFound`] if there is no such dead letter.
    pub fn retry_failed(&self, id: OperationId) -> SyncResult<OperationId> {
        let id = self.queue.retry_dead_letter(id)?;
        self.reporter.refresh();
        self.work.notify_one();
        if self.network.is_online() {
            self.network.request_sync();
        }
        Ok(id)
    }

    /// Returns the dead letters, oldest first.
    pub fn dead_letters(&self) -> Vec<SyncOperation> {
        self.queue.dead_letters()
    }

    /// Runs the apply loop until the queue is drained or connectivity is
    /// lost.
    ///
    /// Returns `None` if another loop is already running.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be persisted. Executor and
    /// resolver failures are handled per operation and never end the loop.
    pub async fn run(&self) -> SyncResult<Option<CycleSummary>> {
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            debug!("sync loop already running");
            return Ok(None);
        };

        let mut summary = CycleSummary::default();
        if !self.network.is_online() {
            debug!("offline, skipping sync");
            summary.interrupted = true;
            return Ok(Some(summary));
        }

        let started = Instant::now();
        self.reporter.record(SyncEvent::Started);
        info!(pending = self.queue.counts().pending, "sync started");

        let result = self.drain(&mut summary).await;
        summary.duration = started.elapsed();
        if let Err(err) = &result {
            warn!(error = %err, "sync loop aborted");
            summary.error = Some(err.to_string());
            self.reporter.record(SyncEvent::Error {
                op_id: None,
                error: err.to_string(),
            });
        }

        info!(
            applied = summary.applied,
            resolved = summary.resolved,
            failed = summary.failed,
            retried = summary.retried,
            interrupted = summary.interrupted,
            "sync finished"
        );
        self.reporter.record(SyncEvent::Completed(summary.clone()));

        result.map(|()| Some(summary))
    }

    /// Spawns a task that runs the loop on every network trigger.
    ///
    /// The task ends when the manager is dropped or the handle is aborted.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let mut triggers = self.network.triggers();
        let manager = Arc::downgrade(self);

        tokio::spawn(async move {
            while let Some(reason) = triggers.next().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                debug!(?reason, "sync triggered");
                if let Err(err) = manager.run().await {
                    warn!(error = %err, "background sync failed");
                }
            }
            debug!("sync driver stopped");
        })
    }

    async fn drain(&self, summary: &mut CycleSummary) -> SyncResult<()> {
        let mut online = self.network.subscribe();

        loop {
            if !*online.borrow_and_update() {
                summary.interrupted = true;
                return Ok(());
            }

            let Some(op) = self.queue.dequeue_next()? else {
                let Some(deadline) = self.queue.next_wakeup() else {
                    return Ok(());
                };
                // Everything left is backing off
                let went_offline = tokio::select! {
                    () = sleep_until(deadline) => false,
                    () = self.work.notified() => false,
                    () = wait_offline(&mut online) => true,
                };
                if went_offline {
                    summary.interrupted = true;
                    return Ok(());
                }
                continue;
            };
            self.reporter.refresh();

            let op_id = op.id;
            let report = match self.process(op).await {
                Ok(report) => report,
                Err(err) => {
                    // The outcome never reached the store; let the next run retry it
                    self.queue.release(op_id);
                    self.reporter.refresh();
                    return Err(err);
                }
            };
            summary.record(&report.outcome);
            if let Some(error) = report.outcome.error() {
                self.reporter.record(SyncEvent::Error {
                    op_id: Some(report.op_id),
                    error: error.to_string(),
                });
            }
            self.reporter.record(SyncEvent::Progress(report));
        }
    }

    /// Executes one in-flight operation and settles it in the queue.
    async fn process(&self, mut op: SyncOperation) -> SyncResult<OperationReport> {
        let mut resolution: Option<ResolutionStrategy> = None;

        let outcome = loop {
            let response = match timeout(self.config.executor_timeout, self.executor.execute(&op))
                .await
            {
                Ok(response) => response,
                Err(_) => Err(SyncError::Timeout(self.config.executor_timeout)),
            };

            let response = match response {
                Ok(response) => response,
                Err(err) => break self.settle_failure(&op, err)?,
            };

            match response.status {
                ExecuteStatus::Applied => {
                    self.queue.ack(op.id)?;
                    debug!(op_id = %op.id, entity = %op.entity_key(), "applied");
                    break match resolution {
                        Some(strategy) => OperationOutcome::Resolved(strategy),
                        None => OperationOutcome::Applied,
                    };
                }
                ExecuteStatus::Error => {
                    break self.settle_failure(&op, SyncError::from_response(&response))?;
                }
                ExecuteStatus::Conflict => {}
            }

            let Some(server_version) = response.server_version else {
                break self.settle_failure(
                    &op,
                    SyncError::permanent("conflict response without server version"),
                )?;
            };
            if resolution.is_some() {
                break self.settle_failure(
                    &op,
                    SyncError::permanent(format!(
                        "conflict persisted after resolution (server v{server_version})"
                    )),
                )?;
            }

            info!(
                op_id = %op.id,
                entity = %op.entity_key(),
                base_version = ?op.base_version,
                server_version,
                "conflict"
            );
            let ctx = ConflictContext::new(&op, response.server_data, server_version);
            let decision = catch_unwind(AssertUnwindSafe(|| self.resolvers.resolve(&ctx)))
                .unwrap_or_else(|_| ResolverDecision::abort("conflict resolver panicked"));

            match decision {
                ResolverDecision::Resolved(resolved) if resolved.strategy.requires_retry() => {
                    op = self
                        .queue
                        .rewrite(op.id, resolved.data, Some(server_version))?;
                    resolution = Some(resolved.strategy);
                    debug!(op_id = %op.id, strategy = %resolved.strategy, "retrying resolved operation");
                }
                ResolverDecision::Resolved(resolved) => {
                    // Server state stands; the client's write is dropped
                    self.queue.ack(op.id)?;
                    break OperationOutcome::Resolved(resolved.strategy);
                }
                ResolverDecision::Abort { reason } => {
                    break self.settle_failure(
                        &op,
                        SyncError::permanent(format!("conflict not resolved: {reason}")),
                    )?;
                }
            }
        };

        Ok(OperationReport {
            op_id: op.id,
            entity_type: op.entity_type,
            entity_id: op.entity_id,
            attempt: op.attempt_count,
            status: outcome.status(),
            outcome,
        })
    }

    /// Requeues or dead-letters a failed attempt.
    fn settle_failure(&self, op: &SyncOperation, err: SyncError) -> SyncResult<OperationOutcome> {
        let error = err.to_string();
        let retry = &self.config.retry;

        if err.classify() == ErrorClass::Transient && retry.should_retry(op.attempt_count) {
            let retry_in = retry.delay_for_attempt(op.attempt_count);
            debug!(
                op_id = %op.id,
                attempt = op.attempt_count,
                ?retry_in,
                error = %error,
                "attempt failed, will retry"
            );
            self.queue.requeue(op.id, &error, retry_in)?;
            return Ok(OperationOutcome::FailedRetryable { error, retry_in });
        }

        let error = if err.classify() == ErrorClass::Transient {
            format!("retries exhausted after {} attempts: {error}", op.attempt_count)
        } else {
            error
        };
        self.queue.fail(op.id, &error)?;
        Ok(OperationOutcome::FailedPermanently { error })
    }
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("online", &self.network.is_online())
            .finish_non_exhaustive()
    }
}

/// Resolves once connectivity is lost or the monitor is gone.
async fn wait_offline(online: &mut watch::Receiver<bool>) {
    let _ = online.wait_for(|online| !*online).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NetworkConfig, QueueConfig, RetryConfig};
    use crate::executor::MockExecutor;
    use outbox_protocol::{ConflictPolicy, ExecuteResponse, Priority};
    use outbox_storage::{BatchOp, InMemoryStore, KvStore, StorageError, StorageResult, WriteBatch};
    use serde_json::json;

    /// Refuses deletes while `reject_deletes` is set.
    #[derive(Default)]
    struct StickyStore {
        inner: InMemoryStore,
        reject_deletes: AtomicBool,
    }

    impl KvStore for StickyStore {
        fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
            self.inner.get(key)
        }

        fn write(&self, batch: WriteBatch) -> StorageResult<()> {
            let deletes = batch
                .ops()
                .iter()
                .any(|op| matches!(op, BatchOp::Delete { .. }));
            if deletes && self.reject_deletes.load(Ordering::SeqCst) {
                return Err(StorageError::Io(std::io::Error::other("disk unplugged")));
            }
            self.inner.write(batch)
        }

        fn scan_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
            self.inner.scan_prefix(prefix)
        }

        fn len(&self) -> usize {
            self.inner.len()
        }
    }

    struct Fixture {
        manager: Arc<SyncManager>,
        executor: Arc<MockExecutor>,
    }

    fn fixture(config: SyncConfig, online: bool) -> Fixture {
        let queue = Arc::new(
            QueueStore::open(Arc::new(InMemoryStore::new()), QueueConfig::default()).unwrap(),
        );
        let executor = Arc::new(MockExecutor::new());
        let network = Arc::new(NetworkMonitor::new(NetworkConfig::default(), online));
        let manager = Arc::new(SyncManager::new(config, queue, executor.clone(), network));
        Fixture { manager, executor }
    }

    fn fast_retry() -> SyncConfig {
        SyncConfig::default().with_retry(
            RetryConfig::default()
                .with_initial_delay(Duration::from_millis(10))
                .with_jitter(false),
        )
    }

    #[tokio::test]
    async fn enqueue_validates() {
        let fx = fixture(SyncConfig::default(), false);
        let err = fx
            .manager
            .enqueue(SyncOperation::update("resident", "", json!({})))
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert_eq!(fx.manager.status().pending_count, 0);
    }

    #[tokio::test]
    async fn offline_run_does_nothing() {
        let fx = fixture(SyncConfig::default(), false);
        fx.manager
            .enqueue(SyncOperation::create("resident", "1", json!({"n": 1})))
            .unwrap();

        let summary = fx.manager.run().await.unwrap().unwrap();
        assert!(summary.interrupted);
        assert_eq!(fx.executor.call_count(), 0);
        assert_eq!(fx.manager.status().pending_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let fx = fixture(fast_retry(), true);
        fx.executor.push_response(ExecuteResponse::error(503, "busy"));
        fx.executor.push_error(SyncError::transient("connection reset"));

        fx.manager
            .enqueue(SyncOperation::create("resident", "1", json!({"n": 1})))
            .unwrap();
        let summary = fx.manager.run().await.unwrap().unwrap();

        assert_eq!(summary.applied, 1);
        assert_eq!(summary.retried, 2);
        assert_eq!(fx.executor.call_count(), 3);
        assert!(fx.manager.queue().list().is_empty());
        assert!(fx.manager.status().last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_capped() {
        let config = fast_retry().with_retry(RetryConfig::new(2).with_jitter(false));
        let fx = fixture(config, true);
        fx.executor
            .set_handler(|_| Ok(ExecuteResponse::error(500, "down")));

        fx.manager
            .enqueue(SyncOperation::create("resident", "1", json!({"n": 1})))
            .unwrap();
        let summary = fx.manager.run().await.unwrap().unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(fx.executor.call_count(), 2);
        let dead = fx.manager.dead_letters();
        assert_eq!(dead[0].attempt_count, 2);
        assert!(dead[0].last_error.as_deref().unwrap().contains("retries exhausted"));
    }

    #[tokio::test]
    async fn executor_timeout_is_transient() {
        let config = SyncConfig::default()
            .with_executor_timeout(Duration::from_millis(20))
            .with_retry(RetryConfig::no_retry());
        let fx = fixture(config, true);
        fx.executor.set_latency(Duration::from_millis(200));

        fx.manager
            .enqueue(SyncOperation::create("resident", "1", json!({"n": 1})))
            .unwrap();
        let summary = fx.manager.run().await.unwrap().unwrap();

        assert_eq!(summary.failed, 1);
        assert!(fx.manager.dead_letters()[0]
            .last_error
            .as_deref()
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn server_wins_discards_client_write() {
        let fx = fixture(SyncConfig::default(), true);
        fx.executor
            .push_response(ExecuteResponse::conflict(json!({"name": "Server"}), 5));

        fx.manager
            .enqueue(SyncOperation::update("resident", "2", json!({"name": "Client"})).with_base_version(3))
            .unwrap();
        let summary = fx.manager.run().await.unwrap().unwrap();

        assert_eq!(summary.resolved, 1);
        assert_eq!(fx.executor.call_count(), 1);
        assert!(fx.manager.queue().list().is_empty());
    }

    #[tokio::test]
    async fn repeated_conflict_is_permanent() {
        let fx = fixture(SyncConfig::default(), true);
        let manager = Arc::try_unwrap(fx.manager)
            .unwrap()
            .with_resolvers(ResolverRegistry::new(ConflictPolicy::ClientWins));
        fx.executor
            .set_handler(|_| Ok(ExecuteResponse::conflict(json!({"name": "Server"}), 9)));

        manager
            .enqueue(SyncOperation::update("resident", "2", json!({"name": "Client"})).with_base_version(3))
            .unwrap();
        let summary = manager.run().await.unwrap().unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(fx.executor.call_count(), 2);
        assert_eq!(manager.status().failed_count, 1);
    }

    #[tokio::test]
    async fn panicking_resolver_aborts() {
        let fx = fixture(SyncConfig::default(), true);
        let registry = ResolverRegistry::default()
            .with_override("resident", |_: &ConflictContext| -> ResolverDecision {
                panic!("resolver bug")
            });
        let manager = Arc::try_unwrap(fx.manager).unwrap().with_resolvers(registry);
        fx.executor
            .push_response(ExecuteResponse::conflict(json!({}), 2));

        manager
            .enqueue(SyncOperation::update("resident", "1", json!({"a": 1})).with_base_version(1))
            .unwrap();
        let other = manager
            .enqueue(SyncOperation::create("room", "1", json!({"a": 1})))
            .unwrap();
        let summary = manager.run().await.unwrap().unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.applied, 1);
        assert!(manager.queue().get(other).is_none());
        assert!(manager.status().last_error.is_some());
    }

    #[tokio::test]
    async fn conflict_without_version_is_permanent() {
        let fx = fixture(SyncConfig::default(), true);
        let mut response = ExecuteResponse::conflict(json!({}), 1);
        response.server_version = None;
        fx.executor.push_response(response);

        fx.manager
            .enqueue(SyncOperation::update("resident", "1", json!({"a": 1})))
            .unwrap();
        let summary = fx.manager.run().await.unwrap().unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(fx.executor.call_count(), 1);
    }

    #[tokio::test]
    async fn validation_response_is_not_retried() {
        let fx = fixture(SyncConfig::default(), true);
        fx.executor
            .push_response(ExecuteResponse::error(422, "name too long"));

        fx.manager
            .enqueue(SyncOperation::update("resident", "1", json!({"a": 1})))
            .unwrap();
        let summary = fx.manager.run().await.unwrap().unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.retried, 0);
        assert_eq!(fx.executor.call_count(), 1);
    }

    #[tokio::test]
    async fn drop_lowest_priority_makes_room() {
        let queue = Arc::new(
            QueueStore::open(
                Arc::new(InMemoryStore::new()),
                QueueConfig::default().with_max_pending(1),
            )
            .unwrap(),
        );
        let network = Arc::new(NetworkMonitor::new(NetworkConfig::default(), false));
        let manager = SyncManager::new(
            SyncConfig::default().with_capacity_policy(CapacityPolicy::DropLowestPriority),
            queue,
            Arc::new(MockExecutor::new()),
            network,
        );

        let low = manager
            .enqueue(SyncOperation::create("note", "1", json!({})).with_priority(Priority::Low))
            .unwrap();
        let critical = manager
            .enqueue(SyncOperation::create("note", "2", json!({})).with_priority(Priority::Critical))
            .unwrap();

        assert_eq!(manager.queue().list()[0].id, critical);
        assert_eq!(manager.dead_letters()[0].id, low);
        assert_eq!(manager.status().failed_count, 1);

        // Nothing ranks below Low, so a third Low op is rejected
        let err = manager
            .enqueue(SyncOperation::create("note", "3", json!({})).with_priority(Priority::Low))
            .unwrap_err();
        assert!(matches!(err, SyncError::CapacityExceeded { .. }));
    }

    #[tokio::test]
    async fn reentrant_run_is_noop() {
        let fx = fixture(SyncConfig::default(), true);
        fx.executor.set_latency(Duration::from_millis(50));
        fx.manager
            .enqueue(SyncOperation::create("resident", "1", json!({"n": 1})))
            .unwrap();

        let (first, second) = tokio::join!(fx.manager.run(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            fx.manager.run().await
        });

        assert!(first.unwrap().is_some());
        assert!(second.unwrap().is_none());
        assert!(!fx.manager.is_running());
        assert_eq!(fx.executor.call_count(), 1);
    }

    #[tokio::test]
    async fn unpersisted_ack_releases_operation() {
        let store = Arc::new(StickyStore::default());
        let queue = Arc::new(QueueStore::open(store.clone(), QueueConfig::default()).unwrap());
        let executor = Arc::new(MockExecutor::new());
        let network = Arc::new(NetworkMonitor::new(NetworkConfig::default(), true));
        let manager = SyncManager::new(SyncConfig::default(), queue.clone(), executor.clone(), network);

        let first = manager
            .enqueue(SyncOperation::create("resident", "1", json!({"n": 1})))
            .unwrap();
        manager
            .enqueue(SyncOperation::update("resident", "1", json!({"n": 2})))
            .unwrap();

        store.reject_deletes.store(true, Ordering::SeqCst);
        assert!(manager.run().await.is_err());
        assert_eq!(queue.get(first).unwrap().status, OperationStatus::Pending);
        assert_eq!(queue.counts().in_flight, 0);
        assert_eq!(manager.status().in_flight_count, 0);

        // The same entity is not stuck behind the unsettled operation
        store.reject_deletes.store(false, Ordering::SeqCst);
        let summary = manager.run().await.unwrap().unwrap();
        assert_eq!(summary.applied, 2);
        assert_eq!(executor.call_count(), 3);
        assert!(queue.list().is_empty());
    }

    #[test]
    fn outcome_status() {
        assert_eq!(OperationOutcome::Applied.status(), OperationStatus::Done);
        assert_eq!(
            OperationOutcome::Resolved(ResolutionStrategy::ServerWins).status(),
            OperationStatus::Done
        );
        assert_eq!(
            OperationOutcome::FailedPermanently { error: "403".into() }.status(),
            OperationStatus::Failed
        );
        assert_eq!(
            OperationOutcome::FailedRetryable {
                error: "503".into(),
                retry_in: Duration::from_secs(1),
            }
            .status(),
            OperationStatus::Pending
        );
    }
}
