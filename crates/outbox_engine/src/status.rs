//! Sync status reporting.
//!
//! The reporter folds the manager's [`SyncEvent`] stream and the queue's
//! counts into one [`SyncStatus`] value that UIs can poll or subscribe to.

use crate::manager::{CycleSummary, OperationReport};
use crate::queue::QueueStore;
use chrono::{DateTime, Utc};
use outbox_protocol::OperationId;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Default buffer size for the event channel.
///
/// Subscribers that fall further behind receive `RecvError::Lagged`.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

/// Events published by the sync manager.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A sync cycle started.
    Started,
    /// One operation reached an outcome.
    Progress(OperationReport),
    /// A sync cycle finished.
    Completed(CycleSummary),
    /// An operation or the cycle itself failed.
    Error {
        /// Affected operation, if any.
        op_id: Option<OperationId>,
        /// Error description.
        error: String,
    },
}

/// Snapshot of sync health.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Operations waiting to be sent.
    pub pending_count: usize,
    /// Operations currently being sent.
    pub in_flight_count: usize,
    /// Dead letters awaiting user attention.
    pub failed_count: usize,
    /// Whether a sync cycle is running.
    pub syncing: bool,
    /// When the last cycle completed.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Most recent error since the last clean cycle.
    pub last_error: Option<String>,
}

impl SyncStatus {
    /// Returns true if nothing is queued and no cycle is running.
    pub fn is_idle(&self) -> bool {
        self.pending_count == 0 && self.in_flight_count == 0 && !self.syncing
    }
}

/// Publishes [`SyncStatus`] snapshots and the raw event stream.
pub struct StatusReporter {
    queue: Arc<QueueStore>,
    current: Mutex<SyncStatus>,
    status_tx: watch::Sender<SyncStatus>,
    events_tx: broadcast::Sender<SyncEvent>,
}

impl StatusReporter {
    /// Creates a reporter over `queue`.
    pub fn new(queue: Arc<QueueStore>) -> Self {
        Self::with_buffer(queue, DEFAULT_EVENT_BUFFER_SIZE)
    }

    /// Creates a reporter with a custom event buffer size.
    pub fn with_buffer(queue: Arc<QueueStore>, buffer: usize) -> Self {
        let counts = queue.counts();
        let initial = SyncStatus {
            pending_count: counts.pending,
            in_flight_count: counts.in_flight,
            failed_count: counts.failed,
            ..SyncStatus::default()
        };
        let (status_tx, _) = watch::channel(initial.clone());
        let (events_tx, _) = broadcast::channel(buffer.max(1));
        Self {
            queue,
            current: Mutex::new(initial),
            status_tx,
            events_tx,
        }
    }

    /// Returns the current status.
    pub fn status(&self) -> SyncStatus {
        self.current.lock().clone()
    }

    /// Subscribes to status changes.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    /// Subscribes to the raw event stream.
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events_tx.subscribe()
    }

    /// Re-reads the queue counts and publishes the status if it changed.
    pub fn refresh(&self) {
        self.update(|_| {});
    }

    /// Folds an event into the status and broadcasts it.
    pub fn record(&self, event: SyncEvent) {
        self.update(|status| match &event {
            SyncEvent::Started => status.syncing = true,
            SyncEvent::Progress(_) => {}
            SyncEvent::Completed(summary) => {
                status.syncing = false;
                status.last_sync_at = Some(Utc::now());
                if let Some(error) = &summary.error {
                    status.last_error = Some(error.clone());
                } else if summary.failed == 0 {
                    status.last_error = None;
                }
            }
            SyncEvent::Error { error, .. } => status.last_error = Some(error.clone()),
        });
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }

    fn update(&self, apply: impl FnOnce(&mut SyncStatus)) {
        let counts = self.queue.counts();
        let mut current = self.current.lock();
        current.pending_count = counts.pending;
        current.in_flight_count = counts.in_flight;
        current.failed_count = counts.failed;
        apply(&mut *current);

        let next = current.clone();
        self.status_tx.send_if_modified(|published| {
            if *published == next {
                false
            } else {
                *published = next;
                true
            }
        });
    }
}

impl std::fmt::Debug for StatusReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusReporter")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use outbox_protocol::SyncOperation;
    use outbox_storage::InMemoryStore;
    use serde_json::json;

    fn reporter() -> (Arc<QueueStore>, StatusReporter) {
        let queue = Arc::new(
            QueueStore::open(Arc::new(InMemoryStore::new()), QueueConfig::default()).unwrap(),
        );
        let reporter = StatusReporter::new(queue.clone());
        (queue, reporter)
    }

    #[test]
    fn refresh_tracks_queue_counts() {
        let (queue, reporter) = reporter();
        let mut rx = reporter.subscribe();
        assert!(reporter.status().is_idle());

        queue
            .enqueue(SyncOperation::create("resident", "1", json!({})))
            .unwrap();
        reporter.refresh();

        assert_eq!(reporter.status().pending_count, 1);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().pending_count, 1);

        // Unchanged status is not republished
        reporter.refresh();
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn errors_are_cleared_by_clean_cycle() {
        let (_queue, reporter) = reporter();

        reporter.record(SyncEvent::Started);
        assert!(reporter.status().syncing);

        reporter.record(SyncEvent::Error {
            op_id: None,
            error: "503: unavailable".into(),
        });
        reporter.record(SyncEvent::Completed(CycleSummary {
            failed: 1,
            ..CycleSummary::default()
        }));
        let status = reporter.status();
        assert!(!status.syncing);
        assert!(status.last_sync_at.is_some());
        assert_eq!(status.last_error.as_deref(), Some("503: unavailable"));

        reporter.record(SyncEvent::Started);
        reporter.record(SyncEvent::Completed(CycleSummary::default()));
        assert!(reporter.status().last_error.is_none());
    }

    #[tokio::test]
    async fn events_are_broadcast() {
        let (_queue, reporter) = reporter();
        let mut events = reporter.events();

        reporter.record(SyncEvent::Started);
        assert_eq!(events.recv().await.unwrap(), SyncEvent::Started);
    }

    #[test]
    fn status_wire_shape() {
        let value = serde_json::to_value(SyncStatus::default()).unwrap();
        assert_eq!(value["pendingCount"], 0);
        assert_eq!(value["syncing"], false);
        assert!(value["lastError"].is_null());
    }
}
