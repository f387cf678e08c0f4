//! CLI command implementations.

pub mod compact;
pub mod inspect;
pub mod list;
pub mod repair;
pub mod verify;

use clap::ValueEnum;
use outbox_engine::{QueueConfig, QueueStore, SyncError};
use outbox_protocol::{OperationId, ProtocolError, SyncOperation};
use outbox_storage::{FileStore, FileStoreOptions, StorageError};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Errors reported by the CLI.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// No `--path` was given.
    #[error("queue log path required (use --path)")]
    MissingPath,

    /// The log file does not exist.
    #[error("no queue log found at {}", .0.display())]
    NotFound(PathBuf),

    /// An operation id argument did not parse.
    #[error("invalid operation id: {0}")]
    InvalidId(ProtocolError),

    /// A stored operation did not decode.
    #[error("undecodable operation: {0}")]
    Record(#[from] ProtocolError),

    /// Verification found problems.
    #[error("verification failed: {0}")]
    VerifyFailed(String),

    /// Storage error.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Queue error.
    #[error(transparent)]
    Queue(#[from] SyncError),

    /// JSON output failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// Output format for listing commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

/// An opened queue log.
pub struct OpenQueue {
    /// The backing log.
    pub store: Arc<FileStore>,
    /// The queue over it.
    pub queue: QueueStore,
}

/// Opens the log at `path` for writing and recovers the queue held in it.
///
/// Recovery truncates a torn tail and persists interrupted dispatches as
/// pending, so only the repair commands go through here.
pub fn open_queue(path: &Path) -> CliResult<OpenQueue> {
    if !path.exists() {
        return Err(CliError::NotFound(path.to_path_buf()));
    }
    let store = Arc::new(FileStore::open(
        path,
        FileStoreOptions::default().without_auto_compaction(),
    )?);
    let queue = QueueStore::open(store.clone(), QueueConfig::default())?;
    Ok(OpenQueue { store, queue })
}

/// Queue contents decoded from a log without opening it for writing.
#[derive(Debug, Default)]
pub struct QueueView {
    /// Log file size in bytes, torn tail included.
    pub log_bytes: u64,
    /// Active operations in sequence order, with their stored status.
    pub active: Vec<SyncOperation>,
    /// Dead letters in sequence order.
    pub dead: Vec<SyncOperation>,
}

/// Reads the queue held in the log at `path`.
///
/// Takes no lock and never modifies the file; a torn tail is ignored.
pub fn read_queue(path: &Path) -> CliResult<QueueView> {
    if !path.exists() {
        return Err(CliError::NotFound(path.to_path_buf()));
    }
    let mut view = QueueView {
        log_bytes: std::fs::metadata(path).map_err(StorageError::from)?.len(),
        ..QueueView::default()
    };
    // Zero-padded sequence keys sort in sequence order
    for (key, value) in FileStore::read_snapshot(path)? {
        if key.starts_with(OP_PREFIX) {
            view.active.push(SyncOperation::from_record(&value)?);
        } else if key.starts_with(DEAD_PREFIX) {
            view.dead.push(SyncOperation::from_record(&value)?);
        }
    }
    Ok(view)
}

const OP_PREFIX: &[u8] = b"op/";
const DEAD_PREFIX: &[u8] = b"dead/";

pub(crate) fn parse_id(id: &str) -> CliResult<OperationId> {
    id.trim().parse().map_err(CliError::InvalidId)
}
