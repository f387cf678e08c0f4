//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The log file is corrupted.
    #[error("storage corrupted at offset {offset}: {message}")]
    Corrupted {
        /// Offset of the offending record.
        offset: u64,
        /// What was wrong with it.
        message: String,
    },

    /// A record checksum did not match its contents.
    #[error("checksum mismatch at offset {offset}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Offset of the offending record.
        offset: u64,
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// The store has reached its configured size limit.
    #[error("storage full: {used} of {limit} bytes used")]
    Full {
        /// Bytes currently in use.
        used: u64,
        /// Configured limit.
        limit: u64,
    },

    /// Another process holds the store lock.
    #[error("store is locked by another process: {0}")]
    Locked(String),

    /// A batch could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

impl StorageError {
    /// Creates a corruption error.
    pub fn corrupted(offset: u64, message: impl Into<String>) -> Self {
        Self::Corrupted {
            offset,
            message: message.into(),
        }
    }

    /// Returns true if the store rejected the write for lack of space.
    pub fn is_full(&self) -> bool {
        matches!(self, StorageError::Full { .. })
    }
}
