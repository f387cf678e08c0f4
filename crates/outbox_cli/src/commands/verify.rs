//! Verify command implementation.

use super::{CliError, CliResult};
use outbox_protocol::SyncOperation;
use outbox_storage::FileStore;
use std::path::Path;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Complete records in the log.
    pub records: usize,
    /// Live keys after replay.
    pub live_keys: usize,
    /// Queue entries that decoded as operations.
    pub operations: usize,
    /// Bytes past the last complete record.
    pub torn_bytes: u64,
    /// Problems found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    /// Returns true if no problems were found.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Checks framing, checksums and operation records without taking the
/// writer lock.
pub fn check(path: &Path) -> CliResult<VerifyResult> {
    if !path.exists() {
        return Err(CliError::NotFound(path.to_path_buf()));
    }

    let mut result = VerifyResult::default();
    let report = match FileStore::verify(path) {
        Ok(report) => report,
        Err(e) => {
            result.errors.push(e.to_string());
            return Ok(result);
        }
    };
    result.records = report.records;
    result.live_keys = report.live_keys;
    result.torn_bytes = report.file_bytes - report.valid_bytes;

    for (key, value) in FileStore::read_snapshot(path)? {
        if !(key.starts_with(b"op/") || key.starts_with(b"dead/")) {
            continue;
        }
        match SyncOperation::from_record(&value) {
            Ok(_) => result.operations += 1,
            Err(e) => result.errors.push(format!(
                "undecodable record at {}: {e}",
                String::from_utf8_lossy(&key)
            )),
        }
    }

    Ok(result)
}

/// Runs the verify command.
pub fn run(path: &Path) -> CliResult<()> {
    println!("Verifying queue log at {}", path.display());
    println!();

    let result = check(path)?;
    println!("  Records:    {}", result.records);
    println!("  Live keys:  {}", result.live_keys);
    println!("  Operations: {}", result.operations);
    if result.torn_bytes > 0 {
        println!(
            "  Torn tail:  {} bytes (discarded on next open)",
            result.torn_bytes
        );
    }
    println!();

    if result.is_ok() {
        println!("✓ Verification passed");
        Ok(())
    } else {
        for error in &result.errors {
            println!("  ✗ {error}");
        }
        println!();
        println!("✗ Verification failed with {} error(s)", result.errors.len());
        Err(CliError::VerifyFailed(format!(
            "{} error(s) found",
            result.errors.len()
        )))
    }
}
