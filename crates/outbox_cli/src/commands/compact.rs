//! Compact command implementation.

use super::{open_queue, read_queue, CliResult};
use std::path::Path;

/// Compaction statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactStats {
    /// Active operations.
    pub active: usize,
    /// Dead letters.
    pub dead: usize,
    /// Log size before compaction.
    pub bytes_before: u64,
    /// Log size after compaction. Equal to `bytes_before` on a dry run.
    pub bytes_after: u64,
}

impl CompactStats {
    /// Bytes reclaimed.
    pub fn reclaimed(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

/// Compacts the log at `path`, or only measures it on a dry run.
pub fn compact(path: &Path, dry_run: bool) -> CliResult<CompactStats> {
    if dry_run {
        let view = read_queue(path)?;
        return Ok(CompactStats {
            active: view.active.len(),
            dead: view.dead.len(),
            bytes_before: view.log_bytes,
            bytes_after: view.log_bytes,
        });
    }

    let open = open_queue(path)?;
    let counts = open.queue.counts();
    let bytes_before = open.store.log_size();
    let reclaimed = open.store.compact()?;
    let bytes_after = open.store.log_size();
    debug_assert_eq!(reclaimed, bytes_before.saturating_sub(bytes_after));

    Ok(CompactStats {
        active: counts.active(),
        dead: counts.failed,
        bytes_before,
        bytes_after,
    })
}

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> CliResult<()> {
    println!("Compacting queue log at {}", path.display());
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let stats = compact(path, dry_run)?;
    println!("  Active operations: {}", stats.active);
    println!("  Dead letters:      {}", stats.dead);
    println!("  Size before:       {} bytes", stats.bytes_before);
    if dry_run {
        return Ok(());
    }

    println!("  Size after:        {} bytes", stats.bytes_after);
    println!(
        "  Space saved:       {} bytes ({:.1}%)",
        stats.reclaimed(),
        if stats.bytes_before > 0 {
            stats.reclaimed() as f64 / stats.bytes_before as f64 * 100.0
        } else {
            0.0
        }
    );
    println!();
    println!("✓ Compaction complete");
    Ok(())
}
