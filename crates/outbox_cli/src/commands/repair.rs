//! Queue repair commands: retry, cancel and purge.

use super::{open_queue, parse_id, CliResult};
use std::path::Path;
use tracing::info;

/// Moves a dead letter back onto the queue.
pub fn retry(path: &Path, id: &str) -> CliResult<()> {
    let id = parse_id(id)?;
    let open = open_queue(path)?;
    open.queue.retry_dead_letter(id)?;
    println!("✓ Operation {id} re-enqueued");
    Ok(())
}

/// Removes a pending operation.
pub fn cancel(path: &Path, id: &str) -> CliResult<()> {
    let id = parse_id(id)?;
    let open = open_queue(path)?;
    let op = open.queue.cancel(id)?;
    println!("✓ Cancelled {:?} on {}", op.op_type, op.entity_key());
    Ok(())
}

/// Deletes every dead letter.
pub fn purge(path: &Path) -> CliResult<()> {
    let open = open_queue(path)?;
    let purged = open.queue.purge_dead_letters()?;
    info!(purged, path = %path.display(), "purge complete");
    println!("✓ Purged {purged} dead letter(s)");
    Ok(())
}
