//! List and dead-letter command implementations.

use super::{read_queue, CliResult, OutputFormat};
use outbox_protocol::SyncOperation;
use std::path::Path;

/// Returns active operations sorted by priority, then enqueue order.
pub fn collect(
    path: &Path,
    entity_type: Option<&str>,
    limit: Option<usize>,
) -> CliResult<Vec<SyncOperation>> {
    let mut ops: Vec<SyncOperation> = read_queue(path)?
        .active
        .into_iter()
        .filter(|op| entity_type.map_or(true, |t| op.entity_type == t))
        .collect();
    ops.sort_by_key(|op| (op.priority, op.sequence));
    if let Some(limit) = limit {
        ops.truncate(limit);
    }
    Ok(ops)
}

/// Runs the list command.
pub fn run(
    path: &Path,
    entity_type: Option<&str>,
    limit: Option<usize>,
    format: OutputFormat,
) -> CliResult<()> {
    let ops = collect(path, entity_type, limit)?;
    print_ops(&ops, format, "No pending operations")
}

/// Runs the dead-letters command.
pub fn run_dead(path: &Path, format: OutputFormat) -> CliResult<()> {
    let dead = read_queue(path)?.dead;
    print_ops(&dead, format, "No dead letters")
}

fn print_ops(ops: &[SyncOperation], format: OutputFormat, empty: &str) -> CliResult<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(ops)?),
        OutputFormat::Text if ops.is_empty() => println!("{empty}"),
        OutputFormat::Text => {
            println!(
                "{:<6} {:<36} {:<8} {:<9} {:<24} {:>3}  ERROR",
                "SEQ", "ID", "TYPE", "PRIORITY", "ENTITY", "TRY"
            );
            for op in ops {
                println!(
                    "{:<6} {:<36} {:<8} {:<9} {:<24} {:>3}  {}",
                    op.sequence,
                    op.id,
                    format!("{:?}", op.op_type),
                    op.priority,
                    op.entity_key(),
                    op.attempt_count,
                    op.last_error.as_deref().unwrap_or("-"),
                );
            }
            println!();
            println!("{} operation(s)", ops.len());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::seeded;
    use outbox_protocol::Priority;

    #[test]
    fn critical_listed_first() {
        let (_dir, path, _) = seeded();
        let ops = collect(&path, None, None).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].priority, Priority::Critical);
        assert_eq!(ops[0].entity_type, "visit");
    }

    #[test]
    fn filter_and_limit() {
        let (_dir, path, _) = seeded();
        let residents = collect(&path, Some("resident"), None).unwrap();
        assert_eq!(residents.len(), 1);
        assert_eq!(residents[0].entity_id, "1");

        assert_eq!(collect(&path, None, Some(1)).unwrap().len(), 1);
        assert!(collect(&path, Some("invoice"), None).unwrap().is_empty());
    }
}
