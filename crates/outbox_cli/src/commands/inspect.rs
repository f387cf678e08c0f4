//! Inspect command implementation.

use super::{read_queue, CliResult, OutputFormat};
use outbox_protocol::{OperationStatus, Priority};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Queue inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Log path.
    pub path: String,
    /// Log size in bytes.
    pub log_bytes: u64,
    /// Operations waiting to be dispatched.
    pub pending: usize,
    /// Operations stored as in flight. A writer resets them to pending on
    /// open.
    pub in_flight: usize,
    /// Active operations dispatched at least once.
    pub retried: usize,
    /// Dead letters.
    pub failed: usize,
    /// Active operations per priority, most urgent first.
    pub by_priority: Vec<PriorityCount>,
    /// Active operations per entity type.
    pub by_entity_type: BTreeMap<String, usize>,
    /// Enqueue time of the oldest active operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_enqueued_at: Option<String>,
    /// Highest attempt count among active operations.
    pub max_attempts: u32,
}

/// Active operation count for one priority.
#[derive(Debug, Serialize)]
pub struct PriorityCount {
    /// Priority name.
    pub priority: &'static str,
    /// Number of active operations.
    pub count: usize,
}

/// Collects queue statistics from the log at `path`.
pub fn collect(path: &Path) -> CliResult<InspectResult> {
    let view = read_queue(path)?;
    let ops = &view.active;
    let count = |status: OperationStatus| ops.iter().filter(|op| op.status == status).count();

    let by_priority = Priority::ALL
        .into_iter()
        .map(|priority| PriorityCount {
            priority: priority.as_str(),
            count: ops.iter().filter(|op| op.priority == priority).count(),
        })
        .collect();

    let mut by_entity_type = BTreeMap::new();
    for op in ops {
        *by_entity_type.entry(op.entity_type.clone()).or_insert(0) += 1;
    }

    let retried = ops.iter().filter(|op| op.attempt_count > 0).count();

    Ok(InspectResult {
        path: path.display().to_string(),
        log_bytes: view.log_bytes,
        pending: count(OperationStatus::Pending),
        in_flight: count(OperationStatus::InFlight),
        retried,
        failed: view.dead.len(),
        by_priority,
        by_entity_type,
        oldest_enqueued_at: ops
            .iter()
            .map(|op| op.enqueued_at)
            .min()
            .map(|at| at.to_rfc3339()),
        max_attempts: ops.iter().map(|op| op.attempt_count).max().unwrap_or(0),
    })
}

/// Runs the inspect command.
pub fn run(path: &Path, format: OutputFormat) -> CliResult<()> {
    let result = collect(path)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Text => print_text(&result),
    }

    Ok(())
}

fn print_text(result: &InspectResult) {
    println!("Outbox Queue: {}", result.path);
    println!("═══════════════════════════════════════");
    println!();
    println!("Log size:    {} bytes", result.log_bytes);
    println!();
    println!("Operations:");
    println!("  Pending:   {}", result.pending);
    println!("  In flight: {}", result.in_flight);
    println!("  Retried:   {}", result.retried);
    println!("  Failed:    {}", result.failed);
    println!("  Attempts:  {} (max)", result.max_attempts);
    if let Some(oldest) = &result.oldest_enqueued_at {
        println!("  Oldest:    {oldest}");
    }
    println!();
    println!("By priority:");
    for entry in &result.by_priority {
        println!("  {:<10} {}", entry.priority, entry.count);
    }
    if !result.by_entity_type.is_empty() {
        println!();
        println!("By entity type:");
        for (entity_type, count) in &result.by_entity_type {
            println!("  {entity_type:<20} {count}");
        }
    }
}
