//! Dump-log command implementation.

use akadb_core::{CommitLog, LogEntry, NodeId};
use serde::Serialize;
use std::path::Path;

/// Commit log entry representation for output.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntryInfo {
    /// Position in the log.
    pub log_id: u64,
    /// Entry kind.
    pub kind: String,
    /// Transaction id.
    pub transaction_id: u64,
    /// Change id.
    pub change_id: String,
    /// Peer node for replication entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<NodeId>,
    /// Origin node of data entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<NodeId>,
    /// Writes carried by data entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ops: Option<usize>,
    /// Failure text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&LogEntry> for LogEntryInfo {
    fn from(entry: &LogEntry) -> Self {
        Self {
            log_id: entry.log_id,
            kind: kind_label(entry),
            transaction_id: entry.transaction_id.0,
            change_id: entry.change_id.to_string(),
            target: entry.target,
            origin: entry.change.as_ref().map(|c| c.origin),
            ops: entry.change.as_ref().map(|c| c.ops.len()),
            error: entry.error.clone(),
        }
    }
}

fn kind_label(entry: &LogEntry) -> String {
    serde_json::to_value(entry.kind)
        .ok()
        .and_then(|v| v.as_str().map(str::to_owned))
        .unwrap_or_else(|| format!("{:?}", entry.kind))
}

/// Runs the dump-log command.
pub fn run(
    data_dir: &Path,
    node: NodeId,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let entries = read_entries(data_dir, node, limit)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => {
            print_text_output(node, &entries);
        }
    }

    Ok(())
}

fn read_entries(
    data_dir: &Path,
    node: NodeId,
    limit: Option<usize>,
) -> Result<Vec<LogEntryInfo>, Box<dyn std::error::Error>> {
    let path = data_dir.join(format!("{}.log", node.key()));
    if !path.exists() {
        return Err(format!("commit log not found: {}", path.display()).into());
    }

    let entries = CommitLog::read_tail(&path, limit.unwrap_or(usize::MAX))?;
    Ok(entries.iter().map(LogEntryInfo::from).collect())
}

fn print_text_output(node: NodeId, entries: &[LogEntryInfo]) {
    println!("Commit log of {node}: {} entries", entries.len());
    println!();
    for entry in entries {
        let mut line = format!(
            "#{:<6} {:<20} txn:{:<6} {}",
            entry.log_id, entry.kind, entry.transaction_id, entry.change_id
        );
        if let Some(target) = entry.target {
            line.push_str(&format!(" -> {target}"));
        }
        if let (Some(origin), Some(ops)) = (entry.origin, entry.ops) {
            line.push_str(&format!(" from {origin}, {ops} op(s)"));
        }
        if let Some(error) = &entry.error {
            line.push_str(&format!(" [{error}]"));
        }
        println!("{line}");
    }
}
