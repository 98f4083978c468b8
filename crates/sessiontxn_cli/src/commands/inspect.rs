//! Inspect command implementation.

use super::open_existing;
use serde::Serialize;
use sessiontxn_core::SessionTxnRecord;
use std::path::Path;

/// Data directory summary.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Data directory path.
    pub path: String,
    /// Live oplog entries.
    pub oplog_entries: usize,
    /// Oplog file size in bytes.
    pub oplog_bytes: u64,
    /// Oldest live entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_op_time: Option<String>,
    /// Newest entry.
    pub last_applied: String,
    /// Retention point, if the oplog was ever truncated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated_before: Option<String>,
    /// One row per session.
    pub sessions: Vec<SessionRow>,
}

/// A session transaction record.
#[derive(Debug, Serialize)]
pub struct SessionRow {
    /// Session id as displayed in logs.
    pub session: String,
    /// Client-chosen UUID of the session.
    pub uuid: String,
    /// Newest transaction number.
    pub txn_number: i64,
    /// Position of the newest write.
    pub last_write_op_time: String,
    /// Wall-clock time of the newest write, in milliseconds.
    pub last_write_date: i64,
}

impl From<&SessionTxnRecord> for SessionRow {
    fn from(record: &SessionTxnRecord) -> Self {
        Self {
            session: record.session_id.to_string(),
            uuid: record.session_id.id().to_string(),
            txn_number: record.txn_num,
            last_write_op_time: record.last_write_op_time.to_string(),
            last_write_date: record.last_write_date.as_millis(),
        }
    }
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let engine = open_existing(path)?;
    let oplog = engine.oplog();

    let result = InspectResult {
        path: path.display().to_string(),
        oplog_entries: oplog.len(),
        oplog_bytes: oplog.size_bytes()?,
        first_op_time: oplog.first_op_time().map(|t| t.to_string()),
        last_applied: oplog.last_applied().to_string(),
        truncated_before: oplog.truncated_before().map(|t| t.to_string()),
        sessions: engine
            .session_table()
            .records()
            .iter()
            .map(SessionRow::from)
            .collect(),
    };

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("Data directory: {}", result.path);
    println!();
    println!("Oplog:");
    println!("  Entries:          {}", result.oplog_entries);
    println!("  Size:             {} bytes", result.oplog_bytes);
    if let Some(first) = &result.first_op_time {
        println!("  First entry:      {first}");
    }
    println!("  Last applied:     {}", result.last_applied);
    if let Some(truncated) = &result.truncated_before {
        println!("  Truncated before: {truncated}");
    }
    println!();
    println!("Sessions: {}", result.sessions.len());
    for row in &result.sessions {
        println!(
            "  {}  txn {}  last write {} at {}ms",
            row.session, row.txn_number, row.last_write_op_time, row.last_write_date
        );
    }
}
