//! Dump oplog command implementation.

use super::open_existing;
use serde::Serialize;
use sessiontxn_codec::{Document, Value};
use sessiontxn_core::{CoreError, OplogEntry, StorageEngine};
use std::path::Path;
use uuid::Uuid;

/// Oplog entry representation for output.
#[derive(Debug, Serialize)]
pub struct EntryInfo {
    /// Position.
    pub op_time: String,
    /// Operation type code.
    pub op: String,
    /// Namespace.
    pub ns: String,
    /// Writing session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    /// Transaction number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txn_number: Option<i64>,
    /// Statement id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stmt_id: Option<i32>,
    /// Previous write of the same transaction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_op_time: Option<String>,
    /// Payload.
    pub o: serde_json::Value,
    /// Secondary payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub o2: Option<serde_json::Value>,
}

impl From<&OplogEntry> for EntryInfo {
    fn from(entry: &OplogEntry) -> Self {
        Self {
            op_time: entry.op_time.to_string(),
            op: entry.op_type.as_str().to_string(),
            ns: entry.ns.clone(),
            session: entry.session_info.session_id.map(|s| s.to_string()),
            txn_number: entry.session_info.txn_number,
            stmt_id: entry.statement_id,
            prev_op_time: entry.prev_write_op_time.map(|t| t.to_string()),
            o: document_to_json(&entry.object),
            o2: entry.object2.as_ref().map(document_to_json),
        }
    }
}

/// One session's statement chain, newest first.
#[derive(Debug, Serialize)]
pub struct SessionChain {
    /// Session id.
    pub session: String,
    /// Transaction the chain belongs to.
    pub txn_number: i64,
    /// Entries found.
    pub entries: Vec<EntryInfo>,
    /// Set when the chain runs into truncated history.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incomplete: Option<String>,
}

/// Runs the dump-oplog command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    session: Option<&str>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = open_existing(path)?;
    let max_entries = limit.unwrap_or(usize::MAX);

    if let Some(session) = session {
        let id = Uuid::parse_str(session)?;
        let chains = session_chains(&engine, id, max_entries)?;
        if chains.is_empty() {
            return Err(format!("no session transaction record for {id}").into());
        }
        match format {
            "json" => println!("{}", serde_json::to_string_pretty(&chains)?),
            _ => {
                for chain in &chains {
                    println!("Session {} (txn {})", chain.session, chain.txn_number);
                    print_text_output(&chain.entries);
                    if let Some(reason) = &chain.incomplete {
                        println!("  ... history incomplete: {reason}");
                    }
                }
            }
        }
        return Ok(());
    }

    let entries: Vec<EntryInfo> = engine
        .oplog()
        .entries()?
        .iter()
        .take(max_entries)
        .map(EntryInfo::from)
        .collect();
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&entries)?),
        _ => print_text_output(&entries),
    }
    Ok(())
}

fn session_chains(
    engine: &StorageEngine,
    id: Uuid,
    max_entries: usize,
) -> Result<Vec<SessionChain>, CoreError> {
    let mut chains = Vec::new();
    for record in engine
        .session_table()
        .records()
        .into_iter()
        .filter(|r| r.session_id.id() == id)
    {
        let mut chain = SessionChain {
            session: record.session_id.to_string(),
            txn_number: record.txn_num,
            entries: Vec::new(),
            incomplete: None,
        };
        for entry in engine
            .oplog()
            .history(record.last_write_op_time)
            .take(max_entries)
        {
            match entry {
                Ok(entry) => chain.entries.push(EntryInfo::from(&entry)),
                Err(CoreError::IncompleteHistory { message }) => {
                    chain.incomplete = Some(message);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        chains.push(chain);
    }
    Ok(chains)
}

fn print_text_output(entries: &[EntryInfo]) {
    println!(
        "{:<22} {:<3} {:<24} {:>6} {:>6}  PAYLOAD",
        "OPTIME", "OP", "NS", "TXN", "STMT"
    );
    for entry in entries {
        println!(
            "{:<22} {:<3} {:<24} {:>6} {:>6}  {}",
            entry.op_time,
            entry.op,
            entry.ns,
            entry.txn_number.map_or_else(|| "-".to_string(), |n| n.to_string()),
            entry.stmt_id.map_or_else(|| "-".to_string(), |n| n.to_string()),
            entry.o
        );
    }
    println!();
    println!("Total: {} entries", entries.len());
}

fn document_to_json(doc: &Document) -> serde_json::Value {
    serde_json::Value::Object(
        doc.iter()
            .map(|(k, v)| (k.to_string(), value_to_json(v)))
            .collect(),
    )
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(n) => serde_json::Value::from(*n),
        Value::Bytes(bytes) => {
            let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
            serde_json::Value::String(hex)
        }
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
        Value::Document(doc) => document_to_json(doc),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_values_convert() {
        let doc = Document::new()
            .with("n", 3_i64)
            .with("id", Value::Bytes(vec![0xab, 0x01]))
            .with("inner", Document::new().with("ok", true));
        let json = document_to_json(&doc);
        assert_eq!(json["n"], 3);
        assert_eq!(json["id"], "ab01");
        assert_eq!(json["inner"]["ok"], true);
    }
}
