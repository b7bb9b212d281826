use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::config::data_dir;
use crate::model::board::BoardOperation;

/// One line in the audit log: an operation the engine emitted and what
/// happened when it was applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub operation: BoardOperation,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn new_entry(
    operation: &BoardOperation,
    outcome: &str,
    assigned_id: Option<u64>,
    error: Option<String>,
) -> AuditEntry {
    AuditEntry {
        timestamp: chrono::Utc::now().to_rfc3339(),
        operation: operation.clone(),
        outcome: outcome.to_string(),
        assigned_id,
        error,
    }
}

fn log_path() -> PathBuf {
    data_dir().join("audit.jsonl")
}

pub fn append_entry(entry: &AuditEntry) -> Result<()> {
    append_entry_at(&log_path(), entry)
}

pub fn append_entry_at(path: &Path, entry: &AuditEntry) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let line = serde_json::to_string(entry)?;
    writeln!(file, "{line}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::record::RecordId;

    #[test]
    fn entries_append_as_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let op = BoardOperation::CloseTask { task: 5 };
        append_entry_at(&path, &new_entry(&op, "applied", None, None)).unwrap();
        let op = BoardOperation::CreateTask {
            reference: RecordId::issue("p", 1),
            title: "T".into(),
            description: String::new(),
            column: "TODO".into(),
            swimlane: None,
            tags: Default::default(),
        };
        append_entry_at(&path, &new_entry(&op, "applied", Some(501), None)).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: AuditEntry = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed.assigned_id, Some(501));
        assert_eq!(parsed.outcome, "applied");
    }
}
