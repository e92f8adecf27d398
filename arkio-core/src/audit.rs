//! Append-only audit log of terminal task outcomes.
//!
//! One JSON line per finished or requeued task, written by the terminal
//! pipeline stage and read only by humans and reconciliation tooling.

use crate::model::WorkItemAction;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Succeeded,
    Failed,
    Requeued,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub action: WorkItemAction,
    pub work_item_id: i64,
    pub bag: Uuid,
    pub outcome: AuditOutcome,
    pub errors: Vec<String>,
}

pub struct AuditLog {
    path: PathBuf,
    writer: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            writer: Mutex::new(()),
        })
    }

    pub async fn append(&self, entry: &AuditEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let _guard = self.writer.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    /// Reads all entries back; used by tests and operator tooling only.
    pub async fn read_all(&self) -> Result<Vec<AuditEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let mut entries = Vec::new();
        for line in raw.lines().filter(|line| !line.trim().is_empty()) {
            entries.push(serde_json::from_str(line)?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit/outcomes.jsonl")).unwrap();

        log.append(&AuditEntry {
            at: Utc::now(),
            action: WorkItemAction::Replication,
            work_item_id: 5,
            bag: Uuid::new_v4(),
            outcome: AuditOutcome::Succeeded,
            errors: vec![],
        })
        .await
        .unwrap();
        log.append(&AuditEntry {
            at: Utc::now(),
            action: WorkItemAction::Restore,
            work_item_id: 6,
            bag: Uuid::new_v4(),
            outcome: AuditOutcome::Failed,
            errors: vec!["fixity mismatch".to_string()],
        })
        .await
        .unwrap();

        let entries = log.read_all().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].outcome, AuditOutcome::Succeeded);
        assert_eq!(entries[1].errors, vec!["fixity mismatch"]);
    }
}
