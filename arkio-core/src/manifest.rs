//! Resumable per-task state.
//!
//! A [`TaskManifest`] is rebuilt from the work item's `state` blob on intake
//! and written back after every stage transition; it is never persisted
//! anywhere else. That round-trip is what lets processing survive crashes and
//! queue redelivery.

use crate::model::{WorkItem, WorkItemAction};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Intake,
    Copy,
    Package,
    Validate,
    Store,
    Record,
    RestoreInit,
    Retrieve,
    FixityCheck,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Intake => "intake",
            Stage::Copy => "copy",
            Stage::Package => "package",
            Stage::Validate => "validate",
            Stage::Store => "store",
            Stage::Record => "record",
            Stage::RestoreInit => "restore_init",
            Stage::Retrieve => "retrieve",
            Stage::FixityCheck => "fixity_check",
        };
        write!(f, "{}", name)
    }
}

/// Progress and error tracker for one pipeline stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkSummary {
    pub attempted: bool,
    pub attempt_count: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub errors: Vec<String>,
    pub error_is_fatal: bool,
    pub retry: bool,
}

impl WorkSummary {
    pub fn new() -> Self {
        Self {
            retry: true,
            ..Self::default()
        }
    }

    /// Begins a run of this stage. Errors from earlier attempts are cleared;
    /// a redelivered task gets a clean slate for the stages it re-runs.
    pub fn start(&mut self) {
        self.attempted = true;
        self.attempt_count += 1;
        self.started_at = Some(Utc::now());
        self.finished_at = None;
        self.errors.clear();
        self.error_is_fatal = false;
        self.retry = true;
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Records a terminal error; fatal summaries are never retried.
    pub fn add_fatal_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.error_is_fatal = true;
        self.retry = false;
    }

    pub fn first_error(&self) -> Option<&str> {
        self.errors.first().map(String::as_str)
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn succeeded(&self) -> bool {
        self.finished_at.is_some() && self.errors.is_empty()
    }

    pub fn run_time(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// In-memory reconstruction of one work item's task state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskManifest {
    /// Schema version so future fields can be added without breaking
    /// deserialization of older in-flight items.
    pub schema_version: u32,
    pub work_item_id: i64,
    pub action: WorkItemAction,
    pub bag: Uuid,
    #[serde(default)]
    pub transfer_id: Option<Uuid>,
    #[serde(default)]
    pub summaries: BTreeMap<Stage, WorkSummary>,
    /// Restore-resume fields: a recall from cold storage typically completes
    /// hours later, in another process's lifetime.
    #[serde(default)]
    pub restore_requested: bool,
    #[serde(default)]
    pub estimated_available_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub available_in_cold: bool,
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    #[serde(default)]
    pub note: Option<String>,
}

impl TaskManifest {
    pub fn new(work_item_id: i64, action: WorkItemAction, bag: Uuid) -> Self {
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            work_item_id,
            action,
            bag,
            transfer_id: None,
            summaries: BTreeMap::new(),
            restore_requested: false,
            estimated_available_at: None,
            available_in_cold: false,
            local_path: None,
            note: None,
        }
    }

    /// Rebuilds the manifest from a work item's state blob.
    ///
    /// An absent or empty blob means a fresh task, not an error.
    pub fn from_work_item(item: &WorkItem) -> Result<Self> {
        match item.state.as_deref().map(str::trim) {
            Some(blob) if !blob.is_empty() => {
                let mut manifest: TaskManifest = serde_json::from_str(blob)?;
                manifest.work_item_id = item.id;
                Ok(manifest)
            }
            _ => Ok(Self::new(item.id, item.action, item.identifier)),
        }
    }

    pub fn to_state(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn summary(&mut self, stage: Stage) -> &mut WorkSummary {
        self.summaries.entry(stage).or_insert_with(WorkSummary::new)
    }

    pub fn summary_ref(&self, stage: Stage) -> Option<&WorkSummary> {
        self.summaries.get(&stage)
    }

    /// True when any stage recorded a fatal error.
    pub fn fatal(&self) -> bool {
        self.summaries.values().any(|s| s.error_is_fatal)
    }

    pub fn has_errors(&self) -> bool {
        self.summaries.values().any(WorkSummary::has_errors)
    }

    /// Whether the task should go back on the queue.
    pub fn should_retry(&self) -> bool {
        !self.fatal() && self.summaries.values().any(|s| s.has_errors() && s.retry)
    }

    /// First error across stages, in stage order; copied into the work item's
    /// operator-visible note.
    pub fn first_error(&self) -> Option<&str> {
        self.summaries.values().find_map(WorkSummary::first_error)
    }

    pub fn all_errors(&self) -> Vec<String> {
        self.summaries
            .values()
            .flat_map(|s| s.errors.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_summary_lifecycle() {
        let mut summary = WorkSummary::new();
        assert!(!summary.attempted);
        assert!(summary.retry);

        summary.start();
        summary.start();
        assert_eq!(summary.attempt_count, 2);

        summary.add_error("upload timeout");
        summary.finish();
        assert!(!summary.succeeded());
        assert_eq!(summary.first_error(), Some("upload timeout"));
        assert!(summary.run_time().is_some());

        summary.add_fatal_error("attempt count exceeded");
        assert!(summary.error_is_fatal);
        assert!(!summary.retry);
    }

    #[test]
    fn test_manifest_survives_state_round_trip() {
        let bag = Uuid::new_v4();
        let mut manifest = TaskManifest::new(17, WorkItemAction::Restore, bag);
        manifest.restore_requested = true;
        manifest.estimated_available_at = Some(Utc::now());
        manifest.summary(Stage::RestoreInit).start();
        manifest.summary(Stage::RestoreInit).finish();

        let mut item = WorkItem::new(WorkItemAction::Restore, bag);
        item.id = 17;
        item.state = Some(manifest.to_state().unwrap());

        let rebuilt = TaskManifest::from_work_item(&item).unwrap();
        assert_eq!(rebuilt.schema_version, MANIFEST_SCHEMA_VERSION);
        assert!(rebuilt.restore_requested);
        assert!(rebuilt.summary_ref(Stage::RestoreInit).unwrap().succeeded());
    }

    #[test]
    fn test_absent_state_blob_means_fresh_task() {
        let mut item = WorkItem::new(WorkItemAction::Replication, Uuid::new_v4());
        item.id = 9;
        item.state = None;

        let manifest = TaskManifest::from_work_item(&item).unwrap();
        assert_eq!(manifest.work_item_id, 9);
        assert!(manifest.summaries.is_empty());

        item.state = Some("   ".to_string());
        assert!(TaskManifest::from_work_item(&item).is_ok());
    }

    #[test]
    fn test_retry_and_fatal_fold() {
        let mut manifest =
            TaskManifest::new(1, WorkItemAction::Replication, Uuid::new_v4());
        manifest.summary(Stage::Copy).add_error("rsync exited with 30");
        assert!(manifest.should_retry());
        assert!(!manifest.fatal());

        manifest
            .summary(Stage::Validate)
            .add_fatal_error("failed validation: checksum mismatch");
        assert!(manifest.fatal());
        assert!(!manifest.should_retry());
        assert_eq!(manifest.first_error(), Some("rsync exited with 30"));
    }
}
