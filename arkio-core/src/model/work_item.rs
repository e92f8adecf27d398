use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkItemAction {
    Replication,
    Ingest,
    Restore,
}

impl std::fmt::Display for WorkItemAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkItemAction::Replication => write!(f, "replication"),
            WorkItemAction::Ingest => write!(f, "ingest"),
            WorkItemAction::Restore => write!(f, "restore"),
        }
    }
}

/// The durable, resumable unit of scheduling.
///
/// The queue message body carries only the decimal `id`; the record itself is
/// always re-fetched from the registry. `state` holds the serialized task
/// manifest that lets a new process resume after a crash or redelivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: i64,
    pub action: WorkItemAction,
    /// UUID of the bag this task concerns.
    pub identifier: Uuid,
    /// Source-object identifier, set for ingest tasks.
    #[serde(default)]
    pub local_id: Option<String>,
    /// Operator-visible status note, usually the first error text.
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub retry: bool,
    #[serde(default)]
    pub processing_node: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    /// When the current claim was taken. A claim older than the staleness
    /// threshold may be reclaimed by another worker.
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    /// Serialized task manifest; absent means a fresh task.
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(action: WorkItemAction, identifier: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            action,
            identifier,
            local_id: None,
            note: None,
            retry: true,
            processing_node: None,
            pid: None,
            claimed_at: None,
            state: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn claim(&mut self, node: &str, pid: u32) {
        self.processing_node = Some(node.to_string());
        self.pid = Some(pid);
        self.claimed_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }

    /// Clears the ownership pair on terminal success or failure.
    pub fn release(&mut self) {
        self.processing_node = None;
        self.pid = None;
        self.claimed_at = None;
        self.updated_at = Utc::now();
    }

    /// True when another live owner holds this item.
    ///
    /// A claim without a timestamp, or older than `staleness`, is treated as
    /// left over from a crashed worker and may be reclaimed.
    pub fn is_claimed_elsewhere(&self, node: &str, pid: u32, staleness: Duration) -> bool {
        match (&self.processing_node, self.pid) {
            (Some(owner), Some(owner_pid)) => {
                if owner == node && owner_pid == pid {
                    return false;
                }
                match self.claimed_at {
                    Some(at) => Utc::now() - at < staleness,
                    None => false,
                }
            }
            _ => false,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_and_release() {
        let mut item = WorkItem::new(WorkItemAction::Replication, Uuid::new_v4());
        item.claim("aptrust", 4242);
        assert_eq!(item.processing_node.as_deref(), Some("aptrust"));
        assert_eq!(item.pid, Some(4242));
        assert!(item.claimed_at.is_some());

        item.release();
        assert!(item.processing_node.is_none());
        assert!(item.pid.is_none());
        assert!(item.claimed_at.is_none());
    }

    #[test]
    fn test_claimed_elsewhere_respects_owner_and_staleness() {
        let mut item = WorkItem::new(WorkItemAction::Replication, Uuid::new_v4());
        item.claim("chron", 1);

        let hour = Duration::hours(1);
        assert!(item.is_claimed_elsewhere("aptrust", 2, hour));
        assert!(!item.is_claimed_elsewhere("chron", 1, hour));

        // A stale claim is reclaimable.
        item.claimed_at = Some(Utc::now() - Duration::hours(3));
        assert!(!item.is_claimed_elsewhere("aptrust", 2, hour));
    }
}
