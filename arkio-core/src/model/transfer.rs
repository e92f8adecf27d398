use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A replication of one bag from `from_node` to `to_node`.
///
/// State machine: requested -> content copied (receiver reports
/// `fixity_value`) -> `store_requested` set by the sender after verifying
/// that digest -> `stored` or `cancelled`. `stored` and `cancelled` are
/// terminal and mutually exclusive; a worker that encounters a terminal
/// record must skip it and only post advisory reconciliation writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationTransfer {
    pub replication_id: Uuid,
    pub from_node: String,
    pub to_node: String,
    pub bag: Uuid,
    pub fixity_algorithm: String,
    /// Tag-manifest digest computed and reported back by the receiving node.
    #[serde(default)]
    pub fixity_value: Option<String>,
    /// Set by the sending node only, after verifying `fixity_value`.
    #[serde(default)]
    pub store_requested: bool,
    #[serde(default)]
    pub stored: bool,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub cancel_reason: Option<String>,
    pub protocol: String,
    /// Protocol-qualified remote path, e.g. `user@host:outbound/<uuid>.tar`.
    pub link: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReplicationTransfer {
    pub fn is_terminal(&self) -> bool {
        self.stored || self.cancelled
    }

    /// Marks the transfer cancelled, preserving any existing reason.
    pub fn cancel(&mut self, reason: &str) {
        if !self.cancelled {
            self.cancelled = true;
            self.cancel_reason = Some(reason.to_string());
        }
        self.updated_at = Utc::now();
    }

    pub fn mark_stored(&mut self) {
        self.stored = true;
        self.updated_at = Utc::now();
    }
}

/// A restore of one bag back to the node that lost it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreTransfer {
    pub restore_id: Uuid,
    pub from_node: String,
    pub to_node: String,
    pub bag: Uuid,
    pub protocol: String,
    pub link: String,
    #[serde(default)]
    pub accepted: bool,
    #[serde(default)]
    pub finished: bool,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RestoreTransfer {
    pub fn is_terminal(&self) -> bool {
        self.finished || self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer() -> ReplicationTransfer {
        ReplicationTransfer {
            replication_id: Uuid::new_v4(),
            from_node: "aptrust".to_string(),
            to_node: "chron".to_string(),
            bag: Uuid::new_v4(),
            fixity_algorithm: "sha256".to_string(),
            fixity_value: None,
            store_requested: false,
            stored: false,
            cancelled: false,
            cancel_reason: None,
            protocol: "rsync".to_string(),
            link: "preserve@aptrust.example:outbound/bag.tar".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_cancel_preserves_existing_reason() {
        let mut xfer = transfer();
        xfer.cancel("failed validation: checksum mismatch");
        xfer.cancel("second reason that must not win");

        assert!(xfer.cancelled);
        assert!(xfer.is_terminal());
        assert_eq!(
            xfer.cancel_reason.as_deref(),
            Some("failed validation: checksum mismatch")
        );
    }

    #[test]
    fn test_terminal_states() {
        let mut xfer = transfer();
        assert!(!xfer.is_terminal());
        xfer.mark_stored();
        assert!(xfer.is_terminal());
    }
}
