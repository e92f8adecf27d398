//! Sender-side digest confirmation sweep.
//!
//! When a receiving node finishes copying a bag it writes the digest it
//! computed onto the transfer record. This sweep runs on the sending node,
//! compares each reported digest with the registry's own latest digest, and
//! either approves the store or cancels the transfer.

use crate::registry::{ListParams, Registry};
use crate::{ArkError, Result};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfirmStats {
    pub examined: usize,
    pub approved: usize,
    pub cancelled: usize,
}

pub struct FixityConfirmer {
    registry: Arc<dyn Registry>,
    local_node: String,
}

impl FixityConfirmer {
    pub fn new(registry: Arc<dyn Registry>, local_node: impl Into<String>) -> Self {
        Self {
            registry,
            local_node: local_node.into(),
        }
    }

    /// One full sweep over this node's outbound transfers.
    pub async fn run_once(&self) -> Result<ConfirmStats> {
        let mut stats = ConfirmStats::default();
        let mut params = ListParams::new().from_node(&self.local_node);

        loop {
            let page = self.registry.list_replications(&params).await?;
            for xfer in &page.results {
                if xfer.is_terminal() || xfer.store_requested {
                    continue;
                }
                let Some(reported) = xfer.fixity_value.clone() else {
                    continue;
                };
                stats.examined += 1;

                let expected = match self
                    .registry
                    .latest_digest(xfer.bag, &xfer.fixity_algorithm)
                    .await
                {
                    Ok(digest) => digest.value,
                    Err(ArkError::NotFound(_)) => {
                        tracing::warn!(
                            "No {} digest recorded for bag {}; cannot confirm transfer {}",
                            xfer.fixity_algorithm,
                            xfer.bag,
                            xfer.replication_id
                        );
                        continue;
                    }
                    Err(error) => return Err(error),
                };

                let mut updated = xfer.clone();
                if reported == expected {
                    updated.store_requested = true;
                    updated.updated_at = chrono::Utc::now();
                    self.registry.update_replication(&updated).await?;
                    stats.approved += 1;
                    tracing::info!(
                        "Approved store of bag {} on {}",
                        xfer.bag,
                        xfer.to_node
                    );
                } else {
                    updated.cancel(&format!(
                        "reported digest {} does not match recorded digest",
                        reported
                    ));
                    self.registry.update_replication(&updated).await?;
                    stats.cancelled += 1;
                    tracing::warn!(
                        "Cancelled transfer {} of bag {}: digest mismatch",
                        xfer.replication_id,
                        xfer.bag
                    );
                }
            }

            match page.next_page_params()? {
                Some(cursor) => params = ListParams::new().merge(cursor),
                None => break,
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessageDigest, ReplicationTransfer};
    use crate::registry::MemoryRegistry;
    use chrono::Utc;
    use uuid::Uuid;

    fn transfer(bag: Uuid, to_node: &str, fixity_value: Option<&str>) -> ReplicationTransfer {
        let now = Utc::now();
        ReplicationTransfer {
            replication_id: Uuid::new_v4(),
            from_node: "chron".to_string(),
            to_node: to_node.to_string(),
            bag,
            fixity_algorithm: "sha256".to_string(),
            fixity_value: fixity_value.map(str::to_string),
            store_requested: false,
            stored: false,
            cancelled: false,
            cancel_reason: None,
            protocol: "rsync".to_string(),
            link: "/staging/bag.tar".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    async fn record_digest(registry: &MemoryRegistry, bag: Uuid, value: &str) {
        registry
            .create_digest(&MessageDigest {
                bag,
                algorithm: "sha256".to_string(),
                node: "chron".to_string(),
                value: value.to_string(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_matching_digest_approves_store() {
        let registry = Arc::new(MemoryRegistry::new());
        let bag = Uuid::new_v4();
        record_digest(&registry, bag, "abc123").await;

        let good = transfer(bag, "aptrust", Some("abc123"));
        registry.create_replication(&good).await.unwrap();

        let confirmer = FixityConfirmer::new(registry.clone(), "chron");
        let stats = confirmer.run_once().await.unwrap();
        assert_eq!(stats.examined, 1);
        assert_eq!(stats.approved, 1);
        assert_eq!(stats.cancelled, 0);

        let updated = registry.get_replication(good.replication_id).await.unwrap();
        assert!(updated.store_requested);
        assert!(!updated.cancelled);
    }

    #[tokio::test]
    async fn test_mismatched_digest_cancels() {
        let registry = Arc::new(MemoryRegistry::new());
        let bag = Uuid::new_v4();
        record_digest(&registry, bag, "abc123").await;

        let bad = transfer(bag, "lockss", Some("not-the-digest"));
        registry.create_replication(&bad).await.unwrap();

        let confirmer = FixityConfirmer::new(registry.clone(), "chron");
        let stats = confirmer.run_once().await.unwrap();
        assert_eq!(stats.cancelled, 1);

        let updated = registry.get_replication(bad.replication_id).await.unwrap();
        assert!(updated.cancelled);
        assert!(!updated.store_requested);
        assert!(
            updated
                .cancel_reason
                .unwrap()
                .contains("does not match recorded digest")
        );
    }

    #[tokio::test]
    async fn test_sweep_skips_unreported_and_terminal_transfers() {
        let registry = Arc::new(MemoryRegistry::new());
        let bag = Uuid::new_v4();
        record_digest(&registry, bag, "abc123").await;

        // Not yet copied: no fixity value.
        registry
            .create_replication(&transfer(bag, "aptrust", None))
            .await
            .unwrap();
        // Already stored.
        let mut stored = transfer(bag, "lockss", Some("abc123"));
        stored.mark_stored();
        registry.create_replication(&stored).await.unwrap();
        // Inbound transfer from another node.
        let mut inbound = transfer(bag, "chron", Some("abc123"));
        inbound.from_node = "aptrust".to_string();
        registry.create_replication(&inbound).await.unwrap();

        let confirmer = FixityConfirmer::new(registry.clone(), "chron");
        let stats = confirmer.run_once().await.unwrap();
        assert_eq!(stats.examined, 0);
        assert_eq!(stats.approved, 0);
        assert_eq!(stats.cancelled, 0);
    }

    #[tokio::test]
    async fn test_second_sweep_is_idempotent() {
        let registry = Arc::new(MemoryRegistry::new());
        let bag = Uuid::new_v4();
        record_digest(&registry, bag, "abc123").await;
        registry
            .create_replication(&transfer(bag, "aptrust", Some("abc123")))
            .await
            .unwrap();

        let confirmer = FixityConfirmer::new(registry.clone(), "chron");
        assert_eq!(confirmer.run_once().await.unwrap().approved, 1);

        let stats = confirmer.run_once().await.unwrap();
        assert_eq!(stats.examined, 0);
        assert_eq!(stats.approved, 0);
    }
}
