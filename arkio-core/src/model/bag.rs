use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A preserved bag as known to a node's registry.
///
/// The `admin_node` is the single authority for this record: during sync a
/// bag is only ever accepted from the peer that administers it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bag {
    pub uuid: Uuid,
    pub local_id: String,
    pub member: Uuid,
    pub size: u64,
    pub version: u32,
    pub ingest_node: String,
    pub admin_node: String,
    #[serde(default)]
    pub replicating_nodes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bag {
    /// Cold-storage object key for this bag's serialized form.
    pub fn tar_key(&self) -> String {
        format!("{}.tar", self.uuid)
    }
}

/// Ingest fact attached to a bag, synced from the bag's admin node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ingest {
    pub ingest_id: Uuid,
    pub bag: Uuid,
    pub ingested: bool,
    #[serde(default)]
    pub replicating_nodes: Vec<String>,
    pub created_at: DateTime<Utc>,
}
