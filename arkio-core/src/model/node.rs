use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A peer node's connection info and replication relationships.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Short unique namespace, e.g. `aptrust` or `chron`.
    pub namespace: String,
    pub name: String,
    pub api_root: String,
    #[serde(default)]
    pub ssh_username: Option<String>,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub fixity_algorithms: Vec<String>,
    #[serde(default)]
    pub replicate_from: Vec<String>,
    #[serde(default)]
    pub replicate_to: Vec<String>,
    #[serde(default)]
    pub restore_from: Vec<String>,
    #[serde(default)]
    pub restore_to: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Local sync watermark for this peer. Local bookkeeping only; the peer's
    /// own record never carries it.
    #[serde(default)]
    pub last_pull_date: Option<DateTime<Utc>>,
}

impl NodeRecord {
    pub fn supports_protocol(&self, protocol: &str) -> bool {
        self.protocols.iter().any(|p| p == protocol)
    }
}
