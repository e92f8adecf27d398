//! Per-peer sync accounting.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecordType {
    Node,
    Member,
    Bag,
    Ingest,
    Digest,
    FixityCheck,
    Replication,
    Restore,
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RecordType::Node => "node",
            RecordType::Member => "member",
            RecordType::Bag => "bag",
            RecordType::Ingest => "ingest",
            RecordType::Digest => "digest",
            RecordType::FixityCheck => "fixity_check",
            RecordType::Replication => "replication",
            RecordType::Restore => "restore",
        };
        write!(f, "{}", name)
    }
}

/// Outcome of syncing one peer: how many records were fetched and how many
/// were created or updated locally, plus the first error per record type.
#[derive(Debug, Clone, Default)]
pub struct NodeSyncResult {
    pub namespace: String,
    pub fetched: BTreeMap<RecordType, usize>,
    pub synced: BTreeMap<RecordType, usize>,
    pub errors: BTreeMap<RecordType, String>,
}

impl NodeSyncResult {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    pub fn add_fetched(&mut self, kind: RecordType, count: usize) {
        *self.fetched.entry(kind).or_insert(0) += count;
    }

    pub fn add_synced(&mut self, kind: RecordType) {
        *self.synced.entry(kind).or_insert(0) += 1;
    }

    pub fn record_error(&mut self, kind: RecordType, error: impl std::fmt::Display) {
        self.errors.entry(kind).or_insert_with(|| error.to_string());
    }

    pub fn fetched(&self, kind: RecordType) -> usize {
        self.fetched.get(&kind).copied().unwrap_or(0)
    }

    pub fn synced(&self, kind: RecordType) -> usize {
        self.synced.get(&kind).copied().unwrap_or(0)
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}
