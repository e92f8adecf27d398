//! Typed clients for a node's metadata registry.
//!
//! Every node runs its own registry; arkio talks to its local one and to each
//! peer's through the same [`Registry`] trait. Two backends ship: an HTTP
//! client for real registries and an in-memory one for tests and single-node
//! local mode.

pub mod http;
pub mod memory;

use crate::model::{
    Bag, FixityCheck, Ingest, Member, MessageDigest, NodeRecord, PagedResponse,
    ReplicationTransfer, RestoreTransfer, WorkItem, WorkItemAction,
};
use crate::{ArkError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

pub use http::HttpRegistry;
pub use memory::MemoryRegistry;

/// Outcome of a create call; conflict is not an error for append-only records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Query parameters for list endpoints.
///
/// Opaque cursor parameters from a page's `Next` link are merged in
/// unmodified via [`ListParams::merge`].
#[derive(Debug, Clone, Default)]
pub struct ListParams {
    params: BTreeMap<String, String>,
}

impl ListParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn admin_node(self, namespace: &str) -> Self {
        self.set("admin_node", namespace)
    }

    pub fn from_node(self, namespace: &str) -> Self {
        self.set("from_node", namespace)
    }

    pub fn to_node(self, namespace: &str) -> Self {
        self.set("to_node", namespace)
    }

    pub fn node(self, namespace: &str) -> Self {
        self.set("node", namespace)
    }

    pub fn bag(self, uuid: Uuid) -> Self {
        self.set("bag", uuid.to_string())
    }

    pub fn action(self, action: WorkItemAction) -> Self {
        self.set("action", action.to_string())
    }

    pub fn identifier(self, uuid: Uuid) -> Self {
        self.set("identifier", uuid.to_string())
    }

    pub fn local_id(self, local_id: &str) -> Self {
        self.set("local_id", local_id)
    }

    pub fn completed(self, completed: bool) -> Self {
        self.set("completed", completed.to_string())
    }

    pub fn after(self, watermark: DateTime<Utc>) -> Self {
        self.set("after", watermark.to_rfc3339())
    }

    pub fn page_size(self, size: usize) -> Self {
        self.set("page_size", size.to_string())
    }

    pub fn merge(mut self, params: BTreeMap<String, String>) -> Self {
        self.params.extend(params);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[async_trait]
pub trait Registry: Send + Sync {
    // Nodes
    async fn get_node(&self, namespace: &str) -> Result<NodeRecord>;
    async fn create_node(&self, node: &NodeRecord) -> Result<CreateOutcome>;
    async fn update_node(&self, node: &NodeRecord) -> Result<()>;

    // Members
    async fn list_members(&self, params: &ListParams) -> Result<PagedResponse<Member>>;
    async fn create_member(&self, member: &Member) -> Result<CreateOutcome>;

    // Bags
    async fn get_bag(&self, uuid: Uuid) -> Result<Bag>;
    async fn list_bags(&self, params: &ListParams) -> Result<PagedResponse<Bag>>;
    async fn create_bag(&self, bag: &Bag) -> Result<CreateOutcome>;
    async fn update_bag(&self, bag: &Bag) -> Result<()>;

    // Ingests
    async fn list_ingests(&self, params: &ListParams) -> Result<PagedResponse<Ingest>>;
    async fn create_ingest(&self, ingest: &Ingest) -> Result<CreateOutcome>;

    // Digests
    async fn latest_digest(&self, bag: Uuid, algorithm: &str) -> Result<MessageDigest>;
    async fn list_digests(&self, params: &ListParams) -> Result<PagedResponse<MessageDigest>>;
    async fn create_digest(&self, digest: &MessageDigest) -> Result<CreateOutcome>;

    // Fixity checks
    async fn list_fixity_checks(&self, params: &ListParams)
        -> Result<PagedResponse<FixityCheck>>;
    async fn create_fixity_check(&self, check: &FixityCheck) -> Result<CreateOutcome>;

    // Replication transfers
    async fn get_replication(&self, id: Uuid) -> Result<ReplicationTransfer>;
    async fn list_replications(
        &self,
        params: &ListParams,
    ) -> Result<PagedResponse<ReplicationTransfer>>;
    async fn create_replication(&self, xfer: &ReplicationTransfer) -> Result<CreateOutcome>;
    async fn update_replication(&self, xfer: &ReplicationTransfer) -> Result<()>;

    // Restore transfers
    async fn get_restore(&self, id: Uuid) -> Result<RestoreTransfer>;
    async fn list_restores(&self, params: &ListParams) -> Result<PagedResponse<RestoreTransfer>>;
    async fn create_restore(&self, xfer: &RestoreTransfer) -> Result<CreateOutcome>;
    async fn update_restore(&self, xfer: &RestoreTransfer) -> Result<()>;

    // Work items
    async fn get_work_item(&self, id: i64) -> Result<WorkItem>;
    async fn list_work_items(&self, params: &ListParams) -> Result<PagedResponse<WorkItem>>;
    async fn create_work_item(&self, item: &WorkItem) -> Result<WorkItem>;
    async fn update_work_item(&self, item: &WorkItem) -> Result<()>;
}

/// Peer registries indexed by node namespace.
#[derive(Clone, Default)]
pub struct RemoteRegistries {
    registries: BTreeMap<String, Arc<dyn Registry>>,
}

impl RemoteRegistries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, namespace: impl Into<String>, registry: Arc<dyn Registry>) {
        self.registries.insert(namespace.into(), registry);
    }

    pub fn get(&self, namespace: &str) -> Result<Arc<dyn Registry>> {
        self.registries
            .get(namespace)
            .cloned()
            .ok_or_else(|| ArkError::NotFound(format!("no registry for node '{}'", namespace)))
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.registries.keys().cloned().collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RegistryBuilder {
    backend: Option<String>,
    api_root: Option<String>,
    token: Option<String>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn api_root(mut self, api_root: impl Into<String>) -> Self {
        self.api_root = Some(api_root.into());
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn build(&self) -> Result<Arc<dyn Registry>> {
        let backend = self
            .backend
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match backend.as_str() {
            "http" => {
                let api_root = self.api_root.as_deref().unwrap_or_default().trim();
                if api_root.is_empty() {
                    return Err(ArkError::Config(
                        "api_root is required for http registry backend".to_string(),
                    ));
                }
                let token = self.token.as_deref().unwrap_or_default().trim();
                Ok(Arc::new(HttpRegistry::new(api_root, token)?))
            }
            "memory" => Ok(Arc::new(MemoryRegistry::new())),
            other => Err(ArkError::Config(format!(
                "unsupported registry backend: {}",
                other
            ))),
        }
    }
}
