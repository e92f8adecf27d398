use super::{CreateOutcome, ListParams, Registry};
use crate::model::{
    Bag, FixityCheck, Ingest, Member, MessageDigest, NodeRecord, PagedResponse,
    ReplicationTransfer, RestoreTransfer, WorkItem,
};
use crate::{ArkError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::RwLock;
use uuid::Uuid;

const DEFAULT_PAGE_SIZE: usize = 50;

/// In-memory registry backend for tests and single-node local mode.
///
/// Pagination is real: list calls honor `page`/`page_size` and emit `Next`
/// links, so cursor-following callers are exercised the same way as against
/// an HTTP registry. Per-method call counts are tracked for assertions.
#[derive(Default)]
pub struct MemoryRegistry {
    inner: RwLock<Inner>,
    calls: Mutex<BTreeMap<&'static str, usize>>,
}

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<String, NodeRecord>,
    members: BTreeMap<Uuid, Member>,
    bags: BTreeMap<Uuid, Bag>,
    ingests: BTreeMap<Uuid, Ingest>,
    digests: Vec<MessageDigest>,
    fixity_checks: BTreeMap<Uuid, FixityCheck>,
    replications: BTreeMap<Uuid, ReplicationTransfer>,
    restores: BTreeMap<Uuid, RestoreTransfer>,
    work_items: BTreeMap<i64, WorkItem>,
    next_work_item_id: i64,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.get(method).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn track(&self, method: &'static str) {
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(method).or_insert(0) += 1;
        }
    }
}

fn parse_after(params: &ListParams) -> Option<DateTime<Utc>> {
    params
        .get("after")
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|stamp| stamp.with_timezone(&Utc))
}

fn page_link(path: &str, params: &ListParams, page: usize, page_size: usize) -> Result<String> {
    let mut url = Url::parse("http://registry.local/api/v1/")
        .and_then(|base| base.join(path))
        .map_err(|error| ArkError::Internal(format!("bad page link for '{}': {}", path, error)))?;

    {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in params.iter() {
            if key != "page" && key != "page_size" {
                pairs.append_pair(key, value);
            }
        }
        pairs.append_pair("page", &page.to_string());
        pairs.append_pair("page_size", &page_size.to_string());
    }

    Ok(url.to_string())
}

fn paginate<T: Clone>(path: &str, items: Vec<T>, params: &ListParams) -> Result<PagedResponse<T>> {
    let page = params
        .get("page")
        .and_then(|raw| raw.parse::<usize>().ok())
        .unwrap_or(1)
        .max(1);
    let page_size = params
        .get("page_size")
        .and_then(|raw| raw.parse::<usize>().ok())
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .max(1);

    let count = items.len() as u64;
    let start = (page - 1) * page_size;
    let results: Vec<T> = items.into_iter().skip(start).take(page_size).collect();

    let next = if start + results.len() < count as usize {
        Some(page_link(path, params, page + 1, page_size)?)
    } else {
        None
    };
    let previous = if page > 1 {
        Some(page_link(path, params, page - 1, page_size)?)
    } else {
        None
    };

    Ok(PagedResponse {
        count,
        next,
        previous,
        results,
    })
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn get_node(&self, namespace: &str) -> Result<NodeRecord> {
        self.track("get_node");
        let inner = self.inner.read().await;
        inner
            .nodes
            .get(namespace)
            .cloned()
            .ok_or_else(|| ArkError::NotFound(format!("node '{}'", namespace)))
    }

    async fn create_node(&self, node: &NodeRecord) -> Result<CreateOutcome> {
        self.track("create_node");
        let mut inner = self.inner.write().await;
        if inner.nodes.contains_key(&node.namespace) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        inner.nodes.insert(node.namespace.clone(), node.clone());
        Ok(CreateOutcome::Created)
    }

    async fn update_node(&self, node: &NodeRecord) -> Result<()> {
        self.track("update_node");
        let mut inner = self.inner.write().await;
        if !inner.nodes.contains_key(&node.namespace) {
            return Err(ArkError::NotFound(format!("node '{}'", node.namespace)));
        }
        inner.nodes.insert(node.namespace.clone(), node.clone());
        Ok(())
    }

    async fn list_members(&self, params: &ListParams) -> Result<PagedResponse<Member>> {
        self.track("list_members");
        let inner = self.inner.read().await;
        let members: Vec<Member> = inner.members.values().cloned().collect();
        paginate("members/", members, params)
    }

    async fn create_member(&self, member: &Member) -> Result<CreateOutcome> {
        self.track("create_member");
        let mut inner = self.inner.write().await;
        if inner.members.contains_key(&member.member_id) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        inner.members.insert(member.member_id, member.clone());
        Ok(CreateOutcome::Created)
    }

    async fn get_bag(&self, uuid: Uuid) -> Result<Bag> {
        self.track("get_bag");
        let inner = self.inner.read().await;
        inner
            .bags
            .get(&uuid)
            .cloned()
            .ok_or_else(|| ArkError::NotFound(format!("bag {}", uuid)))
    }

    async fn list_bags(&self, params: &ListParams) -> Result<PagedResponse<Bag>> {
        self.track("list_bags");
        let inner = self.inner.read().await;
        let after = parse_after(params);

        let mut bags: Vec<Bag> = inner
            .bags
            .values()
            .filter(|bag| {
                params
                    .get("admin_node")
                    .is_none_or(|node| bag.admin_node == node)
            })
            .filter(|bag| after.is_none_or(|stamp| bag.updated_at > stamp))
            .cloned()
            .collect();
        bags.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.uuid.cmp(&b.uuid)));
        paginate("bags/", bags, params)
    }

    async fn create_bag(&self, bag: &Bag) -> Result<CreateOutcome> {
        self.track("create_bag");
        let mut inner = self.inner.write().await;
        if inner.bags.contains_key(&bag.uuid) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        inner.bags.insert(bag.uuid, bag.clone());
        Ok(CreateOutcome::Created)
    }

    async fn update_bag(&self, bag: &Bag) -> Result<()> {
        self.track("update_bag");
        let mut inner = self.inner.write().await;
        if !inner.bags.contains_key(&bag.uuid) {
            return Err(ArkError::NotFound(format!("bag {}", bag.uuid)));
        }
        inner.bags.insert(bag.uuid, bag.clone());
        Ok(())
    }

    async fn list_ingests(&self, params: &ListParams) -> Result<PagedResponse<Ingest>> {
        self.track("list_ingests");
        let inner = self.inner.read().await;
        let bag_filter = params.get("bag").and_then(|raw| Uuid::parse_str(raw).ok());

        let mut ingests: Vec<Ingest> = inner
            .ingests
            .values()
            .filter(|ingest| bag_filter.is_none_or(|bag| ingest.bag == bag))
            .cloned()
            .collect();
        ingests.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        paginate("ingests/", ingests, params)
    }

    async fn create_ingest(&self, ingest: &Ingest) -> Result<CreateOutcome> {
        self.track("create_ingest");
        let mut inner = self.inner.write().await;
        if inner.ingests.contains_key(&ingest.ingest_id) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        inner.ingests.insert(ingest.ingest_id, ingest.clone());
        Ok(CreateOutcome::Created)
    }

    async fn latest_digest(&self, bag: Uuid, algorithm: &str) -> Result<MessageDigest> {
        self.track("latest_digest");
        let inner = self.inner.read().await;
        inner
            .digests
            .iter()
            .filter(|digest| digest.bag == bag && digest.algorithm == algorithm)
            .max_by_key(|digest| digest.created_at)
            .cloned()
            .ok_or_else(|| ArkError::NotFound(format!("digest {}/{}", bag, algorithm)))
    }

    async fn list_digests(&self, params: &ListParams) -> Result<PagedResponse<MessageDigest>> {
        self.track("list_digests");
        let inner = self.inner.read().await;
        let after = parse_after(params);
        let bag_filter = params.get("bag").and_then(|raw| Uuid::parse_str(raw).ok());

        let mut digests: Vec<MessageDigest> = inner
            .digests
            .iter()
            .filter(|digest| params.get("node").is_none_or(|node| digest.node == node))
            .filter(|digest| bag_filter.is_none_or(|bag| digest.bag == bag))
            .filter(|digest| after.is_none_or(|stamp| digest.created_at > stamp))
            .cloned()
            .collect();
        digests.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        paginate("digests/", digests, params)
    }

    async fn create_digest(&self, digest: &MessageDigest) -> Result<CreateOutcome> {
        self.track("create_digest");
        let mut inner = self.inner.write().await;
        let exists = inner.digests.iter().any(|existing| {
            existing.bag == digest.bag
                && existing.algorithm == digest.algorithm
                && existing.node == digest.node
        });
        if exists {
            return Ok(CreateOutcome::AlreadyExists);
        }
        inner.digests.push(digest.clone());
        Ok(CreateOutcome::Created)
    }

    async fn list_fixity_checks(
        &self,
        params: &ListParams,
    ) -> Result<PagedResponse<FixityCheck>> {
        self.track("list_fixity_checks");
        let inner = self.inner.read().await;
        let after = parse_after(params);
        let bag_filter = params.get("bag").and_then(|raw| Uuid::parse_str(raw).ok());

        let mut checks: Vec<FixityCheck> = inner
            .fixity_checks
            .values()
            .filter(|check| params.get("node").is_none_or(|node| check.node == node))
            .filter(|check| bag_filter.is_none_or(|bag| check.bag == bag))
            .filter(|check| after.is_none_or(|stamp| check.created_at > stamp))
            .cloned()
            .collect();
        checks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        paginate("fixity_checks/", checks, params)
    }

    async fn create_fixity_check(&self, check: &FixityCheck) -> Result<CreateOutcome> {
        self.track("create_fixity_check");
        let mut inner = self.inner.write().await;
        if inner.fixity_checks.contains_key(&check.fixity_check_id) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        inner.fixity_checks.insert(check.fixity_check_id, check.clone());
        Ok(CreateOutcome::Created)
    }

    async fn get_replication(&self, id: Uuid) -> Result<ReplicationTransfer> {
        self.track("get_replication");
        let inner = self.inner.read().await;
        inner
            .replications
            .get(&id)
            .cloned()
            .ok_or_else(|| ArkError::NotFound(format!("replication {}", id)))
    }

    async fn list_replications(
        &self,
        params: &ListParams,
    ) -> Result<PagedResponse<ReplicationTransfer>> {
        self.track("list_replications");
        let inner = self.inner.read().await;
        let after = parse_after(params);
        let bag_filter = params.get("bag").and_then(|raw| Uuid::parse_str(raw).ok());

        let mut transfers: Vec<ReplicationTransfer> = inner
            .replications
            .values()
            .filter(|xfer| params.get("from_node").is_none_or(|node| xfer.from_node == node))
            .filter(|xfer| params.get("to_node").is_none_or(|node| xfer.to_node == node))
            .filter(|xfer| bag_filter.is_none_or(|bag| xfer.bag == bag))
            .filter(|xfer| after.is_none_or(|stamp| xfer.updated_at > stamp))
            .cloned()
            .collect();
        transfers.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then(a.replication_id.cmp(&b.replication_id))
        });
        paginate("replications/", transfers, params)
    }

    async fn create_replication(&self, xfer: &ReplicationTransfer) -> Result<CreateOutcome> {
        self.track("create_replication");
        let mut inner = self.inner.write().await;
        if inner.replications.contains_key(&xfer.replication_id) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        inner.replications.insert(xfer.replication_id, xfer.clone());
        Ok(CreateOutcome::Created)
    }

    async fn update_replication(&self, xfer: &ReplicationTransfer) -> Result<()> {
        self.track("update_replication");
        let mut inner = self.inner.write().await;
        if !inner.replications.contains_key(&xfer.replication_id) {
            return Err(ArkError::NotFound(format!(
                "replication {}",
                xfer.replication_id
            )));
        }
        inner.replications.insert(xfer.replication_id, xfer.clone());
        Ok(())
    }

    async fn get_restore(&self, id: Uuid) -> Result<RestoreTransfer> {
        self.track("get_restore");
        let inner = self.inner.read().await;
        inner
            .restores
            .get(&id)
            .cloned()
            .ok_or_else(|| ArkError::NotFound(format!("restore {}", id)))
    }

    async fn list_restores(&self, params: &ListParams) -> Result<PagedResponse<RestoreTransfer>> {
        self.track("list_restores");
        let inner = self.inner.read().await;
        let after = parse_after(params);

        let mut transfers: Vec<RestoreTransfer> = inner
            .restores
            .values()
            .filter(|xfer| params.get("from_node").is_none_or(|node| xfer.from_node == node))
            .filter(|xfer| params.get("to_node").is_none_or(|node| xfer.to_node == node))
            .filter(|xfer| after.is_none_or(|stamp| xfer.updated_at > stamp))
            .cloned()
            .collect();
        transfers.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then(a.restore_id.cmp(&b.restore_id))
        });
        paginate("restores/", transfers, params)
    }

    async fn create_restore(&self, xfer: &RestoreTransfer) -> Result<CreateOutcome> {
        self.track("create_restore");
        let mut inner = self.inner.write().await;
        if inner.restores.contains_key(&xfer.restore_id) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        inner.restores.insert(xfer.restore_id, xfer.clone());
        Ok(CreateOutcome::Created)
    }

    async fn update_restore(&self, xfer: &RestoreTransfer) -> Result<()> {
        self.track("update_restore");
        let mut inner = self.inner.write().await;
        if !inner.restores.contains_key(&xfer.restore_id) {
            return Err(ArkError::NotFound(format!("restore {}", xfer.restore_id)));
        }
        inner.restores.insert(xfer.restore_id, xfer.clone());
        Ok(())
    }

    async fn get_work_item(&self, id: i64) -> Result<WorkItem> {
        self.track("get_work_item");
        let inner = self.inner.read().await;
        inner
            .work_items
            .get(&id)
            .cloned()
            .ok_or_else(|| ArkError::NotFound(format!("work item {}", id)))
    }

    async fn list_work_items(&self, params: &ListParams) -> Result<PagedResponse<WorkItem>> {
        self.track("list_work_items");
        let inner = self.inner.read().await;
        let identifier = params
            .get("identifier")
            .and_then(|raw| Uuid::parse_str(raw).ok());
        let completed = params
            .get("completed")
            .and_then(|raw| raw.parse::<bool>().ok());

        let mut items: Vec<WorkItem> = inner
            .work_items
            .values()
            .filter(|item| {
                params
                    .get("action")
                    .is_none_or(|action| item.action.to_string() == action)
            })
            .filter(|item| identifier.is_none_or(|id| item.identifier == id))
            .filter(|item| {
                params
                    .get("local_id")
                    .is_none_or(|id| item.local_id.as_deref() == Some(id))
            })
            .filter(|item| completed.is_none_or(|flag| item.is_completed() == flag))
            .cloned()
            .collect();
        items.sort_by_key(|item| item.id);
        paginate("work_items/", items, params)
    }

    async fn create_work_item(&self, item: &WorkItem) -> Result<WorkItem> {
        self.track("create_work_item");
        let mut inner = self.inner.write().await;
        let mut created = item.clone();
        if created.id == 0 {
            inner.next_work_item_id += 1;
            created.id = inner.next_work_item_id;
        } else {
            inner.next_work_item_id = inner.next_work_item_id.max(created.id);
        }
        inner.work_items.insert(created.id, created.clone());
        Ok(created)
    }

    async fn update_work_item(&self, item: &WorkItem) -> Result<()> {
        self.track("update_work_item");
        let mut inner = self.inner.write().await;
        if !inner.work_items.contains_key(&item.id) {
            return Err(ArkError::NotFound(format!("work item {}", item.id)));
        }
        inner.work_items.insert(item.id, item.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkItemAction;

    fn bag(admin_node: &str, minutes_ago: i64) -> Bag {
        let stamp = Utc::now() - chrono::Duration::minutes(minutes_ago);
        Bag {
            uuid: Uuid::new_v4(),
            local_id: "bag-1".to_string(),
            member: Uuid::new_v4(),
            size: 1000,
            version: 1,
            ingest_node: admin_node.to_string(),
            admin_node: admin_node.to_string(),
            replicating_nodes: vec![admin_node.to_string()],
            created_at: stamp,
            updated_at: stamp,
        }
    }

    #[tokio::test]
    async fn test_bag_pagination_follows_next_links() {
        let registry = MemoryRegistry::new();
        for i in 0..120 {
            registry.create_bag(&bag("chron", 120 - i)).await.unwrap();
        }

        let mut params = ListParams::new().admin_node("chron").page_size(50);
        let mut fetched = 0;
        let mut pages = 0;
        loop {
            let page = registry.list_bags(&params).await.unwrap();
            pages += 1;
            fetched += page.results.len();
            match page.next_page_params().unwrap() {
                Some(cursor) => params = ListParams::new().merge(cursor),
                None => break,
            }
        }

        assert_eq!(pages, 3);
        assert_eq!(fetched, 120);
        assert_eq!(registry.call_count("list_bags"), 3);
    }

    #[tokio::test]
    async fn test_duplicate_digest_create_is_success() {
        let registry = MemoryRegistry::new();
        let digest = MessageDigest {
            bag: Uuid::new_v4(),
            algorithm: "sha256".to_string(),
            node: "chron".to_string(),
            value: "abc".to_string(),
            created_at: Utc::now(),
        };

        assert_eq!(
            registry.create_digest(&digest).await.unwrap(),
            CreateOutcome::Created
        );
        assert_eq!(
            registry.create_digest(&digest).await.unwrap(),
            CreateOutcome::AlreadyExists
        );
    }

    #[tokio::test]
    async fn test_work_item_id_assignment() {
        let registry = MemoryRegistry::new();
        let item = WorkItem::new(WorkItemAction::Replication, Uuid::new_v4());
        let created = registry.create_work_item(&item).await.unwrap();
        assert!(created.id > 0);

        let fetched = registry.get_work_item(created.id).await.unwrap();
        assert_eq!(fetched.identifier, item.identifier);
    }

    #[tokio::test]
    async fn test_work_items_filtered_by_action_and_completion() {
        let registry = MemoryRegistry::new();
        let bag_id = Uuid::new_v4();

        let open = WorkItem::new(WorkItemAction::Replication, bag_id);
        registry.create_work_item(&open).await.unwrap();

        let mut closed = WorkItem::new(WorkItemAction::Replication, bag_id);
        closed.completed_at = Some(Utc::now());
        registry.create_work_item(&closed).await.unwrap();

        registry
            .create_work_item(&WorkItem::new(WorkItemAction::Restore, bag_id))
            .await
            .unwrap();

        let params = ListParams::new()
            .action(WorkItemAction::Replication)
            .identifier(bag_id)
            .completed(false);
        let page = registry.list_work_items(&params).await.unwrap();
        assert_eq!(page.count, 1);
        assert!(page.results[0].completed_at.is_none());
        assert_eq!(page.results[0].action, WorkItemAction::Replication);
    }

    #[tokio::test]
    async fn test_bags_filtered_by_after_watermark() {
        let registry = MemoryRegistry::new();
        registry.create_bag(&bag("chron", 60)).await.unwrap();
        let recent = bag("chron", 0);
        registry.create_bag(&recent).await.unwrap();

        let params = ListParams::new()
            .admin_node("chron")
            .after(Utc::now() - chrono::Duration::minutes(30));
        let page = registry.list_bags(&params).await.unwrap();
        assert_eq!(page.count, 1);
        assert_eq!(page.results[0].uuid, recent.uuid);
    }
}
