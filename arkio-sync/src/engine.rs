//! The pull-based sync engine.

use crate::report::{NodeSyncResult, RecordType};
use arkio_core::model::PagedResponse;
use arkio_core::registry::{CreateOutcome, ListParams, Registry, RemoteRegistries};
use arkio_core::{ArkError, Result};
use std::future::Future;
use std::sync::Arc;

const DEFAULT_PAGE_SIZE: usize = 50;

type StepError = (RecordType, ArkError);

/// Pulls peer registry records into the local registry, one peer at a time.
///
/// A failure in any step aborts the remaining steps for that peer only;
/// other peers still sync on the same pass.
pub struct SyncEngine {
    local: Arc<dyn Registry>,
    remotes: RemoteRegistries,
    local_namespace: String,
    page_size: usize,
}

impl SyncEngine {
    pub fn new(
        local: Arc<dyn Registry>,
        remotes: RemoteRegistries,
        local_namespace: impl Into<String>,
    ) -> Self {
        Self {
            local,
            remotes,
            local_namespace: local_namespace.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Syncs every configured peer, skipping this node's own namespace.
    pub async fn sync_all(&self) -> Vec<NodeSyncResult> {
        let mut results = Vec::new();
        for namespace in self.remotes.namespaces() {
            if namespace == self.local_namespace {
                continue;
            }
            let result = self.sync_node(&namespace).await;
            if result.is_clean() {
                tracing::info!(
                    "Synced peer {}: {} bags fetched, {} written",
                    namespace,
                    result.fetched(RecordType::Bag),
                    result.synced(RecordType::Bag)
                );
            } else {
                tracing::warn!("Sync of peer {} hit errors: {:?}", namespace, result.errors);
            }
            results.push(result);
        }
        results
    }

    /// Syncs one peer. Steps run in dependency order; the first failing step
    /// records its error and aborts the rest for this peer.
    pub async fn sync_node(&self, namespace: &str) -> NodeSyncResult {
        let mut result = NodeSyncResult::new(namespace);
        let remote = match self.remotes.get(namespace) {
            Ok(remote) => remote,
            Err(error) => {
                result.record_error(RecordType::Node, error);
                return result;
            }
        };

        if !self.sync_node_record(namespace, &remote, &mut result).await {
            return result;
        }
        if !self.sync_members(&remote, &mut result).await {
            return result;
        }
        if !self.sync_bags(namespace, &remote, &mut result).await {
            return result;
        }
        if !self.sync_digests(namespace, &remote, &mut result).await {
            return result;
        }
        if !self.sync_fixity_checks(namespace, &remote, &mut result).await {
            return result;
        }
        if !self.sync_replications(namespace, &remote, &mut result).await {
            return result;
        }
        self.sync_restores(namespace, &remote, &mut result).await;

        result
    }

    async fn sync_node_record(
        &self,
        namespace: &str,
        remote: &Arc<dyn Registry>,
        result: &mut NodeSyncResult,
    ) -> bool {
        match self.pull_node_record(namespace, remote, result).await {
            Ok(()) => true,
            Err((kind, error)) => {
                result.record_error(kind, error);
                false
            }
        }
    }

    async fn pull_node_record(
        &self,
        namespace: &str,
        remote: &Arc<dyn Registry>,
        result: &mut NodeSyncResult,
    ) -> std::result::Result<(), StepError> {
        let mut incoming = remote
            .get_node(namespace)
            .await
            .map_err(|e| (RecordType::Node, e))?;
        result.add_fetched(RecordType::Node, 1);
        // The watermark is local bookkeeping; never take it from the peer.
        incoming.last_pull_date = None;

        match self.local.get_node(namespace).await {
            Ok(existing) => {
                if incoming.updated_at > existing.updated_at {
                    incoming.last_pull_date = existing.last_pull_date;
                    self.local
                        .update_node(&incoming)
                        .await
                        .map_err(|e| (RecordType::Node, e))?;
                    result.add_synced(RecordType::Node);
                }
            }
            Err(ArkError::NotFound(_)) => {
                self.local
                    .create_node(&incoming)
                    .await
                    .map_err(|e| (RecordType::Node, e))?;
                result.add_synced(RecordType::Node);
            }
            Err(error) => return Err((RecordType::Node, error)),
        }
        Ok(())
    }

    async fn sync_members(
        &self,
        remote: &Arc<dyn Registry>,
        result: &mut NodeSyncResult,
    ) -> bool {
        let step = async {
            let params = ListParams::new().page_size(self.page_size);
            let members = fetch_all(params, |p| {
                let remote = remote.clone();
                async move { remote.list_members(&p).await }
            })
            .await?;
            result.add_fetched(RecordType::Member, members.len());

            for member in &members {
                if self.local.create_member(member).await? == CreateOutcome::Created {
                    result.add_synced(RecordType::Member);
                }
            }
            Ok::<(), ArkError>(())
        };
        match step.await {
            Ok(()) => true,
            Err(error) => {
                result.record_error(RecordType::Member, error);
                false
            }
        }
    }

    /// Pulls the bags this peer administers, newest-first resumable via the
    /// per-peer `last_pull_date` watermark, plus each bag's ingest facts.
    async fn sync_bags(
        &self,
        namespace: &str,
        remote: &Arc<dyn Registry>,
        result: &mut NodeSyncResult,
    ) -> bool {
        match self.pull_bags(namespace, remote, result).await {
            Ok(()) => true,
            Err((kind, error)) => {
                result.record_error(kind, error);
                false
            }
        }
    }

    async fn pull_bags(
        &self,
        namespace: &str,
        remote: &Arc<dyn Registry>,
        result: &mut NodeSyncResult,
    ) -> std::result::Result<(), StepError> {
        let watermark = self
            .local
            .get_node(namespace)
            .await
            .map_err(|e| (RecordType::Bag, e))?
            .last_pull_date;

        let mut params = ListParams::new()
            .admin_node(namespace)
            .page_size(self.page_size);
        if let Some(stamp) = watermark {
            params = params.after(stamp);
        }

        let bags = fetch_all(params, |p| {
            let remote = remote.clone();
            async move { remote.list_bags(&p).await }
        })
        .await
        .map_err(|e| (RecordType::Bag, e))?;
        result.add_fetched(RecordType::Bag, bags.len());

        let mut newest = watermark;
        for bag in &bags {
            // Single authority: a bag is only ever accepted from its admin node.
            if bag.admin_node != namespace {
                tracing::warn!(
                    "Peer {} returned bag {} administered by {}; skipping",
                    namespace,
                    bag.uuid,
                    bag.admin_node
                );
                continue;
            }

            match self.local.get_bag(bag.uuid).await {
                Ok(existing) => {
                    if bag.updated_at > existing.updated_at {
                        self.local
                            .update_bag(bag)
                            .await
                            .map_err(|e| (RecordType::Bag, e))?;
                        result.add_synced(RecordType::Bag);
                    }
                }
                Err(ArkError::NotFound(_)) => {
                    self.local
                        .create_bag(bag)
                        .await
                        .map_err(|e| (RecordType::Bag, e))?;
                    result.add_synced(RecordType::Bag);
                }
                Err(error) => return Err((RecordType::Bag, error)),
            }

            let ingest_params = ListParams::new().bag(bag.uuid).page_size(self.page_size);
            let ingests = fetch_all(ingest_params, |p| {
                let remote = remote.clone();
                async move { remote.list_ingests(&p).await }
            })
            .await
            .map_err(|e| (RecordType::Ingest, e))?;
            result.add_fetched(RecordType::Ingest, ingests.len());
            for ingest in &ingests {
                let outcome = self
                    .local
                    .create_ingest(ingest)
                    .await
                    .map_err(|e| (RecordType::Ingest, e))?;
                if outcome == CreateOutcome::Created {
                    result.add_synced(RecordType::Ingest);
                }
            }

            if newest.is_none_or(|stamp| bag.updated_at > stamp) {
                newest = Some(bag.updated_at);
            }
        }

        // Only a clean pass moves the watermark forward.
        if newest != watermark {
            let mut record = self
                .local
                .get_node(namespace)
                .await
                .map_err(|e| (RecordType::Bag, e))?;
            record.last_pull_date = newest;
            self.local
                .update_node(&record)
                .await
                .map_err(|e| (RecordType::Bag, e))?;
        }

        Ok(())
    }

    async fn sync_digests(
        &self,
        namespace: &str,
        remote: &Arc<dyn Registry>,
        result: &mut NodeSyncResult,
    ) -> bool {
        let step = async {
            let params = ListParams::new().node(namespace).page_size(self.page_size);
            let digests = fetch_all(params, |p| {
                let remote = remote.clone();
                async move { remote.list_digests(&p).await }
            })
            .await?;
            result.add_fetched(RecordType::Digest, digests.len());

            for digest in &digests {
                if digest.node != namespace {
                    continue;
                }
                // Digests are append-only; an existing record is success.
                if self.local.create_digest(digest).await? == CreateOutcome::Created {
                    result.add_synced(RecordType::Digest);
                }
            }
            Ok::<(), ArkError>(())
        };
        match step.await {
            Ok(()) => true,
            Err(error) => {
                result.record_error(RecordType::Digest, error);
                false
            }
        }
    }

    async fn sync_fixity_checks(
        &self,
        namespace: &str,
        remote: &Arc<dyn Registry>,
        result: &mut NodeSyncResult,
    ) -> bool {
        let step = async {
            let params = ListParams::new().node(namespace).page_size(self.page_size);
            let checks = fetch_all(params, |p| {
                let remote = remote.clone();
                async move { remote.list_fixity_checks(&p).await }
            })
            .await?;
            result.add_fetched(RecordType::FixityCheck, checks.len());

            for check in &checks {
                if check.node != namespace {
                    continue;
                }
                if self.local.create_fixity_check(check).await? == CreateOutcome::Created {
                    result.add_synced(RecordType::FixityCheck);
                }
            }
            Ok::<(), ArkError>(())
        };
        match step.await {
            Ok(()) => true,
            Err(error) => {
                result.record_error(RecordType::FixityCheck, error);
                false
            }
        }
    }

    /// Pulls the transfers this peer issued (it is their single authority).
    async fn sync_replications(
        &self,
        namespace: &str,
        remote: &Arc<dyn Registry>,
        result: &mut NodeSyncResult,
    ) -> bool {
        let step = async {
            let params = ListParams::new()
                .from_node(namespace)
                .page_size(self.page_size);
            let transfers = fetch_all(params, |p| {
                let remote = remote.clone();
                async move { remote.list_replications(&p).await }
            })
            .await?;
            result.add_fetched(RecordType::Replication, transfers.len());

            for xfer in &transfers {
                if xfer.from_node != namespace {
                    continue;
                }
                match self.local.get_replication(xfer.replication_id).await {
                    Ok(existing) => {
                        if xfer.updated_at > existing.updated_at {
                            self.local.update_replication(xfer).await?;
                            result.add_synced(RecordType::Replication);
                        }
                    }
                    Err(ArkError::NotFound(_)) => {
                        self.local.create_replication(xfer).await?;
                        result.add_synced(RecordType::Replication);
                    }
                    Err(error) => return Err(error),
                }
            }
            Ok::<(), ArkError>(())
        };
        match step.await {
            Ok(()) => true,
            Err(error) => {
                result.record_error(RecordType::Replication, error);
                false
            }
        }
    }

    async fn sync_restores(
        &self,
        namespace: &str,
        remote: &Arc<dyn Registry>,
        result: &mut NodeSyncResult,
    ) -> bool {
        let step = async {
            let params = ListParams::new()
                .to_node(namespace)
                .page_size(self.page_size);
            let transfers = fetch_all(params, |p| {
                let remote = remote.clone();
                async move { remote.list_restores(&p).await }
            })
            .await?;
            result.add_fetched(RecordType::Restore, transfers.len());

            for xfer in &transfers {
                if xfer.to_node != namespace {
                    continue;
                }
                match self.local.get_restore(xfer.restore_id).await {
                    Ok(existing) => {
                        if xfer.updated_at > existing.updated_at {
                            self.local.update_restore(xfer).await?;
                            result.add_synced(RecordType::Restore);
                        }
                    }
                    Err(ArkError::NotFound(_)) => {
                        self.local.create_restore(xfer).await?;
                        result.add_synced(RecordType::Restore);
                    }
                    Err(error) => return Err(error),
                }
            }
            Ok::<(), ArkError>(())
        };
        match step.await {
            Ok(()) => true,
            Err(error) => {
                result.record_error(RecordType::Restore, error);
                false
            }
        }
    }
}

/// Follows `Next` cursors until a list endpoint is exhausted.
async fn fetch_all<T, F, Fut>(base: ListParams, mut list: F) -> Result<Vec<T>>
where
    F: FnMut(ListParams) -> Fut,
    Fut: Future<Output = Result<PagedResponse<T>>>,
{
    let mut params = base;
    let mut items = Vec::new();
    loop {
        let page = list(params).await?;
        let next = page.next_page_params()?;
        items.extend(page.results);
        match next {
            Some(cursor) => params = ListParams::new().merge(cursor),
            None => return Ok(items),
        }
    }
}
