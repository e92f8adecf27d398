//! Startup wiring: builds registries, stores and queues from the config,
//! then runs the pipelines, the fixity sweep, the source scanner and the
//! registry sync loop until the process is told to stop.

use crate::config::{ColdBackend, Config, CopierBackend, PeerConfig};
use arkio_core::audit::AuditLog;
use arkio_core::bagit::{MemoryCatalog, TarBagPackager, TarBagValidator};
use arkio_core::copier::{Copier, LocalCopier, RsyncCopier};
use arkio_core::model::{WorkItem, WorkItemAction};
use arkio_core::operations::{
    FixityConfirmer, IngestPipeline, PipelineContext, ReplicationPipeline, RestorePipeline,
};
use arkio_core::queue::{MemoryQueue, WorkQueue};
use arkio_core::registry::{ListParams, Registry, RegistryBuilder, RemoteRegistries};
use arkio_core::storage::{ColdStore, FsColdStore, ObjectColdStore, StagingStore};
use arkio_core::{ArkError, Result};
use arkio_sync::SyncEngine;
use object_store::aws::AmazonS3Builder;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// A fully wired node: one pipeline context per work-item action, all
/// sharing the same registries, stores and audit log.
pub struct Node {
    config: Config,
    local_registry: Arc<dyn Registry>,
    remotes: RemoteRegistries,
    replication: Arc<PipelineContext>,
    ingest: Arc<PipelineContext>,
    restore: Arc<PipelineContext>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

pub async fn run_server(config: Config) -> Result<()> {
    Node::build(config)?.run().await
}

/// One sync pass against every configured peer, for the `sync` subcommand.
pub async fn run_sync_once(config: &Config) -> Result<()> {
    let local = build_local_registry(config)?;
    let remotes = build_remotes(&config.registry.peers)?;
    let engine = SyncEngine::new(local, remotes, config.node.namespace.clone())
        .page_size(config.sync.page_size);

    let mut failed = false;
    for result in engine.sync_all().await {
        for (kind, count) in &result.synced {
            tracing::info!("{}: synced {} {} record(s)", result.namespace, count, kind);
        }
        for (kind, error) in &result.errors {
            failed = true;
            tracing::error!("{}: {} sync failed: {}", result.namespace, kind, error);
        }
    }

    if failed {
        return Err(ArkError::Registry(
            "one or more peers failed to sync".to_string(),
        ));
    }
    Ok(())
}

impl Node {
    pub fn build(config: Config) -> Result<Self> {
        let local_registry = build_local_registry(&config)?;
        let remotes = build_remotes(&config.registry.peers)?;
        let staging = Arc::new(StagingStore::new(
            config.staging.path.clone(),
            config.staging.capacity_bytes,
        )?);
        let cold = build_cold(&config)?;
        let copier = build_copier(&config);
        let audit = Arc::new(AuditLog::new(config.audit.path.clone())?);
        let validator = Arc::new(TarBagValidator);
        let packager = Arc::new(TarBagPackager);
        let catalog = Arc::new(MemoryCatalog::new());
        let settings = config.pipeline.settings();
        let visibility = Duration::from_secs(config.pipeline.visibility_extension_secs);

        let context = |queue: Arc<dyn WorkQueue>| {
            Arc::new(PipelineContext {
                local_node: config.node.namespace.clone(),
                pid: std::process::id(),
                local_registry: local_registry.clone(),
                remote_registries: remotes.clone(),
                queue,
                staging: staging.clone(),
                cold: cold.clone(),
                copier: copier.clone(),
                validator: validator.clone(),
                packager: packager.clone(),
                catalog: catalog.clone(),
                audit: audit.clone(),
                member: config.node.member,
                source_root: config.node.source_root.clone(),
                settings: settings.clone(),
            })
        };

        let replication = context(Arc::new(MemoryQueue::new(visibility)));
        let ingest = context(Arc::new(MemoryQueue::new(visibility)));
        let restore = context(Arc::new(MemoryQueue::new(visibility)));

        Ok(Self {
            config,
            local_registry,
            remotes,
            replication,
            ingest,
            restore,
        })
    }

    pub async fn run(self) -> Result<()> {
        self.requeue_open_items().await;

        let mut handles = Vec::new();
        handles.extend(Arc::new(ReplicationPipeline::new(self.replication.clone())).spawn());
        handles.extend(Arc::new(IngestPipeline::new(self.ingest.clone())).spawn());
        handles.extend(Arc::new(RestorePipeline::new(self.restore.clone())).spawn());
        handles.push(self.spawn_confirmer());
        handles.push(self.spawn_scanner());
        handles.push(self.spawn_sync());

        tracing::info!("Node {} is running", self.config.node.namespace);
        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutting down");
        for handle in handles {
            handle.abort();
        }
        Ok(())
    }

    /// Re-enqueues open work items. In-flight queue state does not survive a
    /// restart; the registry is the durable record of what remains to do.
    async fn requeue_open_items(&self) {
        let mut params = ListParams::new().completed(false);
        loop {
            let page = match self.local_registry.list_work_items(&params).await {
                Ok(page) => page,
                Err(error) => {
                    tracing::warn!("Failed to list open work items: {}", error);
                    return;
                }
            };
            let next = page.next_page_params().ok().flatten();

            for item in page.results {
                if !item.retry {
                    continue;
                }
                let queue = self.queue_for(item.action);
                match queue.send(&item.id.to_string()).await {
                    Ok(()) => tracing::info!(
                        "Requeued open {} work item {} after restart",
                        item.action,
                        item.id
                    ),
                    Err(error) => {
                        tracing::warn!("Failed to requeue work item {}: {}", item.id, error)
                    }
                }
            }

            match next {
                Some(cursor) => params = ListParams::new().merge(cursor),
                None => return,
            }
        }
    }

    fn queue_for(&self, action: WorkItemAction) -> &Arc<dyn WorkQueue> {
        match action {
            WorkItemAction::Replication => &self.replication.queue,
            WorkItemAction::Ingest => &self.ingest.queue,
            WorkItemAction::Restore => &self.restore.queue,
        }
    }

    /// Periodic sender-side sweep over outbound transfers with a reported
    /// fixity value.
    fn spawn_confirmer(&self) -> JoinHandle<()> {
        let confirmer = FixityConfirmer::new(
            self.local_registry.clone(),
            self.config.node.namespace.clone(),
        );
        let interval = Duration::from_secs(self.config.pipeline.confirm_interval_secs);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match confirmer.run_once().await {
                    Ok(stats) if stats.examined > 0 => tracing::info!(
                        "Fixity sweep examined {}, approved {}, cancelled {}",
                        stats.examined,
                        stats.approved,
                        stats.cancelled
                    ),
                    Ok(_) => {}
                    Err(error) => tracing::warn!("Fixity sweep failed: {}", error),
                }
            }
        })
    }

    /// Periodic scan of the source root for new objects to ingest.
    fn spawn_scanner(&self) -> JoinHandle<()> {
        let ctx = self.ingest.clone();
        let interval = Duration::from_secs(self.config.pipeline.scan_interval_secs);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                scan_source_root(&ctx).await;
            }
        })
    }

    /// Periodic registry sync, followed by scheduling of any transfer work
    /// the sync brought in.
    fn spawn_sync(&self) -> JoinHandle<()> {
        let engine = SyncEngine::new(
            self.local_registry.clone(),
            self.remotes.clone(),
            self.config.node.namespace.clone(),
        )
        .page_size(self.config.sync.page_size);
        let interval = Duration::from_secs(self.config.sync.interval_secs);
        let replication = self.replication.clone();
        let restore = self.restore.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for result in engine.sync_all().await {
                    for (kind, error) in &result.errors {
                        tracing::warn!(
                            "Sync of {} records from {} failed: {}",
                            kind,
                            result.namespace,
                            error
                        );
                    }
                }
                schedule_inbound_replications(&replication).await;
                schedule_pending_restores(&restore).await;
            }
        })
    }
}

fn build_local_registry(config: &Config) -> Result<Arc<dyn Registry>> {
    let mut builder = RegistryBuilder::new().backend(config.registry.backend.as_str());
    if let Some(api_root) = &config.registry.api_root {
        builder = builder.api_root(api_root.as_str());
    }
    if let Some(token) = &config.registry.token {
        builder = builder.token(token.as_str());
    }
    builder.build()
}

fn build_remotes(peers: &[PeerConfig]) -> Result<RemoteRegistries> {
    let mut remotes = RemoteRegistries::new();
    for peer in peers {
        let mut builder = RegistryBuilder::new()
            .backend("http")
            .api_root(peer.api_root.as_str());
        if let Some(token) = &peer.token {
            builder = builder.token(token.as_str());
        }
        remotes.insert(peer.namespace.clone(), builder.build()?);
    }
    Ok(remotes)
}

fn build_cold(config: &Config) -> Result<Arc<dyn ColdStore>> {
    let lead = chrono::Duration::hours(config.cold.restore_lead_hours);
    match config.cold.backend {
        ColdBackend::S3 => {
            let s3 = config.cold.s3.as_ref().ok_or_else(|| {
                ArkError::Config("cold.s3 configuration is required for the s3 backend".to_string())
            })?;
            let store = AmazonS3Builder::new()
                .with_bucket_name(&s3.bucket)
                .with_region(&s3.region)
                .with_access_key_id(&s3.access_key_id)
                .with_secret_access_key(&s3.secret_access_key)
                .build()?;
            Ok(Arc::new(ObjectColdStore::new(Arc::new(store), lead)))
        }
        ColdBackend::Fs => {
            let fs = config.cold.fs.as_ref().ok_or_else(|| {
                ArkError::Config("cold.fs configuration is required for the fs backend".to_string())
            })?;
            Ok(Arc::new(FsColdStore::new(fs.path.clone(), lead)?))
        }
    }
}

fn build_copier(config: &Config) -> Arc<dyn Copier> {
    match config.copier.backend {
        CopierBackend::Rsync => Arc::new(RsyncCopier::new(config.copier.rsync_args.clone())),
        CopierBackend::Local => Arc::new(LocalCopier),
    }
}

/// Schedules a work item for every open inbound replication that does not
/// already have one. Terminal transfers never get work; fatally failed work
/// cancels its transfer, so the pair converges.
async fn schedule_inbound_replications(ctx: &PipelineContext) {
    let mut params = ListParams::new().to_node(&ctx.local_node);
    loop {
        let page = match ctx.local_registry.list_replications(&params).await {
            Ok(page) => page,
            Err(error) => {
                tracing::warn!("Failed to list inbound replications: {}", error);
                return;
            }
        };
        let next = page.next_page_params().ok().flatten();

        for xfer in page.results {
            if xfer.is_terminal() {
                continue;
            }
            if let Err(error) =
                ensure_open_work_item(ctx, WorkItemAction::Replication, xfer.bag).await
            {
                tracing::warn!(
                    "Failed to schedule replication of bag {}: {}",
                    xfer.bag,
                    error
                );
            }
        }

        match next {
            Some(cursor) => params = ListParams::new().merge(cursor),
            None => return,
        }
    }
}

/// Schedules a restore for every open transfer this node must fulfill.
///
/// Dedup here spans completed work items: the pipeline does not mark the
/// transfer finished (pickup is the requester's side), so a second item for
/// the same bag would repeat work that already succeeded or fatally failed.
async fn schedule_pending_restores(ctx: &PipelineContext) {
    let mut params = ListParams::new().from_node(&ctx.local_node);
    loop {
        let page = match ctx.local_registry.list_restores(&params).await {
            Ok(page) => page,
            Err(error) => {
                tracing::warn!("Failed to list pending restores: {}", error);
                return;
            }
        };
        let next = page.next_page_params().ok().flatten();

        for xfer in page.results {
            if xfer.is_terminal() {
                continue;
            }
            let lookup = ListParams::new()
                .action(WorkItemAction::Restore)
                .identifier(xfer.bag);
            match ctx.local_registry.list_work_items(&lookup).await {
                Ok(existing) if existing.count == 0 => {
                    if let Err(error) =
                        create_and_queue(ctx, WorkItemAction::Restore, xfer.bag, None).await
                    {
                        tracing::warn!("Failed to schedule restore of bag {}: {}", xfer.bag, error);
                    }
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!("Failed to look up restore work for {}: {}", xfer.bag, error)
                }
            }
        }

        match next {
            Some(cursor) => params = ListParams::new().merge(cursor),
            None => return,
        }
    }
}

/// Scans the source root and schedules an ingest for any directory that has
/// never had one. Ingest work items are deduplicated by local id for good,
/// completed ones included; a bag is only ever built from a source once.
async fn scan_source_root(ctx: &PipelineContext) {
    let mut entries = match tokio::fs::read_dir(&ctx.source_root).await {
        Ok(entries) => entries,
        Err(error) => {
            tracing::debug!(
                "Source root {} is not readable: {}",
                ctx.source_root.display(),
                error
            );
            return;
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let is_dir = entry
            .file_type()
            .await
            .map(|kind| kind.is_dir())
            .unwrap_or(false);
        if !is_dir {
            continue;
        }
        let local_id = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };

        let lookup = ListParams::new()
            .action(WorkItemAction::Ingest)
            .local_id(&local_id);
        match ctx.local_registry.list_work_items(&lookup).await {
            Ok(existing) if existing.count == 0 => {
                if let Err(error) = create_and_queue(
                    ctx,
                    WorkItemAction::Ingest,
                    Uuid::new_v4(),
                    Some(local_id.clone()),
                )
                .await
                {
                    tracing::warn!("Failed to schedule ingest of '{}': {}", local_id, error);
                }
            }
            Ok(_) => {}
            Err(error) => {
                tracing::warn!("Failed to look up ingest work for '{}': {}", local_id, error)
            }
        }
    }
}

/// Creates a work item and queues it, unless an open one already exists.
async fn ensure_open_work_item(
    ctx: &PipelineContext,
    action: WorkItemAction,
    bag: Uuid,
) -> Result<()> {
    let lookup = ListParams::new()
        .action(action)
        .identifier(bag)
        .completed(false);
    let existing = ctx.local_registry.list_work_items(&lookup).await?;
    if existing.count > 0 {
        return Ok(());
    }
    create_and_queue(ctx, action, bag, None).await
}

async fn create_and_queue(
    ctx: &PipelineContext,
    action: WorkItemAction,
    bag: Uuid,
    local_id: Option<String>,
) -> Result<()> {
    let mut item = WorkItem::new(action, bag);
    item.local_id = local_id;
    let created = ctx.local_registry.create_work_item(&item).await?;
    ctx.queue.send(&created.id.to_string()).await?;
    tracing::info!("Queued {} work item {} for bag {}", action, created.id, bag);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AuditConfig, ColdConfig, FsColdConfig, NodeConfig, PipelineConfig, RegistryBackend,
        RegistryConfig, StagingConfig, SyncConfig,
    };

    fn test_config(root: &std::path::Path) -> Config {
        Config {
            node: NodeConfig {
                namespace: "chron".to_string(),
                member: Uuid::new_v4(),
                source_root: root.join("source"),
            },
            registry: RegistryConfig {
                backend: RegistryBackend::Memory,
                api_root: None,
                token: None,
                peers: Vec::new(),
            },
            staging: StagingConfig {
                path: root.join("staging"),
                capacity_bytes: 1024 * 1024,
            },
            cold: ColdConfig {
                backend: ColdBackend::Fs,
                s3: None,
                fs: Some(FsColdConfig {
                    path: root.join("cold"),
                }),
                restore_lead_hours: 0,
            },
            pipeline: PipelineConfig::default(),
            sync: SyncConfig::default(),
            audit: AuditConfig {
                path: root.join("audit.jsonl"),
            },
            copier: crate::config::CopierConfig {
                backend: CopierBackend::Local,
                rsync_args: Vec::new(),
            },
        }
    }

    #[tokio::test]
    async fn test_source_scan_queues_each_directory_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::create_dir_all(config.node.source_root.join("photos-2024")).unwrap();

        let node = Node::build(config).unwrap();
        scan_source_root(&node.ingest).await;
        scan_source_root(&node.ingest).await;

        let items = node
            .local_registry
            .list_work_items(&ListParams::new().action(WorkItemAction::Ingest))
            .await
            .unwrap();
        assert_eq!(items.count, 1);
        assert_eq!(items.results[0].local_id.as_deref(), Some("photos-2024"));
        assert_eq!(node.ingest.queue.receive(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_restart_requeues_only_retryable_items() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::build(test_config(dir.path())).unwrap();

        let open = WorkItem::new(WorkItemAction::Replication, Uuid::new_v4());
        node.local_registry.create_work_item(&open).await.unwrap();

        let mut dead = WorkItem::new(WorkItemAction::Replication, Uuid::new_v4());
        dead.retry = false;
        node.local_registry.create_work_item(&dead).await.unwrap();

        node.requeue_open_items().await;
        assert_eq!(node.replication.queue.receive(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cold_backend_requires_its_section() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.cold.backend = ColdBackend::S3;
        config.cold.s3 = None;

        let error = Node::build(config).unwrap_err();
        assert!(matches!(error, ArkError::Config(_)));
    }
}
