//! Ingest pipeline: package a local source object into a bag, store it, and
//! record the new bag plus its outbound replications.
//!
//! Stages: package -> store -> record.

use super::pipeline::{
    Flow, PipelineContext, ResolveOutcome, Task, post_process, resolve_task, spawn_stage,
    stage_channel, touch_quietly,
};
use crate::manifest::Stage;
use crate::model::{Bag, Ingest, MessageDigest, NodeRecord, ReplicationTransfer};
use crate::queue::QueueMessage;
use crate::registry::{ListParams, Registry};
use crate::storage::ColdTags;
use crate::{ArkError, Result};
use chrono::Utc;
use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub struct IngestPipeline {
    ctx: Arc<PipelineContext>,
}

impl IngestPipeline {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    pub async fn process_message(&self, message: QueueMessage) {
        let mut flow = self.package(message).await;
        flow = match flow {
            Flow::Next(task) => self.store(task).await,
            other => other,
        };
        flow = match flow {
            Flow::Next(task) => self.record(task).await,
            other => other,
        };
        match flow {
            Flow::Next(task) | Flow::Record(task) => post_process(&self.ctx, task).await,
            Flow::Done => {}
        }
    }

    /// Packages the source object named by the work item's `local_id` into a
    /// staged bag tar and validates the result.
    pub async fn package(&self, message: QueueMessage) -> Flow {
        let ctx = &self.ctx;
        let mut task = match resolve_task(ctx, message).await {
            ResolveOutcome::Resolved(task) => task,
            ResolveOutcome::Done => return Flow::Done,
        };

        task.manifest.summary(Stage::Package).start();

        let Some(local_id) = task.work_item.local_id.clone() else {
            task.manifest
                .summary(Stage::Package)
                .add_fatal_error("ingest work item has no local_id");
            return Flow::Record(task);
        };

        let source_dir = ctx.source_root.join(&local_id);
        if !source_dir.is_dir() {
            task.manifest
                .summary(Stage::Package)
                .add_fatal_error(format!(
                    "source object '{}' not found under {}",
                    local_id,
                    ctx.source_root.display()
                ));
            return Flow::Record(task);
        }

        let source_bytes = match directory_size(&source_dir) {
            Ok(bytes) => bytes,
            Err(error) => {
                task.manifest
                    .summary(Stage::Package)
                    .add_error(format!("cannot size source '{}': {}", local_id, error));
                return Flow::Record(task);
            }
        };
        if let Err(error) = ctx.staging.reserve(task.manifest.bag, source_bytes) {
            tracing::info!("Deferring ingest of '{}': {}", local_id, error);
            task.force_requeue = true;
            task.manifest.note = Some("waiting for staging capacity".to_string());
            task.work_item.release();
            return Flow::Record(task);
        }

        if let Err(error) = ctx
            .catalog
            .record_event(&local_id, "bagging and ingest started")
            .await
        {
            tracing::warn!("Failed to record ingest start for '{}': {}", local_id, error);
        }

        let bag_uuid = task.manifest.bag;
        let tar_path = ctx.staging.tar_path(bag_uuid);
        touch_quietly(ctx, &task.message).await;
        if let Err(error) = ctx.packager.package(bag_uuid, &source_dir, &tar_path).await {
            task.manifest
                .summary(Stage::Package)
                .add_error(format!("packaging failed: {}", error));
            return Flow::Record(task);
        }

        let report = match ctx.validator.validate(&tar_path).await {
            Ok(report) => report,
            Err(error) => {
                task.manifest
                    .summary(Stage::Package)
                    .add_error(format!("validator error: {}", error));
                return Flow::Record(task);
            }
        };
        if !report.is_valid() {
            task.manifest
                .summary(Stage::Package)
                .add_fatal_error(format!(
                    "packaged bag failed validation: {}",
                    report.errors.join("; ")
                ));
            if let Err(error) = ctx.staging.delete_tar(bag_uuid).await {
                tracing::warn!("Failed to delete invalid bag {}: {}", bag_uuid, error);
            }
            return Flow::Record(task);
        }

        task.tag_digest = report.tag_manifest_digest().map(str::to_string);
        task.manifest.local_path = Some(tar_path);
        task.manifest.summary(Stage::Package).finish();
        Flow::Next(task)
    }

    /// Uploads the packaged bag to cold storage.
    pub async fn store(&self, mut task: Task) -> Flow {
        let ctx = &self.ctx;
        let bag_uuid = task.manifest.bag;
        let tar_path = ctx.staging.tar_path(bag_uuid);

        task.manifest.summary(Stage::Store).start();

        let tags = ColdTags {
            from_node: ctx.local_node.clone(),
            transfer_id: format!("ingest-{}", task.work_item.id),
            member: ctx.member.to_string(),
            local_id: task.work_item.local_id.clone().unwrap_or_default(),
            version: "1".to_string(),
        };
        let key = format!("{}.tar", bag_uuid);

        let mut stored = false;
        for attempt in 1..=ctx.settings.max_store_attempts {
            touch_quietly(ctx, &task.message).await;
            match ctx.cold.put(&key, &tar_path, &tags).await {
                Ok(()) => {
                    stored = true;
                    break;
                }
                Err(error) => {
                    tracing::warn!(
                        "Store attempt {}/{} for bag {} failed: {}",
                        attempt,
                        ctx.settings.max_store_attempts,
                        bag_uuid,
                        error
                    );
                    task.manifest
                        .summary(Stage::Store)
                        .add_error(format!("store attempt {} failed: {}", attempt, error));
                    if attempt < ctx.settings.max_store_attempts {
                        tokio::time::sleep(ctx.settings.store_retry_delay).await;
                    }
                }
            }
        }

        if !stored {
            // Transient: the packaged bag stays staged for the retry.
            return Flow::Record(task);
        }

        task.manifest.summary(Stage::Store).finish();
        Flow::Next(task)
    }

    /// Creates the bag, ingest, and digest records, then schedules outbound
    /// replications to randomly chosen peers.
    pub async fn record(&self, mut task: Task) -> Flow {
        let ctx = &self.ctx;
        let bag_uuid = task.manifest.bag;

        task.manifest.summary(Stage::Record).start();

        let Some(local_id) = task.work_item.local_id.clone() else {
            task.manifest
                .summary(Stage::Record)
                .add_fatal_error("ingest work item has no local_id");
            return Flow::Record(task);
        };
        let Some(digest) = task.tag_digest.clone() else {
            task.manifest
                .summary(Stage::Record)
                .add_error("no tag-manifest digest captured for packaged bag");
            return Flow::Record(task);
        };

        let size = match tokio::fs::metadata(ctx.staging.tar_path(bag_uuid)).await {
            Ok(meta) => meta.len(),
            Err(error) => {
                task.manifest
                    .summary(Stage::Record)
                    .add_error(format!("cannot size staged bag: {}", error));
                return Flow::Record(task);
            }
        };

        if let Err(error) = self
            .write_records(&mut task, &local_id, &digest, size)
            .await
        {
            if error.is_fatal() {
                task.manifest
                    .summary(Stage::Record)
                    .add_fatal_error(format!("{}", error));
            } else {
                task.manifest
                    .summary(Stage::Record)
                    .add_error(format!("{}", error));
            }
            return Flow::Record(task);
        }

        // The tar stays staged so chosen peers can pull it, but it no longer
        // counts against copy capacity.
        ctx.staging.release(bag_uuid);

        task.manifest.summary(Stage::Record).finish();
        Flow::Next(task)
    }

    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let workers = self.ctx.settings.workers_per_stage;
        let (store_tx, store_rx) = stage_channel::<Task>(workers);
        let (record_tx, record_rx) = stage_channel::<Task>(workers);
        let (post_tx, post_rx) = stage_channel::<Task>(workers);

        let mut handles = Vec::new();

        let pipeline = self.clone();
        let post_for_store = post_tx.clone();
        let record_for_store = record_tx.clone();
        handles.extend(spawn_stage("ingest.store", workers, store_rx, move |task| {
            let pipeline = pipeline.clone();
            let next = record_for_store.clone();
            let post = post_for_store.clone();
            async move {
                match pipeline.store(task).await {
                    Flow::Next(task) => drop(next.send(task).await),
                    Flow::Record(task) => drop(post.send(task).await),
                    Flow::Done => {}
                }
            }
        }));

        let pipeline = self.clone();
        let post_for_record = post_tx.clone();
        handles.extend(spawn_stage(
            "ingest.record",
            workers,
            record_rx,
            move |task| {
                let pipeline = pipeline.clone();
                let post = post_for_record.clone();
                async move {
                    match pipeline.record(task).await {
                        Flow::Next(task) | Flow::Record(task) => drop(post.send(task).await),
                        Flow::Done => {}
                    }
                }
            },
        ));

        let pipeline = self.clone();
        handles.extend(spawn_stage("ingest.post", workers, post_rx, move |task| {
            let pipeline = pipeline.clone();
            async move { post_process(&pipeline.ctx, task).await }
        }));

        let pipeline = self.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let messages = match pipeline.ctx.queue.receive(workers).await {
                    Ok(messages) => messages,
                    Err(error) => {
                        tracing::warn!("Queue receive failed: {}", error);
                        Vec::new()
                    }
                };
                if messages.is_empty() {
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    continue;
                }
                for message in messages {
                    match pipeline.package(message).await {
                        Flow::Next(task) => drop(store_tx.send(task).await),
                        Flow::Record(task) => drop(post_tx.send(task).await),
                        Flow::Done => {}
                    }
                }
            }
        }));

        handles
    }

    async fn write_records(
        &self,
        task: &mut Task,
        local_id: &str,
        digest: &str,
        size: u64,
    ) -> Result<()> {
        let ctx = &self.ctx;
        let bag_uuid = task.manifest.bag;
        let now = Utc::now();

        let bag = Bag {
            uuid: bag_uuid,
            local_id: local_id.to_string(),
            member: ctx.member,
            size,
            version: 1,
            ingest_node: ctx.local_node.clone(),
            admin_node: ctx.local_node.clone(),
            replicating_nodes: vec![ctx.local_node.clone()],
            created_at: now,
            updated_at: now,
        };
        ctx.local_registry.create_bag(&bag).await?;
        task.bag = Some(bag.clone());

        // All record writes below tolerate redelivery: existing records are
        // left alone rather than duplicated.
        let existing_ingests = ctx
            .local_registry
            .list_ingests(&ListParams::new().bag(bag_uuid))
            .await?;
        if existing_ingests.results.is_empty() {
            ctx.local_registry
                .create_ingest(&Ingest {
                    ingest_id: Uuid::new_v4(),
                    bag: bag_uuid,
                    ingested: true,
                    replicating_nodes: vec![ctx.local_node.clone()],
                    created_at: now,
                })
                .await?;
        }

        ctx.local_registry
            .create_digest(&MessageDigest {
                bag: bag_uuid,
                algorithm: ctx.settings.fixity_algorithm.clone(),
                node: ctx.local_node.clone(),
                value: digest.to_string(),
                created_at: now,
            })
            .await?;

        self.schedule_replications(&bag).await?;

        ctx.catalog.stamp_bag_identifier(local_id, bag_uuid).await?;
        ctx.catalog
            .record_event(local_id, "bag stored and recorded")
            .await?;

        Ok(())
    }

    /// Picks `replication_count` distinct peers from this node's
    /// `replicate_to` list and creates a pending transfer for each.
    async fn schedule_replications(&self, bag: &Bag) -> Result<()> {
        let ctx = &self.ctx;

        let existing = ctx
            .local_registry
            .list_replications(&ListParams::new().bag(bag.uuid).from_node(&ctx.local_node))
            .await?;
        if existing.results.len() >= ctx.settings.replication_count {
            return Ok(());
        }

        let own = ctx.local_registry.get_node(&ctx.local_node).await?;
        let candidates: Vec<String> = own
            .replicate_to
            .iter()
            .filter(|peer| peer.as_str() != ctx.local_node)
            .filter(|peer| {
                !existing
                    .results
                    .iter()
                    .any(|xfer| xfer.to_node == peer.as_str())
            })
            .cloned()
            .collect();

        let wanted = ctx.settings.replication_count - existing.results.len();
        if candidates.len() < wanted {
            return Err(ArkError::Validation(format!(
                "need {} replication peers but only {} are configured",
                ctx.settings.replication_count,
                existing.results.len() + candidates.len()
            )));
        }

        let chosen: Vec<String> = {
            let mut rng = rand::thread_rng();
            candidates
                .choose_multiple(&mut rng, wanted)
                .cloned()
                .collect()
        };

        let link = self.transfer_link(&own, bag.uuid);
        for peer in chosen {
            let now = Utc::now();
            ctx.local_registry
                .create_replication(&ReplicationTransfer {
                    replication_id: Uuid::new_v4(),
                    from_node: ctx.local_node.clone(),
                    to_node: peer.clone(),
                    bag: bag.uuid,
                    fixity_algorithm: ctx.settings.fixity_algorithm.clone(),
                    fixity_value: None,
                    store_requested: false,
                    stored: false,
                    cancelled: false,
                    cancel_reason: None,
                    protocol: "rsync".to_string(),
                    link: link.clone(),
                    created_at: now,
                    updated_at: now,
                })
                .await?;
            tracing::info!("Scheduled replication of bag {} to {}", bag.uuid, peer);
        }

        Ok(())
    }

    /// Builds the link peers pull the staged tar from. With an ssh user
    /// configured the link is rsync-style; otherwise it is the staging path,
    /// which suits single-host clusters and tests.
    fn transfer_link(&self, own: &NodeRecord, bag: Uuid) -> String {
        let tar_path = self.ctx.staging.tar_path(bag);
        match own.ssh_username.as_deref() {
            Some(user) if !user.is_empty() => {
                let host = host_of(&own.api_root).unwrap_or_else(|| own.namespace.clone());
                format!("{}@{}:outbound/{}.tar", user, host, bag)
            }
            _ => tar_path.to_string_lossy().into_owned(),
        }
    }
}

fn host_of(api_root: &str) -> Option<String> {
    reqwest::Url::parse(api_root)
        .ok()?
        .host_str()
        .map(str::to_string)
}

fn directory_size(dir: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditLog, AuditOutcome};
    use crate::bagit::{MemoryCatalog, TarBagPackager, TarBagValidator};
    use crate::storage::cold::ColdStore;
    use crate::copier::LocalCopier;
    use crate::model::{WorkItem, WorkItemAction};
    use crate::operations::pipeline::PipelineSettings;
    use crate::queue::{MemoryQueue, WorkQueue};
    use crate::registry::{MemoryRegistry, RemoteRegistries};
    use crate::storage::{FsColdStore, StagingStore};
    use std::time::Duration;

    struct Harness {
        dir: tempfile::TempDir,
        local: Arc<MemoryRegistry>,
        queue: Arc<MemoryQueue>,
        cold: Arc<FsColdStore>,
        staging: Arc<StagingStore>,
        catalog: Arc<MemoryCatalog>,
        audit: Arc<AuditLog>,
        pipeline: IngestPipeline,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let local = Arc::new(MemoryRegistry::new());
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
        let staging =
            Arc::new(StagingStore::new(dir.path().join("staging"), 1 << 30).unwrap());
        let cold = Arc::new(
            FsColdStore::new(dir.path().join("cold"), chrono::Duration::zero()).unwrap(),
        );
        let catalog = Arc::new(MemoryCatalog::new());
        let audit = Arc::new(AuditLog::new(dir.path().join("audit.jsonl")).unwrap());

        let ctx = Arc::new(PipelineContext {
            local_node: "chron".to_string(),
            pid: std::process::id(),
            local_registry: local.clone(),
            remote_registries: RemoteRegistries::new(),
            queue: queue.clone(),
            staging: staging.clone(),
            cold: cold.clone(),
            copier: Arc::new(LocalCopier),
            validator: Arc::new(TarBagValidator),
            packager: Arc::new(TarBagPackager),
            catalog: catalog.clone(),
            audit: audit.clone(),
            member: Uuid::new_v4(),
            source_root: dir.path().join("source"),
            settings: PipelineSettings {
                store_retry_delay: Duration::from_millis(1),
                requeue_delay: Duration::from_millis(10),
                ..PipelineSettings::default()
            },
        });

        Harness {
            dir,
            local,
            queue,
            cold,
            staging,
            catalog,
            audit,
            pipeline: IngestPipeline::new(ctx),
        }
    }

    fn own_node(replicate_to: &[&str]) -> NodeRecord {
        let now = Utc::now();
        NodeRecord {
            namespace: "chron".to_string(),
            name: "Chronopolis".to_string(),
            api_root: "https://chron.example/api/".to_string(),
            ssh_username: None,
            protocols: vec!["rsync".to_string()],
            fixity_algorithms: vec!["sha256".to_string()],
            replicate_from: vec![],
            replicate_to: replicate_to.iter().map(|s| s.to_string()).collect(),
            restore_from: vec![],
            restore_to: vec![],
            created_at: now,
            updated_at: now,
            last_pull_date: None,
        }
    }

    async fn seed(harness: &Harness, local_id: &str, peers: &[&str]) -> WorkItem {
        harness.local.create_node(&own_node(peers)).await.unwrap();

        let source = harness.dir.path().join("source").join(local_id);
        std::fs::create_dir_all(source.join("images")).unwrap();
        std::fs::write(source.join("readme.txt"), b"hello").unwrap();
        std::fs::write(source.join("images/one.jpg"), b"jpegbytes").unwrap();

        let mut item = WorkItem::new(WorkItemAction::Ingest, Uuid::new_v4());
        item.local_id = Some(local_id.to_string());
        let item = harness.local.create_work_item(&item).await.unwrap();
        harness.queue.send(&item.id.to_string()).await.unwrap();
        item
    }

    async fn next_message(harness: &Harness) -> QueueMessage {
        harness.queue.receive(1).await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn test_ingest_packages_stores_and_records() {
        let harness = harness();
        let item = seed(&harness, "photos-2020", &["aptrust", "lockss", "sdr"]).await;
        let bag_uuid = item.identifier;

        let message = next_message(&harness).await;
        harness.pipeline.process_message(message).await;

        let bag = harness.local.get_bag(bag_uuid).await.unwrap();
        assert_eq!(bag.local_id, "photos-2020");
        assert_eq!(bag.admin_node, "chron");
        assert!(bag.size > 0);

        let ingests = harness
            .local
            .list_ingests(&ListParams::new().bag(bag_uuid))
            .await
            .unwrap();
        assert_eq!(ingests.results.len(), 1);
        assert!(ingests.results[0].ingested);

        let digest = harness.local.latest_digest(bag_uuid, "sha256").await.unwrap();
        assert_eq!(digest.node, "chron");
        assert_eq!(digest.value.len(), 64);

        let replications = harness
            .local
            .list_replications(&ListParams::new().bag(bag_uuid))
            .await
            .unwrap();
        assert_eq!(replications.results.len(), 2);
        for xfer in &replications.results {
            assert_eq!(xfer.from_node, "chron");
            assert!(["aptrust", "lockss", "sdr"].contains(&xfer.to_node.as_str()));
            assert!(!xfer.store_requested);
        }
        let to_nodes: Vec<&str> = replications
            .results
            .iter()
            .map(|x| x.to_node.as_str())
            .collect();
        assert_ne!(to_nodes[0], to_nodes[1]);

        // Stored cold, still staged for peers, reservation released.
        assert!(harness.cold.available(&bag.tar_key()).await.unwrap());
        assert_eq!(
            harness.cold.stored_tags(&bag.tar_key()).unwrap().local_id,
            "photos-2020"
        );
        assert!(harness.staging.tar_path(bag_uuid).exists());
        assert_eq!(harness.staging.reserved_bytes(), 0);

        assert_eq!(harness.catalog.stamped_bag("photos-2020"), Some(bag_uuid));
        assert_eq!(harness.catalog.events_for("photos-2020").len(), 2);

        let item = harness.local.get_work_item(item.id).await.unwrap();
        assert!(item.is_completed());
        assert!(harness.queue.is_empty());

        let entries = harness.audit.read_all().await.unwrap();
        assert_eq!(entries.last().unwrap().outcome, AuditOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_missing_local_id_is_fatal() {
        let harness = harness();
        harness
            .local
            .create_node(&own_node(&["aptrust", "lockss"]))
            .await
            .unwrap();

        let item = harness
            .local
            .create_work_item(&WorkItem::new(WorkItemAction::Ingest, Uuid::new_v4()))
            .await
            .unwrap();
        harness.queue.send(&item.id.to_string()).await.unwrap();

        let message = next_message(&harness).await;
        harness.pipeline.process_message(message).await;

        let item = harness.local.get_work_item(item.id).await.unwrap();
        assert!(item.is_completed());
        assert!(!item.retry);
        assert!(item.note.unwrap().contains("no local_id"));

        let entries = harness.audit.read_all().await.unwrap();
        assert_eq!(entries.last().unwrap().outcome, AuditOutcome::Failed);
    }

    #[tokio::test]
    async fn test_too_few_peers_is_fatal() {
        let harness = harness();
        let item = seed(&harness, "lonely", &["aptrust"]).await;

        let message = next_message(&harness).await;
        harness.pipeline.process_message(message).await;

        let item = harness.local.get_work_item(item.id).await.unwrap();
        assert!(item.is_completed());
        assert!(!item.retry);

        let entries = harness.audit.read_all().await.unwrap();
        assert_eq!(entries.last().unwrap().outcome, AuditOutcome::Failed);
    }

    #[tokio::test]
    async fn test_reprocessing_does_not_duplicate_records() {
        let harness = harness();
        let item = seed(&harness, "photos-2020", &["aptrust", "lockss"]).await;
        let bag_uuid = item.identifier;

        let message = next_message(&harness).await;
        harness.pipeline.process_message(message).await;

        // Force a full second run of a finished item, as a crashed
        // post-process would.
        let mut reopened = harness.local.get_work_item(item.id).await.unwrap();
        reopened.completed_at = None;
        harness.local.update_work_item(&reopened).await.unwrap();
        harness.queue.send(&item.id.to_string()).await.unwrap();

        let message = next_message(&harness).await;
        harness.pipeline.process_message(message).await;

        let ingests = harness
            .local
            .list_ingests(&ListParams::new().bag(bag_uuid))
            .await
            .unwrap();
        assert_eq!(ingests.results.len(), 1);

        let replications = harness
            .local
            .list_replications(&ListParams::new().bag(bag_uuid))
            .await
            .unwrap();
        assert_eq!(replications.results.len(), 2);

        assert!(harness.queue.is_empty());
    }
}
