//! Restore and fixity pipeline: recall a bag from cold storage, retrieve it
//! once warm, and verify its digest against the registry.
//!
//! Stages: restore_init -> retrieve -> fixity_check.
//!
//! A cold-storage recall completes hours after it is requested, so the task
//! parks itself on the queue between polls; the manifest carries the recall
//! state across process lifetimes.

use super::pipeline::{
    Flow, PipelineContext, ResolveOutcome, Task, post_process, resolve_task, spawn_stage,
    stage_channel, touch_quietly,
};
use crate::manifest::Stage;
use crate::model::FixityCheck;
use crate::queue::QueueMessage;
use crate::registry::Registry;
use crate::storage::RestoreStatus;
use crate::ArkError;
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub struct RestorePipeline {
    ctx: Arc<PipelineContext>,
}

impl RestorePipeline {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    pub async fn process_message(&self, message: QueueMessage) {
        let mut flow = self.restore_init(message).await;
        flow = match flow {
            Flow::Next(task) => self.retrieve(task).await,
            other => other,
        };
        flow = match flow {
            Flow::Next(task) => self.fixity_check(task).await,
            other => other,
        };
        match flow {
            Flow::Next(task) | Flow::Record(task) => post_process(&self.ctx, task).await,
            Flow::Done => {}
        }
    }

    /// Resolves the bag and asks cold storage to warm it up, parking the task
    /// until the recall completes.
    pub async fn restore_init(&self, message: QueueMessage) -> Flow {
        let ctx = &self.ctx;
        let mut task = match resolve_task(ctx, message).await {
            ResolveOutcome::Resolved(task) => task,
            ResolveOutcome::Done => return Flow::Done,
        };

        task.manifest.summary(Stage::RestoreInit).start();

        let bag = match ctx.local_registry.get_bag(task.work_item.identifier).await {
            Ok(bag) => bag,
            Err(error) if error.is_fatal() => {
                task.manifest
                    .summary(Stage::RestoreInit)
                    .add_fatal_error(format!("cannot resolve bag: {}", error));
                return Flow::Record(task);
            }
            Err(error) => {
                task.manifest
                    .summary(Stage::RestoreInit)
                    .add_error(format!("registry lookup failed: {}", error));
                return Flow::Record(task);
            }
        };
        task.bag = Some(bag.clone());

        if task.manifest.available_in_cold {
            task.manifest.summary(Stage::RestoreInit).finish();
            return Flow::Next(task);
        }

        match ctx.cold.restore_request(&bag.tar_key()).await {
            Ok(RestoreStatus::AlreadyAvailable) => {
                task.manifest.available_in_cold = true;
                task.manifest.summary(Stage::RestoreInit).finish();
                Flow::Next(task)
            }
            Ok(RestoreStatus::Accepted {
                estimated_available_at,
            }) => {
                tracing::info!(
                    "Recall of bag {} accepted; estimated available at {}",
                    bag.uuid,
                    estimated_available_at
                );
                task.manifest.restore_requested = true;
                task.manifest.estimated_available_at = Some(estimated_available_at);
                task.manifest.note = Some("waiting for cold-storage recall".to_string());
                task.force_requeue = true;
                task.requeue_delay = Some(ctx.settings.restore_poll_delay);
                task.manifest.summary(Stage::RestoreInit).finish();
                Flow::Record(task)
            }
            Ok(RestoreStatus::NotFound) => {
                task.manifest
                    .summary(Stage::RestoreInit)
                    .add_fatal_error(format!(
                        "bag {} is missing from cold storage",
                        bag.uuid
                    ));
                Flow::Record(task)
            }
            Err(error) => {
                task.manifest
                    .summary(Stage::RestoreInit)
                    .add_error(format!("restore request failed: {}", error));
                Flow::Record(task)
            }
        }
    }

    /// Downloads the warm bag into staging. A correctly sized copy left by an
    /// earlier attempt is reused without any download calls.
    pub async fn retrieve(&self, mut task: Task) -> Flow {
        let ctx = &self.ctx;
        let Some(bag) = task.bag.clone() else {
            task.manifest
                .summary(Stage::Retrieve)
                .add_fatal_error("retrieve stage reached without a bag");
            return Flow::Record(task);
        };

        if ctx.staging.has_sized_copy(bag.uuid, bag.size) {
            if let Some(summary) = task.manifest.summary_ref(Stage::Retrieve) {
                if summary.succeeded() {
                    return Flow::Next(task);
                }
            }
            task.manifest.summary(Stage::Retrieve).start();
            task.manifest.summary(Stage::Retrieve).finish();
            task.manifest.local_path = Some(ctx.staging.tar_path(bag.uuid));
            return Flow::Next(task);
        }

        task.manifest.summary(Stage::Retrieve).start();

        if let Err(error) = ctx.staging.reserve(bag.uuid, bag.size) {
            tracing::info!("Deferring retrieval of bag {}: {}", bag.uuid, error);
            task.force_requeue = true;
            task.manifest.note = Some("waiting for staging capacity".to_string());
            task.work_item.release();
            return Flow::Record(task);
        }

        let dest = ctx.staging.tar_path(bag.uuid);
        for attempt in 1..=ctx.settings.max_retrieve_attempts {
            touch_quietly(ctx, &task.message).await;
            match ctx.cold.retrieve(&bag.tar_key(), &dest).await {
                Ok(bytes) => {
                    tracing::info!("Retrieved bag {} ({} bytes)", bag.uuid, bytes);
                    task.manifest.local_path = Some(dest);
                    task.manifest.summary(Stage::Retrieve).finish();
                    return Flow::Next(task);
                }
                Err(error @ ArkError::NotFound(_)) => {
                    task.manifest
                        .summary(Stage::Retrieve)
                        .add_fatal_error(format!("{}", error));
                    return Flow::Record(task);
                }
                Err(error) => {
                    tracing::warn!(
                        "Retrieve attempt {}/{} for bag {} failed: {}",
                        attempt,
                        ctx.settings.max_retrieve_attempts,
                        bag.uuid,
                        error
                    );
                    task.manifest
                        .summary(Stage::Retrieve)
                        .add_error(format!("retrieve attempt {} failed: {}", attempt, error));
                    if attempt < ctx.settings.max_retrieve_attempts {
                        tokio::time::sleep(ctx.settings.retrieve_retry_delay).await;
                    }
                }
            }
        }

        // The object was confirmed warm; persistent failure here is not
        // something another attempt will fix.
        task.manifest
            .summary(Stage::Retrieve)
            .add_fatal_error(format!(
                "retrieve failed after {} attempts",
                ctx.settings.max_retrieve_attempts
            ));
        Flow::Record(task)
    }

    /// Validates the retrieved bag and compares its tag-manifest digest with
    /// the registry's latest digest. A mismatch is fatal and records nothing:
    /// a failed check must never look like a completed one.
    pub async fn fixity_check(&self, mut task: Task) -> Flow {
        let ctx = &self.ctx;
        let Some(bag) = task.bag.clone() else {
            task.manifest
                .summary(Stage::FixityCheck)
                .add_fatal_error("fixity stage reached without a bag");
            return Flow::Record(task);
        };

        task.manifest.summary(Stage::FixityCheck).start();
        touch_quietly(ctx, &task.message).await;

        let tar_path = ctx.staging.tar_path(bag.uuid);
        let report = match ctx.validator.validate(&tar_path).await {
            Ok(report) => report,
            Err(error) => {
                task.manifest
                    .summary(Stage::FixityCheck)
                    .add_error(format!("validator error: {}", error));
                return Flow::Record(task);
            }
        };
        if !report.is_valid() {
            task.manifest
                .summary(Stage::FixityCheck)
                .add_fatal_error(format!(
                    "restored bag failed validation: {}",
                    report.errors.join("; ")
                ));
            return Flow::Record(task);
        }

        let Some(actual) = report.tag_manifest_digest() else {
            task.manifest
                .summary(Stage::FixityCheck)
                .add_fatal_error("restored bag has no tag manifest");
            return Flow::Record(task);
        };
        let actual = actual.to_string();

        let expected = match ctx
            .local_registry
            .latest_digest(bag.uuid, &ctx.settings.fixity_algorithm)
            .await
        {
            Ok(digest) => digest.value,
            Err(error) if error.is_fatal() => {
                task.manifest
                    .summary(Stage::FixityCheck)
                    .add_fatal_error(format!("no recorded digest for bag: {}", error));
                return Flow::Record(task);
            }
            Err(error) => {
                task.manifest
                    .summary(Stage::FixityCheck)
                    .add_error(format!("digest lookup failed: {}", error));
                return Flow::Record(task);
            }
        };

        if actual != expected {
            task.manifest
                .summary(Stage::FixityCheck)
                .add_fatal_error(format!(
                    "fixity mismatch for bag {}: expected {}, computed {}",
                    bag.uuid, expected, actual
                ));
            if let Err(error) = ctx.staging.delete_tar(bag.uuid).await {
                tracing::warn!("Failed to delete mismatched bag {}: {}", bag.uuid, error);
            }
            return Flow::Record(task);
        }

        let check = FixityCheck {
            fixity_check_id: Uuid::new_v4(),
            bag: bag.uuid,
            node: ctx.local_node.clone(),
            success: true,
            fixity_at: Utc::now(),
            created_at: Utc::now(),
        };
        if let Err(error) = ctx.local_registry.create_fixity_check(&check).await {
            task.manifest
                .summary(Stage::FixityCheck)
                .add_error(format!("cannot record fixity check: {}", error));
            return Flow::Record(task);
        }

        if let Err(error) = ctx.staging.delete_tar(bag.uuid).await {
            tracing::warn!("Failed to delete verified bag {}: {}", bag.uuid, error);
        }

        task.manifest.summary(Stage::FixityCheck).finish();
        Flow::Next(task)
    }

    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let workers = self.ctx.settings.workers_per_stage;
        let (retrieve_tx, retrieve_rx) = stage_channel::<Task>(workers);
        let (fixity_tx, fixity_rx) = stage_channel::<Task>(workers);
        let (post_tx, post_rx) = stage_channel::<Task>(workers);

        let mut handles = Vec::new();

        let pipeline = self.clone();
        let post_for_retrieve = post_tx.clone();
        let fixity_for_retrieve = fixity_tx.clone();
        handles.extend(spawn_stage(
            "restore.retrieve",
            workers,
            retrieve_rx,
            move |task| {
                let pipeline = pipeline.clone();
                let next = fixity_for_retrieve.clone();
                let post = post_for_retrieve.clone();
                async move {
                    match pipeline.retrieve(task).await {
                        Flow::Next(task) => drop(next.send(task).await),
                        Flow::Record(task) => drop(post.send(task).await),
                        Flow::Done => {}
                    }
                }
            },
        ));

        let pipeline = self.clone();
        let post_for_fixity = post_tx.clone();
        handles.extend(spawn_stage(
            "restore.fixity",
            workers,
            fixity_rx,
            move |task| {
                let pipeline = pipeline.clone();
                let post = post_for_fixity.clone();
                async move {
                    match pipeline.fixity_check(task).await {
                        Flow::Next(task) | Flow::Record(task) => drop(post.send(task).await),
                        Flow::Done => {}
                    }
                }
            },
        ));

        let pipeline = self.clone();
        handles.extend(spawn_stage("restore.post", workers, post_rx, move |task| {
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
                    match pipeline.restore_init(message).await {
                        Flow::Next(task) => drop(retrieve_tx.send(task).await),
                        Flow::Record(task) => drop(post_tx.send(task).await),
                        Flow::Done => {}
                    }
                }
            }
        }));

        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditLog, AuditOutcome};
    use crate::bagit::{
        BagPackager, MemoryCatalog, TarBagPackager, TarBagValidator, tag_manifest_digest,
    };
    use crate::copier::LocalCopier;
    use crate::model::{Bag, MessageDigest, WorkItem, WorkItemAction};
    use crate::operations::pipeline::PipelineSettings;
    use crate::queue::{MemoryQueue, WorkQueue};
    use crate::registry::{ListParams, MemoryRegistry, RemoteRegistries};
    use crate::storage::{ColdStore, ColdTags, FsColdStore, StagingStore};
    use std::time::Duration;

    struct Harness {
        dir: tempfile::TempDir,
        local: Arc<MemoryRegistry>,
        queue: Arc<MemoryQueue>,
        cold: Arc<FsColdStore>,
        staging: Arc<StagingStore>,
        audit: Arc<AuditLog>,
        pipeline: RestorePipeline,
    }

    fn harness(thaw_delay: chrono::Duration) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let local = Arc::new(MemoryRegistry::new());
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
        let staging =
            Arc::new(StagingStore::new(dir.path().join("staging"), 1 << 30).unwrap());
        let cold = Arc::new(FsColdStore::new(dir.path().join("cold"), thaw_delay).unwrap());
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
            catalog: Arc::new(MemoryCatalog::new()),
            audit: audit.clone(),
            member: Uuid::new_v4(),
            source_root: dir.path().join("source"),
            settings: PipelineSettings {
                retrieve_retry_delay: Duration::from_millis(1),
                requeue_delay: Duration::from_millis(10),
                restore_poll_delay: Duration::from_millis(10),
                ..PipelineSettings::default()
            },
        });

        Harness {
            dir,
            local,
            queue,
            cold,
            staging,
            audit,
            pipeline: RestorePipeline::new(ctx),
        }
    }

    /// Packages a bag, uploads it to the cold store, and seeds the registry
    /// with the bag record, its digest, and a restore work item.
    async fn seed(harness: &Harness) -> (Bag, WorkItem) {
        let source = harness.dir.path().join("origin");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("readme.txt"), b"archived bytes").unwrap();

        let uuid = Uuid::new_v4();
        let tar_path = harness.dir.path().join(format!("{}.tar", uuid));
        TarBagPackager
            .package(uuid, &source, &tar_path)
            .await
            .unwrap();
        let digest = tag_manifest_digest(&tar_path).await.unwrap();
        let size = std::fs::metadata(&tar_path).unwrap().len();

        let now = Utc::now();
        let bag = Bag {
            uuid,
            local_id: "photos-2020".to_string(),
            member: Uuid::new_v4(),
            size,
            version: 1,
            ingest_node: "chron".to_string(),
            admin_node: "chron".to_string(),
            replicating_nodes: vec!["chron".to_string()],
            created_at: now,
            updated_at: now,
        };
        harness.local.create_bag(&bag).await.unwrap();
        harness
            .local
            .create_digest(&MessageDigest {
                bag: uuid,
                algorithm: "sha256".to_string(),
                node: "chron".to_string(),
                value: digest,
                created_at: now,
            })
            .await
            .unwrap();

        harness
            .cold
            .put(
                &bag.tar_key(),
                &tar_path,
                &ColdTags {
                    from_node: "chron".to_string(),
                    transfer_id: "ingest-1".to_string(),
                    member: bag.member.to_string(),
                    local_id: bag.local_id.clone(),
                    version: "1".to_string(),
                },
            )
            .await
            .unwrap();
        std::fs::remove_file(&tar_path).unwrap();

        let item = harness
            .local
            .create_work_item(&WorkItem::new(WorkItemAction::Restore, uuid))
            .await
            .unwrap();
        harness.queue.send(&item.id.to_string()).await.unwrap();

        (bag, item)
    }

    async fn next_message(harness: &Harness) -> QueueMessage {
        harness.queue.receive(1).await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn test_warm_object_is_checked_in_one_pass() {
        let harness = harness(chrono::Duration::zero());
        let (bag, item) = seed(&harness).await;

        let message = next_message(&harness).await;
        harness.pipeline.process_message(message).await;

        let checks = harness
            .local
            .list_fixity_checks(&ListParams::new().bag(bag.uuid))
            .await
            .unwrap();
        assert_eq!(checks.results.len(), 1);
        assert!(checks.results[0].success);
        assert_eq!(checks.results[0].node, "chron");

        assert!(!harness.staging.tar_path(bag.uuid).exists());
        assert!(harness.queue.is_empty());

        let item = harness.local.get_work_item(item.id).await.unwrap();
        assert!(item.is_completed());

        let entries = harness.audit.read_all().await.unwrap();
        assert_eq!(entries.last().unwrap().outcome, AuditOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_frozen_object_parks_then_resumes() {
        let harness = harness(chrono::Duration::zero());
        let (bag, item) = seed(&harness).await;
        harness.cold.freeze(&bag.tar_key());

        // First pass: recall accepted, task parked on the queue.
        let message = next_message(&harness).await;
        harness.pipeline.process_message(message).await;

        assert_eq!(harness.cold.retrieve_count(), 0);
        assert_eq!(harness.queue.len(), 1);
        let parked = harness.local.get_work_item(item.id).await.unwrap();
        assert!(!parked.is_completed());
        assert!(parked.state.is_some());

        let manifest =
            crate::manifest::TaskManifest::from_work_item(&parked).unwrap();
        assert!(manifest.restore_requested);
        assert!(manifest.estimated_available_at.is_some());

        let entries = harness.audit.read_all().await.unwrap();
        assert_eq!(entries.last().unwrap().outcome, AuditOutcome::Requeued);

        // Second pass after the (zero-length) thaw: retrieval and check run.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let message = next_message(&harness).await;
        harness.pipeline.process_message(message).await;

        assert_eq!(harness.cold.retrieve_count(), 1);
        let checks = harness
            .local
            .list_fixity_checks(&ListParams::new().bag(bag.uuid))
            .await
            .unwrap();
        assert_eq!(checks.results.len(), 1);
        assert!(harness.queue.is_empty());
    }

    #[tokio::test]
    async fn test_existing_sized_copy_skips_download() {
        let harness = harness(chrono::Duration::zero());
        let (bag, item) = seed(&harness).await;

        // A prior attempt left a complete copy in staging.
        let staged = harness.staging.tar_path(bag.uuid);
        harness.cold.retrieve(&bag.tar_key(), &staged).await.unwrap();
        let baseline = harness.cold.retrieve_count();

        let message = next_message(&harness).await;
        harness.pipeline.process_message(message).await;

        assert_eq!(harness.cold.retrieve_count(), baseline);
        let checks = harness
            .local
            .list_fixity_checks(&ListParams::new().bag(bag.uuid))
            .await
            .unwrap();
        assert_eq!(checks.results.len(), 1);

        let item = harness.local.get_work_item(item.id).await.unwrap();
        assert!(item.is_completed());
    }

    #[tokio::test]
    async fn test_fixity_mismatch_records_nothing() {
        let harness = harness(chrono::Duration::zero());
        let (bag, item) = seed(&harness).await;

        // Replace the recorded digest so the computed one cannot match.
        harness
            .local
            .create_digest(&MessageDigest {
                bag: bag.uuid,
                algorithm: "sha256".to_string(),
                node: "aptrust".to_string(),
                value: "0".repeat(64),
                created_at: Utc::now() + chrono::Duration::seconds(1),
            })
            .await
            .unwrap();

        let message = next_message(&harness).await;
        harness.pipeline.process_message(message).await;

        let checks = harness
            .local
            .list_fixity_checks(&ListParams::new().bag(bag.uuid))
            .await
            .unwrap();
        assert!(checks.results.is_empty());
        assert!(!harness.staging.tar_path(bag.uuid).exists());

        let item = harness.local.get_work_item(item.id).await.unwrap();
        assert!(item.is_completed());
        assert!(!item.retry);
        assert!(item.note.unwrap().contains("fixity mismatch"));

        let entries = harness.audit.read_all().await.unwrap();
        assert_eq!(entries.last().unwrap().outcome, AuditOutcome::Failed);
    }

    #[tokio::test]
    async fn test_missing_cold_object_is_fatal() {
        let harness = harness(chrono::Duration::zero());
        let (bag, item) = seed(&harness).await;
        std::fs::remove_file(harness.dir.path().join("cold").join(bag.tar_key())).unwrap();

        let message = next_message(&harness).await;
        harness.pipeline.process_message(message).await;

        let item = harness.local.get_work_item(item.id).await.unwrap();
        assert!(item.is_completed());
        assert!(!item.retry);
        assert!(item.note.unwrap().contains("missing from cold storage"));

        let entries = harness.audit.read_all().await.unwrap();
        assert_eq!(entries.last().unwrap().outcome, AuditOutcome::Failed);
    }
}
