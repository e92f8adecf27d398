//! Shared pipeline plumbing.
//!
//! Every pipeline is a chain of stages connected by bounded channels, each
//! stage served by a small fixed pool of workers. A task is owned by exactly
//! one worker at a time and handed to the next stage exactly once; the
//! terminal stage is the only place a queue message is finished or requeued.

use crate::audit::{AuditEntry, AuditLog, AuditOutcome};
use crate::bagit::{BagPackager, BagValidator, SourceCatalog};
use crate::copier::Copier;
use crate::manifest::{Stage, TaskManifest};
use crate::model::{Bag, ReplicationTransfer, WorkItem};
use crate::queue::{QueueMessage, WorkQueue};
use crate::registry::{CreateOutcome, Registry, RemoteRegistries};
use crate::storage::{ColdStore, StagingStore};
use chrono::Utc;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub workers_per_stage: usize,
    pub max_store_attempts: u32,
    pub store_retry_delay: Duration,
    pub max_retrieve_attempts: u32,
    pub retrieve_retry_delay: Duration,
    /// Delay for non-fatal requeues, on the order of minutes.
    pub requeue_delay: Duration,
    /// Delay between polls while waiting for a cold-storage recall.
    pub restore_poll_delay: Duration,
    pub visibility_extension: Duration,
    pub claim_staleness: chrono::Duration,
    /// Number of peers chosen to replicate a freshly ingested bag.
    pub replication_count: usize,
    pub fixity_algorithm: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workers_per_stage: 2,
            max_store_attempts: 3,
            store_retry_delay: Duration::from_secs(5),
            max_retrieve_attempts: 3,
            retrieve_retry_delay: Duration::from_secs(5),
            requeue_delay: Duration::from_secs(5 * 60),
            restore_poll_delay: Duration::from_secs(30 * 60),
            visibility_extension: Duration::from_secs(60 * 60),
            claim_staleness: chrono::Duration::hours(2),
            replication_count: 2,
            fixity_algorithm: "sha256".to_string(),
        }
    }
}

/// Everything the pipelines need: registries, queue, stores and collaborator
/// boundaries, assembled once at startup.
pub struct PipelineContext {
    pub local_node: String,
    pub pid: u32,
    pub local_registry: Arc<dyn Registry>,
    pub remote_registries: RemoteRegistries,
    pub queue: Arc<dyn WorkQueue>,
    pub staging: Arc<StagingStore>,
    pub cold: Arc<dyn ColdStore>,
    pub copier: Arc<dyn Copier>,
    pub validator: Arc<dyn BagValidator>,
    pub packager: Arc<dyn BagPackager>,
    pub catalog: Arc<dyn SourceCatalog>,
    pub audit: Arc<AuditLog>,
    /// Member that owns locally ingested bags.
    pub member: Uuid,
    /// Root directory holding source objects awaiting ingest, by local id.
    pub source_root: PathBuf,
    pub settings: PipelineSettings,
}

/// One in-flight unit of pipeline work.
pub struct Task {
    pub message: QueueMessage,
    pub work_item: WorkItem,
    pub manifest: TaskManifest,
    pub bag: Option<Bag>,
    pub transfer: Option<ReplicationTransfer>,
    /// Digest of the bag's tag-manifest, captured by package/validate stages.
    pub tag_digest: Option<String>,
    /// Requeue even without errors (e.g. waiting out a cold-storage recall).
    pub force_requeue: bool,
    pub requeue_delay: Option<Duration>,
}

impl Task {
    pub fn new(message: QueueMessage, work_item: WorkItem, manifest: TaskManifest) -> Self {
        Self {
            message,
            work_item,
            manifest,
            bag: None,
            transfer: None,
            tag_digest: None,
            force_requeue: false,
            requeue_delay: None,
        }
    }
}

/// Routing decision a stage hands back to the channel wiring.
pub enum Flow {
    /// Hand the task to the next stage.
    Next(Task),
    /// Go straight to post-processing (success, skip, or terminal failure).
    Record(Task),
    /// The message was already finished or requeued; nothing to hand on.
    Done,
}

pub fn stage_channel<T: Send + 'static>(workers: usize) -> (mpsc::Sender<T>, mpsc::Receiver<T>) {
    mpsc::channel(workers.max(1) * 4)
}

/// Spawns a fixed pool of workers draining one shared stage receiver.
pub fn spawn_stage<T, F, Fut>(
    name: &'static str,
    workers: usize,
    receiver: mpsc::Receiver<T>,
    handler: F,
) -> Vec<JoinHandle<()>>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
    (0..workers.max(1))
        .map(|index| {
            let receiver = receiver.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                loop {
                    let next = { receiver.lock().await.recv().await };
                    match next {
                        Some(task) => handler(task).await,
                        None => break,
                    }
                }
                tracing::debug!("{} worker {} stopped", name, index);
            })
        })
        .collect()
}

pub enum ResolveOutcome {
    Resolved(Task),
    /// Message finished or requeued during resolution.
    Done,
}

/// Common intake boilerplate: parse the work-item id, re-fetch the record,
/// rebuild the manifest from its state blob, and claim ownership.
///
/// A message whose work item cannot even be identified is finished, not
/// requeued; it could never become processable.
pub async fn resolve_task(ctx: &PipelineContext, message: QueueMessage) -> ResolveOutcome {
    let id = match message.work_item_id() {
        Ok(id) => id,
        Err(error) => {
            tracing::error!("Dropping unprocessable queue message: {}", error);
            finish_quietly(ctx, &message).await;
            return ResolveOutcome::Done;
        }
    };

    let mut work_item = match ctx.local_registry.get_work_item(id).await {
        Ok(item) => item,
        Err(error) if error.is_fatal() => {
            tracing::error!("Work item {} cannot be resolved: {}", id, error);
            finish_quietly(ctx, &message).await;
            return ResolveOutcome::Done;
        }
        Err(error) => {
            tracing::warn!("Registry lookup for work item {} failed: {}", id, error);
            requeue_quietly(ctx, &message, ctx.settings.requeue_delay).await;
            return ResolveOutcome::Done;
        }
    };

    if work_item.is_completed() {
        tracing::info!("Work item {} already completed; finishing message", id);
        finish_quietly(ctx, &message).await;
        return ResolveOutcome::Done;
    }

    if work_item.is_claimed_elsewhere(&ctx.local_node, ctx.pid, ctx.settings.claim_staleness) {
        tracing::info!(
            "Work item {} is being processed by {:?}/{:?}; skipping",
            id,
            work_item.processing_node,
            work_item.pid
        );
        finish_quietly(ctx, &message).await;
        return ResolveOutcome::Done;
    }

    let manifest = match TaskManifest::from_work_item(&work_item) {
        Ok(manifest) => manifest,
        Err(error) => {
            tracing::error!("Work item {} has a corrupt state blob: {}", id, error);
            finish_quietly(ctx, &message).await;
            return ResolveOutcome::Done;
        }
    };

    work_item.claim(&ctx.local_node, ctx.pid);
    if let Err(error) = ctx.local_registry.update_work_item(&work_item).await {
        tracing::warn!("Failed to claim work item {}: {}", id, error);
        requeue_quietly(ctx, &message, ctx.settings.requeue_delay).await;
        return ResolveOutcome::Done;
    }

    ResolveOutcome::Resolved(Task::new(message, work_item, manifest))
}

/// Terminal stage shared by every pipeline: persist the manifest into the
/// work item's state, clear ownership, write the audit entry, then finish or
/// requeue the queue message exactly once.
pub async fn post_process(ctx: &PipelineContext, mut task: Task) {
    let fatal = task.manifest.fatal();
    let retry = !fatal && (task.manifest.should_retry() || task.force_requeue);

    let outcome = if fatal {
        AuditOutcome::Failed
    } else if retry {
        AuditOutcome::Requeued
    } else {
        AuditOutcome::Succeeded
    };

    task.work_item.note = task
        .manifest
        .first_error()
        .map(str::to_string)
        .or_else(|| task.manifest.note.clone())
        .or_else(|| Some("completed".to_string()));
    task.work_item.retry = retry;
    match task.manifest.to_state() {
        Ok(state) => task.work_item.state = Some(state),
        Err(error) => tracing::error!(
            "Failed to serialize manifest for work item {}: {}",
            task.work_item.id,
            error
        ),
    }
    task.work_item.release();
    if !retry {
        task.work_item.completed_at = Some(Utc::now());
    }

    if let Err(error) = ctx.local_registry.update_work_item(&task.work_item).await {
        tracing::error!(
            "Failed to persist work item {}: {}",
            task.work_item.id,
            error
        );
    }

    let entry = AuditEntry {
        at: Utc::now(),
        action: task.work_item.action,
        work_item_id: task.work_item.id,
        bag: task.manifest.bag,
        outcome,
        errors: task.manifest.all_errors(),
    };
    if let Err(error) = ctx.audit.append(&entry).await {
        tracing::error!("Failed to write audit entry: {}", error);
    }

    if retry {
        let delay = task.requeue_delay.unwrap_or(ctx.settings.requeue_delay);
        requeue_quietly(ctx, &task.message, delay).await;
    } else {
        finish_quietly(ctx, &task.message).await;
    }

    tracing::info!(
        "Work item {} ({}) finished with outcome {:?}",
        task.work_item.id,
        task.work_item.action,
        outcome
    );
}

/// Brings the local copy of a replication record in line with the
/// authoritative copy held by the from-node. Advisory bookkeeping only.
pub async fn reconcile_local_replication(ctx: &PipelineContext, remote: &ReplicationTransfer) {
    match ctx.local_registry.get_replication(remote.replication_id).await {
        Ok(local) => {
            if local.stored != remote.stored
                || local.cancelled != remote.cancelled
                || local.store_requested != remote.store_requested
            {
                if let Err(error) = ctx.local_registry.update_replication(remote).await {
                    tracing::warn!(
                        "Failed to reconcile replication {}: {}",
                        remote.replication_id,
                        error
                    );
                }
            }
        }
        Err(crate::ArkError::NotFound(_)) => {
            match ctx.local_registry.create_replication(remote).await {
                Ok(CreateOutcome::Created) | Ok(CreateOutcome::AlreadyExists) => {}
                Err(error) => tracing::warn!(
                    "Failed to record replication {} locally: {}",
                    remote.replication_id,
                    error
                ),
            }
        }
        Err(error) => tracing::warn!(
            "Failed to read local replication {}: {}",
            remote.replication_id,
            error
        ),
    }
}

pub async fn touch_quietly(ctx: &PipelineContext, message: &QueueMessage) {
    if let Err(error) = ctx
        .queue
        .touch(message, ctx.settings.visibility_extension)
        .await
    {
        tracing::warn!("Failed to extend message visibility: {}", error);
    }
}

async fn finish_quietly(ctx: &PipelineContext, message: &QueueMessage) {
    if let Err(error) = ctx.queue.finish(message).await {
        tracing::warn!("Failed to finish queue message: {}", error);
    }
}

async fn requeue_quietly(ctx: &PipelineContext, message: &QueueMessage, delay: Duration) {
    if let Err(error) = ctx.queue.requeue(message, delay).await {
        tracing::warn!("Failed to requeue queue message: {}", error);
    }
}
