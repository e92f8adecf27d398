//! Replication pipeline: pull a bag from a peer, verify it, move it into
//! cold storage, and record the outcome on both registries.
//!
//! Stages: intake -> copy -> validate -> store -> record.

use super::pipeline::{
    Flow, PipelineContext, ResolveOutcome, Task, post_process, reconcile_local_replication,
    resolve_task, spawn_stage, stage_channel, touch_quietly,
};
use crate::bagit::tag_manifest_digest;
use crate::manifest::Stage;
use crate::model::ReplicationTransfer;
use crate::queue::QueueMessage;
use crate::registry::{ListParams, Registry};
use crate::storage::ColdTags;
use crate::ArkError;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct ReplicationPipeline {
    ctx: Arc<PipelineContext>,
}

impl ReplicationPipeline {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    /// Runs one message through every stage in order. The channel wiring in
    /// [`spawn`](Self::spawn) routes through the same stage methods.
    pub async fn process_message(&self, message: QueueMessage) {
        let mut flow = self.intake(message).await;
        flow = match flow {
            Flow::Next(task) => self.copy(task).await,
            other => other,
        };
        flow = match flow {
            Flow::Next(task) => self.validate(task).await,
            other => other,
        };
        flow = match flow {
            Flow::Next(task) => self.store(task).await,
            other => other,
        };
        match flow {
            Flow::Next(task) | Flow::Record(task) => post_process(&self.ctx, task).await,
            Flow::Done => {}
        }
    }

    /// Resolves the work item, transfer and bag, checks for terminal
    /// transfers, and reserves staging space.
    pub async fn intake(&self, message: QueueMessage) -> Flow {
        let ctx = &self.ctx;
        let mut task = match resolve_task(ctx, message).await {
            ResolveOutcome::Resolved(task) => task,
            ResolveOutcome::Done => return Flow::Done,
        };

        let summary = task.manifest.summary(Stage::Intake);
        summary.start();

        let transfer = match self.resolve_transfer(&mut task).await {
            Ok(transfer) => transfer,
            Err(error) => {
                task.manifest
                    .summary(Stage::Intake)
                    .add_fatal_error(format!("cannot resolve transfer: {}", error));
                return Flow::Record(task);
            }
        };
        task.manifest.transfer_id = Some(transfer.replication_id);

        let bag = match ctx.local_registry.get_bag(task.work_item.identifier).await {
            Ok(bag) => bag,
            Err(error) => {
                task.manifest
                    .summary(Stage::Intake)
                    .add_fatal_error(format!("cannot resolve bag: {}", error));
                return Flow::Record(task);
            }
        };

        if transfer.is_terminal() {
            reconcile_local_replication(ctx, &transfer).await;
            task.manifest.note = Some(if transfer.stored {
                "transfer already stored; reconciled local record".to_string()
            } else {
                "transfer already cancelled; reconciled local record".to_string()
            });
            task.manifest.summary(Stage::Intake).finish();
            task.bag = Some(bag);
            task.transfer = Some(transfer);
            return Flow::Record(task);
        }

        if let Err(error) = ctx.staging.reserve(bag.uuid, bag.size) {
            tracing::info!(
                "Deferring replication of bag {}: {}",
                bag.uuid,
                error
            );
            task.force_requeue = true;
            task.manifest.note = Some("waiting for staging capacity".to_string());
            // Let another worker pick this up after the delay.
            task.work_item.release();
            task.manifest.summary(Stage::Intake).finish();
            task.bag = Some(bag);
            task.transfer = Some(transfer);
            return Flow::Record(task);
        }

        task.manifest.summary(Stage::Intake).finish();
        task.bag = Some(bag);
        task.transfer = Some(transfer);
        Flow::Next(task)
    }

    /// Copies bag content from the peer's transfer link into staging and
    /// reports the received tag-manifest digest back to the sender.
    pub async fn copy(&self, mut task: Task) -> Flow {
        let ctx = &self.ctx;
        let Some(transfer) = task.transfer.clone() else {
            task.manifest
                .summary(Stage::Copy)
                .add_fatal_error("copy stage reached without a transfer");
            return Flow::Record(task);
        };
        let bag_uuid = task.manifest.bag;
        let dest = ctx.staging.tar_path(bag_uuid);

        let bag_size = task.bag.as_ref().map_or(0, |b| b.size);
        if task.manifest.summary(Stage::Copy).succeeded()
            && ctx.staging.has_sized_copy(bag_uuid, bag_size)
        {
            // Resumed task already copied this bag.
            return Flow::Next(task);
        }
        task.manifest.summary(Stage::Copy).start();

        // Transfers can outlive the queue's default visibility by hours.
        touch_quietly(ctx, &task.message).await;
        let copied = ctx.copier.copy(&transfer.link, &dest).await;
        touch_quietly(ctx, &task.message).await;

        if let Err(error) = copied {
            // Non-fatal by contract: a failed copy never cancels a transfer.
            task.manifest
                .summary(Stage::Copy)
                .add_error(format!("{}", error));
            return Flow::Record(task);
        }

        let digest = match tag_manifest_digest(&dest).await {
            Ok(digest) => digest,
            Err(error) => {
                task.manifest
                    .summary(Stage::Copy)
                    .add_error(format!("cannot read received tag manifest: {}", error));
                return Flow::Record(task);
            }
        };
        task.tag_digest = Some(digest.clone());

        if let Err(error) = self.report_fixity_value(&transfer, &digest).await {
            task.manifest
                .summary(Stage::Copy)
                .add_error(format!("cannot report digest to sender: {}", error));
            return Flow::Record(task);
        }

        task.manifest.summary(Stage::Copy).finish();
        task.manifest.local_path = Some(dest);
        Flow::Next(task)
    }

    /// Fully validates the staged bag. Failure is fatal: cancel on the
    /// sender, delete the local copy, close the work item.
    pub async fn validate(&self, mut task: Task) -> Flow {
        let ctx = &self.ctx;
        let bag_uuid = task.manifest.bag;
        let tar_path = ctx.staging.tar_path(bag_uuid);

        task.manifest.summary(Stage::Validate).start();
        touch_quietly(ctx, &task.message).await;

        let report = match ctx.validator.validate(&tar_path).await {
            Ok(report) => report,
            Err(error) => {
                task.manifest
                    .summary(Stage::Validate)
                    .add_error(format!("validator error: {}", error));
                return Flow::Record(task);
            }
        };
        touch_quietly(ctx, &task.message).await;

        if !report.is_valid() {
            let reason = format!("failed validation: {}", report.errors.join("; "));
            task.manifest
                .summary(Stage::Validate)
                .add_fatal_error(reason.clone());
            self.cancel_transfer(&mut task, &reason).await;
            if let Err(error) = ctx.staging.delete_tar(bag_uuid).await {
                tracing::warn!("Failed to delete invalid bag {}: {}", bag_uuid, error);
            }
            return Flow::Record(task);
        }

        if task.tag_digest.is_none() {
            task.tag_digest = report.tag_manifest_digest().map(str::to_string);
        }
        task.manifest.summary(Stage::Validate).finish();
        Flow::Next(task)
    }

    /// Uploads the validated bag to cold storage and marks the transfer
    /// stored on both registries.
    pub async fn store(&self, mut task: Task) -> Flow {
        let ctx = &self.ctx;
        let bag_uuid = task.manifest.bag;

        match self.store_should_proceed(&mut task).await {
            StoreGate::Proceed => {}
            StoreGate::Skip => return Flow::Record(task),
            StoreGate::Wait => {
                task.force_requeue = true;
                task.manifest.note =
                    Some("waiting for sender to approve store".to_string());
                return Flow::Record(task);
            }
        }

        let Some(transfer) = task.transfer.clone() else {
            task.manifest
                .summary(Stage::Store)
                .add_fatal_error("store stage reached without a transfer");
            return Flow::Record(task);
        };
        let Some(bag) = task.bag.clone() else {
            task.manifest
                .summary(Stage::Store)
                .add_fatal_error("store stage reached without a bag");
            return Flow::Record(task);
        };

        task.manifest.summary(Stage::Store).start();
        let tar_path = ctx.staging.tar_path(bag_uuid);
        let tags = ColdTags {
            from_node: transfer.from_node.clone(),
            transfer_id: transfer.replication_id.to_string(),
            member: bag.member.to_string(),
            local_id: bag.local_id.clone(),
            version: bag.version.to_string(),
        };

        let mut stored = false;
        for attempt in 1..=ctx.settings.max_store_attempts {
            touch_quietly(ctx, &task.message).await;
            match ctx.cold.put(&bag.tar_key(), &tar_path, &tags).await {
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
            let reason = format!(
                "store failed after {} attempts",
                ctx.settings.max_store_attempts
            );
            task.manifest
                .summary(Stage::Store)
                .add_fatal_error(reason.clone());
            self.cancel_transfer(&mut task, &reason).await;
            if let Err(error) = ctx.staging.delete_tar(bag_uuid).await {
                tracing::warn!("Failed to delete staged bag {}: {}", bag_uuid, error);
            }
            return Flow::Record(task);
        }

        let mut updated = transfer.clone();
        updated.mark_stored();
        if let Err(error) = self.update_remote_transfer(&updated).await {
            // The upload succeeded; redelivery will reconcile the flag.
            task.manifest
                .summary(Stage::Store)
                .add_error(format!("cannot mark transfer stored on sender: {}", error));
            return Flow::Record(task);
        }
        reconcile_local_replication(ctx, &updated).await;
        task.transfer = Some(updated);

        if let Err(error) = ctx.staging.delete_tar(bag_uuid).await {
            tracing::warn!("Failed to delete stored bag {}: {}", bag_uuid, error);
        }

        task.manifest.summary(Stage::Store).finish();
        Flow::Next(task)
    }

    /// Wires the stages together with bounded channels and worker pools.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let workers = self.ctx.settings.workers_per_stage;
        let (copy_tx, copy_rx) = stage_channel::<Task>(workers);
        let (validate_tx, validate_rx) = stage_channel::<Task>(workers);
        let (store_tx, store_rx) = stage_channel::<Task>(workers);
        let (record_tx, record_rx) = stage_channel::<Task>(workers);

        let mut handles = Vec::new();

        let pipeline = self.clone();
        let record_for_copy = record_tx.clone();
        let validate_for_copy = validate_tx.clone();
        handles.extend(spawn_stage(
            "replication.copy",
            workers,
            copy_rx,
            move |task| {
                let pipeline = pipeline.clone();
                let next = validate_for_copy.clone();
                let record = record_for_copy.clone();
                async move {
                    match pipeline.copy(task).await {
                        Flow::Next(task) => drop(next.send(task).await),
                        Flow::Record(task) => drop(record.send(task).await),
                        Flow::Done => {}
                    }
                }
            },
        ));

        let pipeline = self.clone();
        let record_for_validate = record_tx.clone();
        let store_for_validate = store_tx.clone();
        handles.extend(spawn_stage(
            "replication.validate",
            workers,
            validate_rx,
            move |task| {
                let pipeline = pipeline.clone();
                let next = store_for_validate.clone();
                let record = record_for_validate.clone();
                async move {
                    match pipeline.validate(task).await {
                        Flow::Next(task) => drop(next.send(task).await),
                        Flow::Record(task) => drop(record.send(task).await),
                        Flow::Done => {}
                    }
                }
            },
        ));

        let pipeline = self.clone();
        let record_for_store = record_tx.clone();
        handles.extend(spawn_stage(
            "replication.store",
            workers,
            store_rx,
            move |task| {
                let pipeline = pipeline.clone();
                let record = record_for_store.clone();
                async move {
                    match pipeline.store(task).await {
                        Flow::Next(task) | Flow::Record(task) => drop(record.send(task).await),
                        Flow::Done => {}
                    }
                }
            },
        ));

        let pipeline = self.clone();
        handles.extend(spawn_stage(
            "replication.record",
            workers,
            record_rx,
            move |task| {
                let pipeline = pipeline.clone();
                async move { post_process(&pipeline.ctx, task).await }
            },
        ));

        // Intake poller feeds the first channel.
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
                    match pipeline.intake(message).await {
                        Flow::Next(task) => drop(copy_tx.send(task).await),
                        Flow::Record(task) => drop(record_tx.send(task).await),
                        Flow::Done => {}
                    }
                }
            }
        }));

        handles
    }

    /// Idempotency guard run before storing, in order: claimed by another
    /// live owner, already stored, already cancelled, sender approval.
    async fn store_should_proceed(&self, task: &mut Task) -> StoreGate {
        let ctx = &self.ctx;

        match ctx.local_registry.get_work_item(task.work_item.id).await {
            Ok(current)
                if current.is_claimed_elsewhere(
                    &ctx.local_node,
                    ctx.pid,
                    ctx.settings.claim_staleness,
                ) =>
            {
                task.manifest.note =
                    Some("work item claimed by another worker; skipping store".to_string());
                return StoreGate::Skip;
            }
            Ok(_) => {}
            Err(error) => {
                task.manifest
                    .summary(Stage::Store)
                    .add_error(format!("cannot re-check work item: {}", error));
                return StoreGate::Skip;
            }
        }

        let Some(transfer) = task.transfer.clone() else {
            return StoreGate::Proceed;
        };
        let current = match self.fetch_remote_transfer(&transfer).await {
            Ok(current) => current,
            Err(error) => {
                task.manifest
                    .summary(Stage::Store)
                    .add_error(format!("cannot re-check transfer: {}", error));
                return StoreGate::Skip;
            }
        };

        if current.stored {
            reconcile_local_replication(ctx, &current).await;
            task.manifest.note = Some("transfer already stored; reconciled".to_string());
            if let Err(error) = ctx.staging.delete_tar(task.manifest.bag).await {
                tracing::warn!("Failed to delete staged bag: {}", error);
            }
            return StoreGate::Skip;
        }
        if current.cancelled {
            reconcile_local_replication(ctx, &current).await;
            task.manifest.note = Some("transfer already cancelled; reconciled".to_string());
            if let Err(error) = ctx.staging.delete_tar(task.manifest.bag).await {
                tracing::warn!("Failed to delete staged bag: {}", error);
            }
            return StoreGate::Skip;
        }
        if !current.store_requested {
            return StoreGate::Wait;
        }

        task.transfer = Some(current);
        StoreGate::Proceed
    }

    /// Finds the replication record for the work item's bag and re-fetches
    /// the authoritative copy from the from-node's registry.
    async fn resolve_transfer(&self, task: &mut Task) -> crate::Result<ReplicationTransfer> {
        let ctx = &self.ctx;

        let local = if let Some(id) = task.manifest.transfer_id {
            ctx.local_registry.get_replication(id).await?
        } else {
            let params = ListParams::new()
                .bag(task.work_item.identifier)
                .to_node(&ctx.local_node);
            let page = ctx.local_registry.list_replications(&params).await?;
            page.results
                .into_iter()
                .rev()
                .max_by_key(|xfer| (!xfer.is_terminal(), xfer.updated_at))
                .ok_or_else(|| {
                    ArkError::NotFound(format!(
                        "no replication transfer for bag {}",
                        task.work_item.identifier
                    ))
                })?
        };

        self.fetch_remote_transfer(&local).await
    }

    async fn fetch_remote_transfer(
        &self,
        transfer: &ReplicationTransfer,
    ) -> crate::Result<ReplicationTransfer> {
        let remote = self.ctx.remote_registries.get(&transfer.from_node)?;
        remote.get_replication(transfer.replication_id).await
    }

    async fn update_remote_transfer(&self, transfer: &ReplicationTransfer) -> crate::Result<()> {
        let remote = self.ctx.remote_registries.get(&transfer.from_node)?;
        remote.update_replication(transfer).await
    }

    async fn report_fixity_value(
        &self,
        transfer: &ReplicationTransfer,
        digest: &str,
    ) -> crate::Result<()> {
        let mut updated = self.fetch_remote_transfer(transfer).await?;
        if updated.fixity_value.as_deref() == Some(digest) {
            return Ok(());
        }
        updated.fixity_value = Some(digest.to_string());
        self.update_remote_transfer(&updated).await
    }

    /// Cancels the transfer on the sender's registry, preserving an existing
    /// cancel reason, and mirrors the change locally.
    async fn cancel_transfer(&self, task: &mut Task, reason: &str) {
        let Some(transfer) = task.transfer.clone() else {
            return;
        };

        let mut current = match self.fetch_remote_transfer(&transfer).await {
            Ok(current) => current,
            Err(error) => {
                tracing::warn!(
                    "Cannot fetch transfer {} to cancel it: {}",
                    transfer.replication_id,
                    error
                );
                return;
            }
        };

        if !current.cancelled {
            current.cancel(reason);
            if let Err(error) = self.update_remote_transfer(&current).await {
                tracing::warn!(
                    "Failed to cancel transfer {} on sender: {}",
                    current.replication_id,
                    error
                );
                return;
            }
        }
        reconcile_local_replication(&self.ctx, &current).await;
        task.transfer = Some(current);
    }
}

enum StoreGate {
    Proceed,
    Skip,
    Wait,
}
