//! Stage pipeline: drives one claimed task through download, prepare and
//! publish, then runs post-publish side effects.
//!
//! Every stage starts from the first missing artifact, so a task resumed
//! after a crash never repeats a stage whose artifact was recorded. Each
//! collaborator call is bounded by a timeout; an elapsed timeout counts as
//! a transient failure.
//!
//! A transient store error mid-run hands the task back as a failed attempt
//! with the policy's backoff. Side-effect delivery rows are created before
//! the task is marked posted.

use super::{CaptionTemplate, resume::recorded_publish};
use crate::task::{
    domain::{
        ClaimedTask, Delivery, DeliveryStatus, DeliveryTarget, FailureClass, PayloadRef,
        RetryPolicy, Stage, StageArtifact, StageFailure, StageOutcome, Task, TaskId, TaskStatus,
    },
    ports::{
        Downloader, FetchedMedia, MediaStorage, PublishError, PublishRequest, Publisher,
        SideEffect, SideEffectError, SideEffectRequest, TaskStore, TaskStoreError,
        TransformError, Transformer,
    },
};
use chrono::{DateTime, Utc};
use mockable::Clock;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// External collaborators the pipeline calls.
#[derive(Clone)]
pub struct Collaborators {
    /// Fetches remote payloads.
    pub downloader: Arc<dyn Downloader>,
    /// Stores fetched media.
    pub storage: Arc<dyn MediaStorage>,
    /// Prepares stored media.
    pub transformer: Arc<dyn Transformer>,
    /// Publishes prepared media.
    pub publisher: Arc<dyn Publisher>,
    /// Post-publish side effects, each with its own delivery record.
    pub side_effects: Vec<Arc<dyn SideEffect>>,
}

/// Pipeline tuning.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Backoff and attempt ceiling for tasks and deliveries.
    pub policy: RetryPolicy,
    /// Upper bound on any single collaborator call.
    pub collaborator_timeout: Duration,
    /// Delivery target that guards the publish call.
    pub publish_target: DeliveryTarget,
    /// Caption template handed to the publisher.
    pub caption: CaptionTemplate,
}

/// Where a pipeline run left the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// The task is posted.
    Posted {
        /// Identifier assigned by the publisher.
        external_post_id: String,
    },
    /// A stage failed transiently; the task is claimable again at `at`.
    RetryScheduled {
        /// Earliest retry time.
        at: DateTime<Utc>,
    },
    /// The task failed terminally.
    Failed {
        /// Recorded failure message.
        reason: String,
    },
    /// Shutdown was requested between stages.
    Interrupted {
        /// Status the task was left in.
        status: TaskStatus,
    },
}

/// Errors that stop a pipeline run without a recorded stage outcome.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The store failed or rejected a transition.
    #[error(transparent)]
    Store(#[from] TaskStoreError),
    /// A delivery references a task that no longer exists.
    #[error("task {0} not found for delivery")]
    MissingTask(TaskId),
}

type StageResult = Result<StageArtifact, StageFailure>;

/// Waits before each attempt to hand a task back after a store error.
const RELEASE_DELAYS: [Duration; 4] = [
    Duration::ZERO,
    Duration::from_millis(250),
    Duration::from_secs(1),
    Duration::from_secs(4),
];

/// Drives claimed tasks through their stages.
pub struct StagePipeline<S, C>
where
    S: TaskStore,
    C: Clock + Send + Sync,
{
    store: Arc<S>,
    clock: Arc<C>,
    collaborators: Collaborators,
    settings: PipelineSettings,
}

impl<S, C> StagePipeline<S, C>
where
    S: TaskStore,
    C: Clock + Send + Sync,
{
    /// Creates a pipeline.
    #[must_use]
    pub const fn new(
        store: Arc<S>,
        clock: Arc<C>,
        collaborators: Collaborators,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            clock,
            collaborators,
            settings,
        }
    }

    /// Returns the pipeline settings.
    #[must_use]
    pub const fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Claims a task announced by a hint, if it is still claimable.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Store`] when the claim fails.
    pub async fn claim_hinted(&self, task_id: TaskId) -> Result<Option<ClaimedTask>, PipelineError> {
        let claimed = self
            .store
            .claim(task_id, self.clock.utc(), self.settings.policy.max_attempts())
            .await?;
        Ok(claimed)
    }

    /// Runs every remaining stage of a claimed task.
    ///
    /// `shutdown` is checked before each stage; a cancelled run leaves the
    /// task in its current status for startup recovery. When the store
    /// fails transiently mid-run, the task is released as a failed attempt
    /// and the outcome reports its retry.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] when the store fails and the task cannot be
    /// released either. Collaborator failures are recorded on the task and
    /// reported through [`PipelineOutcome`].
    pub async fn run(
        &self,
        claimed: ClaimedTask,
        shutdown: &CancellationToken,
    ) -> Result<PipelineOutcome, PipelineError> {
        let task_id = claimed.task().id();
        match self.drive(claimed, shutdown).await {
            Err(PipelineError::Store(err)) if err.is_transient() => {
                tracing::warn!(task_id = %task_id, error = %err, "store failed mid-run, releasing task");
                self.release(task_id, err, shutdown).await
            }
            other => other,
        }
    }

    async fn drive(
        &self,
        claimed: ClaimedTask,
        shutdown: &CancellationToken,
    ) -> Result<PipelineOutcome, PipelineError> {
        let attempt = claimed.attempt();
        let mut task = claimed.into_task();
        tracing::info!(task_id = %task.id(), attempt, kind = %task.kind(), "processing task");

        while let Some(stage) = task.next_stage() {
            if shutdown.is_cancelled() {
                tracing::info!(task_id = %task.id(), status = %task.status(), "stopping between stages");
                return Ok(PipelineOutcome::Interrupted {
                    status: task.status(),
                });
            }
            let started = self.record(&task, stage, StageOutcome::Started).await?;
            let result = match stage {
                Stage::Download => self.download(&started).await,
                Stage::Prepare => self.prepare(&started).await,
                Stage::Publish => self.publish(&started).await?,
            };
            match result {
                Ok(artifact) => {
                    tracing::debug!(task_id = %started.id(), stage = %stage, "stage completed");
                    task = self
                        .record(&started, stage, StageOutcome::Completed(Some(artifact)))
                        .await?;
                }
                Err(failure) => {
                    tracing::warn!(
                        task_id = %started.id(),
                        stage = %stage,
                        attempt,
                        class = ?failure.class(),
                        error = failure.message(),
                        "stage failed"
                    );
                    let failed = self
                        .record(&started, stage, StageOutcome::Failed(failure))
                        .await?;
                    return Ok(failure_outcome(&failed));
                }
            }
        }

        if task.status() != TaskStatus::Posted {
            self.ensure_side_effects(task.id()).await?;
            task = self
                .record(&task, Stage::Publish, StageOutcome::Completed(None))
                .await?;
        }
        let external_post_id = task.external_post_id().unwrap_or_default().to_owned();
        tracing::info!(task_id = %task.id(), post_id = %external_post_id, "task posted");
        self.notify(&task).await;
        Ok(PipelineOutcome::Posted { external_post_id })
    }

    /// Hands a task back after a store error interrupted its run.
    ///
    /// Retries with bounded backoff. A task that still cannot be released
    /// stays in progress until the abandoned-work sweep reclaims it.
    async fn release(
        &self,
        task_id: TaskId,
        cause: TaskStoreError,
        shutdown: &CancellationToken,
    ) -> Result<PipelineOutcome, PipelineError> {
        let message = format!("store: {cause}");
        let mut last = cause;
        for delay in RELEASE_DELAYS {
            if !delay.is_zero() {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
            match self.try_release(task_id, &message).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_transient() => last = err,
                Err(err) => return Err(err.into()),
            }
        }
        tracing::warn!(task_id = %task_id, error = %last, "task release failed");
        Err(PipelineError::Store(last))
    }

    async fn try_release(
        &self,
        task_id: TaskId,
        message: &str,
    ) -> Result<PipelineOutcome, TaskStoreError> {
        let task = self
            .store
            .get(task_id)
            .await?
            .ok_or(TaskStoreError::NotFound(task_id))?;
        let published_id =
            recorded_publish(self.store.as_ref(), &task, &self.settings.publish_target).await?;
        let Some(transition) = task.release_transition(
            message,
            &self.settings.policy,
            published_id.as_deref(),
            self.clock.utc(),
        ) else {
            return Ok(settled_outcome(&task));
        };
        if transition.to() == TaskStatus::Posted {
            self.ensure_side_effects(task_id).await?;
        }
        let released = self.store.apply_transition(&transition).await?;
        tracing::info!(task_id = %task_id, status = %released.status(), "released task after store error");
        Ok(settled_outcome(&released))
    }

    /// Runs a side effect for a delivery the dispatcher already claimed.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] when the task is missing or the store fails.
    pub async fn run_side_effect(&self, delivery: Delivery) -> Result<(), PipelineError> {
        let task = self
            .store
            .get(delivery.task_id())
            .await?
            .ok_or(PipelineError::MissingTask(delivery.task_id()))?;
        let effect = self
            .collaborators
            .side_effects
            .iter()
            .find(|effect| effect.target() == delivery.target())
            .cloned();
        match effect {
            Some(found) => self.deliver_side_effect(&task, found.as_ref(), delivery).await,
            None => {
                let mut orphan = delivery;
                tracing::warn!(target = %orphan.target(), "no side effect registered for target");
                let now = self.clock.utc();
                let max = self.settings.policy.max_attempts();
                orphan.mark_failed(
                    "no side effect registered",
                    self.settings.policy.decide(orphan.attempts(), FailureClass::Permanent, now),
                    max,
                    now,
                );
                self.store.update_delivery(&orphan).await?;
                Ok(())
            }
        }
    }

    async fn record(
        &self,
        task: &Task,
        stage: Stage,
        outcome: StageOutcome,
    ) -> Result<Task, TaskStoreError> {
        self.store
            .record_stage_result(task, stage, &outcome, &self.settings.policy, self.clock.utc())
            .await
    }

    async fn download(&self, task: &Task) -> StageResult {
        let media = match task.payload() {
            PayloadRef::Inline { text } => FetchedMedia::new(text.clone().into_bytes(), "text/plain"),
            remote @ PayloadRef::Remote { .. } => {
                self.call(
                    "download",
                    self.collaborators.downloader.fetch(remote),
                    |err| err.class(),
                )
                .await?
            }
        };
        let path = self
            .call(
                "store",
                self.collaborators.storage.persist(task.id(), &media),
                |_| FailureClass::Transient,
            )
            .await?;
        Ok(StageArtifact::Source(path))
    }

    async fn prepare(&self, task: &Task) -> StageResult {
        let src_path = task
            .src_path()
            .ok_or_else(|| StageFailure::permanent("source artifact missing"))?;
        let prepared = self
            .call(
                "prepare",
                self.collaborators
                    .transformer
                    .prepare(task.id(), src_path, task.kind()),
                TransformError::class,
            )
            .await?;
        Ok(StageArtifact::Prepared(prepared))
    }

    /// Publishes through the publish delivery record.
    ///
    /// A delivery already marked posted supplies its external identifier, so
    /// a task that crashed after publishing is never posted twice.
    async fn publish(&self, task: &Task) -> Result<StageResult, PipelineError> {
        let Some(prepared) = task.prepared_path() else {
            return Ok(Err(StageFailure::permanent("prepared artifact missing")));
        };
        let mut delivery = self
            .store
            .ensure_delivery(task.id(), &self.settings.publish_target, self.clock.utc())
            .await?;
        if delivery.status() == DeliveryStatus::Posted
            && let Some(external_id) = delivery.external_id()
        {
            tracing::info!(task_id = %task.id(), post_id = external_id, "reusing recorded publish");
            let artifact = StageArtifact::ExternalPost(external_id.to_owned());
            self.ensure_side_effects(task.id()).await?;
            return Ok(Ok(artifact));
        }

        let caption = match self.settings.caption.render(task) {
            Ok(caption) => caption,
            Err(err) => return Ok(Err(StageFailure::permanent(err.to_string()))),
        };
        delivery.start_attempt(self.clock.utc());
        self.store.update_delivery(&delivery).await?;

        let request = PublishRequest {
            task_id: task.id(),
            kind: task.kind(),
            media_path: prepared.clone(),
            caption,
        };
        let result = self
            .call(
                "publish",
                self.collaborators.publisher.publish(&request),
                PublishError::class,
            )
            .await;
        let now = self.clock.utc();
        match &result {
            Ok(post_id) => delivery.mark_posted(Some(post_id.clone()), now),
            Err(failure) => delivery.mark_failed(
                failure.message(),
                self.settings
                    .policy
                    .decide(task.attempts(), failure.class(), now),
                self.settings.policy.max_attempts(),
                now,
            ),
        }
        self.store.update_delivery(&delivery).await?;
        if result.is_ok() {
            self.ensure_side_effects(task.id()).await?;
        }
        Ok(result.map(StageArtifact::ExternalPost))
    }

    /// Creates a pending delivery for every side effect, so the work
    /// survives a crash between posting and notifying.
    async fn ensure_side_effects(&self, task_id: TaskId) -> Result<(), TaskStoreError> {
        let now = self.clock.utc();
        for effect in &self.collaborators.side_effects {
            self.store
                .ensure_delivery(task_id, effect.target(), now)
                .await?;
        }
        Ok(())
    }

    /// Runs every configured side effect once. Failures stay on the side
    /// effect's delivery record and are retried by the dispatcher.
    async fn notify(&self, task: &Task) {
        for effect in &self.collaborators.side_effects {
            if let Err(err) = self.notify_one(task, effect.as_ref()).await {
                tracing::warn!(
                    task_id = %task.id(),
                    target = %effect.target(),
                    error = %err,
                    "side effect bookkeeping failed"
                );
            }
        }
    }

    async fn notify_one(&self, task: &Task, effect: &dyn SideEffect) -> Result<(), PipelineError> {
        let now = self.clock.utc();
        let delivery = self
            .store
            .ensure_delivery(task.id(), effect.target(), now)
            .await?;
        let claimed = self
            .store
            .claim_delivery(delivery.id(), now, self.settings.policy.max_attempts())
            .await?;
        match claimed {
            Some(ready) => self.deliver_side_effect(task, effect, ready).await,
            None => Ok(()),
        }
    }

    async fn deliver_side_effect(
        &self,
        task: &Task,
        effect: &dyn SideEffect,
        mut delivery: Delivery,
    ) -> Result<(), PipelineError> {
        let request = SideEffectRequest {
            task_id: task.id(),
            kind: task.kind(),
            external_post_id: task.external_post_id().unwrap_or_default().to_owned(),
            caption: task.caption().map(str::to_owned),
            media_path: task.prepared_path().cloned(),
        };
        let result = self
            .call("side effect", effect.run(&request), SideEffectError::class)
            .await;
        let now = self.clock.utc();
        match result {
            Ok(receipt) => delivery.mark_posted(receipt, now),
            Err(failure) => {
                let decision =
                    self.settings
                        .policy
                        .decide(delivery.attempts(), failure.class(), now);
                tracing::warn!(
                    task_id = %task.id(),
                    target = %delivery.target(),
                    attempt = delivery.attempts(),
                    error = failure.message(),
                    "side effect failed"
                );
                delivery.mark_failed(
                    failure.message(),
                    decision,
                    self.settings.policy.max_attempts(),
                    now,
                );
            }
        }
        self.store.update_delivery(&delivery).await?;
        Ok(())
    }

    /// Awaits a collaborator call under the configured timeout.
    async fn call<T, E>(
        &self,
        label: &str,
        call: impl Future<Output = Result<T, E>> + Send,
        classify: impl FnOnce(&E) -> FailureClass + Send,
    ) -> Result<T, StageFailure>
    where
        E: Display,
    {
        let timeout = self.settings.collaborator_timeout;
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(StageFailure::new(classify(&err), err.to_string())),
            Err(_) => Err(StageFailure::transient(format!(
                "{label} timed out after {}s",
                timeout.as_secs()
            ))),
        }
    }
}

fn settled_outcome(task: &Task) -> PipelineOutcome {
    match task.status() {
        TaskStatus::Posted => PipelineOutcome::Posted {
            external_post_id: task.external_post_id().unwrap_or_default().to_owned(),
        },
        TaskStatus::Failed => failure_outcome(task),
        status => PipelineOutcome::Interrupted { status },
    }
}

fn failure_outcome(task: &Task) -> PipelineOutcome {
    match task.next_attempt_at() {
        Some(at) => PipelineOutcome::RetryScheduled { at },
        None => PipelineOutcome::Failed {
            reason: task.last_error().unwrap_or_default().to_owned(),
        },
    }
}
