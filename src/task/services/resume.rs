//! Recovery for work interrupted by a crash, a shutdown or a lost store
//! connection.

use crate::task::{
    domain::{Delivery, DeliveryStatus, DeliveryTarget, Task, TaskId, TaskStatus},
    ports::{TaskStore, TaskStoreError},
};
use chrono::{DateTime, Utc};
use mockable::Clock;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Upper bound on `sending` deliveries released in one pass.
const RELEASE_BATCH: usize = 10_000;

/// What a recovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeReport {
    /// Tasks returned to the queue.
    pub requeued: Vec<TaskId>,
    /// Tasks settled as posted from a recorded publish.
    pub posted: Vec<TaskId>,
    /// Tasks failed because the interrupted attempt was the last one.
    pub failed: Vec<TaskId>,
    /// Deliveries released from `sending`.
    pub released_deliveries: usize,
}

impl ResumeReport {
    /// Total number of tasks settled.
    #[must_use]
    pub fn total(&self) -> usize {
        self.requeued.len() + self.posted.len() + self.failed.len()
    }

    fn is_empty(&self) -> bool {
        self.total() == 0 && self.released_deliveries == 0
    }
}

/// Settles tasks and deliveries left in flight.
///
/// [`ResumeManager::resume`] must run before the dispatcher starts: any
/// `sending` delivery is assumed abandoned. [`ResumeManager::reclaim_stale`]
/// runs alongside live workers and only touches rows idle since a cutoff.
pub struct ResumeManager<S, C>
where
    S: TaskStore,
    C: Clock + Send + Sync,
{
    store: Arc<S>,
    clock: Arc<C>,
    max_attempts: u32,
    publish_target: DeliveryTarget,
    side_effect_targets: Vec<DeliveryTarget>,
    hints: Option<mpsc::Sender<TaskId>>,
}

impl<S, C> ResumeManager<S, C>
where
    S: TaskStore,
    C: Clock + Send + Sync,
{
    /// Creates a resume manager.
    #[must_use]
    pub const fn new(
        store: Arc<S>,
        clock: Arc<C>,
        max_attempts: u32,
        publish_target: DeliveryTarget,
    ) -> Self {
        Self {
            store,
            clock,
            max_attempts,
            publish_target,
            side_effect_targets: Vec::new(),
            hints: None,
        }
    }

    /// Offers requeued task identifiers to the dispatcher.
    #[must_use]
    pub fn with_hints(mut self, hints: Option<mpsc::Sender<TaskId>>) -> Self {
        self.hints = hints;
        self
    }

    /// Side-effect targets whose deliveries a task settled as posted needs.
    #[must_use]
    pub fn with_side_effects(mut self, targets: Vec<DeliveryTarget>) -> Self {
        self.side_effect_targets = targets;
        self
    }

    /// Runs startup recovery once.
    ///
    /// # Errors
    ///
    /// Returns [`TaskStoreError`] when the store fails; tasks settled before
    /// the failure stay settled.
    pub async fn resume(&self) -> Result<ResumeReport, TaskStoreError> {
        let report = self.settle(None).await?;
        tracing::info!(
            requeued = report.requeued.len(),
            posted = report.posted.len(),
            failed = report.failed.len(),
            released_deliveries = report.released_deliveries,
            "startup recovery complete"
        );
        Ok(report)
    }

    /// Settles in-progress tasks and `sending` deliveries not updated since
    /// `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns [`TaskStoreError`] when the store fails.
    pub async fn reclaim_stale(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<ResumeReport, TaskStoreError> {
        let report = self.settle(Some(cutoff)).await?;
        if !report.is_empty() {
            tracing::warn!(
                requeued = report.requeued.len(),
                posted = report.posted.len(),
                failed = report.failed.len(),
                released_deliveries = report.released_deliveries,
                "reclaimed abandoned work"
            );
        }
        Ok(report)
    }

    async fn settle(&self, cutoff: Option<DateTime<Utc>>) -> Result<ResumeReport, TaskStoreError> {
        let idle = |updated_at: DateTime<Utc>| cutoff.is_none_or(|limit| updated_at < limit);
        let mut report = ResumeReport {
            released_deliveries: self.release_deliveries(idle).await?,
            ..ResumeReport::default()
        };

        for task in self.store.list_resumable().await? {
            if !idle(task.updated_at()) {
                continue;
            }
            let Some(settled) = self.settle_task(&task).await? else {
                continue;
            };
            tracing::info!(
                task_id = %settled.id(),
                from = %task.status(),
                to = %settled.status(),
                "settled interrupted task"
            );
            match settled.status() {
                TaskStatus::Posted => report.posted.push(settled.id()),
                TaskStatus::Failed => report.failed.push(settled.id()),
                _ => {
                    self.offer_hint(settled.id());
                    report.requeued.push(settled.id());
                }
            }
        }
        Ok(report)
    }

    /// Applies the resume transition; `None` when a live worker moved the
    /// task first.
    async fn settle_task(&self, task: &Task) -> Result<Option<Task>, TaskStoreError> {
        let published_id = recorded_publish(self.store.as_ref(), task, &self.publish_target).await?;
        let now = self.clock.utc();
        let Some(transition) =
            task.resume_transition(self.max_attempts, published_id.as_deref(), now)
        else {
            return Ok(None);
        };
        if transition.to() == TaskStatus::Posted {
            for target in &self.side_effect_targets {
                self.store.ensure_delivery(task.id(), target, now).await?;
            }
        }
        match self.store.apply_transition(&transition).await {
            Ok(settled) => Ok(Some(settled)),
            Err(TaskStoreError::Domain(err)) => {
                tracing::debug!(task_id = %task.id(), error = %err, "task moved during recovery");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn release_deliveries(
        &self,
        idle: impl Fn(DateTime<Utc>) -> bool,
    ) -> Result<usize, TaskStoreError> {
        let sending: Vec<Delivery> = self
            .store
            .list_deliveries_by_status(DeliveryStatus::Sending, RELEASE_BATCH)
            .await?
            .into_iter()
            .filter(|delivery| idle(delivery.updated_at()))
            .collect();
        let count = sending.len();
        for mut delivery in sending {
            delivery.release_interrupted(self.clock.utc());
            self.store.update_delivery(&delivery).await?;
            tracing::debug!(delivery_id = %delivery.id(), target = %delivery.target(), "released delivery");
        }
        Ok(count)
    }

    fn offer_hint(&self, task_id: TaskId) {
        if let Some(hints) = &self.hints
            && hints.try_send(task_id).is_err()
        {
            tracing::debug!(task_id = %task_id, "hint dropped, leaving task to polling");
        }
    }
}

/// External id recorded on the publish delivery when the task row never
/// learned about it.
pub(super) async fn recorded_publish<S>(
    store: &S,
    task: &Task,
    publish_target: &DeliveryTarget,
) -> Result<Option<String>, TaskStoreError>
where
    S: TaskStore + ?Sized,
{
    if task.external_post_id().is_some() {
        return Ok(None);
    }
    let deliveries = store.list_deliveries(task.id()).await?;
    Ok(deliveries
        .into_iter()
        .find(|delivery| {
            delivery.target() == publish_target && delivery.status() == DeliveryStatus::Posted
        })
        .and_then(|delivery| delivery.external_id().map(str::to_owned)))
}
