//! Store port for task persistence, claiming and delivery bookkeeping.

use crate::task::domain::{
    ClaimedTask, Delivery, DeliveryId, DeliveryStatus, DeliveryTarget, RetryPolicy, Stage,
    StageOutcome, StageTransition, Task, TaskDomainError, TaskId, TaskStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

/// Result type for task store operations.
pub type TaskStoreResult<T> = Result<T, TaskStoreError>;

/// Durable task and delivery storage.
///
/// Every method is a single short transaction. Implementations must make
/// [`TaskStore::claim_next`] and [`TaskStore::claim`] exclusive so that
/// concurrent callers never receive the same task.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Inserts a task unless its correlation key is already stored.
    ///
    /// Returns `None` for a duplicate; that is not an error.
    async fn insert_if_absent(&self, task: &Task) -> TaskStoreResult<Option<TaskId>>;

    /// Claims the earliest-created claimable task.
    ///
    /// A task is claimable when its status is `queued` or `failed`, its
    /// attempt count is below `max_attempts` and `next_attempt_at` is unset
    /// or not after `now`. The claim sets `claimed` and counts the attempt.
    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> TaskStoreResult<Option<ClaimedTask>>;

    /// Claims one task by identifier using the same predicate as
    /// [`TaskStore::claim_next`].
    async fn claim(
        &self,
        task_id: TaskId,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> TaskStoreResult<Option<ClaimedTask>>;

    /// Atomically applies a resolved transition and returns the stored task.
    ///
    /// # Errors
    ///
    /// Returns [`TaskStoreError::NotFound`] for an unknown task and
    /// [`TaskStoreError::Domain`] when the stored row no longer satisfies the
    /// transition.
    async fn apply_transition(&self, transition: &StageTransition) -> TaskStoreResult<Task>;

    /// Records what a stage reported for `task`.
    ///
    /// The outcome is resolved against the caller's view of the task, then
    /// applied atomically; a stale view fails with
    /// [`TaskDomainError::StaleTransition`].
    async fn record_stage_result(
        &self,
        task: &Task,
        stage: Stage,
        outcome: &StageOutcome,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> TaskStoreResult<Task> {
        match task.resolve(stage, outcome, policy, now)? {
            Some(transition) => self.apply_transition(&transition).await,
            None => Ok(task.clone()),
        }
    }

    /// Finds a task by identifier.
    async fn get(&self, task_id: TaskId) -> TaskStoreResult<Option<Task>>;

    /// Returns tasks left in an in-progress status.
    async fn list_resumable(&self) -> TaskStoreResult<Vec<Task>>;

    /// Returns up to `limit` tasks with the given status, newest update
    /// first.
    async fn list_by_status(&self, status: TaskStatus, limit: usize)
    -> TaskStoreResult<Vec<Task>>;

    /// Returns the delivery for `(target, task_id)`, creating a pending one
    /// if none exists.
    async fn ensure_delivery(
        &self,
        task_id: TaskId,
        target: &DeliveryTarget,
        now: DateTime<Utc>,
    ) -> TaskStoreResult<Delivery>;

    /// Claims one delivery when it is due, marking it `sending`.
    async fn claim_delivery(
        &self,
        delivery_id: DeliveryId,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> TaskStoreResult<Option<Delivery>>;

    /// Claims up to `limit` due deliveries for the given targets.
    ///
    /// Only deliveries of posted tasks are claimed.
    async fn claim_due_deliveries(
        &self,
        targets: &[DeliveryTarget],
        now: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> TaskStoreResult<Vec<Delivery>>;

    /// Persists a delivery's mutable fields.
    ///
    /// # Errors
    ///
    /// Returns [`TaskStoreError::DeliveryNotFound`] for an unknown delivery.
    async fn update_delivery(&self, delivery: &Delivery) -> TaskStoreResult<()>;

    /// Returns every delivery recorded for a task.
    async fn list_deliveries(&self, task_id: TaskId) -> TaskStoreResult<Vec<Delivery>>;

    /// Returns up to `limit` deliveries with the given status.
    async fn list_deliveries_by_status(
        &self,
        status: DeliveryStatus,
        limit: usize,
    ) -> TaskStoreResult<Vec<Delivery>>;
}

/// Errors returned by task store implementations.
#[derive(Debug, Clone, Error)]
pub enum TaskStoreError {
    /// The task was not found.
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// The delivery was not found.
    #[error("delivery not found: {0}")]
    DeliveryNotFound(DeliveryId),

    /// The stored row rejected a domain rule.
    #[error(transparent)]
    Domain(#[from] TaskDomainError),

    /// Persistence-layer failure.
    #[error("persistence error: {0}")]
    Persistence(Arc<dyn std::error::Error + Send + Sync>),
}

impl TaskStoreError {
    /// Wraps a persistence error.
    pub fn persistence(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Persistence(Arc::new(err))
    }

    /// Returns `true` when retrying the same call later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }
}
