//! In-memory task store for tests and single-process runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::task::{
    domain::{
        ClaimedTask, CorrelationKey, Delivery, DeliveryId, DeliveryStatus, DeliveryTarget,
        StageTransition, Task, TaskId, TaskStatus,
    },
    ports::{TaskStore, TaskStoreError, TaskStoreResult},
};

/// Thread-safe in-memory task store.
///
/// Each operation runs under one lock acquisition, which gives claims the
/// same exclusivity a database transaction would.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskStore {
    state: Arc<RwLock<InMemoryStoreState>>,
}

#[derive(Debug, Default)]
struct InMemoryStoreState {
    tasks: HashMap<TaskId, Task>,
    correlation_index: HashMap<CorrelationKey, TaskId>,
    deliveries: HashMap<DeliveryId, Delivery>,
    delivery_index: HashMap<(DeliveryTarget, TaskId), DeliveryId>,
}

impl InMemoryTaskStore {
    /// Creates an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> TaskStoreResult<RwLockReadGuard<'_, InMemoryStoreState>> {
        self.state
            .read()
            .map_err(|err| TaskStoreError::persistence(std::io::Error::other(err.to_string())))
    }

    fn write(&self) -> TaskStoreResult<RwLockWriteGuard<'_, InMemoryStoreState>> {
        self.state
            .write()
            .map_err(|err| TaskStoreError::persistence(std::io::Error::other(err.to_string())))
    }
}

impl InMemoryStoreState {
    fn claim_task(&mut self, task_id: TaskId, now: DateTime<Utc>) -> Option<ClaimedTask> {
        let task = self.tasks.remove(&task_id)?;
        let claimed = task.claim(now);
        self.tasks.insert(task_id, claimed.task().clone());
        Some(claimed)
    }

    fn claim_delivery(&mut self, delivery_id: DeliveryId, now: DateTime<Utc>) -> Option<Delivery> {
        let delivery = self.deliveries.get_mut(&delivery_id)?;
        delivery.start_attempt(now);
        Some(delivery.clone())
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert_if_absent(&self, task: &Task) -> TaskStoreResult<Option<TaskId>> {
        let mut state = self.write()?;
        if state.correlation_index.contains_key(task.correlation_key())
            || state.tasks.contains_key(&task.id())
        {
            return Ok(None);
        }
        state
            .correlation_index
            .insert(task.correlation_key().clone(), task.id());
        state.tasks.insert(task.id(), task.clone());
        Ok(Some(task.id()))
    }

    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> TaskStoreResult<Option<ClaimedTask>> {
        let mut state = self.write()?;
        let next = state
            .tasks
            .values()
            .filter(|task| task.is_claimable(now, max_attempts))
            .min_by_key(|task| (task.created_at(), task.id()))
            .map(Task::id);
        Ok(next.and_then(|task_id| state.claim_task(task_id, now)))
    }

    async fn claim(
        &self,
        task_id: TaskId,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> TaskStoreResult<Option<ClaimedTask>> {
        let mut state = self.write()?;
        let claimable = state
            .tasks
            .get(&task_id)
            .is_some_and(|task| task.is_claimable(now, max_attempts));
        if !claimable {
            return Ok(None);
        }
        Ok(state.claim_task(task_id, now))
    }

    async fn apply_transition(&self, transition: &StageTransition) -> TaskStoreResult<Task> {
        let mut state = self.write()?;
        let task = state
            .tasks
            .get_mut(&transition.task_id())
            .ok_or(TaskStoreError::NotFound(transition.task_id()))?;
        task.apply(transition)?;
        Ok(task.clone())
    }

    async fn get(&self, task_id: TaskId) -> TaskStoreResult<Option<Task>> {
        let state = self.read()?;
        Ok(state.tasks.get(&task_id).cloned())
    }

    async fn list_resumable(&self) -> TaskStoreResult<Vec<Task>> {
        let state = self.read()?;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|task| task.status().is_in_progress())
            .cloned()
            .collect();
        tasks.sort_by_key(|task| (task.created_at(), task.id()));
        Ok(tasks)
    }

    async fn list_by_status(
        &self,
        status: TaskStatus,
        limit: usize,
    ) -> TaskStoreResult<Vec<Task>> {
        let state = self.read()?;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|task| task.status() == status)
            .cloned()
            .collect();
        tasks.sort_by_key(|task| std::cmp::Reverse((task.updated_at(), task.id())));
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn ensure_delivery(
        &self,
        task_id: TaskId,
        target: &DeliveryTarget,
        now: DateTime<Utc>,
    ) -> TaskStoreResult<Delivery> {
        let mut state = self.write()?;
        if !state.tasks.contains_key(&task_id) {
            return Err(TaskStoreError::NotFound(task_id));
        }
        let key = (target.clone(), task_id);
        if let Some(existing) = state
            .delivery_index
            .get(&key)
            .and_then(|delivery_id| state.deliveries.get(delivery_id))
        {
            return Ok(existing.clone());
        }
        let delivery = Delivery::new(task_id, target.clone(), now);
        state.delivery_index.insert(key, delivery.id());
        state.deliveries.insert(delivery.id(), delivery.clone());
        Ok(delivery)
    }

    async fn claim_delivery(
        &self,
        delivery_id: DeliveryId,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> TaskStoreResult<Option<Delivery>> {
        let mut state = self.write()?;
        let due = state
            .deliveries
            .get(&delivery_id)
            .ok_or(TaskStoreError::DeliveryNotFound(delivery_id))?
            .is_due(now, max_attempts);
        if !due {
            return Ok(None);
        }
        Ok(state.claim_delivery(delivery_id, now))
    }

    async fn claim_due_deliveries(
        &self,
        targets: &[DeliveryTarget],
        now: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> TaskStoreResult<Vec<Delivery>> {
        let mut state = self.write()?;
        let mut due: Vec<(DateTime<Utc>, DeliveryId)> = state
            .deliveries
            .values()
            .filter(|delivery| targets.contains(delivery.target()))
            .filter(|delivery| delivery.is_due(now, max_attempts))
            .filter(|delivery| {
                state
                    .tasks
                    .get(&delivery.task_id())
                    .is_some_and(|task| task.status() == TaskStatus::Posted)
            })
            .map(|delivery| (delivery.created_at(), delivery.id()))
            .collect();
        due.sort_by_key(|(created_at, delivery_id)| (*created_at, delivery_id.into_inner()));
        due.truncate(limit);
        Ok(due
            .into_iter()
            .filter_map(|(_, delivery_id)| state.claim_delivery(delivery_id, now))
            .collect())
    }

    async fn update_delivery(&self, delivery: &Delivery) -> TaskStoreResult<()> {
        let mut state = self.write()?;
        let stored = state
            .deliveries
            .get_mut(&delivery.id())
            .ok_or(TaskStoreError::DeliveryNotFound(delivery.id()))?;
        *stored = delivery.clone();
        Ok(())
    }

    async fn list_deliveries(&self, task_id: TaskId) -> TaskStoreResult<Vec<Delivery>> {
        let state = self.read()?;
        let mut deliveries: Vec<Delivery> = state
            .deliveries
            .values()
            .filter(|delivery| delivery.task_id() == task_id)
            .cloned()
            .collect();
        deliveries.sort_by(|a, b| a.target().cmp(b.target()));
        Ok(deliveries)
    }

    async fn list_deliveries_by_status(
        &self,
        status: DeliveryStatus,
        limit: usize,
    ) -> TaskStoreResult<Vec<Delivery>> {
        let state = self.read()?;
        let mut deliveries: Vec<Delivery> = state
            .deliveries
            .values()
            .filter(|delivery| delivery.status() == status)
            .cloned()
            .collect();
        deliveries.sort_by_key(|delivery| (delivery.created_at(), delivery.id().into_inner()));
        deliveries.truncate(limit);
        Ok(deliveries)
    }
}
