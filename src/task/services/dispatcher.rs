//! Dispatcher: hands claimed tasks and due side-effect deliveries to workers.

use super::ResumeManager;
use crate::task::{
    domain::{ClaimedTask, Delivery, DeliveryTarget, TaskId},
    ports::{TaskStore, TaskStoreError},
};
use chrono::TimeDelta;
use mockable::Clock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How the dispatcher learns about new work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Poll the store on a fixed interval.
    #[default]
    Poll,
    /// Poll, and also forward task hints as soon as they arrive.
    Push,
}

/// Unit of work sent to the worker pool.
#[derive(Debug, Clone)]
pub enum WorkItem {
    /// A task already claimed by the dispatcher.
    Claimed(ClaimedTask),
    /// A task identifier the worker must claim itself.
    Hint(TaskId),
    /// A side-effect delivery already claimed by the dispatcher.
    SideEffect(Delivery),
}

impl WorkItem {
    /// Returns the task this item concerns.
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Claimed(claimed) => claimed.task().id(),
            Self::Hint(task_id) => *task_id,
            Self::SideEffect(delivery) => delivery.task_id(),
        }
    }
}

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Poll or push.
    pub mode: DispatchMode,
    /// Idle wait between empty polls.
    pub poll_interval: Duration,
    /// Attempt ceiling used by claims.
    pub max_attempts: u32,
    /// Side-effect targets whose failed deliveries are retried.
    pub side_effect_targets: Vec<DeliveryTarget>,
    /// Upper bound on deliveries claimed per tick.
    pub side_effect_batch: usize,
}

/// Periodic reclaim of work nobody has touched for a lease period.
struct Recovery<S, C>
where
    S: TaskStore,
    C: Clock + Send + Sync,
{
    manager: ResumeManager<S, C>,
    stale_after: Duration,
    interval: Duration,
    next_sweep: Instant,
}

/// Feeds the worker channel from the store.
///
/// The dispatcher is the only sender on the worker channel, so a reserved
/// slot is always available when a claim succeeds and no claimed task is
/// left stranded in the channel's backlog.
pub struct Dispatcher<S, C>
where
    S: TaskStore,
    C: Clock + Send + Sync,
{
    store: Arc<S>,
    clock: Arc<C>,
    settings: DispatcherSettings,
    work: mpsc::Sender<WorkItem>,
    hints: Option<mpsc::Receiver<TaskId>>,
    recovery: Option<Recovery<S, C>>,
}

impl<S, C> Dispatcher<S, C>
where
    S: TaskStore,
    C: Clock + Send + Sync,
{
    /// Creates a dispatcher.
    ///
    /// `hints` is only consulted in [`DispatchMode::Push`].
    #[must_use]
    pub const fn new(
        store: Arc<S>,
        clock: Arc<C>,
        settings: DispatcherSettings,
        work: mpsc::Sender<WorkItem>,
        hints: Option<mpsc::Receiver<TaskId>>,
    ) -> Self {
        Self {
            store,
            clock,
            settings,
            work,
            hints,
            recovery: None,
        }
    }

    /// Sweeps every `interval` for tasks and deliveries left in flight
    /// longer than `stale_after`, settling them through `manager`.
    #[must_use]
    pub fn with_recovery(
        mut self,
        manager: ResumeManager<S, C>,
        stale_after: Duration,
        interval: Duration,
    ) -> Self {
        self.recovery = Some(Recovery {
            manager,
            stale_after,
            interval,
            next_sweep: Instant::now() + interval,
        });
        self
    }

    /// Runs until `shutdown` is cancelled or the worker channel closes.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(mode = ?self.settings.mode, "dispatcher started");
        let mut hints = match self.settings.mode {
            DispatchMode::Push => self.hints.take(),
            DispatchMode::Poll => None,
        };

        while !shutdown.is_cancelled() {
            self.sweep().await;
            match self.tick(&shutdown).await {
                Ok(Tick::Dispatched) => continue,
                Ok(Tick::Idle) => {}
                Ok(Tick::Closed) => break,
                Err(err) => {
                    tracing::warn!(error = %err, transient = err.is_transient(), "dispatch failed");
                }
            }
            if !self.idle(&shutdown, &mut hints).await {
                break;
            }
        }
        tracing::info!("dispatcher stopped");
    }

    async fn sweep(&mut self) {
        let now = self.clock.utc();
        let Some(recovery) = self.recovery.as_mut() else {
            return;
        };
        if Instant::now() < recovery.next_sweep {
            return;
        }
        recovery.next_sweep = Instant::now() + recovery.interval;
        let Some(cutoff) = TimeDelta::from_std(recovery.stale_after)
            .ok()
            .and_then(|lease| now.checked_sub_signed(lease))
        else {
            return;
        };
        if let Err(err) = recovery.manager.reclaim_stale(cutoff).await {
            tracing::warn!(error = %err, "abandoned work sweep failed");
        }
    }

    /// Claims due deliveries, then at most one task.
    async fn tick(&self, shutdown: &CancellationToken) -> Result<Tick, TaskStoreError> {
        let deliveries = self.dispatch_deliveries().await?;

        let permit = tokio::select! {
            () = shutdown.cancelled() => return Ok(Tick::Closed),
            permit = self.work.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => return Ok(Tick::Closed),
            },
        };
        let claimed = self
            .store
            .claim_next(self.clock.utc(), self.settings.max_attempts)
            .await?;
        match claimed {
            Some(task) => {
                tracing::debug!(task_id = %task.task().id(), attempt = task.attempt(), "task dispatched");
                permit.send(WorkItem::Claimed(task));
                Ok(Tick::Dispatched)
            }
            None if deliveries > 0 => Ok(Tick::Dispatched),
            None => Ok(Tick::Idle),
        }
    }

    async fn dispatch_deliveries(&self) -> Result<usize, TaskStoreError> {
        let limit = self.settings.side_effect_batch.min(self.work.capacity());
        if self.settings.side_effect_targets.is_empty() || limit == 0 {
            return Ok(0);
        }
        let due = self
            .store
            .claim_due_deliveries(
                &self.settings.side_effect_targets,
                self.clock.utc(),
                self.settings.max_attempts,
                limit,
            )
            .await?;
        let count = due.len();
        for delivery in due {
            if self.work.send(WorkItem::SideEffect(delivery)).await.is_err() {
                break;
            }
        }
        Ok(count)
    }

    /// Waits for the poll interval, a hint or shutdown.
    ///
    /// Returns `false` when the dispatcher should stop.
    async fn idle(
        &self,
        shutdown: &CancellationToken,
        hints: &mut Option<mpsc::Receiver<TaskId>>,
    ) -> bool {
        let sleep = tokio::time::sleep(self.settings.poll_interval);
        let Some(receiver) = hints.as_mut() else {
            return tokio::select! {
                () = shutdown.cancelled() => false,
                () = sleep => true,
            };
        };
        let hint = tokio::select! {
            () = shutdown.cancelled() => return false,
            () = sleep => return true,
            hint = receiver.recv() => hint,
        };
        match hint {
            Some(task_id) => self.forward_hint(task_id).await,
            None => {
                tracing::debug!("hint channel closed, polling only");
                *hints = None;
                true
            }
        }
    }

    async fn forward_hint(&self, task_id: TaskId) -> bool {
        tracing::debug!(task_id = %task_id, "forwarding hint");
        self.work.send(WorkItem::Hint(task_id)).await.is_ok()
    }
}

enum Tick {
    Dispatched,
    Idle,
    Closed,
}
