//! Worker pool that drains the dispatcher channel.

use super::{PipelineError, PipelineOutcome, StagePipeline, WorkItem};
use crate::task::{domain::TaskId, ports::TaskStore};
use mockable::Clock;
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

type InProgress = Arc<StdMutex<HashSet<TaskId>>>;

/// Fixed set of workers sharing one bounded receiver.
pub struct WorkerPool {
    workers: JoinSet<()>,
}

impl WorkerPool {
    /// Spawns `count` workers on the current runtime.
    ///
    /// Workers stop when the channel closes or `shutdown` is cancelled; a
    /// worker running a task finishes its current stage first. A panicking
    /// work item is logged and the worker moves on to the next item; the
    /// abandoned task is left to the dispatcher's sweep.
    #[must_use]
    pub fn spawn<S, C>(
        count: usize,
        pipeline: Arc<StagePipeline<S, C>>,
        receiver: mpsc::Receiver<WorkItem>,
        shutdown: CancellationToken,
    ) -> Self
    where
        S: TaskStore + 'static,
        C: Clock + Send + Sync + 'static,
    {
        let receiver = Arc::new(Mutex::new(receiver));
        let in_progress: InProgress = Arc::default();
        let mut workers = JoinSet::new();
        for index in 0..count {
            workers.spawn(worker_loop(
                index,
                Arc::clone(&pipeline),
                Arc::clone(&receiver),
                Arc::clone(&in_progress),
                shutdown.clone(),
            ));
        }
        tracing::info!(workers = count, "worker pool started");
        Self { workers }
    }

    /// Number of workers still running.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Returns `true` once every worker has exited.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Waits for every worker, aborting the rest after `timeout`.
    ///
    /// Returns `true` when all workers exited on their own.
    pub async fn join(mut self, timeout: Duration) -> bool {
        let drained = tokio::time::timeout(timeout, async {
            while let Some(result) = self.workers.join_next().await {
                if let Err(err) = result {
                    tracing::warn!(error = %err, "worker exited abnormally");
                }
            }
        })
        .await;
        if drained.is_ok() {
            return true;
        }
        tracing::warn!(
            remaining = self.workers.len(),
            "shutdown timeout elapsed, aborting workers"
        );
        self.workers.shutdown().await;
        false
    }
}

async fn worker_loop<S, C>(
    index: usize,
    pipeline: Arc<StagePipeline<S, C>>,
    receiver: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    in_progress: InProgress,
    shutdown: CancellationToken,
) where
    S: TaskStore + 'static,
    C: Clock + Send + Sync + 'static,
{
    loop {
        let item = tokio::select! {
            () = shutdown.cancelled() => break,
            item = next_item(&receiver) => item,
        };
        let Some(work) = item else {
            break;
        };
        // Claimed items are exclusive through the store; only hints can
        // name a task another worker is already running.
        let guard = InProgressGuard::acquire(&in_progress, work.task_id());
        if guard.is_none() && matches!(work, WorkItem::Hint(_)) {
            tracing::debug!(worker = index, task_id = %work.task_id(), "task already in progress");
            continue;
        }
        let task_id = work.task_id();
        // Dropping the set aborts the item when the worker itself is aborted.
        let mut running = JoinSet::new();
        let item_pipeline = Arc::clone(&pipeline);
        let item_shutdown = shutdown.clone();
        running.spawn(async move { handle(&item_pipeline, work, &item_shutdown).await });
        match running.join_next().await {
            Some(Ok(Err(err))) => {
                tracing::warn!(worker = index, task_id = %task_id, error = %err, "work item failed");
            }
            Some(Err(err)) if err.is_panic() => {
                tracing::error!(worker = index, task_id = %task_id, "work item panicked");
            }
            Some(Err(err)) => {
                tracing::warn!(worker = index, task_id = %task_id, error = %err, "work item aborted");
            }
            Some(Ok(Ok(()))) | None => {}
        }
    }
    tracing::debug!(worker = index, "worker stopped");
}

async fn next_item(receiver: &Mutex<mpsc::Receiver<WorkItem>>) -> Option<WorkItem> {
    receiver.lock().await.recv().await
}

async fn handle<S, C>(
    pipeline: &StagePipeline<S, C>,
    work: WorkItem,
    shutdown: &CancellationToken,
) -> Result<(), PipelineError>
where
    S: TaskStore,
    C: Clock + Send + Sync,
{
    let claimed = match work {
        WorkItem::Claimed(claimed) => claimed,
        WorkItem::Hint(task_id) => match pipeline.claim_hinted(task_id).await? {
            Some(claimed) => claimed,
            None => return Ok(()),
        },
        WorkItem::SideEffect(delivery) => return pipeline.run_side_effect(delivery).await,
    };
    let task_id = claimed.task().id();
    match pipeline.run(claimed, shutdown).await? {
        PipelineOutcome::Posted { .. } => {}
        PipelineOutcome::RetryScheduled { at } => {
            tracing::info!(task_id = %task_id, retry_at = %at, "retry scheduled");
        }
        PipelineOutcome::Failed { reason } => {
            tracing::warn!(task_id = %task_id, reason, "task failed terminally");
        }
        PipelineOutcome::Interrupted { status } => {
            tracing::info!(task_id = %task_id, status = %status, "task interrupted");
        }
    }
    Ok(())
}

/// Marks a task as owned by this process until dropped.
struct InProgressGuard {
    set: InProgress,
    task_id: TaskId,
}

impl InProgressGuard {
    fn acquire(set: &InProgress, task_id: TaskId) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id);
        inserted.then(|| Self {
            set: Arc::clone(set),
            task_id,
        })
    }
}

impl Drop for InProgressGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.task_id);
    }
}
