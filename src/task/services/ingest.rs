//! Ingestion of normalized events into durable tasks.

use crate::task::{
    domain::{CorrelationKey, NormalizedEvent, Task, TaskDomainError, TaskId},
    ports::{TaskStore, TaskStoreError},
};
use mockable::Clock;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Result of ingesting one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new task was stored.
    Inserted(TaskId),
    /// A task with the same correlation key already exists.
    Duplicate(CorrelationKey),
}

/// Totals for a batch of events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    /// Identifiers of newly stored tasks.
    pub inserted: Vec<TaskId>,
    /// Events that matched an existing task.
    pub duplicates: usize,
    /// Events dropped because they failed validation.
    pub rejected: usize,
}

/// Service-level errors for ingestion.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The event failed domain validation.
    #[error(transparent)]
    Domain(#[from] TaskDomainError),
    /// The store rejected the insert.
    #[error(transparent)]
    Store(#[from] TaskStoreError),
}

/// Records inbound events as queued tasks, deduplicating by correlation key.
///
/// When a hint sender is attached, new task identifiers are offered to the
/// dispatcher; a full channel drops the hint and polling picks the task up.
pub struct IngestService<S, C>
where
    S: TaskStore,
    C: Clock + Send + Sync,
{
    store: Arc<S>,
    clock: Arc<C>,
    hints: Option<mpsc::Sender<TaskId>>,
}

impl<S, C> Clone for IngestService<S, C>
where
    S: TaskStore,
    C: Clock + Send + Sync,
{
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            hints: self.hints.clone(),
        }
    }
}

impl<S, C> IngestService<S, C>
where
    S: TaskStore,
    C: Clock + Send + Sync,
{
    /// Creates an ingest service without dispatcher hints.
    #[must_use]
    pub const fn new(store: Arc<S>, clock: Arc<C>) -> Self {
        Self {
            store,
            clock,
            hints: None,
        }
    }

    /// Attaches a dispatcher hint channel.
    #[must_use]
    pub fn with_hints(mut self, hints: Option<mpsc::Sender<TaskId>>) -> Self {
        self.hints = hints;
        self
    }

    /// Ingests one event.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Domain`] for an invalid event and
    /// [`IngestError::Store`] when the insert fails.
    pub async fn ingest(&self, event: NormalizedEvent) -> Result<IngestOutcome, IngestError> {
        let new_task = event.into_new_task()?;
        let correlation_key = new_task.correlation_key().clone();
        let task = Task::new(new_task, &*self.clock);

        match self.store.insert_if_absent(&task).await? {
            Some(task_id) => {
                tracing::info!(
                    task_id = %task_id,
                    correlation_key = %correlation_key,
                    kind = %task.kind(),
                    "task queued"
                );
                self.offer_hint(task_id);
                Ok(IngestOutcome::Inserted(task_id))
            }
            None => {
                tracing::debug!(correlation_key = %correlation_key, "duplicate event ignored");
                Ok(IngestOutcome::Duplicate(correlation_key))
            }
        }
    }

    /// Ingests a batch, skipping events that fail validation.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Store`] on the first store failure.
    pub async fn ingest_all(
        &self,
        events: Vec<NormalizedEvent>,
    ) -> Result<IngestSummary, IngestError> {
        let mut summary = IngestSummary::default();
        for event in events {
            match self.ingest(event).await {
                Ok(IngestOutcome::Inserted(task_id)) => summary.inserted.push(task_id),
                Ok(IngestOutcome::Duplicate(_)) => summary.duplicates += 1,
                Err(IngestError::Domain(err)) => {
                    tracing::warn!(error = %err, "event rejected");
                    summary.rejected += 1;
                }
                Err(err @ IngestError::Store(_)) => return Err(err),
            }
        }
        Ok(summary)
    }

    fn offer_hint(&self, task_id: TaskId) {
        let Some(hints) = &self.hints else {
            return;
        };
        match hints.try_send(task_id) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::debug!(task_id = %task_id, "hint channel full, leaving task to polling");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(task_id = %task_id, "dispatcher not listening for hints");
            }
        }
    }
}
