//! Relay runtime: the single context object that owns the store, clock,
//! collaborators and background tasks of one process.

use super::{
    Collaborators, DispatchMode, Dispatcher, DispatcherSettings, IngestService, PipelineSettings,
    ResumeManager, ResumeReport, StagePipeline, WorkerPool,
};
use crate::task::{
    domain::{DeliveryTarget, TaskId},
    ports::{TaskStore, TaskStoreError},
};
use mockable::Clock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Runtime tuning.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Number of pipeline workers.
    pub worker_count: usize,
    /// Poll or push dispatching.
    pub dispatch_mode: DispatchMode,
    /// Idle wait between empty polls.
    pub poll_interval: Duration,
    /// Capacity of the hint channel.
    pub hint_capacity: usize,
    /// Grace period for workers after shutdown is requested.
    pub shutdown_timeout: Duration,
    /// Idle time after which in-flight work counts as abandoned.
    pub stale_after: Duration,
    /// Interval between abandoned-work sweeps.
    pub sweep_interval: Duration,
    /// Pipeline settings shared by every worker.
    pub pipeline: PipelineSettings,
}

/// Runtime lifecycle errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuntimeError {
    /// [`RelayRuntime::start`] was called twice.
    #[error("relay runtime already started")]
    AlreadyStarted,
}

struct Running {
    dispatcher: JoinHandle<()>,
    pool: WorkerPool,
}

/// Owns everything one relay process needs.
///
/// Construct once, call [`RelayRuntime::resume`], then
/// [`RelayRuntime::start`]; [`RelayRuntime::shutdown`] cancels and joins the
/// background tasks.
pub struct RelayRuntime<S, C>
where
    S: TaskStore + 'static,
    C: Clock + Send + Sync + 'static,
{
    store: Arc<S>,
    clock: Arc<C>,
    pipeline: Arc<StagePipeline<S, C>>,
    settings: RelaySettings,
    side_effect_targets: Vec<DeliveryTarget>,
    shutdown: CancellationToken,
    hint_sender: Option<mpsc::Sender<TaskId>>,
    hint_receiver: Option<mpsc::Receiver<TaskId>>,
    running: Option<Running>,
}

impl<S, C> RelayRuntime<S, C>
where
    S: TaskStore + 'static,
    C: Clock + Send + Sync + 'static,
{
    /// Builds the runtime. Nothing is spawned until [`RelayRuntime::start`].
    #[must_use]
    pub fn new(
        store: Arc<S>,
        clock: Arc<C>,
        collaborators: Collaborators,
        settings: RelaySettings,
    ) -> Self {
        let side_effect_targets = collaborators
            .side_effects
            .iter()
            .map(|effect| effect.target().clone())
            .collect();
        let (hint_sender, hint_receiver) = match settings.dispatch_mode {
            DispatchMode::Push => {
                let (sender, receiver) = mpsc::channel(settings.hint_capacity.max(1));
                (Some(sender), Some(receiver))
            }
            DispatchMode::Poll => (None, None),
        };
        let pipeline = Arc::new(StagePipeline::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            collaborators,
            settings.pipeline.clone(),
        ));
        Self {
            store,
            clock,
            pipeline,
            settings,
            side_effect_targets,
            shutdown: CancellationToken::new(),
            hint_sender,
            hint_receiver,
            running: None,
        }
    }

    /// Returns an ingest service wired to this runtime's hint channel.
    #[must_use]
    pub fn ingest_service(&self) -> IngestService<S, C> {
        IngestService::new(Arc::clone(&self.store), Arc::clone(&self.clock))
            .with_hints(self.hint_sender.clone())
    }

    /// Returns the shared stage pipeline.
    #[must_use]
    pub fn pipeline(&self) -> Arc<StagePipeline<S, C>> {
        Arc::clone(&self.pipeline)
    }

    /// Settles work interrupted by a previous process.
    ///
    /// # Errors
    ///
    /// Returns [`TaskStoreError`] when the store fails.
    pub async fn resume(&self) -> Result<ResumeReport, TaskStoreError> {
        self.resume_manager().resume().await
    }

    fn resume_manager(&self) -> ResumeManager<S, C> {
        let pipeline = &self.settings.pipeline;
        ResumeManager::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            pipeline.policy.max_attempts(),
            pipeline.publish_target.clone(),
        )
        .with_hints(self.hint_sender.clone())
        .with_side_effects(self.side_effect_targets.clone())
    }

    /// Spawns the dispatcher and the worker pool on the current runtime.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::AlreadyStarted`] on a second call.
    pub fn start(&mut self) -> Result<(), RuntimeError> {
        if self.running.is_some() {
            return Err(RuntimeError::AlreadyStarted);
        }
        let worker_count = self.settings.worker_count.max(1);
        let (work_sender, work_receiver) = mpsc::channel(worker_count);
        let dispatcher = Dispatcher::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            DispatcherSettings {
                mode: self.settings.dispatch_mode,
                poll_interval: self.settings.poll_interval,
                max_attempts: self.settings.pipeline.policy.max_attempts(),
                side_effect_targets: self.side_effect_targets.clone(),
                side_effect_batch: worker_count,
            },
            work_sender,
            self.hint_receiver.take(),
        )
        .with_recovery(
            self.resume_manager(),
            self.settings.stale_after,
            self.settings.sweep_interval,
        );
        let dispatcher = tokio::spawn(dispatcher.run(self.shutdown.clone()));
        let pool = WorkerPool::spawn(
            worker_count,
            Arc::clone(&self.pipeline),
            work_receiver,
            self.shutdown.clone(),
        );
        self.running = Some(Running { dispatcher, pool });
        Ok(())
    }

    /// Token cancelled when shutdown begins.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancels background work and waits up to the shutdown timeout.
    ///
    /// Returns `true` when every worker finished in time.
    pub async fn shutdown(&mut self) -> bool {
        self.shutdown.cancel();
        let Some(running) = self.running.take() else {
            return true;
        };
        if let Err(err) = running.dispatcher.await {
            tracing::warn!(error = %err, "dispatcher exited abnormally");
        }
        let clean = running.pool.join(self.settings.shutdown_timeout).await;
        tracing::info!(clean, "relay stopped");
        clean
    }
}
