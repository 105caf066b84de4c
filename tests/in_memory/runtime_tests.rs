//! Relay runtime: dispatching, workers, startup recovery and shutdown.

use super::helpers::{
    FlakyDownloader, LocalRig, PanickingDownloader, RecordingSideEffect, clock, photo_event,
    pipeline_settings, publish_target, store, text_event,
};
use chrono::TimeDelta;
use eyre::OptionExt;
use mediarelay::clock::ManualClock;
use mediarelay::task::{
    adapters::memory::InMemoryTaskStore,
    domain::{DeliveryStatus, DeliveryTarget, RetryPolicy, Stage, StageOutcome, TaskId, TaskStatus},
    ports::{SideEffect, TaskStore},
    services::{
        Collaborators, DispatchMode, IngestOutcome, IngestService, RelayRuntime, RelaySettings,
        ResumeManager, RuntimeError, StagePipeline, WorkItem, WorkerPool,
    },
};
use mockable::{Clock, DefaultClock};
use rstest::rstest;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type LocalRuntime = RelayRuntime<InMemoryTaskStore, DefaultClock>;

fn settings(mode: DispatchMode) -> RelaySettings {
    RelaySettings {
        worker_count: 2,
        dispatch_mode: mode,
        poll_interval: Duration::from_millis(20),
        hint_capacity: 16,
        shutdown_timeout: Duration::from_secs(5),
        stale_after: Duration::from_secs(1_800),
        sweep_interval: Duration::from_millis(20),
        pipeline: pipeline_settings(),
    }
}

fn runtime(
    store: &Arc<InMemoryTaskStore>,
    collaborators: Collaborators,
    mode: DispatchMode,
) -> LocalRuntime {
    RelayRuntime::new(
        Arc::clone(store),
        Arc::new(DefaultClock),
        collaborators,
        settings(mode),
    )
}

async fn wait_for_status(
    store: &InMemoryTaskStore,
    task_id: TaskId,
    status: TaskStatus,
) -> eyre::Result<()> {
    let reached = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(Some(task)) = store.get(task_id).await
                && task.status() == status
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    reached.map_err(|_| eyre::eyre!("task {task_id} never reached {status}"))
}

#[rstest]
#[case::poll(DispatchMode::Poll)]
#[case::push(DispatchMode::Push)]
#[tokio::test(flavor = "multi_thread")]
async fn ingested_events_are_relayed(
    store: Arc<InMemoryTaskStore>,
    #[case] mode: DispatchMode,
) -> eyre::Result<()> {
    let rig = LocalRig::new()?;
    rig.add_inbox_file("a.jpg", b"jpeg-bytes")?;
    let mut relay = runtime(&store, rig.collaborators(), mode);
    relay.start()?;

    let ingest = relay.ingest_service();
    let mut task_ids = Vec::new();
    for event in [
        photo_event("evt-1", "a.jpg", Some("sunset")),
        text_event("evt-2", "good morning"),
        text_event("evt-3", "good night"),
    ] {
        if let IngestOutcome::Inserted(task_id) = ingest.ingest(event).await? {
            task_ids.push(task_id);
        }
    }
    for task_id in &task_ids {
        wait_for_status(&store, *task_id, TaskStatus::Posted).await?;
    }

    assert!(relay.shutdown().await);
    assert_eq!(task_ids.len(), 3);
    assert_eq!(rig.outbox_entries()?.len(), 4);
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn dispatcher_retries_failed_side_effects(
    store: Arc<InMemoryTaskStore>,
) -> eyre::Result<()> {
    let rig = LocalRig::new()?;
    let notifier = Arc::new(RecordingSideEffect::new("notify", 1));
    let side_effects: Vec<Arc<dyn SideEffect>> = vec![notifier.clone()];
    let collaborators = rig.collaborators_with(rig.downloader(), side_effects);
    let mut settings = settings(DispatchMode::Poll);
    settings.pipeline.policy = RetryPolicy::from_secs(&[1], 3)?;
    let mut relay = RelayRuntime::new(
        Arc::clone(&store),
        Arc::new(DefaultClock),
        collaborators,
        settings,
    );
    relay.start()?;

    let IngestOutcome::Inserted(task_id) = relay
        .ingest_service()
        .ingest(text_event("evt-9", "hello"))
        .await?
    else {
        eyre::bail!("event should be inserted");
    };
    wait_for_status(&store, task_id, TaskStatus::Posted).await?;

    let delivered = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let deliveries = store.list_deliveries(task_id).await.unwrap_or_default();
            if deliveries
                .iter()
                .any(|delivery| {
                    delivery.target().as_str() == "notify"
                        && delivery.status() == DeliveryStatus::Posted
                })
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;

    assert!(relay.shutdown().await);
    delivered.map_err(|_| eyre::eyre!("notify delivery was never retried"))?;
    assert_eq!(notifier.runs(), 2);
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn interrupted_work_is_resumed_on_startup(
    store: Arc<InMemoryTaskStore>,
) -> eyre::Result<()> {
    let rig = LocalRig::new()?;
    rig.add_inbox_file("c.jpg", b"jpeg-bytes")?;
    let clock = Arc::new(DefaultClock);
    let policy = pipeline_settings().policy;
    let IngestOutcome::Inserted(task_id) = IngestService::new(Arc::clone(&store), Arc::clone(&clock))
        .ingest(photo_event("evt-5", "c.jpg", None))
        .await?
    else {
        eyre::bail!("event should be inserted");
    };
    let claimed = store
        .claim_next(clock.utc(), policy.max_attempts())
        .await?
        .ok_or_eyre("task should be claimable")?;
    store
        .record_stage_result(
            claimed.task(),
            Stage::Download,
            &StageOutcome::Started,
            &policy,
            clock.utc(),
        )
        .await?;
    let delivery = store
        .ensure_delivery(task_id, &publish_target(), clock.utc())
        .await?;
    store
        .claim_delivery(delivery.id(), clock.utc(), policy.max_attempts())
        .await?
        .ok_or_eyre("publish delivery should be claimable")?;

    let mut relay = runtime(&store, rig.collaborators(), DispatchMode::Push);
    let report = relay.resume().await?;
    assert_eq!(report.requeued, vec![task_id]);
    assert_eq!(report.released_deliveries, 1);
    assert_eq!(
        store.get(task_id).await?.map(|task| task.status()),
        Some(TaskStatus::Queued)
    );

    relay.start()?;
    wait_for_status(&store, task_id, TaskStatus::Posted).await?;
    assert!(relay.shutdown().await);

    let posted = store.get(task_id).await?.ok_or_eyre("task should exist")?;
    assert_eq!(posted.attempts(), 2);
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn runtime_starts_once(store: Arc<InMemoryTaskStore>) -> eyre::Result<()> {
    let rig = LocalRig::new()?;
    let mut relay = runtime(&store, rig.collaborators(), DispatchMode::Poll);
    relay.start()?;
    assert_eq!(relay.start(), Err(RuntimeError::AlreadyStarted));
    assert!(relay.shutdown().await);
    assert!(relay.shutdown_token().is_cancelled());
    Ok(())
}

async fn ingest_one<C>(
    store: &Arc<InMemoryTaskStore>,
    clock: &Arc<C>,
    event: mediarelay::task::domain::NormalizedEvent,
) -> eyre::Result<TaskId>
where
    C: Clock + Send + Sync,
{
    match IngestService::new(Arc::clone(store), Arc::clone(clock))
        .ingest(event)
        .await?
    {
        IngestOutcome::Inserted(task_id) => Ok(task_id),
        IngestOutcome::Duplicate(key) => Err(eyre::eyre!("unexpected duplicate {key}")),
    }
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn duplicate_hints_run_the_task_once(store: Arc<InMemoryTaskStore>) -> eyre::Result<()> {
    let rig = LocalRig::new()?;
    rig.add_inbox_file("d.jpg", b"jpeg-bytes")?;
    let downloader = Arc::new(FlakyDownloader::new(rig.downloader(), 0));
    let clock = Arc::new(DefaultClock);
    let pipeline = Arc::new(StagePipeline::new(
        Arc::clone(&store),
        Arc::clone(&clock),
        rig.collaborators_with(downloader.clone(), Vec::new()),
        pipeline_settings(),
    ));
    let task_id = ingest_one(&store, &clock, photo_event("evt-40", "d.jpg", None)).await?;

    let (sender, receiver) = mpsc::channel(4);
    let pool = WorkerPool::spawn(2, pipeline, receiver, CancellationToken::new());
    for _ in 0..3 {
        sender.send(WorkItem::Hint(task_id)).await?;
    }
    drop(sender);
    assert!(pool.join(Duration::from_secs(10)).await);

    let task = store.get(task_id).await?.ok_or_eyre("task should exist")?;
    assert_eq!(task.status(), TaskStatus::Posted);
    assert_eq!(task.attempts(), 1);
    assert_eq!(downloader.calls(), 1);
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn panicking_item_does_not_stop_its_worker(
    store: Arc<InMemoryTaskStore>,
) -> eyre::Result<()> {
    let rig = LocalRig::new()?;
    let downloader = Arc::new(PanickingDownloader::new(rig.downloader(), "boom.jpg"));
    let collaborators = rig.collaborators_with(downloader, Vec::new());
    let mut settings = settings(DispatchMode::Poll);
    settings.worker_count = 1;
    let clock = Arc::new(DefaultClock);
    let mut relay = RelayRuntime::new(
        Arc::clone(&store),
        Arc::clone(&clock),
        collaborators,
        settings,
    );
    relay.start()?;

    let crashed = ingest_one(&store, &clock, photo_event("evt-41", "boom.jpg", None)).await?;
    wait_for_status(&store, crashed, TaskStatus::Downloading).await?;
    let survivor = ingest_one(&store, &clock, text_event("evt-42", "still here")).await?;
    wait_for_status(&store, survivor, TaskStatus::Posted).await?;

    assert!(relay.shutdown().await);
    assert_eq!(
        store.get(crashed).await?.map(|task| task.status()),
        Some(TaskStatus::Downloading)
    );
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn sweep_reclaims_a_stranded_claim(
    store: Arc<InMemoryTaskStore>,
    clock: Arc<ManualClock>,
) -> eyre::Result<()> {
    let rig = LocalRig::new()?;
    let task_id = ingest_one(&store, &clock, text_event("evt-43", "stranded")).await?;
    store
        .claim_next(clock.utc(), pipeline_settings().policy.max_attempts())
        .await?
        .ok_or_eyre("task should be claimable")?;
    let mut relay = RelayRuntime::new(
        Arc::clone(&store),
        Arc::clone(&clock),
        rig.collaborators(),
        settings(DispatchMode::Poll),
    );
    relay.start()?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        store.get(task_id).await?.map(|task| task.status()),
        Some(TaskStatus::Claimed)
    );

    clock.advance(TimeDelta::minutes(31));
    wait_for_status(&store, task_id, TaskStatus::Posted).await?;
    assert!(relay.shutdown().await);
    assert_eq!(
        store.get(task_id).await?.map(|task| task.attempts()),
        Some(2)
    );
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn recorded_publish_is_settled_with_side_effect_rows(
    store: Arc<InMemoryTaskStore>,
    clock: Arc<ManualClock>,
) -> eyre::Result<()> {
    let policy = pipeline_settings().policy;
    let task_id = ingest_one(&store, &clock, text_event("evt-44", "posted")).await?;
    let claimed = store
        .claim_next(clock.utc(), policy.max_attempts())
        .await?
        .ok_or_eyre("task should be claimable")?;
    store
        .record_stage_result(
            claimed.task(),
            Stage::Publish,
            &StageOutcome::Started,
            &policy,
            clock.utc(),
        )
        .await?;
    let delivery = store
        .ensure_delivery(task_id, &publish_target(), clock.utc())
        .await?;
    let mut publish = store
        .claim_delivery(delivery.id(), clock.utc(), policy.max_attempts())
        .await?
        .ok_or_eyre("publish delivery should be claimable")?;
    publish.mark_posted(Some("post-44".to_owned()), clock.utc());
    store.update_delivery(&publish).await?;

    let notify = DeliveryTarget::new("notify")?;
    let report = ResumeManager::new(
        Arc::clone(&store),
        Arc::clone(&clock),
        policy.max_attempts(),
        publish_target(),
    )
    .with_side_effects(vec![notify.clone()])
    .resume()
    .await?;

    assert_eq!(report.posted, vec![task_id]);
    let task = store.get(task_id).await?.ok_or_eyre("task should exist")?;
    assert_eq!(task.status(), TaskStatus::Posted);
    assert_eq!(task.external_post_id(), Some("post-44"));
    let due = store
        .claim_due_deliveries(&[notify.clone()], clock.utc(), policy.max_attempts(), 10)
        .await?;
    assert_eq!(due.len(), 1);
    assert!(due.iter().all(|pending| pending.target() == &notify));
    Ok(())
}
