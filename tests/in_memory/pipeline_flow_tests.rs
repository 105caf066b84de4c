//! Stage pipeline runs over the directory-backed adapters.

use super::helpers::{
    FlakyStore, LocalRig, RecordingSideEffect, clock, photo_event, pipeline_settings,
    publish_target, start, store, text_event,
};
use chrono::TimeDelta;
use eyre::OptionExt;
use mediarelay::clock::ManualClock;
use mediarelay::task::{
    adapters::memory::InMemoryTaskStore,
    domain::{DeliveryStatus, DeliveryTarget, TaskId, TaskStatus},
    ports::{SideEffect, TaskStore},
    services::{
        IngestOutcome, IngestService, PipelineError, PipelineOutcome, ResumeManager, StagePipeline,
    },
};
use mockable::Clock;
use rstest::rstest;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

type LocalPipeline = StagePipeline<InMemoryTaskStore, ManualClock>;

async fn ingest_one(
    store: &Arc<InMemoryTaskStore>,
    clock: &Arc<ManualClock>,
    event: mediarelay::task::domain::NormalizedEvent,
) -> eyre::Result<TaskId> {
    match IngestService::new(Arc::clone(store), Arc::clone(clock))
        .ingest(event)
        .await?
    {
        IngestOutcome::Inserted(task_id) => Ok(task_id),
        IngestOutcome::Duplicate(key) => Err(eyre::eyre!("unexpected duplicate {key}")),
    }
}

async fn claim_and_run(
    pipeline: &LocalPipeline,
    store: &InMemoryTaskStore,
    clock: &ManualClock,
) -> eyre::Result<PipelineOutcome> {
    let claimed = store
        .claim_next(clock.utc(), pipeline.settings().policy.max_attempts())
        .await?
        .ok_or_eyre("a task should be claimable")?;
    Ok(pipeline.run(claimed, &CancellationToken::new()).await?)
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn photo_is_relayed_to_outbox_with_caption(
    store: Arc<InMemoryTaskStore>,
    clock: Arc<ManualClock>,
) -> eyre::Result<()> {
    let rig = LocalRig::new()?;
    rig.add_inbox_file("a.jpg", b"jpeg-bytes")?;
    let pipeline = StagePipeline::new(
        Arc::clone(&store),
        Arc::clone(&clock),
        rig.collaborators(),
        pipeline_settings(),
    );
    let task_id = ingest_one(&store, &clock, photo_event("evt-1", "a.jpg", Some("sunset"))).await?;

    let PipelineOutcome::Posted { external_post_id } =
        claim_and_run(&pipeline, &store, &clock).await?
    else {
        eyre::bail!("task should be posted");
    };

    assert_eq!(
        rig.outbox_entries()?,
        vec![format!("{external_post_id}.jpg"), format!("{external_post_id}.txt")]
    );
    assert_eq!(rig.read_outbox(&format!("{external_post_id}.jpg"))?, b"jpeg-bytes");
    assert_eq!(rig.read_outbox(&format!("{external_post_id}.txt"))?, b"sunset");

    let task = store.get(task_id).await?.ok_or_eyre("task should exist")?;
    assert_eq!(task.status(), TaskStatus::Posted);
    assert_eq!(task.external_post_id(), Some(external_post_id.as_str()));
    let src_path = task.src_path().ok_or_eyre("source path recorded")?;
    let prepared_path = task.prepared_path().ok_or_eyre("prepared path recorded")?;
    assert!(src_path.is_relative());
    assert!(src_path.starts_with("original"));
    assert!(prepared_path.starts_with("prepared"));
    assert_eq!(rig.read_stored(prepared_path)?, b"jpeg-bytes");

    let deliveries = store.list_deliveries(task_id).await?;
    let publish = deliveries
        .iter()
        .find(|delivery| delivery.target() == &publish_target())
        .ok_or_eyre("publish delivery recorded")?;
    assert_eq!(publish.status(), DeliveryStatus::Posted);
    assert_eq!(publish.external_id(), Some(external_post_id.as_str()));
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn text_is_relayed_without_downloading(
    store: Arc<InMemoryTaskStore>,
    clock: Arc<ManualClock>,
) -> eyre::Result<()> {
    let rig = LocalRig::new()?;
    let pipeline = StagePipeline::new(
        Arc::clone(&store),
        Arc::clone(&clock),
        rig.collaborators(),
        pipeline_settings(),
    );
    ingest_one(&store, &clock, text_event("evt-7", "good morning")).await?;

    let PipelineOutcome::Posted { external_post_id } =
        claim_and_run(&pipeline, &store, &clock).await?
    else {
        eyre::bail!("text task should be posted");
    };

    assert_eq!(rig.outbox_entries()?, vec![format!("{external_post_id}.txt")]);
    assert_eq!(
        rig.read_outbox(&format!("{external_post_id}.txt"))?,
        b"good morning"
    );
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn missing_inbox_file_fails_permanently(
    store: Arc<InMemoryTaskStore>,
    clock: Arc<ManualClock>,
) -> eyre::Result<()> {
    let rig = LocalRig::new()?;
    let pipeline = StagePipeline::new(
        Arc::clone(&store),
        Arc::clone(&clock),
        rig.collaborators(),
        pipeline_settings(),
    );
    let task_id = ingest_one(&store, &clock, photo_event("evt-3", "gone.jpg", None)).await?;

    let outcome = claim_and_run(&pipeline, &store, &clock).await?;

    assert!(matches!(outcome, PipelineOutcome::Failed { .. }));
    let task = store.get(task_id).await?.ok_or_eyre("task should exist")?;
    assert!(task.is_terminal(pipeline.settings().policy.max_attempts()));
    assert!(rig.outbox_entries()?.is_empty());
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn failed_side_effect_is_retried_on_its_own_delivery(
    store: Arc<InMemoryTaskStore>,
    clock: Arc<ManualClock>,
) -> eyre::Result<()> {
    let rig = LocalRig::new()?;
    rig.add_inbox_file("b.png", b"png-bytes")?;
    let notifier = Arc::new(RecordingSideEffect::new("notify", 1));
    let side_effects: Vec<Arc<dyn SideEffect>> = vec![notifier.clone()];
    let pipeline = StagePipeline::new(
        Arc::clone(&store),
        Arc::clone(&clock),
        rig.collaborators_with(rig.downloader(), side_effects),
        pipeline_settings(),
    );
    let task_id = ingest_one(&store, &clock, photo_event("evt-4", "b.png", None)).await?;

    let outcome = claim_and_run(&pipeline, &store, &clock).await?;
    assert!(matches!(outcome, PipelineOutcome::Posted { .. }));

    let notify = DeliveryTarget::new("notify")?;
    let max = pipeline.settings().policy.max_attempts();
    let pending = store.list_deliveries(task_id).await?;
    let failed = pending
        .iter()
        .find(|delivery| delivery.target() == &notify)
        .ok_or_eyre("notify delivery recorded")?;
    assert_eq!(failed.status(), DeliveryStatus::Failed);
    assert_eq!(
        store.get(task_id).await?.map(|task| task.status()),
        Some(TaskStatus::Posted)
    );
    let targets = [notify.clone()];
    assert!(
        store
            .claim_due_deliveries(&targets, clock.utc(), max, 10)
            .await?
            .is_empty()
    );

    clock.advance(TimeDelta::seconds(60));
    let due = store
        .claim_due_deliveries(&targets, clock.utc(), max, 10)
        .await?;
    assert_eq!(due.len(), 1);
    for delivery in due {
        pipeline.run_side_effect(delivery).await?;
    }

    let settled = store.list_deliveries(task_id).await?;
    let delivered = settled
        .iter()
        .find(|delivery| delivery.target() == &notify)
        .ok_or_eyre("notify delivery recorded")?;
    assert_eq!(delivered.status(), DeliveryStatus::Posted);
    assert_eq!(delivered.attempts(), 2);
    assert_eq!(notifier.runs(), 2);
    Ok(())
}

fn flaky_pipeline(
    store: &Arc<InMemoryTaskStore>,
    clock: &Arc<ManualClock>,
    rig: &LocalRig,
) -> (Arc<FlakyStore>, StagePipeline<FlakyStore, ManualClock>) {
    let flaky = Arc::new(FlakyStore::new(store));
    let pipeline = StagePipeline::new(
        Arc::clone(&flaky),
        Arc::clone(clock),
        rig.collaborators(),
        pipeline_settings(),
    );
    (flaky, pipeline)
}

#[rstest]
#[case::first_release_succeeds(1)]
#[case::release_retried(2)]
#[tokio::test(flavor = "multi_thread")]
async fn store_error_mid_run_hands_the_task_back(
    store: Arc<InMemoryTaskStore>,
    clock: Arc<ManualClock>,
    #[case] lost_writes: u32,
) -> eyre::Result<()> {
    let rig = LocalRig::new()?;
    let (flaky, pipeline) = flaky_pipeline(&store, &clock, &rig);
    let max = pipeline.settings().policy.max_attempts();
    let task_id = ingest_one(&store, &clock, text_event("evt-20", "hello")).await?;
    let claimed = flaky
        .claim_next(clock.utc(), max)
        .await?
        .ok_or_eyre("task should be claimable")?;
    flaky.fail_next_transitions(lost_writes);

    let outcome = pipeline.run(claimed, &CancellationToken::new()).await?;

    assert_eq!(
        outcome,
        PipelineOutcome::RetryScheduled {
            at: start() + TimeDelta::seconds(60)
        }
    );
    let released = store.get(task_id).await?.ok_or_eyre("task should exist")?;
    assert_eq!(released.status(), TaskStatus::Failed);
    assert_eq!(released.attempts(), 1);
    assert!(released.last_error().is_some_and(|error| error.contains("connection lost")));
    assert!(store.claim_next(clock.utc(), max).await?.is_none());

    clock.advance(TimeDelta::seconds(60));
    let retry = pipeline_over(&store, &clock, &rig);
    let PipelineOutcome::Posted { .. } = claim_and_run(&retry, &store, &clock).await? else {
        eyre::bail!("retried task should be posted");
    };
    assert_eq!(
        store.get(task_id).await?.map(|task| task.attempts()),
        Some(2)
    );
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn unreleased_task_is_reclaimed_once_idle_past_the_lease(
    store: Arc<InMemoryTaskStore>,
    clock: Arc<ManualClock>,
) -> eyre::Result<()> {
    let rig = LocalRig::new()?;
    let (flaky, pipeline) = flaky_pipeline(&store, &clock, &rig);
    let max = pipeline.settings().policy.max_attempts();
    let task_id = ingest_one(&store, &clock, text_event("evt-21", "hello")).await?;
    let claimed = flaky
        .claim_next(clock.utc(), max)
        .await?
        .ok_or_eyre("task should be claimable")?;
    flaky.fail_next_transitions(u32::MAX);

    let result = pipeline.run(claimed, &CancellationToken::new()).await;

    assert!(matches!(result, Err(PipelineError::Store(_))));
    assert_eq!(
        store.get(task_id).await?.map(|task| task.status()),
        Some(TaskStatus::Claimed)
    );

    let lease = TimeDelta::minutes(30);
    let recovery = ResumeManager::new(
        Arc::clone(&store),
        Arc::clone(&clock),
        max,
        publish_target(),
    );
    let early = recovery.reclaim_stale(clock.utc() - lease).await?;
    assert_eq!(early.total(), 0);

    clock.advance(lease + TimeDelta::seconds(1));
    let report = recovery.reclaim_stale(clock.utc() - lease).await?;
    assert_eq!(report.requeued, vec![task_id]);
    assert!(store.claim_next(clock.utc(), max).await?.is_some());
    Ok(())
}

fn pipeline_over(
    store: &Arc<InMemoryTaskStore>,
    clock: &Arc<ManualClock>,
    rig: &LocalRig,
) -> LocalPipeline {
    StagePipeline::new(
        Arc::clone(store),
        Arc::clone(clock),
        rig.collaborators(),
        pipeline_settings(),
    )
}
