//! Claim predicates and concurrent claimers against `PostgreSQL`.

use super::helpers::{now, photo_task, setup_store, test_runtime};
use chrono::TimeDelta;
use eyre::OptionExt;
use mediarelay::task::{
    domain::{TaskId, TaskStatus},
    ports::TaskStore,
};
use pg_embedded_setup_unpriv::{TestCluster, test_support::shared_test_cluster};
use rstest::rstest;
use std::collections::HashSet;
use std::sync::Arc;

const MAX_ATTEMPTS: u32 = 8;

#[rstest]
fn concurrent_claimers_never_share_a_task(
    shared_test_cluster: &'static TestCluster,
) -> eyre::Result<()> {
    let (_database, store) = setup_store(shared_test_cluster)?;
    test_runtime()?.block_on(async {
        for index in 0..30 {
            store
                .insert_if_absent(&photo_task(&format!("evt-{index}"))?)
                .await?;
        }
        let store = Arc::new(store);

        let mut claimers = tokio::task::JoinSet::new();
        for _ in 0..6 {
            let claimer_store = Arc::clone(&store);
            claimers.spawn(async move {
                let mut claimed = Vec::new();
                while let Some(task) = claimer_store.claim_next(now(), MAX_ATTEMPTS).await? {
                    claimed.push(task.task().id());
                }
                Ok::<Vec<TaskId>, eyre::Report>(claimed)
            });
        }

        let mut all = Vec::new();
        while let Some(joined) = claimers.join_next().await {
            all.extend(joined??);
        }
        let unique: HashSet<TaskId> = all.iter().copied().collect();
        assert_eq!(all.len(), 30);
        assert_eq!(unique.len(), 30);
        assert_eq!(store.list_by_status(TaskStatus::Claimed, 100).await?.len(), 30);
        Ok::<(), eyre::Report>(())
    })
}

#[rstest]
fn claim_by_id_respects_predicate(shared_test_cluster: &'static TestCluster) -> eyre::Result<()> {
    let (_database, store) = setup_store(shared_test_cluster)?;
    test_runtime()?.block_on(async {
        let task = photo_task("evt-1")?;
        store.insert_if_absent(&task).await?;

        let claimed = store
            .claim(task.id(), now(), MAX_ATTEMPTS)
            .await?
            .ok_or_eyre("queued task claimable by id")?;
        assert_eq!(claimed.attempt(), 1);
        assert_eq!(claimed.previous_status(), TaskStatus::Queued);
        assert!(store.claim(task.id(), now(), MAX_ATTEMPTS).await?.is_none());
        assert!(store.claim(TaskId::new(), now(), MAX_ATTEMPTS).await?.is_none());
        Ok::<(), eyre::Report>(())
    })
}

#[rstest]
fn attempt_ceiling_stops_claims(shared_test_cluster: &'static TestCluster) -> eyre::Result<()> {
    let (_database, store) = setup_store(shared_test_cluster)?;
    test_runtime()?.block_on(async {
        store.insert_if_absent(&photo_task("evt-2")?).await?;

        let claimed = store.claim_next(now(), 1).await?.ok_or_eyre("first claim")?;
        let task_id = claimed.task().id();
        let requeue = claimed
            .task()
            .resume_transition(1, None, now())
            .ok_or_eyre("claimed task resumes")?;
        store.apply_transition(&requeue).await?;

        let stored = store.get(task_id).await?.ok_or_eyre("task stored")?;
        assert_eq!(stored.status(), TaskStatus::Failed);
        assert!(
            store
                .claim_next(now() + TimeDelta::days(1), 1)
                .await?
                .is_none()
        );
        Ok::<(), eyre::Report>(())
    })
}
