//! When steps for task retry BDD scenarios.

use super::world::{RelayWorld, publish_target, run_async};
use chrono::TimeDelta;
use mediarelay::task::{
    domain::NormalizedEvent,
    ports::TaskStore,
    services::{IngestService, ResumeManager},
};
use mockable::Clock;
use rstest_bdd_macros::when;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[when("the relay processes the next task")]
fn process_next_task(world: &mut RelayWorld) -> Result<(), eyre::Report> {
    let pipeline = world.pipeline();
    let max_attempts = pipeline.settings().policy.max_attempts();
    let claimed = run_async(world.store.claim_next(world.clock.utc(), max_attempts))?
        .ok_or_else(|| eyre::eyre!("expected a claimable task"))?;
    let outcome = run_async(pipeline.run(claimed, &CancellationToken::new()))?;
    world.last_run = Some(outcome);
    Ok(())
}

#[when("the clock advances by {seconds:i64} seconds")]
fn clock_advances(world: &mut RelayWorld, seconds: i64) {
    world.clock.advance(TimeDelta::seconds(seconds));
}

#[when(r#"the event "{source_id}" is ingested {times:usize} times"#)]
fn event_ingested_repeatedly(
    world: &mut RelayWorld,
    source_id: String,
    times: usize,
) -> Result<(), eyre::Report> {
    let ingest = IngestService::new(Arc::clone(&world.store), Arc::clone(&world.clock));
    for _ in 0..times {
        let event = NormalizedEvent::Text {
            source: "bot".to_owned(),
            source_id: Some(source_id.clone()),
            text: "hello".to_owned(),
        };
        world.ingest_outcomes.push(run_async(ingest.ingest(event))?);
    }
    Ok(())
}

#[when("the relay resumes interrupted work")]
fn relay_resumes(world: &mut RelayWorld) -> Result<(), eyre::Report> {
    let manager = ResumeManager::new(
        Arc::clone(&world.store),
        Arc::clone(&world.clock),
        world.pipeline().settings().policy.max_attempts(),
        publish_target(),
    );
    world.resume_report = Some(run_async(manager.resume())?);
    Ok(())
}
