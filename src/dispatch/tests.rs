//! Unit tests for the dispatch pipeline.

use std::sync::Arc;

use rstest::{fixture, rstest};

use super::*;
use crate::clock::FakeClock;
use crate::job::{JobRecord, JobSpec, MachineParams};
use crate::provider::{Provider, ProviderKind, ProviderRegistry};
use crate::test_support::{RecordingStore, ScriptedInstance, ScriptedProvider, job_spec};

const UID: &str = "monkey-24-05-01-0-abc";

struct Harness {
    store: Arc<RecordingStore>,
    provider: Arc<ScriptedProvider>,
    host: Arc<ScriptedInstance>,
    dispatcher: Dispatcher,
}

impl Harness {
    fn state(&self) -> JobState {
        self.store
            .load(UID)
            .unwrap_or_else(|err| panic!("load job: {err}"))
            .state()
    }

    fn set_state(&self, state: JobState) {
        store::transition(&*self.store, UID, &[], state, chrono::Utc::now())
            .unwrap_or_else(|err| panic!("move job: {err}"));
    }

    async fn dispatch(&self) -> DispatchOutcome {
        self.dispatcher
            .run_job(UID)
            .await
            .unwrap_or_else(|err| panic!("dispatch: {err}"))
    }
}

fn local_spec() -> JobSpec {
    JobSpec {
        install: vec![String::from("conda")],
        instance: MachineParams {
            name: Some(String::from("gpu-box")),
            ..MachineParams::default()
        },
        ..job_spec(UID, "lab")
    }
}

#[fixture]
fn harness() -> Harness {
    let store = Arc::new(RecordingStore::new());
    let clock = Arc::new(FakeClock::default());
    let provider = Arc::new(ScriptedProvider::new("lab", ProviderKind::Local));
    let host = provider.add_host("gpu-box");
    let mut registry = ProviderRegistry::new();
    registry
        .register(Arc::clone(&provider) as Arc<dyn Provider>)
        .unwrap_or_else(|err| panic!("register provider: {err}"));
    let record = JobRecord::new(local_spec(), "lab", ProviderKind::Local, clock.now());
    store
        .insert(&record)
        .unwrap_or_else(|err| panic!("insert job: {err}"));
    let dispatcher = Dispatcher::new(
        Arc::clone(&store) as Arc<dyn JobStore>,
        Arc::new(registry),
        clock,
    );
    Harness {
        store,
        provider,
        host,
        dispatcher,
    }
}

#[rstest]
#[tokio::test]
async fn successful_dispatch_walks_every_phase_once(harness: Harness) {
    harness.set_state(JobState::Dispatching);

    let outcome = harness.dispatch().await;

    assert_eq!(outcome, DispatchOutcome::Finished);
    assert_eq!(
        harness.store.states(UID),
        vec![
            JobState::Queued,
            JobState::Dispatching,
            JobState::DispatchingMachine,
            JobState::DispatchingInstalls,
            JobState::DispatchingSetup,
            JobState::Running,
            JobState::Cleanup,
            JobState::Finished,
        ]
    );
    assert_eq!(
        harness.host.calls(),
        vec![
            String::from("install_dependency conda"),
            String::from("mount_shared_filesystem"),
            format!("setup_job {UID}"),
            format!("run_job {UID}"),
            format!("cleanup_job {UID}"),
        ]
    );
    let record = harness
        .store
        .load(UID)
        .unwrap_or_else(|err| panic!("load job: {err}"));
    assert_eq!(record.cleanup_attempts(), 1);
    assert!(record.completion_date().is_some());
}

#[rstest]
#[tokio::test]
async fn failed_machine_creation_requeues(harness: Harness) {
    harness.provider.fail_creates(true);

    let outcome = harness.dispatch().await;

    assert!(matches!(
        outcome,
        DispatchOutcome::Requeued { phase: JobState::DispatchingMachine, .. }
    ));
    assert_eq!(harness.state(), JobState::Queued);
    assert!(harness.host.calls().is_empty());
}

#[rstest]
#[case("install_dependency", JobState::DispatchingInstalls)]
#[case("mount_shared_filesystem", JobState::DispatchingSetup)]
#[case("setup_job", JobState::DispatchingSetup)]
#[case("run_job", JobState::Running)]
#[tokio::test]
async fn failed_phase_requeues_from_that_phase(
    harness: Harness,
    #[case] failing: &str,
    #[case] phase: JobState,
) {
    harness.host.fail(failing);

    let outcome = harness.dispatch().await;

    assert!(matches!(outcome, DispatchOutcome::Requeued { phase: found, .. } if found == phase));
    assert_eq!(harness.state(), JobState::Queued);
    let states = harness.store.states(UID);
    assert_eq!(states.iter().rev().nth(1), Some(&phase));
    assert!(!harness.host.calls().iter().any(|call| call.starts_with("cleanup_job")));
}

#[rstest]
#[tokio::test]
async fn failed_cleanup_leaves_job_for_reconciliation(harness: Harness) {
    harness.host.fail("cleanup_job");

    let outcome = harness.dispatch().await;

    assert!(matches!(outcome, DispatchOutcome::CleanupPending { .. }));
    let record = harness
        .store
        .load(UID)
        .unwrap_or_else(|err| panic!("load job: {err}"));
    assert_eq!(record.state(), JobState::Cleanup);
    assert_eq!(record.cleanup_attempts(), 1);
    assert!(record.last_cleanup_attempt().is_some());
}

#[rstest]
#[case(JobState::Running)]
#[case(JobState::Finished)]
#[tokio::test]
async fn jobs_already_in_flight_are_not_redispatched(harness: Harness, #[case] state: JobState) {
    harness.set_state(state);

    let outcome = harness.dispatch().await;

    assert_eq!(outcome, DispatchOutcome::Preempted { found: state });
    assert_eq!(harness.provider.create_calls(), 0);
}

#[rstest]
#[tokio::test]
async fn requeue_during_run_stops_the_stale_pipeline(harness: Harness) {
    let gate = harness.host.hold_run();
    let dispatcher = harness.dispatcher.clone();
    let task = tokio::spawn(async move { dispatcher.run_job(UID).await });

    while harness.state() != JobState::Running {
        tokio::task::yield_now().await;
    }
    store::requeue(
        &*harness.store,
        UID,
        &[JobState::Running],
        "instance offline",
        chrono::Utc::now(),
    )
    .unwrap_or_else(|err| panic!("requeue: {err}"));
    gate.notify_one();

    let outcome = task
        .await
        .unwrap_or_else(|err| panic!("join: {err}"))
        .unwrap_or_else(|err| panic!("dispatch: {err}"));
    assert_eq!(outcome, DispatchOutcome::Preempted { found: JobState::Queued });
    assert_eq!(harness.state(), JobState::Queued);
    assert!(!harness.host.calls().iter().any(|call| call.starts_with("cleanup_job")));
}

#[rstest]
#[tokio::test]
async fn unknown_provider_requeues_claimed_job(harness: Harness) {
    let record = JobRecord::new(
        job_spec("monkey-24-05-01-1-def", "gone"),
        "gone",
        ProviderKind::Aws,
        chrono::Utc::now(),
    );
    harness
        .store
        .insert(&record)
        .unwrap_or_else(|err| panic!("insert job: {err}"));
    store::transition(
        &*harness.store,
        "monkey-24-05-01-1-def",
        &[],
        JobState::Dispatching,
        chrono::Utc::now(),
    )
    .unwrap_or_else(|err| panic!("claim job: {err}"));

    let err = harness.dispatcher.run_job("monkey-24-05-01-1-def").await.err();

    assert!(matches!(err, Some(DispatchError::UnknownProvider { provider, .. }) if provider == "gone"));
    let reloaded = harness
        .store
        .load("monkey-24-05-01-1-def")
        .unwrap_or_else(|err| panic!("load job: {err}"));
    assert_eq!(reloaded.state(), JobState::Queued);
}

#[rstest]
#[tokio::test]
async fn missing_job_is_a_store_error(harness: Harness) {
    let err = harness.dispatcher.run_job("monkey-24-05-01-9-zzz").await.err();
    assert!(matches!(err, Some(DispatchError::Store(StoreError::NotFound { .. }))));
}
