//! Unit tests for reconciliation passes and the dispatch pool.

use std::sync::Arc;

use rstest::{fixture, rstest};

use super::*;
use crate::clock::FakeClock;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::job::{JobSpec, MachineParams};
use crate::provider::ProviderKind;
use crate::test_support::{RecordingStore, ScriptedInstance, ScriptedProvider, job_spec};

const LOCAL_UID: &str = "monkey-24-05-01-0-abc";
const CLOUD_UID: &str = "monkey-24-05-01-1-def";

struct Harness {
    store: Arc<RecordingStore>,
    clock: Arc<FakeClock>,
    aws: Arc<ScriptedProvider>,
    host: Arc<ScriptedInstance>,
    pool: DispatchPool,
    reconciler: ReconciliationLoop,
}

impl Harness {
    fn submit(&self, spec: JobSpec, kind: ProviderKind) {
        let provider = spec.provider.clone();
        let record = JobRecord::new(spec, provider, kind, self.clock.now());
        self.store
            .insert(&record)
            .unwrap_or_else(|err| panic!("insert job: {err}"));
    }

    fn submit_local(&self) {
        self.submit(local_spec(LOCAL_UID), ProviderKind::Local);
    }

    fn submit_cloud(&self) {
        self.submit(job_spec(CLOUD_UID, "aws-main"), ProviderKind::Aws);
    }

    fn force(&self, job_uid: &str, state: JobState) {
        store::transition(&*self.store, job_uid, &[], state, self.clock.now())
            .unwrap_or_else(|err| panic!("move job: {err}"));
    }

    fn record(&self, job_uid: &str) -> JobRecord {
        self.store
            .load(job_uid)
            .unwrap_or_else(|err| panic!("load job: {err}"))
    }

    fn state(&self, job_uid: &str) -> JobState {
        self.record(job_uid).state()
    }

    fn cleanup_calls(&self) -> usize {
        self.host
            .calls()
            .iter()
            .filter(|call| call.starts_with("cleanup_job"))
            .count()
    }

    async fn pass(&self) -> PassReport {
        let report = self.reconciler.run_pass().await;
        self.pool.wait_idle().await;
        report
    }
}

fn local_spec(job_uid: &str) -> JobSpec {
    JobSpec {
        instance: MachineParams {
            name: Some(String::from("gpu-box")),
            ..MachineParams::default()
        },
        ..job_spec(job_uid, "lab")
    }
}

#[fixture]
fn harness() -> Harness {
    let store = Arc::new(RecordingStore::new());
    let clock = Arc::new(FakeClock::default());
    let lab = Arc::new(ScriptedProvider::new("lab", ProviderKind::Local));
    let aws = Arc::new(ScriptedProvider::new("aws-main", ProviderKind::Aws));
    let host = lab.add_host("gpu-box");
    let mut registry = ProviderRegistry::new();
    for provider in [Arc::clone(&lab), Arc::clone(&aws)] {
        registry
            .register(provider as Arc<dyn Provider>)
            .unwrap_or_else(|err| panic!("register provider: {err}"));
    }
    let providers = Arc::new(registry);
    let job_store = Arc::clone(&store) as Arc<dyn JobStore>;
    let job_clock = Arc::clone(&clock) as Arc<dyn Clock>;
    let pool = DispatchPool::new(Dispatcher::new(
        Arc::clone(&job_store),
        Arc::clone(&providers),
        Arc::clone(&job_clock),
    ));
    let reconciler = ReconciliationLoop::new(
        job_store,
        providers,
        job_clock,
        pool.clone(),
        ReconcileSettings::default(),
    );
    Harness {
        store,
        clock,
        aws,
        host,
        pool,
        reconciler,
    }
}

#[rstest]
#[tokio::test]
async fn queued_job_is_dispatched_to_completion(harness: Harness) {
    harness.submit_local();

    let report = harness.pass().await;

    assert_eq!(report.dispatched, vec![LOCAL_UID.to_owned()]);
    assert_eq!(
        harness.pool.status(LOCAL_UID),
        Some(DispatchStatus::Succeeded(DispatchOutcome::Finished))
    );
    assert_eq!(
        harness.store.states(LOCAL_UID),
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
}

#[rstest]
#[tokio::test]
async fn queued_jobs_are_claimed_oldest_first(harness: Harness) {
    harness.submit(local_spec("monkey-24-05-01-0-aaa"), ProviderKind::Local);
    harness.clock.advance_secs(1);
    harness.submit(local_spec("monkey-24-05-01-1-bbb"), ProviderKind::Local);

    let report = harness.pass().await;

    assert_eq!(
        report.dispatched,
        vec![
            String::from("monkey-24-05-01-0-aaa"),
            String::from("monkey-24-05-01-1-bbb"),
        ]
    );
}

#[rstest]
#[tokio::test]
async fn job_with_unknown_provider_stays_queued(harness: Harness) {
    harness.submit(job_spec(LOCAL_UID, "azure"), ProviderKind::Local);

    let report = harness.pass().await;

    assert!(report.dispatched.is_empty());
    assert_eq!(harness.state(LOCAL_UID), JobState::Queued);
    assert_eq!(harness.store.states(LOCAL_UID), vec![JobState::Queued]);
}

#[rstest]
#[tokio::test]
async fn failing_provider_requeues_once_per_pass(harness: Harness) {
    harness.aws.fail_creates(true);
    harness.submit_cloud();

    for _ in 0..3 {
        let report = harness.pass().await;
        assert_eq!(report.failures, 0);
        assert_eq!(harness.state(CLOUD_UID), JobState::Queued);
    }

    assert_eq!(harness.aws.create_calls(), 3);
    let states = harness.store.states(CLOUD_UID);
    let machine_entries = states
        .iter()
        .filter(|state| **state == JobState::DispatchingMachine)
        .count();
    assert_eq!(machine_entries, 3);
    assert!(!states.contains(&JobState::DispatchingInstalls));
}

#[rstest]
#[case(239, JobState::DispatchingMachine)]
#[case(241, JobState::Queued)]
#[tokio::test]
async fn machine_phase_times_out_strictly_after_240_seconds(
    harness: Harness,
    #[case] elapsed: i64,
    #[case] expected: JobState,
) {
    harness.submit_cloud();
    harness.force(CLOUD_UID, JobState::DispatchingMachine);
    let entered = harness.record(CLOUD_UID).last_state_change();
    harness.clock.set(entered + TimeDelta::seconds(elapsed));

    harness.pass().await;

    assert_eq!(harness.state(CLOUD_UID), expected);
}

#[rstest]
#[tokio::test]
async fn running_job_on_offline_instance_is_requeued(harness: Harness) {
    harness.submit_local();
    harness.force(LOCAL_UID, JobState::Running);
    harness.host.set_online(false);

    let report = harness.pass().await;

    assert_eq!(report.requeued, vec![LOCAL_UID.to_owned()]);
    assert_eq!(harness.state(LOCAL_UID), JobState::Queued);
}

#[rstest]
#[tokio::test]
async fn running_job_without_instance_is_requeued(harness: Harness) {
    harness.submit_cloud();
    harness.force(CLOUD_UID, JobState::Running);

    let report = harness.pass().await;

    assert_eq!(report.requeued, vec![CLOUD_UID.to_owned()]);
}

#[rstest]
#[tokio::test]
async fn overdue_run_moves_to_cleanup(harness: Harness) {
    harness.submit(
        JobSpec {
            run_timeout_time: Some(60),
            ..local_spec(LOCAL_UID)
        },
        ProviderKind::Local,
    );
    harness.force(LOCAL_UID, JobState::Running);
    harness.clock.advance_secs(30);
    harness.pass().await;
    assert_eq!(harness.state(LOCAL_UID), JobState::Running);

    harness.clock.advance_secs(31);
    let report = harness.pass().await;

    assert_eq!(
        report.advanced,
        vec![(LOCAL_UID.to_owned(), JobState::Cleanup)]
    );
    assert_eq!(harness.state(LOCAL_UID), JobState::Cleanup);
}

#[rstest]
#[tokio::test]
async fn first_cleanup_runs_immediately(harness: Harness) {
    harness.submit_local();
    harness.force(LOCAL_UID, JobState::Cleanup);

    harness.pass().await;

    assert_eq!(harness.cleanup_calls(), 1);
    let record = harness.record(LOCAL_UID);
    assert_eq!(record.state(), JobState::Finished);
    assert_eq!(record.cleanup_attempts(), 1);
}

#[rstest]
#[tokio::test]
async fn failed_cleanup_is_retried_after_timeout(harness: Harness) {
    harness.submit_local();
    harness.force(LOCAL_UID, JobState::Cleanup);
    harness.host.fail("cleanup_job");

    harness.pass().await;
    harness.clock.advance_secs(10);
    harness.pass().await;
    assert_eq!(harness.cleanup_calls(), 1);
    assert_eq!(harness.state(LOCAL_UID), JobState::Cleanup);

    harness.host.succeed("cleanup_job");
    harness.clock.advance_secs(21);
    harness.pass().await;

    let record = harness.record(LOCAL_UID);
    assert_eq!(harness.cleanup_calls(), 2);
    assert_eq!(record.cleanup_attempts(), 2);
    assert_eq!(record.state(), JobState::Finished);
}

#[rstest]
#[tokio::test]
async fn cleanup_finishes_when_instance_is_gone(harness: Harness) {
    harness.submit_cloud();
    harness.force(CLOUD_UID, JobState::Cleanup);

    let report = harness.pass().await;

    assert_eq!(
        report.advanced,
        vec![(CLOUD_UID.to_owned(), JobState::Finished)]
    );
    assert_eq!(harness.record(CLOUD_UID).cleanup_attempts(), 0);
}

#[rstest]
#[tokio::test]
async fn finished_job_with_live_cloud_instance_returns_to_cleanup(harness: Harness) {
    harness.submit_cloud();
    harness.force(CLOUD_UID, JobState::Finished);
    let leaked = harness.aws.add_host(CLOUD_UID);

    let first = harness.pass().await;
    assert_eq!(
        first.advanced,
        vec![(CLOUD_UID.to_owned(), JobState::Cleanup)]
    );

    harness.pass().await;
    assert!(leaked.is_terminated());
    assert_eq!(harness.state(CLOUD_UID), JobState::Finished);
}

#[rstest]
#[tokio::test]
async fn finished_local_job_keeps_its_host(harness: Harness) {
    harness.submit_local();
    harness.force(LOCAL_UID, JobState::Finished);

    let report = harness.pass().await;

    assert!(report.advanced.is_empty());
    assert_eq!(harness.state(LOCAL_UID), JobState::Finished);
}

#[rstest]
#[tokio::test]
async fn jobs_outside_the_window_are_ignored(harness: Harness) {
    harness.submit_cloud();
    harness.force(CLOUD_UID, JobState::DispatchingSetup);
    harness.clock.advance(TimeDelta::days(11));

    let report = harness.pass().await;

    assert!(report.is_quiet());
    assert_eq!(harness.state(CLOUD_UID), JobState::DispatchingSetup);
}

#[rstest]
#[tokio::test]
async fn one_failing_job_does_not_stop_the_pass(harness: Harness) {
    harness.submit(job_spec("monkey-24-05-01-2-ghi", "azure"), ProviderKind::Aws);
    harness.force("monkey-24-05-01-2-ghi", JobState::Running);
    harness.submit_local();
    harness.force(LOCAL_UID, JobState::Running);
    harness.host.set_online(false);

    let report = harness.pass().await;

    assert_eq!(report.failures, 1);
    assert_eq!(report.requeued, vec![LOCAL_UID.to_owned()]);
    assert_eq!(harness.state("monkey-24-05-01-2-ghi"), JobState::Running);
}

#[rstest]
#[tokio::test]
async fn hyperparameters_are_cached_once(harness: Harness) {
    harness.submit_local();
    harness.force(LOCAL_UID, JobState::Running);
    harness
        .host
        .set_hyperparameters(serde_json::json!({"lr": 0.01, "epochs": 5}));

    let report = harness.pass().await;
    assert_eq!(report.hyperparameters, vec![LOCAL_UID.to_owned()]);
    assert_eq!(
        harness.record(LOCAL_UID).hyperparameters,
        Some(serde_json::json!({"lr": 0.01, "epochs": 5}))
    );

    let again = harness.pass().await;
    assert!(again.hyperparameters.is_empty());
    let fetches = harness
        .host
        .calls()
        .iter()
        .filter(|call| call.as_str() == "fetch_hyperparameters")
        .count();
    assert_eq!(fetches, 1);
}

#[rstest]
#[tokio::test]
async fn pool_refuses_a_second_pipeline_for_the_same_job(harness: Harness) {
    harness.submit_local();
    let gate = harness.host.hold_run();

    assert!(harness.pool.spawn(LOCAL_UID));
    assert!(!harness.pool.spawn(LOCAL_UID));
    assert!(harness.pool.is_running(LOCAL_UID));
    assert_eq!(harness.pool.active(), 1);

    gate.notify_one();
    let status = harness.pool.wait_for(LOCAL_UID).await;
    assert_eq!(
        status,
        Some(DispatchStatus::Succeeded(DispatchOutcome::Finished))
    );
    assert_eq!(harness.pool.active(), 0);
}

#[rstest]
#[tokio::test]
async fn finished_job_status_is_pruned_on_the_second_pass_after_it_settles(harness: Harness) {
    harness.submit_local();

    harness.pass().await;
    assert!(harness.pool.status(LOCAL_UID).is_some());
    harness.pass().await;
    assert!(harness.pool.status(LOCAL_UID).is_some());
    harness.pass().await;

    assert_eq!(harness.pool.status(LOCAL_UID), None);
    assert!(harness.pool.snapshot().is_empty());
}

#[rstest]
#[tokio::test]
async fn requeued_job_status_is_kept(harness: Harness) {
    harness.aws.fail_creates(true);
    harness.submit_cloud();

    for _ in 0..3 {
        harness.pass().await;
    }

    assert!(matches!(
        harness.pool.status(CLOUD_UID),
        Some(DispatchStatus::Succeeded(DispatchOutcome::Requeued { .. }))
    ));
}

#[rstest]
#[tokio::test]
async fn running_pipelines_are_never_pruned(harness: Harness) {
    harness.submit_local();
    let gate = harness.host.hold_run();
    assert!(harness.pool.spawn(LOCAL_UID));

    assert_eq!(harness.pool.prune(|_| true), 0);
    assert_eq!(harness.pool.prune(|_| true), 0);
    assert!(harness.pool.is_running(LOCAL_UID));

    gate.notify_one();
    harness.pool.wait_idle().await;
    assert_eq!(harness.pool.prune(|_| true), 0);
    assert_eq!(harness.pool.prune(|_| true), 1);
}

#[rstest]
#[tokio::test]
async fn pool_records_pipeline_errors(harness: Harness) {
    assert!(harness.pool.spawn("monkey-24-05-01-9-zzz"));

    let status = harness.pool.wait_for("monkey-24-05-01-9-zzz").await;

    assert!(matches!(status, Some(DispatchStatus::Failed(message)) if message.contains("not found")));
    assert_eq!(harness.pool.wait_for("monkey-24-05-01-8-yyy").await, None);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn daemon_loop_stops_on_shutdown(harness: Harness) {
    harness.submit_local();
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();

    let reconciler = &harness.reconciler;
    let run = reconciler.daemon_loop(async move {
        drop(stopped.await);
    });
    tokio::pin!(run);
    tokio::select! {
        () = &mut run => panic!("loop ended before shutdown"),
        () = tokio::time::sleep(Duration::from_secs(25)) => {}
    }
    drop(stop.send(()));
    run.await;

    harness.pool.wait_idle().await;
    assert_eq!(harness.state(LOCAL_UID), JobState::Finished);
}
