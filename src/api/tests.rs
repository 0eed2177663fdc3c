//! Tests for the request handlers.

use std::sync::Arc;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::clock::{Clock, FakeClock};
use crate::config::CoreConfig;
use crate::job::{JobState, MachineParams, is_job_uid};
use crate::monkeyfs::MonkeyFs;
use crate::provider::{Provider, ProviderKind, ProviderRegistry};
use crate::store::JobStore;
use crate::test_support::{RecordingStore, ScriptedInstance, ScriptedProvider, job_spec};

const UID: &str = "monkey-24-05-01-0-abc";

struct Harness {
    _tmp: TempDir,
    store: Arc<RecordingStore>,
    host: Arc<ScriptedInstance>,
    ctx: Orchestrator,
}

impl Harness {
    fn states(&self) -> Vec<JobState> {
        self.store.states(UID)
    }
}

#[fixture]
fn harness() -> Harness {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(tmp.path().join("monkeyfs"))
        .unwrap_or_else(|err| panic!("temp path should be utf8: {}", err.display()));
    let monkeyfs = MonkeyFs::open(&root).unwrap_or_else(|err| panic!("open monkeyfs: {err}"));

    let store = Arc::new(RecordingStore::new());
    let lab = Arc::new(ScriptedProvider::new("lab", ProviderKind::Local));
    let host = lab.add_host("gpu-box");
    let mut registry = ProviderRegistry::new();
    registry
        .register(lab as Arc<dyn Provider>)
        .unwrap_or_else(|err| panic!("register provider: {err}"));

    let ctx = Orchestrator::assemble(
        CoreConfig::default(),
        Arc::clone(&store) as Arc<dyn JobStore>,
        registry,
        Arc::new(FakeClock::default()) as Arc<dyn Clock>,
        monkeyfs,
    );
    Harness {
        _tmp: tmp,
        store,
        host,
        ctx,
    }
}

fn lab_spec(foreground: bool) -> JobSpec {
    JobSpec {
        foreground,
        instance: MachineParams {
            name: Some(String::from("gpu-box")),
            ..MachineParams::default()
        },
        ..job_spec(UID, "lab")
    }
}

fn query(provider: &str, extension: Option<&str>) -> ArtifactQuery {
    ArtifactQuery {
        name: String::from("mnist"),
        checksum: String::from("abc123"),
        provider: provider.to_owned(),
        extension: extension.map(str::to_owned),
    }
}

#[rstest]
#[tokio::test]
async fn background_job_is_queued_for_the_loop(harness: Harness) {
    let response = submit_job(&harness.ctx, lab_spec(false)).await;

    assert!(response.success, "unexpected response: {response:?}");
    assert_eq!(harness.states(), vec![JobState::Queued]);
    assert!(harness.host.calls().is_empty());
}

#[rstest]
#[tokio::test]
async fn foreground_job_is_dispatched_before_responding(harness: Harness) {
    let response = submit_job(&harness.ctx, lab_spec(true)).await;

    assert_eq!(
        response,
        SubmitResponse {
            success: true,
            msg: format!("job {UID} finished"),
        }
    );
    assert_eq!(
        harness.states(),
        vec![
            JobState::Queued,
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
async fn failed_foreground_dispatch_is_accepted_and_requeued(harness: Harness) {
    harness.host.fail("run_job");

    let response = submit_job(&harness.ctx, lab_spec(true)).await;

    assert!(response.success, "persisted job was reported as rejected");
    assert!(response.msg.contains("accepted"), "unexpected msg: {}", response.msg);
    assert!(response.msg.contains("requeued"), "unexpected msg: {}", response.msg);
    assert_eq!(harness.states().last(), Some(&JobState::Queued));
}

#[rstest]
#[tokio::test]
async fn invalid_spec_is_not_persisted(harness: Harness) {
    let spec = JobSpec {
        cmd: String::new(),
        ..lab_spec(false)
    };

    let response = submit_job(&harness.ctx, spec).await;

    assert!(!response.success);
    assert!(response.msg.contains("cmd"), "unexpected msg: {}", response.msg);
    assert!(harness.states().is_empty());
}

#[rstest]
#[tokio::test]
async fn unknown_provider_is_not_persisted(harness: Harness) {
    let response = submit_job(&harness.ctx, job_spec(UID, "azure")).await;

    assert_eq!(
        response,
        SubmitResponse {
            success: false,
            msg: String::from("provider azure is not configured"),
        }
    );
    assert!(harness.states().is_empty());
}

#[rstest]
#[tokio::test]
async fn resubmitting_a_uid_is_rejected(harness: Harness) {
    let first = submit_job(&harness.ctx, lab_spec(false)).await;
    let second = submit_job(&harness.ctx, lab_spec(false)).await;

    assert!(first.success);
    assert!(!second.success);
    assert_eq!(second.msg, format!("job {UID} was already submitted"));
}

#[rstest]
fn dataset_is_uploaded_once(harness: Harness) {
    let ctx = &harness.ctx;
    let tar = query("lab", Some("tar"));

    let before = check_dataset(ctx, &tar);
    let upload = upload_dataset(ctx, &tar, b"archive");
    let after = check_dataset(ctx, &tar);
    let again = upload_dataset(ctx, &tar, b"archive");

    assert!(!before.found);
    assert!(upload.success);
    assert!(after.found);
    assert_eq!(again.msg, "data mnist already stored");
    assert!(!check_codebase(ctx, &tar).found);
}

#[rstest]
fn check_against_unknown_provider_reports_not_found(harness: Harness) {
    let response = check_dataset(&harness.ctx, &query("azure", None));

    assert!(!response.found);
    assert_eq!(response.msg, "provider azure is not configured");
}

#[rstest]
#[case(query("lab", None), "missing extension")]
#[case(query("azure", Some("tar")), "provider azure is not configured")]
fn bad_upload_is_rejected(harness: Harness, #[case] upload: ArtifactQuery, #[case] msg: &str) {
    let response = upload_codebase(&harness.ctx, &upload, b"code");

    assert!(!response.success);
    assert_eq!(response.msg, msg);
}

#[rstest]
#[tokio::test]
async fn job_listing_carries_dispatch_status_and_log_path(harness: Harness) {
    let submitted = submit_job(&harness.ctx, lab_spec(true)).await;
    assert!(submitted.success);

    let jobs = list_jobs(&harness.ctx).unwrap_or_else(|err| panic!("list jobs: {err}"));

    let [job] = jobs.as_slice() else {
        panic!("expected one job, got {}", jobs.len());
    };
    assert_eq!(job.record.state(), JobState::Finished);
    assert_eq!(job.dispatch.as_deref(), Some("finished"));
    let log_path = job
        .log_path
        .as_ref()
        .unwrap_or_else(|| panic!("log path should be set"));
    assert!(log_path.ends_with(format!("jobs/{UID}/logs/run.log")));
}

#[rstest]
#[tokio::test]
async fn instance_listing_skips_unknown_providers(harness: Harness) {
    let listing = list_instances(
        &harness.ctx,
        &[String::from("lab"), String::from("azure")],
    )
    .await;

    let names: Vec<_> = listing
        .get("lab")
        .unwrap_or_else(|| panic!("lab should be listed"))
        .iter()
        .map(|details| details.name.clone())
        .collect();
    assert_eq!(names, vec![String::from("gpu-box")]);
    assert_eq!(listing.len(), 1);
}

#[rstest]
fn providers_and_uids_are_exposed(harness: Harness) {
    let providers = list_providers(&harness.ctx);
    let uid = new_job_uid(&harness.ctx);

    assert_eq!(providers.len(), 1);
    assert_eq!(providers.first().map(|settings| settings.name.as_str()), Some("lab"));
    assert!(is_job_uid(&uid), "malformed uid {uid}");
}
