//! Unit tests for the job stores and transition helpers.

use std::sync::Arc;

use camino::Utf8PathBuf;
use chrono::{TimeDelta, TimeZone, Utc};
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::job::JobSpec;
use crate::provider::ProviderKind;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
        .single()
        .unwrap_or_else(|| panic!("valid date"))
}

fn record(uid: &str, offset_secs: i64) -> JobRecord {
    let spec = JobSpec {
        job_uid: uid.to_owned(),
        provider: String::from("local"),
        cmd: String::from("echo hi"),
        ..JobSpec::default()
    };
    JobRecord::new(
        spec,
        "local",
        ProviderKind::Local,
        start() + TimeDelta::seconds(offset_secs),
    )
}

struct FileFixture {
    _temp: TempDir,
    store: FileJobStore,
}

#[fixture]
fn file_store() -> FileFixture {
    let temp = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
    let root = Utf8PathBuf::from_path_buf(temp.path().join("jobs"))
        .unwrap_or_else(|path| panic!("non-utf8 temp path: {}", path.display()));
    let store = FileJobStore::open(&root).unwrap_or_else(|err| panic!("open store: {err}"));
    FileFixture { _temp: temp, store }
}

fn each_store(file: &FileFixture, check: impl Fn(&dyn JobStore)) {
    check(&file.store);
    check(&MemoryJobStore::new());
}

#[rstest]
fn insert_then_load_round_trips(file_store: FileFixture) {
    each_store(&file_store, |store| {
        let job = record("monkey-24-05-01-1-abc", 0);
        store
            .insert(&job)
            .unwrap_or_else(|err| panic!("insert: {err}"));
        let loaded = store
            .load(&job.job_uid)
            .unwrap_or_else(|err| panic!("load: {err}"));
        assert_eq!(loaded, job);
    });
}

#[rstest]
fn insert_refuses_duplicates(file_store: FileFixture) {
    each_store(&file_store, |store| {
        let job = record("monkey-24-05-01-1-abc", 0);
        store
            .insert(&job)
            .unwrap_or_else(|err| panic!("insert: {err}"));
        assert_eq!(
            store.insert(&job),
            Err(StoreError::AlreadyExists {
                job_uid: job.job_uid.clone()
            })
        );
    });
}

#[rstest]
fn list_is_ordered_by_creation(file_store: FileFixture) {
    each_store(&file_store, |store| {
        for (uid, offset) in [("monkey-c", 30), ("monkey-a", 10), ("monkey-b", 20)] {
            store
                .insert(&record(uid, offset))
                .unwrap_or_else(|err| panic!("insert: {err}"));
        }
        let uids: Vec<String> = store
            .list()
            .unwrap_or_else(|err| panic!("list: {err}"))
            .into_iter()
            .map(|job| job.job_uid)
            .collect();
        assert_eq!(uids, ["monkey-a", "monkey-b", "monkey-c"]);
    });
}

#[rstest]
fn missing_records_report_not_found(file_store: FileFixture) {
    each_store(&file_store, |store| {
        assert!(matches!(
            store.load("monkey-nope"),
            Err(StoreError::NotFound { .. })
        ));
    });
}

#[rstest]
fn rejects_path_like_identifiers(file_store: FileFixture) {
    let job = record("../escape", 0);
    assert!(matches!(
        file_store.store.insert(&job),
        Err(StoreError::InvalidUid(_))
    ));
}

#[rstest]
fn transition_guard_rejects_stale_state(file_store: FileFixture) {
    each_store(&file_store, |store| {
        let job = record("monkey-guard", 0);
        store
            .insert(&job)
            .unwrap_or_else(|err| panic!("insert: {err}"));
        let moved = transition(
            store,
            &job.job_uid,
            &[JobState::Queued],
            JobState::Dispatching,
            start(),
        )
        .unwrap_or_else(|err| panic!("transition: {err}"));
        assert_eq!(moved.state(), JobState::Dispatching);

        let stale = transition(
            store,
            &job.job_uid,
            &[JobState::Queued],
            JobState::Dispatching,
            start(),
        );
        assert_eq!(
            stale,
            Err(StoreError::UnexpectedState {
                job_uid: job.job_uid.clone(),
                found: JobState::Dispatching,
                next: JobState::Dispatching,
            })
        );
        let persisted = store
            .load(&job.job_uid)
            .unwrap_or_else(|err| panic!("load: {err}"));
        assert_eq!(persisted.last_state_change(), moved.last_state_change());
    });
}

#[rstest]
fn corrupt_files_are_skipped_when_listing(file_store: FileFixture) {
    file_store
        .store
        .insert(&record("monkey-good", 0))
        .unwrap_or_else(|err| panic!("insert: {err}"));
    std::fs::write(file_store.store.root().join("monkey-bad.json"), "{not json")
        .unwrap_or_else(|err| panic!("write corrupt file: {err}"));
    let listed = file_store
        .store
        .list()
        .unwrap_or_else(|err| panic!("list: {err}"));
    assert_eq!(listed.len(), 1);
}

#[test]
fn concurrent_updates_are_serialised() {
    let shared: Arc<MemoryJobStore> = Arc::new(MemoryJobStore::new());
    shared
        .insert(&record("monkey-race", 0))
        .unwrap_or_else(|err| panic!("insert: {err}"));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&shared);
            std::thread::spawn(move || {
                transition(
                    store.as_ref(),
                    "monkey-race",
                    &[JobState::Queued],
                    JobState::Dispatching,
                    start(),
                )
                .is_ok()
            })
        })
        .collect();
    let winners = handles
        .into_iter()
        .map(|handle| handle.join().unwrap_or_else(|_| panic!("thread panicked")))
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);
}
