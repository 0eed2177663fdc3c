//! Behavioural tests for dataset and codebase deduplication.

#[path = "common/stack.rs"]
mod stack;

use monkey_core::api::{self, ArtifactQuery};
use monkey_core::job::{DataItem, JobSpec};
use monkey_core::monkeyfs::ArtifactKind;
use rstest::rstest;

use stack::{Stack, local_spec};

fn dataset_query(item: &DataItem) -> ArtifactQuery {
    ArtifactQuery {
        name: item.name.clone(),
        checksum: item.checksum.clone(),
        provider: String::from("lab"),
        extension: Some(item.extension.clone()),
    }
}

fn mnist() -> DataItem {
    DataItem {
        name: String::from("mnist"),
        path: String::from("data/mnist"),
        checksum: String::from("abc123"),
        extension: String::from("tar.gz"),
    }
}

/// Mirrors a client: check first, upload only when the check misses.
fn stage_dataset(stack: &Stack, item: &DataItem, contents: &[u8]) -> bool {
    let query = dataset_query(item);
    if api::check_dataset(&stack.ctx, &query).found {
        return false;
    }
    let response = api::upload_dataset(&stack.ctx, &query, contents);
    assert!(response.success, "upload failed: {}", response.msg);
    true
}

#[rstest]
#[tokio::test]
async fn second_job_with_same_dataset_skips_the_upload() {
    let stack = Stack::new().await;
    let spec = JobSpec {
        data: vec![mnist()],
        ..local_spec("monkey-24-05-01-0-abc")
    };

    let uploaded_first = stage_dataset(&stack, &mnist(), b"first archive");
    let uploaded_second = stage_dataset(&stack, &mnist(), b"second archive");

    assert!(uploaded_first);
    assert!(!uploaded_second);
    let stored = stack
        .ctx
        .monkeyfs()
        .artifact_path(ArtifactKind::Dataset, "mnist", "abc123", "tar.gz")
        .unwrap_or_else(|err| panic!("artifact path: {err}"));
    let contents = std::fs::read(&stored).unwrap_or_else(|err| panic!("read artifact: {err}"));
    assert_eq!(contents, b"first archive");

    let response = api::submit_job(&stack.ctx, spec).await;
    assert!(response.success, "submit failed: {}", response.msg);
    stack.pass().await;
    let staged = stack
        .steps()
        .iter()
        .filter(|step| *step == "setup_data_item")
        .count();
    assert_eq!(staged, 1);
}

#[rstest]
#[tokio::test]
async fn new_checksum_is_uploaded_alongside_the_old_one() {
    let stack = Stack::new().await;
    let updated = DataItem {
        checksum: String::from("def456"),
        ..mnist()
    };

    assert!(stage_dataset(&stack, &mnist(), b"v1"));
    assert!(stage_dataset(&stack, &updated, b"v2"));
    assert!(api::check_dataset(&stack.ctx, &dataset_query(&mnist())).found);
    assert!(api::check_dataset(&stack.ctx, &dataset_query(&updated)).found);
}
