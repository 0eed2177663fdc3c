//! Behavioural smoke tests for the CLI entrypoint.

use std::fs;

use assert_cmd::cargo::cargo_bin_cmd;
use camino::Utf8PathBuf;
use predicates::str::contains;
use rstest::{fixture, rstest};
use tempfile::TempDir;

struct Workspace {
    _tmp: TempDir,
    root: Utf8PathBuf,
    config: Utf8PathBuf,
}

impl Workspace {
    fn command(&self) -> assert_cmd::Command {
        let mut cmd = cargo_bin_cmd!("monkey-core");
        cmd.current_dir(&self.root)
            .env("MONKEY_CONFIG_PATH", &self.config)
            .env("RUST_LOG", "warn");
        cmd
    }

    fn write(&self, name: &str, contents: &str) -> Utf8PathBuf {
        let path = self.root.join(name);
        fs::write(&path, contents).unwrap_or_else(|err| panic!("write {path}: {err}"));
        path
    }
}

#[fixture]
fn workspace() -> Workspace {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|err| panic!("temp path should be utf8: {}", err.display()));
    let config = root.join("monkey.toml");
    let settings = format!(
        "store_path = \"{root}/store\"\nmonkeyfs_path = \"{root}/monkeyfs\"\nansible_dir = \"{root}/ansible\"\n"
    );
    fs::write(&config, settings).unwrap_or_else(|err| panic!("write config: {err}"));
    Workspace {
        _tmp: tmp,
        root,
        config,
    }
}

const LAB: &str = r#"{
    "type": "local",
    "name": "lab",
    "hosts": [{
        "name": "gpu-box",
        "address": "10.0.0.5",
        "scratch_dir": "/scratch",
        "monkeyfs_dir": "/mnt/monkeyfs"
    }]
}"#;

#[test]
fn cli_without_arguments_prints_usage() {
    let mut cmd = cargo_bin_cmd!("monkey-core");
    cmd.assert().failure().stderr(contains("Usage"));
}

#[rstest]
fn jobs_lists_an_empty_store(workspace: Workspace) {
    workspace
        .command()
        .arg("jobs")
        .assert()
        .success()
        .stdout("[]\n");
}

#[rstest]
fn added_provider_is_listed(workspace: Workspace) {
    let definition = workspace.write("lab.json", LAB);

    workspace
        .command()
        .args(["providers", "add", definition.as_str()])
        .assert()
        .success()
        .stdout(contains("saved provider lab"));

    workspace
        .command()
        .arg("providers")
        .assert()
        .success()
        .stdout(contains("\"gpu-box\""));
    let saved = fs::read_to_string(&workspace.config)
        .unwrap_or_else(|err| panic!("read config: {err}"));
    assert!(saved.contains("store_path"), "settings were dropped: {saved}");
}

#[rstest]
fn second_local_provider_needs_force(workspace: Workspace) {
    let definition = workspace.write("lab.json", LAB);
    let replacement = workspace.write("lab2.json", &LAB.replace("\"lab\"", "\"lab-2\""));
    workspace
        .command()
        .args(["providers", "add", definition.as_str()])
        .assert()
        .success();

    workspace
        .command()
        .args(["providers", "add", replacement.as_str()])
        .assert()
        .failure()
        .stderr(contains("--force"));
    workspace
        .command()
        .args(["providers", "add", "--force", replacement.as_str()])
        .assert()
        .success();
}

#[rstest]
fn submission_to_unknown_provider_is_rejected(workspace: Workspace) {
    let spec = workspace.write("job.json", r#"{"provider": "azure", "cmd": "echo hi"}"#);

    workspace
        .command()
        .args(["submit", spec.as_str()])
        .assert()
        .failure()
        .stdout(contains("\"success\": false"))
        .stderr(contains("provider azure is not configured"));
}

#[rstest]
fn background_submission_is_queued(workspace: Workspace) {
    let definition = workspace.write("lab.json", LAB);
    workspace
        .command()
        .args(["providers", "add", definition.as_str()])
        .assert()
        .success();
    let spec = workspace.write(
        "job.json",
        r#"{"provider": "lab", "cmd": "echo hi", "instance": {"name": "gpu-box"}}"#,
    );

    workspace
        .command()
        .args(["submit", spec.as_str()])
        .assert()
        .success()
        .stdout(contains("queued"));
    workspace
        .command()
        .arg("jobs")
        .assert()
        .success()
        .stdout(contains("\"state\": \"QUEUED\""));
}
