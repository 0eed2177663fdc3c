//! Orchestrator stack shared by the behaviour tests.
//!
//! Include it with:
//!
//! ```ignore
//! #[path = "common/stack.rs"]
//! mod stack;
//! ```
//!
//! The `lab` provider is a real local provider whose remote operations go
//! through a scripted runner and whose single host answers health probes
//! from a loopback stub. `aws-main` is a scripted cloud provider.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::TimeDelta;
use monkey_core::clock::{Clock, FakeClock};
use monkey_core::config::CoreConfig;
use monkey_core::context::Orchestrator;
use monkey_core::instance::HealthCheck;
use monkey_core::job::{CodeItem, JobSpec, JobState, MachineParams};
use monkey_core::monkeyfs::MonkeyFs;
use monkey_core::provider::{
    CreatePolicy, LocalHost, LocalProvider, LocalProviderConfig, Provider, ProviderDeps,
    ProviderKind, ProviderRegistry,
};
use monkey_core::reconcile::PassReport;
use monkey_core::remote::{GenerationTracker, GuardedRunner};
use monkey_core::store::JobStore;
use monkey_core::test_support::{
    HealthStub, RecordingStore, ScriptedProvider, ScriptedRemoteRunner, ScriptedRunner, job_spec,
};
use tempfile::TempDir;

pub struct Stack {
    _tmp: TempDir,
    _health: HealthStub,
    pub store: Arc<RecordingStore>,
    pub clock: Arc<FakeClock>,
    pub remote: ScriptedRemoteRunner,
    pub aws: Arc<ScriptedProvider>,
    pub ctx: Orchestrator,
}

impl Stack {
    pub async fn new() -> Self {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = Utf8PathBuf::from_path_buf(tmp.path().join("monkeyfs"))
            .unwrap_or_else(|err| panic!("temp path should be utf8: {}", err.display()));
        let monkeyfs = MonkeyFs::open(&root).unwrap_or_else(|err| panic!("open monkeyfs: {err}"));
        let health = HealthStub::spawn().await;

        let store = Arc::new(RecordingStore::new());
        let clock = Arc::new(FakeClock::default());
        let remote = ScriptedRemoteRunner::new();
        let deps = ProviderDeps {
            remote: GuardedRunner::new(Arc::new(remote.clone()), GenerationTracker::new()),
            commands: Arc::new(ScriptedRunner::new()),
            clock: Arc::clone(&clock) as Arc<dyn Clock>,
            health: HealthCheck {
                port: health.port(),
                timeout: Duration::from_millis(500),
                offline_threshold: 3,
            },
            cache_cooldown: TimeDelta::seconds(5),
            create_policy: CreatePolicy {
                attempts: 1,
                backoff: Duration::ZERO,
            },
            ansible_dir: Utf8PathBuf::from("/opt/monkey/ansible"),
            inventory_bin: String::from("ansible-inventory"),
            monkeyfs_path: root,
        };

        let aws = Arc::new(ScriptedProvider::new("aws-main", ProviderKind::Aws));
        let mut registry = ProviderRegistry::new();
        registry
            .register(Arc::new(LocalProvider::new(&lab_config(), &deps)) as Arc<dyn Provider>)
            .unwrap_or_else(|err| panic!("register lab: {err}"));
        registry
            .register(Arc::clone(&aws) as Arc<dyn Provider>)
            .unwrap_or_else(|err| panic!("register aws: {err}"));

        let ctx = Orchestrator::assemble(
            CoreConfig::default(),
            Arc::clone(&store) as Arc<dyn JobStore>,
            registry,
            Arc::clone(&clock) as Arc<dyn Clock>,
            monkeyfs,
        );
        Self {
            _tmp: tmp,
            _health: health,
            store,
            clock,
            remote,
            aws,
            ctx,
        }
    }

    /// Runs one reconciliation pass and waits for the dispatches it started.
    pub async fn pass(&self) -> PassReport {
        let report = self.ctx.reconciler().run_pass().await;
        self.ctx.pool().wait_idle().await;
        report
    }

    pub fn state(&self, job_uid: &str) -> JobState {
        self.store
            .load(job_uid)
            .unwrap_or_else(|err| panic!("load {job_uid}: {err}"))
            .state()
    }

    /// Remote steps run so far, without the hyperparameter probes.
    pub fn steps(&self) -> Vec<String> {
        self.remote
            .steps()
            .into_iter()
            .filter(|step| step != "fetch_hyperparameters")
            .collect()
    }
}

fn lab_config() -> LocalProviderConfig {
    LocalProviderConfig {
        name: String::from("lab"),
        monkeyfs_path: None,
        hosts: vec![LocalHost {
            name: String::from("gpu-box"),
            address: String::from("127.0.0.1"),
            scratch_dir: Utf8PathBuf::from("/scratch"),
            monkeyfs_dir: Utf8PathBuf::from("/mnt/monkeyfs"),
            ssh_user: None,
        }],
    }
}

/// `echo hi` on the lab host with the current directory as its codebase.
pub fn local_spec(job_uid: &str) -> JobSpec {
    JobSpec {
        code: vec![CodeItem {
            run_name: String::from("hello"),
            checksum: String::from("c0ffee"),
            extension: String::from("tar"),
            provider: Some(String::from("lab")),
            path: Some(String::from(".")),
        }],
        instance: MachineParams {
            name: Some(String::from("gpu-box")),
            ..MachineParams::default()
        },
        ..job_spec(job_uid, "lab")
    }
}

pub fn cloud_spec(job_uid: &str) -> JobSpec {
    job_spec(job_uid, "aws-main")
}
