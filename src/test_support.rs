//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{MutexGuard as AsyncMutexGuard, Notify};
use tokio::task::JoinHandle;

use crate::instance::{
    HealthFuture, Instance, InstanceDetails, InstanceError, InstanceFuture,
};
use crate::job::{JobRecord, JobSpec, JobState, MachineParams};
use crate::provider::{
    Provider, ProviderError, ProviderFuture, ProviderKind, ProviderSettings,
};
use crate::remote::{
    CancelCheck, CommandError, CommandOutput, CommandRunner, OperationOutcome, OperationSpec,
    RemoteError, RemoteFuture, RemoteHost, RemoteRunner, Vars,
};
use crate::store::{JobStore, MemoryJobStore, RecordUpdate, StoreError};

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

#[derive(Debug, Default)]
struct ScriptedCommands {
    responses: VecDeque<CommandOutput>,
    invocations: Vec<CommandInvocation>,
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Clones share the same script, so a test can keep one handle while the
/// code under test owns another.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    state: Arc<Mutex<ScriptedCommands>>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        locked(&self.state).invocations.clone()
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        locked(&self.state).responses.push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        let mut state = locked(&self.state);
        state.invocations.push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        state.responses.pop_front().ok_or_else(|| CommandError {
            program: program.to_owned(),
            message: String::from("no scripted response available"),
        })
    }
}

/// One operation received by [`ScriptedRemoteRunner`].
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteCall {
    /// Targeted host.
    pub host: RemoteHost,
    /// Operation issued.
    pub operation: OperationSpec,
    /// Variables passed with the operation.
    pub vars: Vars,
}

impl RemoteCall {
    /// Step name carried in the `monkey_step` variable.
    #[must_use]
    pub fn step(&self) -> Option<&str> {
        self.vars.get("monkey_step").and_then(serde_json::Value::as_str)
    }

    fn matches(&self, pattern: &str) -> bool {
        self.step() == Some(pattern) || self.operation.to_string().contains(pattern)
    }
}

#[derive(Debug, Default)]
struct ScriptedRemote {
    calls: Vec<RemoteCall>,
    failures: Vec<(String, Option<usize>)>,
    responses: Vec<(String, Vec<String>)>,
    holds: Vec<(String, Arc<StepGate>)>,
}

/// Holds one scripted operation open until the test releases it.
#[derive(Debug, Default)]
pub struct StepGate {
    entered: Notify,
    released: Notify,
}

impl StepGate {
    /// Waits until the held operation has started.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Lets the held operation return.
    pub fn release(&self) {
        self.released.notify_one();
    }
}

/// Remote runner double that records every operation and succeeds unless
/// told otherwise.
///
/// Patterns match either the `monkey_step` variable exactly or any part of
/// the operation's description.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRemoteRunner {
    state: Arc<Mutex<ScriptedRemote>>,
}

impl ScriptedRemoteRunner {
    /// Creates a runner that succeeds on every operation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every operation matching `pattern`.
    pub fn fail_matching(&self, pattern: &str) {
        locked(&self.state)
            .failures
            .push((pattern.to_owned(), None));
    }

    /// Fails the next `times` operations matching `pattern`.
    pub fn fail_times(&self, pattern: &str, times: usize) {
        locked(&self.state)
            .failures
            .push((pattern.to_owned(), Some(times)));
    }

    /// Reports `events` for successful operations matching `pattern`.
    pub fn respond_with(&self, pattern: &str, events: &[&str]) {
        locked(&self.state).responses.push((
            pattern.to_owned(),
            events.iter().map(|event| (*event).to_owned()).collect(),
        ));
    }

    /// Holds the next operation matching `pattern` until the returned gate
    /// is released.
    #[must_use]
    pub fn hold(&self, pattern: &str) -> Arc<StepGate> {
        let gate = Arc::new(StepGate::default());
        locked(&self.state)
            .holds
            .push((pattern.to_owned(), Arc::clone(&gate)));
        gate
    }

    fn take_hold(&self, call: &RemoteCall) -> Option<Arc<StepGate>> {
        let mut state = locked(&self.state);
        let position = state
            .holds
            .iter()
            .position(|(pattern, _)| call.matches(pattern))?;
        Some(state.holds.remove(position).1)
    }

    /// Snapshot of every operation received.
    #[must_use]
    pub fn calls(&self) -> Vec<RemoteCall> {
        locked(&self.state).calls.clone()
    }

    /// `monkey_step` values of every operation received, in order.
    #[must_use]
    pub fn steps(&self) -> Vec<String> {
        locked(&self.state)
            .calls
            .iter()
            .filter_map(|call| call.step().map(ToOwned::to_owned))
            .collect()
    }

    fn outcome_for(&self, call: RemoteCall) -> OperationOutcome {
        let mut state = locked(&self.state);
        let failing = state.failures.iter_mut().find(|(pattern, remaining)| {
            call.matches(pattern) && remaining.is_none_or(|count| count > 0)
        });
        let outcome = if let Some((_, remaining)) = failing {
            if let Some(count) = remaining.as_mut() {
                *count = count.saturating_sub(1);
            }
            OperationOutcome::failed("simulated failure")
        } else {
            let events = state
                .responses
                .iter()
                .find(|(pattern, _)| call.matches(pattern))
                .map(|(_, events)| events.clone())
                .unwrap_or_default();
            OperationOutcome::success(events)
        };
        state.calls.push(call);
        outcome
    }
}

impl RemoteRunner for ScriptedRemoteRunner {
    fn run<'a>(
        &'a self,
        host: &'a RemoteHost,
        operation: &'a OperationSpec,
        vars: &'a Vars,
        _cancelled: CancelCheck<'a>,
    ) -> RemoteFuture<'a, OperationOutcome> {
        let call = RemoteCall {
            host: host.clone(),
            operation: operation.clone(),
            vars: vars.clone(),
        };
        let hold = self.take_hold(&call);
        let outcome = self.outcome_for(call);
        Box::pin(async move {
            if let Some(gate) = hold {
                gate.entered.notify_one();
                gate.released.notified().await;
            }
            Ok(outcome)
        })
    }
}

/// In-memory instance whose operations succeed unless told otherwise.
///
/// Cloud-kind instances report themselves terminated after a successful
/// cleanup, and [`ScriptedProvider`] stops listing them.
#[derive(Debug)]
pub struct ScriptedInstance {
    name: String,
    kind: ProviderKind,
    online: AtomicBool,
    terminated: AtomicBool,
    probes: AtomicUsize,
    failing: Mutex<BTreeSet<String>>,
    calls: Mutex<Vec<String>>,
    hyperparameters: Mutex<Option<serde_json::Value>>,
    run_gate: Mutex<Option<Arc<Notify>>>,
}

impl ScriptedInstance {
    /// Creates a healthy local instance.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self::with_kind(name, ProviderKind::Local)
    }

    /// Creates a healthy instance of the given kind.
    #[must_use]
    pub fn with_kind(name: &str, kind: ProviderKind) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            online: AtomicBool::new(true),
            terminated: AtomicBool::new(false),
            probes: AtomicUsize::new(0),
            failing: Mutex::new(BTreeSet::new()),
            calls: Mutex::new(Vec::new()),
            hyperparameters: Mutex::new(None),
            run_gate: Mutex::new(None),
        }
    }

    /// Sets the health check result.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Makes every call of `operation` fail, e.g. `setup_job`.
    pub fn fail(&self, operation: &str) {
        locked(&self.failing).insert(operation.to_owned());
    }

    /// Lets `operation` succeed again.
    pub fn succeed(&self, operation: &str) {
        locked(&self.failing).remove(operation);
    }

    /// Serves `value` from the hyperparameter file.
    pub fn set_hyperparameters(&self, value: serde_json::Value) {
        *locked(&self.hyperparameters) = Some(value);
    }

    /// Makes `run_job` wait until the returned handle is notified.
    #[must_use]
    pub fn hold_run(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *locked(&self.run_gate) = Some(Arc::clone(&gate));
        gate
    }

    /// Operations invoked so far, e.g. `install_dependency conda`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        locked(&self.calls).clone()
    }

    /// Health checks performed so far.
    #[must_use]
    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Returns `true` once a cloud instance has been cleaned up.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn invoke(&self, step: &'static str, detail: Option<&str>) -> Result<(), InstanceError> {
        let call = detail.map_or_else(|| step.to_owned(), |extra| format!("{step} {extra}"));
        locked(&self.calls).push(call);
        if locked(&self.failing).contains(step) {
            return Err(InstanceError::Remote {
                instance: self.name.clone(),
                step,
                source: RemoteError::Failed {
                    operation: step.to_owned(),
                    message: String::from("simulated failure"),
                },
            });
        }
        Ok(())
    }
}

impl Instance for ScriptedInstance {
    fn name(&self) -> &str {
        &self.name
    }

    fn ip_address(&self) -> Option<IpAddr> {
        Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn details(&self) -> InstanceDetails {
        InstanceDetails {
            name: self.name.clone(),
            provider_type: self.kind,
            ip_address: self.ip_address(),
            location: String::from("scripted"),
            offline_count: 0,
        }
    }

    fn check_online(&self) -> HealthFuture<'_> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let online = self.online.load(Ordering::SeqCst) && !self.is_terminated();
        Box::pin(async move { online })
    }

    fn install_dependency<'a>(&'a self, name: &'a str) -> InstanceFuture<'a, ()> {
        Box::pin(async move { self.invoke("install_dependency", Some(name)) })
    }

    fn mount_shared_filesystem<'a>(
        &'a self,
        _spec: &'a JobSpec,
        _settings: &'a ProviderSettings,
    ) -> InstanceFuture<'a, ()> {
        Box::pin(async move { self.invoke("mount_shared_filesystem", None) })
    }

    fn setup_job<'a>(
        &'a self,
        spec: &'a JobSpec,
        _settings: &'a ProviderSettings,
    ) -> InstanceFuture<'a, ()> {
        Box::pin(async move { self.invoke("setup_job", Some(&spec.job_uid)) })
    }

    fn run_job<'a>(
        &'a self,
        spec: &'a JobSpec,
        _settings: &'a ProviderSettings,
    ) -> InstanceFuture<'a, ()> {
        Box::pin(async move {
            let gate = locked(&self.run_gate).clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            self.invoke("run_job", Some(&spec.job_uid))
        })
    }

    fn cleanup_job<'a>(
        &'a self,
        spec: &'a JobSpec,
        _settings: &'a ProviderSettings,
    ) -> InstanceFuture<'a, ()> {
        Box::pin(async move {
            self.invoke("cleanup_job", Some(&spec.job_uid))?;
            if self.kind.owns_instance_lifecycle() {
                self.terminated.store(true, Ordering::SeqCst);
            }
            Ok(())
        })
    }

    fn fetch_hyperparameters<'a>(
        &'a self,
        _spec: &'a JobSpec,
    ) -> InstanceFuture<'a, Option<serde_json::Value>> {
        Box::pin(async move {
            self.invoke("fetch_hyperparameters", None)?;
            Ok(locked(&self.hyperparameters).clone())
        })
    }
}

/// Provider double backed by [`ScriptedInstance`]s.
///
/// Cloud-kind providers create a fresh instance named after the job; local
/// providers hand out hosts registered with [`ScriptedProvider::add_host`].
#[derive(Debug)]
pub struct ScriptedProvider {
    name: String,
    kind: ProviderKind,
    valid: bool,
    monkeyfs: Utf8PathBuf,
    instances: Mutex<BTreeMap<String, Arc<ScriptedInstance>>>,
    fail_creates: AtomicBool,
    create_calls: AtomicUsize,
}

impl ScriptedProvider {
    /// Creates a valid provider.
    #[must_use]
    pub fn new(name: &str, kind: ProviderKind) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            valid: true,
            monkeyfs: Utf8PathBuf::from("/srv/monkeyfs"),
            instances: Mutex::new(BTreeMap::new()),
            fail_creates: AtomicBool::new(false),
            create_calls: AtomicUsize::new(0),
        }
    }

    /// Creates a provider that reports itself invalid.
    #[must_use]
    pub fn invalid(name: &str, kind: ProviderKind) -> Self {
        Self {
            valid: false,
            ..Self::new(name, kind)
        }
    }

    /// Registers a healthy host and returns it.
    pub fn add_host(&self, name: &str) -> Arc<ScriptedInstance> {
        let instance = Arc::new(ScriptedInstance::with_kind(name, self.kind));
        locked(&self.instances).insert(name.to_owned(), Arc::clone(&instance));
        instance
    }

    /// Looks up a host or created instance, including terminated ones.
    #[must_use]
    pub fn instance(&self, name: &str) -> Option<Arc<ScriptedInstance>> {
        locked(&self.instances).get(name).map(Arc::clone)
    }

    /// Makes every `create_instance` call fail.
    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Number of `create_instance` calls so far.
    #[must_use]
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    fn live(&self, name: &str) -> Option<Arc<dyn Instance>> {
        self.instance(name)
            .filter(|instance| !instance.is_terminated())
            .map(|instance| instance as Arc<dyn Instance>)
    }
}

impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn is_valid(&self) -> bool {
        self.valid
    }

    fn settings(&self) -> ProviderSettings {
        ProviderSettings {
            name: self.name.clone(),
            kind: self.kind,
            credential_file: None,
            region: None,
            zone: None,
            project: None,
            storage_name: Some(String::from("scripted-bucket")),
            local_monkeyfs_path: self.monkeyfs.clone(),
        }
    }

    fn local_filesystem_path(&self) -> &Utf8Path {
        &self.monkeyfs
    }

    fn create_instance<'a>(
        &'a self,
        machine: &'a MachineParams,
        spec: &'a JobSpec,
    ) -> ProviderFuture<'a, Arc<dyn Instance>> {
        Box::pin(async move {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_creates.load(Ordering::SeqCst) {
                return Err(ProviderError::NotReady {
                    instance: spec.job_uid.clone(),
                    attempts: 1,
                });
            }
            if self.kind.owns_instance_lifecycle() {
                return Ok(self.add_host(&spec.job_uid) as Arc<dyn Instance>);
            }
            let name = machine
                .name
                .as_deref()
                .ok_or(ProviderError::MissingHostName)?;
            self.live(name)
                .ok_or_else(|| ProviderError::UnknownHost(name.to_owned()))
        })
    }

    fn get_instance<'a>(&'a self, name: &'a str) -> ProviderFuture<'a, Option<Arc<dyn Instance>>> {
        Box::pin(async move { Ok(self.live(name)) })
    }

    fn list_instances(&self) -> ProviderFuture<'_, Vec<Arc<dyn Instance>>> {
        Box::pin(async move {
            let names: Vec<String> = locked(&self.instances).keys().cloned().collect();
            Ok(names.iter().filter_map(|name| self.live(name)).collect())
        })
    }
}

/// Minimal HTTP server answering every request with `200 OK`, standing in
/// for an instance's health endpoint.
#[derive(Debug)]
pub struct HealthStub {
    port: u16,
    task: JoinHandle<()>,
}

impl HealthStub {
    /// Binds an ephemeral port on the loopback interface and starts serving.
    ///
    /// # Panics
    ///
    /// Panics when no loopback port can be bound.
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .await
            .unwrap_or_else(|err| panic!("bind health stub: {err}"));
        let port = listener
            .local_addr()
            .unwrap_or_else(|err| panic!("health stub address: {err}"))
            .port();
        let task = tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buffer = [0_u8; 1024];
                    if socket.read(&mut buffer).await.is_ok() {
                        let response =
                            b"HTTP/1.1 200 OK\r\ncontent-length: 4\r\nconnection: close\r\n\r\npong";
                        if socket.write_all(response).await.is_ok() {
                            drop(socket.shutdown().await);
                        }
                    }
                });
            }
        });
        Self { port, task }
    }

    /// Port the stub listens on.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for HealthStub {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Returns a loopback port with nothing listening on it.
///
/// # Panics
///
/// Panics when no loopback port can be bound.
#[must_use]
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .unwrap_or_else(|err| panic!("bind probe port: {err}"));
    listener
        .local_addr()
        .unwrap_or_else(|err| panic!("probe port address: {err}"))
        .port()
}

/// In-memory store that records every state a job passes through.
#[derive(Debug, Default)]
pub struct RecordingStore {
    inner: MemoryJobStore,
    history: Mutex<Vec<(String, JobState)>>,
}

impl RecordingStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// States `job_uid` has been persisted in, starting with its inserted
    /// state.
    #[must_use]
    pub fn states(&self, job_uid: &str) -> Vec<JobState> {
        locked(&self.history)
            .iter()
            .filter(|(uid, _)| uid == job_uid)
            .map(|(_, state)| *state)
            .collect()
    }
}

impl JobStore for RecordingStore {
    fn insert(&self, record: &JobRecord) -> Result<(), StoreError> {
        self.inner.insert(record)?;
        locked(&self.history).push((record.job_uid.clone(), record.state()));
        Ok(())
    }

    fn load(&self, job_uid: &str) -> Result<JobRecord, StoreError> {
        self.inner.load(job_uid)
    }

    fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
        self.inner.list()
    }

    fn update(&self, job_uid: &str, apply: RecordUpdate<'_>) -> Result<JobRecord, StoreError> {
        let mut history = locked(&self.history);
        let before = self.inner.load(job_uid)?.state();
        let record = self.inner.update(job_uid, apply)?;
        if record.state() != before {
            history.push((job_uid.to_owned(), record.state()));
        }
        Ok(record)
    }
}

/// Minimal valid job bound to `provider`.
#[must_use]
pub fn job_spec(job_uid: &str, provider: &str) -> JobSpec {
    JobSpec {
        job_uid: job_uid.to_owned(),
        provider: provider.to_owned(),
        cmd: String::from("echo hi"),
        ..JobSpec::default()
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
