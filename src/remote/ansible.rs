//! Runner that maps operations onto `ansible` and `ansible-playbook`
//! invocations.

use std::ffi::OsString;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use super::{
    CancelCheck, CommandOutput, CommandRunner, OperationOutcome, OperationSpec, RemoteFuture,
    RemoteHost, RemoteRunner, Vars, run_blocking,
};

/// Shells out to the provisioning tool through a [`CommandRunner`].
#[derive(Clone, Debug)]
pub struct AnsibleRunner {
    runner: Arc<dyn CommandRunner>,
    ansible_bin: String,
    playbook_bin: String,
    ansible_dir: Utf8PathBuf,
}

impl AnsibleRunner {
    /// Creates a runner that resolves roles and playbooks under `ansible_dir`.
    #[must_use]
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        ansible_bin: impl Into<String>,
        playbook_bin: impl Into<String>,
        ansible_dir: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            runner,
            ansible_bin: ansible_bin.into(),
            playbook_bin: playbook_bin.into(),
            ansible_dir: ansible_dir.into(),
        }
    }

    /// Provisioning tree the runner resolves roles and playbooks against.
    #[must_use]
    pub fn ansible_dir(&self) -> &Utf8Path {
        &self.ansible_dir
    }

    /// Returns the program and arguments for an operation.
    #[must_use]
    pub fn command_for(
        &self,
        host: &RemoteHost,
        operation: &OperationSpec,
        vars: &Vars,
    ) -> (String, Vec<OsString>) {
        let mut extra = vars.clone();
        if let Some(user) = &host.user {
            extra
                .entry("ansible_user")
                .or_insert_with(|| serde_json::Value::String(user.clone()));
        }
        let extra_vars = serde_json::Value::Object(extra).to_string();

        match operation {
            OperationSpec::Playbook { path } => {
                let playbook = self.ansible_dir.join(path);
                let args = vec![
                    OsString::from("-i"),
                    OsString::from(&host.inventory),
                    OsString::from("--limit"),
                    OsString::from(&host.pattern),
                    OsString::from("-e"),
                    OsString::from(extra_vars),
                    OsString::from(playbook.as_str()),
                ];
                (self.playbook_bin.clone(), args)
            }
            OperationSpec::Role { name } => {
                let role = self.ansible_dir.join("roles").join(name);
                self.adhoc(host, "include_role", &format!("name={role}"), extra_vars)
            }
            OperationSpec::Module { name, args } => self.adhoc(host, name, args, extra_vars),
            OperationSpec::Shell { command } => self.adhoc(host, "shell", command, extra_vars),
        }
    }

    fn adhoc(
        &self,
        host: &RemoteHost,
        module: &str,
        module_args: &str,
        extra_vars: String,
    ) -> (String, Vec<OsString>) {
        let args = vec![
            OsString::from(&host.pattern),
            OsString::from("-i"),
            OsString::from(&host.inventory),
            OsString::from("-m"),
            OsString::from(module),
            OsString::from("-a"),
            OsString::from(module_args),
            OsString::from("-e"),
            OsString::from(extra_vars),
        ];
        (self.ansible_bin.clone(), args)
    }
}

fn outcome_from(output: &CommandOutput) -> OperationOutcome {
    let events = output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToOwned::to_owned)
        .collect();
    if output.is_success() {
        OperationOutcome::success(events)
    } else {
        OperationOutcome {
            events,
            ..OperationOutcome::failed(output.stderr.trim())
        }
    }
}

impl RemoteRunner for AnsibleRunner {
    fn run<'a>(
        &'a self,
        host: &'a RemoteHost,
        operation: &'a OperationSpec,
        vars: &'a Vars,
        cancelled: CancelCheck<'a>,
    ) -> RemoteFuture<'a, OperationOutcome> {
        Box::pin(async move {
            if cancelled() {
                return Ok(OperationOutcome::failed("cancelled before start"));
            }
            let (program, args) = self.command_for(host, operation, vars);
            let output = run_blocking(&self.runner, program, args).await?;
            Ok(outcome_from(&output))
        })
    }
}
