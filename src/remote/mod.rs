//! Remote operation execution with per-instance generation tokens.
//!
//! Every operation against an instance is issued through a
//! [`GuardedRunner`], which mints a fresh generation for the instance before
//! the call and discards the result if a newer operation for the same
//! instance started in the meantime. This is a same-process staleness guard,
//! not a distributed lock.

mod ansible;
mod command;
mod generation;

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use camino::Utf8PathBuf;
use serde::Serialize;
use thiserror::Error;

pub use ansible::AnsibleRunner;
pub use command::{
    CommandError, CommandOutput, CommandRunner, ProcessCommandRunner, run_blocking,
};
pub use generation::{GenerationToken, GenerationTracker, GuardedRunner};

/// Variables passed to a remote operation.
pub type Vars = serde_json::Map<String, serde_json::Value>;

/// Future returned by remote runners.
pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RemoteError>> + Send + 'a>>;

/// Predicate a runner may poll to learn that its result will be discarded.
pub type CancelCheck<'a> = &'a (dyn Fn() -> bool + Send + Sync);

/// Operation executed against a host.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OperationSpec {
    /// Reusable role from the provisioning tree, e.g. `install/conda`.
    Role {
        /// Role path relative to the roles directory.
        name: String,
    },
    /// Single module invocation.
    Module {
        /// Module name, e.g. `file` or `unarchive`.
        name: String,
        /// Module arguments in `key=value` form.
        args: String,
    },
    /// Full playbook relative to the provisioning directory.
    Playbook {
        /// Playbook path.
        path: Utf8PathBuf,
    },
    /// Raw shell command.
    Shell {
        /// Command line executed by the remote shell.
        command: String,
    },
}

impl OperationSpec {
    /// Builds a role operation.
    #[must_use]
    pub fn role(name: impl Into<String>) -> Self {
        Self::Role { name: name.into() }
    }

    /// Builds a module operation.
    #[must_use]
    pub fn module(name: impl Into<String>, args: impl Into<String>) -> Self {
        Self::Module {
            name: name.into(),
            args: args.into(),
        }
    }

    /// Builds a playbook operation.
    #[must_use]
    pub fn playbook(path: impl Into<Utf8PathBuf>) -> Self {
        Self::Playbook { path: path.into() }
    }

    /// Builds a shell operation.
    #[must_use]
    pub fn shell(command: impl Into<String>) -> Self {
        Self::Shell {
            command: command.into(),
        }
    }
}

impl fmt::Display for OperationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Role { name } => write!(f, "role {name}"),
            Self::Module { name, .. } => write!(f, "module {name}"),
            Self::Playbook { path } => write!(f, "playbook {path}"),
            Self::Shell { command } => write!(f, "shell `{command}`"),
        }
    }
}

/// Host an operation targets.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct RemoteHost {
    /// Host pattern matched against the inventory.
    pub pattern: String,
    /// Inventory source: a file path or a comma-terminated host list.
    pub inventory: String,
    /// Remote login user, when the inventory does not set one.
    pub user: Option<String>,
}

impl RemoteHost {
    /// Targets a single address through an inline inventory.
    #[must_use]
    pub fn address(address: impl Into<String>, user: Option<String>) -> Self {
        let pattern = address.into();
        Self {
            inventory: format!("{pattern},"),
            pattern,
            user,
        }
    }

    /// Targets the control node itself, used for cloud teardown playbooks.
    #[must_use]
    pub fn control_node() -> Self {
        Self {
            pattern: String::from("localhost"),
            inventory: String::from("localhost,"),
            user: None,
        }
    }
}

/// Final status reported by a runner.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    /// Operation completed.
    Success,
    /// Operation reported a failure.
    Failed,
}

/// Result of one remote operation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct OperationOutcome {
    /// Final status.
    pub status: OutcomeStatus,
    /// Non-empty output lines reported by the runner.
    pub events: Vec<String>,
    /// Captured error output.
    pub stderr: String,
}

impl OperationOutcome {
    /// Builds a successful outcome with the given events.
    #[must_use]
    pub fn success(events: Vec<String>) -> Self {
        Self {
            status: OutcomeStatus::Success,
            events,
            stderr: String::new(),
        }
    }

    /// Builds a failed outcome with the given error text.
    #[must_use]
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Failed,
            events: Vec::new(),
            stderr: stderr.into(),
        }
    }

    /// Returns `true` when the operation succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

/// Failure of a remote operation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RemoteError {
    /// The runner could not be started.
    #[error(transparent)]
    Spawn(#[from] CommandError),
    /// The operation ran and reported failure.
    #[error("{operation} failed: {message}")]
    Failed {
        /// Operation description.
        operation: String,
        /// Error text from the runner.
        message: String,
    },
    /// A newer operation for the same instance started while this one ran.
    #[error("{operation} superseded by generation {current} (issued {issued})")]
    Superseded {
        /// Operation description.
        operation: String,
        /// Generation captured when the operation started.
        issued: u64,
        /// Generation current when the operation finished.
        current: u64,
    },
}

/// Executes operations against hosts.
pub trait RemoteRunner: Send + Sync + fmt::Debug {
    /// Runs `operation` against `host` with `vars`.
    ///
    /// Runners may consult `cancelled` before or during execution and stop
    /// early; the caller discards stale results regardless.
    fn run<'a>(
        &'a self,
        host: &'a RemoteHost,
        operation: &'a OperationSpec,
        vars: &'a Vars,
        cancelled: CancelCheck<'a>,
    ) -> RemoteFuture<'a, OperationOutcome>;
}
