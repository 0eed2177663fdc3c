//! Local process execution for the provisioning tool and inventory scripts.

use std::ffi::OsString;
use std::fmt::Debug;
use std::process::Command;
use std::sync::Arc;

use thiserror::Error;

/// Captured result of one `ansible*` process.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code, absent when the process was killed by a signal.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the process exited with status zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// One-line failure summary naming `program` and its exit status.
    #[must_use]
    pub fn failure_summary(&self, program: &str) -> String {
        let status = self
            .code
            .map_or_else(|| String::from("signal"), |code| code.to_string());
        format!("{program} exited with {status}: {}", self.stderr.trim())
    }
}

/// Raised when a process cannot be started or its worker thread is lost.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("failed to run {program}: {message}")]
pub struct CommandError {
    /// Program that was being run.
    pub program: String,
    /// Underlying failure.
    pub message: String,
}

/// Synchronous process execution, swapped for a scripted runner in tests.
pub trait CommandRunner: Send + Sync + Debug {
    /// Runs `program` with `args` to completion, capturing both streams.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the process cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError>;
}

/// Spawns real processes on the orchestrator host.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| CommandError {
                program: program.to_owned(),
                message: err.to_string(),
            })?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Runs a command on the blocking pool so the reconciliation loop keeps
/// polling while a playbook runs.
///
/// # Errors
///
/// Returns [`CommandError`] when the process cannot start or the blocking
/// task panics.
pub async fn run_blocking(
    runner: &Arc<dyn CommandRunner>,
    program: String,
    args: Vec<OsString>,
) -> Result<CommandOutput, CommandError> {
    let worker = Arc::clone(runner);
    let label = program.clone();
    tokio::task::spawn_blocking(move || worker.run(&program, &args))
        .await
        .map_err(|err| CommandError {
            program: label,
            message: err.to_string(),
        })?
}
