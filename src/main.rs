//! Binary entry point for the Monkey orchestrator.

use std::io::{self, Write};
use std::process;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use clap::Parser;
use serde::Serialize;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use monkey_core::{
    ConfigError, ContextError, CoreConfig, JobSpec, Orchestrator, ProviderConfig, ProviderStore,
    ProviderStoreError, StoreError, api,
};

mod cli;

use cli::{AddProviderCommand, Cli, DaemonCommand, ProvidersAction, SubmitCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Providers(#[from] ProviderStoreError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to read {path}: {message}")]
    Read { path: Utf8PathBuf, message: String },
    #[error("invalid {what} in {path}: {message}")]
    Decode {
        path: Utf8PathBuf,
        what: &'static str,
        message: String,
    },
    #[error("failed to write output: {0}")]
    Output(String),
    #[error("submission rejected: {0}")]
    Rejected(String),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    match cli {
        Cli::Daemon(command) => run_daemon(&command).await,
        Cli::Jobs => print_jobs(),
        Cli::Submit(command) => submit(&command).await,
        Cli::Providers(command) => match command.action {
            None => print_providers(),
            Some(ProvidersAction::Add(add)) => add_provider(&add),
        },
    }
}

fn orchestrator() -> Result<Orchestrator, CliError> {
    let config = CoreConfig::load_without_cli_args()?;
    let providers = ProviderStore::new().list_providers()?;
    Ok(Orchestrator::from_config(config, &providers)?)
}

async fn run_daemon(command: &DaemonCommand) -> Result<(), CliError> {
    let ctx = orchestrator()?;
    if command.once {
        let report = ctx.reconciler().run_pass().await;
        ctx.pool().wait_idle().await;
        tracing::info!(
            dispatched = report.dispatched.len(),
            requeued = report.requeued.len(),
            failures = report.failures,
            "single pass complete"
        );
        return Ok(());
    }

    tracing::info!(
        interval_secs = ctx.reconciler().settings().interval.as_secs(),
        providers = ctx.providers().all().len(),
        "daemon started"
    );
    ctx.reconciler().daemon_loop(shutdown_signal()).await;
    tracing::info!(in_flight = ctx.pool().active(), "daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "cannot listen for ctrl-c, running until killed");
        std::future::pending::<()>().await;
    }
}

fn print_jobs() -> Result<(), CliError> {
    let ctx = orchestrator()?;
    let jobs = api::list_jobs(&ctx)?;
    write_json(&jobs)
}

async fn submit(command: &SubmitCommand) -> Result<(), CliError> {
    let ctx = orchestrator()?;
    let path = Utf8Path::new(&command.spec);
    let spec = parse_spec(path, &read_file(path)?, || ctx.next_job_uid())?;
    let response = api::submit_job(&ctx, spec).await;
    write_json(&response)?;
    if response.success {
        Ok(())
    } else {
        Err(CliError::Rejected(response.msg))
    }
}

fn print_providers() -> Result<(), CliError> {
    let providers = ProviderStore::new().list_providers()?;
    write_json(&providers)
}

fn add_provider(command: &AddProviderCommand) -> Result<(), CliError> {
    let path = Utf8Path::new(&command.definition);
    let provider: ProviderConfig =
        serde_json::from_str(&read_file(path)?).map_err(|err| CliError::Decode {
            path: path.to_path_buf(),
            what: "provider definition",
            message: err.to_string(),
        })?;
    let written = ProviderStore::new().add_provider(&provider, command.force)?;
    writeln!(
        io::stdout().lock(),
        "saved provider {} to {written}",
        provider.name()
    )
    .map_err(|err| CliError::Output(err.to_string()))
}

fn parse_spec(
    path: &Utf8Path,
    contents: &str,
    next_uid: impl FnOnce() -> String,
) -> Result<JobSpec, CliError> {
    let mut spec: JobSpec = serde_json::from_str(contents).map_err(|err| CliError::Decode {
        path: path.to_path_buf(),
        what: "job spec",
        message: err.to_string(),
    })?;
    if spec.job_uid.trim().is_empty() {
        spec.job_uid = next_uid();
    }
    Ok(spec)
}

fn read_file(path: &Utf8Path) -> Result<String, CliError> {
    let read_error = |message: String| CliError::Read {
        path: path.to_path_buf(),
        message,
    };
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| read_error(String::from("path has no file name")))?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| read_error(err.to_string()))?;
    dir.read_to_string(file_name)
        .map_err(|err| read_error(err.to_string()))
}

fn write_json<T: Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    let rendered =
        serde_json::to_string_pretty(value).map_err(|err| CliError::Output(err.to_string()))?;
    writeln!(io::stdout().lock(), "{rendered}").map_err(|err| CliError::Output(err.to_string()))
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_job_uid_is_filled_in() {
        let spec = parse_spec(
            Utf8Path::new("job.json"),
            r#"{"provider": "lab", "cmd": "echo hi"}"#,
            || String::from("monkey-24-05-01-0-abc"),
        )
        .unwrap_or_else(|err| panic!("parse spec: {err}"));

        assert_eq!(spec.job_uid, "monkey-24-05-01-0-abc");
        assert_eq!(spec.provider, "lab");
    }

    #[test]
    fn explicit_job_uid_is_kept() {
        let spec = parse_spec(
            Utf8Path::new("job.json"),
            r#"{"job_uid": "monkey-24-05-01-3-xyz", "provider": "lab", "cmd": "true"}"#,
            || panic!("uid should not be generated"),
        )
        .unwrap_or_else(|err| panic!("parse spec: {err}"));

        assert_eq!(spec.job_uid, "monkey-24-05-01-3-xyz");
    }

    #[test]
    fn malformed_spec_names_the_file() {
        let err = parse_spec(Utf8Path::new("job.json"), "{", String::new).err();

        assert!(
            matches!(err, Some(CliError::Decode { ref path, what: "job spec", .. }) if path == "job.json"),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn missing_file_is_reported() {
        let err = read_file(Utf8Path::new("./does-not-exist/job.json")).err();

        assert!(matches!(err, Some(CliError::Read { .. })), "unexpected error: {err:?}");
    }

    #[test]
    fn write_error_writes_cli_error() {
        let mut buf = Vec::new();
        write_error(&mut buf, &CliError::Rejected(String::from("provider azure is not configured")));
        let rendered = String::from_utf8(buf).unwrap_or_else(|err| panic!("utf8: {err}"));

        assert!(
            rendered.contains("submission rejected: provider azure is not configured"),
            "rendered: {rendered}"
        );
    }
}
