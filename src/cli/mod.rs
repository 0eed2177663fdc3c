//! Command-line interface definitions for the `monkey-core` binary.
//!
//! The parser lives here so both the binary and the build script can reuse
//! it when generating the manual page.

use clap::{Args, Parser, Subcommand};

/// Top-level CLI for the `monkey-core` binary.
#[derive(Debug, Parser)]
#[command(
    name = "monkey-core",
    about = "Dispatch jobs onto cloud and local machines and keep them reconciled",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Run the reconciliation loop until interrupted.
    #[command(name = "daemon", about = "Run the reconciliation loop until interrupted")]
    Daemon(DaemonCommand),
    /// Print persisted jobs as JSON.
    #[command(name = "jobs", about = "Print persisted jobs as JSON")]
    Jobs,
    /// Submit a job spec read from a JSON file.
    #[command(name = "submit", about = "Submit a job spec read from a JSON file")]
    Submit(SubmitCommand),
    /// Print or add configured providers.
    #[command(name = "providers", about = "Print or add configured providers")]
    Providers(ProvidersCommand),
}

/// Arguments for the `monkey-core daemon` subcommand.
#[derive(Debug, Args)]
pub(crate) struct DaemonCommand {
    /// Run a single reconciliation pass and exit.
    #[arg(long)]
    pub(crate) once: bool,
}

/// Arguments for the `monkey-core submit` subcommand.
#[derive(Debug, Args)]
pub(crate) struct SubmitCommand {
    /// Path to the job spec. A missing `job_uid` is filled in.
    #[arg(value_name = "PATH")]
    pub(crate) spec: String,
}

/// Arguments for the `monkey-core providers` subcommand.
#[derive(Debug, Args)]
pub(crate) struct ProvidersCommand {
    /// Optional action; lists providers when omitted.
    #[command(subcommand)]
    pub(crate) action: Option<ProvidersAction>,
}

/// Actions on the provider tables.
#[derive(Debug, Subcommand)]
pub(crate) enum ProvidersAction {
    /// Add a provider described by a JSON file.
    #[command(name = "add", about = "Add a provider described by a JSON file")]
    Add(AddProviderCommand),
}

/// Arguments for `monkey-core providers add`.
#[derive(Debug, Args)]
pub(crate) struct AddProviderCommand {
    /// Replace an existing provider of the same type.
    #[arg(long)]
    pub(crate) force: bool,
    /// Path to the provider definition.
    #[arg(value_name = "PATH")]
    pub(crate) definition: String,
}
