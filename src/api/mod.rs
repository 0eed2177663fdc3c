//! Request handlers behind the submission, listing and dedup endpoints.
//!
//! Handlers take an [`Orchestrator`] and return serde types so a route
//! layer can expose them over HTTP unchanged. Submission and dedup checks
//! report failures in the response body rather than as errors.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::Orchestrator;
use crate::dispatch::DispatchOutcome;
use crate::instance::InstanceDetails;
use crate::job::{JobRecord, JobSpec, SpecError};
use crate::monkeyfs::{ArtifactKind, MonkeyFsError};
use crate::provider::ProviderSettings;
use crate::reconcile::DispatchStatus;
use crate::store::StoreError;

/// Body returned by submission and upload endpoints.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SubmitResponse {
    /// Whether the request was accepted.
    pub success: bool,
    /// Human-readable outcome.
    pub msg: String,
}

impl SubmitResponse {
    fn accepted(msg: impl Into<String>) -> Self {
        Self {
            success: true,
            msg: msg.into(),
        }
    }

    fn rejected(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            msg: msg.into(),
        }
    }
}

/// Body returned by the dataset and codebase dedup checks.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CheckResponse {
    /// Whether an artifact with the checksum is already stored.
    pub found: bool,
    /// Human-readable outcome.
    pub msg: String,
}

/// Identifies a dataset or codebase artifact.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ArtifactQuery {
    /// Dataset name or codebase run name.
    pub name: String,
    /// Content checksum.
    pub checksum: String,
    /// Provider the artifact is staged for.
    pub provider: String,
    /// Archive extension; required for uploads.
    #[serde(default)]
    pub extension: Option<String>,
}

/// A persisted job with its dispatch status and log location.
#[derive(Clone, Debug, Serialize)]
pub struct JobSummary {
    /// Persisted record.
    #[serde(flatten)]
    pub record: JobRecord,
    /// Status of the in-process dispatch worker, if one ran.
    pub dispatch: Option<String>,
    /// Run log on the shared filesystem.
    pub log_path: Option<Utf8PathBuf>,
}

/// Reasons a submission is refused.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The job spec failed validation.
    #[error("invalid job spec: {0}")]
    InvalidSpec(#[from] SpecError),
    /// The job names a provider that is not configured.
    #[error("provider {0} is not configured")]
    UnknownProvider(String),
    /// A job with the same uid was already submitted.
    #[error("job {0} was already submitted")]
    Duplicate(String),
    /// The store rejected the record.
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for SubmitError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::AlreadyExists { job_uid } => Self::Duplicate(job_uid),
            other => Self::Store(other),
        }
    }
}

/// Issues a fresh job identifier.
#[must_use]
pub fn new_job_uid(ctx: &Orchestrator) -> String {
    ctx.next_job_uid()
}

/// Validates and persists a job as `QUEUED`.
///
/// Only validation and configuration problems are reported as failures;
/// a persisted job is always accepted. Background jobs are left for the
/// reconciliation loop. Foreground jobs are dispatched immediately and the
/// message says how the pipeline ended; a requeued job is picked up again
/// by the loop.
pub async fn submit_job(ctx: &Orchestrator, spec: JobSpec) -> SubmitResponse {
    let job_uid = spec.job_uid.clone();
    match try_submit(ctx, spec).await {
        Ok(msg) => SubmitResponse::accepted(msg),
        Err(err) => {
            tracing::warn!(job_uid = %job_uid, error = %err, "job submission failed");
            SubmitResponse::rejected(err.to_string())
        }
    }
}

async fn try_submit(ctx: &Orchestrator, spec: JobSpec) -> Result<String, SubmitError> {
    spec.validate()?;
    let provider = ctx
        .providers()
        .get(&spec.provider)
        .ok_or_else(|| SubmitError::UnknownProvider(spec.provider.clone()))?;
    let foreground = spec.foreground;
    let record = JobRecord::new(spec, provider.name(), provider.kind(), ctx.clock().now());
    let job_uid = record.job_uid.clone();
    ctx.store().insert(&record)?;
    tracing::info!(
        job_uid = %job_uid,
        provider = provider.name(),
        foreground,
        "job queued"
    );

    if !foreground {
        return Ok(format!("job {job_uid} queued"));
    }
    if !ctx.pool().spawn(&job_uid) {
        tracing::debug!(job_uid = %job_uid, "dispatch already running, waiting on it");
    }
    let msg = match ctx.pool().wait_for(&job_uid).await {
        Some(DispatchStatus::Succeeded(DispatchOutcome::Finished)) => {
            format!("job {job_uid} finished")
        }
        Some(status) => {
            tracing::warn!(job_uid = %job_uid, status = %status, "foreground dispatch did not finish");
            format!("job {job_uid} accepted, dispatch {status}")
        }
        None => format!("job {job_uid} queued"),
    };
    Ok(msg)
}

/// Settings of every configured provider.
#[must_use]
pub fn list_providers(ctx: &Orchestrator) -> Vec<ProviderSettings> {
    ctx.providers()
        .all()
        .iter()
        .map(|provider| provider.settings())
        .collect()
}

/// Instances per provider. An empty filter lists every provider; unknown
/// names and failing providers are skipped.
pub async fn list_instances(
    ctx: &Orchestrator,
    providers: &[String],
) -> BTreeMap<String, Vec<InstanceDetails>> {
    let selected: Vec<_> = if providers.is_empty() {
        ctx.providers().all().to_vec()
    } else {
        providers
            .iter()
            .filter_map(|name| {
                let found = ctx.providers().get(name);
                if found.is_none() {
                    tracing::warn!(provider = %name, "unknown provider in instance listing");
                }
                found
            })
            .collect()
    };

    let mut listing = BTreeMap::new();
    for provider in selected {
        match provider.list_instances().await {
            Ok(instances) => {
                let details = instances.iter().map(|instance| instance.details()).collect();
                listing.insert(provider.name().to_owned(), details);
            }
            Err(err) => {
                tracing::warn!(provider = provider.name(), error = %err, "listing instances failed");
            }
        }
    }
    listing
}

/// Every persisted job, oldest first.
///
/// # Errors
///
/// Returns [`StoreError`] when the store cannot be read.
pub fn list_jobs(ctx: &Orchestrator) -> Result<Vec<JobSummary>, StoreError> {
    let records = ctx.store().list()?;
    let statuses = ctx.pool().snapshot();
    Ok(records
        .into_iter()
        .map(|record| JobSummary {
            dispatch: statuses.get(&record.job_uid).map(ToString::to_string),
            log_path: ctx.monkeyfs().job_log_path(&record.job_uid).ok(),
            record,
        })
        .collect())
}

/// Reports whether a dataset with the checksum is already stored.
#[must_use]
pub fn check_dataset(ctx: &Orchestrator, query: &ArtifactQuery) -> CheckResponse {
    check_artifact(ctx, ArtifactKind::Dataset, query)
}

/// Reports whether a codebase with the checksum is already stored.
#[must_use]
pub fn check_codebase(ctx: &Orchestrator, query: &ArtifactQuery) -> CheckResponse {
    check_artifact(ctx, ArtifactKind::Codebase, query)
}

/// Stores a dataset archive unless one with the checksum exists.
#[must_use]
pub fn upload_dataset(ctx: &Orchestrator, query: &ArtifactQuery, contents: &[u8]) -> SubmitResponse {
    upload_artifact(ctx, ArtifactKind::Dataset, query, contents)
}

/// Stores a codebase archive unless one with the checksum exists.
#[must_use]
pub fn upload_codebase(
    ctx: &Orchestrator,
    query: &ArtifactQuery,
    contents: &[u8],
) -> SubmitResponse {
    upload_artifact(ctx, ArtifactKind::Codebase, query, contents)
}

fn check_artifact(ctx: &Orchestrator, kind: ArtifactKind, query: &ArtifactQuery) -> CheckResponse {
    if ctx.providers().get(&query.provider).is_none() {
        return CheckResponse {
            found: false,
            msg: format!("provider {} is not configured", query.provider),
        };
    }
    match ctx
        .monkeyfs()
        .has_artifact(kind, &query.name, &query.checksum)
    {
        Ok(true) => CheckResponse {
            found: true,
            msg: format!("{} {} already stored", kind.stem(), query.name),
        },
        Ok(false) => CheckResponse {
            found: false,
            msg: format!("{} {} needs uploading", kind.stem(), query.name),
        },
        Err(err) => {
            tracing::warn!(name = %query.name, checksum = %query.checksum, error = %err, "artifact check failed");
            CheckResponse {
                found: false,
                msg: err.to_string(),
            }
        }
    }
}

fn upload_artifact(
    ctx: &Orchestrator,
    kind: ArtifactKind,
    query: &ArtifactQuery,
    contents: &[u8],
) -> SubmitResponse {
    if ctx.providers().get(&query.provider).is_none() {
        return SubmitResponse::rejected(format!(
            "provider {} is not configured",
            query.provider
        ));
    }
    let Some(extension) = query.extension.as_deref() else {
        return SubmitResponse::rejected("missing extension");
    };
    let stored = ctx.monkeyfs().upload_artifact(
        kind,
        &query.name,
        &query.checksum,
        extension,
        contents,
    );
    match stored {
        Ok(true) => SubmitResponse::accepted(format!("{} {} stored", kind.stem(), query.name)),
        Ok(false) => {
            SubmitResponse::accepted(format!("{} {} already stored", kind.stem(), query.name))
        }
        Err(err) => SubmitResponse::rejected(upload_failure(&err)),
    }
}

fn upload_failure(err: &MonkeyFsError) -> String {
    tracing::warn!(error = %err, "artifact upload failed");
    format!("upload failed: {err}")
}

#[cfg(test)]
mod tests;
