//! Provisioned machines and the lifecycle operations a job runs on them.
//!
//! Every variant shares the staging logic in [`staging`]; variants differ
//! only in where the scratch space and shared filesystem live on the host
//! and in how the shared filesystem is mounted and the machine torn down.

mod base;
mod cloud;
mod local;
pub mod staging;

use std::fmt::Debug;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

use camino::Utf8PathBuf;
use serde::Serialize;
use thiserror::Error;

use crate::job::JobSpec;
use crate::provider::{ProviderKind, ProviderSettings};
use crate::remote::RemoteError;

pub use base::{HEALTH_CHECK_PORT, HealthCheck, InstanceCore, OfflineCounter};
pub use cloud::CloudInstance;
pub use local::LocalInstance;

/// Future returned by instance operations.
pub type InstanceFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, InstanceError>> + Send + 'a>>;

/// Future returned by [`Instance::check_online`].
pub type HealthFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Errors surfaced by instance operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum InstanceError {
    /// A remote step failed or was superseded.
    #[error("{step} failed on {instance}: {source}")]
    Remote {
        /// Instance the step ran against.
        instance: String,
        /// Step name, e.g. `setup_data_item`.
        step: &'static str,
        /// Underlying remote failure.
        #[source]
        source: RemoteError,
    },
    /// The job or provider settings cannot be applied to this instance.
    #[error("invalid configuration for {instance}: {message}")]
    Config {
        /// Instance name.
        instance: String,
        /// Human-readable error message.
        message: String,
    },
}

impl InstanceError {
    /// Returns `true` when the failure was caused by a newer operation.
    #[must_use]
    pub const fn is_superseded(&self) -> bool {
        matches!(
            self,
            Self::Remote {
                source: RemoteError::Superseded { .. },
                ..
            }
        )
    }
}

/// Path resolution each variant provides to the shared staging helpers.
pub trait PathLayout: Send + Sync {
    /// Root of the per-host scratch space.
    fn scratch_dir(&self) -> Utf8PathBuf;

    /// Mount point of the shared filesystem on the host.
    fn monkeyfs_dir(&self) -> Utf8PathBuf;

    /// Working directory of one job.
    fn job_dir(&self, job_uid: &str) -> Utf8PathBuf {
        self.scratch_dir().join("jobs").join(job_uid)
    }
}

/// Public snapshot of an instance for listings.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct InstanceDetails {
    /// Instance name.
    pub name: String,
    /// Provider kind the instance belongs to.
    pub provider_type: ProviderKind,
    /// Reachable address, if known.
    pub ip_address: Option<IpAddr>,
    /// Provider-specific location (zone or local host alias).
    pub location: String,
    /// Consecutive failed health checks.
    pub offline_count: u32,
}

/// Lifecycle operations on a provisioned machine.
///
/// Operations report failures as [`InstanceError`]; the dispatcher turns
/// any failure into a requeue.
pub trait Instance: Send + Sync + Debug {
    /// Instance name; equal to the job uid for cloud instances.
    fn name(&self) -> &str;

    /// Reachable address, if known.
    fn ip_address(&self) -> Option<IpAddr>;

    /// Provider kind.
    fn kind(&self) -> ProviderKind;

    /// Serialisable snapshot.
    fn details(&self) -> InstanceDetails;

    /// Probes the health endpoint and applies the offline threshold.
    fn check_online(&self) -> HealthFuture<'_>;

    /// Installs one named dependency.
    fn install_dependency<'a>(&'a self, name: &'a str) -> InstanceFuture<'a, ()>;

    /// Mounts the provider's shared filesystem on the host.
    fn mount_shared_filesystem<'a>(
        &'a self,
        spec: &'a JobSpec,
        settings: &'a ProviderSettings,
    ) -> InstanceFuture<'a, ()>;

    /// Stages data, code, logs, persisted folders and the environment.
    fn setup_job<'a>(
        &'a self,
        spec: &'a JobSpec,
        settings: &'a ProviderSettings,
    ) -> InstanceFuture<'a, ()>;

    /// Runs the job command and syncs persisted folders afterwards.
    fn run_job<'a>(
        &'a self,
        spec: &'a JobSpec,
        settings: &'a ProviderSettings,
    ) -> InstanceFuture<'a, ()>;

    /// Tears down whatever the job left on the instance.
    fn cleanup_job<'a>(
        &'a self,
        spec: &'a JobSpec,
        settings: &'a ProviderSettings,
    ) -> InstanceFuture<'a, ()>;

    /// Reads `hyperparameters.json` from the job directory, if present.
    fn fetch_hyperparameters<'a>(
        &'a self,
        spec: &'a JobSpec,
    ) -> InstanceFuture<'a, Option<serde_json::Value>>;
}
