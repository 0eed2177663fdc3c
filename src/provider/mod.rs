//! Providers: accounts or host pools capable of creating and locating
//! instances.
//!
//! The set of provider kinds is closed. Cloud providers (AWS, GCP) create one
//! machine per job and discover machines through the provisioning tool's
//! inventory; local providers hand out pre-registered hosts.

mod cache;
mod cloud;
mod config;
mod inventory;
mod local;
mod registry;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::instance::Instance;
use crate::job::{JobSpec, MachineParams};
use crate::remote::{RemoteError, Vars};

pub use cache::{CacheState, InstanceCache};
pub use cloud::{CREATE_POLL_BACKOFF, CREATE_POLL_BUDGET, CloudProvider, CreatePolicy};
pub use config::{
    AwsProviderConfig, GcpProviderConfig, LocalHost, LocalProviderConfig, ProviderConfig,
};
pub use inventory::{InventoryClient, InventoryHost, parse_inventory};
pub use local::LocalProvider;
pub use registry::{ProviderDeps, ProviderRegistry};

/// Kind of provider backing a job.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Amazon Web Services.
    Aws,
    /// Google Cloud Platform.
    Gcp,
    /// Fixed pool of pre-registered hosts.
    Local,
}

impl ProviderKind {
    /// Returns the lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Gcp => "gcp",
            Self::Local => "local",
        }
    }

    /// Returns `true` when the provider creates and destroys a machine per
    /// job, so the instance is named after the job.
    #[must_use]
    pub const fn owns_instance_lifecycle(self) -> bool {
        matches!(self, Self::Aws | Self::Gcp)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ProviderError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "aws" => Ok(Self::Aws),
            "gcp" => Ok(Self::Gcp),
            "local" => Ok(Self::Local),
            _ => Err(ProviderError::Invalid(format!(
                "unknown provider type: {value}"
            ))),
        }
    }
}

/// Serialisable snapshot of a provider's configuration, handed to instance
/// operations that need to reach the shared filesystem or cloud APIs.
///
/// Credentials are passed through unredacted.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ProviderSettings {
    /// Provider name.
    pub name: String,
    /// Provider kind.
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    /// Credential file used by the provisioning tool.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_file: Option<Utf8PathBuf>,
    /// Cloud region.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Cloud zone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    /// Cloud project.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    /// Bucket backing the shared filesystem.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_name: Option<String>,
    /// Path of the shared filesystem on the control node.
    pub local_monkeyfs_path: Utf8PathBuf,
}

impl ProviderSettings {
    /// Returns the snapshot as operation variables.
    #[must_use]
    pub fn to_vars(&self) -> Vars {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => Vars::new(),
        }
    }
}

/// Errors raised by providers.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// Provider configuration is incomplete or inconsistent.
    #[error("invalid provider: {0}")]
    Invalid(String),
    /// A provider of the same kind is already registered.
    #[error("a {kind} provider is already registered as {existing}")]
    DuplicateKind {
        /// Kind shared by both providers.
        kind: ProviderKind,
        /// Name of the provider already registered.
        existing: String,
    },
    /// Listing the inventory failed.
    #[error("inventory query failed: {0}")]
    Inventory(String),
    /// Provisioning the machine failed.
    #[error("failed to create instance {instance}: {source}")]
    Create {
        /// Instance name.
        instance: String,
        /// Underlying remote failure.
        #[source]
        source: RemoteError,
    },
    /// The machine never appeared or never answered its health check.
    #[error("instance {instance} not ready after {attempts} attempts")]
    NotReady {
        /// Instance name.
        instance: String,
        /// Inventory polls performed.
        attempts: u32,
    },
    /// A local job did not name a host.
    #[error("local jobs must name a registered host in instance.name")]
    MissingHostName,
    /// A local job named a host that is not registered.
    #[error("no registered host named {0}")]
    UnknownHost(String),
}

/// Future returned by provider operations.
pub type ProviderFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Creates, enumerates and looks up instances.
pub trait Provider: Send + Sync + fmt::Debug {
    /// Provider name referenced by job specs.
    fn name(&self) -> &str;

    /// Provider kind.
    fn kind(&self) -> ProviderKind;

    /// Returns `false` when a required identity field is unset.
    fn is_valid(&self) -> bool;

    /// Configuration snapshot passed to instance operations.
    fn settings(&self) -> ProviderSettings;

    /// Shared filesystem path on the control node.
    fn local_filesystem_path(&self) -> &Utf8Path;

    /// Provisions (cloud) or claims (local) an instance for `spec`.
    fn create_instance<'a>(
        &'a self,
        machine: &'a MachineParams,
        spec: &'a JobSpec,
    ) -> ProviderFuture<'a, Arc<dyn Instance>>;

    /// Looks up a known instance, refreshing the cache once its cooldown has
    /// elapsed.
    fn get_instance<'a>(&'a self, name: &'a str) -> ProviderFuture<'a, Option<Arc<dyn Instance>>>;

    /// Lists known instances, refreshing the cache once its cooldown has
    /// elapsed.
    fn list_instances(&self) -> ProviderFuture<'_, Vec<Arc<dyn Instance>>>;
}
