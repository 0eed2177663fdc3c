//! Provider configuration tables as they appear under `[[providers]]`.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use super::ProviderKind;

fn default_aws_user() -> String {
    String::from("ubuntu")
}

fn default_gcp_user() -> String {
    String::from("monkey")
}

fn present(value: Option<&str>) -> bool {
    value.is_some_and(|text| !text.trim().is_empty())
}

/// One configured provider.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// Amazon Web Services account.
    Aws(AwsProviderConfig),
    /// Google Cloud project.
    Gcp(GcpProviderConfig),
    /// Pool of pre-registered hosts.
    Local(LocalProviderConfig),
}

impl ProviderConfig {
    /// Provider name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Aws(config) => &config.name,
            Self::Gcp(config) => &config.name,
            Self::Local(config) => &config.name,
        }
    }

    /// Provider kind.
    #[must_use]
    pub const fn kind(&self) -> ProviderKind {
        match self {
            Self::Aws(_) => ProviderKind::Aws,
            Self::Gcp(_) => ProviderKind::Gcp,
            Self::Local(_) => ProviderKind::Local,
        }
    }

    /// Returns `false` when a required identity field is unset.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        match self {
            Self::Aws(config) => config.is_valid(),
            Self::Gcp(config) => config.is_valid(),
            Self::Local(config) => config.is_valid(),
        }
    }
}

/// AWS account settings.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct AwsProviderConfig {
    /// Provider name.
    pub name: String,
    /// Credentials file read by the provisioning tool.
    #[serde(default)]
    pub credential_file: Option<Utf8PathBuf>,
    /// Region, e.g. `us-east-1`.
    #[serde(default)]
    pub region: Option<String>,
    /// Availability zone, e.g. `us-east-1a`.
    #[serde(default)]
    pub zone: Option<String>,
    /// SSH key pair name.
    #[serde(default)]
    pub key_name: Option<String>,
    /// Security group attached to new instances.
    #[serde(default)]
    pub security_group: Option<String>,
    /// S3 bucket backing the shared filesystem.
    #[serde(default)]
    pub storage_name: Option<String>,
    /// Remote login user.
    #[serde(default = "default_aws_user")]
    pub ssh_user: String,
    /// Inventory source; defaults to the provider's file under the
    /// provisioning directory.
    #[serde(default)]
    pub inventory: Option<Utf8PathBuf>,
}

impl AwsProviderConfig {
    /// Returns `false` when a required identity field is unset.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        present(Some(&self.name))
            && present(self.credential_file.as_deref().map(Utf8Path::as_str))
            && present(self.region.as_deref())
            && present(self.zone.as_deref())
    }
}

/// GCP project settings.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct GcpProviderConfig {
    /// Provider name.
    pub name: String,
    /// Service account key file.
    #[serde(default)]
    pub credential_file: Option<Utf8PathBuf>,
    /// Project identifier.
    #[serde(default)]
    pub project: Option<String>,
    /// Zone, e.g. `us-central1-a`.
    #[serde(default)]
    pub zone: Option<String>,
    /// GCS bucket backing the shared filesystem.
    #[serde(default)]
    pub storage_name: Option<String>,
    /// Remote login user.
    #[serde(default = "default_gcp_user")]
    pub ssh_user: String,
    /// Inventory source; defaults to the provider's file under the
    /// provisioning directory.
    #[serde(default)]
    pub inventory: Option<Utf8PathBuf>,
}

impl GcpProviderConfig {
    /// Returns `false` when a required identity field is unset.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        present(Some(&self.name))
            && present(self.credential_file.as_deref().map(Utf8Path::as_str))
            && present(self.project.as_deref())
            && present(self.zone.as_deref())
    }
}

/// Local host pool settings.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct LocalProviderConfig {
    /// Provider name.
    pub name: String,
    /// Shared filesystem path on the control node; defaults to the core's
    /// `monkeyfs_path`.
    #[serde(default)]
    pub monkeyfs_path: Option<Utf8PathBuf>,
    /// Registered hosts.
    #[serde(default)]
    pub hosts: Vec<LocalHost>,
}

impl LocalProviderConfig {
    /// Returns `false` when the name is unset or a host is incomplete.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        present(Some(&self.name)) && self.hosts.iter().all(LocalHost::is_valid)
    }

    /// Shared filesystem path, falling back to `default`.
    #[must_use]
    pub fn monkeyfs_path_or<'a>(&'a self, default: &'a Utf8Path) -> &'a Utf8Path {
        self.monkeyfs_path.as_deref().unwrap_or(default)
    }
}

/// A pre-registered host.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct LocalHost {
    /// Name jobs use in `instance.name`.
    pub name: String,
    /// Hostname or IP address.
    pub address: String,
    /// Scratch space on the host.
    pub scratch_dir: Utf8PathBuf,
    /// Mount point of the shared filesystem on the host.
    pub monkeyfs_dir: Utf8PathBuf,
    /// Remote login user.
    #[serde(default)]
    pub ssh_user: Option<String>,
}

impl LocalHost {
    /// Returns `false` when a required field is blank.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        present(Some(&self.name))
            && present(Some(&self.address))
            && present(Some(self.scratch_dir.as_str()))
            && present(Some(self.monkeyfs_dir.as_str()))
    }
}
