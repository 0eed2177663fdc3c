//! Parsed job description submitted by clients.
//!
//! Only the fields the orchestrator reads are modelled; unknown keys in the
//! submitted payload are ignored.

use std::collections::BTreeMap;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Full description of one submitted job.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct JobSpec {
    /// Unique job identifier (see [`crate::job::JobUidGenerator`]).
    #[serde(default)]
    pub job_uid: String,
    /// Name of the provider the job is bound to.
    pub provider: String,
    /// Command executed inside the job directory.
    pub cmd: String,
    /// Whether the submitter waits for the full pipeline to complete.
    #[serde(default)]
    pub foreground: bool,
    /// Datasets staged before the code is unpacked.
    #[serde(default)]
    pub data: Vec<DataItem>,
    /// Codebases unpacked into the job directory.
    #[serde(default)]
    pub code: Vec<CodeItem>,
    /// Job-relative folders continuously synced to the shared filesystem.
    #[serde(default)]
    pub persist: Vec<String>,
    /// Dependencies installed on the instance before setup.
    #[serde(default)]
    pub install: Vec<String>,
    /// Environment activation settings.
    #[serde(default)]
    pub run: RunConfig,
    /// Maximum seconds allowed in `RUNNING`; zero or negative means unlimited.
    #[serde(default)]
    pub run_timeout_time: Option<i64>,
    /// Machine selection parameters passed to the provider.
    #[serde(default)]
    pub instance: MachineParams,
}

/// Dataset reference stored content-addressed on the shared filesystem.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct DataItem {
    /// Dataset name.
    pub name: String,
    /// Job-relative path at which the dataset is exposed.
    pub path: String,
    /// Content checksum used as the storage key.
    pub checksum: String,
    /// Archive extension (`tar`, `tar.gz`, `zip`).
    pub extension: String,
}

/// Codebase reference stored content-addressed on the shared filesystem.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CodeItem {
    /// Run name the codebase was uploaded under.
    pub run_name: String,
    /// Content checksum used as the storage key.
    pub checksum: String,
    /// Archive extension (`tar`, `tar.gz`, `zip`).
    pub extension: String,
    /// Provider the codebase was uploaded to, when different from the job's.
    #[serde(default)]
    pub provider: Option<String>,
    /// Local path the client archived; informational only.
    #[serde(default)]
    pub path: Option<String>,
}

/// Environment manager used to activate the job's dependencies.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvType {
    /// Conda environment built from an environment file.
    Conda,
    /// Python virtualenv populated from a requirements file.
    #[default]
    Pip,
    /// Docker image built from a Dockerfile.
    Docker,
}

impl EnvType {
    /// Returns the wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Conda => "conda",
            Self::Pip => "pip",
            Self::Docker => "docker",
        }
    }
}

/// Environment activation configuration.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct RunConfig {
    /// Environment manager.
    #[serde(default)]
    pub env_type: EnvType,
    /// Job-relative environment file (requirements, conda env, Dockerfile).
    #[serde(default)]
    pub env_file: Option<String>,
    /// Extra environment variables exported before the command runs.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Machine selection parameters.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct MachineParams {
    /// Name of a pre-registered host (local providers only).
    #[serde(default)]
    pub name: Option<String>,
    /// Cloud machine type, e.g. `t3.medium` or `n1-standard-4`.
    #[serde(default)]
    pub instance_type: Option<String>,
    /// Cloud image identifier.
    #[serde(default)]
    pub image: Option<String>,
    /// Boot disk size in gigabytes.
    #[serde(default)]
    pub disk_size_gb: Option<u32>,
}

/// Reasons a job spec is rejected at submission.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SpecError {
    /// A required field is blank.
    #[error("missing or empty field: {0}")]
    MissingField(String),
    /// A path escapes the job directory or is otherwise unusable.
    #[error("invalid path in {field}: {path}")]
    InvalidPath {
        /// Field holding the path.
        field: String,
        /// Offending value.
        path: String,
    },
    /// A name used to build remote paths or role names contains unsafe characters.
    #[error("invalid name in {field}: {value}")]
    InvalidName {
        /// Field holding the name.
        field: String,
        /// Offending value.
        value: String,
    },
    /// The environment map contains a key that is not a shell identifier.
    #[error("invalid environment variable name: {0}")]
    InvalidEnvName(String),
}

impl JobSpec {
    /// Returns the run timeout in seconds when it is positive.
    #[must_use]
    pub fn effective_run_timeout(&self) -> Option<u64> {
        self.run_timeout_time
            .and_then(|secs| u64::try_from(secs).ok())
            .filter(|secs| *secs > 0)
    }

    /// Checks the fields the orchestrator depends on.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError`] describing the first invalid field.
    pub fn validate(&self) -> Result<(), SpecError> {
        require("job_uid", &self.job_uid)?;
        require("provider", &self.provider)?;
        require("cmd", &self.cmd)?;

        for item in &self.data {
            require_name("data.name", &item.name)?;
            require_name("data.checksum", &item.checksum)?;
            require_name("data.extension", &item.extension)?;
            require_relative_path("data.path", &item.path)?;
        }
        for item in &self.code {
            require_name("code.run_name", &item.run_name)?;
            require_name("code.checksum", &item.checksum)?;
            require_name("code.extension", &item.extension)?;
        }
        for folder in &self.persist {
            require_relative_path("persist", folder)?;
        }
        for dependency in &self.install {
            require_name("install", dependency)?;
        }
        if let Some(env_file) = &self.run.env_file {
            require_relative_path("run.env_file", env_file)?;
        }
        for key in self.run.env.keys() {
            if !is_env_name(key) {
                return Err(SpecError::InvalidEnvName(key.clone()));
            }
        }
        Ok(())
    }
}

fn require(field: &str, value: &str) -> Result<(), SpecError> {
    if value.trim().is_empty() {
        return Err(SpecError::MissingField(field.to_owned()));
    }
    Ok(())
}

/// Names end up in remote paths and role names, so they are restricted to a
/// conservative character set.
fn require_name(field: &str, value: &str) -> Result<(), SpecError> {
    require(field, value)?;
    let valid = value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
        && value != "."
        && value != "..";
    if valid {
        Ok(())
    } else {
        Err(SpecError::InvalidName {
            field: field.to_owned(),
            value: value.to_owned(),
        })
    }
}

fn require_relative_path(field: &str, value: &str) -> Result<(), SpecError> {
    require(field, value)?;
    let path = Utf8Path::new(value);
    let escapes = path.is_absolute()
        || path
            .components()
            .any(|component| matches!(component, camino::Utf8Component::ParentDir));
    if escapes || value.contains('\n') {
        return Err(SpecError::InvalidPath {
            field: field.to_owned(),
            path: value.to_owned(),
        });
    }
    Ok(())
}

fn is_env_name(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}
