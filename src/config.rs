//! Configuration loading via `ortho-config`.

use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::TimeDelta;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::instance::{HEALTH_CHECK_PORT, HealthCheck};
use crate::reconcile::ReconcileSettings;

/// Application name used for configuration discovery.
pub const APP_NAME: &str = "monkey";
/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV_VAR: &str = "MONKEY_CONFIG_PATH";
/// Configuration file searched in XDG and project directories.
pub const CONFIG_FILE_NAME: &str = "monkey.toml";
/// Configuration file searched in the home directory.
pub const DOTFILE_NAME: &str = ".monkey.toml";

const MAX_WINDOW_DAYS: u64 = 36_500;

/// Core settings derived from defaults, `monkey.toml`, `MONKEY_*`
/// environment variables and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "MONKEY",
    discovery(
        app_name = "monkey",
        env_var = "MONKEY_CONFIG_PATH",
        config_file_name = "monkey.toml",
        dotfile_name = ".monkey.toml",
        project_file_name = "monkey.toml"
    )
)]
pub struct CoreConfig {
    /// Directory holding one JSON record per job.
    #[ortho_config(default = "./monkey-store".to_owned())]
    pub store_path: String,
    /// Local mount of the shared filesystem.
    #[ortho_config(default = "./monkeyfs".to_owned())]
    pub monkeyfs_path: String,
    /// Seconds between reconciliation passes.
    #[ortho_config(default = 10)]
    pub daemon_interval_secs: u64,
    /// Jobs created more than this many days ago are no longer audited.
    #[ortho_config(default = 10)]
    pub dead_job_window_days: u64,
    /// Minimum seconds between provider inventory refreshes.
    #[ortho_config(default = 10)]
    pub instance_cache_cooldown_secs: u64,
    /// Consecutive failed health probes before an instance is offline.
    #[ortho_config(default = 3)]
    pub offline_retry_threshold: u32,
    /// Per-request health probe timeout in seconds.
    #[ortho_config(default = 4)]
    pub health_check_timeout_secs: u64,
    /// `ansible` executable used for ad-hoc roles and shell commands.
    #[ortho_config(default = "ansible".to_owned())]
    pub ansible_bin: String,
    /// `ansible-playbook` executable.
    #[ortho_config(default = "ansible-playbook".to_owned())]
    pub ansible_playbook_bin: String,
    /// `ansible-inventory` executable used to list cloud instances.
    #[ortho_config(default = "ansible-inventory".to_owned())]
    pub ansible_inventory_bin: String,
    /// Directory holding roles, playbooks and inventory sources.
    #[ortho_config(default = "./ansible".to_owned())]
    pub ansible_dir: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl CoreConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to {CONFIG_FILE_NAME}",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    fn require_range(
        value: u64,
        min: u64,
        max: u64,
        metadata: &FieldMetadata,
    ) -> Result<(), ConfigError> {
        if value < min || value > max {
            return Err(ConfigError::OutOfRange(format!(
                "{} must be between {min} and {max}, got {value}: set {} or {} in {CONFIG_FILE_NAME}",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads configuration using the `ortho-config` derive. Values merge
    /// defaults, configuration files, environment variables, and CLI flags in
    /// that order of precedence.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge sources.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from(APP_NAME)])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and `monkey.toml` key that supply the value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is blank
    /// and [`ConfigError::OutOfRange`] when a number is unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.store_path,
            &FieldMetadata::new("job store directory", "MONKEY_STORE_PATH", "store_path"),
        )?;
        Self::require_field(
            &self.monkeyfs_path,
            &FieldMetadata::new(
                "shared filesystem path",
                "MONKEY_MONKEYFS_PATH",
                "monkeyfs_path",
            ),
        )?;
        Self::require_field(
            &self.ansible_bin,
            &FieldMetadata::new("ansible executable", "MONKEY_ANSIBLE_BIN", "ansible_bin"),
        )?;
        Self::require_field(
            &self.ansible_playbook_bin,
            &FieldMetadata::new(
                "ansible-playbook executable",
                "MONKEY_ANSIBLE_PLAYBOOK_BIN",
                "ansible_playbook_bin",
            ),
        )?;
        Self::require_field(
            &self.ansible_inventory_bin,
            &FieldMetadata::new(
                "ansible-inventory executable",
                "MONKEY_ANSIBLE_INVENTORY_BIN",
                "ansible_inventory_bin",
            ),
        )?;
        Self::require_field(
            &self.ansible_dir,
            &FieldMetadata::new("ansible directory", "MONKEY_ANSIBLE_DIR", "ansible_dir"),
        )?;
        Self::require_range(
            self.daemon_interval_secs,
            1,
            3_600,
            &FieldMetadata::new(
                "daemon interval",
                "MONKEY_DAEMON_INTERVAL_SECS",
                "daemon_interval_secs",
            ),
        )?;
        Self::require_range(
            self.dead_job_window_days,
            1,
            MAX_WINDOW_DAYS,
            &FieldMetadata::new(
                "dead job window",
                "MONKEY_DEAD_JOB_WINDOW_DAYS",
                "dead_job_window_days",
            ),
        )?;
        Self::require_range(
            u64::from(self.offline_retry_threshold),
            1,
            100,
            &FieldMetadata::new(
                "offline retry threshold",
                "MONKEY_OFFLINE_RETRY_THRESHOLD",
                "offline_retry_threshold",
            ),
        )?;
        Self::require_range(
            self.health_check_timeout_secs,
            1,
            60,
            &FieldMetadata::new(
                "health check timeout",
                "MONKEY_HEALTH_CHECK_TIMEOUT_SECS",
                "health_check_timeout_secs",
            ),
        )?;
        Ok(())
    }

    /// Job store directory.
    #[must_use]
    pub fn store_dir(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(self.store_path.trim())
    }

    /// Shared filesystem root.
    #[must_use]
    pub fn monkeyfs_dir(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(self.monkeyfs_path.trim())
    }

    /// Provisioning tree root.
    #[must_use]
    pub fn ansible_root(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(self.ansible_dir.trim())
    }

    /// Reconciliation timing.
    #[must_use]
    pub fn reconcile_settings(&self) -> ReconcileSettings {
        let days = i64::try_from(self.dead_job_window_days.min(MAX_WINDOW_DAYS)).unwrap_or(0);
        ReconcileSettings {
            interval: Duration::from_secs(self.daemon_interval_secs),
            dead_job_window: TimeDelta::try_days(days).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Health probe settings applied to every instance.
    #[must_use]
    pub const fn health_check(&self) -> HealthCheck {
        HealthCheck {
            port: HEALTH_CHECK_PORT,
            timeout: Duration::from_secs(self.health_check_timeout_secs),
            offline_threshold: self.offline_retry_threshold,
        }
    }

    /// Minimum delay between inventory refreshes.
    #[must_use]
    pub fn cache_cooldown(&self) -> TimeDelta {
        i64::try_from(self.instance_cache_cooldown_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX)
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            store_path: String::from("./monkey-store"),
            monkeyfs_path: String::from("./monkeyfs"),
            daemon_interval_secs: 10,
            dead_job_window_days: 10,
            instance_cache_cooldown_secs: 10,
            offline_retry_threshold: 3,
            health_check_timeout_secs: 4,
            ansible_bin: String::from("ansible"),
            ansible_playbook_bin: String::from("ansible-playbook"),
            ansible_inventory_bin: String::from("ansible-inventory"),
            ansible_dir: String::from("./ansible"),
        }
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a numeric field is outside its usable range.
    #[error("configuration value out of range: {0}")]
    OutOfRange(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
