//! Reads and updates the `[[providers]]` tables of `monkey.toml`.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use ortho_config::ConfigDiscovery;
use ortho_config::toml;
use thiserror::Error;

use crate::config::{APP_NAME, CONFIG_ENV_VAR, CONFIG_FILE_NAME, DOTFILE_NAME};
use crate::provider::{ProviderConfig, ProviderKind};

const PROVIDERS_KEY: &str = "providers";

/// Errors raised while reading or updating provider configuration.
#[derive(Debug, Error)]
pub enum ProviderStoreError {
    /// Raised when no configuration candidates are available.
    #[error("no configuration file candidates were discovered")]
    NoCandidates,
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when parsing existing TOML content fails.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when existing TOML has an unexpected structure.
    #[error("invalid configuration in {path}: {message}")]
    InvalidStructure {
        /// Path that had invalid content.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the provider lacks a required field.
    #[error("provider {0} is missing a required field")]
    Invalid(String),
    /// Raised when a provider of the same type exists and overwrite is
    /// disabled.
    #[error("a {kind} provider is already configured as {existing}; rerun with --force to replace it")]
    DuplicateKind {
        /// Provider type being added.
        kind: ProviderKind,
        /// Name of the provider already configured.
        existing: String,
    },
}

/// Provider tables located through `OrthoConfig`'s discovery search order.
#[derive(Clone, Debug)]
pub struct ProviderStore {
    discovery: ConfigDiscovery,
}

impl ProviderStore {
    /// Builds a store using the standard discovery settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            discovery: ConfigDiscovery::builder(APP_NAME)
                .env_var(CONFIG_ENV_VAR)
                .config_file_name(CONFIG_FILE_NAME)
                .dotfile_name(DOTFILE_NAME)
                .project_file_name(CONFIG_FILE_NAME)
                .build(),
        }
    }

    /// Builds a store using an explicit discovery configuration.
    #[must_use]
    pub const fn with_discovery(discovery: ConfigDiscovery) -> Self {
        Self { discovery }
    }

    /// Providers configured in the first existing candidate file, in file
    /// order. Returns an empty list when no file exists.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderStoreError`] when the file cannot be read or a table
    /// does not describe a provider.
    pub fn list_providers(&self) -> Result<Vec<ProviderConfig>, ProviderStoreError> {
        let target = self.resolve_target()?;
        if !target.exists {
            return Ok(Vec::new());
        }
        let contents = read_config(&target.path)?;
        let value = parse_toml(&target.path, &contents)?;
        read_providers(&target.path, &value)
    }

    /// Adds `provider` to the configuration file, creating it if needed.
    ///
    /// At most one provider per type is kept: an existing provider of the
    /// same type is replaced when `force` is set and reported otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderStoreError::Invalid`] for incomplete providers,
    /// [`ProviderStoreError::DuplicateKind`] when the type is taken, or an
    /// I/O or parse error.
    pub fn add_provider(
        &self,
        provider: &ProviderConfig,
        force: bool,
    ) -> Result<Utf8PathBuf, ProviderStoreError> {
        if !provider.is_valid() {
            return Err(ProviderStoreError::Invalid(provider.name().to_owned()));
        }
        let target = self.resolve_target()?;
        let contents = if target.exists {
            read_config(&target.path)?
        } else {
            String::new()
        };

        let mut value = parse_toml(&target.path, &contents)?;
        let mut providers = read_providers(&target.path, &value)?;
        let position = providers
            .iter()
            .position(|existing| existing.kind() == provider.kind());
        if let Some(index) = position {
            if !force {
                let existing = providers
                    .get(index)
                    .map(|found| found.name().to_owned())
                    .unwrap_or_default();
                return Err(ProviderStoreError::DuplicateKind {
                    kind: provider.kind(),
                    existing,
                });
            }
            providers.remove(index);
        }
        providers.push(provider.clone());

        write_providers(&target.path, &mut value, &providers)?;
        write_config(&target.path, &value)?;
        tracing::info!(
            provider = provider.name(),
            kind = %provider.kind(),
            path = %target.path,
            "provider saved"
        );
        Ok(target.path)
    }

    fn resolve_target(&self) -> Result<ConfigTarget, ProviderStoreError> {
        let candidates = self.discovery.utf8_candidates();
        if candidates.is_empty() {
            return Err(ProviderStoreError::NoCandidates);
        }

        for candidate in &candidates {
            if path_exists(candidate)? {
                return Ok(ConfigTarget {
                    path: candidate.clone(),
                    exists: true,
                });
            }
        }

        let fallback = candidates
            .last()
            .cloned()
            .ok_or(ProviderStoreError::NoCandidates)?;
        Ok(ConfigTarget {
            path: fallback,
            exists: false,
        })
    }
}

impl Default for ProviderStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
struct ConfigTarget {
    path: Utf8PathBuf,
    exists: bool,
}

fn split_path(path: &Utf8Path) -> Result<(&Utf8Path, &str), ProviderStoreError> {
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| ProviderStoreError::InvalidStructure {
            path: path.to_path_buf(),
            message: String::from("configuration file path is missing a filename"),
        })?;
    Ok((parent, file_name))
}

fn io_error(path: &Utf8Path, err: &io::Error) -> ProviderStoreError {
    ProviderStoreError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

fn path_exists(path: &Utf8Path) -> Result<bool, ProviderStoreError> {
    let (parent, file_name) = split_path(path)?;
    match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir.try_exists(file_name).map_err(|err| io_error(path, &err)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(io_error(parent, &err)),
    }
}

fn read_config(path: &Utf8Path) -> Result<String, ProviderStoreError> {
    let (parent, file_name) = split_path(path)?;
    let dir =
        Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| io_error(parent, &err))?;
    dir.read_to_string(file_name)
        .map_err(|err| io_error(path, &err))
}

fn parse_toml(path: &Utf8Path, contents: &str) -> Result<toml::Value, ProviderStoreError> {
    if contents.trim().is_empty() {
        return Ok(toml::Value::Table(toml::value::Table::new()));
    }

    toml::from_str(contents).map_err(|err| ProviderStoreError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

fn read_providers(
    path: &Utf8Path,
    value: &toml::Value,
) -> Result<Vec<ProviderConfig>, ProviderStoreError> {
    let table = value
        .as_table()
        .ok_or_else(|| ProviderStoreError::InvalidStructure {
            path: path.to_path_buf(),
            message: String::from("configuration root is not a table"),
        })?;

    let Some(section) = table.get(PROVIDERS_KEY) else {
        return Ok(Vec::new());
    };
    let entries = section
        .as_array()
        .ok_or_else(|| ProviderStoreError::InvalidStructure {
            path: path.to_path_buf(),
            message: format!("{PROVIDERS_KEY} must be an array of tables"),
        })?;

    entries
        .iter()
        .map(|entry| {
            entry
                .clone()
                .try_into::<ProviderConfig>()
                .map_err(|err| ProviderStoreError::InvalidStructure {
                    path: path.to_path_buf(),
                    message: format!("invalid [[{PROVIDERS_KEY}]] entry: {err}"),
                })
        })
        .collect()
}

fn write_providers(
    path: &Utf8Path,
    value: &mut toml::Value,
    providers: &[ProviderConfig],
) -> Result<(), ProviderStoreError> {
    let table = value
        .as_table_mut()
        .ok_or_else(|| ProviderStoreError::InvalidStructure {
            path: path.to_path_buf(),
            message: String::from("configuration root is not a table"),
        })?;

    let entries = providers
        .iter()
        .map(|provider| {
            toml::Value::try_from(provider).map_err(|err| ProviderStoreError::Parse {
                path: path.to_path_buf(),
                message: err.to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    table.insert(String::from(PROVIDERS_KEY), toml::Value::Array(entries));
    Ok(())
}

fn write_config(path: &Utf8Path, value: &toml::Value) -> Result<(), ProviderStoreError> {
    let (parent, file_name) = split_path(path)?;
    Dir::create_ambient_dir_all(parent, ambient_authority())
        .map_err(|err| io_error(parent, &err))?;
    let dir =
        Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| io_error(parent, &err))?;

    let rendered = toml::to_string_pretty(value).map_err(|err| ProviderStoreError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;

    dir.write(file_name, rendered)
        .map_err(|err| io_error(path, &err))
}
