//! Registered providers, at most one per kind.

use std::sync::Arc;

use camino::Utf8PathBuf;
use chrono::TimeDelta;

use super::cloud::{CloudProvider, CreatePolicy};
use super::local::LocalProvider;
use super::{Provider, ProviderConfig, ProviderError};
use crate::clock::Clock;
use crate::instance::HealthCheck;
use crate::remote::{CommandRunner, GuardedRunner};

/// Shared collaborators every provider is built from.
#[derive(Clone, Debug)]
pub struct ProviderDeps {
    /// Guarded runner shared by every instance.
    pub remote: GuardedRunner,
    /// Process runner used for inventory queries.
    pub commands: Arc<dyn CommandRunner>,
    /// Time source for cache cooldowns.
    pub clock: Arc<dyn Clock>,
    /// Health probe settings applied to every instance.
    pub health: HealthCheck,
    /// Minimum delay between inventory refreshes.
    pub cache_cooldown: TimeDelta,
    /// Readiness polling for newly created machines.
    pub create_policy: CreatePolicy,
    /// Provisioning tree holding roles, playbooks and inventories.
    pub ansible_dir: Utf8PathBuf,
    /// `ansible-inventory` executable.
    pub inventory_bin: String,
    /// Shared filesystem on the control node.
    pub monkeyfs_path: Utf8PathBuf,
}

/// Providers known to the orchestrator.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds providers from configuration, skipping invalid entries and
    /// second providers of an already registered kind.
    #[must_use]
    pub fn from_configs(configs: &[ProviderConfig], deps: &ProviderDeps) -> Self {
        let mut registry = Self::new();
        for config in configs {
            let provider: Arc<dyn Provider> = match config {
                ProviderConfig::Aws(aws) => Arc::new(CloudProvider::aws(aws, deps)),
                ProviderConfig::Gcp(gcp) => Arc::new(CloudProvider::gcp(gcp, deps)),
                ProviderConfig::Local(local) => Arc::new(LocalProvider::new(local, deps)),
            };
            if let Err(err) = registry.register(provider) {
                tracing::warn!(provider = config.name(), error = %err, "provider skipped");
            }
        }
        registry
    }

    /// Adds a provider.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Invalid`] when the provider is missing a
    /// required field, or [`ProviderError::DuplicateKind`] when a provider of
    /// the same kind is already registered.
    pub fn register(&mut self, provider: Arc<dyn Provider>) -> Result<(), ProviderError> {
        if !provider.is_valid() {
            return Err(ProviderError::Invalid(format!(
                "{} is missing a required field",
                provider.name()
            )));
        }
        if let Some(existing) = self
            .providers
            .iter()
            .find(|existing| existing.kind() == provider.kind())
        {
            return Err(ProviderError::DuplicateKind {
                kind: provider.kind(),
                existing: existing.name().to_owned(),
            });
        }
        tracing::info!(provider = provider.name(), kind = %provider.kind(), "provider registered");
        self.providers.push(provider);
        Ok(())
    }

    /// Looks up a provider by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers
            .iter()
            .find(|provider| provider.name() == name)
            .map(Arc::clone)
    }

    /// Registered providers in registration order.
    #[must_use]
    pub fn all(&self) -> &[Arc<dyn Provider>] {
        &self.providers
    }

    /// Returns `true` when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
