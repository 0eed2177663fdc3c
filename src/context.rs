//! Wires the orchestrator's components together from configuration.

use std::sync::Arc;

use thiserror::Error;

use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, CoreConfig};
use crate::dispatch::Dispatcher;
use crate::job::JobUidGenerator;
use crate::monkeyfs::{MonkeyFs, MonkeyFsError};
use crate::provider::{
    CREATE_POLL_BACKOFF, CREATE_POLL_BUDGET, CreatePolicy, ProviderConfig, ProviderDeps,
    ProviderRegistry,
};
use crate::reconcile::{DispatchPool, ReconciliationLoop};
use crate::remote::{
    AnsibleRunner, CommandRunner, GenerationTracker, GuardedRunner, ProcessCommandRunner,
};
use crate::store::{FileJobStore, JobStore, StoreError};

/// Errors raised while assembling the orchestrator.
#[derive(Debug, Error)]
pub enum ContextError {
    /// Configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The job store could not be opened.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The shared filesystem could not be opened.
    #[error(transparent)]
    MonkeyFs(#[from] MonkeyFsError),
}

/// Long-lived components shared by the daemon loop and request handlers.
#[derive(Debug)]
pub struct Orchestrator {
    config: CoreConfig,
    store: Arc<dyn JobStore>,
    providers: Arc<ProviderRegistry>,
    clock: Arc<dyn Clock>,
    uids: JobUidGenerator,
    monkeyfs: MonkeyFs,
    pool: DispatchPool,
    reconciler: ReconciliationLoop,
}

impl Orchestrator {
    /// Builds the production stack: a file-backed store, Ansible-driven
    /// providers and the shared filesystem under the configured root.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError`] when configuration is invalid or a
    /// directory cannot be opened.
    pub fn from_config(
        config: CoreConfig,
        providers: &[ProviderConfig],
    ) -> Result<Self, ContextError> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store: Arc<dyn JobStore> = Arc::new(FileJobStore::open(&config.store_dir())?);
        let monkeyfs = MonkeyFs::open(&config.monkeyfs_dir())?;

        let commands: Arc<dyn CommandRunner> = Arc::new(ProcessCommandRunner);
        let ansible = AnsibleRunner::new(
            Arc::clone(&commands),
            config.ansible_bin.as_str(),
            config.ansible_playbook_bin.as_str(),
            config.ansible_root(),
        );
        let deps = ProviderDeps {
            remote: GuardedRunner::new(Arc::new(ansible), GenerationTracker::new()),
            commands,
            clock: Arc::clone(&clock),
            health: config.health_check(),
            cache_cooldown: config.cache_cooldown(),
            create_policy: CreatePolicy::within(
                CREATE_POLL_BUDGET,
                CREATE_POLL_BACKOFF,
                config.health_check().timeout,
            ),
            ansible_dir: config.ansible_root(),
            inventory_bin: config.ansible_inventory_bin.clone(),
            monkeyfs_path: config.monkeyfs_dir(),
        };
        let registry = ProviderRegistry::from_configs(providers, &deps);
        if registry.is_empty() {
            tracing::warn!("no usable providers configured");
        }
        Ok(Self::assemble(config, store, registry, clock, monkeyfs))
    }

    /// Builds an orchestrator from already constructed parts.
    #[must_use]
    pub fn assemble(
        config: CoreConfig,
        store: Arc<dyn JobStore>,
        providers: ProviderRegistry,
        clock: Arc<dyn Clock>,
        monkeyfs: MonkeyFs,
    ) -> Self {
        let providers = Arc::new(providers);
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&providers),
            Arc::clone(&clock),
        );
        let pool = DispatchPool::new(dispatcher);
        let reconciler = ReconciliationLoop::new(
            Arc::clone(&store),
            Arc::clone(&providers),
            Arc::clone(&clock),
            pool.clone(),
            config.reconcile_settings(),
        );
        Self {
            uids: JobUidGenerator::new(Arc::clone(&clock)),
            config,
            store,
            providers,
            clock,
            monkeyfs,
            pool,
            reconciler,
        }
    }

    /// Effective configuration.
    #[must_use]
    pub const fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Job store shared with the dispatcher.
    #[must_use]
    pub fn store(&self) -> &dyn JobStore {
        self.store.as_ref()
    }

    /// Registered providers.
    #[must_use]
    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Time source.
    #[must_use]
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Shared filesystem on the control node.
    #[must_use]
    pub const fn monkeyfs(&self) -> &MonkeyFs {
        &self.monkeyfs
    }

    /// Background dispatch tasks.
    #[must_use]
    pub const fn pool(&self) -> &DispatchPool {
        &self.pool
    }

    /// Periodic reconciliation driver.
    #[must_use]
    pub const fn reconciler(&self) -> &ReconciliationLoop {
        &self.reconciler
    }

    /// Issues a fresh job identifier.
    #[must_use]
    pub fn next_job_uid(&self) -> String {
        self.uids.next_uid()
    }
}
