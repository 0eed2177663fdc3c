//! AWS and GCP providers: one machine per job, discovered through the
//! dynamic inventory.

use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;

use super::inventory::{InventoryClient, InventoryHost};
use super::registry::ProviderDeps;
use super::{
    AwsProviderConfig, GcpProviderConfig, InstanceCache, Provider, ProviderError,
    ProviderFuture, ProviderKind, ProviderSettings,
};
use crate::instance::{CloudInstance, HealthCheck, Instance, InstanceCore};
use crate::job::{JobSpec, MachineParams};
use crate::remote::{GuardedRunner, OperationSpec, RemoteHost, Vars};

/// Time a create may spend polling after its playbook returns, health
/// probes included. Kept under the `DISPATCHING_MACHINE` timeout so the loop
/// never requeues a job whose machine is still coming up.
pub const CREATE_POLL_BUDGET: Duration = Duration::from_secs(160);
/// Delay between inventory polls.
pub const CREATE_POLL_BACKOFF: Duration = Duration::from_secs(10);

/// How long to wait for a freshly created machine to come up.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CreatePolicy {
    /// Inventory polls before giving up.
    pub attempts: u32,
    /// Fixed delay between polls.
    pub backoff: Duration,
}

impl CreatePolicy {
    /// Fits as many polls into `budget` as it allows when each one sleeps
    /// `backoff` and probes for up to `probe_timeout`. Always at least one.
    #[must_use]
    pub fn within(budget: Duration, backoff: Duration, probe_timeout: Duration) -> Self {
        let attempts = budget
            .as_millis()
            .checked_div(backoff.saturating_add(probe_timeout).as_millis())
            .and_then(|count| u32::try_from(count).ok())
            .unwrap_or(1)
            .max(1);
        Self { attempts, backoff }
    }

    /// Longest time polling can take when every health probe runs into
    /// `probe_timeout`.
    #[must_use]
    pub fn worst_case(&self, probe_timeout: Duration) -> Duration {
        self.backoff
            .saturating_add(probe_timeout)
            .saturating_mul(self.attempts)
    }
}

impl Default for CreatePolicy {
    fn default() -> Self {
        Self::within(
            CREATE_POLL_BUDGET,
            CREATE_POLL_BACKOFF,
            HealthCheck::default().timeout,
        )
    }
}

/// Cloud account that provisions a machine per job.
#[derive(Debug)]
pub struct CloudProvider {
    settings: ProviderSettings,
    valid: bool,
    ssh_user: String,
    create_vars: Vars,
    runner: GuardedRunner,
    inventory: InventoryClient,
    cache: InstanceCache,
    health: HealthCheck,
    policy: CreatePolicy,
}

fn insert_str(vars: &mut Vars, key: &str, value: Option<&str>) {
    if let Some(text) = value.filter(|text| !text.is_empty()) {
        vars.insert(key.to_owned(), Value::String(text.to_owned()));
    }
}

fn default_inventory(deps: &ProviderDeps, kind: ProviderKind) -> Utf8PathBuf {
    let file = match kind {
        ProviderKind::Gcp => "inventory.gcp.yml",
        ProviderKind::Aws | ProviderKind::Local => "inventory.aws_ec2.yml",
    };
    deps.ansible_dir.join("inventory").join(kind.as_str()).join(file)
}

impl CloudProvider {
    /// Builds an AWS provider.
    #[must_use]
    pub fn aws(config: &AwsProviderConfig, deps: &ProviderDeps) -> Self {
        let settings = ProviderSettings {
            name: config.name.clone(),
            kind: ProviderKind::Aws,
            credential_file: config.credential_file.clone(),
            region: config.region.clone(),
            zone: config.zone.clone(),
            project: None,
            storage_name: config.storage_name.clone(),
            local_monkeyfs_path: deps.monkeyfs_path.clone(),
        };
        let mut create_vars = Vars::new();
        insert_str(&mut create_vars, "key_name", config.key_name.as_deref());
        insert_str(&mut create_vars, "security_group", config.security_group.as_deref());
        let inventory = config
            .inventory
            .clone()
            .unwrap_or_else(|| default_inventory(deps, ProviderKind::Aws));
        Self::new(settings, config.is_valid(), &config.ssh_user, create_vars, inventory, deps)
    }

    /// Builds a GCP provider.
    #[must_use]
    pub fn gcp(config: &GcpProviderConfig, deps: &ProviderDeps) -> Self {
        let settings = ProviderSettings {
            name: config.name.clone(),
            kind: ProviderKind::Gcp,
            credential_file: config.credential_file.clone(),
            region: None,
            zone: config.zone.clone(),
            project: config.project.clone(),
            storage_name: config.storage_name.clone(),
            local_monkeyfs_path: deps.monkeyfs_path.clone(),
        };
        let inventory = config
            .inventory
            .clone()
            .unwrap_or_else(|| default_inventory(deps, ProviderKind::Gcp));
        Self::new(settings, config.is_valid(), &config.ssh_user, Vars::new(), inventory, deps)
    }

    fn new(
        settings: ProviderSettings,
        valid: bool,
        ssh_user: &str,
        create_vars: Vars,
        inventory: Utf8PathBuf,
        deps: &ProviderDeps,
    ) -> Self {
        Self {
            settings,
            valid,
            ssh_user: ssh_user.to_owned(),
            create_vars,
            runner: deps.remote.clone(),
            inventory: InventoryClient::new(
                Arc::clone(&deps.commands),
                deps.inventory_bin.clone(),
                inventory,
            ),
            cache: InstanceCache::new(deps.cache_cooldown, Arc::clone(&deps.clock)),
            health: deps.health,
            policy: deps.create_policy,
        }
    }

    fn instance_for(&self, host: InventoryHost) -> Arc<dyn Instance> {
        let remote = RemoteHost {
            pattern: host.name.clone(),
            inventory: self.inventory.source().to_string(),
            user: Some(self.ssh_user.clone()),
        };
        let core = InstanceCore::new(
            host.name,
            host.address,
            remote,
            self.runner.clone(),
            self.health,
        );
        Arc::new(CloudInstance::new(
            core,
            self.settings.kind,
            self.ssh_user.clone(),
            host.location,
        ))
    }

    async fn discover(&self) -> Result<Vec<Arc<dyn Instance>>, ProviderError> {
        let hosts = self.inventory.list().await?;
        Ok(hosts.into_iter().map(|host| self.instance_for(host)).collect())
    }

    fn create_vars_for(&self, name: &str, machine: &MachineParams) -> Vars {
        let mut vars = self.settings.to_vars();
        vars.extend(self.create_vars.clone());
        if let Ok(Value::Object(params)) = serde_json::to_value(machine) {
            vars.extend(params.into_iter().filter(|(_, value)| !value.is_null()));
        }
        vars.insert(String::from("instance_name"), Value::String(name.to_owned()));
        vars.insert(
            String::from("monkey_step"),
            Value::String(String::from("create_instance")),
        );
        vars
    }

    async fn wait_until_ready(&self, name: &str) -> Result<Arc<dyn Instance>, ProviderError> {
        for attempt in 1..=self.policy.attempts {
            let found = match self.cache.refreshed(true, || self.discover()).await {
                Ok(state) => state.get(name),
                Err(err) => {
                    tracing::warn!(instance = name, attempt, error = %err, "inventory poll failed");
                    None
                }
            };
            if let Some(instance) = found {
                if instance.check_online().await && instance.details().offline_count == 0 {
                    return Ok(instance);
                }
            }
            tracing::debug!(instance = name, attempt, "waiting for instance");
            tokio::time::sleep(self.policy.backoff).await;
        }
        Err(ProviderError::NotReady {
            instance: name.to_owned(),
            attempts: self.policy.attempts,
        })
    }
}

impl Provider for CloudProvider {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn kind(&self) -> ProviderKind {
        self.settings.kind
    }

    fn is_valid(&self) -> bool {
        self.valid
    }

    fn settings(&self) -> ProviderSettings {
        self.settings.clone()
    }

    fn local_filesystem_path(&self) -> &Utf8Path {
        &self.settings.local_monkeyfs_path
    }

    fn create_instance<'a>(
        &'a self,
        machine: &'a MachineParams,
        spec: &'a JobSpec,
    ) -> ProviderFuture<'a, Arc<dyn Instance>> {
        Box::pin(async move {
            let name = spec.job_uid.as_str();
            let playbook = Utf8PathBuf::from(self.settings.kind.as_str()).join("create.yml");
            self.runner
                .run(
                    name,
                    &RemoteHost::control_node(),
                    &OperationSpec::playbook(playbook),
                    &self.create_vars_for(name, machine),
                )
                .await
                .map_err(|source| ProviderError::Create {
                    instance: name.to_owned(),
                    source,
                })?;
            tracing::info!(provider = %self.settings.name, instance = name, "instance created");
            self.wait_until_ready(name).await
        })
    }

    fn get_instance<'a>(&'a self, name: &'a str) -> ProviderFuture<'a, Option<Arc<dyn Instance>>> {
        Box::pin(async move {
            let state = self.cache.refreshed(false, || self.discover()).await?;
            Ok(state.get(name))
        })
    }

    fn list_instances(&self) -> ProviderFuture<'_, Vec<Arc<dyn Instance>>> {
        Box::pin(async move {
            let state = self.cache.refreshed(false, || self.discover()).await?;
            Ok(state.instances())
        })
    }
}
