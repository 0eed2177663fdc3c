//! Local provider: a fixed pool of pre-registered hosts.

use std::net::IpAddr;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use super::registry::ProviderDeps;
use super::{
    InstanceCache, LocalHost, LocalProviderConfig, Provider, ProviderError, ProviderFuture,
    ProviderKind, ProviderSettings,
};
use crate::instance::{HealthCheck, Instance, InstanceCore, LocalInstance};
use crate::job::{JobSpec, MachineParams};
use crate::remote::{GuardedRunner, RemoteHost};

/// Hands out registered hosts by name; never creates or destroys machines.
#[derive(Debug)]
pub struct LocalProvider {
    config: LocalProviderConfig,
    monkeyfs_path: Utf8PathBuf,
    runner: GuardedRunner,
    cache: InstanceCache,
    health: HealthCheck,
}

async fn resolve(address: &str, port: u16) -> Option<IpAddr> {
    if let Ok(ip) = address.parse() {
        return Some(ip);
    }
    match tokio::net::lookup_host((address, port)).await {
        Ok(mut addrs) => addrs.next().map(|addr| addr.ip()),
        Err(err) => {
            tracing::warn!(address, error = %err, "failed to resolve local host");
            None
        }
    }
}

impl LocalProvider {
    /// Builds a provider from its configuration table.
    #[must_use]
    pub fn new(config: &LocalProviderConfig, deps: &ProviderDeps) -> Self {
        Self {
            monkeyfs_path: config.monkeyfs_path_or(&deps.monkeyfs_path).to_owned(),
            config: config.clone(),
            runner: deps.remote.clone(),
            cache: InstanceCache::new(deps.cache_cooldown, Arc::clone(&deps.clock)),
            health: deps.health,
        }
    }

    async fn instance_for(&self, host: &LocalHost) -> Arc<dyn Instance> {
        let ip = resolve(&host.address, self.health.port).await;
        let remote = RemoteHost::address(host.address.clone(), host.ssh_user.clone());
        let core = InstanceCore::new(host.name.clone(), ip, remote, self.runner.clone(), self.health);
        Arc::new(LocalInstance::new(core, host.clone()))
    }

    async fn discover(&self) -> Result<Vec<Arc<dyn Instance>>, ProviderError> {
        let mut instances = Vec::with_capacity(self.config.hosts.len());
        for host in &self.config.hosts {
            instances.push(self.instance_for(host).await);
        }
        Ok(instances)
    }
}

impl Provider for LocalProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    fn is_valid(&self) -> bool {
        self.config.is_valid()
    }

    fn settings(&self) -> ProviderSettings {
        ProviderSettings {
            name: self.config.name.clone(),
            kind: ProviderKind::Local,
            credential_file: None,
            region: None,
            zone: None,
            project: None,
            storage_name: None,
            local_monkeyfs_path: self.monkeyfs_path.clone(),
        }
    }

    fn local_filesystem_path(&self) -> &Utf8Path {
        &self.monkeyfs_path
    }

    fn create_instance<'a>(
        &'a self,
        machine: &'a MachineParams,
        spec: &'a JobSpec,
    ) -> ProviderFuture<'a, Arc<dyn Instance>> {
        Box::pin(async move {
            let name = machine
                .name
                .as_deref()
                .filter(|name| !name.is_empty())
                .ok_or(ProviderError::MissingHostName)?;
            let state = self.cache.refreshed(false, || self.discover()).await?;
            let instance = state
                .get(name)
                .ok_or_else(|| ProviderError::UnknownHost(name.to_owned()))?;
            tracing::info!(
                provider = %self.config.name,
                instance = name,
                job_uid = %spec.job_uid,
                "local host claimed"
            );
            Ok(instance)
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
