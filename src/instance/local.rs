//! Pre-registered hosts of a local provider.

use std::net::IpAddr;

use camino::Utf8PathBuf;

use super::staging::Stager;
use super::{
    HealthFuture, Instance, InstanceCore, InstanceDetails, InstanceFuture, PathLayout,
};
use crate::job::JobSpec;
use crate::provider::{LocalHost, ProviderKind, ProviderSettings};
use crate::remote::OperationSpec;

const MOUNT_ROLE: &str = "local/mount_fs";

/// A long-lived host that runs jobs but is never created or destroyed by
/// the orchestrator.
#[derive(Debug)]
pub struct LocalInstance {
    core: InstanceCore,
    host: LocalHost,
}

impl LocalInstance {
    /// Wraps a registered host.
    #[must_use]
    pub const fn new(core: InstanceCore, host: LocalHost) -> Self {
        Self { core, host }
    }

    fn stager(&self) -> Stager<'_> {
        Stager::new(&self.core, self)
    }
}

impl PathLayout for LocalInstance {
    fn scratch_dir(&self) -> Utf8PathBuf {
        self.host.scratch_dir.clone()
    }

    fn monkeyfs_dir(&self) -> Utf8PathBuf {
        self.host.monkeyfs_dir.clone()
    }
}

impl Instance for LocalInstance {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn ip_address(&self) -> Option<IpAddr> {
        self.core.ip_address()
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    fn details(&self) -> InstanceDetails {
        InstanceDetails {
            name: self.core.name().to_owned(),
            provider_type: ProviderKind::Local,
            ip_address: self.core.ip_address(),
            location: self.host.address.clone(),
            offline_count: self.core.offline_count(),
        }
    }

    fn check_online(&self) -> HealthFuture<'_> {
        Box::pin(self.core.check_online())
    }

    fn install_dependency<'a>(&'a self, name: &'a str) -> InstanceFuture<'a, ()> {
        Box::pin(async move {
            self.stager()
                .install_dependency(name)
                .await
                .map_err(|err| err.on(self.name()))
        })
    }

    fn mount_shared_filesystem<'a>(
        &'a self,
        _spec: &'a JobSpec,
        settings: &'a ProviderSettings,
    ) -> InstanceFuture<'a, ()> {
        Box::pin(async move {
            let mut vars = settings.to_vars();
            vars.insert(
                String::from("monkeyfs_dir"),
                serde_json::Value::String(self.host.monkeyfs_dir.to_string()),
            );
            self.core
                .run(
                    "mount_shared_filesystem",
                    &OperationSpec::role(MOUNT_ROLE),
                    vars,
                )
                .await
                .map(drop)
                .map_err(|err| err.on(self.name()))
        })
    }

    fn setup_job<'a>(
        &'a self,
        spec: &'a JobSpec,
        _settings: &'a ProviderSettings,
    ) -> InstanceFuture<'a, ()> {
        Box::pin(async move {
            self.stager()
                .setup_job(spec)
                .await
                .map_err(|err| err.on(self.name()))
        })
    }

    fn run_job<'a>(
        &'a self,
        spec: &'a JobSpec,
        _settings: &'a ProviderSettings,
    ) -> InstanceFuture<'a, ()> {
        Box::pin(async move {
            self.stager()
                .execute_command(spec)
                .await
                .map_err(|err| err.on(self.name()))
        })
    }

    /// Local hosts outlive their jobs: cleanup only stops the persistence
    /// loop and flushes persisted folders one last time.
    fn cleanup_job<'a>(
        &'a self,
        spec: &'a JobSpec,
        _settings: &'a ProviderSettings,
    ) -> InstanceFuture<'a, ()> {
        Box::pin(async move {
            self.stager()
                .stop_persist(spec)
                .await
                .map_err(|err| err.on(self.name()))
        })
    }

    fn fetch_hyperparameters<'a>(
        &'a self,
        spec: &'a JobSpec,
    ) -> InstanceFuture<'a, Option<serde_json::Value>> {
        Box::pin(async move {
            self.stager()
                .fetch_hyperparameters(spec)
                .await
                .map_err(|err| err.on(self.name()))
        })
    }
}
