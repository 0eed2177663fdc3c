//! Cloud machines provisioned for a single job.
//!
//! AWS and GCP instances differ only in the provisioning roles they use,
//! which live under a directory named after the provider kind.

use std::net::IpAddr;

use camino::Utf8PathBuf;

use super::staging::Stager;
use super::{
    HealthFuture, Instance, InstanceCore, InstanceDetails, InstanceError, InstanceFuture,
    PathLayout,
};
use crate::job::JobSpec;
use crate::provider::{ProviderKind, ProviderSettings};
use crate::remote::{OperationSpec, RemoteHost};

/// A cloud VM named after the job it runs.
#[derive(Debug)]
pub struct CloudInstance {
    core: InstanceCore,
    kind: ProviderKind,
    ssh_user: String,
    location: String,
}

impl CloudInstance {
    /// Wraps an inventory host of a cloud provider.
    #[must_use]
    pub fn new(
        core: InstanceCore,
        kind: ProviderKind,
        ssh_user: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            core,
            kind,
            ssh_user: ssh_user.into(),
            location: location.into(),
        }
    }

    fn mount_role(&self) -> String {
        format!("{}/mount_fs", self.kind)
    }

    fn terminate_playbook(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(self.kind.as_str()).join("terminate.yml")
    }

    fn stager(&self) -> Stager<'_> {
        Stager::new(&self.core, self)
    }
}

impl PathLayout for CloudInstance {
    fn scratch_dir(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("/home/{}/monkey", self.ssh_user))
    }

    fn monkeyfs_dir(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("/home/{}/monkeyfs", self.ssh_user))
    }
}

impl Instance for CloudInstance {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn ip_address(&self) -> Option<IpAddr> {
        self.core.ip_address()
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn details(&self) -> InstanceDetails {
        InstanceDetails {
            name: self.core.name().to_owned(),
            provider_type: self.kind,
            ip_address: self.core.ip_address(),
            location: self.location.clone(),
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
            if settings.storage_name.as_deref().is_none_or(str::is_empty) {
                return Err(InstanceError::Config {
                    instance: self.name().to_owned(),
                    message: format!("provider {} has no storage bucket configured", settings.name),
                });
            }
            let mut vars = settings.to_vars();
            vars.insert(
                String::from("monkeyfs_dir"),
                serde_json::Value::String(self.monkeyfs_dir().into_string()),
            );
            self.core
                .run("mount_shared_filesystem", &OperationSpec::role(self.mount_role()), vars)
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

    fn cleanup_job<'a>(
        &'a self,
        spec: &'a JobSpec,
        settings: &'a ProviderSettings,
    ) -> InstanceFuture<'a, ()> {
        Box::pin(async move {
            let mut vars = settings.to_vars();
            vars.insert(
                String::from("instance_name"),
                serde_json::Value::String(spec.job_uid.clone()),
            );
            self.core
                .run_on(
                    "cleanup_job",
                    &RemoteHost::control_node(),
                    &OperationSpec::playbook(self.terminate_playbook()),
                    vars,
                )
                .await
                .map(drop)
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
