//! State and plumbing shared by every instance variant: identity, health
//! checking and guarded remote execution.

use std::net::{IpAddr, SocketAddr};
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::remote::{GuardedRunner, OperationOutcome, OperationSpec, RemoteHost, Vars};

use super::staging::StepError;

/// Port every instance serves its health endpoint on.
pub const HEALTH_CHECK_PORT: u16 = 9991;
const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(4);
const DEFAULT_OFFLINE_THRESHOLD: u32 = 3;

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(DEFAULT_HEALTH_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Health probe settings.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HealthCheck {
    /// Port of the `/ping` endpoint.
    pub port: u16,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Consecutive failures after which the instance is reported offline.
    pub offline_threshold: u32,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            port: HEALTH_CHECK_PORT,
            timeout: DEFAULT_HEALTH_TIMEOUT,
            offline_threshold: DEFAULT_OFFLINE_THRESHOLD,
        }
    }
}

/// Consecutive failed health checks.
///
/// A failure below the threshold still reports the instance as online so a
/// transient blip does not requeue its job; the failure that reaches the
/// threshold reports it offline. Any success resets the count.
#[derive(Debug)]
pub struct OfflineCounter {
    count: AtomicU32,
    threshold: u32,
}

impl OfflineCounter {
    /// Creates a counter that trips after `threshold` consecutive failures.
    #[must_use]
    pub const fn new(threshold: u32) -> Self {
        Self {
            count: AtomicU32::new(0),
            threshold,
        }
    }

    /// Current number of consecutive failures.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    /// Clears the failure count.
    pub fn record_success(&self) {
        self.count.store(0, Ordering::SeqCst);
    }

    /// Counts a failure and returns whether the instance is still online.
    pub fn record_failure(&self) -> bool {
        let previous = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                Some(count.saturating_add(1))
            })
            .unwrap_or_else(|count| count);
        previous.saturating_add(1) < self.threshold
    }
}

/// Identity, health state and remote access for one instance.
#[derive(Debug)]
pub struct InstanceCore {
    name: String,
    ip_address: Option<IpAddr>,
    host: RemoteHost,
    runner: GuardedRunner,
    health: HealthCheck,
    offline: OfflineCounter,
}

impl InstanceCore {
    /// Creates the shared state for an instance reachable through `host`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        ip_address: Option<IpAddr>,
        host: RemoteHost,
        runner: GuardedRunner,
        health: HealthCheck,
    ) -> Self {
        Self {
            name: name.into(),
            ip_address,
            host,
            runner,
            offline: OfflineCounter::new(health.offline_threshold),
            health,
        }
    }

    /// Instance name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reachable address, if known.
    #[must_use]
    pub const fn ip_address(&self) -> Option<IpAddr> {
        self.ip_address
    }

    /// Host targeted by remote operations.
    #[must_use]
    pub const fn host(&self) -> &RemoteHost {
        &self.host
    }

    /// Consecutive failed health checks.
    #[must_use]
    pub fn offline_count(&self) -> u32 {
        self.offline.count()
    }

    /// Probes `http://<ip>:<port>/ping` and applies the offline threshold.
    pub async fn check_online(&self) -> bool {
        let healthy = match self.ip_address {
            Some(ip) => probe(SocketAddr::new(ip, self.health.port), self.health.timeout).await,
            None => false,
        };
        if healthy {
            self.offline.record_success();
            return true;
        }
        let online = self.offline.record_failure();
        tracing::debug!(
            instance = %self.name,
            offline_count = self.offline.count(),
            online,
            "health check failed"
        );
        online
    }

    /// Runs `operation` against the instance's own host.
    ///
    /// # Errors
    ///
    /// Returns [`StepError`] naming `step` when the operation fails or is
    /// superseded.
    pub async fn run(
        &self,
        step: &'static str,
        operation: &OperationSpec,
        vars: Vars,
    ) -> Result<OperationOutcome, StepError> {
        self.run_on(step, &self.host, operation, vars).await
    }

    /// Runs `operation` against `host` under this instance's generation.
    ///
    /// Cloud teardown runs on the control node yet still belongs to the
    /// instance it destroys.
    ///
    /// # Errors
    ///
    /// Returns [`StepError`] naming `step` when the operation fails or is
    /// superseded.
    pub async fn run_on(
        &self,
        step: &'static str,
        host: &RemoteHost,
        operation: &OperationSpec,
        mut vars: Vars,
    ) -> Result<OperationOutcome, StepError> {
        vars.insert(
            String::from("monkey_step"),
            serde_json::Value::String(step.to_owned()),
        );
        self.runner
            .run(&self.name, host, operation, &vars)
            .await
            .map_err(|source| StepError { step, source })
    }

    /// Runs a read-only `operation` on the instance's host without
    /// superseding the operation currently in flight there.
    ///
    /// # Errors
    ///
    /// Returns [`StepError`] naming `step` when the operation fails.
    pub async fn read(
        &self,
        step: &'static str,
        operation: &OperationSpec,
        mut vars: Vars,
    ) -> Result<OperationOutcome, StepError> {
        vars.insert(
            String::from("monkey_step"),
            serde_json::Value::String(step.to_owned()),
        );
        self.runner
            .observe(&self.name, &self.host, operation, &vars)
            .await
            .map_err(|source| StepError { step, source })
    }
}

async fn probe(addr: SocketAddr, timeout: Duration) -> bool {
    let url = format!("http://{addr}/ping");
    match HTTP_CLIENT.get(&url).timeout(timeout).send().await {
        Ok(response) => response.status().is_success(),
        Err(_) => false,
    }
}
