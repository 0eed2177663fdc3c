//! Periodic reconciliation of persisted job state against live instances.
//!
//! Each pass runs under a single lock and works in three steps:
//!
//! 1. Queued jobs are claimed (`QUEUED → DISPATCHING`) in creation order and
//!    handed to the [`DispatchPool`].
//! 2. Recent non-queued jobs are audited: timed-out phases are requeued,
//!    jobs whose instance vanished or went offline are requeued, overdue
//!    runs are moved to cleanup, pending cleanups are retried, and finished
//!    jobs whose cloud instance is still alive are sent back to cleanup.
//! 3. Hyperparameters are fetched for running or completed jobs that do
//!    not have them yet. The reads issue no generation, so a command still
//!    running on the instance is not superseded.
//!
//! Before the steps, dispatch statuses of finished or vanished jobs are
//! pruned from the pool.
//!
//! A failure while checking one job is logged and counted; it never stops
//! the pass.

mod pool;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;

use crate::clock::Clock;
use crate::instance::{Instance, InstanceError};
use crate::job::{JobRecord, JobState};
use crate::provider::{Provider, ProviderError, ProviderRegistry};
use crate::store::{self, JobStore, StoreError};

pub use pool::{DispatchPool, DispatchStatus};

/// Default reconciliation interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);
/// Default trailing window for dead-job checks.
pub const DEFAULT_DEAD_JOB_WINDOW: TimeDelta = TimeDelta::days(10);

/// Timing knobs for the reconciliation loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReconcileSettings {
    /// Delay between passes.
    pub interval: Duration,
    /// Jobs created earlier than this before now are ignored.
    pub dead_job_window: TimeDelta,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            dead_job_window: DEFAULT_DEAD_JOB_WINDOW,
        }
    }
}

/// What one pass did.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PassReport {
    /// Jobs handed to the dispatch pool.
    pub dispatched: Vec<String>,
    /// Jobs returned to `QUEUED`.
    pub requeued: Vec<String>,
    /// Jobs moved forward (or back to cleanup) and the state they entered.
    pub advanced: Vec<(String, JobState)>,
    /// Jobs whose hyperparameters were stored.
    pub hyperparameters: Vec<String>,
    /// Number of jobs whose check failed.
    pub failures: usize,
}

impl PassReport {
    /// Returns `true` when the pass changed nothing.
    #[must_use]
    pub fn is_quiet(&self) -> bool {
        self.dispatched.is_empty()
            && self.requeued.is_empty()
            && self.advanced.is_empty()
            && self.hyperparameters.is_empty()
            && self.failures == 0
    }
}

#[derive(Debug, Error)]
enum CheckError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Instance(#[from] InstanceError),
    #[error("provider {0} is not registered")]
    UnknownProvider(String),
}

enum Repair {
    Unchanged,
    Requeued,
    Advanced(JobState),
}

/// Drives reconciliation passes against the job store.
#[derive(Debug)]
pub struct ReconciliationLoop {
    store: Arc<dyn JobStore>,
    providers: Arc<ProviderRegistry>,
    clock: Arc<dyn Clock>,
    pool: DispatchPool,
    settings: ReconcileSettings,
    pass_lock: Mutex<()>,
}

impl ReconciliationLoop {
    /// Creates a loop dispatching through `pool`.
    #[must_use]
    pub fn new(
        store: Arc<dyn JobStore>,
        providers: Arc<ProviderRegistry>,
        clock: Arc<dyn Clock>,
        pool: DispatchPool,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            store,
            providers,
            clock,
            pool,
            settings,
            pass_lock: Mutex::new(()),
        }
    }

    /// Loop timing settings.
    #[must_use]
    pub const fn settings(&self) -> ReconcileSettings {
        self.settings
    }

    /// Runs passes every interval until `shutdown` resolves.
    ///
    /// A pass that overruns the interval delays the next tick instead of
    /// triggering a burst of catch-up passes.
    pub async fn daemon_loop<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        tracing::info!(
            interval_secs = self.settings.interval.as_secs(),
            "reconciliation loop started"
        );
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                _ = ticker.tick() => {
                    let report = self.run_pass().await;
                    if report.is_quiet() {
                        tracing::trace!("reconciliation pass idle");
                    } else {
                        tracing::info!(
                            dispatched = report.dispatched.len(),
                            requeued = report.requeued.len(),
                            advanced = report.advanced.len(),
                            failures = report.failures,
                            "reconciliation pass complete"
                        );
                    }
                }
            }
        }
        tracing::info!(active = self.pool.active(), "reconciliation loop stopped");
    }

    /// Runs one pass. Concurrent callers are serialised.
    pub async fn run_pass(&self) -> PassReport {
        let _guard = self.pass_lock.lock().await;
        let mut report = PassReport::default();
        let records = match self.store.list() {
            Ok(records) => records,
            Err(err) => {
                tracing::error!(error = %err, "failed to list jobs");
                report.failures += 1;
                return report;
            }
        };

        self.prune_settled(&records);
        self.check_for_queued_jobs(&records, &mut report);
        self.check_for_dead_jobs(&records, &mut report).await;
        self.fetch_missing_hyperparameters(&records, &mut report).await;
        report
    }

    fn prune_settled(&self, records: &[JobRecord]) {
        let live: HashSet<&str> = records
            .iter()
            .filter(|record| record.state() != JobState::Finished)
            .map(|record| record.job_uid.as_str())
            .collect();
        let pruned = self.pool.prune(|job_uid| !live.contains(job_uid));
        if pruned > 0 {
            tracing::debug!(pruned, "dropped settled dispatch statuses");
        }
    }

    fn check_for_queued_jobs(&self, records: &[JobRecord], report: &mut PassReport) {
        for record in records.iter().filter(|record| record.state() == JobState::Queued) {
            let job_uid = record.job_uid.as_str();
            if self.providers.get(&record.provider_name).is_none() {
                tracing::warn!(
                    job_uid,
                    provider = %record.provider_name,
                    "provider not registered, leaving job queued"
                );
                continue;
            }
            if self.pool.is_running(job_uid) {
                tracing::debug!(job_uid, "previous pipeline still winding down");
                continue;
            }
            match store::transition(
                &*self.store,
                job_uid,
                &[JobState::Queued],
                JobState::Dispatching,
                self.clock.now(),
            ) {
                Ok(_) => {}
                Err(StoreError::UnexpectedState { found, .. }) => {
                    tracing::debug!(job_uid, state = %found, "job claimed elsewhere");
                    continue;
                }
                Err(err) => {
                    tracing::error!(job_uid, error = %err, "failed to claim job");
                    report.failures += 1;
                    continue;
                }
            }
            if self.pool.spawn(job_uid) {
                report.dispatched.push(job_uid.to_owned());
            }
        }
    }

    async fn check_for_dead_jobs(&self, records: &[JobRecord], report: &mut PassReport) {
        let now = self.clock.now();
        for record in records
            .iter()
            .filter(|record| record.state() != JobState::Queued && self.in_window(record, now))
        {
            let job_uid = record.job_uid.as_str();
            match self.check_dead_job(job_uid).await {
                Ok(Repair::Unchanged) => {}
                Ok(Repair::Requeued) => report.requeued.push(job_uid.to_owned()),
                Ok(Repair::Advanced(state)) => report.advanced.push((job_uid.to_owned(), state)),
                Err(err) => {
                    tracing::error!(job_uid, error = %err, "job check failed");
                    report.failures += 1;
                }
            }
        }
    }

    async fn check_dead_job(&self, job_uid: &str) -> Result<Repair, CheckError> {
        let now = self.clock.now();
        let record = self.store.update(job_uid, &mut |record: &mut JobRecord| {
            record.refresh_total_wall_time(now);
            Ok(())
        })?;
        let state = record.state();
        if state == JobState::Finished && !record.provider_type.owns_instance_lifecycle() {
            return Ok(Repair::Unchanged);
        }

        if state != JobState::Cleanup && record.state_timed_out(now) {
            return self.requeue(job_uid, state, "state timed out");
        }

        let provider = self
            .providers
            .get(&record.provider_name)
            .ok_or_else(|| CheckError::UnknownProvider(record.provider_name.clone()))?;
        let instance = match record.instance_name() {
            Some(name) => provider.get_instance(name).await?,
            None => None,
        };

        if state.requires_live_instance() {
            let reason = match &instance {
                None => Some("instance missing"),
                Some(live) if !live.check_online().await => Some("instance offline"),
                Some(_) => None,
            };
            if let Some(cause) = reason {
                return self.requeue(job_uid, state, cause);
            }
        }

        match state {
            JobState::Running if record.run_timed_out(now) => {
                tracing::info!(job_uid, "run timeout reached");
                self.advance(job_uid, JobState::Running, JobState::Cleanup)
            }
            JobState::Cleanup => self.retry_cleanup(&record, &*provider, instance, now).await,
            JobState::Finished => match instance {
                Some(live) if live.check_online().await => {
                    tracing::warn!(
                        job_uid,
                        instance = live.name(),
                        "finished job still holds an instance"
                    );
                    self.advance(job_uid, JobState::Finished, JobState::Cleanup)
                }
                _ => Ok(Repair::Unchanged),
            },
            _ => Ok(Repair::Unchanged),
        }
    }

    async fn retry_cleanup(
        &self,
        record: &JobRecord,
        provider: &dyn Provider,
        instance: Option<Arc<dyn Instance>>,
        now: DateTime<Utc>,
    ) -> Result<Repair, CheckError> {
        let job_uid = record.job_uid.as_str();
        let Some(live) = instance else {
            tracing::info!(job_uid, "instance gone, cleanup complete");
            return self.advance(job_uid, JobState::Cleanup, JobState::Finished);
        };
        if !cleanup_due(record, now) {
            return Ok(Repair::Unchanged);
        }
        if record.cleanup_attempts() > 0 && !live.check_online().await {
            return Ok(Repair::Unchanged);
        }

        self.store.update(job_uid, &mut |stored: &mut JobRecord| {
            stored.record_cleanup_attempt(now);
            Ok(())
        })?;
        tracing::info!(
            job_uid,
            attempt = record.cleanup_attempts().saturating_add(1),
            "running cleanup"
        );
        match live.cleanup_job(&record.job_spec, &provider.settings()).await {
            Ok(()) => self.advance(job_uid, JobState::Cleanup, JobState::Finished),
            Err(err) => {
                tracing::warn!(job_uid, error = %err, "cleanup failed, will retry");
                Ok(Repair::Unchanged)
            }
        }
    }

    async fn fetch_missing_hyperparameters(&self, records: &[JobRecord], report: &mut PassReport) {
        let now = self.clock.now();
        for record in records.iter().filter(|record| {
            record.hyperparameters.is_none()
                && matches!(
                    record.state(),
                    JobState::Running | JobState::Cleanup | JobState::Finished
                )
                && self.in_window(record, now)
        }) {
            let job_uid = record.job_uid.as_str();
            match self.fetch_hyperparameters(record).await {
                Ok(true) => report.hyperparameters.push(job_uid.to_owned()),
                Ok(false) => {}
                Err(err) => tracing::debug!(job_uid, error = %err, "hyperparameters unavailable"),
            }
        }
    }

    async fn fetch_hyperparameters(&self, record: &JobRecord) -> Result<bool, CheckError> {
        let provider = self
            .providers
            .get(&record.provider_name)
            .ok_or_else(|| CheckError::UnknownProvider(record.provider_name.clone()))?;
        let Some(name) = record.instance_name() else {
            return Ok(false);
        };
        let Some(instance) = provider.get_instance(name).await? else {
            return Ok(false);
        };
        let Some(value) = instance.fetch_hyperparameters(&record.job_spec).await? else {
            return Ok(false);
        };
        self.store
            .update(&record.job_uid, &mut |stored: &mut JobRecord| {
                stored.hyperparameters = Some(value.clone());
                Ok(())
            })?;
        tracing::debug!(job_uid = %record.job_uid, "hyperparameters stored");
        Ok(true)
    }

    fn in_window(&self, record: &JobRecord, now: DateTime<Utc>) -> bool {
        now - record.creation_date <= self.settings.dead_job_window
    }

    fn requeue(&self, job_uid: &str, state: JobState, reason: &str) -> Result<Repair, CheckError> {
        match store::requeue(&*self.store, job_uid, &[state], reason, self.clock.now()) {
            Ok(_) => Ok(Repair::Requeued),
            Err(StoreError::UnexpectedState { .. }) => Ok(Repair::Unchanged),
            Err(err) => Err(err.into()),
        }
    }

    fn advance(&self, job_uid: &str, from: JobState, to: JobState) -> Result<Repair, CheckError> {
        match store::transition(&*self.store, job_uid, &[from], to, self.clock.now()) {
            Ok(_) => Ok(Repair::Advanced(to)),
            Err(StoreError::UnexpectedState { .. }) => Ok(Repair::Unchanged),
            Err(err) => Err(err.into()),
        }
    }
}

/// A first cleanup is due immediately; later ones once the cleanup timeout
/// has passed since the previous attempt.
fn cleanup_due(record: &JobRecord, now: DateTime<Utc>) -> bool {
    let Some(last) = record.last_cleanup_attempt() else {
        return true;
    };
    let retry_after = JobState::Cleanup.timeout().unwrap_or_default();
    (now - last).to_std().unwrap_or_default() > retry_after
}

#[cfg(test)]
mod tests;
