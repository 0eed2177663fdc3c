//! Dispatch pipeline driving one job from `QUEUED` to `FINISHED`.
//!
//! Every phase is entered through a guarded store transition before its
//! remote work starts, so the persisted state always names the last phase
//! attempted. A failed phase returns the job to `QUEUED`; a failed cleanup
//! leaves it in `CLEANUP` for the reconciliation loop. When a guard finds
//! the job already moved on (for example requeued after a timeout) the
//! pipeline stops without touching it again.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::clock::Clock;
use crate::job::{JobRecord, JobState};
use crate::provider::ProviderRegistry;
use crate::store::{self, JobStore, StoreError};

/// How a pipeline run ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DispatchOutcome {
    /// The job reached `FINISHED`.
    Finished,
    /// A phase failed and the job went back to `QUEUED`.
    Requeued {
        /// Phase that failed.
        phase: JobState,
        /// Failure message.
        reason: String,
    },
    /// The job ran but its cleanup failed; it stays in `CLEANUP`.
    CleanupPending {
        /// Failure message.
        reason: String,
    },
    /// Another component moved the job first; the pipeline stopped.
    Preempted {
        /// State found in the store.
        found: JobState,
    },
}

impl fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Finished => f.write_str("finished"),
            Self::Requeued { phase, reason } => write!(f, "requeued after {phase}: {reason}"),
            Self::CleanupPending { reason } => write!(f, "cleanup pending: {reason}"),
            Self::Preempted { found } => write!(f, "preempted, job is {found}"),
        }
    }
}

/// Errors that stop the pipeline before it can decide an outcome.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DispatchError {
    /// The store could not be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The job names a provider that is not registered.
    #[error("job {job_uid} is bound to unknown provider {provider}")]
    UnknownProvider {
        /// Job identifier.
        job_uid: String,
        /// Provider name from the job.
        provider: String,
    },
}

enum Halt {
    Done(DispatchOutcome),
    Failed(DispatchError),
}

impl From<DispatchError> for Halt {
    fn from(value: DispatchError) -> Self {
        Self::Failed(value)
    }
}

impl From<StoreError> for Halt {
    fn from(value: StoreError) -> Self {
        Self::Failed(DispatchError::Store(value))
    }
}

/// Runs the dispatch pipeline against the persisted job collection.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    providers: Arc<ProviderRegistry>,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    /// Creates a dispatcher over the given store and providers.
    #[must_use]
    pub fn new(
        store: Arc<dyn JobStore>,
        providers: Arc<ProviderRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            providers,
            clock,
        }
    }

    /// Drives `job_uid` through every phase.
    ///
    /// The job must be `QUEUED` or `DISPATCHING`; anything else is reported
    /// as [`DispatchOutcome::Preempted`].
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] when the store fails or the job's provider
    /// is not registered. Remote failures are outcomes, not errors.
    pub async fn run_job(&self, job_uid: &str) -> Result<DispatchOutcome, DispatchError> {
        let result = self.pipeline(job_uid).await;
        let outcome = match result {
            Ok(outcome) | Err(Halt::Done(outcome)) => outcome,
            Err(Halt::Failed(err)) => {
                tracing::error!(job_uid, error = %err, "dispatch failed");
                return Err(err);
            }
        };
        tracing::info!(job_uid, outcome = %outcome, "dispatch ended");
        Ok(outcome)
    }

    async fn pipeline(&self, job_uid: &str) -> Result<DispatchOutcome, Halt> {
        let record = self.store.load(job_uid)?;
        let Some(provider) = self.providers.get(&record.provider_name) else {
            if record.state() == JobState::Dispatching {
                self.requeue(job_uid, JobState::Dispatching, &"provider not registered")?;
            }
            return Err(Halt::Failed(DispatchError::UnknownProvider {
                job_uid: job_uid.to_owned(),
                provider: record.provider_name,
            }));
        };
        let spec = &record.job_spec;
        let settings = provider.settings();

        self.advance(
            job_uid,
            &[JobState::Queued, JobState::Dispatching],
            JobState::DispatchingMachine,
        )?;
        let instance = match provider.create_instance(&spec.instance, spec).await {
            Ok(instance) => instance,
            Err(err) => return self.requeue(job_uid, JobState::DispatchingMachine, &err),
        };
        tracing::debug!(job_uid, instance = instance.name(), "instance ready");

        self.advance(
            job_uid,
            &[JobState::DispatchingMachine],
            JobState::DispatchingInstalls,
        )?;
        for dependency in &spec.install {
            if let Err(err) = instance.install_dependency(dependency).await {
                return self.requeue(job_uid, JobState::DispatchingInstalls, &err);
            }
        }

        self.advance(
            job_uid,
            &[JobState::DispatchingInstalls],
            JobState::DispatchingSetup,
        )?;
        if let Err(err) = instance.mount_shared_filesystem(spec, &settings).await {
            return self.requeue(job_uid, JobState::DispatchingSetup, &err);
        }
        if let Err(err) = instance.setup_job(spec, &settings).await {
            return self.requeue(job_uid, JobState::DispatchingSetup, &err);
        }

        self.advance(job_uid, &[JobState::DispatchingSetup], JobState::Running)?;
        if let Err(err) = instance.run_job(spec, &settings).await {
            return self.requeue(job_uid, JobState::Running, &err);
        }

        self.advance(job_uid, &[JobState::Running], JobState::Cleanup)?;
        self.note_cleanup_attempt(job_uid)?;
        if let Err(err) = instance.cleanup_job(spec, &settings).await {
            tracing::warn!(job_uid, error = %err, "cleanup failed, leaving job in cleanup");
            return Ok(DispatchOutcome::CleanupPending {
                reason: err.to_string(),
            });
        }

        self.advance(job_uid, &[JobState::Cleanup], JobState::Finished)?;
        Ok(DispatchOutcome::Finished)
    }

    fn advance(&self, job_uid: &str, expected: &[JobState], next: JobState) -> Result<(), Halt> {
        match store::transition(&*self.store, job_uid, expected, next, self.clock.now()) {
            Ok(_) => Ok(()),
            Err(StoreError::UnexpectedState { found, .. }) => {
                Err(Halt::Done(DispatchOutcome::Preempted { found }))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn requeue(
        &self,
        job_uid: &str,
        phase: JobState,
        cause: &dyn fmt::Display,
    ) -> Result<DispatchOutcome, Halt> {
        let reason = cause.to_string();
        match store::requeue(&*self.store, job_uid, &[phase], &reason, self.clock.now()) {
            Ok(_) => Ok(DispatchOutcome::Requeued { phase, reason }),
            Err(StoreError::UnexpectedState { found, .. }) => {
                Ok(DispatchOutcome::Preempted { found })
            }
            Err(err) => Err(err.into()),
        }
    }

    fn note_cleanup_attempt(&self, job_uid: &str) -> Result<(), Halt> {
        let now = self.clock.now();
        self.store.update(job_uid, &mut |record: &mut JobRecord| {
            record.record_cleanup_attempt(now);
            Ok(())
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
