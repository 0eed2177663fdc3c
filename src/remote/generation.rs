//! Per-instance generation counters and the runner wrapper that enforces them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::{OperationOutcome, OperationSpec, RemoteError, RemoteHost, RemoteRunner, Vars};

/// Process-wide registry of generation counters keyed by instance name.
///
/// Clones share the same registry, so every component that may touch an
/// instance observes the same counter.
#[derive(Clone, Debug, Default)]
pub struct GenerationTracker {
    counters: Arc<Mutex<HashMap<String, Arc<Mutex<u64>>>>>,
}

/// Generation captured when an operation starts.
#[derive(Clone, Debug)]
pub struct GenerationToken {
    instance: String,
    issued: u64,
    counter: Arc<Mutex<u64>>,
}

impl GenerationToken {
    /// Instance the token belongs to.
    #[must_use]
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Generation value captured at issue time.
    #[must_use]
    pub const fn issued(&self) -> u64 {
        self.issued
    }

    /// Current generation of the instance.
    #[must_use]
    pub fn current(&self) -> u64 {
        *self.counter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` while no newer operation has been issued.
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.current() == self.issued
    }
}

impl GenerationTracker {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, instance: &str) -> Arc<Mutex<u64>> {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            counters
                .entry(instance.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(0))),
        )
    }

    /// Increments the instance's generation and returns the new token.
    #[must_use]
    pub fn issue(&self, instance: &str) -> GenerationToken {
        let counter = self.counter(instance);
        let issued = {
            let mut value = counter.lock().unwrap_or_else(PoisonError::into_inner);
            *value = value.saturating_add(1);
            *value
        };
        GenerationToken {
            instance: instance.to_owned(),
            issued,
            counter,
        }
    }

    /// Current generation of `instance`; zero if nothing was issued yet.
    #[must_use]
    pub fn current(&self, instance: &str) -> u64 {
        let counter = self.counter(instance);
        let value = *counter.lock().unwrap_or_else(PoisonError::into_inner);
        value
    }
}

/// Runs operations under a freshly issued generation token and rejects
/// results that are failed or stale.
#[derive(Clone, Debug)]
pub struct GuardedRunner {
    runner: Arc<dyn RemoteRunner>,
    generations: GenerationTracker,
}

impl GuardedRunner {
    /// Wraps `runner`, sharing `generations` with other guarded runners.
    #[must_use]
    pub const fn new(runner: Arc<dyn RemoteRunner>, generations: GenerationTracker) -> Self {
        Self {
            runner,
            generations,
        }
    }

    /// Shared generation registry.
    #[must_use]
    pub const fn generations(&self) -> &GenerationTracker {
        &self.generations
    }

    /// Runs `operation` against `host` on behalf of `instance`.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Superseded`] when a newer operation for the same
    /// instance was issued before this one returned, whatever its own status;
    /// [`RemoteError::Failed`] when the operation reported failure; or the
    /// runner's spawn error.
    pub async fn run(
        &self,
        instance: &str,
        host: &RemoteHost,
        operation: &OperationSpec,
        vars: &Vars,
    ) -> Result<OperationOutcome, RemoteError> {
        let token = self.generations.issue(instance);
        tracing::debug!(
            instance,
            host = %host.pattern,
            operation = %operation,
            generation = token.issued(),
            "remote operation started"
        );
        let cancelled = || !token.is_current();
        let result = self.runner.run(host, operation, vars, &cancelled).await;

        if !token.is_current() {
            let current = token.current();
            tracing::warn!(
                instance,
                operation = %operation,
                issued = token.issued(),
                current,
                "remote operation superseded"
            );
            return Err(RemoteError::Superseded {
                operation: operation.to_string(),
                issued: token.issued(),
                current,
            });
        }

        accept(instance, operation, result?)
    }

    /// Runs a read-only `operation` without issuing a generation.
    ///
    /// Work already in flight on `instance` stays current, and the read
    /// itself is never cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Failed`] when the operation reported failure,
    /// or the runner's spawn error.
    pub async fn observe(
        &self,
        instance: &str,
        host: &RemoteHost,
        operation: &OperationSpec,
        vars: &Vars,
    ) -> Result<OperationOutcome, RemoteError> {
        tracing::debug!(
            instance,
            host = %host.pattern,
            operation = %operation,
            generation = self.generations.current(instance),
            "remote read started"
        );
        let never = || false;
        let outcome = self.runner.run(host, operation, vars, &never).await?;
        accept(instance, operation, outcome)
    }
}

fn accept(
    instance: &str,
    operation: &OperationSpec,
    outcome: OperationOutcome,
) -> Result<OperationOutcome, RemoteError> {
    tracing::debug!(
        instance,
        operation = %operation,
        status = ?outcome.status,
        "remote operation finished"
    );
    if outcome.is_success() {
        Ok(outcome)
    } else {
        Err(RemoteError::Failed {
            operation: operation.to_string(),
            message: outcome.stderr,
        })
    }
}
