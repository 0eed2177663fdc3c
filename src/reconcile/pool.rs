//! Background dispatch workers with per-job status tracking.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::dispatch::{DispatchOutcome, Dispatcher};

/// Last known status of a job's dispatch worker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DispatchStatus {
    /// The pipeline is still running.
    Running,
    /// The pipeline returned an outcome.
    Succeeded(DispatchOutcome),
    /// The pipeline stopped with an error.
    Failed(String),
    /// The worker task panicked or was cancelled.
    Panicked(String),
}

impl DispatchStatus {
    /// Returns `true` while the worker is still running.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Succeeded(outcome) => write!(f, "{outcome}"),
            Self::Failed(message) => write!(f, "failed: {message}"),
            Self::Panicked(message) => write!(f, "panicked: {message}"),
        }
    }
}

/// Spawns one task per dispatched job and records how each ended.
///
/// At most one pipeline runs per job uid. Clones share the same status
/// table.
#[derive(Clone, Debug)]
pub struct DispatchPool {
    dispatcher: Dispatcher,
    statuses: Arc<Mutex<HashMap<String, DispatchStatus>>>,
    marked: Arc<Mutex<HashSet<String>>>,
    changes: Arc<watch::Sender<u64>>,
}

impl DispatchPool {
    /// Creates an idle pool.
    #[must_use]
    pub fn new(dispatcher: Dispatcher) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            dispatcher,
            statuses: Arc::new(Mutex::new(HashMap::new())),
            marked: Arc::new(Mutex::new(HashSet::new())),
            changes: Arc::new(changes),
        }
    }

    /// Starts the dispatch pipeline for `job_uid` on a new task.
    ///
    /// Returns `false` without spawning when a pipeline for the job is
    /// already running. Must be called from within a tokio runtime.
    pub fn spawn(&self, job_uid: &str) -> bool {
        {
            let mut statuses = self.statuses();
            if statuses.get(job_uid).is_some_and(DispatchStatus::is_running) {
                return false;
            }
            statuses.insert(job_uid.to_owned(), DispatchStatus::Running);
        }
        self.notify();

        let dispatcher = self.dispatcher.clone();
        let pool = self.clone();
        let uid = job_uid.to_owned();
        tokio::spawn(async move {
            let worker_uid = uid.clone();
            let worker = tokio::spawn(async move { dispatcher.run_job(&worker_uid).await });
            let status = match worker.await {
                Ok(Ok(outcome)) => DispatchStatus::Succeeded(outcome),
                Ok(Err(err)) => DispatchStatus::Failed(err.to_string()),
                Err(err) => {
                    tracing::error!(job_uid = %uid, error = %err, "dispatch worker crashed");
                    DispatchStatus::Panicked(err.to_string())
                }
            };
            pool.finish(&uid, status);
        });
        tracing::debug!(job_uid, "dispatch worker spawned");
        true
    }

    /// Status of the most recent worker for `job_uid`.
    #[must_use]
    pub fn status(&self, job_uid: &str) -> Option<DispatchStatus> {
        self.statuses().get(job_uid).cloned()
    }

    /// Snapshot of every tracked job's status.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, DispatchStatus> {
        self.statuses().clone()
    }

    /// Returns `true` while a pipeline for `job_uid` is running.
    #[must_use]
    pub fn is_running(&self, job_uid: &str) -> bool {
        self.statuses()
            .get(job_uid)
            .is_some_and(DispatchStatus::is_running)
    }

    /// Number of running pipelines.
    #[must_use]
    pub fn active(&self) -> usize {
        self.statuses()
            .values()
            .filter(|status| status.is_running())
            .count()
    }

    /// Waits until the worker for `job_uid` has ended and returns its
    /// status, or `None` when the job was never spawned.
    pub async fn wait_for(&self, job_uid: &str) -> Option<DispatchStatus> {
        let mut changes = self.changes.subscribe();
        loop {
            match self.status(job_uid) {
                Some(DispatchStatus::Running) => {}
                other => return other,
            }
            if changes.changed().await.is_err() {
                return self.status(job_uid);
            }
        }
    }

    /// Forgets settled statuses of jobs `done` accepts.
    ///
    /// An entry is only marked on the first call that finds it eligible and
    /// removed on the next, so a waiter woken by the pipeline's end still
    /// reads it. Running pipelines are never pruned. Returns the number of
    /// entries removed.
    #[must_use]
    pub fn prune(&self, done: impl Fn(&str) -> bool) -> usize {
        let mut statuses = self.statuses();
        let mut marked = self.marked.lock().unwrap_or_else(PoisonError::into_inner);
        let before = statuses.len();
        statuses.retain(|job_uid, status| {
            if status.is_running() || !done(job_uid) {
                marked.remove(job_uid);
                return true;
            }
            if marked.remove(job_uid) {
                return false;
            }
            marked.insert(job_uid.clone());
            true
        });
        before.saturating_sub(statuses.len())
    }

    /// Waits until no pipeline is running.
    pub async fn wait_idle(&self) {
        let mut changes = self.changes.subscribe();
        while self.active() > 0 {
            if changes.changed().await.is_err() {
                return;
            }
        }
    }

    fn finish(&self, job_uid: &str, status: DispatchStatus) {
        tracing::debug!(job_uid, status = %status, "dispatch worker finished");
        self.statuses().insert(job_uid.to_owned(), status);
        self.notify();
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }

    fn statuses(&self) -> MutexGuard<'_, HashMap<String, DispatchStatus>> {
        self.statuses.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
