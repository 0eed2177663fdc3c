//! Persisted job entity and its state-transition bookkeeping.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::job::spec::JobSpec;
use crate::job::state::JobState;
use crate::provider::ProviderKind;

/// Start timestamps for each lifecycle phase.
///
/// A stamp is taken on the edge into the phase; repeated `set_state` calls
/// into the same state leave it untouched.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PhaseTimings {
    /// Entered `DISPATCHING`.
    pub dispatch_start: Option<DateTime<Utc>>,
    /// Entered `DISPATCHING_MACHINE`.
    pub machine_start: Option<DateTime<Utc>>,
    /// Entered `DISPATCHING_INSTALLS`.
    pub installs_start: Option<DateTime<Utc>>,
    /// Entered `DISPATCHING_SETUP`.
    pub setup_start: Option<DateTime<Utc>>,
    /// Entered `RUNNING` most recently.
    pub running_start: Option<DateTime<Utc>>,
    /// First entered `CLEANUP`.
    pub cleanup_start: Option<DateTime<Utc>>,
}

/// One submitted job and the authoritative record of its lifecycle.
///
/// State and timing fields are private: the only way to move a job is
/// [`JobRecord::set_state`], which keeps the bookkeeping consistent.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct JobRecord {
    /// Unique job identifier.
    pub job_uid: String,
    /// Parsed job description.
    pub job_spec: JobSpec,
    /// Provider the job was bound to at submission.
    pub provider_name: String,
    /// Provider kind snapshotted at submission.
    pub provider_type: ProviderKind,
    /// Submission time.
    pub creation_date: DateTime<Utc>,
    /// Hyperparameters reported by the running job, once fetched.
    #[serde(default)]
    pub hyperparameters: Option<serde_json::Value>,
    state: JobState,
    last_state_change: DateTime<Utc>,
    #[serde(default)]
    timings: PhaseTimings,
    #[serde(default)]
    completion_date: Option<DateTime<Utc>>,
    #[serde(default)]
    run_elapsed_time_ms: u64,
    #[serde(default)]
    total_wall_time_ms: Option<u64>,
    #[serde(default)]
    cleanup_attempts: u32,
    #[serde(default)]
    last_cleanup_attempt: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Creates a `QUEUED` record for a freshly submitted job.
    #[must_use]
    pub fn new(
        job_spec: JobSpec,
        provider_name: impl Into<String>,
        provider_type: ProviderKind,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_uid: job_spec.job_uid.clone(),
            job_spec,
            provider_name: provider_name.into(),
            provider_type,
            creation_date: now,
            hyperparameters: None,
            state: JobState::Queued,
            last_state_change: now,
            timings: PhaseTimings::default(),
            completion_date: None,
            run_elapsed_time_ms: 0,
            total_wall_time_ms: None,
            cleanup_attempts: 0,
            last_cleanup_attempt: None,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> JobState {
        self.state
    }

    /// Time of the most recent `set_state` call.
    #[must_use]
    pub const fn last_state_change(&self) -> DateTime<Utc> {
        self.last_state_change
    }

    /// Phase start timestamps.
    #[must_use]
    pub const fn timings(&self) -> &PhaseTimings {
        &self.timings
    }

    /// Time the job reached `FINISHED`, if it has.
    #[must_use]
    pub const fn completion_date(&self) -> Option<DateTime<Utc>> {
        self.completion_date
    }

    /// Number of cleanup attempts launched so far.
    #[must_use]
    pub const fn cleanup_attempts(&self) -> u32 {
        self.cleanup_attempts
    }

    /// Time of the most recent cleanup attempt.
    #[must_use]
    pub const fn last_cleanup_attempt(&self) -> Option<DateTime<Utc>> {
        self.last_cleanup_attempt
    }

    /// Cumulative time spent in `RUNNING` over completed running periods.
    #[must_use]
    pub const fn run_elapsed_time(&self) -> Duration {
        Duration::from_millis(self.run_elapsed_time_ms)
    }

    /// Creation-to-completion time, or creation-to-last-refresh while the job
    /// is still live.
    #[must_use]
    pub fn total_wall_time(&self) -> Option<Duration> {
        self.total_wall_time_ms.map(Duration::from_millis)
    }

    /// Moves the record to `next`, updating every timing field.
    ///
    /// The new `last_state_change` is strictly later than the previous one
    /// even if the wall clock stalls or steps backwards. Returns `true` when
    /// the state actually changed.
    pub fn set_state(&mut self, next: JobState, now: DateTime<Utc>) -> bool {
        let floor = self.last_state_change + TimeDelta::milliseconds(1);
        let stamp = now.max(floor);
        let previous = self.state;
        let changed = previous != next;

        if changed {
            if previous == JobState::Running {
                let started = self.timings.running_start.unwrap_or(self.last_state_change);
                self.run_elapsed_time_ms = self
                    .run_elapsed_time_ms
                    .saturating_add(non_negative_millis(stamp - started));
            }
            self.stamp_phase_start(next, stamp);
            if next == JobState::Finished {
                self.completion_date = Some(stamp);
                self.total_wall_time_ms = Some(non_negative_millis(stamp - self.creation_date));
            }
            self.state = next;
        }

        self.last_state_change = stamp;
        changed
    }

    fn stamp_phase_start(&mut self, next: JobState, stamp: DateTime<Utc>) {
        let timings = &mut self.timings;
        match next {
            JobState::Dispatching => timings.dispatch_start = Some(stamp),
            JobState::DispatchingMachine => timings.machine_start = Some(stamp),
            JobState::DispatchingInstalls => timings.installs_start = Some(stamp),
            JobState::DispatchingSetup => timings.setup_start = Some(stamp),
            JobState::Running => timings.running_start = Some(stamp),
            JobState::Cleanup => {
                if self.cleanup_attempts == 0 && timings.cleanup_start.is_none() {
                    timings.cleanup_start = Some(stamp);
                }
            }
            JobState::Queued | JobState::Finished => {}
        }
    }

    /// Time spent in the current state, never negative.
    #[must_use]
    pub fn time_elapsed_in_state(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_state_change).to_std().unwrap_or_default()
    }

    /// Returns `true` when the state has a fixed timeout and the elapsed
    /// time is strictly greater than it.
    #[must_use]
    pub fn state_timed_out(&self, now: DateTime<Utc>) -> bool {
        self.state
            .timeout()
            .is_some_and(|limit| self.time_elapsed_in_state(now) > limit)
    }

    /// Positive run timeout configured for the job.
    #[must_use]
    pub fn run_timeout(&self) -> Option<Duration> {
        self.job_spec
            .effective_run_timeout()
            .map(Duration::from_secs)
    }

    /// Returns `true` when the job is `RUNNING` past its run timeout.
    #[must_use]
    pub fn run_timed_out(&self, now: DateTime<Utc>) -> bool {
        if self.state != JobState::Running {
            return false;
        }
        let Some(limit) = self.run_timeout() else {
            return false;
        };
        let started = self.timings.running_start.unwrap_or(self.last_state_change);
        (now - started).to_std().unwrap_or_default() > limit
    }

    /// Recomputes the total wall time for a job that has not finished yet.
    pub fn refresh_total_wall_time(&mut self, now: DateTime<Utc>) {
        let end = self.completion_date.unwrap_or(now);
        self.total_wall_time_ms = Some(non_negative_millis(end - self.creation_date));
    }

    /// Notes that a cleanup task has been launched for the job.
    pub fn record_cleanup_attempt(&mut self, now: DateTime<Utc>) {
        self.cleanup_attempts = self.cleanup_attempts.saturating_add(1);
        self.last_cleanup_attempt = Some(now);
    }

    /// Name of the instance this job runs on.
    ///
    /// Cloud instances are named after the job; local jobs name a
    /// pre-registered host.
    #[must_use]
    pub fn instance_name(&self) -> Option<&str> {
        if self.provider_type.owns_instance_lifecycle() {
            Some(self.job_uid.as_str())
        } else {
            self.job_spec.instance.name.as_deref()
        }
    }
}

fn non_negative_millis(delta: TimeDelta) -> u64 {
    u64::try_from(delta.num_milliseconds()).unwrap_or(0)
}
