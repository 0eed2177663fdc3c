//! Job lifecycle states and the per-state timeout table.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum time a job may sit in `DISPATCHING` or `DISPATCHING_MACHINE`.
pub const DISPATCH_TIMEOUT: Duration = Duration::from_secs(240);
/// Maximum time a job may sit in `DISPATCHING_INSTALLS`.
pub const INSTALLS_TIMEOUT: Duration = Duration::from_secs(600);
/// Maximum time a job may sit in `DISPATCHING_SETUP`.
pub const SETUP_TIMEOUT: Duration = Duration::from_secs(180);
/// Time after which an unfinished cleanup is retried.
pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Position of a job in its lifecycle.
///
/// `Queued` doubles as the re-entry state for every detected failure, so there
/// is no failed terminal state. `Finished` is terminal apart from the
/// inconsistency repair path back to `Cleanup`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Waiting for the reconciliation loop to dispatch it.
    Queued,
    /// Claimed by a reconciliation pass; the dispatcher has not started yet.
    Dispatching,
    /// Waiting for the provider to create or locate an instance.
    DispatchingMachine,
    /// Installing dependencies on the instance.
    DispatchingInstalls,
    /// Mounting the shared filesystem and staging data, code and persist folders.
    DispatchingSetup,
    /// Running the user command.
    Running,
    /// Tearing the instance down.
    Cleanup,
    /// Completed; terminal.
    Finished,
}

impl JobState {
    /// Every state in lifecycle order.
    pub const ALL: [Self; 8] = [
        Self::Queued,
        Self::Dispatching,
        Self::DispatchingMachine,
        Self::DispatchingInstalls,
        Self::DispatchingSetup,
        Self::Running,
        Self::Cleanup,
        Self::Finished,
    ];

    /// Returns the wire representation of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Dispatching => "DISPATCHING",
            Self::DispatchingMachine => "DISPATCHING_MACHINE",
            Self::DispatchingInstalls => "DISPATCHING_INSTALLS",
            Self::DispatchingSetup => "DISPATCHING_SETUP",
            Self::Running => "RUNNING",
            Self::Cleanup => "CLEANUP",
            Self::Finished => "FINISHED",
        }
    }

    /// Returns `true` for the terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished)
    }

    /// Fixed timeout for the state, if the table assigns one.
    ///
    /// `Running` is governed by the per-job run timeout instead and therefore
    /// returns `None` here, as do `Queued` and `Finished`.
    #[must_use]
    pub const fn timeout(self) -> Option<Duration> {
        match self {
            Self::Dispatching | Self::DispatchingMachine => Some(DISPATCH_TIMEOUT),
            Self::DispatchingInstalls => Some(INSTALLS_TIMEOUT),
            Self::DispatchingSetup => Some(SETUP_TIMEOUT),
            Self::Cleanup => Some(CLEANUP_TIMEOUT),
            Self::Queued | Self::Running | Self::Finished => None,
        }
    }

    /// Returns `true` when the job is expected to hold a live instance.
    ///
    /// A job in one of these states whose instance disappears or stops
    /// answering health checks is requeued.
    #[must_use]
    pub const fn requires_live_instance(self) -> bool {
        matches!(
            self,
            Self::DispatchingInstalls | Self::DispatchingSetup | Self::Running
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a string does not name a job state.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown job state: {0}")]
pub struct ParseJobStateError(pub String);

impl FromStr for JobState {
    type Err = ParseJobStateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalised = value.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == normalised)
            .ok_or_else(|| ParseJobStateError(value.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(JobState::Dispatching, Some(240))]
    #[case(JobState::DispatchingMachine, Some(240))]
    #[case(JobState::DispatchingInstalls, Some(600))]
    #[case(JobState::DispatchingSetup, Some(180))]
    #[case(JobState::Cleanup, Some(30))]
    #[case(JobState::Running, None)]
    #[case(JobState::Queued, None)]
    #[case(JobState::Finished, None)]
    fn timeout_table(#[case] state: JobState, #[case] secs: Option<u64>) {
        assert_eq!(state.timeout(), secs.map(Duration::from_secs));
    }

    #[test]
    fn parses_wire_names() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>(), Ok(state));
        }
        assert!("BOGUS".parse::<JobState>().is_err());
    }

    #[test]
    fn serialises_as_screaming_snake_case() {
        let json = serde_json::to_string(&JobState::DispatchingMachine)
            .unwrap_or_else(|err| panic!("serialise state: {err}"));
        assert_eq!(json, "\"DISPATCHING_MACHINE\"");
    }
}
