//! Persisted job collection.
//!
//! The store is the single source of truth for job state. Components never
//! cache records across calls; every decision re-reads the persisted record
//! and every transition is written back before the next remote operation
//! starts.

mod file;
mod memory;

use std::fmt::Debug;

use chrono::{DateTime, Utc};
use camino::Utf8PathBuf;
use thiserror::Error;

use crate::job::{JobRecord, JobState};

pub use file::FileJobStore;
pub use memory::MemoryJobStore;

/// Errors raised by job stores.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// No record exists for the identifier.
    #[error("job {job_uid} not found")]
    NotFound {
        /// Requested identifier.
        job_uid: String,
    },
    /// A record with the identifier already exists.
    #[error("job {job_uid} already exists")]
    AlreadyExists {
        /// Conflicting identifier.
        job_uid: String,
    },
    /// The identifier cannot be used as a storage key.
    #[error("invalid job identifier: {0}")]
    InvalidUid(String),
    /// The record was not in a state the caller expected.
    #[error("job {job_uid} is {found}, refusing to move it to {next}")]
    UnexpectedState {
        /// Job identifier.
        job_uid: String,
        /// State found in the store.
        found: JobState,
        /// State the caller attempted to set.
        next: JobState,
    },
    /// Filesystem access failed.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// A persisted record could not be decoded or encoded.
    #[error("corrupt job record {path}: {message}")]
    Corrupt {
        /// Path of the offending record.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

/// Callback applied to a record inside [`JobStore::update`].
pub type RecordUpdate<'a> = &'a mut dyn FnMut(&mut JobRecord) -> Result<(), StoreError>;

/// Persistence backend for job records.
///
/// Implementations serialise [`JobStore::update`] calls so that a
/// read-modify-write on one record never interleaves with another.
pub trait JobStore: Send + Sync + Debug {
    /// Persists a new record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] when the identifier is taken, or
    /// an I/O error from the backend.
    fn insert(&self, record: &JobRecord) -> Result<(), StoreError>;

    /// Loads one record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when no record exists.
    fn load(&self, job_uid: &str) -> Result<JobRecord, StoreError>;

    /// Loads every record, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the collection cannot be enumerated.
    fn list(&self) -> Result<Vec<JobRecord>, StoreError>;

    /// Atomically applies `apply` to the stored record and persists the
    /// result, returning the updated record.
    ///
    /// # Errors
    ///
    /// Propagates errors from `apply` without writing, or backend errors.
    fn update(&self, job_uid: &str, apply: RecordUpdate<'_>) -> Result<JobRecord, StoreError>;
}

/// Moves a job to `next` if it is currently in one of `expected`.
///
/// Passing an empty `expected` slice skips the guard. Stale workers use the
/// guard to notice that another component has already moved the job on.
///
/// # Errors
///
/// Returns [`StoreError::UnexpectedState`] when the guard fails, or any
/// backend error.
pub fn transition(
    store: &dyn JobStore,
    job_uid: &str,
    expected: &[JobState],
    next: JobState,
    now: DateTime<Utc>,
) -> Result<JobRecord, StoreError> {
    let mut previous = None;
    let record = store.update(job_uid, &mut |record: &mut JobRecord| {
        let found = record.state();
        if !expected.is_empty() && !expected.contains(&found) {
            return Err(StoreError::UnexpectedState {
                job_uid: record.job_uid.clone(),
                found,
                next,
            });
        }
        previous = Some(found);
        record.set_state(next, now);
        Ok(())
    })?;
    if let Some(from) = previous
        && from != next
    {
        tracing::info!(job_uid, from = %from, to = %next, "job state changed");
    }
    Ok(record)
}

/// Returns a job to `QUEUED`, logging why.
///
/// # Errors
///
/// As for [`transition`].
pub fn requeue(
    store: &dyn JobStore,
    job_uid: &str,
    expected: &[JobState],
    reason: &str,
    now: DateTime<Utc>,
) -> Result<JobRecord, StoreError> {
    let record = transition(store, job_uid, expected, JobState::Queued, now)?;
    tracing::warn!(job_uid, reason, "job requeued");
    Ok(record)
}

/// Rejects identifiers that would escape the store directory.
pub(crate) fn check_uid(job_uid: &str) -> Result<(), StoreError> {
    let valid = !job_uid.is_empty()
        && !job_uid.starts_with('.')
        && job_uid
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidUid(job_uid.to_owned()))
    }
}

#[cfg(test)]
mod tests;
