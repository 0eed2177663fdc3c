//! Volatile store used by tests and dry runs.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use super::{JobStore, RecordUpdate, StoreError};
use crate::job::JobRecord;

/// Keeps records in a map guarded by a single mutex.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    records: Mutex<BTreeMap<String, JobRecord>>,
}

impl MemoryJobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn insert(&self, record: &JobRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.contains_key(&record.job_uid) {
            return Err(StoreError::AlreadyExists {
                job_uid: record.job_uid.clone(),
            });
        }
        records.insert(record.job_uid.clone(), record.clone());
        Ok(())
    }

    fn load(&self, job_uid: &str) -> Result<JobRecord, StoreError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_uid)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                job_uid: job_uid.to_owned(),
            })
    }

    fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
        let mut records: Vec<JobRecord> = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        records.sort_by(|left, right| {
            left.creation_date
                .cmp(&right.creation_date)
                .then_with(|| left.job_uid.cmp(&right.job_uid))
        });
        Ok(records)
    }

    fn update(&self, job_uid: &str, apply: RecordUpdate<'_>) -> Result<JobRecord, StoreError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let stored = records.get_mut(job_uid).ok_or_else(|| StoreError::NotFound {
            job_uid: job_uid.to_owned(),
        })?;
        let mut candidate = stored.clone();
        apply(&mut candidate)?;
        *stored = candidate.clone();
        Ok(candidate)
    }
}
