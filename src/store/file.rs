//! JSON-per-job store rooted in a capability directory.

use std::io;
use std::sync::{Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use uuid::Uuid;

use super::{JobStore, RecordUpdate, StoreError, check_uid};
use crate::job::JobRecord;

const RECORD_EXTENSION: &str = ".json";

/// Stores each job as `<root>/<job_uid>.json`.
///
/// Writes go to a uniquely named temporary file which is then renamed over
/// the record, so readers never observe a half-written record.
#[derive(Debug)]
pub struct FileJobStore {
    root: Utf8PathBuf,
    dir: Dir,
    write_lock: Mutex<()>,
}

impl FileJobStore {
    /// Opens the store, creating `root` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the directory cannot be created or
    /// opened.
    pub fn open(root: &Utf8Path) -> Result<Self, StoreError> {
        Dir::create_ambient_dir_all(root, ambient_authority()).map_err(|err| StoreError::Io {
            path: root.to_path_buf(),
            message: err.to_string(),
        })?;
        let dir = Dir::open_ambient_dir(root, ambient_authority()).map_err(|err| StoreError::Io {
            path: root.to_path_buf(),
            message: err.to_string(),
        })?;
        Ok(Self {
            root: root.to_path_buf(),
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Directory holding the records.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn file_name(job_uid: &str) -> Result<String, StoreError> {
        check_uid(job_uid)?;
        Ok(format!("{job_uid}{RECORD_EXTENSION}"))
    }

    fn read(&self, job_uid: &str) -> Result<JobRecord, StoreError> {
        let name = Self::file_name(job_uid)?;
        let contents = match self.dir.read_to_string(&name) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    job_uid: job_uid.to_owned(),
                });
            }
            Err(err) => return Err(self.io_error(&name, &err)),
        };
        serde_json::from_str(&contents).map_err(|err| StoreError::Corrupt {
            path: self.root.join(&name),
            message: err.to_string(),
        })
    }

    fn write(&self, record: &JobRecord) -> Result<(), StoreError> {
        let name = Self::file_name(&record.job_uid)?;
        let body = serde_json::to_vec_pretty(record).map_err(|err| StoreError::Corrupt {
            path: self.root.join(&name),
            message: err.to_string(),
        })?;
        let temp = format!(".{}.{}.tmp", record.job_uid, Uuid::new_v4());
        self.dir
            .write(&temp, body)
            .map_err(|err| self.io_error(&temp, &err))?;
        self.dir
            .rename(&temp, &self.dir, &name)
            .map_err(|err| self.io_error(&name, &err))
    }

    fn io_error(&self, name: &str, err: &io::Error) -> StoreError {
        StoreError::Io {
            path: self.root.join(name),
            message: err.to_string(),
        }
    }
}

impl JobStore for FileJobStore {
    fn insert(&self, record: &JobRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let name = Self::file_name(&record.job_uid)?;
        if self
            .dir
            .try_exists(&name)
            .map_err(|err| self.io_error(&name, &err))?
        {
            return Err(StoreError::AlreadyExists {
                job_uid: record.job_uid.clone(),
            });
        }
        self.write(record)
    }

    fn load(&self, job_uid: &str) -> Result<JobRecord, StoreError> {
        self.read(job_uid)
    }

    fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
        let entries = self
            .dir
            .entries()
            .map_err(|err| self.io_error(".", &err))?;
        let mut records = Vec::new();
        for entry in entries {
            let dir_entry = entry.map_err(|err| self.io_error(".", &err))?;
            let name = dir_entry.file_name().map_err(|err| self.io_error(".", &err))?;
            let Some(job_uid) = name.strip_suffix(RECORD_EXTENSION) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            match self.read(job_uid) {
                Ok(record) => records.push(record),
                Err(err @ (StoreError::Corrupt { .. } | StoreError::InvalidUid(_))) => {
                    tracing::warn!(file = %name, error = %err, "skipping unreadable job record");
                }
                Err(StoreError::NotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        records.sort_by(|left, right| {
            left.creation_date
                .cmp(&right.creation_date)
                .then_with(|| left.job_uid.cmp(&right.job_uid))
        });
        Ok(records)
    }

    fn update(&self, job_uid: &str, apply: RecordUpdate<'_>) -> Result<JobRecord, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut record = self.read(job_uid)?;
        apply(&mut record)?;
        self.write(&record)?;
        Ok(record)
    }
}
