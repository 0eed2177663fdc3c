//! Content-addressed shared filesystem mounted on the control node.
//!
//! Layout under the root:
//!
//! ```text
//! data/<name>/<checksum>/data.<extension>
//! code/<run_name>/<checksum>/code.<extension>
//! jobs/<job_uid>/logs/run.log
//! ```
//!
//! Artifacts are keyed by checksum, so an upload whose checksum directory
//! already holds an artifact is skipped.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the shared filesystem.
#[derive(Debug, Error)]
pub enum MonkeyFsError {
    /// A path component would escape its directory or is empty.
    #[error("invalid {field}: {value:?}")]
    InvalidName {
        /// Which input was rejected.
        field: &'static str,
        /// Rejected value.
        value: String,
    },
    /// Filesystem access failed.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

/// Kind of content-addressed artifact.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ArtifactKind {
    /// Dataset archive under `data/`.
    Dataset,
    /// Codebase archive under `code/`.
    Codebase,
}

impl ArtifactKind {
    /// Top-level directory and file stem for the kind.
    #[must_use]
    pub const fn stem(self) -> &'static str {
        match self {
            Self::Dataset => "data",
            Self::Codebase => "code",
        }
    }

    const fn label(self) -> &'static str {
        match self {
            Self::Dataset => "dataset",
            Self::Codebase => "codebase",
        }
    }
}

/// Handle on the shared filesystem root.
#[derive(Debug)]
pub struct MonkeyFs {
    root: Utf8PathBuf,
    dir: Dir,
}

impl MonkeyFs {
    /// Opens the filesystem, creating `root` if needed.
    ///
    /// # Errors
    ///
    /// Returns [`MonkeyFsError::Io`] when the directory cannot be created or
    /// opened.
    pub fn open(root: &Utf8Path) -> Result<Self, MonkeyFsError> {
        Dir::create_ambient_dir_all(root, ambient_authority())
            .map_err(|err| io_error(root, &err))?;
        let dir =
            Dir::open_ambient_dir(root, ambient_authority()).map_err(|err| io_error(root, &err))?;
        Ok(Self {
            root: root.to_path_buf(),
            dir,
        })
    }

    /// Root directory on the control node.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Absolute path an artifact is stored at.
    ///
    /// # Errors
    ///
    /// Returns [`MonkeyFsError::InvalidName`] when a component is unsafe.
    pub fn artifact_path(
        &self,
        kind: ArtifactKind,
        name: &str,
        checksum: &str,
        extension: &str,
    ) -> Result<Utf8PathBuf, MonkeyFsError> {
        let folder = checksum_dir(kind, name, checksum)?;
        let file = artifact_file(kind, extension)?;
        Ok(self.root.join(folder).join(file))
    }

    /// Log file the job's run output is synced to.
    ///
    /// # Errors
    ///
    /// Returns [`MonkeyFsError::InvalidName`] when the uid is unsafe.
    pub fn job_log_path(&self, job_uid: &str) -> Result<Utf8PathBuf, MonkeyFsError> {
        check_component("job_uid", job_uid)?;
        Ok(self.root.join("jobs").join(job_uid).join("logs").join("run.log"))
    }

    /// Returns `true` when an artifact for `(name, checksum)` is stored.
    ///
    /// # Errors
    ///
    /// Returns [`MonkeyFsError`] for unsafe names or unreadable directories.
    pub fn has_artifact(
        &self,
        kind: ArtifactKind,
        name: &str,
        checksum: &str,
    ) -> Result<bool, MonkeyFsError> {
        let folder = checksum_dir(kind, name, checksum)?;
        let entries = match self.dir.read_dir(&folder) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(io_error(&self.root.join(&folder), &err)),
        };
        let prefix = format!("{}.", kind.stem());
        for entry in entries {
            let file_name = entry
                .and_then(|found| found.file_name())
                .map_err(|err| io_error(&self.root.join(&folder), &err))?;
            if file_name.starts_with(&prefix) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Stores `contents` unless an artifact with the same checksum exists.
    ///
    /// Returns `false` when the upload was skipped. The file is written under
    /// a temporary name and renamed into place.
    ///
    /// # Errors
    ///
    /// Returns [`MonkeyFsError`] for unsafe names or failed writes.
    pub fn upload_artifact(
        &self,
        kind: ArtifactKind,
        name: &str,
        checksum: &str,
        extension: &str,
        contents: &[u8],
    ) -> Result<bool, MonkeyFsError> {
        if self.has_artifact(kind, name, checksum)? {
            tracing::info!(kind = kind.label(), name, checksum, "artifact already stored");
            return Ok(false);
        }
        let folder = checksum_dir(kind, name, checksum)?;
        let file = artifact_file(kind, extension)?;
        self.dir
            .create_dir_all(&folder)
            .map_err(|err| io_error(&self.root.join(&folder), &err))?;

        let staging = folder.join(format!(".upload-{}", Uuid::new_v4()));
        let target = folder.join(&file);
        self.dir
            .write(&staging, contents)
            .map_err(|err| io_error(&self.root.join(&staging), &err))?;
        if let Err(err) = self.dir.rename(&staging, &self.dir, &target) {
            drop(self.dir.remove_file(&staging));
            return Err(io_error(&self.root.join(&target), &err));
        }
        tracing::info!(
            kind = kind.label(),
            name,
            checksum,
            bytes = contents.len(),
            "artifact stored"
        );
        Ok(true)
    }
}

fn checksum_dir(
    kind: ArtifactKind,
    name: &str,
    checksum: &str,
) -> Result<Utf8PathBuf, MonkeyFsError> {
    check_component("name", name)?;
    check_component("checksum", checksum)?;
    Ok(Utf8Path::new(kind.stem()).join(name).join(checksum))
}

fn artifact_file(kind: ArtifactKind, extension: &str) -> Result<String, MonkeyFsError> {
    let valid = !extension.is_empty()
        && !extension.starts_with('.')
        && extension
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '.');
    if !valid {
        return Err(MonkeyFsError::InvalidName {
            field: "extension",
            value: extension.to_owned(),
        });
    }
    Ok(format!("{}.{extension}", kind.stem()))
}

fn check_component(field: &'static str, value: &str) -> Result<(), MonkeyFsError> {
    let unsafe_name = value.trim().is_empty()
        || value.starts_with('.')
        || value.contains(['/', '\\'])
        || value.contains('\0');
    if unsafe_name {
        return Err(MonkeyFsError::InvalidName {
            field,
            value: value.to_owned(),
        });
    }
    Ok(())
}

fn io_error(path: &Utf8Path, err: &io::Error) -> MonkeyFsError {
    MonkeyFsError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}
