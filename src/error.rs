use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the patch engine.
#[derive(Error, Debug)]
pub enum PatchError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid patch archive: {0}")]
    InvalidArchive(String),

    #[error("Unsupported patch version: {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("Invalid path in patch: {0:?}")]
    InvalidPath(String),

    #[error("Path appears more than once in patch: {0}")]
    DuplicatePath(String),

    #[error("Directory {dir} is deleted before its entry {child}")]
    OrderViolation { dir: String, child: String },

    #[error("Missing payload for {0}")]
    MissingPayload(String),

    #[error("Checksum mismatch for {0}")]
    ChecksumMismatch(String),

    #[error("Corrupt delta for {path}: {reason}")]
    CorruptDelta { path: String, reason: String },

    #[error("Conflict on {0} has no resolution")]
    Unresolved(String),

    #[error("Resolution {option} was not offered for {path}")]
    InvalidResolution { path: String, option: String },

    #[error("Patch aborted on {0}")]
    Aborted(String),

    #[error("Backup directory is not empty: {}", .0.display())]
    BackupNotEmpty(PathBuf),

    #[error("Patch cancelled")]
    Cancelled,

    #[error("Runner is {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Apply failed and was reverted: {0}")]
    ApplyFailed(#[source] Box<PatchError>),

    #[error("Revert failed ({revert}); backups kept in {}", .backup_dir.display())]
    RevertFailed {
        cause: Box<PatchError>,
        revert: Box<PatchError>,
        backup_dir: PathBuf,
    },

    #[error("Serialization error: {0}")]
    Encoding(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, PatchError>;

/// Attach a path to an `io::Result`.
pub(crate) trait IoContext<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| PatchError::Io {
            path: path.into(),
            source,
        })
    }
}
