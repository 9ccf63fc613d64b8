//! Error taxonomy for the relay engine.
//!
//! Every failure here is "log and drop" at the orchestrator level: a bad file
//! never takes down the watcher, and nothing is retried.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Error, Debug)]
pub enum RelayError {
    /// The file kept changing size for every poll the gate was allowed.
    #[error("File size did not stabilize after {attempts} polls: {path}")]
    NotStabilized { path: PathBuf, attempts: u32 },

    #[error("Malformed descriptor: {0}")]
    MalformedDescriptor(String),

    #[error("Invalid request URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Fetch failed for {url}: {reason}")]
    FetchFailure { url: String, reason: String },

    #[error("Failed to write archive {path}: {source}")]
    ArchiveWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Corrupt archive {path}: {reason}")]
    CorruptArchive { path: PathBuf, reason: String },

    /// Destination already populated; reported per entry, never fatal to a merge.
    #[error("Merge collision at {0}")]
    MergeCollision(PathBuf),

    #[error("Transport command `{command}` failed: {reason}")]
    Transport { command: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    pub(crate) fn archive_write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        RelayError::ArchiveWrite {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        RelayError::CorruptArchive {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
