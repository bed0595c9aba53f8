//! Error types for counter reads, calibration tables and registry readers.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for power estimation operations.
pub type Result<T> = std::result::Result<T, PowerError>;

#[derive(Error, Debug)]
pub enum PowerError {
    /// A kernel counter could not be read. Always a soft failure: the affected
    /// scope produces no output for the current tick.
    #[error("failed to read counter {path}: {reason}")]
    ReadFailure { path: PathBuf, reason: String },

    /// Counter text was present but malformed.
    #[error("parse error: {0}")]
    Parse(String),

    /// Calibration table failed validation.
    #[error("invalid coefficient table: {0}")]
    InvalidTable(String),

    /// No calibration profile with this name is known.
    #[error("unknown device profile '{0}'")]
    UnknownProfile(String),

    /// Background registry reader failed.
    #[error("registry reader error: {0}")]
    Reader(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl PowerError {
    pub fn read_failure(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        PowerError::ReadFailure {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
