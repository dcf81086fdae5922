//! Error taxonomy for scan preparation.
//!
//! Every per-scan failure is one of [`PrepError::Io`], [`PrepError::Format`]
//! or [`PrepError::Lookup`]; the batch pipeline logs these and moves on to the
//! next scan. [`PrepError::Config`] and [`PrepError::Pack`] concern the run as
//! a whole.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PrepError {
    /// Missing or unreadable raw file.
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Structurally invalid file (missing keys, empty arrays, no alignment line).
    #[error("malformed {}: {reason}", .path.display())]
    Format { path: PathBuf, reason: String },

    /// One annotation source references something another source lacks.
    #[error("lookup failed: {0}")]
    Lookup(String),

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Writing or reading a split pack failed.
    #[error("split pack error: {0}")]
    Pack(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, PrepError>;

impl PrepError {
    pub fn io(path: &Path, source: io::Error) -> Self {
        PrepError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn format<S: Into<String>>(path: &Path, reason: S) -> Self {
        PrepError::Format {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn lookup<S: Into<String>>(msg: S) -> Self {
        PrepError::Lookup(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        PrepError::Config(msg.into())
    }
}
