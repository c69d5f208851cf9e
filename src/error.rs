// Error kinds for the reconciliation pipeline
//
// Row-level problems are not errors: they become RowWarning entries in the
// run summary. Everything here ends the run.

use std::path::PathBuf;
use thiserror::Error;

/// Result type used across the library
pub type Result<T> = std::result::Result<T, ReconError>;

#[derive(Error, Debug)]
pub enum ReconError {
    /// Source file unreadable, or output location unwritable
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Neither the workbook nor the markup signature matched
    #[error("unsupported format: {path} is neither a spreadsheet workbook nor an HTML export")]
    UnsupportedFormat { path: PathBuf },

    /// Signature matched but the container could not be decoded
    #[error("malformed {format} file {path}: {reason}")]
    MalformedSource {
        format: &'static str,
        path: PathBuf,
        reason: String,
    },

    /// Staging store statement failed at table level
    #[error("staging store error: {0}")]
    Persistence(#[from] rusqlite::Error),

    /// Report artifact could not be produced; staged rows are kept
    #[error("report write failed at {location}: {reason}")]
    ReportWrite { location: String, reason: String },

    /// A paired run was given two exports of the same shape
    #[error("both files are {0} exports; a pair needs one of each")]
    SameSourcePair(&'static str),

    #[error("configuration error: {0}")]
    Config(String),

    /// Another reconciliation run holds the staging tables
    #[error("a reconciliation run is already in progress")]
    Busy,
}

impl ReconError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ReconError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn report(location: impl Into<String>, reason: impl ToString) -> Self {
        ReconError::ReportWrite {
            location: location.into(),
            reason: reason.to_string(),
        }
    }
}
