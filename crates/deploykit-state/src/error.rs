//! Error types for deploykit-state

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while persisting or loading deployment state
#[derive(Error, Debug)]
pub enum StateError {
    /// State file does not exist
    #[error("state file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// State file exists but is not a valid state document
    #[error("failed to parse state file {}: {message}", path.display())]
    Parse {
        /// File that failed to parse
        path: PathBuf,
        /// Parser message
        message: String,
    },

    /// Reading or writing the file failed
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// State could not be serialized
    #[error("failed to serialize state: {0}")]
    Serialize(String),

    /// Unknown artifact category name
    #[error("unknown artifact category: {0}")]
    UnknownCategory(String),

    /// Unknown test status name
    #[error("unknown test status: {0}")]
    UnknownStatus(String),
}

impl StateError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StateError::Io {
            path: path.into(),
            source,
        }
    }
}
