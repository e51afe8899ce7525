//! Error types for EQLog

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for EQLog operations
pub type Result<T> = std::result::Result<T, EqlogError>;

/// Main error type for EQLog
#[derive(Error, Debug)]
pub enum EqlogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out after {waited:?} reading {}", path.display())]
    ReadTimeout { path: PathBuf, waited: Duration },

    #[error("Unknown text encoding: {0}")]
    Encoding(String),

    #[error("Required header not found: {0}")]
    MissingHeader(String),

    #[error("Parse error: {0}")]
    Parse(String),

    /// The server rejected a statement (constraint, type or syntax error)
    #[error("Database error: {0}")]
    Database(String),

    /// The server could not be reached or the connection was lost
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EqlogError {
    /// Whether retrying the same operation later might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EqlogError::ReadTimeout { .. } | EqlogError::Connection(_)
        )
    }
}
