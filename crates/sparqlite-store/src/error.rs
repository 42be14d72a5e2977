//! Error types for the store

use thiserror::Error;

/// Store error type
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database could not be opened: missing file in read-only mode, WAL
    /// rejected by the engine, not enough disk space, ...
    #[error("Open error: {0}")]
    Open(String),

    /// Query execution error (malformed SQL, integrity failure, ...)
    #[error("Query error: {0}")]
    Query(String),

    /// Stored collation locale differs from the current one
    #[error("Locale change detected (database: {stored}, current: {current})")]
    LocaleMismatch { stored: String, current: String },

    /// Operation not available in the current access mode
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Underlying rusqlite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Whether this error came from running a statement, as opposed to
    /// opening files or configuring the store.
    pub fn is_query_error(&self) -> bool {
        matches!(self, StoreError::Query(_) | StoreError::Sqlite(_))
    }
}

impl From<toml::de::Error> for StoreError {
    fn from(err: toml::de::Error) -> Self {
        StoreError::Config(err.to_string())
    }
}
