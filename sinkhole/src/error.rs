//! Error types for the sinkhole telemetry core.
//!
//! The read path never surfaces these: aggregation routines return empty but
//! well-formed responses instead. Errors exist for the ingest path (table
//! growth), durable storage, configuration, collaborators, and the worker
//! thread lifecycle.

use std::error::Error as StdError;
use std::path::PathBuf;

use thiserror::Error;

/// Boxed error for wrapping backend-specific failures.
pub type BoxedError = Box<dyn StdError + Send + Sync>;

/// The main error type for all sinkhole operations.
#[derive(Error, Debug)]
pub enum SinkholeError {
    /// Error while growing or addressing an entity table.
    #[error("table error: {0}")]
    Table(#[from] TableError),

    /// Error talking to durable storage.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Invalid or unreadable configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Error raised by an external collaborator (neighbor cache, gravity).
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// Error starting or stopping the persistence worker.
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),
}

/// Errors raised by the entity tables.
#[derive(Error, Debug)]
pub enum TableError {
    /// The table has handed out every index its id type can represent.
    #[error("{kind} table is full ({len} entries)")]
    Full {
        /// Which entity table overflowed.
        kind: &'static str,
        /// Number of entries at the time of the failed allocation.
        len: usize,
    },
}

/// Errors raised by durable storage backends.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The backend could not be opened (missing directory, locked file, ...).
    #[error("failed to open storage '{location}': {message}")]
    Open {
        /// Path or description of the storage location.
        location: String,
        /// What went wrong.
        message: String,
        /// The underlying backend error, if any.
        #[source]
        source: Option<BoxedError>,
    },

    /// A statement failed after the backend was opened.
    #[error("storage query failed: {message}")]
    Query {
        /// Which operation failed.
        message: String,
        /// The underlying backend error, if any.
        #[source]
        source: Option<BoxedError>,
    },

    /// A persisted row could not be mapped back onto the data model.
    #[error("invalid row in storage: {0}")]
    InvalidData(String),
}

impl StorageError {
    /// Creates an open error with a source.
    pub fn open(
        location: impl Into<String>,
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Open {
            location: location.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a query error with a source.
    pub fn query(message: impl Into<String>, source: impl StdError + Send + Sync + 'static) -> Self {
        Self::Query {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A configuration value is out of range.
    #[error("invalid value for '{field}': {reason}")]
    Invalid {
        /// The offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// The configuration file could not be read.
    #[error("failed to read config '{}': {source}", path.display())]
    Read {
        /// The config file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for this schema.
    #[error("failed to parse config '{}': {source}", path.display())]
    Parse {
        /// The config file path.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised by external collaborators the worker drives.
#[derive(Error, Debug)]
pub enum SourceError {
    /// A collaborator's backing file could not be read.
    #[error("failed to read {what} from '{}': {source}", path.display())]
    Read {
        /// What was being read (e.g. "neighbor cache").
        what: &'static str,
        /// The file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The blocklist could not be rebuilt.
    #[error("gravity reload failed: {reason}")]
    Reload {
        /// Description of the failure.
        reason: String,
    },
}

/// Errors raised by the persistence worker lifecycle.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The OS refused to start the worker thread.
    #[error("failed to spawn worker thread: {source}")]
    Spawn {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The worker thread panicked before it could shut down cleanly.
    #[error("worker thread panicked")]
    Panicked,
}

/// Type alias for `Result<T, SinkholeError>`.
pub type Result<T> = std::result::Result<T, SinkholeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_query_error_helper() {
        let source = io::Error::other("disk I/O error");
        let err = StorageError::query("insert failed", source);

        match err {
            StorageError::Query { message, source } => {
                assert_eq!(message, "insert failed");
                assert!(source.is_some());
            }
            other => panic!("Expected Query variant, got: {other:?}"),
        }
    }

    #[test]
    fn test_open_error_display() {
        let err = StorageError::open(
            "/var/lib/sinkhole/queries.db",
            "database is locked",
            io::Error::other("busy"),
        );
        assert_eq!(
            err.to_string(),
            "failed to open storage '/var/lib/sinkhole/queries.db': database is locked"
        );
    }

    #[test]
    fn test_conversion_into_crate_error() {
        let err: SinkholeError = TableError::Full { kind: "domain", len: 7 }.into();
        assert!(matches!(err, SinkholeError::Table(TableError::Full { .. })));
        assert_eq!(err.to_string(), "table error: domain table is full (7 entries)");
    }
}
