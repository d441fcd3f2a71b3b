//! Durable storage: the record store the persistence worker drives.
//!
//! A [`Storage`] is a factory that can be asked to open a connection; the
//! worker opens one per export cycle and closes it again, so the backend is
//! free to be unavailable in between. A [`StorageHandle`] is one open
//! connection supporting batched insert, bounded deletion by age and size
//! introspection, plus the neighbor and alias-client tables the worker
//! maintains.
//!
//! Two backends ship with the crate:
//!
//! - [`SqliteStorage`]: a single SQLite file (via `rusqlite`)
//! - [`MemoryStorage`]: an in-process store with injectable failures, for tests
//!
//! # Retention
//!
//! [`apply_retention`] deletes rows older than `max_db_days`, but never more
//! than one percent of the current row count (rounded down) per pass. This
//! bounds how long a single pass can keep the backend busy; a large backlog
//! drains over several export cycles.

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use tracing::{debug, info};

use crate::config::SECONDS_PER_DAY;
use crate::error::StorageError;
use crate::model::{AliasClientDef, NeighborEntry, QueryRecord};
use crate::sources::VendorLookup;

/// Factory for storage connections.
pub trait Storage: Send {
    /// Opens a connection.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the backend is unavailable. The
    /// caller is expected to retry later.
    fn open(&self) -> Result<Box<dyn StorageHandle>, StorageError>;

    /// Human-readable location, used in log output.
    fn describe(&self) -> String;
}

/// One open storage connection.
///
/// # Errors
///
/// Every fallible method returns [`StorageError::Query`] when the backend
/// rejects the operation, and [`StorageError::InvalidData`] when a persisted
/// row cannot be mapped back onto the data model.
#[allow(clippy::missing_errors_doc)]
pub trait StorageHandle {
    /// Appends `rows` in one batch; returns the number of rows written.
    fn insert_queries(&mut self, rows: &[QueryRecord]) -> Result<usize, StorageError>;

    /// Number of stored query rows.
    fn row_count(&self) -> Result<u64, StorageError>;

    /// Deletes at most `limit` rows with `timestamp <= cutoff`, oldest first.
    fn delete_older_than(&mut self, cutoff: i64, limit: u64) -> Result<u64, StorageError>;

    /// Size of the backing store in bytes.
    fn size_bytes(&self) -> Result<u64, StorageError>;

    /// Oldest and newest stored query timestamps, `None` when empty.
    fn timestamp_range(&self) -> Result<Option<(i64, i64)>, StorageError>;

    /// Stored queries with `timestamp >= since`, in insertion order.
    fn load_since(&self, since: i64) -> Result<Vec<QueryRecord>, StorageError>;

    /// Inserts or refreshes neighbor-cache entries keyed by hardware address.
    fn upsert_neighbors(&mut self, entries: &[NeighborEntry], now: i64) -> Result<usize, StorageError>;

    /// Re-resolves the vendor of every known hardware address; returns the
    /// number of addresses with a known vendor.
    fn refresh_vendors(&mut self, vendors: &dyn VendorLookup) -> Result<usize, StorageError>;

    /// Creates or replaces an alias-client definition.
    fn save_alias_client(&mut self, def: &AliasClientDef) -> Result<(), StorageError>;

    /// All alias-client definitions with their member addresses.
    fn alias_clients(&self) -> Result<Vec<AliasClientDef>, StorageError>;

    /// Closes the connection.
    fn close(self: Box<Self>) -> Result<(), StorageError>;
}

/// Outcome of one retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// Rows deleted in this pass.
    pub deleted: u64,
    /// Maximum rows this pass was allowed to delete.
    pub limit: u64,
    /// Storage size after the pass.
    pub size_bytes: u64,
}

/// Per-pass deletion cap: one percent of `row_count`, rounded down.
///
/// # Examples
///
/// ```rust
/// use sinkhole::storage::retention_limit;
///
/// assert_eq!(retention_limit(250), 2);
/// assert_eq!(retention_limit(99), 0);
/// ```
pub fn retention_limit(row_count: u64) -> u64 {
    row_count / 100
}

/// Timestamp at or before which rows are eligible for deletion.
pub fn retention_cutoff(now: i64, max_db_days: i32) -> i64 {
    now - i64::from(max_db_days) * SECONDS_PER_DAY
}

/// Runs one bounded retention pass.
///
/// Logs at info level when rows were deleted or `verbose` is set.
///
/// # Errors
///
/// Propagates any [`StorageError`] from the handle.
pub fn apply_retention(
    handle: &mut dyn StorageHandle,
    now: i64,
    max_db_days: i32,
    verbose: bool,
) -> Result<RetentionReport, StorageError> {
    let cutoff = retention_cutoff(now, max_db_days);
    let limit = retention_limit(handle.row_count()?);
    let deleted = if limit > 0 {
        handle.delete_older_than(cutoff, limit)?
    } else {
        0
    };
    let size_bytes = handle.size_bytes()?;

    if deleted > 0 || verbose {
        info!(deleted, limit, cutoff, size_bytes, "database retention pass");
    } else {
        debug!(limit, cutoff, size_bytes, "database retention pass deleted nothing");
    }
    Ok(RetentionReport {
        deleted,
        limit,
        size_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{QueryStatus, QueryType, ReplyType};

    fn row(timestamp: i64) -> QueryRecord {
        QueryRecord {
            timestamp,
            domain: "a.example".to_string(),
            client_ip: "10.0.0.1".to_string(),
            client_name: None,
            upstream: None,
            query_type: QueryType::A,
            status: QueryStatus::Cache,
            reply: ReplyType::Ip,
            response_time: None,
        }
    }

    #[test]
    fn test_retention_limit_rounds_down() {
        assert_eq!(retention_limit(0), 0);
        assert_eq!(retention_limit(100), 1);
        assert_eq!(retention_limit(250), 2);
        assert_eq!(retention_limit(1_000_000), 10_000);
    }

    #[test]
    fn test_retention_cutoff() {
        assert_eq!(retention_cutoff(10 * SECONDS_PER_DAY, 3), 7 * SECONDS_PER_DAY);
    }

    #[test]
    fn test_apply_retention_is_bounded() {
        let storage = MemoryStorage::new();
        let mut handle = storage.open().unwrap();
        let rows: Vec<_> = (0..250).map(row).collect();
        handle.insert_queries(&rows).unwrap();

        let now = 100 * SECONDS_PER_DAY;
        let report = apply_retention(handle.as_mut(), now, 1, false).unwrap();
        assert_eq!(report.limit, 2);
        assert_eq!(report.deleted, 2);
        assert_eq!(handle.row_count().unwrap(), 248);

        // Oldest rows go first.
        let remaining = handle.load_since(0).unwrap();
        assert_eq!(remaining[0].timestamp, 2);
    }

    #[test]
    fn test_apply_retention_keeps_recent_rows() {
        let storage = MemoryStorage::new();
        let mut handle = storage.open().unwrap();
        let now = 100 * SECONDS_PER_DAY;
        let rows: Vec<_> = (0..300).map(|i| row(now - i)).collect();
        handle.insert_queries(&rows).unwrap();

        let report = apply_retention(handle.as_mut(), now, 1, true).unwrap();
        assert_eq!(report.deleted, 0);
        assert_eq!(handle.row_count().unwrap(), 300);
    }
}
