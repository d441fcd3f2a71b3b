//! In-process storage backend.
//!
//! All handles opened from one [`MemoryStorage`] (and its clones) share the
//! same state, so a test can keep a clone to inspect what the worker wrote.
//! Open and insert failures can be injected to exercise the retry paths.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{Storage, StorageHandle};
use crate::error::StorageError;
use crate::model::{AliasClientDef, NeighborEntry, QueryRecord};
use crate::sources::VendorLookup;

/// Approximate bytes per stored row, used for `size_bytes`.
const ROW_BYTES: u64 = 128;

#[derive(Debug, Clone)]
struct NeighborRow {
    entry: NeighborEntry,
    first_seen: i64,
    last_seen: i64,
    vendor: Option<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: Vec<QueryRecord>,
    network: BTreeMap<String, NeighborRow>,
    aliases: BTreeMap<i64, AliasClientDef>,
    fail_opens: usize,
    fail_inserts: usize,
    opens: usize,
    open_handles: usize,
}

/// Shared in-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStorage {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next `n` calls to [`Storage::open`] fail.
    pub fn fail_next_opens(&self, n: usize) {
        self.state().fail_opens = n;
    }

    /// Makes the next `n` calls to [`StorageHandle::insert_queries`] fail.
    pub fn fail_next_inserts(&self, n: usize) {
        self.state().fail_inserts = n;
    }

    /// Number of successful opens so far.
    pub fn opens(&self) -> usize {
        self.state().opens
    }

    /// Number of handles currently open.
    pub fn open_handles(&self) -> usize {
        self.state().open_handles
    }

    /// Copy of every stored query row.
    pub fn rows(&self) -> Vec<QueryRecord> {
        self.state().rows.clone()
    }

    /// Stored vendor for `hwaddr`, if any.
    pub fn vendor_of(&self, hwaddr: &str) -> Option<String> {
        self.state().network.get(hwaddr).and_then(|n| n.vendor.clone())
    }

    /// `(first_seen, last_seen)` for `hwaddr`, if known.
    pub fn neighbor_seen(&self, hwaddr: &str) -> Option<(i64, i64)> {
        self.state()
            .network
            .get(hwaddr)
            .map(|n| (n.first_seen, n.last_seen))
    }
}

impl Storage for MemoryStorage {
    fn open(&self) -> Result<Box<dyn StorageHandle>, StorageError> {
        let mut state = self.state();
        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            return Err(StorageError::Open {
                location: self.describe(),
                message: "injected open failure".to_string(),
                source: None,
            });
        }
        state.opens += 1;
        state.open_handles += 1;
        Ok(Box::new(MemoryHandle {
            state: Arc::clone(&self.state),
        }))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

struct MemoryHandle {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryHandle {
    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for MemoryHandle {
    fn drop(&mut self) {
        let mut state = self.state();
        state.open_handles = state.open_handles.saturating_sub(1);
    }
}

impl StorageHandle for MemoryHandle {
    fn insert_queries(&mut self, rows: &[QueryRecord]) -> Result<usize, StorageError> {
        let mut state = self.state();
        if state.fail_inserts > 0 {
            state.fail_inserts -= 1;
            return Err(StorageError::Query {
                message: "injected insert failure".to_string(),
                source: None,
            });
        }
        state.rows.extend_from_slice(rows);
        Ok(rows.len())
    }

    fn row_count(&self) -> Result<u64, StorageError> {
        Ok(self.state().rows.len() as u64)
    }

    fn delete_older_than(&mut self, cutoff: i64, limit: u64) -> Result<u64, StorageError> {
        let mut state = self.state();
        let mut expired: Vec<(i64, usize)> = state
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.timestamp <= cutoff)
            .map(|(i, row)| (row.timestamp, i))
            .collect();
        expired.sort_unstable();
        expired.truncate(usize::try_from(limit).unwrap_or(usize::MAX));

        let mut doomed = vec![false; state.rows.len()];
        for &(_, i) in &expired {
            doomed[i] = true;
        }
        let mut index = 0;
        state.rows.retain(|_| {
            index += 1;
            !doomed[index - 1]
        });
        Ok(expired.len() as u64)
    }

    fn size_bytes(&self) -> Result<u64, StorageError> {
        Ok(self.state().rows.len() as u64 * ROW_BYTES)
    }

    fn timestamp_range(&self) -> Result<Option<(i64, i64)>, StorageError> {
        let state = self.state();
        let min = state.rows.iter().map(|r| r.timestamp).min();
        let max = state.rows.iter().map(|r| r.timestamp).max();
        Ok(min.zip(max))
    }

    fn load_since(&self, since: i64) -> Result<Vec<QueryRecord>, StorageError> {
        Ok(self
            .state()
            .rows
            .iter()
            .filter(|r| r.timestamp >= since)
            .cloned()
            .collect())
    }

    fn upsert_neighbors(&mut self, entries: &[NeighborEntry], now: i64) -> Result<usize, StorageError> {
        let mut state = self.state();
        for entry in entries {
            state
                .network
                .entry(entry.hwaddr.clone())
                .and_modify(|row| {
                    row.entry = entry.clone();
                    row.last_seen = now;
                })
                .or_insert_with(|| NeighborRow {
                    entry: entry.clone(),
                    first_seen: now,
                    last_seen: now,
                    vendor: None,
                });
        }
        Ok(entries.len())
    }

    fn refresh_vendors(&mut self, vendors: &dyn VendorLookup) -> Result<usize, StorageError> {
        let mut state = self.state();
        let mut known = 0;
        for (hwaddr, row) in &mut state.network {
            row.vendor = vendors.vendor(hwaddr);
            if row.vendor.is_some() {
                known += 1;
            }
        }
        Ok(known)
    }

    fn save_alias_client(&mut self, def: &AliasClientDef) -> Result<(), StorageError> {
        self.state().aliases.insert(def.id, def.clone());
        Ok(())
    }

    fn alias_clients(&self) -> Result<Vec<AliasClientDef>, StorageError> {
        Ok(self.state().aliases.values().cloned().collect())
    }

    fn close(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{QueryStatus, QueryType, ReplyType};
    use crate::sources::StaticVendorLookup;

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
    fn test_injected_open_failures() {
        let storage = MemoryStorage::new();
        storage.fail_next_opens(2);
        assert!(storage.open().is_err());
        assert!(storage.open().is_err());
        assert!(storage.open().is_ok());
        assert_eq!(storage.opens(), 1);
    }

    #[test]
    fn test_handles_are_counted() {
        let storage = MemoryStorage::new();
        let handle = storage.open().unwrap();
        assert_eq!(storage.open_handles(), 1);
        handle.close().unwrap();
        assert_eq!(storage.open_handles(), 0);
    }

    #[test]
    fn test_insert_and_delete() {
        let storage = MemoryStorage::new();
        let mut handle = storage.open().unwrap();
        handle.insert_queries(&[row(1), row(5), row(2), row(9)]).unwrap();

        assert_eq!(handle.delete_older_than(5, 2).unwrap(), 2);
        let left: Vec<i64> = storage.rows().iter().map(|r| r.timestamp).collect();
        assert_eq!(left, vec![5, 9]);
        assert_eq!(handle.timestamp_range().unwrap(), Some((5, 9)));
    }

    #[test]
    fn test_injected_insert_failure_keeps_rows_out() {
        let storage = MemoryStorage::new();
        storage.fail_next_inserts(1);
        let mut handle = storage.open().unwrap();
        assert!(handle.insert_queries(&[row(1)]).is_err());
        assert!(storage.rows().is_empty());
        assert_eq!(handle.insert_queries(&[row(1)]).unwrap(), 1);
    }

    #[test]
    fn test_neighbors_and_vendors() {
        let storage = MemoryStorage::new();
        let mut handle = storage.open().unwrap();
        let entry = NeighborEntry {
            ip: "10.0.0.1".to_string(),
            hwaddr: "aa:bb:cc:00:00:01".to_string(),
            interface: "eth0".to_string(),
        };
        handle.upsert_neighbors(&[entry.clone()], 10).unwrap();
        handle.upsert_neighbors(&[entry], 20).unwrap();
        assert_eq!(storage.neighbor_seen("aa:bb:cc:00:00:01"), Some((10, 20)));

        let vendors = StaticVendorLookup::from_pairs([("aa:bb:cc", "Acme")]);
        assert_eq!(handle.refresh_vendors(&vendors).unwrap(), 1);
        assert_eq!(storage.vendor_of("aa:bb:cc:00:00:01").as_deref(), Some("Acme"));
    }
}
