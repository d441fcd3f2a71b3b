//! The store lock: one mutex over all entity tables, counters and history.
//!
//! Every reader and every writer holds the lock for the whole of its
//! read-modify or read-serialize step. There is no reader/writer split, so
//! each aggregation sees a point-in-time snapshot. Hold times must stay
//! bounded to in-memory iteration and copying; no I/O happens under the lock.
//!
//! # Example
//!
//! ```rust
//! use sinkhole::config::TelemetryConfig;
//! use sinkhole::lock::StoreLock;
//! use sinkhole::tables::Tables;
//!
//! let lock = StoreLock::new(Tables::new(&TelemetryConfig::default(), 0));
//! let reader = lock.clone();
//!
//! let queries = reader.read(|tables| tables.counters().queries);
//! assert_eq!(queries, 0);
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::warn;

use crate::tables::Tables;

/// Cloneable handle to the shared, lock-protected [`Tables`].
#[derive(Debug, Clone)]
pub struct StoreLock {
    inner: Arc<Mutex<Tables>>,
}

impl StoreLock {
    /// Wraps `tables` in a new lock.
    pub fn new(tables: Tables) -> Self {
        Self {
            inner: Arc::new(Mutex::new(tables)),
        }
    }

    /// Blocks until the lock is held. Dropping the guard releases it.
    ///
    /// A panic in another holder does not make the tables unusable: every
    /// mutation keeps the tables self-consistent at each step, so a poisoned
    /// lock is logged and recovered.
    pub fn acquire(&self) -> MutexGuard<'_, Tables> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("store lock was poisoned by a panicking holder, recovering");
            poisoned.into_inner()
        })
    }

    /// Runs `f` with shared access for the duration of the call.
    pub fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        let guard = self.acquire();
        f(&guard)
    }

    /// Runs `f` with exclusive access for the duration of the call.
    pub fn with<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> R {
        let mut guard = self.acquire();
        f(&mut guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TelemetryConfig;
    use crate::model::{QueryRecord, QueryStatus, QueryType, ReplyType};
    use std::thread;

    fn record(timestamp: i64, domain: &str) -> QueryRecord {
        QueryRecord {
            timestamp,
            domain: domain.to_string(),
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
    fn test_writers_serialize() {
        let now = 100_000;
        let lock = StoreLock::new(Tables::new(&TelemetryConfig::default(), now));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let lock = lock.clone();
                thread::spawn(move || {
                    for i in 0..250 {
                        lock.with(|tables| {
                            tables.record(&record(now, &format!("d{t}-{i}.example"))).unwrap();
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        lock.read(|tables| {
            assert_eq!(tables.counters().queries, 1_000);
            assert_eq!(tables.domains().len(), 1_000);
        });
    }

    #[test]
    fn test_poisoned_lock_is_recovered() {
        let lock = StoreLock::new(Tables::new(&TelemetryConfig::default(), 0));
        let poisoner = lock.clone();
        let result = thread::spawn(move || {
            let _guard = poisoner.acquire();
            panic!("holder panicked");
        })
        .join();
        assert!(result.is_err());

        assert_eq!(lock.read(|tables| tables.counters().queries), 0);
    }
}
