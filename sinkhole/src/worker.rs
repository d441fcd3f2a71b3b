//! The persistence worker: one background thread that moves pending queries
//! to durable storage, enforces retention and services deferred events.
//!
//! # Loop
//!
//! Every iteration evaluates, in order:
//!
//! 1. **MovePending**: at most once per wall-clock second. Under the store
//!    lock, slide the OverTime window, move newly completed queries into the
//!    write queue and drop expired in-memory payloads.
//! 2. **Export**: once per `db_interval` (at least one second), aligned to
//!    interval boundaries. Open storage, drain the write queue under the lock,
//!    insert outside the lock, then run **Retention**. Export is skipped when
//!    `db_export` is off, but every interval tick still requests a
//!    neighbor-cache parse.
//! 3. **VendorRefresh**: once per 30-day period.
//! 4. **NeighborParse**: when [`Event::ParseNeighborCache`] is pending.
//! 5. **AliasReimport**: when [`Event::ReimportAliasClients`] is pending;
//!    checked before and after the gravity reload, because a reload requests
//!    a reimport.
//! 6. **Sleeping**: a fixed pause before the next iteration.
//!
//! # Failure handling
//!
//! A storage open failure abandons the iteration and the worker waits a fixed
//! retry delay before starting over. Nothing is dropped: queued rows stay in
//! memory and events stay pending. An insert failure puts the drained batch
//! back at the front of the write queue.
//!
//! # Shutdown
//!
//! The shutdown flag is checked between every step and during every pause
//! (in slices of at most [`SLEEP_INTERVAL`]), so the worker stops within one
//! sleep interval plus the step in progress. Any open storage handle is
//! closed before the thread exits.
//!
//! # Example
//!
//! ```rust,no_run
//! use sinkhole::config::TelemetryConfig;
//! use sinkhole::lock::StoreLock;
//! use sinkhole::storage::SqliteStorage;
//! use sinkhole::tables::Tables;
//! use sinkhole::worker::PersistenceWorker;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TelemetryConfig::default();
//! let store = StoreLock::new(Tables::new(&config, 1_700_000_000));
//! let storage = SqliteStorage::new("/var/lib/sinkhole/queries.db");
//!
//! let handle = PersistenceWorker::new(store.clone(), Box::new(storage), config).spawn()?;
//! // ... ingest runs against `store` ...
//! let stats = handle.shutdown()?;
//! println!("exported {} queries", stats.exported);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::TelemetryConfig;
use crate::error::{Result, WorkerError};
use crate::events::{Event, EventFlags};
use crate::lock::StoreLock;
use crate::model::QueryRecord;
use crate::sources::{GravitySource, NeighborSource, ProcNeighborSource, StaticVendorLookup, VendorLookup};
use crate::storage::{Storage, StorageHandle, apply_retention};

/// Pause between loop iterations.
pub const SLEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Pause after durable storage could not be opened.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Length of the vendor-refresh period in seconds (30 days).
pub const VENDOR_REFRESH_PERIOD: i64 = 2_592_000;

/// Step the worker is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Between iterations, not yet started, or evaluating conditions.
    Idle,
    /// Moving completed queries into the write queue.
    MovePending,
    /// Writing the write queue to durable storage.
    Export,
    /// Deleting expired rows from durable storage.
    Retention,
    /// Refreshing hardware-address vendors.
    VendorRefresh,
    /// Importing the neighbor cache.
    NeighborParse,
    /// Rebuilding alias-client aggregation.
    AliasReimport,
    /// Pausing before the next iteration.
    Sleeping,
    /// Shut down; terminal.
    Stopped,
}

/// Result of a single loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iteration {
    /// All due steps ran; pause for [`SLEEP_INTERVAL`].
    Completed,
    /// Durable storage could not be opened; pause for [`RETRY_DELAY`].
    StorageUnavailable,
    /// The shutdown flag was observed.
    Stopped,
}

/// Counters describing what the worker did over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Loop iterations started.
    pub iterations: u64,
    /// Queries moved into the write queue.
    pub moved: u64,
    /// Queries written to durable storage.
    pub exported: u64,
    /// Failed export batches (returned to the queue).
    pub export_failures: u64,
    /// Failed attempts to open durable storage.
    pub open_failures: u64,
    /// Rows removed by retention.
    pub retention_deleted: u64,
    /// Vendor refreshes performed.
    pub vendor_refreshes: u64,
    /// Neighbor-cache imports performed.
    pub neighbor_imports: u64,
    /// Alias-client rebuilds performed.
    pub alias_rebuilds: u64,
    /// Blocklist reloads performed.
    pub gravity_reloads: u64,
}

/// Single background loop driving durable storage.
pub struct PersistenceWorker {
    store: StoreLock,
    storage: Box<dyn Storage>,
    config: TelemetryConfig,
    clock: Arc<dyn Clock>,
    events: Arc<EventFlags>,
    shutdown: Arc<AtomicBool>,
    neighbors: Box<dyn NeighborSource>,
    vendors: Arc<dyn VendorLookup>,
    gravity: Option<Box<dyn GravitySource>>,
    sleep_interval: Duration,
    retry_delay: Duration,

    state: WorkerState,
    last_move: Option<i64>,
    last_tick: Option<i64>,
    vendor_period: Option<i64>,
    stats: WorkerStats,
}

impl std::fmt::Debug for PersistenceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceWorker")
            .field("storage", &self.storage.describe())
            .field("state", &self.state)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl PersistenceWorker {
    /// Creates a worker with the system clock, the kernel neighbor cache, an
    /// empty vendor table and no blocklist source.
    pub fn new(store: StoreLock, storage: Box<dyn Storage>, config: TelemetryConfig) -> Self {
        Self {
            store,
            storage,
            config,
            clock: Arc::new(SystemClock),
            events: Arc::new(EventFlags::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            neighbors: Box::new(ProcNeighborSource::default()),
            vendors: Arc::new(StaticVendorLookup::default()),
            gravity: None,
            sleep_interval: SLEEP_INTERVAL,
            retry_delay: RETRY_DELAY,
            state: WorkerState::Idle,
            last_move: None,
            last_tick: None,
            vendor_period: None,
            stats: WorkerStats::default(),
        }
    }

    /// Uses `clock` instead of the system clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Shares `events` with other threads instead of a private flag set.
    #[must_use]
    pub fn with_events(mut self, events: Arc<EventFlags>) -> Self {
        self.events = events;
        self
    }

    /// Uses `source` for neighbor-cache imports.
    #[must_use]
    pub fn with_neighbor_source(mut self, source: Box<dyn NeighborSource>) -> Self {
        self.neighbors = source;
        self
    }

    /// Uses `vendors` for hardware-address vendor lookups.
    #[must_use]
    pub fn with_vendor_lookup(mut self, vendors: Arc<dyn VendorLookup>) -> Self {
        self.vendors = vendors;
        self
    }

    /// Watches `gravity` for blocklist changes.
    #[must_use]
    pub fn with_gravity_source(mut self, gravity: Box<dyn GravitySource>) -> Self {
        self.gravity = Some(gravity);
        self
    }

    /// Overrides the iteration pause and the storage retry delay.
    #[must_use]
    pub fn with_pacing(mut self, sleep_interval: Duration, retry_delay: Duration) -> Self {
        self.sleep_interval = sleep_interval;
        self.retry_delay = retry_delay;
        self
    }

    /// Deferred-event flags serviced by this worker.
    pub fn events(&self) -> Arc<EventFlags> {
        Arc::clone(&self.events)
    }

    /// Flag that stops the worker when set.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Current step.
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Lifetime counters.
    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Starts the worker on a dedicated thread named `database`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Spawn`] if the thread cannot be created.
    pub fn spawn(self) -> Result<WorkerHandle> {
        let shutdown = self.shutdown_flag();
        let events = self.events();
        let thread = thread::Builder::new()
            .name("database".to_string())
            .spawn(move || self.run())
            .map_err(|source| WorkerError::Spawn { source })?;
        Ok(WorkerHandle {
            shutdown,
            events,
            thread,
        })
    }

    /// Runs the loop on the current thread until the shutdown flag is set.
    pub fn run(mut self) -> WorkerStats {
        info!(
            storage = %self.storage.describe(),
            db_interval = self.config.db_interval,
            max_db_days = self.config.max_db_days,
            "persistence worker started"
        );
        loop {
            let pause = match self.run_iteration() {
                Iteration::Completed => self.sleep_interval,
                Iteration::StorageUnavailable => self.retry_delay,
                Iteration::Stopped => break,
            };
            self.state = WorkerState::Sleeping;
            if !self.pause(pause) {
                break;
            }
        }
        self.state = WorkerState::Stopped;
        info!(
            exported = self.stats.exported,
            iterations = self.stats.iterations,
            "persistence worker terminated"
        );
        self.stats
    }

    /// Runs one loop iteration.
    pub fn run_iteration(&mut self) -> Iteration {
        self.state = WorkerState::Idle;
        if self.stopping() {
            return self.stop();
        }
        self.stats.iterations += 1;
        let now = self.clock.now();

        if self.last_move.is_none_or(|last| now > last) {
            self.move_pending(now);
            self.last_move = Some(now);
        }
        if self.stopping() {
            return self.stop();
        }

        let interval = self.config.db_interval.max(1);
        let aligned = now - now.rem_euclid(interval);
        let last_tick = *self.last_tick.get_or_insert(aligned);
        if now - last_tick >= interval {
            if self.config.db_export {
                let outcome = self.export(now);
                if outcome != Iteration::Completed {
                    return outcome;
                }
            }
            self.last_tick = Some(aligned);
            self.events.set(Event::ParseNeighborCache);
        }

        let period = now.div_euclid(VENDOR_REFRESH_PERIOD);
        let last_period = *self.vendor_period.get_or_insert(period);
        if period != last_period {
            match self.refresh_vendors() {
                Iteration::Completed => self.vendor_period = Some(period),
                other => return other,
            }
        }
        if self.stopping() {
            return self.stop();
        }

        if self.events.take(Event::ParseNeighborCache) {
            let outcome = self.parse_neighbors(now);
            if outcome != Iteration::Completed {
                self.events.set(Event::ParseNeighborCache);
                return outcome;
            }
        }
        if self.stopping() {
            return self.stop();
        }

        let outcome = self.reimport_alias_clients();
        if outcome != Iteration::Completed {
            return outcome;
        }

        if self.events.take(Event::ReloadGravity) {
            self.reload_gravity();
        }
        if self.stopping() {
            return self.stop();
        }

        self.reimport_alias_clients()
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn stop(&mut self) -> Iteration {
        self.state = WorkerState::Stopped;
        Iteration::Stopped
    }

    /// Sleeps for `total` in slices, returning false if shutdown was requested.
    fn pause(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if self.stopping() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            thread::sleep(remaining.min(SLEEP_INTERVAL));
        }
    }

    fn open_storage(&mut self) -> Option<Box<dyn StorageHandle>> {
        match self.storage.open() {
            Ok(handle) => Some(handle),
            Err(e) => {
                self.stats.open_failures += 1;
                warn!(
                    storage = %self.storage.describe(),
                    error = %e,
                    retry_in_ms = self.retry_delay.as_millis(),
                    "failed to open durable storage, will retry"
                );
                None
            }
        }
    }

    fn close_storage(&self, handle: Box<dyn StorageHandle>) {
        if let Err(e) = handle.close() {
            warn!(storage = %self.storage.describe(), error = %e, "failed to close durable storage");
        }
    }

    fn move_pending(&mut self, now: i64) {
        self.state = WorkerState::MovePending;
        if self.gravity.as_mut().is_some_and(|g| g.changed()) {
            self.events.set(Event::ReloadGravity);
        }
        let export = self.config.db_export;
        let (moved, shifted, expired) = self.store.with(|tables| {
            let shifted = tables.advance_over_time(now);
            let moved = if export { tables.move_pending() } else { 0 };
            let expired = tables.expire_queries(export);
            (moved, shifted, expired)
        });
        self.stats.moved += moved as u64;
        if moved > 0 || shifted > 0 || expired > 0 {
            debug!(moved, shifted, expired, "moved pending queries");
        }
    }

    fn export(&mut self, now: i64) -> Iteration {
        self.state = WorkerState::Export;
        let Some(mut handle) = self.open_storage() else {
            return Iteration::StorageUnavailable;
        };
        if self.stopping() {
            self.close_storage(handle);
            return self.stop();
        }

        let batch = self.store.with(|tables| tables.take_write_queue());
        if !batch.is_empty() {
            let rows: Vec<QueryRecord> = batch.iter().map(|p| p.record.clone()).collect();
            match handle.insert_queries(&rows) {
                Ok(written) => {
                    self.store.with(|tables| tables.mark_stored(batch.iter().map(|p| p.id)));
                    self.stats.exported += written as u64;
                    debug!(written, "exported queries to durable storage");
                }
                Err(e) => {
                    self.stats.export_failures += 1;
                    warn!(error = %e, queued = batch.len(), "export failed, queries kept for the next attempt");
                    self.store.with(|tables| tables.requeue(batch));
                }
            }
        }
        if self.stopping() {
            self.close_storage(handle);
            return self.stop();
        }

        if self.config.retention_enabled() {
            self.state = WorkerState::Retention;
            match apply_retention(
                handle.as_mut(),
                now,
                self.config.max_db_days,
                self.config.debug_database,
            ) {
                Ok(report) => self.stats.retention_deleted += report.deleted,
                Err(e) => warn!(error = %e, "retention pass failed"),
            }
        }
        self.close_storage(handle);
        Iteration::Completed
    }

    fn refresh_vendors(&mut self) -> Iteration {
        self.state = WorkerState::VendorRefresh;
        let Some(mut handle) = self.open_storage() else {
            return Iteration::StorageUnavailable;
        };
        match handle.refresh_vendors(self.vendors.as_ref()) {
            Ok(known) => {
                self.stats.vendor_refreshes += 1;
                info!(known, "refreshed hardware vendors");
            }
            Err(e) => warn!(error = %e, "vendor refresh failed"),
        }
        self.close_storage(handle);
        Iteration::Completed
    }

    fn parse_neighbors(&mut self, now: i64) -> Iteration {
        self.state = WorkerState::NeighborParse;
        let entries = match self.neighbors.neighbors() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "cannot read neighbor cache");
                return Iteration::Completed;
            }
        };
        let Some(mut handle) = self.open_storage() else {
            return Iteration::StorageUnavailable;
        };
        if let Err(e) = handle.upsert_neighbors(&entries, now) {
            warn!(error = %e, "failed to store neighbor cache");
        }
        self.close_storage(handle);

        let vendors = Arc::clone(&self.vendors);
        let updated = self
            .store
            .with(|tables| tables.apply_neighbors(&entries, vendors.as_ref()));
        self.stats.neighbor_imports += 1;
        debug!(entries = entries.len(), updated, "imported neighbor cache");
        Iteration::Completed
    }

    fn reimport_alias_clients(&mut self) -> Iteration {
        if !self.events.take(Event::ReimportAliasClients) {
            return Iteration::Completed;
        }
        self.state = WorkerState::AliasReimport;
        let Some(handle) = self.open_storage() else {
            self.events.set(Event::ReimportAliasClients);
            return Iteration::StorageUnavailable;
        };
        let defs = handle.alias_clients();
        self.close_storage(handle);
        let defs = match defs {
            Ok(defs) => defs,
            Err(e) => {
                warn!(error = %e, "cannot read alias clients");
                return Iteration::Completed;
            }
        };

        match self.store.with(|tables| tables.rebuild_alias_clients(&defs)) {
            Ok(attached) => {
                self.stats.alias_rebuilds += 1;
                debug!(attached, "reimported alias clients");
            }
            Err(e) => warn!(error = %e, "alias-client reimport failed"),
        }
        Iteration::Completed
    }

    fn reload_gravity(&mut self) {
        let Some(gravity) = self.gravity.as_mut() else {
            debug!("gravity reload requested without a blocklist source");
            return;
        };
        match gravity.reload() {
            Ok(domains) => {
                self.store.with(|tables| tables.set_gravity(domains));
                self.stats.gravity_reloads += 1;
                self.events.set(Event::ReimportAliasClients);
                info!(domains, "blocklist reloaded");
            }
            Err(e) => warn!(error = %e, "blocklist reload failed"),
        }
    }
}

/// Handle to a worker running on its own thread.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: Arc<AtomicBool>,
    events: Arc<EventFlags>,
    thread: JoinHandle<WorkerStats>,
}

impl WorkerHandle {
    /// Deferred-event flags serviced by the worker.
    pub fn events(&self) -> &Arc<EventFlags> {
        &self.events
    }

    /// Returns true once the worker thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Signals shutdown and waits for the thread to exit.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Panicked`] if the worker thread panicked.
    pub fn shutdown(self) -> Result<WorkerStats> {
        self.shutdown.store(true, Ordering::Release);
        self.thread.join().map_err(|_| WorkerError::Panicked.into())
    }
}
