//! # sinkhole
//!
//! Telemetry core for a network-wide DNS filtering resolver.
//!
//! sinkhole records every completed name lookup, aggregates it into
//! per-domain, per-client and per-upstream counters, keeps a time-bucketed
//! history for dashboards, and flushes the raw query stream to durable
//! storage from a single background worker while bounding both memory and
//! disk growth.
//!
//! ## Key Properties
//!
//! - Append-only entity tables with stable typed indices; entries are never
//!   reused, expired queries become tombstones
//! - One coarse lock over all tables, so every read sees a consistent snapshot
//! - Coalescing deferred-work flags instead of an event queue
//! - Bounded retention: each pass deletes at most 1% of the stored rows
//! - A persistence worker that never drops queued rows on storage failure
//!
//! ## Quick Start
//!
//! ```rust
//! use sinkhole::api::ReadApi;
//! use sinkhole::config::TelemetryConfig;
//! use sinkhole::lock::StoreLock;
//! use sinkhole::model::{QueryRecord, QueryStatus, QueryType, ReplyType};
//! use sinkhole::tables::Tables;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TelemetryConfig::default();
//! let now = 1_700_000_000;
//! let store = StoreLock::new(Tables::new(&config, now));
//!
//! let record = QueryRecord {
//!     timestamp: now,
//!     domain: "ads.example".to_string(),
//!     client_ip: "192.168.1.20".to_string(),
//!     client_name: None,
//!     upstream: None,
//!     query_type: QueryType::A,
//!     status: QueryStatus::Gravity,
//!     reply: ReplyType::Ip,
//!     response_time: None,
//! };
//! store.with(|tables| tables.record(&record))?;
//!
//! let summary = store.read(|tables| ReadApi::new(tables, &config, now).summary());
//! assert_eq!(summary.queries.blocked, 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Tables`]: Entity arena of domains, clients, upstreams, queries and counters
//! - [`StoreLock`]: The single lock every reader and writer goes through
//! - [`EventFlags`]: Deferred work requested from any thread
//! - [`PersistenceWorker`]: Background loop for export, retention and imports
//! - [`ReadApi`]: History, top lists and summary over one snapshot
//!
//! ## Modules
//!
//! - [`model`]: Entity types, typed indices and DNS enums
//! - [`table`]: Append-only indexed table
//! - [`tables`]: Ingest, restore and maintenance of the arena
//! - [`overtime`]: Fixed ring of history buckets
//! - [`storage`]: Durable storage traits, SQLite and in-memory backends
//! - [`sources`]: Neighbor cache, vendor and blocklist collaborators
//! - [`config`]: Configuration knobs
//! - [`error`]: Error types

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod lock;
pub mod model;
pub mod overtime;
pub mod sources;
pub mod storage;
pub mod table;
pub mod tables;
pub mod worker;

// Re-export primary API types at crate root for convenience.
pub use api::{Endpoint, ReadApi};
pub use config::{PrivacyLevel, TelemetryConfig};
pub use error::{Result, SinkholeError};
pub use events::{Event, EventFlags};
pub use lock::StoreLock;
pub use model::QueryRecord;
pub use tables::Tables;
pub use worker::{PersistenceWorker, WorkerHandle};
