//! Entity tables: the in-memory arena behind every read endpoint.
//!
//! [`Tables`] owns the domain, client, upstream and query tables together with
//! the global [`Counters`] and the [`OverTime`] ring. It is only ever touched
//! through the [`StoreLock`](crate::lock::StoreLock), so every method here
//! assumes exclusive access and never performs I/O.
//!
//! # Ingest
//!
//! [`Tables::record`] consumes one completed query: it interns the domain,
//! client and upstream (find-or-allocate), appends the query, and bumps every
//! aggregate the query contributes to. Counters only grow within a run.
//!
//! # Persistence hand-off
//!
//! Newly recorded queries are `Pending`. The worker's move step
//! ([`Tables::move_pending`]) copies them into the write queue and marks them
//! `Queued`; after a successful export they become `Stored`
//! ([`Tables::mark_stored`]). A failed export puts the batch back at the front
//! of the queue ([`Tables::requeue`]), so nothing is ever dropped.
//!
//! # Example
//!
//! ```rust
//! use sinkhole::config::TelemetryConfig;
//! use sinkhole::model::{QueryRecord, QueryStatus, QueryType, ReplyType};
//! use sinkhole::tables::Tables;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let now = 1_700_000_000;
//! let mut tables = Tables::new(&TelemetryConfig::default(), now);
//!
//! tables.record(&QueryRecord {
//!     timestamp: now,
//!     domain: "ads.example".to_string(),
//!     client_ip: "192.168.1.20".to_string(),
//!     client_name: Some("laptop".to_string()),
//!     upstream: None,
//!     query_type: QueryType::A,
//!     status: QueryStatus::Gravity,
//!     reply: ReplyType::Ip,
//!     response_time: None,
//! })?;
//!
//! assert_eq!(tables.counters().queries, 1);
//! assert_eq!(tables.counters().blocked_count(), 1);
//! assert_eq!(tables.move_pending(), 1);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;

use tracing::debug;

use crate::config::{PrivacyLevel, TelemetryConfig};
use crate::error::Result;
use crate::model::{
    AliasClientDef, Client, ClientId, Domain, DomainId, EntityId, HIDDEN_CLIENT, HIDDEN_DOMAIN,
    NeighborEntry, Persistence, Query, QueryId, QueryRecord, QueryStatus, QueryType, ReplyType,
    Upstream, UpstreamAddr, UpstreamId,
};
use crate::overtime::{OverTime, shift_counts};
use crate::sources::VendorLookup;
use crate::table::Table;

/// Global aggregate counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counters {
    /// Total queries recorded.
    pub queries: u64,
    /// Histogram indexed by [`QueryType::index`].
    pub query_types: [u64; QueryType::COUNT],
    /// Histogram indexed by [`QueryStatus::index`].
    pub status: [u64; QueryStatus::COUNT],
    /// Histogram indexed by [`ReplyType::index`].
    pub reply: [u64; ReplyType::COUNT],
    /// Distinct domains seen.
    pub domains: usize,
    /// Distinct clients seen (alias clients included).
    pub clients: usize,
    /// Distinct upstreams seen.
    pub upstreams: usize,
    /// Number of domains on the blocklist.
    pub gravity: u64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            queries: 0,
            query_types: [0; QueryType::COUNT],
            status: [0; QueryStatus::COUNT],
            reply: [0; ReplyType::COUNT],
            domains: 0,
            clients: 0,
            upstreams: 0,
            gravity: 0,
        }
    }
}

impl Counters {
    fn sum_status(&self, pred: impl Fn(QueryStatus) -> bool) -> u64 {
        QueryStatus::ALL
            .iter()
            .filter(|s| pred(**s))
            .map(|s| self.status[s.index()])
            .sum()
    }

    /// Queries whose answer was blocked.
    pub fn blocked_count(&self) -> u64 {
        self.sum_status(QueryStatus::is_blocked)
    }

    /// Queries sent to an upstream.
    pub fn forwarded_count(&self) -> u64 {
        self.sum_status(QueryStatus::is_forwarded)
    }

    /// Queries answered from the cache.
    pub fn cached_count(&self) -> u64 {
        self.sum_status(QueryStatus::is_cached)
    }
}

/// A query waiting in the durable-write queue.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingQuery {
    /// In-memory id, used to mark the query stored after export.
    pub id: QueryId,
    /// The row to write.
    pub record: QueryRecord,
}

/// The arena of all entities plus derived aggregates.
#[derive(Debug)]
pub struct Tables {
    domains: Table<DomainId, Domain>,
    clients: Table<ClientId, Client>,
    upstreams: Table<UpstreamId, Upstream>,
    queries: Table<QueryId, Query>,

    domain_index: HashMap<String, DomainId>,
    client_index: HashMap<String, ClientId>,
    upstream_index: HashMap<(String, u16), UpstreamId>,

    counters: Counters,
    over_time: OverTime,
    privacy: PrivacyLevel,

    /// First query index not yet considered by `move_pending`.
    move_cursor: usize,
    /// First query index not yet considered by `expire_queries`.
    expire_cursor: usize,
    write_queue: Vec<PendingQuery>,
}

impl Tables {
    /// Creates empty tables whose OverTime window ends at `now`.
    pub fn new(config: &TelemetryConfig, now: i64) -> Self {
        Self {
            domains: Table::new(),
            clients: Table::new(),
            upstreams: Table::new(),
            queries: Table::new(),
            domain_index: HashMap::new(),
            client_index: HashMap::new(),
            upstream_index: HashMap::new(),
            counters: Counters::default(),
            over_time: OverTime::new(now, config.overtime_slots, config.overtime_interval),
            privacy: config.privacy_level,
            move_cursor: 0,
            expire_cursor: 0,
            write_queue: Vec::new(),
        }
    }

    /// Domain table.
    pub fn domains(&self) -> &Table<DomainId, Domain> {
        &self.domains
    }

    /// Client table.
    pub fn clients(&self) -> &Table<ClientId, Client> {
        &self.clients
    }

    /// Upstream table.
    pub fn upstreams(&self) -> &Table<UpstreamId, Upstream> {
        &self.upstreams
    }

    /// Query table.
    pub fn queries(&self) -> &Table<QueryId, Query> {
        &self.queries
    }

    /// Global counters.
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// History ring.
    pub fn over_time(&self) -> &OverTime {
        &self.over_time
    }

    /// Privacy level applied at ingest.
    pub fn privacy(&self) -> PrivacyLevel {
        self.privacy
    }

    /// Looks up a client by address.
    pub fn client_by_ip(&self, ip: &str) -> Option<ClientId> {
        self.client_index.get(ip).copied()
    }

    /// Looks up a domain by name.
    pub fn domain_by_name(&self, name: &str) -> Option<DomainId> {
        self.domain_index.get(name).copied()
    }

    /// Number of queries waiting in the durable-write queue.
    pub fn write_queue_len(&self) -> usize {
        self.write_queue.len()
    }

    /// Queries not yet handed to durable storage: queued ones plus those
    /// recorded since the last move step.
    pub fn unexported(&self) -> usize {
        self.write_queue.len() + self.queries.len().saturating_sub(self.move_cursor)
    }

    /// Sets the blocklist size reported by the summary endpoint.
    pub fn set_gravity(&mut self, domains: u64) {
        self.counters.gravity = domains;
    }

    /// Records one completed query and returns its id.
    ///
    /// Domain and client identity are replaced by hidden placeholders when the
    /// privacy level asks for it, so suppressed data never enters the tables.
    /// A timestamp outside the OverTime window still counts towards the
    /// global counters but not towards history.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::Full`](crate::error::TableError::Full) if a table
    /// cannot grow any further.
    pub fn record(&mut self, record: &QueryRecord) -> Result<QueryId> {
        let (domain_name, client_ip, client_name) = self.apply_privacy(record);
        let domain = self.intern_domain(domain_name)?;
        let client = self.intern_client(client_ip, client_name)?;
        let upstream = match &record.upstream {
            Some(addr) => Some(self.intern_upstream(addr)?),
            None => None,
        };

        let blocked = record.status.is_blocked();
        let cached = record.status.is_cached();
        let slot = self.over_time.record(record.timestamp, cached, blocked);

        if let Some(d) = self.domains.get_mut(domain) {
            if blocked {
                d.blocked_count = d.blocked_count.saturating_add(1);
            } else {
                d.count = d.count.saturating_add(1);
            }
        }

        let alias = self.clients.get(client).and_then(|c| {
            if c.is_alias_managed() { c.alias_id } else { None }
        });
        for id in std::iter::once(client).chain(alias) {
            if let Some(c) = self.clients.get_mut(id) {
                bump_client(c, slot, blocked);
            }
        }

        if let Some(u) = upstream.and_then(|id| self.upstreams.get_mut(id)) {
            u.count = u.count.saturating_add(1);
            if let Some(seconds) = record.response_time {
                u.add_response(seconds);
            }
        }

        self.counters.queries += 1;
        self.counters.query_types[record.query_type.index()] += 1;
        self.counters.status[record.status.index()] += 1;
        self.counters.reply[record.reply.index()] += 1;

        self.queries.allocate(Query {
            timestamp: record.timestamp,
            domain,
            client,
            upstream,
            query_type: record.query_type,
            status: record.status,
            reply: record.reply,
            blocked,
            response_time: record.response_time,
            persistence: Persistence::Pending,
        })
    }

    /// Rebuilds in-memory state from rows loaded out of durable storage.
    ///
    /// Restored queries are marked stored so they are never exported again.
    /// Returns the number of rows restored.
    ///
    /// # Errors
    ///
    /// Propagates table-growth errors from [`Tables::record`].
    pub fn restore<I>(&mut self, rows: I) -> Result<usize>
    where
        I: IntoIterator<Item = QueryRecord>,
    {
        let mut restored = 0;
        for row in rows {
            let id = self.record(&row)?;
            if let Some(q) = self.queries.get_mut(id) {
                q.persistence = Persistence::Stored;
            }
            restored += 1;
        }
        debug!(restored, "restored queries from durable storage");
        Ok(restored)
    }

    /// Moves newly completed queries into the durable-write queue.
    ///
    /// Runs in time proportional to the number of queries recorded since the
    /// previous call. Returns how many queries were queued.
    pub fn move_pending(&mut self) -> usize {
        let end = self.queries.len();
        let mut moved = 0;
        for index in self.move_cursor..end {
            let Some(id) = QueryId::from_index(index) else {
                break;
            };
            let Some(record) = self.pending_record(id) else {
                continue;
            };
            if let Some(q) = self.queries.get_mut(id) {
                q.persistence = Persistence::Queued;
            }
            self.write_queue.push(PendingQuery { id, record });
            moved += 1;
        }
        self.move_cursor = end;
        moved
    }

    /// Drains the durable-write queue.
    pub fn take_write_queue(&mut self) -> Vec<PendingQuery> {
        std::mem::take(&mut self.write_queue)
    }

    /// Puts a batch that failed to export back at the front of the queue.
    pub fn requeue(&mut self, mut batch: Vec<PendingQuery>) {
        batch.append(&mut self.write_queue);
        self.write_queue = batch;
    }

    /// Marks exported queries as stored. Ids that have since gone away are
    /// skipped.
    pub fn mark_stored(&mut self, ids: impl IntoIterator<Item = QueryId>) {
        for id in ids {
            if let Some(q) = self.queries.get_mut(id) {
                q.persistence = Persistence::Stored;
            }
        }
    }

    /// Slides the OverTime window (and every per-client array) up to `now`.
    ///
    /// Returns the number of slots the window moved.
    pub fn advance_over_time(&mut self, now: i64) -> usize {
        let shift = self.over_time.advance(now);
        if shift > 0 {
            for (_, client) in self.clients.iter_mut() {
                shift_counts(&mut client.over_time, shift);
            }
        }
        shift
    }

    /// Tombstones query payloads that fell out of the OverTime window.
    ///
    /// With `retain_unstored` set, a query is only dropped once it has been
    /// stored durably; the scan stops at the first query that has to stay so
    /// the pass stays proportional to what it removes. Returns the number of
    /// queries dropped.
    pub fn expire_queries(&mut self, retain_unstored: bool) -> usize {
        let cutoff = self.over_time.oldest_timestamp();
        let end = self.queries.len();
        let mut expired = 0;
        while self.expire_cursor < end {
            let Some(id) = QueryId::from_index(self.expire_cursor) else {
                break;
            };
            if let Some(q) = self.queries.get(id) {
                let unstored = q.persistence != Persistence::Stored;
                if q.timestamp >= cutoff || (retain_unstored && unstored) {
                    break;
                }
                self.queries.tombstone(id);
                expired += 1;
            }
            self.expire_cursor += 1;
        }
        if expired > 0 {
            debug!(expired, cutoff, "expired in-memory queries");
        }
        expired
    }

    /// Rebuilds alias-client aggregation from `defs`.
    ///
    /// Every physical client is first detached from its alias. Each alias
    /// client is then (re)created, its counters reset, and the counters of its
    /// members summed into it. Returns the number of clients attached to an
    /// alias.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::Full`](crate::error::TableError::Full) if a new
    /// alias client cannot be allocated.
    pub fn rebuild_alias_clients(&mut self, defs: &[AliasClientDef]) -> Result<usize> {
        let slots = self.over_time.len();
        for (_, client) in self.clients.iter_mut() {
            if client.is_alias {
                client.count = 0;
                client.blocked_count = 0;
                client.over_time.fill(0);
            } else {
                client.alias_id = None;
            }
        }

        let mut attached = 0;
        for def in defs {
            let address = def.address();
            let alias = match self.client_index.get(&address) {
                Some(id) => *id,
                None => {
                    let mut client = Client::new(address.clone(), None, slots);
                    client.is_alias = true;
                    let id = self.clients.allocate(client)?;
                    self.client_index.insert(address, id);
                    self.counters.clients = self.clients.len();
                    id
                }
            };

            let mut count = 0u32;
            let mut blocked = 0u32;
            let mut over_time = vec![0u32; slots];
            for member in &def.members {
                let Some(id) = self.client_index.get(member).copied() else {
                    continue;
                };
                let Some(client) = self.clients.get_mut(id) else {
                    continue;
                };
                if client.is_alias {
                    continue;
                }
                client.alias_id = Some(alias);
                count = count.saturating_add(client.count);
                blocked = blocked.saturating_add(client.blocked_count);
                for (sum, v) in over_time.iter_mut().zip(&client.over_time) {
                    *sum = sum.saturating_add(*v);
                }
                attached += 1;
            }

            if let Some(a) = self.clients.get_mut(alias) {
                a.name = Some(def.name.clone());
                a.count = count;
                a.blocked_count = blocked;
                a.over_time = over_time;
            }
        }
        debug!(aliases = defs.len(), attached, "rebuilt alias clients");
        Ok(attached)
    }

    /// Copies hardware addresses (and their vendors) from the neighbor cache
    /// onto known clients. Returns the number of clients updated.
    pub fn apply_neighbors(&mut self, entries: &[NeighborEntry], vendors: &dyn VendorLookup) -> usize {
        let mut updated = 0;
        for entry in entries {
            let Some(client) = self
                .client_index
                .get(&entry.ip)
                .copied()
                .and_then(|id| self.clients.get_mut(id))
            else {
                continue;
            };
            client.hwaddr = Some(entry.hwaddr.clone());
            client.vendor = vendors.vendor(&entry.hwaddr);
            updated += 1;
        }
        updated
    }

    fn apply_privacy<'a>(&self, record: &'a QueryRecord) -> (&'a str, &'a str, Option<&'a str>) {
        let domain = if self.privacy.hides_domains() {
            HIDDEN_DOMAIN
        } else {
            record.domain.as_str()
        };
        if self.privacy.hides_clients() {
            (domain, HIDDEN_CLIENT, None)
        } else {
            (domain, record.client_ip.as_str(), record.client_name.as_deref())
        }
    }

    fn intern_domain(&mut self, name: &str) -> Result<DomainId> {
        if let Some(id) = self.domain_index.get(name) {
            return Ok(*id);
        }
        let id = self.domains.allocate(Domain {
            name: name.to_string(),
            count: 0,
            blocked_count: 0,
        })?;
        self.domain_index.insert(name.to_string(), id);
        self.counters.domains = self.domains.len();
        Ok(id)
    }

    fn intern_client(&mut self, ip: &str, name: Option<&str>) -> Result<ClientId> {
        if let Some(id) = self.client_index.get(ip).copied() {
            if let (Some(client), Some(name)) = (self.clients.get_mut(id), name) {
                if client.name.as_deref() != Some(name) {
                    client.name = Some(name.to_string());
                }
            }
            return Ok(id);
        }
        let client = Client::new(ip.to_string(), name.map(str::to_string), self.over_time.len());
        let id = self.clients.allocate(client)?;
        self.client_index.insert(ip.to_string(), id);
        self.counters.clients = self.clients.len();
        Ok(id)
    }

    fn intern_upstream(&mut self, addr: &UpstreamAddr) -> Result<UpstreamId> {
        let key = (addr.ip.clone(), addr.port);
        if let Some(id) = self.upstream_index.get(&key) {
            return Ok(*id);
        }
        let id = self.upstreams.allocate(Upstream::new(addr))?;
        self.upstream_index.insert(key, id);
        self.counters.upstreams = self.upstreams.len();
        Ok(id)
    }

    /// Rebuilds the durable row for a pending query; `None` if the query is
    /// gone or was already handed to the queue.
    fn pending_record(&self, id: QueryId) -> Option<QueryRecord> {
        let q = self.queries.get(id)?;
        if q.persistence != Persistence::Pending {
            return None;
        }
        let domain = self.domains.get(q.domain)?;
        let client = self.clients.get(q.client)?;
        let upstream = q.upstream.and_then(|u| self.upstreams.get(u)).map(|u| UpstreamAddr {
            ip: u.ip.clone(),
            name: u.name.clone(),
            port: u.port,
        });
        Some(QueryRecord {
            timestamp: q.timestamp,
            domain: domain.name.clone(),
            client_ip: client.ip.clone(),
            client_name: client.name.clone(),
            upstream,
            query_type: q.query_type,
            status: q.status,
            reply: q.reply,
            response_time: q.response_time,
        })
    }
}

fn bump_client(client: &mut Client, slot: Option<usize>, blocked: bool) {
    client.count = client.count.saturating_add(1);
    if blocked {
        client.blocked_count = client.blocked_count.saturating_add(1);
    }
    if let Some(v) = slot.and_then(|s| client.over_time.get_mut(s)) {
        *v = v.saturating_add(1);
    }
}
