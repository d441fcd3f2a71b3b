//! Read API: aggregation over a lock-held snapshot of the tables.
//!
//! Every routine here is a pure function of `(&Tables, &TelemetryConfig, now)`
//! and never mutates the tables. Callers take the store lock for the duration
//! of one call, which gives each response a point-in-time consistent view:
//!
//! ```rust
//! use sinkhole::api::ReadApi;
//! use sinkhole::config::TelemetryConfig;
//! use sinkhole::lock::StoreLock;
//! use sinkhole::tables::Tables;
//!
//! let config = TelemetryConfig::default();
//! let now = 1_700_000_000;
//! let store = StoreLock::new(Tables::new(&config, now));
//!
//! let summary = store.read(|tables| ReadApi::new(tables, &config, now).summary());
//! assert_eq!(summary.queries.total, 0);
//! assert_eq!(summary.queries.percent_blocked, 0.0);
//! ```
//!
//! Nothing here returns an error. Suppressed data (privacy level), malformed
//! parameters (non-positive counts) and stale indices all degrade to an empty
//! or defaulted but well-formed response.
//!
//! # Ranking
//!
//! Top lists rank by count, descending. Ties keep table order (lower index
//! first), because the sort is stable over entities collected in index order.

mod history;
mod stats;

pub use history::{ClientHistory, ClientHistorySlot, DEFAULT_MAX_CLIENTS, History, HistoryClient};
pub use stats::{
    ClientEntry, ClientsSummary, DomainEntry, GravitySummary, OrderedCounts, QueriesSummary,
    QueryTypes, RecentBlocked, Summary, TopClients, TopDomains, UpstreamEntry, UpstreamStatistics,
    Upstreams,
};

use std::collections::{BTreeSet, HashSet};

use crate::config::TelemetryConfig;
use crate::tables::Tables;

/// Default length of the top-domain and top-client lists.
pub const DEFAULT_TOP_COUNT: usize = 10;

/// Default length of the recently-blocked list.
pub const DEFAULT_RECENT_BLOCKED: usize = 1;

/// Domains that have already been reviewed and are skipped in audit mode.
pub trait AuditList {
    /// Returns true if `domain` has been audited.
    fn is_audited(&self, domain: &str) -> bool;
}

impl AuditList for HashSet<String> {
    fn is_audited(&self, domain: &str) -> bool {
        self.contains(domain)
    }
}

impl AuditList for BTreeSet<String> {
    fn is_audited(&self, domain: &str) -> bool {
        self.contains(domain)
    }
}

/// One read endpoint with its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `history`
    History,
    /// `history/clients`
    HistoryClients {
        /// Keep only this many of the most active clients; [`DEFAULT_MAX_CLIENTS`]
        /// when `None`.
        max_clients: Option<usize>,
    },
    /// `stats/summary`
    Summary,
    /// `stats/top_domains`
    TopDomains {
        /// Rank by blocked instead of permitted answers.
        blocked: bool,
        /// Requested list length.
        count: Option<i64>,
        /// Skip audited domains instead of excluded ones.
        audit: bool,
    },
    /// `stats/top_clients`
    TopClients {
        /// Rank by blocked instead of total queries.
        blocked: bool,
        /// Requested list length.
        count: Option<i64>,
    },
    /// `stats/upstreams`
    Upstreams,
    /// `stats/query_types`
    QueryTypes,
    /// `stats/recentblocked`
    RecentBlocked {
        /// Requested list length.
        count: Option<i64>,
    },
}

/// Aggregation routines over one snapshot.
#[derive(Debug, Clone, Copy)]
pub struct ReadApi<'a> {
    tables: &'a Tables,
    config: &'a TelemetryConfig,
    now: i64,
}

impl<'a> ReadApi<'a> {
    /// Creates a reader over `tables` as of `now`.
    pub fn new(tables: &'a Tables, config: &'a TelemetryConfig, now: i64) -> Self {
        Self { tables, config, now }
    }

    /// Renders `endpoint` as its JSON response.
    ///
    /// Audit mode for top domains uses an empty audit list; call
    /// [`ReadApi::top_domains`] directly to supply one.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] only if a response fails to serialize,
    /// which the response types are built not to do.
    pub fn render(&self, endpoint: &Endpoint) -> serde_json::Result<serde_json::Value> {
        match endpoint {
            Endpoint::History => serde_json::to_value(self.history()),
            Endpoint::HistoryClients { max_clients } => {
                serde_json::to_value(self.history_clients(*max_clients))
            }
            Endpoint::Summary => serde_json::to_value(self.summary()),
            Endpoint::TopDomains {
                blocked,
                count,
                audit,
            } => {
                let audited = HashSet::<String>::new();
                serde_json::to_value(self.top_domains(*blocked, *count, *audit, &audited))
            }
            Endpoint::TopClients { blocked, count } => {
                serde_json::to_value(self.top_clients(*blocked, *count))
            }
            Endpoint::Upstreams => serde_json::to_value(self.upstreams()),
            Endpoint::QueryTypes => serde_json::to_value(self.query_types()),
            Endpoint::RecentBlocked { count } => serde_json::to_value(self.recent_blocked(*count)),
        }
    }
}

/// Maps a requested list length onto a usable one.
fn requested_count(count: Option<i64>, default: usize) -> usize {
    match count {
        Some(n) if n > 0 => usize::try_from(n).unwrap_or(usize::MAX),
        _ => default,
    }
}

/// Sorts `(id, count)` pairs by count, descending; ties keep input order.
fn rank<I>(items: impl Iterator<Item = (I, u64)>) -> Vec<(I, u64)> {
    let mut ranked: Vec<(I, u64)> = items.collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requested_count_defaults() {
        assert_eq!(requested_count(None, 10), 10);
        assert_eq!(requested_count(Some(0), 10), 10);
        assert_eq!(requested_count(Some(-3), 1), 1);
        assert_eq!(requested_count(Some(5), 10), 5);
    }

    #[test]
    fn test_rank_is_stable() {
        let ranked = rank(vec![(0, 3), (1, 5), (2, 3), (3, 5)].into_iter());
        assert_eq!(ranked, vec![(1, 5), (3, 5), (0, 3), (2, 3)]);
    }

    #[test]
    fn test_audit_list_impls() {
        let hashed: HashSet<String> = ["a.example".to_string()].into_iter().collect();
        let ordered: BTreeSet<String> = ["b.example".to_string()].into_iter().collect();
        assert!(hashed.is_audited("a.example"));
        assert!(!hashed.is_audited("b.example"));
        assert!(ordered.is_audited("b.example"));
    }
}
