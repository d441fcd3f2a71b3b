//! `stats/*` endpoints.

use serde::Serialize;
use serde::ser::{SerializeMap, Serializer};

use super::{AuditList, DEFAULT_RECENT_BLOCKED, DEFAULT_TOP_COUNT, ReadApi, rank, requested_count};
use crate::model::{HIDDEN_CLIENT, HIDDEN_DOMAIN, QueryStatus, QueryType, ReplyType};

/// Name/count pairs serialized as a JSON object in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderedCounts(pub Vec<(&'static str, u64)>);

impl OrderedCounts {
    /// Returns the count stored under `name`.
    pub fn get(&self, name: &str) -> Option<u64> {
        self.0.iter().find(|(k, _)| *k == name).map(|(_, v)| *v)
    }
}

impl Serialize for OrderedCounts {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, count) in &self.0 {
            map.serialize_entry(name, count)?;
        }
        map.end()
    }
}

/// `stats/summary` response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    /// Query counters.
    pub queries: QueriesSummary,
    /// Client counters.
    pub clients: ClientsSummary,
    /// Blocklist counters.
    pub gravity: GravitySummary,
}

/// Query part of [`Summary`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueriesSummary {
    /// All queries.
    pub total: u64,
    /// Blocked queries.
    pub blocked: u64,
    /// `blocked / total` in percent; 0 without queries.
    pub percent_blocked: f64,
    /// Distinct domains.
    pub unique_domains: usize,
    /// Queries sent upstream.
    pub forwarded: u64,
    /// Queries answered from the cache.
    pub cached: u64,
    /// Per-type histogram.
    pub types: OrderedCounts,
    /// Per-status histogram.
    pub status: OrderedCounts,
    /// Per-reply histogram.
    pub replies: OrderedCounts,
}

/// Client part of [`Summary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientsSummary {
    /// Physical clients with queries inside the history window.
    pub active: usize,
    /// All known clients.
    pub total: usize,
}

/// Blocklist part of [`Summary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GravitySummary {
    /// Blocklist size.
    pub domains_being_blocked: u64,
}

/// `stats/top_domains` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopDomains {
    /// Ranked domains.
    pub domains: Vec<DomainEntry>,
    /// All queries.
    pub total_queries: u64,
    /// Blocked queries.
    pub blocked_queries: u64,
}

/// One ranked domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainEntry {
    /// Domain name.
    pub domain: String,
    /// Permitted or blocked answers, depending on the request.
    pub count: u64,
}

/// `stats/top_clients` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopClients {
    /// Ranked clients.
    pub clients: Vec<ClientEntry>,
    /// Blocked queries.
    pub blocked_queries: u64,
    /// All queries.
    pub total_queries: u64,
}

/// One ranked client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientEntry {
    /// Host name, if known.
    pub name: Option<String>,
    /// Address.
    pub ip: String,
    /// Total or blocked queries, depending on the request.
    pub count: u64,
}

/// `stats/upstreams` response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Upstreams {
    /// Pseudo-entries first, then upstreams ranked by count.
    pub upstreams: Vec<UpstreamEntry>,
    /// Queries sent upstream.
    pub forwarded_queries: u64,
    /// All queries.
    pub total_queries: u64,
}

/// One upstream destination.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpstreamEntry {
    /// Address, or `blocklist` / `cache` for the pseudo-entries.
    pub ip: String,
    /// Host name, if known.
    pub name: Option<String>,
    /// Port; `-1` for the pseudo-entries.
    pub port: i32,
    /// Queries answered by this destination.
    pub count: u64,
    /// Response-time statistics.
    pub statistics: UpstreamStatistics,
}

/// Response time of an upstream in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct UpstreamStatistics {
    /// Mean response time.
    pub response: f64,
    /// Uncertainty of the mean.
    pub variance: f64,
}

/// `stats/query_types` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryTypes {
    /// Count per query type, `OTHER` last.
    pub types: OrderedCounts,
}

/// `stats/recentblocked` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecentBlocked {
    /// Most recent first.
    pub blocked: Vec<String>,
}

impl ReadApi<'_> {
    /// Global counters, histograms and client activity.
    pub fn summary(&self) -> Summary {
        let counters = self.tables.counters();
        let total = counters.queries;
        let blocked = counters.blocked_count();
        #[allow(clippy::cast_precision_loss)] // display value
        let percent_blocked = if total == 0 {
            0.0
        } else {
            blocked as f64 * 100.0 / total as f64
        };

        let active = self
            .tables
            .clients()
            .iter()
            .filter(|(_, c)| !c.is_alias && c.over_time.iter().any(|v| *v > 0))
            .count();

        Summary {
            queries: QueriesSummary {
                total,
                blocked,
                percent_blocked,
                unique_domains: counters.domains,
                forwarded: counters.forwarded_count(),
                cached: counters.cached_count(),
                types: OrderedCounts(
                    QueryType::ALL
                        .iter()
                        .map(|t| (t.as_str(), counters.query_types[t.index()]))
                        .collect(),
                ),
                status: OrderedCounts(
                    QueryStatus::ALL
                        .iter()
                        .map(|s| (s.as_str(), counters.status[s.index()]))
                        .collect(),
                ),
                replies: OrderedCounts(
                    ReplyType::ALL
                        .iter()
                        .map(|r| (r.as_str(), counters.reply[r.index()]))
                        .collect(),
                ),
            },
            clients: ClientsSummary {
                active,
                total: counters.clients,
            },
            gravity: GravitySummary {
                domains_being_blocked: counters.gravity,
            },
        }
    }

    /// Most queried domains.
    ///
    /// Ranks by blocked answers when `blocked` is set, permitted answers
    /// otherwise. Outside audit mode the domain exclude list applies; in audit
    /// mode domains on `audited` are skipped instead.
    pub fn top_domains(
        &self,
        blocked: bool,
        count: Option<i64>,
        audit: bool,
        audited: &dyn AuditList,
    ) -> TopDomains {
        let counters = self.tables.counters();
        let mut response = TopDomains {
            domains: Vec::new(),
            total_queries: counters.queries,
            blocked_queries: counters.blocked_count(),
        };
        if self.config.privacy_level.hides_domains() {
            return response;
        }
        let count = requested_count(count, DEFAULT_TOP_COUNT);

        let domains = self.tables.domains();
        let ranked = rank(domains.iter().map(|(id, d)| {
            let n = if blocked { d.blocked_count } else { d.count };
            (id, u64::from(n))
        }));
        for (id, n) in ranked {
            if response.domains.len() >= count || n == 0 {
                break;
            }
            let Some(domain) = domains.get(id) else {
                continue;
            };
            if !audit && self.config.excludes_domain(&domain.name) {
                continue;
            }
            if audit && audited.is_audited(&domain.name) {
                continue;
            }
            if domain.name == HIDDEN_DOMAIN {
                continue;
            }
            response.domains.push(DomainEntry {
                domain: domain.name.clone(),
                count: n,
            });
        }
        response
    }

    /// Most active clients.
    ///
    /// Ranks by blocked queries when `blocked` is set, total queries
    /// otherwise. Excluded clients, the hidden placeholder client and clients
    /// represented by an alias client are skipped.
    pub fn top_clients(&self, blocked: bool, count: Option<i64>) -> TopClients {
        let counters = self.tables.counters();
        let mut response = TopClients {
            clients: Vec::new(),
            blocked_queries: counters.blocked_count(),
            total_queries: counters.queries,
        };
        if self.config.privacy_level.hides_clients() {
            return response;
        }
        let count = requested_count(count, DEFAULT_TOP_COUNT);

        let clients = self.tables.clients();
        let ranked = rank(clients.iter().map(|(id, c)| {
            let n = if blocked { c.blocked_count } else { c.count };
            (id, u64::from(n))
        }));
        for (id, n) in ranked {
            if response.clients.len() >= count || n == 0 {
                break;
            }
            let Some(client) = clients.get(id) else {
                continue;
            };
            if client.is_alias_managed()
                || client.ip == HIDDEN_CLIENT
                || self.config.excludes_client(&client.ip, client.name.as_deref())
            {
                continue;
            }
            response.clients.push(ClientEntry {
                name: client.name.clone(),
                ip: client.ip.clone(),
                count: n,
            });
        }
        response
    }

    /// Upstream destinations with response-time statistics.
    ///
    /// The `blocklist` and `cache` pseudo-entries always come first, even at
    /// zero; real upstreams follow ranked by count and only if they were used.
    pub fn upstreams(&self) -> Upstreams {
        let counters = self.tables.counters();
        let pseudo = |name: &str, count: u64| UpstreamEntry {
            ip: name.to_string(),
            name: Some(name.to_string()),
            port: -1,
            count,
            statistics: UpstreamStatistics::default(),
        };
        let mut upstreams = vec![
            pseudo("blocklist", counters.blocked_count()),
            pseudo("cache", counters.cached_count()),
        ];

        let table = self.tables.upstreams();
        let ranked = rank(table.iter().map(|(id, u)| (id, u64::from(u.count))));
        for (id, n) in ranked {
            if n == 0 {
                break;
            }
            let Some(upstream) = table.get(id) else {
                continue;
            };
            upstreams.push(UpstreamEntry {
                ip: upstream.ip.clone(),
                name: upstream.name.clone(),
                port: i32::from(upstream.port),
                count: n,
                statistics: UpstreamStatistics {
                    response: upstream.mean_response(),
                    variance: upstream.uncertainty().unwrap_or(0.0),
                },
            });
        }

        Upstreams {
            upstreams,
            forwarded_queries: counters.forwarded_count(),
            total_queries: counters.queries,
        }
    }

    /// Query-type histogram with `OTHER` moved to the end.
    pub fn query_types(&self) -> QueryTypes {
        let counters = self.tables.counters();
        let mut types: Vec<(&'static str, u64)> = QueryType::ALL
            .iter()
            .filter(|t| **t != QueryType::Other)
            .map(|t| (t.as_str(), counters.query_types[t.index()]))
            .collect();
        types.push((
            QueryType::Other.as_str(),
            counters.query_types[QueryType::Other.index()],
        ));
        QueryTypes {
            types: OrderedCounts(types),
        }
    }

    /// Domains of the most recently blocked queries, newest first.
    ///
    /// Queries whose domain was hidden at ingest are skipped without counting
    /// towards `count`.
    pub fn recent_blocked(&self, count: Option<i64>) -> RecentBlocked {
        let mut blocked = Vec::new();
        if self.config.privacy_level.hides_domains() {
            return RecentBlocked { blocked };
        }
        let count = requested_count(count, DEFAULT_RECENT_BLOCKED);
        let domains = self.tables.domains();
        for (_, query) in self.tables.queries().iter().rev() {
            if blocked.len() >= count {
                break;
            }
            if !query.blocked {
                continue;
            }
            let Some(domain) = domains.get(query.domain) else {
                continue;
            };
            if domain.name == HIDDEN_DOMAIN {
                continue;
            }
            blocked.push(domain.name.clone());
        }
        RecentBlocked { blocked }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::config::{PrivacyLevel, TelemetryConfig};
    use crate::model::{QueryRecord, UpstreamAddr};
    use crate::tables::Tables;

    const NOW: i64 = 1_700_000_000;

    fn query(domain: &str, client: &str, status: QueryStatus) -> QueryRecord {
        QueryRecord {
            timestamp: NOW,
            domain: domain.to_string(),
            client_ip: client.to_string(),
            client_name: None,
            upstream: None,
            query_type: QueryType::A,
            status,
            reply: ReplyType::Ip,
            response_time: None,
        }
    }

    fn upstream(ip: &str) -> Option<UpstreamAddr> {
        Some(UpstreamAddr {
            ip: ip.to_string(),
            name: None,
            port: 53,
        })
    }

    fn tables(config: &TelemetryConfig) -> Tables {
        let mut tables = Tables::new(config, NOW);
        for _ in 0..3 {
            tables
                .record(&query("ads.example", "10.0.0.2", QueryStatus::Gravity))
                .unwrap();
        }
        for _ in 0..2 {
            tables
                .record(&QueryRecord {
                    upstream: upstream("9.9.9.9"),
                    response_time: Some(0.02),
                    ..query("news.example", "10.0.0.1", QueryStatus::Forwarded)
                })
                .unwrap();
        }
        tables
            .record(&query("news.example", "10.0.0.1", QueryStatus::Cache))
            .unwrap();
        tables
            .record(&QueryRecord {
                upstream: upstream("1.1.1.1"),
                query_type: QueryType::Aaaa,
                ..query("mail.example", "10.0.0.3", QueryStatus::Forwarded)
            })
            .unwrap();
        tables
    }

    #[test]
    fn test_ordered_counts_keep_order() {
        let counts = OrderedCounts(vec![("B", 2), ("A", 1)]);
        assert_eq!(serde_json::to_string(&counts).unwrap(), r#"{"B":2,"A":1}"#);
        assert_eq!(counts.get("A"), Some(1));
        assert_eq!(counts.get("C"), None);
    }

    #[test]
    fn test_summary_counts() {
        let config = TelemetryConfig::default();
        let tables = tables(&config);
        let summary = ReadApi::new(&tables, &config, NOW).summary();

        assert_eq!(summary.queries.total, 7);
        assert_eq!(summary.queries.blocked, 3);
        assert_eq!(summary.queries.forwarded, 3);
        assert_eq!(summary.queries.cached, 1);
        assert_eq!(summary.queries.unique_domains, 3);
        assert_eq!(summary.queries.types.get("AAAA"), Some(1));
        assert_eq!(summary.queries.status.get("GRAVITY"), Some(3));
        assert_eq!(summary.clients.total, 3);
        assert_eq!(summary.clients.active, 3);
        assert!((summary.queries.percent_blocked - 300.0 / 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_top_domains_ranked_and_excluded() {
        let mut config = TelemetryConfig::default();
        let tables = tables(&config);
        let api = ReadApi::new(&tables, &config, NOW);
        let none = HashSet::<String>::new();

        let permitted = api.top_domains(false, None, false, &none);
        let names: Vec<&str> = permitted.domains.iter().map(|d| d.domain.as_str()).collect();
        assert_eq!(names, vec!["news.example", "mail.example"]);
        assert_eq!(permitted.domains[0].count, 3);

        let blocked = api.top_domains(true, None, false, &none);
        assert_eq!(blocked.domains.len(), 1);
        assert_eq!(blocked.domains[0].domain, "ads.example");

        config.exclude_domains = vec!["news.example".to_string()];
        let api = ReadApi::new(&tables, &config, NOW);
        let filtered = api.top_domains(false, Some(5), false, &none);
        assert_eq!(filtered.domains.len(), 1);

        // Audit mode ignores the exclude list and skips audited domains.
        let audited: HashSet<String> = ["mail.example".to_string()].into_iter().collect();
        let audit = api.top_domains(false, None, true, &audited);
        assert_eq!(audit.domains.len(), 1);
        assert_eq!(audit.domains[0].domain, "news.example");
    }

    #[test]
    fn test_top_lists_empty_under_privacy() {
        let config = TelemetryConfig::default();
        let tables = tables(&config);
        let private = TelemetryConfig {
            privacy_level: PrivacyLevel::HideDomainsClients,
            ..TelemetryConfig::default()
        };
        let api = ReadApi::new(&tables, &private, NOW);

        let domains = api.top_domains(false, None, false, &HashSet::<String>::new());
        assert!(domains.domains.is_empty());
        assert_eq!(domains.total_queries, 7);
        assert!(api.top_clients(false, None).clients.is_empty());
        assert!(api.recent_blocked(None).blocked.is_empty());
    }

    #[test]
    fn test_top_clients_count_limit() {
        let config = TelemetryConfig::default();
        let tables = tables(&config);
        let api = ReadApi::new(&tables, &config, NOW);

        let top = api.top_clients(false, Some(2));
        let ips: Vec<&str> = top.clients.iter().map(|c| c.ip.as_str()).collect();
        assert_eq!(ips, vec!["10.0.0.2", "10.0.0.1"]);

        let blocked = api.top_clients(true, None);
        assert_eq!(blocked.clients.len(), 1);
        assert_eq!(blocked.clients[0].count, 3);
    }

    #[test]
    fn test_upstreams_pseudo_entries_first() {
        let config = TelemetryConfig::default();
        let tables = tables(&config);
        let response = ReadApi::new(&tables, &config, NOW).upstreams();

        let ips: Vec<&str> = response.upstreams.iter().map(|u| u.ip.as_str()).collect();
        assert_eq!(ips, vec!["blocklist", "cache", "9.9.9.9", "1.1.1.1"]);
        assert_eq!(response.upstreams[0].port, -1);
        assert_eq!(response.upstreams[0].count, 3);
        assert_eq!(response.upstreams[1].count, 1);
        assert!((response.upstreams[2].statistics.response - 0.02).abs() < 1e-9);
        assert_eq!(response.upstreams[3].statistics.variance, 0.0);
        assert_eq!(response.forwarded_queries, 3);
    }

    #[test]
    fn test_query_types_other_last() {
        let config = TelemetryConfig::default();
        let tables = tables(&config);
        let types = ReadApi::new(&tables, &config, NOW).query_types().types;
        assert_eq!(types.0.len(), QueryType::COUNT);
        assert_eq!(types.0.last().map(|(k, _)| *k), Some("OTHER"));
        assert_eq!(types.get("A"), Some(6));
    }

    #[test]
    fn test_recent_blocked_newest_first() {
        let config = TelemetryConfig::default();
        let mut tables = tables(&config);
        tables
            .record(&query("tracker.example", "10.0.0.1", QueryStatus::Regex))
            .unwrap();
        let api = ReadApi::new(&tables, &config, NOW);

        assert_eq!(api.recent_blocked(None).blocked, vec!["tracker.example"]);
        assert_eq!(
            api.recent_blocked(Some(2)).blocked,
            vec!["tracker.example", "ads.example"]
        );
    }
}
