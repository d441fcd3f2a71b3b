//! Integration tests for the read API over a populated store.
//!
//! Each test ingests a known query mix through the store lock and checks
//! the rendered responses the way a dashboard would consume them.

use std::collections::HashSet;

use serde_json::json;
use sinkhole::api::{DEFAULT_MAX_CLIENTS, Endpoint, ReadApi};
use sinkhole::config::{PrivacyLevel, TelemetryConfig};
use sinkhole::lock::StoreLock;
use sinkhole::model::{AliasClientDef, QueryRecord, QueryStatus, QueryType, ReplyType, UpstreamAddr};
use sinkhole::tables::Tables;

const NOW: i64 = 1_700_000_000;

fn query(timestamp: i64, domain: &str, client: &str, status: QueryStatus) -> QueryRecord {
    QueryRecord {
        timestamp,
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

fn store(config: &TelemetryConfig) -> StoreLock {
    StoreLock::new(Tables::new(config, NOW))
}

fn ingest(store: &StoreLock, records: &[QueryRecord]) {
    store.with(|tables| {
        for record in records {
            tables.record(record).unwrap();
        }
    });
}

#[test]
fn test_summary_percent_blocked() {
    let config = TelemetryConfig::default();
    let store = store(&config);

    let mut records = Vec::new();
    for i in 0..200 {
        let status = if i % 4 == 0 {
            QueryStatus::Gravity
        } else {
            QueryStatus::Cache
        };
        records.push(query(NOW - i, &format!("d{}.example", i % 20), "10.0.0.1", status));
    }
    ingest(&store, &records);

    let value = store
        .read(|tables| ReadApi::new(tables, &config, NOW).render(&Endpoint::Summary))
        .unwrap();
    assert_eq!(value["queries"]["total"], json!(200));
    assert_eq!(value["queries"]["blocked"], json!(50));
    assert_eq!(value["queries"]["percent_blocked"], json!(25.0));
    assert_eq!(value["queries"]["cached"], json!(150));
    assert_eq!(value["queries"]["unique_domains"], json!(20));
    assert_eq!(value["queries"]["types"]["A"], json!(200));
    assert_eq!(value["queries"]["status"]["GRAVITY"], json!(50));
    assert_eq!(value["clients"]["active"], json!(1));
    assert_eq!(value["gravity"]["domains_being_blocked"], json!(0));
}

#[test]
fn test_summary_empty_store() {
    let config = TelemetryConfig::default();
    let store = store(&config);
    let summary = store.read(|tables| ReadApi::new(tables, &config, NOW).summary());
    assert_eq!(summary.queries.total, 0);
    assert_eq!(summary.queries.percent_blocked, 0.0);
    assert_eq!(summary.clients.active, 0);
}

#[test]
fn test_top_domains_limit_and_order() {
    let config = TelemetryConfig::default();
    let store = store(&config);

    // domain k gets k+1 permitted queries.
    let mut records = Vec::new();
    for k in 0..8 {
        for _ in 0..=k {
            records.push(query(NOW, &format!("site{k}.example"), "10.0.0.1", QueryStatus::Forwarded));
        }
    }
    ingest(&store, &records);

    let top = store.read(|tables| {
        ReadApi::new(tables, &config, NOW).top_domains(false, Some(5), false, &HashSet::<String>::new())
    });
    let counts: Vec<u64> = top.domains.iter().map(|d| d.count).collect();
    assert_eq!(counts, vec![8, 7, 6, 5, 4]);
    assert_eq!(top.domains[0].domain, "site7.example");
    assert_eq!(top.total_queries, 36);
    assert_eq!(top.blocked_queries, 0);
}

#[test]
fn test_upstreams_pseudo_entries() {
    let config = TelemetryConfig::default();
    let store = store(&config);

    let forwarded = |seconds: f64| QueryRecord {
        upstream: Some(UpstreamAddr {
            ip: "9.9.9.9".to_string(),
            name: Some("dns.quad9.net".to_string()),
            port: 53,
        }),
        response_time: Some(seconds),
        ..query(NOW, "example.org", "10.0.0.1", QueryStatus::Forwarded)
    };
    ingest(
        &store,
        &[
            forwarded(0.010),
            forwarded(0.030),
            query(NOW, "ads.example", "10.0.0.1", QueryStatus::Regex),
            query(NOW, "example.org", "10.0.0.1", QueryStatus::Cache),
            query(NOW, "example.org", "10.0.0.1", QueryStatus::CacheStale),
        ],
    );

    let value = store
        .read(|tables| ReadApi::new(tables, &config, NOW).render(&Endpoint::Upstreams))
        .unwrap();
    let upstreams = value["upstreams"].as_array().unwrap();
    assert_eq!(upstreams.len(), 3);
    assert_eq!(upstreams[0]["ip"], json!("blocklist"));
    assert_eq!(upstreams[0]["port"], json!(-1));
    assert_eq!(upstreams[0]["count"], json!(1));
    assert_eq!(upstreams[1]["ip"], json!("cache"));
    assert_eq!(upstreams[1]["count"], json!(2));
    assert_eq!(upstreams[2]["name"], json!("dns.quad9.net"));
    assert_eq!(upstreams[2]["port"], json!(53));

    let response = upstreams[2]["statistics"]["response"].as_f64().unwrap();
    let variance = upstreams[2]["statistics"]["variance"].as_f64().unwrap();
    assert!((response - 0.020).abs() < 1e-9);
    assert!(variance > 0.0);
    assert_eq!(value["forwarded_queries"], json!(2));
    assert_eq!(value["total_queries"], json!(5));
}

#[test]
fn test_alias_members_never_listed_directly() {
    let config = TelemetryConfig::default();
    let store = store(&config);
    ingest(
        &store,
        &[
            query(NOW, "a.example", "10.0.0.5", QueryStatus::Forwarded),
            query(NOW, "a.example", "10.0.0.5", QueryStatus::Forwarded),
            query(NOW, "b.example", "10.0.0.6", QueryStatus::Gravity),
            query(NOW, "c.example", "10.0.0.7", QueryStatus::Forwarded),
        ],
    );
    store
        .with(|tables| {
            tables.rebuild_alias_clients(&[AliasClientDef {
                id: 1,
                name: "laptop".to_string(),
                members: vec!["10.0.0.5".to_string(), "10.0.0.6".to_string()],
            }])
        })
        .unwrap();
    // A new query from a member counts towards the alias too.
    ingest(&store, &[query(NOW, "d.example", "10.0.0.6", QueryStatus::Forwarded)]);

    let (top, history) = store.read(|tables| {
        let api = ReadApi::new(tables, &config, NOW);
        (api.top_clients(false, None), api.history_clients(None))
    });

    let ips: Vec<&str> = top.clients.iter().map(|c| c.ip.as_str()).collect();
    assert_eq!(ips, vec!["aliasclient-1", "10.0.0.7"]);
    assert_eq!(top.clients[0].name.as_deref(), Some("laptop"));
    assert_eq!(top.clients[0].count, 4);

    let columns: Vec<&str> = history.clients.iter().map(|c| c.ip.as_str()).collect();
    assert!(!columns.contains(&"10.0.0.5"));
    assert!(!columns.contains(&"10.0.0.6"));
    assert!(columns.contains(&"aliasclient-1"));
    let alias_column = columns.iter().position(|ip| *ip == "aliasclient-1").unwrap();
    let last = history.history.last().unwrap();
    assert_eq!(last.data[alias_column], 4);
}

#[test]
fn test_history_clients_default_limit() {
    let config = TelemetryConfig::default();
    let store = store(&config);

    // client k sends k+1 queries.
    let mut records = Vec::new();
    for k in 0..25 {
        for _ in 0..=k {
            records.push(query(NOW - 60, "a.example", &format!("10.0.1.{k}"), QueryStatus::Forwarded));
        }
    }
    ingest(&store, &records);

    let (default, all) = store.read(|tables| {
        let api = ReadApi::new(tables, &config, NOW);
        (api.history_clients(None), api.history_clients(Some(25)))
    });
    assert_eq!(default.clients.len(), DEFAULT_MAX_CLIENTS);
    assert!(default.clients.iter().all(|c| c.total > 5));
    assert_eq!(default.clients[0].ip, "10.0.1.5");
    assert!(default.history.iter().all(|slot| slot.data.len() == DEFAULT_MAX_CLIENTS));
    assert_eq!(all.clients.len(), 25);
}

#[test]
fn test_history_buckets() {
    let config = TelemetryConfig {
        overtime_slots: 6,
        overtime_interval: 600,
        ..TelemetryConfig::default()
    };
    let store = store(&config);
    ingest(
        &store,
        &[
            query(NOW - 1200, "a.example", "10.0.0.1", QueryStatus::Forwarded),
            query(NOW, "a.example", "10.0.0.1", QueryStatus::Cache),
            query(NOW, "b.example", "10.0.0.1", QueryStatus::Gravity),
        ],
    );

    let history = store.read(|tables| ReadApi::new(tables, &config, NOW).history());
    let totals: Vec<u32> = history.history.iter().map(|b| b.total).collect();
    assert_eq!(totals, vec![1, 0, 2]);
    let newest = history.history.last().unwrap();
    assert_eq!(newest.cached, 1);
    assert_eq!(newest.blocked, 1);
    assert!(newest.timestamp <= NOW && NOW < newest.timestamp + 600);
}

#[test]
fn test_history_empty_without_queries() {
    let config = TelemetryConfig::default();
    let store = store(&config);
    let value = store
        .read(|tables| ReadApi::new(tables, &config, NOW).render(&Endpoint::History))
        .unwrap();
    assert_eq!(value, json!({ "history": [] }));
}

#[test]
fn test_privacy_keeps_response_shape() {
    let config = TelemetryConfig {
        privacy_level: PrivacyLevel::HideDomainsClients,
        ..TelemetryConfig::default()
    };
    let store = store(&config);
    ingest(&store, &[query(NOW, "ads.example", "10.0.0.1", QueryStatus::Gravity)]);

    let render = |endpoint: Endpoint| {
        store
            .read(|tables| ReadApi::new(tables, &config, NOW).render(&endpoint))
            .unwrap()
    };

    let domains = render(Endpoint::TopDomains {
        blocked: true,
        count: None,
        audit: false,
    });
    assert_eq!(domains["domains"], json!([]));
    assert_eq!(domains["blocked_queries"], json!(1));

    let clients = render(Endpoint::HistoryClients { max_clients: None });
    assert_eq!(clients, json!({ "history": [], "clients": [] }));

    // Plain history is still available.
    let history = render(Endpoint::History);
    assert_eq!(history["history"].as_array().map(Vec::len), Some(1));
}

#[test]
fn test_excluded_clients_and_recent_blocked() {
    let config = TelemetryConfig {
        exclude_clients: vec!["router.lan".to_string()],
        ..TelemetryConfig::default()
    };
    let store = store(&config);
    ingest(
        &store,
        &[
            QueryRecord {
                client_name: Some("router.lan".to_string()),
                ..query(NOW - 5, "first.example", "10.0.0.1", QueryStatus::Denylist)
            },
            query(NOW - 3, "second.example", "10.0.0.2", QueryStatus::Gravity),
            query(NOW - 1, "ok.example", "10.0.0.2", QueryStatus::Forwarded),
        ],
    );

    let value = store
        .read(|tables| {
            ReadApi::new(tables, &config, NOW).render(&Endpoint::TopClients {
                blocked: false,
                count: Some(10),
            })
        })
        .unwrap();
    assert_eq!(value["clients"], json!([{ "name": null, "ip": "10.0.0.2", "count": 2 }]));

    let recent = store.read(|tables| ReadApi::new(tables, &config, NOW).recent_blocked(Some(5)));
    assert_eq!(recent.blocked, vec!["second.example", "first.example"]);
}
