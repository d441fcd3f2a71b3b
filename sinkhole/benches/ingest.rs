//! Microbenchmarks for ingest and top-K ranking.
//!
//! Run with: `cargo bench -p sinkhole -- ingest`

#![allow(missing_docs, clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use std::collections::HashSet;

use criterion::{BatchSize, BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use sinkhole::api::ReadApi;
use sinkhole::config::TelemetryConfig;
use sinkhole::model::{QueryRecord, QueryStatus, QueryType, ReplyType, UpstreamAddr};
use sinkhole::tables::Tables;

const NOW: i64 = 1_700_000_000;

/// A realistic mix: mostly forwarded and cached, one in five blocked.
fn records(count: usize, domains: usize, clients: usize) -> Vec<QueryRecord> {
    (0..count)
        .map(|i| {
            let status = match i % 5 {
                0 => QueryStatus::Gravity,
                1 | 2 => QueryStatus::Cache,
                _ => QueryStatus::Forwarded,
            };
            QueryRecord {
                timestamp: NOW - (count - i) as i64,
                domain: format!("host{}.example", (i * 7919) % domains),
                client_ip: format!("10.0.{}.{}", (i % clients) / 256, (i % clients) % 256),
                client_name: None,
                upstream: status.is_forwarded().then(|| UpstreamAddr {
                    ip: "9.9.9.9".to_string(),
                    name: None,
                    port: 53,
                }),
                query_type: if i % 3 == 0 { QueryType::Aaaa } else { QueryType::A },
                status,
                reply: ReplyType::Ip,
                response_time: status.is_forwarded().then_some(0.012),
            }
        })
        .collect()
}

fn bench_record(c: &mut Criterion) {
    let config = TelemetryConfig::default();
    let batch = records(1_000, 200, 20);

    c.bench_function("ingest/record_1000", |b| {
        b.iter_batched_ref(
            || Tables::new(&config, NOW),
            |tables| {
                for record in &batch {
                    tables.record(black_box(record)).unwrap();
                }
            },
            BatchSize::LargeInput,
        );
    });
}

fn bench_record_and_move(c: &mut Criterion) {
    let config = TelemetryConfig::default();
    let batch = records(1_000, 200, 20);

    c.bench_function("ingest/record_and_move_1000", |b| {
        b.iter_batched_ref(
            || Tables::new(&config, NOW),
            |tables| {
                for record in &batch {
                    tables.record(black_box(record)).unwrap();
                }
                black_box(tables.move_pending());
                black_box(tables.take_write_queue());
            },
            BatchSize::LargeInput,
        );
    });
}

fn bench_top_domains(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest/top_domains");
    let config = TelemetryConfig::default();
    let audited = HashSet::<String>::new();

    for domains in [100, 1_000, 10_000] {
        let mut tables = Tables::new(&config, NOW);
        for record in &records(50_000, domains, 50) {
            tables.record(record).unwrap();
        }

        group.bench_with_input(BenchmarkId::from_parameter(domains), &domains, |b, _| {
            b.iter(|| {
                let api = ReadApi::new(&tables, &config, NOW);
                black_box(api.top_domains(false, Some(10), false, &audited))
            });
        });
    }

    group.finish();
}

fn bench_summary(c: &mut Criterion) {
    let config = TelemetryConfig::default();
    let mut tables = Tables::new(&config, NOW);
    for record in &records(50_000, 1_000, 250) {
        tables.record(record).unwrap();
    }

    c.bench_function("ingest/summary", |b| {
        b.iter(|| black_box(ReadApi::new(&tables, &config, NOW).summary()));
    });
}

criterion_group!(
    benches,
    bench_record,
    bench_record_and_move,
    bench_top_domains,
    bench_summary,
);
criterion_main!(benches);
