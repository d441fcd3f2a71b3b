//! CLI for the sinkhole DNS telemetry core.
//!
//! Provides commands for inspecting a query database, running retention,
//! replaying recorded query events and rendering read-API responses.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand, ValueEnum};
use sinkhole::api::{Endpoint, ReadApi};
use sinkhole::config::TelemetryConfig;
use sinkhole::events::Event;
use sinkhole::lock::StoreLock;
use sinkhole::model::QueryRecord;
use sinkhole::storage::{Storage, SqliteStorage, apply_retention};
use sinkhole::tables::Tables;
use sinkhole::worker::PersistenceWorker;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How long `replay` waits for the worker to flush the write queue.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// sinkhole: DNS query telemetry CLI.
#[derive(Parser)]
#[command(name = "sinkhole", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Display row count, size and time range of a query database.
    Info {
        /// Path to the SQLite database.
        db: PathBuf,
    },

    /// Run a single bounded retention pass.
    Retain {
        /// Path to the SQLite database.
        db: PathBuf,

        /// Delete rows older than this many days.
        #[arg(long)]
        max_days: i32,
    },

    /// Record query events from a JSON-lines file and flush them to the database.
    Replay {
        /// Path to the SQLite database.
        db: PathBuf,

        /// File with one query record per line.
        events: PathBuf,

        /// JSON configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Render a read-API response from the database contents.
    Stats {
        /// Path to the SQLite database.
        db: PathBuf,

        /// Response to render.
        endpoint: EndpointArg,

        /// Requested list length.
        #[arg(long)]
        count: Option<i64>,

        /// Rank by blocked instead of permitted queries.
        #[arg(long)]
        blocked: bool,

        /// Audit mode for top domains.
        #[arg(long)]
        audit: bool,

        /// Evaluate history as of this Unix timestamp instead of now.
        #[arg(long)]
        now: Option<i64>,

        /// JSON configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// Read-API endpoints.
#[derive(Clone, Copy, ValueEnum)]
enum EndpointArg {
    /// `history`
    History,
    /// `history/clients`
    HistoryClients,
    /// `stats/summary`
    Summary,
    /// `stats/top_domains`
    TopDomains,
    /// `stats/top_clients`
    TopClients,
    /// `stats/upstreams`
    Upstreams,
    /// `stats/query_types`
    QueryTypes,
    /// `stats/recentblocked`
    RecentBlocked,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Info { db } => cmd_info(&db),
        Commands::Retain { db, max_days } => cmd_retain(&db, max_days),
        Commands::Replay { db, events, config } => cmd_replay(&db, &events, config.as_deref()),
        Commands::Stats {
            db,
            endpoint,
            count,
            blocked,
            audit,
            now,
            config,
        } => {
            let endpoint = match endpoint {
                EndpointArg::History => Endpoint::History,
                EndpointArg::HistoryClients => Endpoint::HistoryClients {
                    max_clients: count.and_then(|n| usize::try_from(n).ok()),
                },
                EndpointArg::Summary => Endpoint::Summary,
                EndpointArg::TopDomains => Endpoint::TopDomains {
                    blocked,
                    count,
                    audit,
                },
                EndpointArg::TopClients => Endpoint::TopClients { blocked, count },
                EndpointArg::Upstreams => Endpoint::Upstreams,
                EndpointArg::QueryTypes => Endpoint::QueryTypes,
                EndpointArg::RecentBlocked => Endpoint::RecentBlocked { count },
            };
            cmd_stats(&db, &endpoint, now, config.as_deref())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Implements `sinkhole info <db>`.
fn cmd_info(db: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if !db.exists() {
        return Err(format!("No database found at '{}'", db.display()).into());
    }
    let handle = SqliteStorage::new(db).open()?;

    println!("Database: {}", db.display());
    println!("Queries: {}", handle.row_count()?);
    let size = handle.size_bytes()?;
    println!("Size: {} ({size} bytes)", format_bytes(size));
    match handle.timestamp_range()? {
        Some((oldest, newest)) => {
            println!("Oldest: {oldest}");
            println!("Newest: {newest}");
            println!("Span: {}", format_duration_secs(newest - oldest));
        }
        None => println!("Oldest: -\nNewest: -"),
    }
    let aliases = handle.alias_clients()?;
    if !aliases.is_empty() {
        println!();
        println!("Alias clients: {}", aliases.len());
        for alias in &aliases {
            println!("  - {} ({} members)", alias.name, alias.members.len());
        }
    }

    handle.close()?;
    Ok(())
}

/// Implements `sinkhole retain <db> --max-days N`.
fn cmd_retain(db: &Path, max_days: i32) -> Result<(), Box<dyn std::error::Error>> {
    if max_days < 0 {
        return Err("--max-days must be zero or positive".into());
    }
    let mut handle = SqliteStorage::new(db).open()?;
    let report = apply_retention(handle.as_mut(), unix_now()?, max_days, true)?;
    handle.close()?;

    println!(
        "Deleted {} of at most {} rows; database is now {}",
        report.deleted,
        report.limit,
        format_bytes(report.size_bytes)
    );
    Ok(())
}

/// Implements `sinkhole replay <db> <events>`.
fn cmd_replay(
    db: &Path,
    events: &Path,
    config: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(config)?;
    config.db_export = true;
    config.db_interval = 1;

    let now = unix_now()?;
    let storage = SqliteStorage::new(db);
    let store = restore(&storage, &config, now)?;

    let reader = BufReader::new(File::open(events)?);
    let mut recorded = 0u64;
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: QueryRecord = serde_json::from_str(&line)
            .map_err(|e| format!("{}:{}: {e}", events.display(), line_no + 1))?;
        store.with(|tables| tables.record(&record))?;
        recorded += 1;
    }
    info!(recorded, "events recorded");

    let handle = PersistenceWorker::new(store.clone(), Box::new(storage), config).spawn()?;
    // Replayed events may have introduced members of existing alias clients.
    handle.events().set(Event::ReimportAliasClients);
    let start = Instant::now();
    while store.read(Tables::unexported) > 0 {
        if start.elapsed() > FLUSH_TIMEOUT || handle.is_finished() {
            warn!(
                pending = store.read(Tables::unexported),
                "giving up waiting for the write queue to drain"
            );
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    let stats = handle.shutdown()?;

    println!("Recorded: {recorded}");
    println!("Exported: {}", stats.exported);
    println!("Export failures: {}", stats.export_failures);
    println!("Elapsed: {:.3?}", start.elapsed());
    Ok(())
}

/// Implements `sinkhole stats <db> <endpoint>`.
fn cmd_stats(
    db: &Path,
    endpoint: &Endpoint,
    now: Option<i64>,
    config: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config)?;
    let now = match now {
        Some(now) => now,
        None => unix_now()?,
    };
    let store = restore(&SqliteStorage::new(db), &config, now)?;

    let value = store.read(|tables| ReadApi::new(tables, &config, now).render(endpoint))?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Builds the in-memory tables from the rows inside the history horizon.
fn restore(
    storage: &SqliteStorage,
    config: &TelemetryConfig,
    now: i64,
) -> Result<StoreLock, Box<dyn std::error::Error>> {
    let handle = storage.open()?;
    let rows = handle.load_since(now - config.max_history)?;
    let aliases = handle.alias_clients()?;
    handle.close()?;

    let mut tables = Tables::new(config, now);
    let restored = tables.restore(rows)?;
    tables.rebuild_alias_clients(&aliases)?;
    info!(restored, aliases = aliases.len(), "restored queries from database");
    Ok(StoreLock::new(tables))
}

fn load_config(path: Option<&Path>) -> Result<TelemetryConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => TelemetryConfig::load(path)?,
        None => TelemetryConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn unix_now() -> Result<i64, Box<dyn std::error::Error>> {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    Ok(i64::try_from(secs)?)
}

/// Formats seconds as a human-readable duration.
fn format_duration_secs(secs: i64) -> String {
    if secs >= 86_400 {
        format!("{}d {}h", secs / 86_400, (secs % 86_400) / 3600)
    } else if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

/// Formats a byte count as a human-readable string.
#[allow(clippy::cast_precision_loss)] // Byte counts are display-only
fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_048_576 {
        format!("{:.1} MiB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KiB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(3 * 1_048_576), "3.0 MiB");
    }

    #[test]
    fn test_format_duration_secs() {
        assert_eq!(format_duration_secs(42), "42s");
        assert_eq!(format_duration_secs(125), "2m 5s");
        assert_eq!(format_duration_secs(90_000), "1d 1h");
    }
}
