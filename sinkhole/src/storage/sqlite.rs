//! SQLite storage backend.
//!
//! One database file holds three tables:
//!
//! - `queries`: one row per completed query
//! - `network`: neighbor-cache entries keyed by hardware address
//! - `aliasclient`: alias-client definitions; members point at them through
//!   `network.aliasclient_id`
//!
//! The schema is created on open if missing. Clients without a known hardware
//! address are kept in `network` under a synthetic `ip-<address>` key so they
//! can still belong to an alias client.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, params};

use super::{Storage, StorageHandle};
use crate::error::StorageError;
use crate::model::{
    AliasClientDef, NeighborEntry, QueryRecord, QueryStatus, QueryType, ReplyType, UpstreamAddr,
};
use crate::sources::VendorLookup;

/// How long a statement waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(1);

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS queries (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp     INTEGER NOT NULL,
    type          INTEGER NOT NULL,
    status        INTEGER NOT NULL,
    reply         INTEGER NOT NULL,
    domain        TEXT    NOT NULL,
    client        TEXT    NOT NULL,
    client_name   TEXT,
    forward       TEXT,
    forward_name  TEXT,
    port          INTEGER,
    response_time REAL
);
CREATE INDEX IF NOT EXISTS idx_queries_timestamp ON queries (timestamp);

CREATE TABLE IF NOT EXISTS network (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    hwaddr         TEXT    NOT NULL UNIQUE,
    ip             TEXT    NOT NULL,
    interface      TEXT    NOT NULL,
    first_seen     INTEGER NOT NULL,
    last_seen      INTEGER NOT NULL,
    mac_vendor     TEXT,
    aliasclient_id INTEGER
);

CREATE TABLE IF NOT EXISTS aliasclient (
    id      INTEGER PRIMARY KEY,
    name    TEXT NOT NULL,
    comment TEXT
);
";

/// A SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    path: PathBuf,
}

impl SqliteStorage {
    /// Uses the database at `path`, creating it on first open.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Storage for SqliteStorage {
    fn open(&self) -> Result<Box<dyn StorageHandle>, StorageError> {
        let location = self.describe();
        let conn = Connection::open(&self.path)
            .map_err(|e| StorageError::open(location.clone(), "cannot open database", e))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| StorageError::open(location.clone(), "cannot set busy timeout", e))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| StorageError::open(location, "cannot create schema", e))?;
        Ok(Box::new(SqliteHandle { conn }))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

struct SqliteHandle {
    conn: Connection,
}

/// Raw `queries` row before mapping onto the model.
struct QueryRow {
    timestamp: i64,
    query_type: i64,
    status: i64,
    reply: i64,
    domain: String,
    client: String,
    client_name: Option<String>,
    forward: Option<String>,
    forward_name: Option<String>,
    port: Option<i64>,
    response_time: Option<f64>,
}

impl QueryRow {
    fn into_record(self) -> Result<QueryRecord, StorageError> {
        let upstream = match (self.forward, self.port) {
            (Some(ip), Some(port)) => {
                let port = u16::try_from(port)
                    .map_err(|_| StorageError::InvalidData(format!("upstream port {port} out of range")))?;
                Some(UpstreamAddr {
                    ip,
                    name: self.forward_name,
                    port,
                })
            }
            _ => None,
        };
        Ok(QueryRecord {
            timestamp: self.timestamp,
            domain: self.domain,
            client_ip: self.client,
            client_name: self.client_name,
            upstream,
            query_type: QueryType::from_code(self.query_type),
            status: QueryStatus::from_code(self.status),
            reply: ReplyType::from_code(self.reply),
            response_time: self.response_time,
        })
    }
}

fn to_u64(value: i64, what: &str) -> Result<u64, StorageError> {
    u64::try_from(value).map_err(|_| StorageError::InvalidData(format!("negative {what}: {value}")))
}

impl StorageHandle for SqliteHandle {
    fn insert_queries(&mut self, rows: &[QueryRecord]) -> Result<usize, StorageError> {
        let tx = self
            .conn
            .transaction()
            .map_err(|e| StorageError::query("failed to begin export transaction", e))?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO queries (timestamp, type, status, reply, domain, client, \
                     client_name, forward, forward_name, port, response_time) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                )
                .map_err(|e| StorageError::query("failed to prepare query insert", e))?;
            for row in rows {
                let upstream = row.upstream.as_ref();
                stmt.execute(params![
                    row.timestamp,
                    row.query_type.code(),
                    row.status.code(),
                    row.reply.code(),
                    row.domain,
                    row.client_ip,
                    row.client_name,
                    upstream.map(|u| u.ip.as_str()),
                    upstream.and_then(|u| u.name.as_deref()),
                    upstream.map(|u| i64::from(u.port)),
                    row.response_time,
                ])
                .map_err(|e| StorageError::query("failed to insert query", e))?;
            }
        }
        tx.commit()
            .map_err(|e| StorageError::query("failed to commit export transaction", e))?;
        Ok(rows.len())
    }

    fn row_count(&self) -> Result<u64, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM queries", [], |row| row.get(0))
            .map_err(|e| StorageError::query("failed to count queries", e))?;
        to_u64(count, "row count")
    }

    fn delete_older_than(&mut self, cutoff: i64, limit: u64) -> Result<u64, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let deleted = self
            .conn
            .execute(
                "DELETE FROM queries WHERE id IN \
                 (SELECT id FROM queries WHERE timestamp <= ?1 ORDER BY timestamp, id LIMIT ?2)",
                params![cutoff, limit],
            )
            .map_err(|e| StorageError::query("failed to delete old queries", e))?;
        Ok(deleted as u64)
    }

    fn size_bytes(&self) -> Result<u64, StorageError> {
        let pragma = |name: &str| -> Result<i64, StorageError> {
            self.conn
                .query_row(&format!("PRAGMA {name}"), [], |row| row.get(0))
                .map_err(|e| StorageError::query(format!("failed to read {name}"), e))
        };
        let bytes = pragma("page_count")?.saturating_mul(pragma("page_size")?);
        to_u64(bytes, "database size")
    }

    fn timestamp_range(&self) -> Result<Option<(i64, i64)>, StorageError> {
        let (min, max): (Option<i64>, Option<i64>) = self
            .conn
            .query_row("SELECT MIN(timestamp), MAX(timestamp) FROM queries", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .map_err(|e| StorageError::query("failed to read timestamp range", e))?;
        Ok(min.zip(max))
    }

    fn load_since(&self, since: i64) -> Result<Vec<QueryRecord>, StorageError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT timestamp, type, status, reply, domain, client, client_name, \
                 forward, forward_name, port, response_time \
                 FROM queries WHERE timestamp >= ?1 ORDER BY id",
            )
            .map_err(|e| StorageError::query("failed to prepare query load", e))?;
        let rows = stmt
            .query_map(params![since], |row| {
                Ok(QueryRow {
                    timestamp: row.get(0)?,
                    query_type: row.get(1)?,
                    status: row.get(2)?,
                    reply: row.get(3)?,
                    domain: row.get(4)?,
                    client: row.get(5)?,
                    client_name: row.get(6)?,
                    forward: row.get(7)?,
                    forward_name: row.get(8)?,
                    port: row.get(9)?,
                    response_time: row.get(10)?,
                })
            })
            .map_err(|e| StorageError::query("failed to load queries", e))?;

        let mut records = Vec::new();
        for row in rows {
            let row = row.map_err(|e| StorageError::query("failed to read query row", e))?;
            records.push(row.into_record()?);
        }
        Ok(records)
    }

    fn upsert_neighbors(&mut self, entries: &[NeighborEntry], now: i64) -> Result<usize, StorageError> {
        let tx = self
            .conn
            .transaction()
            .map_err(|e| StorageError::query("failed to begin neighbor transaction", e))?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO network (hwaddr, ip, interface, first_seen, last_seen) \
                     VALUES (?1, ?2, ?3, ?4, ?4) \
                     ON CONFLICT(hwaddr) DO UPDATE SET \
                     ip = excluded.ip, interface = excluded.interface, last_seen = excluded.last_seen",
                )
                .map_err(|e| StorageError::query("failed to prepare neighbor upsert", e))?;
            for entry in entries {
                stmt.execute(params![entry.hwaddr, entry.ip, entry.interface, now])
                    .map_err(|e| StorageError::query("failed to upsert neighbor", e))?;
            }
        }
        tx.commit()
            .map_err(|e| StorageError::query("failed to commit neighbor transaction", e))?;
        Ok(entries.len())
    }

    fn refresh_vendors(&mut self, vendors: &dyn VendorLookup) -> Result<usize, StorageError> {
        let hwaddrs: Vec<String> = {
            let mut stmt = self
                .conn
                .prepare("SELECT hwaddr FROM network WHERE hwaddr NOT LIKE 'ip-%'")
                .map_err(|e| StorageError::query("failed to prepare vendor scan", e))?;
            let rows = stmt
                .query_map([], |row| row.get(0))
                .map_err(|e| StorageError::query("failed to scan hardware addresses", e))?;
            rows.collect::<Result<_, _>>()
                .map_err(|e| StorageError::query("failed to read hardware address", e))?
        };

        let tx = self
            .conn
            .transaction()
            .map_err(|e| StorageError::query("failed to begin vendor transaction", e))?;
        let mut known = 0;
        for hwaddr in &hwaddrs {
            let vendor = vendors.vendor(hwaddr);
            if vendor.is_some() {
                known += 1;
            }
            tx.execute(
                "UPDATE network SET mac_vendor = ?1 WHERE hwaddr = ?2",
                params![vendor, hwaddr],
            )
            .map_err(|e| StorageError::query("failed to update vendor", e))?;
        }
        tx.commit()
            .map_err(|e| StorageError::query("failed to commit vendor transaction", e))?;
        Ok(known)
    }

    fn save_alias_client(&mut self, def: &AliasClientDef) -> Result<(), StorageError> {
        let tx = self
            .conn
            .transaction()
            .map_err(|e| StorageError::query("failed to begin alias transaction", e))?;
        tx.execute(
            "INSERT INTO aliasclient (id, name) VALUES (?1, ?2) \
             ON CONFLICT(id) DO UPDATE SET name = excluded.name",
            params![def.id, def.name],
        )
        .map_err(|e| StorageError::query("failed to save alias client", e))?;
        tx.execute(
            "UPDATE network SET aliasclient_id = NULL WHERE aliasclient_id = ?1",
            params![def.id],
        )
        .map_err(|e| StorageError::query("failed to detach alias members", e))?;
        for ip in &def.members {
            let updated = tx
                .execute(
                    "UPDATE network SET aliasclient_id = ?2 WHERE ip = ?1",
                    params![ip, def.id],
                )
                .map_err(|e| StorageError::query("failed to attach alias member", e))?;
            if updated == 0 {
                tx.execute(
                    "INSERT INTO network (hwaddr, ip, interface, first_seen, last_seen, aliasclient_id) \
                     VALUES ('ip-' || ?1, ?1, '', 0, 0, ?2)",
                    params![ip, def.id],
                )
                .map_err(|e| StorageError::query("failed to add alias member", e))?;
            }
        }
        tx.commit()
            .map_err(|e| StorageError::query("failed to commit alias transaction", e))
    }

    fn alias_clients(&self) -> Result<Vec<AliasClientDef>, StorageError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT a.id, a.name, n.ip FROM aliasclient a \
                 LEFT JOIN network n ON n.aliasclient_id = a.id \
                 ORDER BY a.id, n.ip",
            )
            .map_err(|e| StorageError::query("failed to prepare alias scan", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })
            .map_err(|e| StorageError::query("failed to scan alias clients", e))?;

        let mut defs: Vec<AliasClientDef> = Vec::new();
        for row in rows {
            let (id, name, ip) = row.map_err(|e| StorageError::query("failed to read alias row", e))?;
            if defs.last().is_none_or(|d| d.id != id) {
                defs.push(AliasClientDef {
                    id,
                    name,
                    members: Vec::new(),
                });
            }
            if let (Some(def), Some(ip)) = (defs.last_mut(), ip) {
                def.members.push(ip);
            }
        }
        Ok(defs)
    }

    fn close(self: Box<Self>) -> Result<(), StorageError> {
        self.conn
            .close()
            .map_err(|(_, e)| StorageError::query("failed to close database", e))
    }
}
