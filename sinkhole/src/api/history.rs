//! `history` and `history/clients`.

use std::ops::Range;

use serde::Serialize;

use super::{ReadApi, rank};
use crate::model::{Client, ClientId};
use crate::overtime::{Bucket, OverTime};

/// Client columns returned by `history/clients` when no count is given.
pub const DEFAULT_MAX_CLIENTS: usize = 20;

/// `history` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct History {
    /// In-range buckets, oldest first.
    pub history: Vec<Bucket>,
}

/// `history/clients` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientHistory {
    /// One entry per in-range bucket.
    pub history: Vec<ClientHistorySlot>,
    /// The clients the `data` arrays refer to, in the same order.
    pub clients: Vec<HistoryClient>,
}

/// Per-client counts for one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientHistorySlot {
    /// Bucket start.
    pub timestamp: i64,
    /// One count per entry of [`ClientHistory::clients`].
    pub data: Vec<u32>,
}

/// A client column in `history/clients`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryClient {
    /// Host name, if known.
    pub name: Option<String>,
    /// Address.
    pub ip: String,
    /// Total queries.
    pub total: u32,
}

/// Buckets worth returning: from the first bucket with data inside the
/// history horizon, up to (not including) the first bucket starting at or
/// after `now`.
pub(crate) fn slot_range(over_time: &OverTime, now: i64, max_history: i64) -> Option<Range<usize>> {
    let buckets = over_time.buckets();
    let horizon = now - max_history;
    let from = buckets
        .iter()
        .position(|b| b.timestamp >= horizon && b.has_data())?;
    let until = buckets
        .iter()
        .position(|b| b.timestamp >= now)
        .unwrap_or(buckets.len());
    (from < until).then_some(from..until)
}

impl ReadApi<'_> {
    /// Global history buckets.
    pub fn history(&self) -> History {
        let over_time = self.tables.over_time();
        let history = slot_range(over_time, self.now, self.config.max_history)
            .map(|range| over_time.buckets()[range].to_vec())
            .unwrap_or_default();
        History { history }
    }

    /// Per-client history buckets.
    ///
    /// Clients on the exclude list and clients whose traffic is represented by
    /// an alias client are left out. Of the rest, only the `max_clients` most
    /// active are kept ([`DEFAULT_MAX_CLIENTS`] when `None`). Columns are in
    /// table order.
    pub fn history_clients(&self, max_clients: Option<usize>) -> ClientHistory {
        let empty = ClientHistory {
            history: Vec::new(),
            clients: Vec::new(),
        };
        if self.config.privacy_level.hides_clients() {
            return empty;
        }
        let over_time = self.tables.over_time();
        let Some(range) = slot_range(over_time, self.now, self.config.max_history) else {
            return empty;
        };

        let mut visible: Vec<(ClientId, &Client)> = self
            .tables
            .clients()
            .iter()
            .filter(|(_, c)| !c.is_alias_managed())
            .filter(|(_, c)| !self.config.excludes_client(&c.ip, c.name.as_deref()))
            .collect();
        let limit = max_clients.unwrap_or(DEFAULT_MAX_CLIENTS);
        if visible.len() > limit {
            let mut keep: Vec<ClientId> = rank(visible.iter().map(|(id, c)| (*id, u64::from(c.count))))
                .into_iter()
                .take(limit)
                .map(|(id, _)| id)
                .collect();
            keep.sort_unstable();
            visible.retain(|(id, _)| keep.binary_search(id).is_ok());
        }

        let history = range
            .map(|slot| ClientHistorySlot {
                timestamp: over_time.buckets()[slot].timestamp,
                data: visible
                    .iter()
                    .map(|(_, c)| c.over_time.get(slot).copied().unwrap_or(0))
                    .collect(),
            })
            .collect();
        let clients = visible
            .iter()
            .map(|(_, c)| HistoryClient {
                name: c.name.clone(),
                ip: c.ip.clone(),
                total: c.count,
            })
            .collect();
        ClientHistory { history, clients }
    }
}
