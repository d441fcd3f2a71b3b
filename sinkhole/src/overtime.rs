//! OverTime ring: fixed-width time buckets backing the history endpoints.
//!
//! The ring holds a fixed number of buckets ordered oldest first. Slot 0 is
//! the oldest retained bucket and the last slot covers the current interval.
//! A timestamp maps to its slot purely arithmetically:
//!
//! ```text
//! slot = (timestamp - oldest_start) / interval
//! ```
//!
//! As wall-clock time moves past the newest bucket, [`OverTime::advance`]
//! slides the window: the oldest buckets fall off the front and empty buckets
//! are appended, keeping bucket timestamps strictly increasing with slot index.
//! Per-client arrays parallel to the ring are shifted by the same amount with
//! [`shift_counts`].

use serde::Serialize;

/// One fixed-width history bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Bucket {
    /// Start of the interval covered by this bucket (Unix seconds).
    pub timestamp: i64,
    /// Queries in this interval.
    pub total: u32,
    /// Queries answered from the cache.
    pub cached: u32,
    /// Blocked queries.
    pub blocked: u32,
}

impl Bucket {
    /// Returns true if the bucket holds any data.
    pub fn has_data(&self) -> bool {
        self.total > 0 || self.blocked > 0
    }
}

/// Sliding window of history buckets.
#[derive(Debug, Clone)]
pub struct OverTime {
    buckets: Vec<Bucket>,
    interval: i64,
}

impl OverTime {
    /// Creates an empty ring whose newest bucket covers `now`.
    ///
    /// `slots` and `interval` are expected to be validated by the caller; a
    /// zero slot count is bumped to one and a non-positive interval to one
    /// second.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use sinkhole::overtime::OverTime;
    ///
    /// let ring = OverTime::new(1_000, 3, 600);
    /// let starts: Vec<i64> = ring.buckets().iter().map(|b| b.timestamp).collect();
    /// assert_eq!(starts, vec![-600, 0, 600]);
    /// assert_eq!(ring.slot_for(1_000), Some(2));
    /// ```
    pub fn new(now: i64, slots: usize, interval: i64) -> Self {
        let slots = slots.max(1);
        let interval = interval.max(1);
        let newest = now.div_euclid(interval) * interval;
        let oldest = newest - interval * (slots as i64 - 1);
        let buckets = (0..slots)
            .map(|i| Bucket {
                timestamp: oldest + interval * i as i64,
                ..Bucket::default()
            })
            .collect();
        Self { buckets, interval }
    }

    /// Width of one bucket in seconds.
    pub fn interval(&self) -> i64 {
        self.interval
    }

    /// Number of buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Always false: the ring holds at least one bucket.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// All buckets, oldest first.
    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Start of the oldest retained bucket.
    pub fn oldest_timestamp(&self) -> i64 {
        self.buckets.first().map_or(0, |b| b.timestamp)
    }

    /// Start of the newest bucket.
    pub fn newest_timestamp(&self) -> i64 {
        self.buckets.last().map_or(0, |b| b.timestamp)
    }

    /// Returns the slot covering `timestamp`, or `None` outside the window.
    pub fn slot_for(&self, timestamp: i64) -> Option<usize> {
        let offset = timestamp - self.oldest_timestamp();
        if offset < 0 {
            return None;
        }
        let slot = usize::try_from(offset / self.interval).ok()?;
        (slot < self.buckets.len()).then_some(slot)
    }

    /// Counts one query in the bucket covering `timestamp`.
    ///
    /// Returns the slot that was bumped, or `None` if the timestamp lies
    /// outside the window.
    pub fn record(&mut self, timestamp: i64, cached: bool, blocked: bool) -> Option<usize> {
        let slot = self.slot_for(timestamp)?;
        let bucket = &mut self.buckets[slot];
        bucket.total = bucket.total.saturating_add(1);
        if cached {
            bucket.cached = bucket.cached.saturating_add(1);
        }
        if blocked {
            bucket.blocked = bucket.blocked.saturating_add(1);
        }
        Some(slot)
    }

    /// Slides the window forward so the newest bucket covers `now`.
    ///
    /// Returns how many slots the window moved; zero if `now` is still inside
    /// the newest bucket (or in the past).
    pub fn advance(&mut self, now: i64) -> usize {
        let target = now.div_euclid(self.interval) * self.interval;
        let newest = self.newest_timestamp();
        if target <= newest {
            return 0;
        }
        let steps = (target - newest) / self.interval;
        let shift = usize::try_from(steps).map_or(self.buckets.len(), |s| s.min(self.buckets.len()));

        self.buckets.drain(..shift);
        // Appended buckets end exactly at `target`.
        let mut next = target - self.interval * (shift as i64 - 1);
        for _ in 0..shift {
            self.buckets.push(Bucket {
                timestamp: next,
                ..Bucket::default()
            });
            next += self.interval;
        }
        debug_assert_eq!(self.newest_timestamp(), target);
        shift
    }
}

/// Shifts a per-slot counter array left by `shift`, zero-filling the tail.
///
/// Used to keep per-client arrays aligned with the ring after
/// [`OverTime::advance`].
pub fn shift_counts(counts: &mut [u32], shift: usize) {
    let shift = shift.min(counts.len());
    counts.rotate_left(shift);
    let len = counts.len();
    counts[len - shift..].fill(0);
}
