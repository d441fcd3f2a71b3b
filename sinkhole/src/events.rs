//! Coalescing deferred-work flags.
//!
//! Any thread may [`EventFlags::set`] a flag; the persistence worker drains it
//! with [`EventFlags::take`]. This is not a queue: any number of `set` calls
//! before a `take` produce exactly one pending action, because every action
//! re-derives its state from the tables instead of consuming a payload.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// A deferred action the worker performs on request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// Rebuild the blocking domain set.
    ReloadGravity,
    /// Import the local neighbor cache into client records.
    ParseNeighborCache,
    /// Rebuild alias-client aggregation.
    ReimportAliasClients,
}

impl Event {
    /// All events.
    pub const ALL: [Self; 3] = [
        Self::ReloadGravity,
        Self::ParseNeighborCache,
        Self::ReimportAliasClients,
    ];

    const fn bit(self) -> u8 {
        match self {
            Self::ReloadGravity => 1 << 0,
            Self::ParseNeighborCache => 1 << 1,
            Self::ReimportAliasClients => 1 << 2,
        }
    }

    /// Flag name as used in log output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReloadGravity => "RELOAD_GRAVITY",
            Self::ParseNeighborCache => "PARSE_NEIGHBOR_CACHE",
            Self::ReimportAliasClients => "REIMPORT_ALIASCLIENTS",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic bitset of pending [`Event`]s.
#[derive(Debug, Default)]
pub struct EventFlags {
    bits: AtomicU8,
}

impl EventFlags {
    /// Creates a set with no pending events.
    pub const fn new() -> Self {
        Self {
            bits: AtomicU8::new(0),
        }
    }

    /// Requests `event`. Idempotent.
    pub fn set(&self, event: Event) {
        self.bits.fetch_or(event.bit(), Ordering::AcqRel);
    }

    /// Atomically clears `event`, returning whether it was pending.
    pub fn take(&self, event: Event) -> bool {
        self.bits.fetch_and(!event.bit(), Ordering::AcqRel) & event.bit() != 0
    }

    /// Returns whether `event` is pending without clearing it.
    pub fn is_set(&self, event: Event) -> bool {
        self.bits.load(Ordering::Acquire) & event.bit() != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_take_clears_flag() {
        let flags = EventFlags::new();
        assert!(!flags.take(Event::ReloadGravity));

        flags.set(Event::ReloadGravity);
        assert!(flags.is_set(Event::ReloadGravity));
        assert!(flags.take(Event::ReloadGravity));
        assert!(!flags.take(Event::ReloadGravity));
    }

    #[test]
    fn test_repeated_sets_coalesce() {
        let flags = EventFlags::new();
        for _ in 0..5 {
            flags.set(Event::ParseNeighborCache);
        }
        assert!(flags.take(Event::ParseNeighborCache));
        assert!(!flags.take(Event::ParseNeighborCache));
    }

    #[test]
    fn test_flags_are_independent() {
        let flags = EventFlags::new();
        flags.set(Event::ReimportAliasClients);
        flags.set(Event::ReloadGravity);

        assert!(flags.take(Event::ReimportAliasClients));
        assert!(flags.is_set(Event::ReloadGravity));
        assert!(!flags.is_set(Event::ParseNeighborCache));
    }

    #[test]
    fn test_concurrent_sets_yield_single_take() {
        let flags = Arc::new(EventFlags::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let flags = Arc::clone(&flags);
                thread::spawn(move || {
                    for _ in 0..100 {
                        flags.set(Event::ReloadGravity);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let taken = (0..10).filter(|_| flags.take(Event::ReloadGravity)).count();
        assert_eq!(taken, 1);
    }

    #[test]
    fn test_display_names() {
        let names: Vec<String> = Event::ALL.iter().map(ToString::to_string).collect();
        assert_eq!(
            names,
            vec!["RELOAD_GRAVITY", "PARSE_NEIGHBOR_CACHE", "REIMPORT_ALIASCLIENTS"]
        );
    }
}
