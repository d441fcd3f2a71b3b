//! Growable, index-addressed entity table.
//!
//! A [`Table`] hands out dense, zero-based ids in allocation order. Ids are
//! never reused and growing the table never invalidates an id already handed
//! out. A slot can be tombstoned, after which its id reads as "not found";
//! lookups of unknown or tombstoned ids return `None` rather than panicking.
//!
//! Tombstoned slots at the front of the table are released: the table keeps
//! the index of its first retained slot, so expiring entities in allocation
//! order bounds memory by the number of retained slots. A tombstone in the
//! middle keeps its slot until everything before it is gone too.

use std::collections::VecDeque;
use std::marker::PhantomData;

use crate::error::{Result, TableError};
use crate::model::EntityId;

/// Append-only arena of entities addressed by a typed id.
#[derive(Debug, Clone)]
pub struct Table<I, T> {
    slots: VecDeque<Option<T>>,
    /// Index of `slots[0]`; every id below it has been released.
    base: usize,
    live: usize,
    _id: PhantomData<I>,
}

impl<I: EntityId, T> Default for Table<I, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: EntityId, T> Table<I, T> {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            slots: VecDeque::new(),
            base: 0,
            live: 0,
            _id: PhantomData,
        }
    }

    /// Appends `value` and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::Full`] once the id type cannot represent the next
    /// index.
    pub fn allocate(&mut self, value: T) -> Result<I> {
        let id = I::from_index(self.len()).ok_or(TableError::Full {
            kind: I::KIND,
            len: self.len(),
        })?;
        self.slots.push_back(Some(value));
        self.live += 1;
        Ok(id)
    }

    fn position(&self, id: I) -> Option<usize> {
        id.index().checked_sub(self.base)
    }

    /// Returns the entity at `id`, or `None` if it is out of range or tombstoned.
    pub fn get(&self, id: I) -> Option<&T> {
        self.slots.get(self.position(id)?).and_then(Option::as_ref)
    }

    /// Mutable variant of [`Table::get`].
    pub fn get_mut(&mut self, id: I) -> Option<&mut T> {
        let pos = self.position(id)?;
        self.slots.get_mut(pos).and_then(Option::as_mut)
    }

    /// Number of ids ever handed out, tombstoned ones included.
    pub fn len(&self) -> usize {
        self.base + self.slots.len()
    }

    /// Returns true if no id has been handed out yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entities that are still readable.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Number of slots held in memory, readable or tombstoned.
    pub fn retained(&self) -> usize {
        self.slots.len()
    }

    /// Iterates over readable entities in id order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (I, &T)> + '_ {
        let base = self.base;
        self.slots.iter().enumerate().filter_map(move |(i, slot)| {
            let value = slot.as_ref()?;
            Some((I::from_index(base + i)?, value))
        })
    }

    /// Iterates mutably over readable entities in id order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (I, &mut T)> + '_ {
        let base = self.base;
        self.slots.iter_mut().enumerate().filter_map(move |(i, slot)| {
            let value = slot.as_mut()?;
            Some((I::from_index(base + i)?, value))
        })
    }

    /// Drops the payload at `id`; the id stays allocated and reads as missing.
    pub(crate) fn tombstone(&mut self, id: I) -> Option<T> {
        let pos = self.position(id)?;
        let value = self.slots.get_mut(pos)?.take();
        if value.is_some() {
            self.live -= 1;
        }
        while self.slots.front().is_some_and(Option::is_none) {
            self.slots.pop_front();
            self.base += 1;
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DomainId;

    #[test]
    fn test_allocate_assigns_dense_ids() {
        let mut table: Table<DomainId, &str> = Table::new();
        let a = table.allocate("a.example").unwrap();
        let b = table.allocate("b.example").unwrap();

        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(table.get(a), Some(&"a.example"));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_growth_keeps_ids_valid() {
        let mut table: Table<DomainId, usize> = Table::new();
        let first = table.allocate(0).unwrap();
        for i in 1..10_000 {
            table.allocate(i).unwrap();
        }
        assert_eq!(table.get(first), Some(&0));
        assert_eq!(table.get(DomainId::new(9_999)), Some(&9_999));
    }

    #[test]
    fn test_out_of_range_is_not_found() {
        let table: Table<DomainId, u8> = Table::new();
        assert!(table.get(DomainId::new(3)).is_none());
    }

    #[test]
    fn test_tombstone_hides_entry_without_reusing_id() {
        let mut table: Table<DomainId, u8> = Table::new();
        let a = table.allocate(1).unwrap();
        let b = table.allocate(2).unwrap();

        assert_eq!(table.tombstone(a), Some(1));
        assert!(table.get(a).is_none());
        assert_eq!(table.tombstone(a), None);
        assert_eq!(table.live(), 1);

        let c = table.allocate(3).unwrap();
        assert_eq!(c.index(), 2);
        let ids: Vec<_> = table.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![b, c]);
    }

    #[test]
    fn test_tombstoned_prefix_is_released() {
        let mut table: Table<DomainId, usize> = Table::new();
        let ids: Vec<DomainId> = (0..100).map(|i| table.allocate(i).unwrap()).collect();

        // A hole in the middle keeps its slot.
        table.tombstone(ids[50]);
        assert_eq!(table.retained(), 100);

        for id in &ids[..60] {
            table.tombstone(*id);
        }
        assert_eq!(table.retained(), 40);
        assert_eq!(table.len(), 100);
        assert_eq!(table.live(), 40);

        // Released ids still read as missing; later ids keep their values.
        assert!(table.get(ids[0]).is_none());
        assert!(table.get_mut(ids[59]).is_none());
        assert_eq!(table.get(ids[60]), Some(&60));
        assert_eq!(table.iter().next().map(|(id, _)| id), Some(ids[60]));
        assert_eq!(table.iter().next_back().map(|(id, v)| (id, *v)), Some((ids[99], 99)));

        let next = table.allocate(100).unwrap();
        assert_eq!(next.index(), 100);
        assert_eq!(table.get(next), Some(&100));
    }
}
