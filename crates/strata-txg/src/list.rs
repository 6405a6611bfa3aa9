//! Per-generation dirty sets.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use strata_types::{TXG_SIZE, Txg};

/// One ordered set per generation slot. An item is added at most once per
/// generation; membership in any slot pins the item (it must not be evicted
/// until the generation that dirtied it has synced).
#[derive(Debug)]
pub struct TxgList<T: Ord + Clone> {
    slots: Mutex<[BTreeSet<T>; TXG_SIZE]>,
}

impl<T: Ord + Clone> TxgList<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(std::array::from_fn(|_| BTreeSet::new())),
        }
    }

    /// Add `item` to `txg`'s set. Returns `true` if it was not already there.
    pub fn add(&self, txg: Txg, item: T) -> bool {
        self.slots.lock()[txg.slot()].insert(item)
    }

    #[must_use]
    pub fn contains(&self, txg: Txg, item: &T) -> bool {
        self.slots.lock()[txg.slot()].contains(item)
    }

    /// Whether `item` is dirty in any in-flight generation.
    #[must_use]
    pub fn contains_any(&self, item: &T) -> bool {
        self.slots.lock().iter().any(|set| set.contains(item))
    }

    #[must_use]
    pub fn is_empty(&self, txg: Txg) -> bool {
        self.slots.lock()[txg.slot()].is_empty()
    }

    /// Drain `txg`'s set in order.
    pub fn take(&self, txg: Txg) -> Vec<T> {
        std::mem::take(&mut self.slots.lock()[txg.slot()])
            .into_iter()
            .collect()
    }
}

impl<T: Ord + Clone> Default for TxgList<T> {
    fn default() -> Self {
        Self::new()
    }
}
