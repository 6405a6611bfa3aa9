//! Sharded worklists.
//!
//! Items are spread over a fixed number of shards by a hash of their object
//! id so that one sync task per shard can drain them in parallel.

use parking_lot::Mutex;
use strata_types::ObjectId;

#[derive(Debug)]
pub(crate) struct Sublists<T> {
    shards: Vec<Mutex<Vec<T>>>,
}

impl<T> Sublists<T> {
    pub(crate) fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    pub(crate) fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub(crate) fn shard_of(&self, id: ObjectId) -> usize {
        // Fibonacci hashing spreads sequential ids across shards.
        let hashed = id.0.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32;
        #[expect(clippy::cast_possible_truncation)]
        let idx = (hashed % self.shards.len() as u64) as usize;
        idx
    }

    pub(crate) fn push(&self, id: ObjectId, item: T) {
        self.shards[self.shard_of(id)].lock().push(item);
    }

    pub(crate) fn take(&self, shard: usize) -> Vec<T> {
        std::mem::take(&mut *self.shards[shard].lock())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.lock().is_empty())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }
}
