//! Pool-wide space collaborators consulted by the admission walk.
//!
//! [`PoolSpace`] answers "how big is the pool, after slop" for the root
//! directory's quota clamp and tracks bytes waiting on deferred frees.
//! [`WriteThrottle`] bounds the amount of admitted-but-unsynced logical data
//! and is consulted before the directory walk begins.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use strata_error::{Result, StrataError};
use strata_types::{TXG_SIZE, Txg};
use tracing::{debug, error};

/// How much of the pool is held back from ordinary allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlopPolicy {
    /// Slop is at least `capacity >> shift`.
    /// Default: 5 (1/32 of the pool).
    pub shift: u32,
    /// Floor for the slop, itself capped at half the pool.
    /// Default: 32 MiB.
    pub min_bytes: u64,
}

impl Default for SlopPolicy {
    fn default() -> Self {
        Self {
            shift: 5,
            min_bytes: 32 << 20,
        }
    }
}

impl SlopPolicy {
    #[must_use]
    pub fn slop(&self, capacity: u64) -> u64 {
        let by_shift = capacity >> self.shift.min(63);
        by_shift.max(self.min_bytes.min(capacity >> 1))
    }
}

/// Pool capacity, slop and deferred-free bookkeeping.
#[derive(Debug)]
pub struct PoolSpace {
    capacity: u64,
    slop: SlopPolicy,
    deferred: AtomicU64,
    pending: Mutex<[u64; TXG_SIZE]>,
}

impl PoolSpace {
    #[must_use]
    pub fn new(capacity: u64, slop: SlopPolicy) -> Self {
        Self {
            capacity,
            slop,
            deferred: AtomicU64::new(0),
            pending: Mutex::new([0; TXG_SIZE]),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    #[must_use]
    pub fn slop_bytes(&self) -> u64 {
        self.slop.slop(self.capacity)
    }

    /// Capacity minus slop. Net-free operations only give up half the slop
    /// so that deletions keep trickling through on a nearly full pool.
    #[must_use]
    pub fn adjusted_size(&self, net_free: bool) -> u64 {
        let slop = self.slop_bytes();
        let slop = if net_free { slop / 2 } else { slop };
        self.capacity.saturating_sub(slop)
    }

    /// Bytes freed by committed generations but not yet reclaimable.
    #[must_use]
    pub fn deferred(&self) -> u64 {
        self.deferred.load(Ordering::Acquire)
    }

    pub fn defer_free(&self, bytes: u64) {
        self.deferred.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn reclaim_deferred(&self, bytes: u64) {
        let prev = self
            .deferred
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| {
                Some(d.saturating_sub(bytes))
            })
            .unwrap_or_default();
        if prev < bytes {
            debug_assert!(false, "deferred-free underflow: {prev} < {bytes}");
            error!(deferred = prev, bytes, "deferred-free counter underflow clamped");
        }
    }

    /// Record `bytes` admitted against generation `txg`.
    pub fn tempreserve(&self, txg: Txg, bytes: u64) {
        let mut pending = self.pending.lock();
        pending[txg.slot()] = pending[txg.slot()].saturating_add(bytes);
    }

    pub fn tempreserve_clear(&self, txg: Txg, bytes: u64) {
        let mut pending = self.pending.lock();
        let slot = &mut pending[txg.slot()];
        if *slot < bytes {
            debug_assert!(false, "pool tempreserve underflow for txg {txg}");
            error!(txg = txg.0, pending = *slot, bytes, "pool tempreserve underflow clamped");
        }
        *slot = slot.saturating_sub(bytes);
    }

    /// Bytes admitted against `txg` whose tickets are still outstanding.
    #[must_use]
    pub fn pending(&self, txg: Txg) -> u64 {
        self.pending.lock()[txg.slot()]
    }

    #[must_use]
    pub fn pending_total(&self) -> u64 {
        self.pending.lock().iter().sum()
    }
}

/// Bound on admitted, not yet synced, logical bytes.
#[derive(Debug)]
pub struct WriteThrottle {
    limit: u64,
    reserved: Mutex<u64>,
}

impl WriteThrottle {
    #[must_use]
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            reserved: Mutex::new(0),
        }
    }

    #[must_use]
    pub fn limit(&self) -> u64 {
        self.limit
    }

    #[must_use]
    pub fn outstanding(&self) -> u64 {
        *self.reserved.lock()
    }

    /// Admit `bytes`, or deny with [`StrataError::Restart`] when the buffer
    /// is full. A request is always admitted while nothing is outstanding,
    /// so a single oversized write cannot starve forever.
    pub fn reserve(&self, bytes: u64) -> Result<()> {
        let mut reserved = self.reserved.lock();
        if *reserved > 0 && reserved.saturating_add(bytes) > self.limit {
            debug!(
                target: "strata::throttle",
                outstanding = *reserved,
                bytes,
                limit = self.limit,
                "write_throttle_denied"
            );
            return Err(StrataError::Restart);
        }
        *reserved = reserved.saturating_add(bytes);
        Ok(())
    }

    pub fn release(&self, bytes: u64) {
        let mut reserved = self.reserved.lock();
        if *reserved < bytes {
            debug_assert!(false, "write throttle underflow");
            error!(outstanding = *reserved, bytes, "write throttle underflow clamped");
        }
        *reserved = reserved.saturating_sub(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slop_is_shifted_capacity_with_floor() {
        let policy = SlopPolicy {
            shift: 5,
            min_bytes: 128,
        };
        assert_eq!(policy.slop(32 * 1024), 1024);
        // Floor applies below 32 * 128.
        assert_eq!(policy.slop(1024), 128);
        // Floor never exceeds half the pool.
        assert_eq!(policy.slop(100), 50);
    }

    #[test]
    fn net_free_gives_up_half_the_slop() {
        let space = PoolSpace::new(
            3200,
            SlopPolicy {
                shift: 5,
                min_bytes: 0,
            },
        );
        assert_eq!(space.slop_bytes(), 100);
        assert_eq!(space.adjusted_size(false), 3100);
        assert_eq!(space.adjusted_size(true), 3150);
    }

    #[test]
    fn deferred_and_pending_counters() {
        let space = PoolSpace::new(1 << 20, SlopPolicy::default());
        space.defer_free(4096);
        assert_eq!(space.deferred(), 4096);
        space.reclaim_deferred(4096);
        assert_eq!(space.deferred(), 0);

        space.tempreserve(Txg(3), 100);
        space.tempreserve(Txg(4), 50);
        assert_eq!(space.pending(Txg(3)), 100);
        assert_eq!(space.pending_total(), 150);
        space.tempreserve_clear(Txg(3), 100);
        assert_eq!(space.pending(Txg(3)), 0);
    }

    #[test]
    fn throttle_admits_lone_request_then_restarts() {
        let throttle = WriteThrottle::new(100);
        throttle.reserve(500).expect("lone oversized request admitted");
        assert!(matches!(throttle.reserve(1), Err(StrataError::Restart)));
        throttle.release(500);
        throttle.reserve(60).expect("fits");
        throttle.reserve(40).expect("fits exactly");
        assert!(matches!(throttle.reserve(1), Err(StrataError::Restart)));
        assert_eq!(throttle.outstanding(), 100);
    }
}
