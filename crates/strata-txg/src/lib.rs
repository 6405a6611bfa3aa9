#![forbid(unsafe_code)]
//! Transaction generation ring.
//!
//! Every mutation is assigned to the currently *open* generation. Closing a
//! generation waits for its holds to drain (quiesce), after which exactly one
//! caller syncs it. At most [`TXG_SIZE`] generations are ever unsynced, so
//! per-generation arrays indexed by [`Txg::slot`] are never reused early.
//!
//! The manager is an explicit value with an injected [`Clock`]: admission and
//! commit code receive it by reference instead of reading ambient state.

pub mod list;
pub mod taskq;

pub use list::TxgList;
pub use taskq::fan_out;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_types::{TXG_SIZE, Txg};
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Time source for sync scheduling.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock();
        *offset = offset.saturating_add(by);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Triggers for closing the open generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Sync at least this often while anything is dirty.
    /// Default: 5s.
    pub sync_interval: Duration,
    /// Sync early once this many bytes are estimated dirty.
    /// Default: 64 MiB.
    pub dirty_threshold: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(5),
            dirty_threshold: 64 << 20,
        }
    }
}

// ---------------------------------------------------------------------------
// Generation manager
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct GenState {
    open: Txg,
    synced: Txg,
    /// Generation currently quiescing or syncing, if any.
    closing: Option<Txg>,
    holds: [u64; TXG_SIZE],
    last_sync: Instant,
}

/// Owner of the open/quiescing/syncing generation numbers.
#[derive(Debug)]
pub struct GenerationManager {
    config: GenerationConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<GenState>,
    quiesced: Condvar,
}

impl GenerationManager {
    /// Create a manager whose last durable generation is `synced`.
    /// The first open generation is `synced + 1`.
    #[must_use]
    pub fn new(config: GenerationConfig, clock: Arc<dyn Clock>, synced: Txg) -> Self {
        let now = clock.now();
        info!(synced = synced.0, "generation_manager: initializing");
        Self {
            config,
            clock,
            state: Mutex::new(GenState {
                open: synced.next(),
                synced,
                closing: None,
                holds: [0; TXG_SIZE],
                last_sync: now,
            }),
            quiesced: Condvar::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// The generation new work is currently assigned to.
    #[must_use]
    pub fn open_txg(&self) -> Txg {
        self.state.lock().open
    }

    /// Highest generation whose state is durable.
    #[must_use]
    pub fn synced_txg(&self) -> Txg {
        self.state.lock().synced
    }

    /// The generation being quiesced or synced right now.
    #[must_use]
    pub fn syncing_txg(&self) -> Option<Txg> {
        self.state.lock().closing
    }

    #[must_use]
    pub fn is_synced(&self, txg: Txg) -> bool {
        txg <= self.synced_txg()
    }

    /// Pin the open generation so it cannot quiesce until the hold drops.
    #[must_use]
    pub fn hold_open(self: &Arc<Self>) -> TxgHold {
        let mut state = self.state.lock();
        let txg = state.open;
        state.holds[txg.slot()] += 1;
        drop(state);
        TxgHold {
            manager: Arc::clone(self),
            txg,
        }
    }

    fn release(&self, txg: Txg) {
        let mut state = self.state.lock();
        let slot = txg.slot();
        debug_assert!(state.holds[slot] > 0, "txg hold underflow for {txg}");
        state.holds[slot] = state.holds[slot].saturating_sub(1);
        let drained = state.holds[slot] == 0;
        drop(state);
        if drained {
            self.quiesced.notify_all();
        }
    }

    /// Close the open generation: advance `open`, then block until every
    /// hold on the closed generation has been released.
    ///
    /// The caller becomes the single writer for the returned generation and
    /// must finish with [`mark_synced`](Self::mark_synced) or
    /// [`abandon`](Self::abandon).
    pub fn close_open(&self) -> Txg {
        let mut state = self.state.lock();
        let closing = state.open;
        debug_assert!(state.closing.is_none(), "generation {closing} closed twice");
        debug_assert!(
            closing.0 - state.synced.0 < TXG_SIZE as u64,
            "generation ring overrun: open={} synced={}",
            closing.0,
            state.synced.0
        );
        state.open = closing.next();
        state.closing = Some(closing);
        while state.holds[closing.slot()] > 0 {
            self.quiesced.wait(&mut state);
        }
        debug!(target: "strata::txg", txg = closing.0, "generation_quiesced");
        closing
    }

    /// Record that `txg` is durable.
    pub fn mark_synced(&self, txg: Txg) {
        let mut state = self.state.lock();
        if txg > state.synced {
            state.synced = txg;
        }
        if state.closing == Some(txg) {
            state.closing = None;
        }
        state.last_sync = self.clock.now();
        drop(state);
        debug!(target: "strata::txg", txg = txg.0, "generation_synced");
    }

    /// Give up on a closed generation after a durability fault. It is never
    /// marked synced.
    pub fn abandon(&self, txg: Txg) {
        let mut state = self.state.lock();
        if state.closing == Some(txg) {
            state.closing = None;
        }
    }

    /// Whether the open generation should be closed now: the sync interval
    /// elapsed, or `dirty_bytes` crossed the configured threshold.
    #[must_use]
    pub fn should_sync(&self, dirty_bytes: u64) -> bool {
        if dirty_bytes >= self.config.dirty_threshold {
            return true;
        }
        let last = self.state.lock().last_sync;
        self.clock.now().saturating_duration_since(last) >= self.config.sync_interval
    }
}

/// Keeps one generation open. Dropping the hold lets it quiesce.
#[derive(Debug)]
pub struct TxgHold {
    manager: Arc<GenerationManager>,
    txg: Txg,
}

impl TxgHold {
    #[must_use]
    pub fn txg(&self) -> Txg {
        self.txg
    }
}

impl Drop for TxgHold {
    fn drop(&mut self) {
        self.manager.release(self.txg);
    }
}
