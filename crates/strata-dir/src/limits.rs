//! Filesystem and snapshot count limits.
//!
//! Every directory counts the directories with a dataset below it and the
//! snapshots taken of itself or any descendant. A limit set on a directory
//! bounds the matching count across its whole subtree. Counts change only
//! in syncing context; limits are checked in both contexts.

use crate::accounting::adjust;
use crate::node::DirPhys;
use crate::tree::{DirHold, DirTree};
use serde::{Deserialize, Serialize};
use std::fmt;
use strata_error::{Result, StrataError};
use strata_types::{DirId, Txg};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitKind {
    Filesystem,
    Snapshot,
}

impl LimitKind {
    fn count(self, phys: &DirPhys) -> u64 {
        match self {
            Self::Filesystem => phys.filesystem_count,
            Self::Snapshot => phys.snapshot_count,
        }
    }

    fn count_mut(self, phys: &mut DirPhys) -> &mut u64 {
        match self {
            Self::Filesystem => &mut phys.filesystem_count,
            Self::Snapshot => &mut phys.snapshot_count,
        }
    }

    fn limit(self, phys: &DirPhys) -> Option<u64> {
        match self {
            Self::Filesystem => phys.filesystem_limit,
            Self::Snapshot => phys.snapshot_limit,
        }
    }

    fn limit_mut(self, phys: &mut DirPhys) -> &mut Option<u64> {
        match self {
            Self::Filesystem => &mut phys.filesystem_limit,
            Self::Snapshot => &mut phys.snapshot_limit,
        }
    }

    fn field(self) -> &'static str {
        match self {
            Self::Filesystem => "filesystem_count",
            Self::Snapshot => "snapshot_count",
        }
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Filesystem => f.write_str("filesystem"),
            Self::Snapshot => f.write_str("snapshot"),
        }
    }
}

impl DirTree {
    /// Fail with `QuotaExceeded` if adding `delta` to the `kind` count of
    /// `dir` or any ancestor would pass a limit. The walk stops before
    /// `ancestor`: a move below it leaves its subtree total unchanged.
    pub fn check_count_limit(&self, dir: &DirHold, kind: LimitKind, delta: u64, ancestor: Option<DirId>) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        for node in self.chain(&dir.node) {
            if Some(node.id) == ancestor {
                break;
            }
            let state = node.state.lock();
            let Some(limit) = kind.limit(&state.phys) else {
                continue;
            };
            let count = kind.count(&state.phys);
            if count.saturating_add(delta) > limit {
                debug!(
                    target: "strata::dir",
                    dir = node.id.0,
                    kind = %kind,
                    count,
                    delta,
                    limit,
                    "count_limit_denied"
                );
                return Err(StrataError::QuotaExceeded);
            }
        }
        Ok(())
    }

    /// Add `delta` to the `kind` count of `dir` and every ancestor.
    pub fn adjust_count(&self, dir: &DirHold, kind: LimitKind, delta: i64, txg: Txg) {
        if delta == 0 {
            return;
        }
        for node in self.chain(&dir.node) {
            adjust(kind.count_mut(&mut node.state.lock().phys), delta, node.id, kind.field());
            self.shared.dirty.add(txg, node.id);
        }
        trace!(target: "strata::dir", dir = dir.id().0, kind = %kind, delta, "count_adjusted");
    }

    /// Set or clear (`None`) the `kind` limit of `dir`. A limit below the
    /// current count is accepted; it only stops further growth.
    pub fn apply_count_limit(&self, dir: &DirHold, kind: LimitKind, limit: Option<u64>, txg: Txg) {
        *kind.limit_mut(&mut dir.node.state.lock().phys) = limit;
        self.shared.dirty.add(txg, dir.id());
    }

    #[must_use]
    pub fn count(&self, dir: &DirHold, kind: LimitKind) -> u64 {
        kind.count(&dir.node.state.lock().phys)
    }
}
