//! Space accounting on the directory tree.
//!
//! Every walk is iterative and takes one node lock at a time, child before
//! parent. The amount handed to a parent is always computed by
//! [`parent_delta`] from the child's own `used` and `reserved` while the
//! child's lock is held.

use crate::node::{DatasetPhys, DirNode, DirPhys};
use crate::parent_delta;
use crate::tree::{DirHold, DirTree, to_signed};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strata_error::{Result, StrataError};
use strata_types::{DirId, Txg, USED_CATEGORY_COUNT, UsedCategory};
use tracing::{debug, error, trace};

/// Add `delta` to an unsigned counter. Underflow is a contract violation:
/// fatal in debug builds, clamped to zero and logged otherwise.
pub(crate) fn adjust(value: &mut u64, delta: i64, dir: DirId, field: &'static str) {
    match value.checked_add_signed(delta) {
        Some(v) => *value = v,
        None => {
            debug_assert!(false, "directory {dir}: {field} {value} + {delta} out of range");
            error!(dir = dir.0, field, value = *value, delta, "accounting underflow clamped");
            *value = if delta < 0 { 0 } else { u64::MAX };
        }
    }
}

fn check_breakdown(phys: &mut DirPhys, dir: DirId) {
    if !phys.tracks_breakdown() {
        return;
    }
    let sum: u64 = phys.used_breakdown.iter().sum();
    if sum != phys.used_bytes {
        debug_assert_eq!(sum, phys.used_bytes, "directory {dir}: breakdown does not sum to used");
        error!(
            dir = dir.0,
            sum,
            used = phys.used_bytes,
            "used breakdown mismatch, folding difference into head"
        );
        let others: u64 = phys.used_breakdown[1..].iter().sum();
        phys.used_breakdown[UsedCategory::Head.index()] = phys.used_bytes.saturating_sub(others);
    }
}

/// Point-in-time view of one directory's space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirStats {
    pub id: DirId,
    pub name: String,
    pub used: u64,
    pub logical_used: u64,
    pub compressed: u64,
    pub quota: u64,
    pub reservation: u64,
    pub available: u64,
    pub used_by_dataset: u64,
    pub used_by_snapshots: u64,
    /// Child usage plus unused child reservations.
    pub used_by_children: u64,
    /// `None` when breakdown tracking is off.
    pub breakdown: Option<[u64; USED_CATEGORY_COUNT]>,
    pub referenced: u64,
    pub ref_quota: u64,
    /// Uncompressed over compressed bytes, as a percentage.
    pub compression_ratio: u64,
    pub filesystem_count: u64,
    pub filesystem_limit: Option<u64>,
    pub snapshot_count: u64,
    pub snapshot_limit: Option<u64>,
}

impl DirTree {
    // ── Open context ────────────────────────────────────────────────────────

    /// Record an optimistic estimate of `delta` bytes against `txg` and roll
    /// the dampened amount up the ancestor chain. Never fails.
    pub fn willuse(&self, dir: &DirHold, delta: i64, txg: Txg) {
        let mut node = Arc::clone(&dir.node);
        let mut delta = delta;
        loop {
            let up = {
                let mut state = node.state.lock();
                let est_used = state.phys.used_bytes.saturating_add(state.towrite_total());
                let up = parent_delta(est_used, state.phys.reserved, delta);
                state.towrite[txg.slot()] = state.towrite[txg.slot()].saturating_add(delta);
                up
            };
            self.shared.dirty.add(txg, node.id);
            trace!(target: "strata::dir", dir = node.id.0, delta, up, txg = txg.0, "willuse");
            if up == 0 {
                return;
            }
            match self.parent_node(&node) {
                Some(parent) => {
                    node = parent;
                    delta = up;
                }
                None => return,
            }
        }
    }

    // ── Syncing context ─────────────────────────────────────────────────────

    /// Apply real byte deltas to `dir` under `category` and roll them up.
    pub fn diduse(&self, dir: &DirHold, category: UsedCategory, used: i64, compressed: i64, uncompressed: i64, txg: Txg) {
        self.diduse_node(Arc::clone(&dir.node), category, used, compressed, uncompressed, txg);
    }

    pub(crate) fn diduse_node(
        &self,
        start: Arc<DirNode>,
        category: UsedCategory,
        used: i64,
        compressed: i64,
        uncompressed: i64,
        txg: Txg,
    ) {
        let mut node = start;
        let mut from = category;
        let mut to = category;
        let mut used = used;
        let mut tonew = 0_i64;
        loop {
            if used == 0 && tonew == 0 && compressed == 0 && uncompressed == 0 {
                return;
            }
            let accounted = {
                let mut state = node.state.lock();
                let phys = &mut state.phys;
                let accounted = parent_delta(phys.used_bytes, phys.reserved, used);
                adjust(&mut phys.used_bytes, used, node.id, "used_bytes");
                adjust(&mut phys.compressed_bytes, compressed, node.id, "compressed_bytes");
                adjust(&mut phys.uncompressed_bytes, uncompressed, node.id, "uncompressed_bytes");
                if phys.tracks_breakdown() {
                    // Net the two moves on `from` so it never dips below zero
                    // between them.
                    adjust(&mut phys.used_breakdown[from.index()], used - tonew, node.id, "breakdown");
                    if tonew != 0 {
                        adjust(&mut phys.used_breakdown[to.index()], tonew, node.id, "breakdown");
                    }
                    check_breakdown(phys, node.id);
                }
                accounted
            };
            self.shared.dirty.add(txg, node.id);
            trace!(target: "strata::dir", dir = node.id.0, used, accounted, ?from, "diduse");
            let Some(parent) = self.parent_node(&node) else {
                return;
            };
            // The parent sees the dampened delta as child-reserved space, of
            // which the child's full delta is actual child usage.
            node = parent;
            tonew = used;
            used = accounted;
            from = UsedCategory::ChildReserved;
            to = UsedCategory::Child;
        }
    }

    /// Move already-accounted bytes between breakdown buckets of `dir`.
    pub fn transfer(&self, dir: &DirHold, delta: i64, from: UsedCategory, to: UsedCategory, txg: Txg) {
        if delta == 0 {
            return;
        }
        {
            let mut state = dir.node.state.lock();
            let phys = &mut state.phys;
            if !phys.tracks_breakdown() {
                return;
            }
            adjust(&mut phys.used_breakdown[from.index()], -delta, dir.id(), "breakdown");
            adjust(&mut phys.used_breakdown[to.index()], delta, dir.id(), "breakdown");
            check_breakdown(phys, dir.id());
        }
        self.shared.dirty.add(txg, dir.id());
    }

    /// Zero the open-context estimate for `txg` and return the record to
    /// persist. `None` if the directory was destroyed.
    pub fn sync_directory(&self, id: DirId, txg: Txg) -> Option<DirPhys> {
        let hold = self.try_hold_cached(id)?;
        let mut state = hold.node.state.lock();
        let slot = txg.slot();
        if state.tempreserved[slot] != 0 {
            debug_assert!(false, "directory {id}: tempreserved nonzero at sync of {txg}");
            error!(
                dir = id.0,
                txg = txg.0,
                tempreserved = state.tempreserved[slot],
                "tempreserved not drained at sync, clamped"
            );
            state.tempreserved[slot] = 0;
        }
        state.towrite[slot] = 0;
        Some(state.phys.clone())
    }

    fn try_hold_cached(&self, id: DirId) -> Option<DirHold> {
        if self.is_cached(id) { self.hold(id).ok() } else { None }
    }

    // ── Space queries ───────────────────────────────────────────────────────

    /// Space available under `dir`, assuming `delta` were already applied at
    /// `ancestor`. Walks from the root down so each level is clamped by what
    /// its parent offers.
    #[must_use]
    pub fn available_space(&self, dir: &DirHold, ancestor: Option<DirId>, delta: i64, on_disk_only: bool) -> u64 {
        let chain = self.chain(&dir.node);
        let root_idx = chain.len() - 1;
        let mut parent_space = u64::MAX;
        for (idx, node) in chain.iter().enumerate().rev() {
            let state = node.state.lock();
            let phys = &state.phys;
            let mut quota = if phys.quota == 0 { u64::MAX } else { phys.quota };
            let mut used = phys.used_bytes;
            if !on_disk_only {
                used = used.saturating_add(state.towrite_total());
            }
            if idx == root_idx {
                quota = quota.min(self.shared.space.adjusted_size(false));
            }
            if phys.reserved > used && parent_space != u64::MAX {
                parent_space = parent_space.saturating_add(phys.reserved - used);
            }
            if ancestor == Some(node.id) {
                debug_assert!(delta <= 0, "hypothetical delta must free space");
                used = used.saturating_add_signed(delta);
                if parent_space != u64::MAX {
                    parent_space = parent_space.saturating_add_signed(delta.saturating_neg());
                }
            }
            parent_space = if used > quota {
                0
            } else {
                parent_space.min(quota - used)
            };
        }
        parent_space
    }

    /// Delta that reaches `ancestor` if `delta` were applied at `node`.
    pub(crate) fn would_change(&self, node: &Arc<DirNode>, delta: i64, ancestor: DirId) -> i64 {
        let mut node = Arc::clone(node);
        let mut delta = delta;
        while node.id != ancestor {
            delta = {
                let state = node.state.lock();
                parent_delta(state.phys.used_bytes, state.phys.reserved, delta)
            };
            match self.parent_node(&node) {
                Some(parent) => node = parent,
                None => break,
            }
        }
        delta
    }

    // ── Properties ──────────────────────────────────────────────────────────

    /// A quota may not drop below the reservation or current usage. Pending
    /// estimates count only when none are outstanding in open context, or
    /// when checked from syncing context.
    pub fn check_quota(&self, dir: &DirHold, quota: u64, syncing: bool) -> Result<()> {
        if quota == 0 {
            return Ok(());
        }
        let state = dir.node.state.lock();
        let towrite = state.towrite_total();
        if (syncing || towrite == 0)
            && (quota < state.phys.reserved || quota < state.phys.used_bytes.saturating_add(towrite))
        {
            debug!(target: "strata::dir", dir = dir.id().0, quota, "set_quota_denied");
            return Err(StrataError::NoSpace);
        }
        Ok(())
    }

    pub fn apply_quota(&self, dir: &DirHold, quota: u64, txg: Txg) {
        dir.node.state.lock().phys.quota = quota;
        self.shared.dirty.add(txg, dir.id());
    }

    /// Growing a reservation must fit in what the parent can offer, and a
    /// reservation may not exceed the directory's own quota.
    pub fn check_reservation(&self, dir: &DirHold, reservation: u64) -> Result<()> {
        let (used, old, quota) = {
            let state = dir.node.state.lock();
            (state.phys.used_bytes, state.phys.reserved, state.phys.quota)
        };
        let avail = match self.parent(dir) {
            Some(parent) => self.available_space(&parent, None, 0, false),
            None => self.shared.space.adjusted_size(false).saturating_sub(used),
        };
        let grow = used.max(reservation).saturating_sub(used.max(old));
        if grow > 0 && (grow > avail || (quota > 0 && reservation > quota)) {
            debug!(
                target: "strata::dir",
                dir = dir.id().0,
                reservation,
                grow,
                avail,
                "set_reservation_denied"
            );
            return Err(StrataError::NoSpace);
        }
        Ok(())
    }

    pub fn apply_reservation(&self, dir: &DirHold, reservation: u64, txg: Txg) {
        let delta = {
            let mut state = dir.node.state.lock();
            let used = state.phys.used_bytes;
            let delta = to_signed(used.max(reservation)) - to_signed(used.max(state.phys.reserved));
            state.phys.reserved = reservation;
            delta
        };
        self.shared.dirty.add(txg, dir.id());
        if let Some(parent) = self.parent(dir) {
            self.diduse(&parent, UsedCategory::ChildReserved, delta, 0, 0, txg);
        }
    }

    pub fn check_ref_quota(&self, dir: &DirHold, ref_quota: u64) -> Result<()> {
        let state = dir.node.state.lock();
        let Some(ds) = state.phys.dataset.as_ref() else {
            return Err(StrataError::InvalidArgument(format!(
                "directory {} has no dataset",
                dir.id()
            )));
        };
        if ref_quota != 0 && ref_quota < ds.referenced_bytes {
            return Err(StrataError::NoSpace);
        }
        Ok(())
    }

    pub fn apply_ref_quota(&self, dir: &DirHold, ref_quota: u64, txg: Txg) {
        if let Some(ds) = dir.node.state.lock().phys.dataset.as_mut() {
            ds.ref_quota = ref_quota;
        }
        self.shared.dirty.add(txg, dir.id());
    }

    // ── Record access ───────────────────────────────────────────────────────

    /// Copy of the current record.
    #[must_use]
    pub fn phys(&self, dir: &DirHold) -> DirPhys {
        dir.node.state.lock().phys.clone()
    }

    /// Read the head dataset record.
    pub fn with_dataset<R>(&self, dir: &DirHold, f: impl FnOnce(&DatasetPhys) -> R) -> Option<R> {
        dir.node.state.lock().phys.dataset.as_ref().map(f)
    }

    /// Mutate the head dataset record from syncing context.
    pub fn update_dataset<R>(&self, dir: &DirHold, txg: Txg, f: impl FnOnce(&mut DatasetPhys) -> R) -> Result<R> {
        let out = {
            let mut state = dir.node.state.lock();
            let ds = state
                .phys
                .dataset
                .as_mut()
                .ok_or_else(|| StrataError::InvalidArgument(format!("directory {} has no dataset", dir.id())))?;
            f(ds)
        };
        self.shared.dirty.add(txg, dir.id());
        Ok(out)
    }

    #[must_use]
    pub fn towrite(&self, dir: &DirHold) -> u64 {
        dir.node.state.lock().towrite_total()
    }

    #[must_use]
    pub fn tempreserved(&self, dir: &DirHold, txg: Txg) -> u64 {
        dir.node.state.lock().tempreserved[txg.slot()]
    }

    #[must_use]
    pub fn tempreserved_total(&self, dir: &DirHold) -> u64 {
        dir.node.state.lock().tempreserved_total()
    }

    #[must_use]
    pub fn stats(&self, dir: &DirHold) -> DirStats {
        let available = self.available_space(dir, None, 0, true);
        let name = self.name_of(dir);
        let state = dir.node.state.lock();
        let phys = &state.phys;
        let breakdown = phys.tracks_breakdown().then_some(phys.used_breakdown);
        let (dataset, snapshots, children) = match breakdown {
            Some(b) => (
                b[UsedCategory::Head.index()],
                b[UsedCategory::Snap.index()],
                b[UsedCategory::Child.index()] + b[UsedCategory::ChildReserved.index()],
            ),
            None => (phys.used_bytes, 0, 0),
        };
        let (referenced, ref_quota) = phys
            .dataset
            .as_ref()
            .map_or((0, 0), |ds| (ds.referenced_bytes, ds.ref_quota));
        DirStats {
            id: dir.id(),
            name,
            used: phys.used_bytes,
            logical_used: phys.uncompressed_bytes,
            compressed: phys.compressed_bytes,
            quota: phys.quota,
            reservation: phys.reserved,
            available,
            used_by_dataset: dataset,
            used_by_snapshots: snapshots,
            used_by_children: children,
            breakdown,
            referenced,
            ref_quota,
            compression_ratio: compression_ratio(phys.compressed_bytes, phys.uncompressed_bytes),
            filesystem_count: phys.filesystem_count,
            filesystem_limit: phys.filesystem_limit,
            snapshot_count: phys.snapshot_count,
            snapshot_limit: phys.snapshot_limit,
        }
    }
}

/// `uncompressed * 100 / compressed`, or 100 when nothing is written.
#[must_use]
pub fn compression_ratio(compressed: u64, uncompressed: u64) -> u64 {
    if compressed == 0 {
        100
    } else {
        let ratio = u128::from(uncompressed) * 100 / u128::from(compressed);
        u64::try_from(ratio).unwrap_or(u64::MAX)
    }
}
