//! Open-context admission control.
//!
//! [`DirTree::reserve`] walks from the target directory to the root,
//! promising `physical` bytes at each level against that level's quota,
//! and rolls only the dampened delta into the next level up. The promises
//! are collected in a [`Ticket`] that is released exactly once: when the
//! generation's authoritative accounting has been applied, or when the
//! caller gives up.

use crate::node::{DatasetPhys, DirNode};
use crate::parent_delta;
use crate::space::{PoolSpace, WriteThrottle};
use crate::tree::{DirHold, DirTree, to_signed};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use strata_error::{Result, StrataError};
use strata_types::Txg;
use tracing::{debug, error, trace};

/// Size of the write asking for admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReserveRequest {
    /// Uncompressed bytes, charged to the write throttle.
    pub logical: u64,
    /// Allocated bytes, charged up the directory chain.
    pub physical: u64,
    /// The operation is expected to free more than it allocates.
    pub net_free: bool,
    /// Also check the head dataset's reference quota.
    pub check_ref_quota: bool,
}

#[derive(Debug)]
enum TicketEntry {
    Throttle { throttle: Arc<WriteThrottle>, bytes: u64 },
    Pool { space: Arc<PoolSpace>, bytes: u64 },
    Dir { hold: DirHold, bytes: u64 },
}

#[derive(Debug)]
struct TicketInner {
    txg: Txg,
    entries: Mutex<Vec<TicketEntry>>,
    released: AtomicBool,
}

impl TicketInner {
    fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        let entries = std::mem::take(&mut *self.entries.lock());
        for entry in entries {
            match entry {
                TicketEntry::Throttle { throttle, bytes } => throttle.release(bytes),
                TicketEntry::Pool { space, bytes } => space.tempreserve_clear(self.txg, bytes),
                TicketEntry::Dir { hold, bytes } => {
                    let mut state = hold.node.state.lock();
                    let slot = &mut state.tempreserved[self.txg.slot()];
                    if *slot < bytes {
                        debug_assert!(false, "directory {} tempreserved underflow", hold.id());
                        error!(dir = hold.id().0, tempreserved = *slot, bytes, "tempreserved underflow clamped");
                    }
                    *slot = slot.saturating_sub(bytes);
                }
            }
        }
        true
    }
}

impl Drop for TicketInner {
    fn drop(&mut self) {
        self.release();
    }
}

/// Promises made by one admission. Clones share the same promises.
#[derive(Debug, Clone)]
pub struct Ticket {
    inner: Arc<TicketInner>,
}

impl Ticket {
    fn new(txg: Txg) -> Self {
        Self {
            inner: Arc::new(TicketInner {
                txg,
                entries: Mutex::new(Vec::new()),
                released: AtomicBool::new(false),
            }),
        }
    }

    fn push(&self, entry: TicketEntry) {
        self.inner.entries.lock().push(entry);
    }

    #[must_use]
    pub fn txg(&self) -> Txg {
        self.inner.txg
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Bytes promised at each directory level, leaf first.
    #[must_use]
    pub fn levels(&self) -> Vec<(strata_types::DirId, u64)> {
        self.inner
            .entries
            .lock()
            .iter()
            .filter_map(|entry| match entry {
                TicketEntry::Dir { hold, bytes } => Some((hold.id(), *bytes)),
                _ => None,
            })
            .collect()
    }

    /// Return every promise. Only the first call on any clone has an
    /// effect; later calls return `false`.
    pub fn release(&self) -> bool {
        self.inner.release()
    }
}

impl DirTree {
    /// Admit a write of `req` against `dir` in generation `txg`.
    ///
    /// Denials: [`StrataError::Restart`] when in-flight work at the binding
    /// level may still free room, [`StrataError::NoSpace`] when the pool
    /// clamp at the root binds, [`StrataError::QuotaExceeded`] otherwise.
    /// On any denial every promise made by this attempt is withdrawn.
    pub fn reserve(&self, dir: &DirHold, txg: Txg, req: ReserveRequest) -> Result<Ticket> {
        let ticket = Ticket::new(txg);
        if req.physical == 0 {
            return Ok(ticket);
        }
        if req.logical > 0 {
            self.shared.throttle.reserve(req.logical)?;
            ticket.push(TicketEntry::Throttle {
                throttle: Arc::clone(&self.shared.throttle),
                bytes: req.logical,
            });
        }

        let mut node = Arc::clone(&dir.node);
        let mut asize = req.physical;
        let mut ignore_quota = false;
        let mut first = true;
        loop {
            let parent = self.parent_node(&node);
            let level = Level {
                is_root: parent.is_none(),
                asize,
                ignore_quota,
                first,
            };
            let parent_rsrv = match self.reserve_level(&node, txg, req, level) {
                Ok(up) => up,
                Err(err) => {
                    ticket.release();
                    return Err(err);
                }
            };
            ticket.push(TicketEntry::Dir {
                hold: DirHold::new(Arc::clone(&node)),
                bytes: asize,
            });
            match parent {
                Some(parent) if parent_rsrv > 0 => {
                    // The meta object set's own directory is exempt from the
                    // quotas of its ancestors.
                    ignore_quota = node.state.lock().phys.dataset.is_none();
                    node = parent;
                    asize = parent_rsrv;
                    first = false;
                }
                Some(_) => break,
                None => {
                    self.shared.space.tempreserve(txg, asize);
                    ticket.push(TicketEntry::Pool {
                        space: Arc::clone(&self.shared.space),
                        bytes: asize,
                    });
                    break;
                }
            }
        }
        trace!(target: "strata::dir", dir = dir.id().0, txg = txg.0, physical = req.physical, "tempreserve_admitted");
        Ok(ticket)
    }

    /// Check and charge one level. Returns the amount to charge the parent.
    fn reserve_level(&self, node: &DirNode, txg: Txg, req: ReserveRequest, level: Level) -> Result<u64> {
        let mut state = node.state.lock();
        let est_inflight = state.towrite_total().saturating_add(state.tempreserved_total());
        let used_on_disk = state.phys.used_bytes;

        if level.first && req.check_ref_quota && !req.net_free {
            if let Some(ds) = state.phys.dataset.as_ref() {
                check_dataset_ref_quota(ds, est_inflight, level.asize).inspect_err(|err| {
                    debug!(target: "strata::dir", dir = node.id.0, error = %err, "ref_quota_denied");
                })?;
            }
        }

        let mut quota = if level.ignore_quota || req.net_free || state.phys.quota == 0 {
            u64::MAX
        } else {
            state.phys.quota
        };
        let mut pool_bound = false;
        let deferred = self.shared.space.deferred();
        if level.is_root {
            let avail = self.shared.space.adjusted_size(req.net_free).saturating_sub(deferred);
            if avail < quota {
                quota = avail;
                pool_bound = true;
            }
        }

        let projected = used_on_disk
            .saturating_add(est_inflight)
            .saturating_add(level.asize);
        if projected > quota {
            let fits_after_frees = used_on_disk.saturating_add(level.asize) <= quota.saturating_add(deferred);
            let err = if est_inflight > 0 || (pool_bound && deferred > 0 && fits_after_frees) {
                StrataError::Restart
            } else if pool_bound {
                StrataError::NoSpace
            } else {
                StrataError::QuotaExceeded
            };
            debug!(
                target: "strata::dir",
                dir = node.id.0,
                used_on_disk,
                est_inflight,
                asize = level.asize,
                quota,
                error = %err,
                "tempreserve_denied"
            );
            return Err(err);
        }

        let slot = &mut state.tempreserved[txg.slot()];
        *slot = slot.saturating_add(level.asize);
        let up = parent_delta(
            used_on_disk.saturating_add(est_inflight),
            state.phys.reserved,
            to_signed(level.asize),
        );
        Ok(u64::try_from(up).unwrap_or(0))
    }
}

#[derive(Debug, Clone, Copy)]
struct Level {
    is_root: bool,
    asize: u64,
    ignore_quota: bool,
    first: bool,
}

fn check_dataset_ref_quota(ds: &DatasetPhys, est_inflight: u64, asize: u64) -> Result<()> {
    if ds.ref_quota == 0 {
        return Ok(());
    }
    let projected = ds
        .referenced_bytes
        .saturating_add(est_inflight)
        .saturating_add(asize);
    if projected > ds.ref_quota {
        return Err(if est_inflight > 0 {
            StrataError::Restart
        } else {
            StrataError::QuotaExceeded
        });
    }
    Ok(())
}
