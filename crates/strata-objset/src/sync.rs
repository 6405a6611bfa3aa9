//! Syncing-context half of [`ObjectSet`].

use crate::dnode::{Dnode, ObjectPhys, Pending};
use crate::userquota::{DeltaCache, SyncedEntry, Usage, fold_entries, merge_caches};
use crate::{ObjectSet, ObjsetKind, ReconcileReport, RootPhys, SyncState, TableState, encode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use strata_block::{rewrite_sealed, write_sealed};
use strata_error::{Result, StrataError};
use strata_txg::fan_out;
use strata_types::{BlockPtr, IdentityKind, ObjectId, Txg, UsedCategory};
use tracing::{debug, trace};

/// Result of one sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    /// Newly published root pointer.
    pub root: BlockPtr,
    /// Root published before this generation began syncing.
    pub prev_root: Option<BlockPtr>,
    /// Blocks no longer referenced by the live state whose release must
    /// wait until the generation is durable.
    pub displaced: Vec<BlockPtr>,
    /// Change in referenced bytes since the previous pass.
    pub referenced_delta: i64,
    pub reconcile: ReconcileReport,
}

/// Space changes accumulated by one sync task before they are charged to
/// the owning directory.
#[derive(Debug, Default, Clone, Copy)]
struct SpaceDelta {
    used: i64,
    compressed: i64,
    uncompressed: i64,
    to_snapshots: i64,
    referenced: i64,
}

fn signed(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

fn usage_of(phys: &ObjectPhys) -> Usage {
    Usage {
        owner: phys.owner,
        bytes: phys.charged_bytes(),
        flags: phys.flags,
    }
}

impl ObjectSet {
    /// Steps 1 to 3 of the commit pipeline for `txg`.
    pub fn begin_sync(&self, txg: Txg) -> Result<()> {
        if self.kind() == ObjsetKind::Snapshot {
            return Err(StrataError::ReadOnly);
        }
        {
            let mut state = self.sync_state.lock();
            if state.as_ref().is_none_or(|s| s.txg != txg) {
                *state = Some(SyncState {
                    txg,
                    prev_root: self.root_ptr(),
                });
            }
        }
        debug!(target: "strata::objset", dir = self.dir().id().0, txg = txg.0, "sync_begin");
        self.sync_specials(txg)?;
        self.sync_dirty_objects(txg)
    }

    /// Steps 4 and 5: reconcile identity usage, then write and publish the
    /// root block.
    pub fn end_sync(&self, txg: Txg) -> Result<SyncOutcome> {
        let prev_root = match self.sync_state.lock().as_ref() {
            Some(state) if state.txg == txg => state.prev_root,
            _ => {
                return Err(StrataError::InvalidArgument(format!(
                    "end_sync of {txg} without begin_sync"
                )));
            }
        };
        let reconcile = if self.accounting_active() {
            self.reconcile(txg)?
        } else {
            for shard in 0..self.synced.shard_count() {
                drop(self.synced.take(shard));
            }
            ReconcileReport::default()
        };
        let root = self.write_root(txg)?;
        let displaced = std::mem::take(&mut *self.displaced.lock());
        let referenced_delta = self.referenced_delta.swap(0, Ordering::AcqRel);
        debug!(
            target: "strata::objset",
            dir = self.dir().id().0,
            txg = txg.0,
            displaced = displaced.len(),
            referenced_delta,
            user_increments = reconcile.increments_for(IdentityKind::User),
            "sync_end"
        );
        Ok(SyncOutcome {
            root,
            prev_root,
            displaced,
            referenced_delta,
            reconcile,
        })
    }

    // ── Block lifecycle ─────────────────────────────────────────────────────

    /// Write `payload` as the new version of a block. A block born in this
    /// generation is overwritten in place when it fits; anything else gets a
    /// fresh allocation and the old version is released.
    fn cow_write(&self, old: Option<BlockPtr>, payload: &[u8], txg: Txg, delta: &mut SpaceDelta) -> Result<BlockPtr> {
        if let Some(old) = old.filter(|bp| bp.birth == txg) {
            if let Some(bp) = rewrite_sealed(self.store(), &old, payload)? {
                return Ok(bp);
            }
        }
        let granularity = self.config().block_granularity;
        let bp = write_sealed(self.store(), payload, payload.len() as u64, granularity, txg)?;
        delta.used += signed(bp.physical_size);
        delta.compressed += signed(bp.physical_size);
        delta.uncompressed += signed(bp.logical_size);
        delta.referenced += signed(bp.physical_size);
        if let Some(old) = old {
            self.kill(old, txg, delta);
        }
        Ok(bp)
    }

    /// Drop a block from the live state. Blocks newer than the latest
    /// snapshot are released (immediately if born this generation); older
    /// blocks stay charged, now to snapshots.
    fn kill(&self, bp: BlockPtr, txg: Txg, delta: &mut SpaceDelta) {
        delta.referenced -= signed(bp.physical_size);
        if bp.birth > self.prev_snap_txg() {
            delta.used -= signed(bp.physical_size);
            delta.compressed -= signed(bp.physical_size);
            delta.uncompressed -= signed(bp.logical_size);
            if bp.birth == txg {
                self.store().free_block(bp.location);
            } else {
                self.displaced.lock().push(bp);
            }
        } else {
            delta.to_snapshots += signed(bp.physical_size);
        }
    }

    fn charge(&self, delta: SpaceDelta, txg: Txg) {
        self.tree().diduse(
            self.dir(),
            UsedCategory::Head,
            delta.used,
            delta.compressed,
            delta.uncompressed,
            txg,
        );
        self.tree()
            .transfer(self.dir(), delta.to_snapshots, UsedCategory::Head, UsedCategory::Snap, txg);
        self.referenced_delta.fetch_add(delta.referenced, Ordering::AcqRel);
    }

    // ── Step 2: specials ────────────────────────────────────────────────────

    fn meta_table(&self) -> Result<Vec<u8>> {
        let table: Vec<ObjectPhys> = self
            .objects
            .read()
            .values()
            .filter_map(|dnode| {
                let dn = dnode.lock();
                dn.on_disk.then(|| dn.phys.clone())
            })
            .collect();
        encode(&table)
    }

    /// Copy-on-write the meta table and accounting tables so later writes
    /// in this generation land in place.
    fn sync_specials(&self, txg: Txg) -> Result<()> {
        let mut delta = SpaceDelta::default();
        let mut specials = self.specials.lock();
        let meta = self.meta_table()?;
        specials.meta = Some(self.cow_write(specials.meta, &meta, txg, &mut delta)?);
        for state in specials.tables.iter_mut().flatten() {
            let payload = encode(&state.table)?;
            state.bp = Some(self.cow_write(state.bp, &payload, txg, &mut delta)?);
        }
        drop(specials);
        self.charge(delta, txg);
        Ok(())
    }

    // ── Step 3: dirty objects ───────────────────────────────────────────────

    fn sync_dirty_objects(&self, txg: Txg) -> Result<()> {
        let dirty = &self.dirty[txg.slot()];
        let features = self.features();
        let accounting = self.accounting_active();
        let freed: Mutex<Vec<ObjectId>> = Mutex::new(Vec::new());
        let threads = self.config().sync_threads;
        fan_out(threads, dirty.shard_count(), |shard| {
            let mut delta = SpaceDelta::default();
            let mut entries = Vec::new();
            let result = (|| -> Result<()> {
                for id in dirty.take(shard) {
                    let Some(dnode) = self.objects.read().get(&id).cloned() else {
                        continue;
                    };
                    let mut dn = dnode.lock();
                    let Some(pending) = dn.pending[txg.slot()].take() else {
                        continue;
                    };
                    let object_flags = if self.kind() == ObjsetKind::Head {
                        features.object_flags()
                    } else {
                        0
                    };
                    let entry = self.sync_object(&mut dn, pending, object_flags, txg, &mut delta)?;
                    if entry.new.is_none() && !dn.is_dirty() {
                        freed.lock().push(id);
                    }
                    if accounting {
                        entries.push((id, entry));
                    }
                }
                Ok(())
            })();
            self.charge(delta, txg);
            for (id, entry) in entries {
                self.synced.push(id, entry);
            }
            result
        })?;
        let freed = freed.into_inner();
        if !freed.is_empty() {
            let mut objects = self.objects.write();
            for id in &freed {
                objects.remove(id);
            }
            trace!(target: "strata::objset", freed = freed.len(), txg = txg.0, "objects_released");
        }
        Ok(())
    }

    fn sync_object(
        &self,
        dn: &mut Dnode,
        pending: Pending,
        object_flags: u32,
        txg: Txg,
        delta: &mut SpaceDelta,
    ) -> Result<SyncedEntry> {
        let old = dn.on_disk.then(|| usage_of(&dn.phys));
        if pending.free {
            if let Some(bp) = dn.phys.data.take() {
                self.kill(bp, txg, delta);
            }
            dn.on_disk = false;
            dn.cached = None;
            return Ok(SyncedEntry { old, new: None });
        }
        if let Some(owner) = pending.owner {
            dn.phys.owner = owner;
        }
        if let Some(data) = pending.data {
            let bp = self.cow_write(dn.phys.data, &data, txg, delta)?;
            dn.phys.data = Some(bp);
            dn.phys.logical_size = data.len() as u64;
            dn.cached = Some(data);
        }
        dn.phys.flags = object_flags;
        dn.on_disk = true;
        trace!(target: "strata::objset", object = dn.phys.id.0, txg = txg.0, touch = pending.touch, "object_synced");
        Ok(SyncedEntry {
            old,
            new: Some(usage_of(&dn.phys)),
        })
    }

    // ── Step 4: reconciliation ──────────────────────────────────────────────

    fn reconcile(&self, txg: Txg) -> Result<ReconcileReport> {
        let shards = self.synced.shard_count();
        let caches: Vec<Mutex<DeltaCache>> = (0..shards).map(|_| Mutex::new(DeltaCache::new())).collect();
        let folded = AtomicU64::new(0);
        fan_out(self.config().sync_threads, shards, |shard| {
            let entries = self.synced.take(shard);
            folded.fetch_add(entries.len() as u64, Ordering::Relaxed);
            *caches[shard].lock() = fold_entries(&entries);
            Ok(())
        })?;
        let merged = merge_caches(caches.into_iter().map(Mutex::into_inner));

        let mut report = ReconcileReport {
            entries: folded.into_inner(),
            ..ReconcileReport::default()
        };
        let mut specials = self.specials.lock();
        for ((kind, key), delta) in merged {
            let state = specials.tables[kind.index()].get_or_insert_with(TableState::default);
            state.table.increment(&key, delta);
            state.increments += 1;
            report.increments[kind.index()] += 1;
        }
        trace!(
            target: "strata::objset",
            txg = txg.0,
            entries = report.entries,
            increments = ?report.increments,
            "reconciled"
        );
        Ok(report)
    }

    // ── Step 5: root ────────────────────────────────────────────────────────

    fn write_root(&self, txg: Txg) -> Result<BlockPtr> {
        let mut delta = SpaceDelta::default();
        let mut specials = self.specials.lock();
        let meta = self.meta_table()?;
        specials.meta = Some(self.cow_write(specials.meta, &meta, txg, &mut delta)?);
        let mut tables: [Option<BlockPtr>; 3] = [None; 3];
        for kind in IdentityKind::ALL {
            if let Some(state) = specials.tables[kind.index()].as_mut() {
                let payload = encode(&state.table)?;
                state.bp = Some(self.cow_write(state.bp, &payload, txg, &mut delta)?);
                tables[kind.index()] = state.bp;
            }
        }
        let fill = self
            .objects
            .read()
            .values()
            .filter(|dnode| dnode.lock().on_disk)
            .count() as u64;

        let mut root = self.root.write();
        let flags = root.phys.flags | self.pending_flags.lock()[txg.slot()];
        let phys = RootPhys {
            meta: specials.meta,
            tables,
            fill,
            txg,
            flags,
            next_object: self.next_object_hint(),
        };
        let ptr = self.cow_write(root.ptr, &encode(&phys)?, txg, &mut delta)?;
        drop(specials);
        self.charge(delta, txg);
        if flags != root.phys.flags {
            debug!(target: "strata::objset", dir = self.dir().id().0, flags, "root_flags_updated");
        }
        root.ptr = Some(ptr);
        root.phys = phys;
        drop(root);
        self.pending_flags.lock()[txg.slot()] = 0;
        self.extra_dirty.lock()[txg.slot()] = false;
        Ok(ptr)
    }
}
