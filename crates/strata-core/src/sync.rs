//! Generation close.
//!
//! One call to [`Pool::sync_generation`] quiesces the open generation and
//! runs it to durability in a fixed order: stray tickets, dataset object
//! sets, sync tasks, then directory records and the meta object set until
//! they stop changing, the uberblock, deferred frees, and finally eviction.

use crate::{Pool, PoolDirectory, encode};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use strata_error::{Result, StrataError};
use strata_objset::ObjectSet;
use strata_types::{BlockPtr, ObjectId, Txg};
use tracing::{debug, error, info, trace, warn};

impl Pool {
    // ── Sync tasks ──────────────────────────────────────────────────────────

    /// Run an administrative change in syncing context and wait for it.
    ///
    /// `check` runs first in open context (`syncing == false`), where a
    /// failure returns without touching the generation, and again right
    /// before `apply` while the generation syncs.
    pub(crate) fn sync_task<R, C, A>(&self, what: &'static str, check: C, apply: A) -> Result<R>
    where
        R: Send + 'static,
        C: Fn(&Pool, bool) -> Result<()> + Send + 'static,
        A: FnOnce(&Pool, Txg) -> Result<R> + Send + 'static,
    {
        self.ensure_active()?;
        check(self, false).inspect_err(|err| {
            debug!(target: "strata::core", task = what, error = %err, "sync_task_rejected");
        })?;
        let result: Arc<Mutex<Option<Result<R>>>> = Arc::new(Mutex::new(None));
        let txg = {
            let hold = self.generations.hold_open();
            let out = Arc::clone(&result);
            self.sync_tasks.lock()[hold.txg().slot()].push(Box::new(move |pool: &Pool, txg: Txg| {
                let outcome = check(pool, true).and_then(|()| apply(pool, txg));
                let fatal = matches!(&outcome, Err(err) if err.is_durability_fault());
                if let Err(err) = &outcome {
                    debug!(target: "strata::core", task = what, txg = txg.0, error = %err, "sync_task_failed");
                }
                *out.lock() = Some(outcome);
                if fatal { Err(StrataError::Suspended) } else { Ok(()) }
            }));
            hold.txg()
        };
        let waited = self.wait_synced(txg);
        if let Some(outcome) = result.lock().take() {
            return outcome;
        }
        waited?;
        Err(StrataError::Suspended)
    }

    // ── Generation close ────────────────────────────────────────────────────

    /// Close the open generation and make it durable. Returns the synced
    /// generation.
    ///
    /// Must not be called while the caller itself holds an assigned [`Tx`],
    /// since quiescing waits for every hold on the generation to drop.
    ///
    /// [`Tx`]: crate::Tx
    pub fn sync_generation(&self) -> Result<Txg> {
        let _guard = self.sync_lock.lock();
        self.sync_locked()
    }

    /// Sync generations until `txg` is durable.
    pub fn wait_synced(&self, txg: Txg) -> Result<()> {
        loop {
            let _guard = self.sync_lock.lock();
            if self.generations.is_synced(txg) {
                return Ok(());
            }
            self.sync_locked()?;
        }
    }

    /// Sync if the interval has elapsed or enough data is dirty.
    pub fn tick(&self) -> Result<Option<Txg>> {
        if !self.generations.should_sync(self.dirty_bytes.load(Ordering::Acquire)) {
            return Ok(None);
        }
        self.sync_generation().map(Some)
    }

    fn sync_locked(&self) -> Result<Txg> {
        self.ensure_active()?;
        let txg = self.generations.close_open();
        match self.sync_body(txg) {
            Ok(()) => {
                self.generations.mark_synced(txg);
                let root = self.tree.phys(&self.root_dir);
                info!(txg = txg.0, used = root.used_bytes, deferred = self.tree.space().deferred(), "generation synced");
                self.evict_idle();
                Ok(txg)
            }
            Err(err) => {
                self.suspended.store(true, Ordering::Release);
                self.generations.abandon(txg);
                error!(txg = txg.0, error = %err, "sync failed, pool suspended");
                Err(err)
            }
        }
    }

    fn sync_body(&self, txg: Txg) -> Result<()> {
        let tickets = std::mem::take(&mut self.tickets.lock()[txg.slot()]);
        let stray = tickets.iter().filter(|ticket| ticket.release()).count();
        if stray > 0 {
            debug!(target: "strata::core", txg = txg.0, stray, "stray_tickets_released");
        }
        self.dirty_bytes.store(0, Ordering::Release);

        let dirty: Vec<Arc<ObjectSet>> = self
            .objsets
            .lock()
            .values()
            .filter(|os| os.is_dirty(txg))
            .cloned()
            .collect();
        debug!(target: "strata::core", txg = txg.0, objsets = dirty.len(), "sync_datasets");
        for objset in &dirty {
            self.sync_dataset(objset, txg)?;
        }

        let tasks = std::mem::take(&mut self.sync_tasks.lock()[txg.slot()]);
        for task in tasks {
            task(self, txg)?;
        }

        self.sync_meta(txg)?;

        let mos_root = self
            .mos
            .root_ptr()
            .ok_or_else(|| StrataError::Format("meta object set has no root".to_owned()))?;
        *self.uberblock.write() = Some(crate::Uberblock { txg, mos_root });
        self.release_deferred(txg);
        Ok(())
    }

    /// Run one dataset object set through the commit pipeline and record its
    /// new root in its directory.
    pub(crate) fn sync_dataset(&self, objset: &ObjectSet, txg: Txg) -> Result<()> {
        objset.begin_sync(txg)?;
        let outcome = objset.end_sync(txg)?;
        self.tree.update_dataset(objset.dir(), txg, |ds| {
            ds.root = Some(outcome.root);
            ds.referenced_bytes = ds.referenced_bytes.saturating_add_signed(outcome.referenced_delta);
        })?;
        trace!(
            target: "strata::core",
            dir = objset.dir().id().0,
            txg = txg.0,
            displaced = outcome.displaced.len(),
            "dataset_synced"
        );
        self.defer_frees(txg, outcome.displaced);
        Ok(())
    }

    /// Write dirty directory records into the meta object set and sync it,
    /// pass after pass, until nothing is left dirty.
    fn sync_meta(&self, txg: Txg) -> Result<()> {
        let mut pass = 0;
        loop {
            pass += 1;
            self.sync_directories(txg)?;
            self.write_pool_directory(txg)?;
            if !self.mos.is_dirty(txg) {
                break;
            }
            self.mos.begin_sync(txg)?;
            let outcome = self.mos.end_sync(txg)?;
            self.defer_frees(txg, outcome.displaced);
            trace!(target: "strata::core", txg = txg.0, pass, "meta_pass");
            if pass >= self.config.max_sync_passes {
                let leftover = self.tree.take_dirty(txg);
                if !leftover.is_empty() {
                    warn!(txg = txg.0, passes = pass, leftover = leftover.len(), "meta sync did not converge");
                    for id in leftover {
                        if let Ok(dir) = self.tree.hold(id) {
                            self.tree.mark_dirty(&dir, txg.next());
                        }
                    }
                }
                break;
            }
        }
        Ok(())
    }

    fn sync_directories(&self, txg: Txg) -> Result<()> {
        for id in self.tree.take_dirty(txg) {
            let Some(phys) = self.tree.sync_directory(id, txg) else {
                continue;
            };
            self.mos.write_object(txg, ObjectId(id.0), &phys.encode()?)?;
        }
        Ok(())
    }

    fn write_pool_directory(&self, txg: Txg) -> Result<()> {
        let current = PoolDirectory {
            root_dir: self.root_dir.id(),
            mos_dir: self.mos_dir.id(),
            next_dir: self.next_dir.load(Ordering::Acquire),
        };
        let mut written = self.pool_directory.lock();
        if *written == Some(current) {
            return Ok(());
        }
        self.mos.write_object(txg, ObjectId::POOL_DIRECTORY, &encode(&current)?)?;
        *written = Some(current);
        Ok(())
    }

    // ── Deferred frees ──────────────────────────────────────────────────────

    /// Hold displaced blocks until two more generations are durable.
    pub(crate) fn defer_frees(&self, txg: Txg, blocks: Vec<BlockPtr>) {
        if blocks.is_empty() {
            return;
        }
        let bytes: u64 = blocks.iter().map(|bp| bp.physical_size).sum();
        self.tree.space().defer_free(bytes);
        let mut deferred = self.deferred.lock();
        match deferred.back_mut() {
            Some((last, list)) if *last == txg => list.extend(blocks),
            _ => deferred.push_back((txg, blocks)),
        }
    }

    fn release_deferred(&self, txg: Txg) {
        let mut deferred = self.deferred.lock();
        while deferred.front().is_some_and(|(t, _)| t.0 + 2 <= txg.0) {
            let Some((born, blocks)) = deferred.pop_front() else {
                break;
            };
            let bytes: u64 = blocks.iter().map(|bp| bp.physical_size).sum();
            for bp in &blocks {
                self.store.free_block(bp.location);
            }
            self.tree.space().reclaim_deferred(bytes);
            trace!(target: "strata::core", from = born.0, txg = txg.0, blocks = blocks.len(), bytes, "deferred_freed");
        }
    }

    // ── Eviction ────────────────────────────────────────────────────────────

    fn evict_idle(&self) {
        let victims: Vec<Arc<ObjectSet>> = {
            let mut objsets = self.objsets.lock();
            let ids: Vec<_> = objsets
                .iter()
                .filter(|(_, os)| Arc::strong_count(os) == 1 && os.is_evictable() && !os.is_owned())
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| objsets.remove(id)).collect()
        };
        for objset in &victims {
            objset.evict();
        }
        drop(victims);
        let dirs = self.tree.evict_idle();
        if dirs > 0 {
            trace!(target: "strata::core", dirs, "idle_directories_evicted");
        }
    }
}
