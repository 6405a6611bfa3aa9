//! Transactions.

use crate::Pool;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use strata_dir::{ReserveRequest, Ticket};
use strata_error::{Result, StrataError};
use strata_objset::ObjectSet;
use strata_txg::TxgHold;
use strata_types::{ObjectId, Owner, Txg};
use tracing::{debug, trace};

/// A unit of work against one dataset.
///
/// A transaction is first assigned to the open generation, which pins the
/// generation and admits the declared write size against every quota and
/// reservation above the dataset's directory. Objects may then be created,
/// written and freed; all of it lands in the assigned generation. Committing
/// (or dropping) the transaction releases the admission ticket and the pin.
///
/// Changes already applied are not rolled back on drop.
pub struct Tx<'p> {
    pool: &'p Pool,
    objset: Arc<ObjectSet>,
    hold: Option<TxgHold>,
    ticket: Option<Ticket>,
    committed: bool,
}

impl std::fmt::Debug for Tx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tx")
            .field("dir", &self.objset.dir().id())
            .field("txg", &self.txg())
            .field("committed", &self.committed)
            .finish()
    }
}

impl<'p> Tx<'p> {
    pub(crate) fn new(pool: &'p Pool, objset: Arc<ObjectSet>) -> Self {
        Self {
            pool,
            objset,
            hold: None,
            ticket: None,
            committed: false,
        }
    }

    /// Assign to the open generation, admitting `physical` allocated bytes
    /// (and `logical` buffered bytes) against the directory chain.
    ///
    /// On `Restart` the transaction stays unassigned; wait for the
    /// generation to sync and try again, or use [`assign_wait`].
    ///
    /// [`assign_wait`]: Self::assign_wait
    pub fn assign(&mut self, logical: u64, physical: u64, net_free: bool) -> Result<Txg> {
        if self.hold.is_some() {
            return Err(StrataError::InvalidArgument("transaction already assigned".to_owned()));
        }
        self.pool.ensure_active()?;
        let hold = self.pool.generations.hold_open();
        let txg = hold.txg();
        let req = ReserveRequest {
            logical,
            physical,
            net_free,
            // Only writes that grow on disk past their buffered size can
            // push the head dataset over its reference quota.
            check_ref_quota: physical > logical,
        };
        let ticket = self.pool.reserve_in(self.objset.dir(), txg, req)?;
        trace!(target: "strata::core", dir = self.objset.dir().id().0, txg = txg.0, physical, "tx_assigned");
        self.hold = Some(hold);
        self.ticket = Some(ticket);
        Ok(txg)
    }

    /// Like [`assign`](Self::assign), but on `Restart` wait for the
    /// generation to sync and retry.
    pub fn assign_wait(&mut self, logical: u64, physical: u64, net_free: bool) -> Result<Txg> {
        loop {
            let open = self.pool.open_txg();
            match self.assign(logical, physical, net_free) {
                Err(StrataError::Restart) => {
                    debug!(target: "strata::core", txg = open.0, "tx_restart_wait");
                    self.pool.wait_synced(open)?;
                }
                other => return other,
            }
        }
    }

    /// The generation this transaction is assigned to.
    #[must_use]
    pub fn txg(&self) -> Option<Txg> {
        self.hold.as_ref().map(TxgHold::txg)
    }

    fn assigned(&self) -> Result<Txg> {
        self.txg()
            .ok_or_else(|| StrataError::InvalidArgument("transaction not assigned".to_owned()))
    }

    #[must_use]
    pub fn objset(&self) -> &Arc<ObjectSet> {
        &self.objset
    }

    pub fn create_object(&self, owner: Owner) -> Result<ObjectId> {
        let txg = self.assigned()?;
        self.objset.create_object(txg, owner)
    }

    /// Replace `id`'s contents.
    pub fn write(&self, id: ObjectId, data: &[u8]) -> Result<()> {
        let txg = self.assigned()?;
        let delta = self.objset.write_object(txg, id, data)?;
        self.pool.tree.willuse(self.objset.dir(), delta, txg);
        self.pool.dirty_bytes.fetch_add(data.len() as u64, Ordering::AcqRel);
        Ok(())
    }

    pub fn set_owner(&self, id: ObjectId, owner: Owner) -> Result<()> {
        let txg = self.assigned()?;
        self.objset.set_owner(txg, id, owner)
    }

    pub fn free(&self, id: ObjectId) -> Result<()> {
        let txg = self.assigned()?;
        let delta = self.objset.free_object(txg, id)?;
        self.pool.tree.willuse(self.objset.dir(), delta, txg);
        Ok(())
    }

    /// Finish the transaction, releasing its admission ticket and its pin on
    /// the generation.
    pub fn commit(mut self) {
        self.committed = true;
        self.finish();
    }

    fn finish(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.pool.cancel(&ticket);
        }
        self.hold = None;
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if !self.committed && self.hold.is_some() {
            debug!(target: "strata::core", dir = self.objset.dir().id().0, txg = ?self.txg(), "tx_abandoned");
        }
        self.finish();
    }
}
