//! Background userspace-accounting upgrade.
//!
//! Object sets written before accounting was enabled carry objects whose
//! usage was never charged to any identity. The upgrade walks every object,
//! dirtying each one in the open generation so the next sync charges it,
//! then records the completion flags in the root block.

use crate::{ObjsetHandle, Pool};
use std::sync::Arc;
use strata_error::{Result, StrataError};
use strata_objset::{ObjectSet, ObjsetKind, UpgradeStatus};
use strata_txg::GenerationManager;
use tracing::{info, warn};

impl Pool {
    /// Start upgrading `handle`'s object set in a background thread. The
    /// handle must own the object set.
    pub fn start_userspace_upgrade(&self, handle: &ObjsetHandle) -> Result<()> {
        self.ensure_active()?;
        if handle.kind() != ObjsetKind::Head {
            return Err(StrataError::ReadOnly);
        }
        if !handle.is_owner() {
            return Err(StrataError::InvalidArgument(
                "userspace upgrade requires an owned object set".to_owned(),
            ));
        }
        let features = handle.features();
        if !features.user_accounting {
            return Err(StrataError::NotSupported("user accounting is disabled".to_owned()));
        }
        let complete = features.complete_flags();
        if handle.root_phys().flags & complete == complete {
            handle.set_upgrade_status(UpgradeStatus::Complete);
            return Ok(());
        }

        let objset = Arc::clone(handle.objset());
        let generations = Arc::clone(&self.generations);
        handle.install_upgrade(move || {
            let dir = objset.dir().id();
            std::thread::Builder::new()
                .name(format!("strata-upgrade-{dir}"))
                .spawn(move || run_upgrade(&objset, &generations))
                .map_err(StrataError::from)
        })
    }

    /// Ask a running upgrade to exit and wait for it. Returns the final
    /// status.
    pub fn stop_userspace_upgrade(&self, handle: &ObjsetHandle) -> UpgradeStatus {
        handle.request_upgrade_exit(true);
        join_upgrade(handle.objset())
    }

    /// Wait for a running upgrade to finish on its own.
    pub fn wait_userspace_upgrade(&self, handle: &ObjsetHandle) -> UpgradeStatus {
        join_upgrade(handle.objset())
    }

    #[must_use]
    pub fn userspace_upgrade_status(&self, handle: &ObjsetHandle) -> UpgradeStatus {
        handle.upgrade_status()
    }
}

pub(crate) fn join_upgrade(objset: &ObjectSet) -> UpgradeStatus {
    if let Some(thread) = objset.take_upgrade_handle() {
        if thread.join().is_err() {
            objset.set_upgrade_status(UpgradeStatus::Failed("upgrade thread panicked".to_owned()));
        }
    }
    objset.upgrade_status()
}

fn run_upgrade(objset: &ObjectSet, generations: &Arc<GenerationManager>) {
    let dir = objset.dir().id();
    let ids = objset.object_ids();
    let total = ids.len() as u64;
    info!(dir = dir.0, total, "userspace upgrade started");
    objset.set_upgrade_status(UpgradeStatus::Running { done: 0, total });

    for (done, id) in (0_u64..).zip(ids) {
        if objset.upgrade_should_exit() {
            info!(dir = dir.0, done, total, "userspace upgrade interrupted");
            objset.set_upgrade_status(UpgradeStatus::Interrupted { done });
            return;
        }
        let hold = generations.hold_open();
        match objset.touch_object(hold.txg(), id) {
            // Freed since the walk started.
            Ok(()) | Err(StrataError::NotFound(_)) => {}
            Err(err) => {
                warn!(dir = dir.0, object = id.0, error = %err, "userspace upgrade failed");
                objset.set_upgrade_status(UpgradeStatus::Failed(err.to_string()));
                return;
            }
        }
        drop(hold);
        objset.set_upgrade_status(UpgradeStatus::Running { done: done + 1, total });
    }

    let hold = generations.hold_open();
    objset.set_root_flags(hold.txg(), objset.features().complete_flags());
    drop(hold);
    objset.set_upgrade_status(UpgradeStatus::Complete);
    info!(dir = dir.0, total, "userspace upgrade complete");
}
