//! Object descriptors.

use serde::{Deserialize, Serialize};
use strata_types::{BlockPtr, OBJECT_DESCRIPTOR_BYTES, ObjectId, Owner, TXG_SIZE, Txg};

/// User and group byte usage of this object is reflected in the
/// accounting tables.
pub const OBJECT_FLAG_USER_ACCOUNTED: u32 = 1 << 0;
/// User and group object counts reflect this object.
pub const OBJECT_FLAG_USEROBJ_ACCOUNTED: u32 = 1 << 1;
/// Project usage (and, with the flag above, project object count) reflects
/// this object.
pub const OBJECT_FLAG_PROJECT_ACCOUNTED: u32 = 1 << 2;

/// Durable descriptor of one object, stored in the meta table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectPhys {
    pub id: ObjectId,
    pub owner: Owner,
    pub flags: u32,
    pub data: Option<BlockPtr>,
    pub logical_size: u64,
}

impl ObjectPhys {
    #[must_use]
    pub fn new(id: ObjectId, owner: Owner) -> Self {
        Self {
            id,
            owner,
            flags: 0,
            data: None,
            logical_size: 0,
        }
    }

    /// Bytes charged to the owning identities: the descriptor plus the
    /// object's allocated data.
    #[must_use]
    pub fn charged_bytes(&self) -> u64 {
        OBJECT_DESCRIPTOR_BYTES + self.data.map_or(0, |bp| bp.physical_size)
    }
}

/// Open-context changes to one object within one generation.
#[derive(Debug, Default)]
pub(crate) struct Pending {
    pub(crate) txg: Txg,
    pub(crate) data: Option<Vec<u8>>,
    pub(crate) owner: Option<Owner>,
    pub(crate) free: bool,
    /// Re-evaluate accounting flags even if nothing else changed.
    pub(crate) touch: bool,
}

/// In-memory object: last synced descriptor plus per-generation changes.
#[derive(Debug)]
pub(crate) struct Dnode {
    pub(crate) phys: ObjectPhys,
    /// The descriptor is present in the synced meta table.
    pub(crate) on_disk: bool,
    /// Contents as of the last sync, once read or written.
    pub(crate) cached: Option<Vec<u8>>,
    pub(crate) pending: [Option<Pending>; TXG_SIZE],
}

impl Dnode {
    pub(crate) fn new(phys: ObjectPhys, on_disk: bool) -> Self {
        Self {
            phys,
            on_disk,
            cached: None,
            pending: std::array::from_fn(|_| None),
        }
    }

    /// Pending changes for `txg`, created on first use. Returns whether the
    /// object was already dirty in that generation.
    pub(crate) fn dirty(&mut self, txg: Txg) -> (&mut Pending, bool) {
        let slot = &mut self.pending[txg.slot()];
        let was_dirty = slot.is_some();
        let pending = slot.get_or_insert_with(|| Pending {
            txg,
            ..Pending::default()
        });
        (pending, was_dirty)
    }

    /// Freed in some in-flight generation.
    pub(crate) fn is_freed(&self) -> bool {
        self.pending.iter().flatten().any(|p| p.free)
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.pending.iter().any(Option::is_some)
    }

    /// Newest pending contents, if any generation has written the object.
    pub(crate) fn newest_pending_data(&self) -> Option<&Vec<u8>> {
        self.pending
            .iter()
            .flatten()
            .filter(|p| p.data.is_some())
            .max_by_key(|p| p.txg)
            .and_then(|p| p.data.as_ref())
    }

    /// Newest owner, pending or synced.
    pub(crate) fn current_owner(&self) -> Owner {
        self.pending
            .iter()
            .flatten()
            .filter(|p| p.owner.is_some())
            .max_by_key(|p| p.txg)
            .and_then(|p| p.owner)
            .unwrap_or(self.phys.owner)
    }
}
