//! Directory records and the in-memory node that caches one.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use strata_error::{Result, StrataError};
use strata_types::{BlockPtr, DirId, TXG_SIZE, Txg, USED_CATEGORY_COUNT, UsedCategory};

/// `used_breakdown` is maintained for this directory.
pub const DIR_FLAG_USED_BREAKDOWN: u64 = 1 << 0;

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

/// Durable state of one directory, stored as an object in the meta object
/// set whose object id equals the directory id.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DirPhys {
    pub parent: Option<DirId>,
    pub name: String,
    pub creation_txg: Txg,
    pub used_bytes: u64,
    pub compressed_bytes: u64,
    pub uncompressed_bytes: u64,
    /// Zero means no quota.
    pub quota: u64,
    pub reserved: u64,
    pub flags: u64,
    pub used_breakdown: [u64; USED_CATEGORY_COUNT],
    pub children: BTreeMap<String, DirId>,
    /// Directories with a dataset anywhere below this one.
    #[serde(default)]
    pub filesystem_count: u64,
    /// Snapshots of this directory's dataset and of every descendant's.
    #[serde(default)]
    pub snapshot_count: u64,
    /// `None` means unlimited.
    #[serde(default)]
    pub filesystem_limit: Option<u64>,
    #[serde(default)]
    pub snapshot_limit: Option<u64>,
    /// Head dataset. `None` for the meta object set's own directory, whose
    /// usage is exempt from ancestor quotas.
    pub dataset: Option<DatasetPhys>,
}

/// Head dataset attached to a directory.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DatasetPhys {
    /// Root block of the head object set; `None` until first synced.
    pub root: Option<BlockPtr>,
    pub referenced_bytes: u64,
    /// Zero means no reference quota.
    pub ref_quota: u64,
    /// Generation of the most recent snapshot. Blocks born at or before it
    /// are shared with that snapshot.
    pub prev_snap_txg: Txg,
    pub snapshots: BTreeMap<String, SnapshotPhys>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPhys {
    pub txg: Txg,
    pub root: Option<BlockPtr>,
    pub referenced_bytes: u64,
}

impl DirPhys {
    /// A fresh directory with breakdown tracking enabled.
    #[must_use]
    pub fn new(parent: Option<DirId>, name: &str, creation_txg: Txg, with_dataset: bool) -> Self {
        Self {
            parent,
            name: name.to_owned(),
            creation_txg,
            flags: DIR_FLAG_USED_BREAKDOWN,
            dataset: with_dataset.then(DatasetPhys::default),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn tracks_breakdown(&self) -> bool {
        self.flags & DIR_FLAG_USED_BREAKDOWN != 0
    }

    #[must_use]
    pub fn breakdown(&self, category: UsedCategory) -> u64 {
        self.used_breakdown[category.index()]
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|err| StrataError::Format(err.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|err| StrataError::Format(err.to_string()))
    }
}

// ---------------------------------------------------------------------------
// In-memory node
// ---------------------------------------------------------------------------

/// Back-reference into the directory arena. Valid only while the slot's
/// generation matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DirRef {
    pub(crate) id: DirId,
    pub(crate) slot: usize,
    pub(crate) generation: u32,
}

#[derive(Debug)]
pub(crate) struct DirState {
    pub(crate) phys: DirPhys,
    /// Open-context estimates per generation. Signed: an estimate may be
    /// withdrawn by a later negative `willuse`.
    pub(crate) towrite: [i64; TXG_SIZE],
    /// Outstanding admission tickets per generation.
    pub(crate) tempreserved: [u64; TXG_SIZE],
}

impl DirState {
    pub(crate) fn towrite_total(&self) -> u64 {
        let total: i64 = self.towrite.iter().sum();
        u64::try_from(total).unwrap_or(0)
    }

    pub(crate) fn tempreserved_total(&self) -> u64 {
        self.tempreserved.iter().sum()
    }
}

/// One cached directory. The state lock protects only this node's fields;
/// walks up the tree take one node lock at a time, child before parent.
#[derive(Debug)]
pub(crate) struct DirNode {
    pub(crate) id: DirId,
    pub(crate) parent: RwLock<Option<DirRef>>,
    /// Outstanding [`DirHold`](crate::DirHold)s plus one per cached child.
    pub(crate) holds: AtomicU32,
    pub(crate) state: Mutex<DirState>,
}

impl DirNode {
    pub(crate) fn new(id: DirId, parent: Option<DirRef>, phys: DirPhys) -> Self {
        Self {
            id,
            parent: RwLock::new(parent),
            holds: AtomicU32::new(0),
            state: Mutex::new(DirState {
                phys,
                towrite: [0; TXG_SIZE],
                tempreserved: [0; TXG_SIZE],
            }),
        }
    }

    pub(crate) fn hold_count(&self) -> u32 {
        self.holds.load(Ordering::Acquire)
    }

    pub(crate) fn add_hold(&self) {
        self.holds.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn drop_hold(&self) {
        let prev = self.holds.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "directory {} hold underflow", self.id);
    }

    pub(crate) fn parent_ref(&self) -> Option<DirRef> {
        *self.parent.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::{BlockLocation, UsedCategory};

    #[test]
    fn new_directory_tracks_breakdown() {
        let phys = DirPhys::new(Some(DirId(2)), "home", Txg(4), true);
        assert!(phys.tracks_breakdown());
        assert_eq!(phys.parent, Some(DirId(2)));
        assert!(phys.dataset.is_some());
        assert_eq!(phys.breakdown(UsedCategory::Child), 0);
        assert!(DirPhys::new(None, "$MOS", Txg(1), false).dataset.is_none());
    }

    #[test]
    fn record_round_trips_through_json() {
        let mut phys = DirPhys::new(None, "tank", Txg(1), true);
        phys.used_bytes = 4096;
        phys.used_breakdown[UsedCategory::Head.index()] = 4096;
        phys.children.insert("a".to_owned(), DirId(7));
        if let Some(ds) = phys.dataset.as_mut() {
            ds.root = Some(BlockPtr {
                location: BlockLocation(3),
                physical_size: 512,
                logical_size: 512,
                birth: Txg(1),
                checksum: 7,
            });
            ds.snapshots.insert(
                "monday".to_owned(),
                SnapshotPhys {
                    txg: Txg(1),
                    root: None,
                    referenced_bytes: 512,
                },
            );
        }
        let bytes = phys.encode().expect("encode");
        assert_eq!(DirPhys::decode(&bytes).expect("decode"), phys);
    }

    #[test]
    fn garbage_record_is_a_format_error() {
        assert!(matches!(
            DirPhys::decode(b"not json"),
            Err(StrataError::Format(_))
        ));
    }

    #[test]
    fn towrite_total_never_negative() {
        let node = DirNode::new(DirId(5), None, DirPhys::default());
        let mut state = node.state.lock();
        state.towrite = [10, -30, 0, 0];
        assert_eq!(state.towrite_total(), 0);
        state.towrite = [10, 5, 0, 0];
        assert_eq!(state.towrite_total(), 15);
    }
}
