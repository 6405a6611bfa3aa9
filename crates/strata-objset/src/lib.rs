#![forbid(unsafe_code)]
//! Object sets and the per-generation commit pipeline.
//!
//! An [`ObjectSet`] is the in-memory form of one dataset's objects (or of a
//! read-only snapshot of them, or of the pool's meta object set). Open
//! context mutates objects against a generation; those changes sit in
//! per-generation sharded worklists until the generation syncs.
//!
//! ## Commit pipeline
//!
//! [`ObjectSet::begin_sync`] and [`ObjectSet::end_sync`] run the five steps
//! for one generation:
//!
//! 1. Remember the previous root pointer.
//! 2. Copy-on-write the meta table and accounting tables, serially.
//! 3. Fan out over the dirty shards, writing each object's new version and
//!    charging the owning directory. Join.
//! 4. If per-identity accounting is on, fan out over the synced shards,
//!    fold per-object ownership deltas, merge, and apply one increment per
//!    key. Join.
//! 5. Rewrite the specials with their final contents, write the root block,
//!    and publish it.
//!
//! Steps 1 to 3 run in `begin_sync`, steps 4 and 5 in `end_sync`. The pair
//! may run several times for one generation (the meta object set converges
//! over passes); blocks born in the generation being synced are rewritten
//! in place on later passes, so a pass that changes nothing charges nothing.

mod dnode;
mod sublist;
mod sync;
pub mod userquota;

pub use dnode::{
    OBJECT_FLAG_PROJECT_ACCOUNTED, OBJECT_FLAG_USER_ACCOUNTED, OBJECT_FLAG_USEROBJ_ACCOUNTED, ObjectPhys,
};
pub use sync::SyncOutcome;
pub use userquota::{AccountingTable, ReconcileReport};

use dnode::Dnode;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::thread::JoinHandle;
use strata_block::{BlockStore, CHECKSUM_TRAILER_BYTES, physical_size, read_sealed};
use strata_dir::{DirHold, DirPhys, DirRecordSource, DirTree};
use strata_error::{Result, StrataError};
use strata_types::{BlockPtr, DirId, IdentityKind, ObjectId, Owner, TXG_SIZE, Txg, object_count_key, usage_key};
use sublist::Sublists;
use tracing::{debug, info, trace};
use userquota::SyncedEntry;

/// User and group byte accounting covers every object.
pub const ROOT_FLAG_USERACCOUNTING_COMPLETE: u64 = 1 << 0;
/// User and group object counts cover every object.
pub const ROOT_FLAG_USEROBJACCOUNTING_COMPLETE: u64 = 1 << 1;
/// Project accounting covers every object.
pub const ROOT_FLAG_PROJECTQUOTA_COMPLETE: u64 = 1 << 2;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Pool features that drive per-identity accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// Per-user and per-group byte usage. Default: on.
    pub user_accounting: bool,
    /// Per-identity object counts. Default: on.
    pub object_accounting: bool,
    /// Per-project usage. Default: on.
    pub project_accounting: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            user_accounting: true,
            object_accounting: true,
            project_accounting: true,
        }
    }
}

impl FeatureFlags {
    #[must_use]
    pub fn none() -> Self {
        Self {
            user_accounting: false,
            object_accounting: false,
            project_accounting: false,
        }
    }

    /// Per-object accounting flags recorded for an object synced under
    /// these features.
    #[must_use]
    pub fn object_flags(&self) -> u32 {
        if !self.user_accounting {
            return 0;
        }
        let mut flags = OBJECT_FLAG_USER_ACCOUNTED;
        if self.object_accounting {
            flags |= OBJECT_FLAG_USEROBJ_ACCOUNTED;
        }
        if self.project_accounting {
            flags |= OBJECT_FLAG_PROJECT_ACCOUNTED;
        }
        flags
    }

    /// Root flags claiming complete accounting under these features.
    #[must_use]
    pub fn complete_flags(&self) -> u64 {
        if !self.user_accounting {
            return 0;
        }
        let mut flags = ROOT_FLAG_USERACCOUNTING_COMPLETE;
        if self.object_accounting {
            flags |= ROOT_FLAG_USEROBJACCOUNTING_COMPLETE;
        }
        if self.project_accounting {
            flags |= ROOT_FLAG_PROJECTQUOTA_COMPLETE;
        }
        flags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjsetConfig {
    /// Shards per dirty worklist. Default: 8.
    pub sync_shards: usize,
    /// Upper bound on parallel sync tasks. Default: 4.
    pub sync_threads: usize,
    /// Physical allocation unit. Default: 512.
    pub block_granularity: u64,
}

impl Default for ObjsetConfig {
    fn default() -> Self {
        Self {
            sync_shards: 8,
            sync_threads: 4,
            block_granularity: 512,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjsetKind {
    /// A dataset's live, writable object set.
    Head,
    /// Read-only view captured by a snapshot.
    Snapshot,
    /// The pool's own object set holding directory records.
    Meta,
}

/// Contents of an object set's root block.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RootPhys {
    pub meta: Option<BlockPtr>,
    /// Accounting tables, indexed by [`IdentityKind::index`].
    pub tables: [Option<BlockPtr>; 3],
    /// Live non-special objects.
    pub fill: u64,
    pub txg: Txg,
    pub flags: u64,
    pub next_object: u64,
}

/// Progress of the userspace accounting upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpgradeStatus {
    NotStarted,
    Running { done: u64, total: u64 },
    Complete,
    Interrupted { done: u64 },
    Failed(String),
}

// ---------------------------------------------------------------------------
// Object set
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub(crate) struct TableState {
    pub(crate) table: AccountingTable,
    pub(crate) bp: Option<BlockPtr>,
    pub(crate) increments: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Specials {
    pub(crate) meta: Option<BlockPtr>,
    pub(crate) tables: [Option<TableState>; 3],
}

#[derive(Debug, Default)]
pub(crate) struct RootState {
    pub(crate) ptr: Option<BlockPtr>,
    pub(crate) phys: RootPhys,
}

#[derive(Debug)]
pub(crate) struct SyncState {
    pub(crate) txg: Txg,
    pub(crate) prev_root: Option<BlockPtr>,
}

#[derive(Debug)]
struct UpgradeSlot {
    status: UpgradeStatus,
    handle: Option<JoinHandle<()>>,
}

type EvictCallback = Box<dyn FnOnce() + Send>;

/// In-memory object container for one dataset, snapshot, or the pool's
/// meta object set.
pub struct ObjectSet {
    kind: ObjsetKind,
    dir: DirHold,
    tree: DirTree,
    store: Arc<dyn BlockStore>,
    config: ObjsetConfig,
    features: RwLock<FeatureFlags>,
    pub(crate) objects: RwLock<BTreeMap<ObjectId, Arc<Mutex<Dnode>>>>,
    next_object: AtomicU64,
    pub(crate) dirty: [Sublists<ObjectId>; TXG_SIZE],
    pub(crate) synced: Sublists<SyncedEntry>,
    pub(crate) specials: Mutex<Specials>,
    pub(crate) root: RwLock<RootState>,
    pub(crate) sync_state: Mutex<Option<SyncState>>,
    /// Specials or root flags need writing even if no object is dirty.
    pub(crate) extra_dirty: Mutex<[bool; TXG_SIZE]>,
    pub(crate) pending_flags: Mutex<[u64; TXG_SIZE]>,
    prev_snap_txg: AtomicU64,
    pub(crate) displaced: Mutex<Vec<BlockPtr>>,
    pub(crate) referenced_delta: AtomicI64,
    holds: AtomicU32,
    owned: AtomicBool,
    evict_callback: Mutex<Option<EvictCallback>>,
    upgrade: Mutex<UpgradeSlot>,
    upgrade_exit: AtomicBool,
}

impl fmt::Debug for ObjectSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectSet")
            .field("kind", &self.kind)
            .field("dir", &self.dir.id())
            .field("objects", &self.objects.read().len())
            .field("root", &self.root.read().ptr)
            .finish_non_exhaustive()
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|err| StrataError::Format(err.to_string()))
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|err| StrataError::Format(err.to_string()))
}

/// Read one object's contents straight from a published root, without
/// instantiating the object set. Used to bootstrap the directory cache on
/// import, before the meta object set's own directory is loaded.
pub fn read_object_at(store: &dyn BlockStore, root: &BlockPtr, id: ObjectId) -> Result<Vec<u8>> {
    let phys: RootPhys = decode(&read_sealed(store, root)?)?;
    let meta = phys
        .meta
        .ok_or_else(|| StrataError::NotFound(format!("object {id}")))?;
    let table: Vec<ObjectPhys> = decode(&read_sealed(store, &meta)?)?;
    let obj = table
        .into_iter()
        .find(|obj| obj.id == id)
        .ok_or_else(|| StrataError::NotFound(format!("object {id}")))?;
    match obj.data {
        Some(bp) => read_sealed(store, &bp),
        None => Ok(Vec::new()),
    }
}

impl ObjectSet {
    fn empty(
        kind: ObjsetKind,
        dir: DirHold,
        tree: DirTree,
        store: Arc<dyn BlockStore>,
        config: ObjsetConfig,
        features: FeatureFlags,
    ) -> Self {
        Self {
            kind,
            dir,
            tree,
            store,
            config,
            features: RwLock::new(features),
            objects: RwLock::new(BTreeMap::new()),
            next_object: AtomicU64::new(ObjectId::POOL_DIRECTORY.0 + 1),
            dirty: std::array::from_fn(|_| Sublists::new(config.sync_shards)),
            synced: Sublists::new(config.sync_shards),
            specials: Mutex::new(Specials::default()),
            root: RwLock::new(RootState::default()),
            sync_state: Mutex::new(None),
            extra_dirty: Mutex::new([false; TXG_SIZE]),
            pending_flags: Mutex::new([0; TXG_SIZE]),
            prev_snap_txg: AtomicU64::new(0),
            displaced: Mutex::new(Vec::new()),
            referenced_delta: AtomicI64::new(0),
            holds: AtomicU32::new(0),
            owned: AtomicBool::new(false),
            evict_callback: Mutex::new(None),
            upgrade: Mutex::new(UpgradeSlot {
                status: UpgradeStatus::NotStarted,
                handle: None,
            }),
            upgrade_exit: AtomicBool::new(false),
        }
    }

    /// A new, empty object set whose first root block is written when `txg`
    /// syncs. Head object sets start with accounting complete for the
    /// features active at creation.
    #[must_use]
    pub fn create(
        kind: ObjsetKind,
        dir: DirHold,
        tree: DirTree,
        store: Arc<dyn BlockStore>,
        config: ObjsetConfig,
        features: FeatureFlags,
        txg: Txg,
    ) -> Self {
        let os = Self::empty(kind, dir, tree, store, config, features);
        if kind == ObjsetKind::Head {
            os.pending_flags.lock()[txg.slot()] |= features.complete_flags();
        }
        os.extra_dirty.lock()[txg.slot()] = true;
        debug!(target: "strata::objset", dir = os.dir.id().0, ?kind, txg = txg.0, "objset_created");
        os
    }

    /// Instantiate an object set from its published root block.
    pub fn open(
        kind: ObjsetKind,
        dir: DirHold,
        tree: DirTree,
        store: Arc<dyn BlockStore>,
        config: ObjsetConfig,
        features: FeatureFlags,
        root: Option<BlockPtr>,
    ) -> Result<Self> {
        let os = Self::empty(kind, dir, tree, store, config, features);
        let Some(root_ptr) = root else {
            return Ok(os);
        };
        let phys: RootPhys = decode(&read_sealed(os.store.as_ref(), &root_ptr)?)?;
        {
            let mut objects = os.objects.write();
            if let Some(meta) = phys.meta.as_ref() {
                let table: Vec<ObjectPhys> = decode(&read_sealed(os.store.as_ref(), meta)?)?;
                for obj in table {
                    objects.insert(obj.id, Arc::new(Mutex::new(Dnode::new(obj, true))));
                }
            }
        }
        {
            let mut specials = os.specials.lock();
            specials.meta = phys.meta;
            for kind in IdentityKind::ALL {
                if let Some(bp) = phys.tables[kind.index()] {
                    let table: AccountingTable = decode(&read_sealed(os.store.as_ref(), &bp)?)?;
                    specials.tables[kind.index()] = Some(TableState {
                        table,
                        bp: Some(bp),
                        increments: 0,
                    });
                }
            }
        }
        os.next_object.store(phys.next_object.max(ObjectId::POOL_DIRECTORY.0 + 1), Ordering::Release);
        let objects = os.objects.read().len();
        *os.root.write() = RootState {
            ptr: Some(root_ptr),
            phys,
        };
        info!(dir = os.dir.id().0, ?kind, objects, "objset opened");
        Ok(os)
    }

    pub(crate) fn next_object_hint(&self) -> u64 {
        self.next_object.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn kind(&self) -> ObjsetKind {
        self.kind
    }

    #[must_use]
    pub fn dir(&self) -> &DirHold {
        &self.dir
    }

    pub(crate) fn tree(&self) -> &DirTree {
        &self.tree
    }

    pub(crate) fn store(&self) -> &dyn BlockStore {
        self.store.as_ref()
    }

    #[must_use]
    pub fn config(&self) -> &ObjsetConfig {
        &self.config
    }

    #[must_use]
    pub fn features(&self) -> FeatureFlags {
        *self.features.read()
    }

    pub fn set_features(&self, features: FeatureFlags) {
        *self.features.write() = features;
    }

    /// Latest published root pointer.
    #[must_use]
    pub fn root_ptr(&self) -> Option<BlockPtr> {
        self.root.read().ptr
    }

    #[must_use]
    pub fn root_phys(&self) -> RootPhys {
        self.root.read().phys.clone()
    }

    pub fn set_prev_snap_txg(&self, txg: Txg) {
        self.prev_snap_txg.store(txg.0, Ordering::Release);
    }

    #[must_use]
    pub fn prev_snap_txg(&self) -> Txg {
        Txg(self.prev_snap_txg.load(Ordering::Acquire))
    }

    fn check_writable(&self) -> Result<()> {
        if self.kind == ObjsetKind::Snapshot {
            return Err(StrataError::ReadOnly);
        }
        Ok(())
    }

    /// Estimated allocation for `len` bytes of object data.
    fn estimate(&self, len: usize) -> i64 {
        let bytes = physical_size((len + CHECKSUM_TRAILER_BYTES) as u64, self.config.block_granularity);
        i64::try_from(bytes).unwrap_or(i64::MAX)
    }

    fn dnode(&self, id: ObjectId) -> Result<Arc<Mutex<Dnode>>> {
        self.objects
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| StrataError::NotFound(format!("object {id}")))
    }

    fn mark_dirty(&self, txg: Txg, id: ObjectId, was_dirty: bool) {
        if !was_dirty {
            self.dirty[txg.slot()].push(id, id);
        }
    }

    // ── Open context ────────────────────────────────────────────────────────

    /// Allocate a new object owned by `owner`.
    pub fn create_object(&self, txg: Txg, owner: Owner) -> Result<ObjectId> {
        self.check_writable()?;
        let id = ObjectId(self.next_object.fetch_add(1, Ordering::AcqRel));
        self.insert_object(txg, id, owner);
        Ok(id)
    }

    /// Create an object at a caller-chosen id.
    pub fn create_object_with_id(&self, txg: Txg, id: ObjectId, owner: Owner) -> Result<()> {
        self.check_writable()?;
        if id.is_special() {
            return Err(StrataError::InvalidArgument(format!("object {id} is reserved")));
        }
        if self.objects.read().contains_key(&id) {
            return Err(StrataError::Exists(format!("object {id}")));
        }
        self.next_object.fetch_max(id.0 + 1, Ordering::AcqRel);
        self.insert_object(txg, id, owner);
        Ok(())
    }

    fn insert_object(&self, txg: Txg, id: ObjectId, owner: Owner) {
        let mut dnode = Dnode::new(ObjectPhys::new(id, owner), false);
        dnode.dirty(txg).0.owner = Some(owner);
        self.objects.write().insert(id, Arc::new(Mutex::new(dnode)));
        self.mark_dirty(txg, id, false);
        trace!(target: "strata::objset", object = id.0, txg = txg.0, "object_created");
    }

    /// Replace an object's contents. Returns the estimated change in
    /// allocated bytes for the caller to pass to `willuse`.
    pub fn write_object(&self, txg: Txg, id: ObjectId, data: &[u8]) -> Result<i64> {
        self.check_writable()?;
        let dnode = self.dnode(id)?;
        let mut dn = dnode.lock();
        if dn.is_freed() {
            return Err(StrataError::NotFound(format!("object {id}")));
        }
        let before = match dn.newest_pending_data() {
            Some(data) => self.estimate(data.len()),
            None => dn
                .phys
                .data
                .map_or(0, |bp| i64::try_from(bp.physical_size).unwrap_or(i64::MAX)),
        };
        let (pending, was_dirty) = dn.dirty(txg);
        pending.data = Some(data.to_vec());
        drop(dn);
        self.mark_dirty(txg, id, was_dirty);
        Ok(self.estimate(data.len()) - before)
    }

    pub fn set_owner(&self, txg: Txg, id: ObjectId, owner: Owner) -> Result<()> {
        self.check_writable()?;
        let dnode = self.dnode(id)?;
        let mut dn = dnode.lock();
        if dn.is_freed() {
            return Err(StrataError::NotFound(format!("object {id}")));
        }
        let (pending, was_dirty) = dn.dirty(txg);
        pending.owner = Some(owner);
        drop(dn);
        self.mark_dirty(txg, id, was_dirty);
        Ok(())
    }

    /// Free an object. Returns the (negative) estimated change in allocated
    /// bytes.
    pub fn free_object(&self, txg: Txg, id: ObjectId) -> Result<i64> {
        self.check_writable()?;
        let dnode = self.dnode(id)?;
        let mut dn = dnode.lock();
        if dn.is_freed() {
            return Err(StrataError::NotFound(format!("object {id}")));
        }
        let freed = match dn.newest_pending_data() {
            Some(data) => self.estimate(data.len()),
            None => dn
                .phys
                .data
                .map_or(0, |bp| i64::try_from(bp.physical_size).unwrap_or(i64::MAX)),
        };
        let (pending, was_dirty) = dn.dirty(txg);
        pending.free = true;
        pending.data = None;
        drop(dn);
        self.mark_dirty(txg, id, was_dirty);
        Ok(-freed)
    }

    /// Dirty an object without changing it, so its accounting is
    /// re-evaluated when `txg` syncs.
    pub fn touch_object(&self, txg: Txg, id: ObjectId) -> Result<()> {
        self.check_writable()?;
        let dnode = self.dnode(id)?;
        let mut dn = dnode.lock();
        if dn.is_freed() {
            return Err(StrataError::NotFound(format!("object {id}")));
        }
        let (pending, was_dirty) = dn.dirty(txg);
        pending.touch = true;
        drop(dn);
        self.mark_dirty(txg, id, was_dirty);
        Ok(())
    }

    /// Newest contents of an object, pending or synced.
    pub fn read_object(&self, id: ObjectId) -> Result<Vec<u8>> {
        let dnode = self.dnode(id)?;
        let mut dn = dnode.lock();
        if dn.is_freed() {
            return Err(StrataError::NotFound(format!("object {id}")));
        }
        if let Some(data) = dn.newest_pending_data() {
            return Ok(data.clone());
        }
        if let Some(data) = dn.cached.as_ref() {
            return Ok(data.clone());
        }
        let Some(bp) = dn.phys.data else {
            return Ok(Vec::new());
        };
        let data = read_sealed(self.store(), &bp)?;
        dn.cached = Some(data.clone());
        Ok(data)
    }

    #[must_use]
    pub fn contains(&self, id: ObjectId) -> bool {
        self.dnode(id).is_ok_and(|dnode| !dnode.lock().is_freed())
    }

    pub fn owner(&self, id: ObjectId) -> Result<Owner> {
        Ok(self.dnode(id)?.lock().current_owner())
    }

    /// Ids of live objects, ascending.
    #[must_use]
    pub fn object_ids(&self) -> Vec<ObjectId> {
        self.objects
            .read()
            .iter()
            .filter(|(_, dnode)| !dnode.lock().is_freed())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Synced descriptor of an object.
    pub fn object_phys(&self, id: ObjectId) -> Result<ObjectPhys> {
        Ok(self.dnode(id)?.lock().phys.clone())
    }

    /// Request a root flag change to be written when `txg` syncs.
    pub fn set_root_flags(&self, txg: Txg, flags: u64) {
        self.pending_flags.lock()[txg.slot()] |= flags;
        self.extra_dirty.lock()[txg.slot()] = true;
    }

    #[must_use]
    pub fn is_dirty(&self, txg: Txg) -> bool {
        !self.dirty[txg.slot()].is_empty() || self.extra_dirty.lock()[txg.slot()]
    }

    #[must_use]
    pub fn is_dirty_any(&self) -> bool {
        (0..TXG_SIZE as u64).any(|slot| self.is_dirty(Txg(slot)))
    }

    // ── Accounting queries ──────────────────────────────────────────────────

    /// Whether per-identity accounting runs when this object set syncs.
    #[must_use]
    pub fn accounting_active(&self) -> bool {
        self.kind == ObjsetKind::Head && self.features().user_accounting
    }

    /// Accounting is known complete for every object.
    #[must_use]
    pub fn userspace_present(&self) -> bool {
        self.root.read().phys.flags & ROOT_FLAG_USERACCOUNTING_COMPLETE != 0
    }

    /// Synced bytes charged to identity `id` of `kind`.
    #[must_use]
    pub fn space_used(&self, kind: IdentityKind, id: u64) -> u64 {
        self.table_value(kind, &usage_key(id))
    }

    /// Synced object count charged to identity `id` of `kind`.
    #[must_use]
    pub fn objects_used(&self, kind: IdentityKind, id: u64) -> u64 {
        self.table_value(kind, &object_count_key(id))
    }

    fn table_value(&self, kind: IdentityKind, key: &str) -> u64 {
        let specials = self.specials.lock();
        let value = specials.tables[kind.index()]
            .as_ref()
            .map_or(0, |t| t.table.get(key));
        u64::try_from(value).unwrap_or(0)
    }

    #[must_use]
    pub fn accounting_entries(&self, kind: IdentityKind) -> BTreeMap<String, i64> {
        self.specials.lock().tables[kind.index()]
            .as_ref()
            .map(|t| t.table.entries.clone())
            .unwrap_or_default()
    }

    /// Increments applied to `kind`'s table since this object set opened.
    #[must_use]
    pub fn accounting_increments(&self, kind: IdentityKind) -> u64 {
        self.specials.lock().tables[kind.index()]
            .as_ref()
            .map_or(0, |t| t.increments)
    }

    /// Every block the published state references.
    #[must_use]
    pub fn live_blocks(&self) -> Vec<BlockPtr> {
        let mut blocks: Vec<BlockPtr> = self.root_ptr().into_iter().collect();
        {
            let specials = self.specials.lock();
            blocks.extend(specials.meta);
            blocks.extend(specials.tables.iter().flatten().filter_map(|t| t.bp));
        }
        for dnode in self.objects.read().values() {
            let dn = dnode.lock();
            if dn.on_disk {
                blocks.extend(dn.phys.data);
            }
        }
        blocks
    }

    // ── Holds and eviction ──────────────────────────────────────────────────

    pub fn add_hold(&self) {
        self.holds.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one hold, returning how many remain.
    pub fn drop_hold(&self) -> u32 {
        let prev = self.holds.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "objset hold underflow");
        prev.saturating_sub(1)
    }

    #[must_use]
    pub fn hold_count(&self) -> u32 {
        self.holds.load(Ordering::Acquire)
    }

    /// Claim exclusive read-write ownership.
    pub fn try_own(&self) -> Result<()> {
        self.check_writable()?;
        if self.owned.swap(true, Ordering::AcqRel) {
            return Err(StrataError::Busy(format!("objset of directory {} already owned", self.dir.id())));
        }
        Ok(())
    }

    pub fn disown(&self) {
        self.owned.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_owned(&self) -> bool {
        self.owned.load(Ordering::Acquire)
    }

    pub fn set_evict_callback(&self, callback: impl FnOnce() + Send + 'static) {
        *self.evict_callback.lock() = Some(Box::new(callback));
    }

    /// Whether the cache may drop this object set now.
    #[must_use]
    pub fn is_evictable(&self) -> bool {
        self.hold_count() == 0 && !self.is_dirty_any()
    }

    /// Tear down in-memory state and fire the eviction callback.
    pub fn evict(&self) {
        debug_assert!(self.is_evictable(), "evicting busy objset");
        self.objects.write().clear();
        if let Some(callback) = self.evict_callback.lock().take() {
            callback();
        }
        debug!(target: "strata::objset", dir = self.dir.id().0, "objset_evicted");
    }

    // ── Upgrade state ───────────────────────────────────────────────────────

    #[must_use]
    pub fn upgrade_status(&self) -> UpgradeStatus {
        self.upgrade.lock().status.clone()
    }

    pub fn set_upgrade_status(&self, status: UpgradeStatus) {
        self.upgrade.lock().status = status;
    }

    #[must_use]
    pub fn upgrade_should_exit(&self) -> bool {
        self.upgrade_exit.load(Ordering::Acquire)
    }

    pub fn request_upgrade_exit(&self, exit: bool) {
        self.upgrade_exit.store(exit, Ordering::Release);
    }

    /// Register the running upgrade task. `Busy` if one is already running.
    pub fn install_upgrade(&self, start: impl FnOnce() -> Result<JoinHandle<()>>) -> Result<()> {
        let mut slot = self.upgrade.lock();
        if matches!(slot.status, UpgradeStatus::Running { .. }) {
            return Err(StrataError::Busy("userspace upgrade already running".to_owned()));
        }
        if let Some(old) = slot.handle.take() {
            let _ = old.join();
        }
        self.upgrade_exit.store(false, Ordering::Release);
        slot.status = UpgradeStatus::Running { done: 0, total: 0 };
        match start() {
            Ok(handle) => {
                slot.handle = Some(handle);
                Ok(())
            }
            Err(err) => {
                slot.status = UpgradeStatus::Failed(err.to_string());
                Err(err)
            }
        }
    }

    pub fn take_upgrade_handle(&self) -> Option<JoinHandle<()>> {
        self.upgrade.lock().handle.take()
    }
}

impl DirRecordSource for ObjectSet {
    fn load_dir(&self, id: DirId) -> Result<DirPhys> {
        DirPhys::decode(&self.read_object(ObjectId(id.0))?)
    }
}
