#![forbid(unsafe_code)]
//! Pool facade.
//!
//! [`Pool`] wires the directory tree, the meta object set, the dataset object
//! sets and the generation manager together. Every mutation enters through
//! one of three doors:
//!
//! - a [`Tx`], which pins the open generation, obtains an admission ticket
//!   and then dirties objects in one dataset;
//! - the raw admission calls ([`Pool::reserve`], [`Pool::cancel`],
//!   [`Pool::willuse`]) for callers that manage their own object writes;
//! - an administrative operation (create, destroy, rename, quota,
//!   reservation, snapshot), which is checked in open context and then
//!   re-checked and applied as a sync task while its generation syncs.
//!
//! [`Pool::sync_generation`] closes the open generation and makes it
//! durable. A durability fault while syncing suspends the pool: every later
//! mutation and sync returns [`StrataError::Suspended`].

mod sync;
mod tx;
mod upgrade;

pub use strata_block::{BlockStore, MemBlockStore};
pub use strata_dir::{DirStats, LimitKind, ReserveRequest, Ticket};
pub use strata_error::{Result, StrataError};
pub use strata_objset::{
    FeatureFlags, ObjectSet, ObjsetKind, ROOT_FLAG_PROJECTQUOTA_COMPLETE, ROOT_FLAG_USERACCOUNTING_COMPLETE,
    ROOT_FLAG_USEROBJACCOUNTING_COMPLETE, ReconcileReport, UpgradeStatus,
};
pub use strata_txg::{Clock, GenerationConfig, ManualClock, SystemClock};
pub use strata_types::{DirId, IdentityKind, ObjectId, Owner, Txg, UsedCategory};
pub use tx::Tx;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use strata_dir::{DirHold, DirPhys, DirRecordSource, DirTree, PoolSpace, SlopPolicy, SnapshotPhys, WriteThrottle};
use strata_objset::{ObjsetConfig, read_object_at};
use strata_txg::GenerationManager;
use strata_types::{BlockPtr, TXG_SIZE};
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Pool tunables. Every field has a documented default except the capacity,
/// which must be set before [`Pool::create`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Name of the root directory. Default: `"tank"`.
    pub name: String,
    /// Usable bytes. Required.
    pub capacity_bytes: u64,
    /// The pool keeps `max(capacity >> slop_shift, min_slop_bytes)` (capped
    /// at half the capacity) unallocatable; half of that for net-free
    /// operations. Default: 5.
    pub slop_shift: u32,
    /// Default: 32 MiB.
    pub min_slop_bytes: u64,
    /// Write-buffer throttle limit. Default: 64 MiB.
    pub dirty_data_max: u64,
    /// Shards per dirty worklist. Default: 8.
    pub sync_shards: usize,
    /// Upper bound on parallel sync tasks. Default: 4.
    pub sync_threads: usize,
    /// Meta object set passes per generation before leftovers move on.
    /// Default: 8.
    pub max_sync_passes: u32,
    /// Physical allocation unit. Default: 512.
    pub block_granularity: u64,
    pub features: FeatureFlags,
    pub generation: GenerationConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let slop = SlopPolicy::default();
        let objset = ObjsetConfig::default();
        Self {
            name: "tank".to_owned(),
            capacity_bytes: 0,
            slop_shift: slop.shift,
            min_slop_bytes: slop.min_bytes,
            dirty_data_max: 64 << 20,
            sync_shards: objset.sync_shards,
            sync_threads: objset.sync_threads,
            max_sync_passes: 8,
            block_granularity: objset.block_granularity,
            features: FeatureFlags::default(),
            generation: GenerationConfig::default(),
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub fn with_capacity(capacity_bytes: u64) -> Self {
        Self {
            capacity_bytes,
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        strata_dir::check_name(&self.name)?;
        if self.capacity_bytes == 0 {
            return Err(StrataError::InvalidArgument("pool capacity must be set".to_owned()));
        }
        if self.block_granularity == 0 || !self.block_granularity.is_power_of_two() {
            return Err(StrataError::InvalidArgument(format!(
                "block granularity {} is not a power of two",
                self.block_granularity
            )));
        }
        if self.sync_shards == 0 || self.sync_threads == 0 || self.max_sync_passes == 0 {
            return Err(StrataError::InvalidArgument(
                "sync shards, threads and passes must be nonzero".to_owned(),
            ));
        }
        Ok(())
    }

    fn objset_config(&self) -> ObjsetConfig {
        ObjsetConfig {
            sync_shards: self.sync_shards,
            sync_threads: self.sync_threads,
            block_granularity: self.block_granularity,
        }
    }

    fn slop(&self) -> SlopPolicy {
        SlopPolicy {
            shift: self.slop_shift,
            min_bytes: self.min_slop_bytes,
        }
    }
}

// ---------------------------------------------------------------------------
// Durable anchors
// ---------------------------------------------------------------------------

/// Pointer to the latest durable pool state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Uberblock {
    pub txg: Txg,
    pub mos_root: BlockPtr,
}

/// Contents of the pool directory object in the meta object set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct PoolDirectory {
    root_dir: DirId,
    mos_dir: DirId,
    next_dir: u64,
}

const ROOT_DIR: DirId = DirId(2);
const MOS_DIR: DirId = DirId(3);
const MOS_DIR_NAME: &str = "$MOS";

/// Directory records read straight from a published meta object set root.
struct PublishedRecords {
    store: Arc<dyn BlockStore>,
    root: BlockPtr,
}

impl fmt::Debug for PublishedRecords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishedRecords")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl DirRecordSource for PublishedRecords {
    fn load_dir(&self, id: DirId) -> Result<DirPhys> {
        DirPhys::decode(&read_object_at(self.store.as_ref(), &self.root, ObjectId(id.0))?)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|err| StrataError::Format(err.to_string()))
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// An open directory.
#[derive(Debug, Clone)]
pub struct Directory {
    hold: DirHold,
    name: String,
}

impl Directory {
    #[must_use]
    pub fn id(&self) -> DirId {
        self.hold.id()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// How [`Pool::open_directory`] finds a directory.
#[derive(Debug, Clone, Copy)]
pub enum DirLookup<'a> {
    Id(DirId),
    Path(&'a str),
}

impl From<DirId> for DirLookup<'_> {
    fn from(id: DirId) -> Self {
        Self::Id(id)
    }
}

impl<'a> From<&'a str> for DirLookup<'a> {
    fn from(path: &'a str) -> Self {
        Self::Path(path)
    }
}

/// A hold on an object set. Dropping it releases the hold (and ownership,
/// if owned, stopping any upgrade it started), after which the pool may
/// evict the object set.
pub struct ObjsetHandle {
    objset: Arc<ObjectSet>,
    owned: bool,
}

impl ObjsetHandle {
    fn new(objset: Arc<ObjectSet>, owned: bool) -> Self {
        objset.add_hold();
        Self { objset, owned }
    }

    #[must_use]
    pub fn objset(&self) -> &Arc<ObjectSet> {
        &self.objset
    }

    #[must_use]
    pub fn dir_id(&self) -> DirId {
        self.objset.dir().id()
    }

    #[must_use]
    pub fn is_owner(&self) -> bool {
        self.owned
    }
}

impl Deref for ObjsetHandle {
    type Target = ObjectSet;

    fn deref(&self) -> &ObjectSet {
        &self.objset
    }
}

impl fmt::Debug for ObjsetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjsetHandle")
            .field("dir", &self.dir_id())
            .field("kind", &self.objset.kind())
            .field("owned", &self.owned)
            .finish()
    }
}

impl Drop for ObjsetHandle {
    fn drop(&mut self) {
        if self.owned {
            self.objset.request_upgrade_exit(true);
            upgrade::join_upgrade(&self.objset);
            self.objset.disown();
        }
        self.objset.drop_hold();
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Deferred administrative change. An error is a durability fault that
/// suspends the pool; ordinary failures are reported to the waiting caller.
type SyncTask = Box<dyn FnOnce(&Pool, Txg) -> Result<()> + Send>;

/// Snapshot of pool-wide counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub name: String,
    pub capacity: u64,
    pub slop: u64,
    pub deferred: u64,
    pub synced_txg: Txg,
    pub open_txg: Txg,
    pub cached_directories: usize,
    pub open_objsets: usize,
    pub evicted_objsets: u64,
    pub suspended: bool,
    pub root: DirStats,
}

pub struct Pool {
    config: PoolConfig,
    store: Arc<dyn BlockStore>,
    generations: Arc<GenerationManager>,
    tree: DirTree,
    mos: Arc<ObjectSet>,
    root_dir: DirHold,
    mos_dir: DirHold,
    next_dir: AtomicU64,
    pool_directory: Mutex<Option<PoolDirectory>>,
    objsets: Mutex<BTreeMap<DirId, Arc<ObjectSet>>>,
    tickets: Mutex<[Vec<Ticket>; TXG_SIZE]>,
    sync_tasks: Mutex<[Vec<SyncTask>; TXG_SIZE]>,
    deferred: Mutex<VecDeque<(Txg, Vec<BlockPtr>)>>,
    uberblock: RwLock<Option<Uberblock>>,
    sync_lock: Mutex<()>,
    dirty_bytes: AtomicU64,
    suspended: AtomicBool,
    features: RwLock<FeatureFlags>,
    evicted_objsets: Arc<AtomicU64>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.config.name)
            .field("synced", &self.generations.synced_txg())
            .field("suspended", &self.suspended.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Pool {
    /// Create a pool on an empty store and sync its first generation.
    pub fn create(config: PoolConfig, store: Arc<dyn BlockStore>) -> Result<Self> {
        Self::create_with_clock(config, store, Arc::new(SystemClock))
    }

    pub fn create_with_clock(config: PoolConfig, store: Arc<dyn BlockStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let generations = Arc::new(GenerationManager::new(config.generation, clock, Txg(0)));
        let txg = generations.open_txg();
        let tree = Self::new_tree(&config);
        let root_dir = tree.insert_root(ROOT_DIR, DirPhys::new(None, &config.name, txg, true), txg);
        let mos_dir = tree.insert_child(&root_dir, MOS_DIR, DirPhys::new(Some(ROOT_DIR), MOS_DIR_NAME, txg, false), txg)?;
        let mos = Arc::new(ObjectSet::create(
            ObjsetKind::Meta,
            mos_dir.clone(),
            tree.clone(),
            Arc::clone(&store),
            config.objset_config(),
            config.features,
            txg,
        ));
        tree.attach_source(Arc::downgrade(&mos) as Weak<dyn DirRecordSource>);
        mos.create_object_with_id(txg, ObjectId::POOL_DIRECTORY, Owner::default())?;
        for dir in [ROOT_DIR, MOS_DIR] {
            mos.create_object_with_id(txg, ObjectId(dir.0), Owner::default())?;
        }

        let pool = Self::assemble(config, store, generations, tree, mos, root_dir, mos_dir, MOS_DIR.0 + 1);
        let root_objset = Arc::new(ObjectSet::create(
            ObjsetKind::Head,
            pool.root_dir.clone(),
            pool.tree.clone(),
            Arc::clone(&pool.store),
            pool.config.objset_config(),
            pool.features(),
            txg,
        ));
        pool.register_objset(root_objset);
        info!(
            pool = %pool.config.name,
            capacity = pool.config.capacity_bytes,
            slop = pool.tree.space().slop_bytes(),
            "pool created"
        );
        pool.wait_synced(txg)?;
        Ok(pool)
    }

    /// Reopen a pool from its latest uberblock.
    pub fn import(config: PoolConfig, store: Arc<dyn BlockStore>, uberblock: Uberblock) -> Result<Self> {
        Self::import_with_clock(config, store, uberblock, Arc::new(SystemClock))
    }

    pub fn import_with_clock(
        config: PoolConfig,
        store: Arc<dyn BlockStore>,
        uberblock: Uberblock,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let directory: PoolDirectory = serde_json::from_slice(&read_object_at(
            store.as_ref(),
            &uberblock.mos_root,
            ObjectId::POOL_DIRECTORY,
        )?)
        .map_err(|err| StrataError::Format(err.to_string()))?;

        let tree = Self::new_tree(&config);
        tree.set_root(directory.root_dir);
        let published: Arc<dyn DirRecordSource> = Arc::new(PublishedRecords {
            store: Arc::clone(&store),
            root: uberblock.mos_root,
        });
        tree.attach_source(Arc::downgrade(&published));
        let root_dir = tree.hold(directory.root_dir)?;
        let mos_dir = tree.hold(directory.mos_dir)?;

        let mos = Arc::new(ObjectSet::open(
            ObjsetKind::Meta,
            mos_dir.clone(),
            tree.clone(),
            Arc::clone(&store),
            config.objset_config(),
            config.features,
            Some(uberblock.mos_root),
        )?);
        tree.attach_source(Arc::downgrade(&mos) as Weak<dyn DirRecordSource>);
        drop(published);

        let generations = Arc::new(GenerationManager::new(config.generation, clock, uberblock.txg));
        let pool = Self::assemble(config, store, generations, tree, mos, root_dir, mos_dir, directory.next_dir);
        *pool.pool_directory.lock() = Some(directory);
        *pool.uberblock.write() = Some(uberblock);
        info!(pool = %pool.config.name, txg = uberblock.txg.0, "pool imported");
        Ok(pool)
    }

    fn new_tree(config: &PoolConfig) -> DirTree {
        let space = Arc::new(PoolSpace::new(config.capacity_bytes, config.slop()));
        let throttle = Arc::new(WriteThrottle::new(config.dirty_data_max));
        DirTree::new(space, throttle)
    }

    #[expect(clippy::too_many_arguments)]
    fn assemble(
        config: PoolConfig,
        store: Arc<dyn BlockStore>,
        generations: Arc<GenerationManager>,
        tree: DirTree,
        mos: Arc<ObjectSet>,
        root_dir: DirHold,
        mos_dir: DirHold,
        next_dir: u64,
    ) -> Self {
        Self {
            features: RwLock::new(config.features),
            config,
            store,
            generations,
            tree,
            mos,
            root_dir,
            mos_dir,
            next_dir: AtomicU64::new(next_dir),
            pool_directory: Mutex::new(None),
            objsets: Mutex::new(BTreeMap::new()),
            tickets: Mutex::new(std::array::from_fn(|_| Vec::new())),
            sync_tasks: Mutex::new(std::array::from_fn(|_| Vec::new())),
            deferred: Mutex::new(VecDeque::new()),
            uberblock: RwLock::new(None),
            sync_lock: Mutex::new(()),
            dirty_bytes: AtomicU64::new(0),
            suspended: AtomicBool::new(false),
            evicted_objsets: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Latest published uberblock.
    pub fn uberblock(&self) -> Result<Uberblock> {
        self.uberblock
            .read()
            .ok_or_else(|| StrataError::NotFound("uberblock".to_owned()))
    }

    #[must_use]
    pub fn open_txg(&self) -> Txg {
        self.generations.open_txg()
    }

    #[must_use]
    pub fn synced_txg(&self) -> Txg {
        self.generations.synced_txg()
    }

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_suspended() {
            return Err(StrataError::Suspended);
        }
        Ok(())
    }

    #[must_use]
    pub fn root_id(&self) -> DirId {
        self.root_dir.id()
    }

    // ── Namespace ───────────────────────────────────────────────────────────

    pub fn open_directory<'a>(&self, lookup: impl Into<DirLookup<'a>>) -> Result<Directory> {
        let hold = match lookup.into() {
            DirLookup::Id(id) => self.tree.hold(id)?,
            DirLookup::Path(path) => self.tree.resolve_path(path)?,
        };
        let name = self.tree.name_of(&hold);
        Ok(Directory { hold, name })
    }

    /// Full path of a directory.
    pub fn directory_name(&self, id: DirId) -> Result<String> {
        Ok(self.tree.name_of(&self.tree.hold(id)?))
    }

    /// Ids of `id`'s children, by name.
    pub fn children(&self, id: DirId) -> Result<BTreeMap<String, DirId>> {
        Ok(self.tree.phys(&self.tree.hold(id)?).children)
    }

    fn check_user_dir(&self, id: DirId) -> Result<DirHold> {
        if id == self.mos_dir.id() {
            return Err(StrataError::InvalidArgument("the meta directory is not administrable".to_owned()));
        }
        self.tree.hold(id)
    }

    /// Create a directory with an empty dataset under `parent`.
    pub fn create_directory(&self, parent: DirId, name: &str) -> Result<DirId> {
        let name = name.to_owned();
        let check_name = name.clone();
        self.sync_task(
            "create_directory",
            move |pool, _| {
                let parent = pool.check_user_dir(parent)?;
                pool.tree.check_new_child(&parent, &check_name)?;
                pool.tree.check_count_limit(&parent, LimitKind::Filesystem, 1, None)
            },
            move |pool, txg| {
                let parent = pool.tree.hold(parent)?;
                let id = DirId(pool.next_dir.fetch_add(1, Ordering::AcqRel));
                let hold = pool
                    .tree
                    .insert_child(&parent, id, DirPhys::new(Some(parent.id()), &name, txg, true), txg)?;
                pool.mos.create_object_with_id(txg, ObjectId(id.0), Owner::default())?;
                let objset = Arc::new(ObjectSet::create(
                    ObjsetKind::Head,
                    hold,
                    pool.tree.clone(),
                    Arc::clone(&pool.store),
                    pool.config.objset_config(),
                    pool.features(),
                    txg,
                ));
                pool.sync_dataset(&objset, txg)?;
                pool.register_objset(objset);
                Ok(id)
            },
        )
    }

    /// Destroy a leaf directory and free its dataset. Fails with `NotEmpty`
    /// if it has children and `Busy` if it is referenced (open handles or
    /// snapshots).
    pub fn destroy_directory(&self, id: DirId) -> Result<()> {
        self.sync_task(
            "destroy_directory",
            move |pool, _| pool.check_destroy(id),
            move |pool, txg| pool.apply_destroy(id, txg),
        )
    }

    fn check_destroy(&self, id: DirId) -> Result<()> {
        if id == self.root_dir.id() {
            return Err(StrataError::Busy("cannot destroy the root directory".to_owned()));
        }
        let dir = self.check_user_dir(id)?;
        let phys = self.tree.phys(&dir);
        if !phys.children.is_empty() {
            return Err(StrataError::NotEmpty(self.tree.name_of(&dir)));
        }
        if phys.dataset.as_ref().is_some_and(|ds| !ds.snapshots.is_empty()) {
            return Err(StrataError::Busy(format!("{} has snapshots", self.tree.name_of(&dir))));
        }
        if let Some(os) = self.objsets.lock().get(&id) {
            if os.hold_count() > 0 {
                return Err(StrataError::Busy(format!("{} is open", self.tree.name_of(&dir))));
            }
        }
        Ok(())
    }

    fn apply_destroy(&self, id: DirId, txg: Txg) -> Result<()> {
        let cached = self.objsets.lock().remove(&id);
        let objset = match cached {
            Some(os) => os,
            None => self.load_objset(id)?,
        };
        if Arc::strong_count(&objset) > 1 || objset.is_dirty_any() {
            let busy = StrataError::Busy(format!("objset of directory {id} is in use"));
            self.objsets.lock().insert(id, objset);
            return Err(busy);
        }
        let blocks = objset.live_blocks();
        let (used, logical) = blocks
            .iter()
            .fold((0_u64, 0_u64), |(u, l), bp| (u + bp.physical_size, l + bp.logical_size));
        let dir = objset.dir().clone();
        self.tree.diduse(
            &dir,
            UsedCategory::Head,
            -to_signed(used),
            -to_signed(used),
            -to_signed(logical),
            txg,
        );
        drop(objset);
        self.defer_frees(txg, blocks);
        self.mos.free_object(txg, ObjectId(id.0))?;
        self.tree.destroy(dir, txg)?;
        Ok(())
    }

    /// Move `id` under `new_parent` as `new_name`.
    pub fn rename_directory(&self, id: DirId, new_parent: DirId, new_name: &str) -> Result<()> {
        let name = new_name.to_owned();
        let check_name = name.clone();
        self.sync_task(
            "rename_directory",
            move |pool, _| {
                let dir = pool.check_user_dir(id)?;
                let parent = pool.check_user_dir(new_parent)?;
                pool.tree.check_rename(&dir, &parent, &check_name)
            },
            move |pool, txg| {
                let dir = pool.tree.hold(id)?;
                let parent = pool.tree.hold(new_parent)?;
                pool.tree.rename(&dir, &parent, &name, txg)
            },
        )
    }

    /// Set a directory's quota; 0 removes it.
    pub fn set_quota(&self, id: DirId, quota: u64) -> Result<()> {
        self.sync_task(
            "set_quota",
            move |pool, syncing| pool.tree.check_quota(&pool.check_user_dir(id)?, quota, syncing),
            move |pool, txg| {
                pool.tree.apply_quota(&pool.tree.hold(id)?, quota, txg);
                Ok(())
            },
        )
    }

    /// Set a directory's reservation; 0 removes it.
    pub fn set_reservation(&self, id: DirId, reservation: u64) -> Result<()> {
        self.sync_task(
            "set_reservation",
            move |pool, _| pool.tree.check_reservation(&pool.check_user_dir(id)?, reservation),
            move |pool, txg| {
                pool.tree.apply_reservation(&pool.tree.hold(id)?, reservation, txg);
                Ok(())
            },
        )
    }

    /// Bound the bytes referenced by a directory's head dataset; 0 removes
    /// the bound.
    pub fn set_ref_quota(&self, id: DirId, ref_quota: u64) -> Result<()> {
        self.sync_task(
            "set_ref_quota",
            move |pool, _| pool.tree.check_ref_quota(&pool.check_user_dir(id)?, ref_quota),
            move |pool, txg| {
                pool.tree.apply_ref_quota(&pool.tree.hold(id)?, ref_quota, txg);
                Ok(())
            },
        )
    }

    /// Bound how many directories may exist below `id`; `None` removes the
    /// bound. Creating or moving in a directory past it fails with
    /// `QuotaExceeded`.
    pub fn set_filesystem_limit(&self, id: DirId, limit: Option<u64>) -> Result<()> {
        self.set_count_limit("set_filesystem_limit", id, LimitKind::Filesystem, limit)
    }

    /// Bound how many snapshots may exist of `id` and its descendants;
    /// `None` removes the bound.
    pub fn set_snapshot_limit(&self, id: DirId, limit: Option<u64>) -> Result<()> {
        self.set_count_limit("set_snapshot_limit", id, LimitKind::Snapshot, limit)
    }

    fn set_count_limit(&self, task: &'static str, id: DirId, kind: LimitKind, limit: Option<u64>) -> Result<()> {
        self.sync_task(
            task,
            move |pool, _| pool.check_user_dir(id).map(drop),
            move |pool, txg| {
                pool.tree.apply_count_limit(&pool.tree.hold(id)?, kind, limit, txg);
                Ok(())
            },
        )
    }

    /// Capture the head dataset of `id` as the read-only snapshot `name`.
    /// Returns the generation the snapshot belongs to.
    pub fn snapshot(&self, id: DirId, name: &str) -> Result<Txg> {
        let name = name.to_owned();
        let check_name = name.clone();
        self.sync_task(
            "snapshot",
            move |pool, _| {
                strata_dir::check_name(&check_name)?;
                let dir = pool.check_user_dir(id)?;
                let exists = pool
                    .tree
                    .with_dataset(&dir, |ds| ds.snapshots.contains_key(&check_name))
                    .ok_or_else(|| StrataError::InvalidArgument(format!("directory {id} has no dataset")))?;
                if exists {
                    return Err(StrataError::Exists(format!("{}@{check_name}", pool.tree.name_of(&dir))));
                }
                pool.tree.check_count_limit(&dir, LimitKind::Snapshot, 1, None)
            },
            move |pool, txg| {
                let objset = pool.objset(id)?;
                let root = objset.root_ptr();
                pool.tree.update_dataset(objset.dir(), txg, |ds| {
                    ds.snapshots.insert(
                        name.clone(),
                        SnapshotPhys {
                            txg,
                            root,
                            referenced_bytes: ds.referenced_bytes,
                        },
                    );
                    ds.prev_snap_txg = txg;
                })?;
                objset.set_prev_snap_txg(txg);
                pool.tree.adjust_count(objset.dir(), LimitKind::Snapshot, 1, txg);
                info!(dir = id.0, snapshot = %name, txg = txg.0, "snapshot created");
                Ok(txg)
            },
        )
    }

    /// Names of the snapshots of `id`'s head dataset, with their generations.
    pub fn snapshots(&self, id: DirId) -> Result<BTreeMap<String, Txg>> {
        let dir = self.tree.hold(id)?;
        Ok(self
            .tree
            .with_dataset(&dir, |ds| ds.snapshots.iter().map(|(name, s)| (name.clone(), s.txg)).collect())
            .unwrap_or_default())
    }

    // ── Admission ───────────────────────────────────────────────────────────

    /// Admit a write against `dir` in the open generation. The ticket must
    /// be canceled once the write is committed or abandoned; tickets still
    /// outstanding when their generation syncs are released then.
    pub fn reserve(&self, dir: DirId, req: ReserveRequest) -> Result<Ticket> {
        self.ensure_active()?;
        let dir = self.tree.hold(dir)?;
        // The generation cannot close while the ticket is being queued.
        let hold = self.generations.hold_open();
        self.reserve_in(&dir, hold.txg(), req)
    }

    pub(crate) fn reserve_in(&self, dir: &DirHold, txg: Txg, req: ReserveRequest) -> Result<Ticket> {
        let ticket = self.tree.reserve(dir, txg, req)?;
        self.tickets.lock()[txg.slot()].push(ticket.clone());
        Ok(ticket)
    }

    /// Release a ticket. Returns `false` if it was already released.
    pub fn cancel(&self, ticket: &Ticket) -> bool {
        ticket.release()
    }

    /// Advisory estimate of a pending change to `dir`'s usage.
    pub fn willuse(&self, dir: DirId, delta: i64) -> Result<()> {
        self.ensure_active()?;
        let dir = self.tree.hold(dir)?;
        self.tree.willuse(&dir, delta, self.generations.open_txg());
        Ok(())
    }

    /// Bytes `dir` has promised for `txg`.
    pub fn tempreserved(&self, dir: DirId, txg: Txg) -> Result<u64> {
        Ok(self.tree.tempreserved(&self.tree.hold(dir)?, txg))
    }

    // ── Statistics ──────────────────────────────────────────────────────────

    pub fn stats(&self, id: DirId) -> Result<DirStats> {
        Ok(self.tree.stats(&self.tree.hold(id)?))
    }

    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        let space = self.tree.space();
        PoolStats {
            name: self.config.name.clone(),
            capacity: space.capacity(),
            slop: space.slop_bytes(),
            deferred: space.deferred(),
            synced_txg: self.generations.synced_txg(),
            open_txg: self.generations.open_txg(),
            cached_directories: self.tree.cached_count(),
            open_objsets: self.objsets.lock().len(),
            evicted_objsets: self.evicted_objsets.load(Ordering::Acquire),
            suspended: self.is_suspended(),
            root: self.tree.stats(&self.root_dir),
        }
    }

    #[must_use]
    pub fn is_directory_cached(&self, id: DirId) -> bool {
        self.tree.is_cached(id)
    }

    // ── Object sets ─────────────────────────────────────────────────────────

    fn register_objset(&self, objset: Arc<ObjectSet>) -> Arc<ObjectSet> {
        let evicted = Arc::clone(&self.evicted_objsets);
        let id = objset.dir().id();
        objset.set_evict_callback(move || {
            evicted.fetch_add(1, Ordering::AcqRel);
            debug!(target: "strata::core", dir = id.0, "objset_evict_callback");
        });
        self.objsets.lock().insert(id, Arc::clone(&objset));
        objset
    }

    fn load_objset(&self, id: DirId) -> Result<Arc<ObjectSet>> {
        let dir = self.check_user_dir(id)?;
        let (root, prev_snap) = self
            .tree
            .with_dataset(&dir, |ds| (ds.root, ds.prev_snap_txg))
            .ok_or_else(|| StrataError::InvalidArgument(format!("directory {id} has no dataset")))?;
        let objset = ObjectSet::open(
            ObjsetKind::Head,
            dir,
            self.tree.clone(),
            Arc::clone(&self.store),
            self.config.objset_config(),
            self.features(),
            root,
        )?;
        objset.set_prev_snap_txg(prev_snap);
        Ok(Arc::new(objset))
    }

    /// The cached head object set of `id`, loading it if needed.
    fn objset(&self, id: DirId) -> Result<Arc<ObjectSet>> {
        if let Some(os) = self.objsets.lock().get(&id) {
            return Ok(Arc::clone(os));
        }
        let loaded = self.load_objset(id)?;
        let objsets = self.objsets.lock();
        if let Some(os) = objsets.get(&id) {
            return Ok(Arc::clone(os));
        }
        drop(objsets);
        Ok(self.register_objset(loaded))
    }

    /// Hold `id`'s head object set for reading.
    pub fn hold_objset(&self, id: DirId) -> Result<ObjsetHandle> {
        Ok(ObjsetHandle::new(self.objset(id)?, false))
    }

    /// Open `id`'s head object set exclusively for writing.
    pub fn own_objset(&self, id: DirId) -> Result<ObjsetHandle> {
        self.ensure_active()?;
        let objset = self.objset(id)?;
        objset.try_own()?;
        Ok(ObjsetHandle::new(objset, true))
    }

    /// Open a snapshot of `id` read-only.
    pub fn hold_snapshot(&self, id: DirId, name: &str) -> Result<ObjsetHandle> {
        let dir = self.check_user_dir(id)?;
        let snap = self
            .tree
            .with_dataset(&dir, |ds| ds.snapshots.get(name).cloned())
            .flatten()
            .ok_or_else(|| StrataError::NotFound(format!("{}@{name}", self.tree.name_of(&dir))))?;
        let objset = ObjectSet::open(
            ObjsetKind::Snapshot,
            dir,
            self.tree.clone(),
            Arc::clone(&self.store),
            self.config.objset_config(),
            self.features(),
            snap.root,
        )?;
        Ok(ObjsetHandle::new(Arc::new(objset), false))
    }

    /// Start a transaction against `handle`'s object set.
    pub fn begin_tx<'p>(&'p self, handle: &ObjsetHandle) -> Result<Tx<'p>> {
        self.ensure_active()?;
        if handle.kind() == ObjsetKind::Snapshot {
            return Err(StrataError::ReadOnly);
        }
        Ok(Tx::new(self, Arc::clone(handle.objset())))
    }

    #[must_use]
    pub fn features(&self) -> FeatureFlags {
        *self.features.read()
    }

    /// Turn on accounting features. Objects written before the change are
    /// covered once a userspace upgrade has run over their object set.
    pub fn enable_features(&self, features: FeatureFlags) {
        let merged = {
            let mut current = self.features.write();
            current.user_accounting |= features.user_accounting;
            current.object_accounting |= features.object_accounting;
            current.project_accounting |= features.project_accounting;
            *current
        };
        let objsets: Vec<Arc<ObjectSet>> = self.objsets.lock().values().cloned().collect();
        for os in objsets {
            os.set_features(merged);
        }
        info!(
            user = merged.user_accounting,
            objects = merged.object_accounting,
            project = merged.project_accounting,
            "features enabled"
        );
    }
}

pub(crate) fn to_signed(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}
