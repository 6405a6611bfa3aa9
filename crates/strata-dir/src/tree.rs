//! The directory cache.
//!
//! Nodes live in an arena of generation-counted slots keyed by directory id.
//! A child refers to its parent by slot and generation, never by an owning
//! pointer, and counts as one hold on the parent while it is cached, so a
//! parent can never be evicted out from under a cached child. Eviction is a
//! cache policy run explicitly after a generation syncs: any node with no
//! holds that is not dirty in an in-flight generation is dropped, and is
//! loaded back from its record on the next [`DirTree::hold`].

use crate::limits::LimitKind;
use crate::node::{DirNode, DirPhys, DirRef};
use crate::space::{PoolSpace, WriteThrottle};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use strata_error::{Result, StrataError};
use strata_txg::TxgList;
use strata_types::{DirId, NameError, Txg, UsedCategory};
use tracing::{debug, error, info, trace};

/// Where evicted directory records are read back from.
pub trait DirRecordSource: Send + Sync {
    fn load_dir(&self, id: DirId) -> Result<DirPhys>;
}

/// Counted reference that keeps one directory cached.
#[derive(Debug)]
pub struct DirHold {
    pub(crate) node: Arc<DirNode>,
}

impl DirHold {
    pub(crate) fn new(node: Arc<DirNode>) -> Self {
        node.add_hold();
        Self { node }
    }

    #[must_use]
    pub fn id(&self) -> DirId {
        self.node.id
    }
}

impl Clone for DirHold {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.node))
    }
}

impl Drop for DirHold {
    fn drop(&mut self) {
        self.node.drop_hold();
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    entry: Option<Arc<DirNode>>,
}

#[derive(Debug, Default)]
struct SlotTable {
    slots: Vec<Slot>,
    free: Vec<usize>,
    by_id: HashMap<DirId, usize>,
}

impl SlotTable {
    fn get(&self, id: DirId) -> Option<&Arc<DirNode>> {
        let idx = *self.by_id.get(&id)?;
        self.slots[idx].entry.as_ref()
    }

    fn resolve(&self, r: DirRef) -> Option<&Arc<DirNode>> {
        let slot = self.slots.get(r.slot)?;
        if slot.generation != r.generation {
            return None;
        }
        slot.entry.as_ref().filter(|node| node.id == r.id)
    }

    fn reference(&self, id: DirId) -> Option<DirRef> {
        let idx = *self.by_id.get(&id)?;
        Some(DirRef {
            id,
            slot: idx,
            generation: self.slots[idx].generation,
        })
    }

    fn insert(&mut self, node: DirNode) -> Arc<DirNode> {
        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
        };
        let node = Arc::new(node);
        self.by_id.insert(node.id, idx);
        self.slots[idx].entry = Some(Arc::clone(&node));
        node
    }

    /// Drop `id` from the arena and release its hold on its parent.
    fn remove(&mut self, id: DirId) -> Option<Arc<DirNode>> {
        let idx = self.by_id.remove(&id)?;
        let slot = &mut self.slots[idx];
        let node = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(idx);
        if let Some(parent) = node.parent_ref().and_then(|r| self.resolve(r)) {
            parent.drop_hold();
        }
        Some(node)
    }
}

pub(crate) struct TreeShared {
    slots: RwLock<SlotTable>,
    root: RwLock<Option<DirId>>,
    pub(crate) dirty: TxgList<DirId>,
    pub(crate) space: Arc<PoolSpace>,
    pub(crate) throttle: Arc<WriteThrottle>,
    source: RwLock<Option<Weak<dyn DirRecordSource>>>,
}

impl fmt::Debug for TreeShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeShared")
            .field("cached", &self.slots.read().by_id.len())
            .field("root", &*self.root.read())
            .finish_non_exhaustive()
    }
}

/// Handle to the shared directory cache. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DirTree {
    pub(crate) shared: Arc<TreeShared>,
}

impl DirTree {
    #[must_use]
    pub fn new(space: Arc<PoolSpace>, throttle: Arc<WriteThrottle>) -> Self {
        Self {
            shared: Arc::new(TreeShared {
                slots: RwLock::new(SlotTable::default()),
                root: RwLock::new(None),
                dirty: TxgList::new(),
                space,
                throttle,
                source: RwLock::new(None),
            }),
        }
    }

    #[must_use]
    pub fn space(&self) -> &Arc<PoolSpace> {
        &self.shared.space
    }

    #[must_use]
    pub fn throttle(&self) -> &Arc<WriteThrottle> {
        &self.shared.throttle
    }

    /// Install the backing store for evicted records.
    pub fn attach_source(&self, source: Weak<dyn DirRecordSource>) {
        *self.shared.source.write() = Some(source);
    }

    pub fn set_root(&self, root: DirId) {
        *self.shared.root.write() = Some(root);
    }

    #[must_use]
    pub fn root_id(&self) -> Option<DirId> {
        *self.shared.root.read()
    }

    /// Number of cached directories.
    #[must_use]
    pub fn cached_count(&self) -> usize {
        self.shared.slots.read().by_id.len()
    }

    #[must_use]
    pub fn is_cached(&self, id: DirId) -> bool {
        self.shared.slots.read().by_id.contains_key(&id)
    }

    /// Holds currently outstanding on `id`, counting cached children.
    #[must_use]
    pub fn hold_count(&self, id: DirId) -> Option<u32> {
        self.shared.slots.read().get(id).map(|node| node.hold_count())
    }

    // ── Lookup ──────────────────────────────────────────────────────────────

    fn try_hold(&self, id: DirId) -> Option<DirHold> {
        let table = self.shared.slots.read();
        table.get(id).map(|node| DirHold::new(Arc::clone(node)))
    }

    /// Hold `id`, loading it (and any uncached ancestors) from the record
    /// source if it has been evicted.
    pub fn hold(&self, id: DirId) -> Result<DirHold> {
        loop {
            if let Some(hold) = self.try_hold(id) {
                return Ok(hold);
            }
            let chain = self.read_chain(id)?;
            if let Some(hold) = self.install_chain(id, chain) {
                return Ok(hold);
            }
            trace!(target: "strata::dir", dir = id.0, "load_raced_with_eviction");
        }
    }

    /// Records for `id` and each uncached ancestor, leaf first.
    fn read_chain(&self, id: DirId) -> Result<Vec<(DirId, DirPhys)>> {
        let source = self
            .shared
            .source
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| StrataError::NotFound(format!("directory {id}")))?;
        let mut chain = Vec::new();
        let mut cur = id;
        loop {
            let phys = source.load_dir(cur)?;
            let parent = phys.parent;
            chain.push((cur, phys));
            match parent {
                Some(p) if !self.is_cached(p) => cur = p,
                _ => return Ok(chain),
            }
        }
    }

    /// Insert loaded records top-down. Returns `None` if an ancestor the
    /// chain relied on was evicted in the meantime.
    fn install_chain(&self, id: DirId, chain: Vec<(DirId, DirPhys)>) -> Option<DirHold> {
        let mut table = self.shared.slots.write();
        for (dir, phys) in chain.into_iter().rev() {
            if table.by_id.contains_key(&dir) {
                continue;
            }
            let parent = match phys.parent {
                Some(p) => {
                    let parent_ref = table.reference(p)?;
                    table.get(p)?.add_hold();
                    Some(parent_ref)
                }
                None => None,
            };
            trace!(target: "strata::dir", dir = dir.0, "directory_loaded");
            table.insert(DirNode::new(dir, parent, phys));
        }
        table.get(id).map(|node| DirHold::new(Arc::clone(node)))
    }

    pub(crate) fn parent_node(&self, node: &DirNode) -> Option<Arc<DirNode>> {
        let parent = node.parent_ref()?;
        let resolved = self.shared.slots.read().resolve(parent).cloned();
        if resolved.is_none() {
            debug_assert!(false, "parent of cached directory {} not cached", node.id);
            error!(dir = node.id.0, parent = parent.id.0, "cached directory lost its parent");
        }
        resolved
    }

    /// `dir` and every ancestor, leaf first.
    pub(crate) fn chain(&self, node: &Arc<DirNode>) -> Vec<Arc<DirNode>> {
        let mut chain = vec![Arc::clone(node)];
        let mut cur = Arc::clone(node);
        while let Some(parent) = self.parent_node(&cur) {
            chain.push(Arc::clone(&parent));
            cur = parent;
        }
        chain
    }

    /// Parent of `dir`, held.
    #[must_use]
    pub fn parent(&self, dir: &DirHold) -> Option<DirHold> {
        self.parent_node(&dir.node).map(DirHold::new)
    }

    /// Whether `ancestor` is `dir` or one of its ancestors.
    #[must_use]
    pub fn is_ancestor(&self, ancestor: DirId, dir: &DirHold) -> bool {
        self.chain(&dir.node).iter().any(|node| node.id == ancestor)
    }

    pub(crate) fn closest_common_ancestor(&self, a: &DirHold, b: &DirHold) -> Option<Arc<DirNode>> {
        let ids: HashSet<DirId> = self.chain(&a.node).iter().map(|node| node.id).collect();
        self.chain(&b.node)
            .into_iter()
            .find(|node| ids.contains(&node.id))
    }

    // ── Namespace ───────────────────────────────────────────────────────────

    /// Full slash-separated path of `dir`.
    #[must_use]
    pub fn name_of(&self, dir: &DirHold) -> String {
        let mut parts: Vec<String> = self
            .chain(&dir.node)
            .iter()
            .map(|node| node.state.lock().phys.name.clone())
            .collect();
        parts.reverse();
        parts.join("/")
    }

    /// Id of the child called `name`, if any.
    #[must_use]
    pub fn child_id(&self, dir: &DirHold, name: &str) -> Option<DirId> {
        dir.node.state.lock().phys.children.get(name).copied()
    }

    /// Validate `name` as a new child of `parent`.
    pub fn check_new_child(&self, parent: &DirHold, name: &str) -> Result<()> {
        check_name(name)?;
        if self.child_id(parent, name).is_some() {
            return Err(StrataError::Exists(name.to_owned()));
        }
        Ok(())
    }

    /// Resolve `pool/a/b` from the root.
    pub fn resolve_path(&self, path: &str) -> Result<DirHold> {
        let parts = strata_types::split_path(path).map_err(name_error)?;
        let root_id = self
            .root_id()
            .ok_or_else(|| StrataError::NotFound(path.to_owned()))?;
        let mut cur = self.hold(root_id)?;
        let (first, rest) = parts
            .split_first()
            .ok_or_else(|| StrataError::NotFound(path.to_owned()))?;
        if cur.node.state.lock().phys.name != *first {
            return Err(StrataError::NotFound(path.to_owned()));
        }
        for part in rest {
            let child = self
                .child_id(&cur, part)
                .ok_or_else(|| StrataError::NotFound(path.to_owned()))?;
            cur = self.hold(child)?;
        }
        Ok(cur)
    }

    /// Cache the root directory of a new pool.
    pub fn insert_root(&self, id: DirId, phys: DirPhys, txg: Txg) -> DirHold {
        let node = self.shared.slots.write().insert(DirNode::new(id, None, phys));
        self.set_root(id);
        self.shared.dirty.add(txg, id);
        info!(dir = id.0, "root directory created");
        DirHold::new(node)
    }

    /// Link a new directory under `parent` and cache it.
    pub fn insert_child(&self, parent: &DirHold, id: DirId, phys: DirPhys, txg: Txg) -> Result<DirHold> {
        check_name(&phys.name)?;
        {
            let mut state = parent.node.state.lock();
            if state.phys.children.contains_key(&phys.name) {
                return Err(StrataError::Exists(phys.name.clone()));
            }
            state.phys.children.insert(phys.name.clone(), id);
        }
        let mut table = self.shared.slots.write();
        let parent_ref = table
            .reference(parent.id())
            .ok_or_else(|| StrataError::NotFound(format!("directory {}", parent.id())))?;
        parent.node.add_hold();
        let name = phys.name.clone();
        let counted = phys.dataset.is_some();
        let node = table.insert(DirNode::new(id, Some(parent_ref), phys));
        drop(table);
        self.shared.dirty.add(txg, parent.id());
        self.shared.dirty.add(txg, id);
        if counted {
            self.adjust_count(parent, LimitKind::Filesystem, 1, txg);
        }
        info!(dir = id.0, parent = parent.id().0, name = %name, "directory created");
        Ok(DirHold::new(node))
    }

    /// Unlink and uncache `dir`. The caller's hold must be the only one.
    ///
    /// Any remaining reservation is released to the parent, and any
    /// remaining usage is rolled off the parent chain. Returns the final
    /// record so the caller can free what it references.
    pub fn destroy(&self, dir: DirHold, txg: Txg) -> Result<DirPhys> {
        let id = dir.id();
        {
            let state = dir.node.state.lock();
            if !state.phys.children.is_empty() {
                return Err(StrataError::NotEmpty(state.phys.name.clone()));
            }
        }
        if dir.node.hold_count() > 1 {
            return Err(StrataError::Busy(format!("directory {id}")));
        }

        self.apply_reservation(&dir, 0, txg);
        let phys = dir.node.state.lock().phys.clone();
        if phys.used_bytes != 0 {
            debug_assert!(false, "destroying directory {id} with {} bytes used", phys.used_bytes);
            error!(dir = id.0, used = phys.used_bytes, "destroying directory with usage, rolling off");
            if let Some(parent) = self.parent(&dir) {
                self.diduse(
                    &parent,
                    UsedCategory::Child,
                    -to_signed(phys.used_bytes),
                    -to_signed(phys.compressed_bytes),
                    -to_signed(phys.uncompressed_bytes),
                    txg,
                );
            }
        }
        if let Some(parent) = self.parent(&dir) {
            parent.node.state.lock().phys.children.remove(&phys.name);
            self.shared.dirty.add(txg, parent.id());
            if phys.dataset.is_some() {
                let filesystems = phys.filesystem_count.saturating_add(1);
                self.adjust_count(&parent, LimitKind::Filesystem, -to_signed(filesystems), txg);
            }
            self.adjust_count(&parent, LimitKind::Snapshot, -to_signed(phys.snapshot_count), txg);
        }
        self.shared.slots.write().remove(id);
        info!(dir = id.0, name = %phys.name, "directory destroyed");
        Ok(phys)
    }

    /// Move `dir` under `new_parent` as `new_name`, carrying its usage and
    /// unused reservation from the old parent chain to the new one.
    pub fn rename(&self, dir: &DirHold, new_parent: &DirHold, new_name: &str, txg: Txg) -> Result<()> {
        self.check_rename(dir, new_parent, new_name)?;
        let old_parent = self
            .parent(dir)
            .ok_or_else(|| StrataError::InvalidArgument("cannot rename the root".to_owned()))?;
        let (old_name, used, comp, uncomp, reserved) = {
            let state = dir.node.state.lock();
            let p = &state.phys;
            (
                p.name.clone(),
                p.used_bytes,
                p.compressed_bytes,
                p.uncompressed_bytes,
                p.reserved,
            )
        };
        let (filesystems, snapshots) = self.moved_counts(dir);

        if old_parent.id() != new_parent.id() {
            self.diduse(
                &old_parent,
                UsedCategory::Child,
                -to_signed(used),
                -to_signed(comp),
                -to_signed(uncomp),
                txg,
            );
            self.diduse(
                new_parent,
                UsedCategory::Child,
                to_signed(used),
                to_signed(comp),
                to_signed(uncomp),
                txg,
            );
            if reserved > used {
                let unused = to_signed(reserved - used);
                self.diduse(&old_parent, UsedCategory::ChildReserved, -unused, 0, 0, txg);
                self.diduse(new_parent, UsedCategory::ChildReserved, unused, 0, 0, txg);
            }
            for (kind, moved) in [(LimitKind::Filesystem, filesystems), (LimitKind::Snapshot, snapshots)] {
                self.adjust_count(&old_parent, kind, -to_signed(moved), txg);
                self.adjust_count(new_parent, kind, to_signed(moved), txg);
            }
        }

        old_parent.node.state.lock().phys.children.remove(&old_name);
        new_parent
            .node
            .state
            .lock()
            .phys
            .children
            .insert(new_name.to_owned(), dir.id());
        {
            let mut state = dir.node.state.lock();
            state.phys.name = new_name.to_owned();
            state.phys.parent = Some(new_parent.id());
        }
        if old_parent.id() != new_parent.id() {
            let table = self.shared.slots.read();
            let new_ref = table.reference(new_parent.id());
            drop(table);
            new_parent.node.add_hold();
            *dir.node.parent.write() = new_ref;
            old_parent.node.drop_hold();
        }
        for id in [dir.id(), old_parent.id(), new_parent.id()] {
            self.shared.dirty.add(txg, id);
        }
        debug!(
            target: "strata::dir",
            dir = dir.id().0,
            from = old_parent.id().0,
            to = new_parent.id().0,
            name = new_name,
            "directory_renamed"
        );
        Ok(())
    }

    /// Validate a rename without applying it.
    pub fn check_rename(&self, dir: &DirHold, new_parent: &DirHold, new_name: &str) -> Result<()> {
        check_name(new_name)?;
        let Some(old_parent) = self.parent(dir) else {
            return Err(StrataError::InvalidArgument("cannot rename the root".to_owned()));
        };
        if self.is_ancestor(dir.id(), new_parent) {
            return Err(StrataError::InvalidArgument(format!(
                "cannot move directory {} under its own descendant {}",
                dir.id(),
                new_parent.id()
            )));
        }
        if let Some(existing) = self.child_id(new_parent, new_name) {
            if existing != dir.id() {
                return Err(StrataError::Exists(new_name.to_owned()));
            }
        }
        if old_parent.id() == new_parent.id() {
            return Ok(());
        }

        let ancestor = self
            .closest_common_ancestor(dir, new_parent)
            .ok_or_else(|| StrataError::InvalidArgument("directories share no ancestor".to_owned()))?;
        let (filesystems, snapshots) = self.moved_counts(dir);
        self.check_count_limit(new_parent, LimitKind::Filesystem, filesystems, Some(ancestor.id))?;
        self.check_count_limit(new_parent, LimitKind::Snapshot, snapshots, Some(ancestor.id))?;

        let myspace = {
            let state = dir.node.state.lock();
            state.phys.used_bytes.max(state.phys.reserved)
        };
        let adelta = self.would_change(&old_parent.node, -to_signed(myspace), ancestor.id);
        let avail = self.available_space(new_parent, Some(ancestor.id), adelta, false);
        if avail < myspace {
            debug!(
                target: "strata::dir",
                dir = dir.id().0,
                myspace,
                avail,
                "rename_denied"
            );
            return Err(StrataError::NoSpace);
        }
        Ok(())
    }

    /// Filesystem and snapshot counts that move with `dir`: itself and its
    /// descendants.
    fn moved_counts(&self, dir: &DirHold) -> (u64, u64) {
        let state = dir.node.state.lock();
        let own = u64::from(state.phys.dataset.is_some());
        (state.phys.filesystem_count.saturating_add(own), state.phys.snapshot_count)
    }

    // ── Dirty tracking and eviction ─────────────────────────────────────────

    pub fn mark_dirty(&self, dir: &DirHold, txg: Txg) {
        self.shared.dirty.add(txg, dir.id());
    }

    #[must_use]
    pub fn is_dirty(&self, txg: Txg) -> bool {
        !self.shared.dirty.is_empty(txg)
    }

    /// Drain the directories dirtied in `txg`, in id order.
    pub fn take_dirty(&self, txg: Txg) -> Vec<DirId> {
        self.shared.dirty.take(txg)
    }

    /// Drop every cached node that has no holds and is not dirty in any
    /// in-flight generation. Returns how many were evicted.
    pub fn evict_idle(&self) -> usize {
        let mut table = self.shared.slots.write();
        let mut evicted = 0;
        loop {
            let victims: Vec<DirId> = table
                .by_id
                .keys()
                .copied()
                .filter(|id| {
                    table.get(*id).is_some_and(|node| {
                        node.hold_count() == 0 && !self.shared.dirty.contains_any(id)
                    })
                })
                .collect();
            if victims.is_empty() {
                break;
            }
            for id in victims {
                table.remove(id);
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(target: "strata::dir", evicted, cached = table.by_id.len(), "directories_evicted");
        }
        evicted
    }
}

pub(crate) fn name_error(err: NameError) -> StrataError {
    match err {
        NameError::TooLong(name) => StrataError::NameTooLong(name),
        other => StrataError::InvalidArgument(other.to_string()),
    }
}

/// Validate one directory or snapshot name component.
pub fn check_name(name: &str) -> Result<()> {
    strata_types::validate_component(name).map_err(name_error)
}

pub(crate) fn to_signed(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}
