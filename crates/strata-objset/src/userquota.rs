//! Per-identity usage reconciliation.
//!
//! Every object synced in a generation leaves a [`SyncedEntry`] describing
//! what it used to contribute and what it contributes now. Reconciliation
//! folds those entries into one signed delta per accounting key, first per
//! shard in parallel and then merged, so each key costs exactly one
//! increment of its table however many objects touched it.

use crate::dnode::{OBJECT_FLAG_PROJECT_ACCOUNTED, OBJECT_FLAG_USER_ACCOUNTED, OBJECT_FLAG_USEROBJ_ACCOUNTED};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strata_types::{IdentityKind, Owner, object_count_key, usage_key};

/// What one object contributes to the accounting tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Usage {
    pub(crate) owner: Owner,
    pub(crate) bytes: u64,
    pub(crate) flags: u32,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SyncedEntry {
    pub(crate) old: Option<Usage>,
    pub(crate) new: Option<Usage>,
}

/// Shard-local delta cache, keyed by table and encoded identity.
pub(crate) type DeltaCache = BTreeMap<(IdentityKind, String), i64>;

fn add_usage(cache: &mut DeltaCache, usage: &Usage, sign: i64) {
    let bytes = i64::try_from(usage.bytes).unwrap_or(i64::MAX) * sign;
    let user_bytes = usage.flags & OBJECT_FLAG_USER_ACCOUNTED != 0;
    let objects = usage.flags & OBJECT_FLAG_USEROBJ_ACCOUNTED != 0;
    let project = usage.flags & OBJECT_FLAG_PROJECT_ACCOUNTED != 0;
    for kind in IdentityKind::ALL {
        let (count_bytes, count_objects) = match kind {
            IdentityKind::User | IdentityKind::Group => (user_bytes, objects),
            IdentityKind::Project => (project, project && objects),
        };
        let id = usage.owner.id(kind);
        if count_bytes {
            *cache.entry((kind, usage_key(id))).or_insert(0) += bytes;
        }
        if count_objects {
            *cache.entry((kind, object_count_key(id))).or_insert(0) += sign;
        }
    }
}

/// Fold one shard's synced entries into a delta cache.
pub(crate) fn fold_entries(entries: &[SyncedEntry]) -> DeltaCache {
    let mut cache = DeltaCache::new();
    for entry in entries {
        if let Some(old) = entry.old.as_ref() {
            add_usage(&mut cache, old, -1);
        }
        if let Some(new) = entry.new.as_ref() {
            add_usage(&mut cache, new, 1);
        }
    }
    cache
}

/// Merge shard caches, dropping keys whose deltas cancel out.
pub(crate) fn merge_caches(caches: impl IntoIterator<Item = DeltaCache>) -> DeltaCache {
    let mut merged = DeltaCache::new();
    for cache in caches {
        for (key, delta) in cache {
            *merged.entry(key).or_insert(0) += delta;
        }
    }
    merged.retain(|_, delta| *delta != 0);
    merged
}

/// One per-identity accounting object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountingTable {
    pub entries: BTreeMap<String, i64>,
}

impl AccountingTable {
    /// Apply one increment. Keys that reach zero are removed.
    pub fn increment(&mut self, key: &str, delta: i64) {
        let value = self.entries.entry(key.to_owned()).or_insert(0);
        *value += delta;
        if *value == 0 {
            self.entries.remove(key);
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> i64 {
        self.entries.get(key).copied().unwrap_or(0)
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Synced objects folded in.
    pub entries: u64,
    /// Increments applied per table, indexed by [`IdentityKind::index`].
    pub increments: [u64; 3],
}

impl ReconcileReport {
    #[must_use]
    pub fn increments_for(&self, kind: IdentityKind) -> u64 {
        self.increments[kind.index()]
    }
}
