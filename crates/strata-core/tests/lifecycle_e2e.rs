#![forbid(unsafe_code)]
//! End-to-end pool lifecycle tests.
//!
//! Scenarios tested:
//! 1. Import from a published uberblock restores directories, accounting
//!    and object contents.
//! 2. A durability fault while syncing suspends the pool without
//!    publishing a partial root.
//! 3. Namespace administration: paths, rename, destroy.
//! 4. Idle object sets and directories are evicted and reload on demand.
//! 5. Generation triggers and configuration validation.
//! 6. Filesystem and snapshot count limits on create, snapshot and rename.

use std::sync::Arc;
use std::time::Duration;
use strata_core::{
    BlockStore, DirId, GenerationConfig, ManualClock, MemBlockStore, ObjectId, Owner, Pool, PoolConfig,
    StrataError,
};

const KIB: u64 = 1024;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn test_config() -> PoolConfig {
    PoolConfig {
        min_slop_bytes: 0,
        ..PoolConfig::with_capacity(16 << 20)
    }
}

fn new_pool() -> (Pool, Arc<MemBlockStore>) {
    let mem = Arc::new(MemBlockStore::new(64 << 20));
    let store: Arc<dyn BlockStore> = mem.clone();
    let pool = Pool::create(test_config(), store).expect("create pool");
    (pool, mem)
}

fn write_object(pool: &Pool, dir: DirId, data: &[u8]) -> ObjectId {
    let handle = pool.hold_objset(dir).expect("hold");
    let mut tx = pool.begin_tx(&handle).expect("tx");
    tx.assign(data.len() as u64, data.len() as u64 + KIB, false)
        .expect("assign");
    let id = tx.create_object(Owner::new(7, 7)).expect("create");
    tx.write(id, data).expect("write");
    tx.commit();
    id
}

// ---------------------------------------------------------------------------
// Scenario 1: import
// ---------------------------------------------------------------------------

#[test]
fn import_restores_published_state() {
    let mem = Arc::new(MemBlockStore::new(64 << 20));
    let store: Arc<dyn BlockStore> = mem.clone();
    let pool = Pool::create(test_config(), Arc::clone(&store)).expect("create");
    let a = pool.create_directory(pool.root_id(), "a").expect("a");
    let b = pool.create_directory(a, "b").expect("b");
    pool.set_quota(a, 1 << 20).expect("quota");
    pool.set_reservation(b, 64 * KIB).expect("reservation");
    let obj = write_object(&pool, b, b"hello strata");
    pool.sync_generation().expect("sync");
    pool.snapshot(b, "first").expect("snapshot");

    let uberblock = pool.uberblock().expect("uberblock");
    let before_a = pool.stats(a).expect("stats a");
    let before_b = pool.stats(b).expect("stats b");
    drop(pool);

    let pool = Pool::import(test_config(), store, uberblock).expect("import");
    assert_eq!(pool.synced_txg(), uberblock.txg);
    assert_eq!(pool.open_txg(), uberblock.txg.next());
    assert_eq!(pool.open_directory("tank/a/b").expect("path").id(), b);
    assert_eq!(pool.directory_name(b).expect("name"), "tank/a/b");
    assert_eq!(pool.stats(a).expect("stats a"), before_a);
    assert_eq!(pool.stats(b).expect("stats b"), before_b);
    assert!(pool.snapshots(b).expect("snapshots").contains_key("first"));

    let handle = pool.hold_objset(b).expect("hold");
    assert_eq!(handle.read_object(obj).expect("read"), b"hello strata");
    drop(handle);

    // The imported pool keeps working, and new ids do not collide.
    let c = pool.create_directory(a, "c").expect("c");
    assert!(c != a && c != b);
    write_object(&pool, c, &[3; 2048]);
    pool.sync_generation().expect("sync");
    assert!(pool.stats(c).expect("stats c").used >= 2 * KIB);
    assert!(pool.uberblock().expect("uberblock").txg > uberblock.txg);
}

#[test]
fn corrupted_block_is_reported_on_read() {
    let (pool, mem) = new_pool();
    let dir = pool.create_directory(pool.root_id(), "c").expect("dir");
    let obj = write_object(&pool, dir, &[1; 1000]);
    pool.sync_generation().expect("sync");

    let location = {
        let handle = pool.hold_objset(dir).expect("hold");
        handle
            .object_phys(obj)
            .expect("phys")
            .data
            .expect("data block")
            .location
    };
    // Evict the cached contents so the next read goes to the store.
    pool.sync_generation().expect("sync");
    assert!(mem.corrupt(location));

    let handle = pool.hold_objset(dir).expect("hold");
    let err = handle.read_object(obj).expect_err("checksum mismatch");
    assert!(matches!(err, StrataError::Corruption { .. }));
    assert!(err.is_durability_fault());
}

// ---------------------------------------------------------------------------
// Scenario 2: durability faults
// ---------------------------------------------------------------------------

#[test]
fn write_fault_suspends_pool_and_keeps_last_uberblock() {
    let (pool, mem) = new_pool();
    let dir = pool.create_directory(pool.root_id(), "f").expect("dir");
    let first = write_object(&pool, dir, b"durable");
    pool.sync_generation().expect("sync");
    let published = pool.uberblock().expect("uberblock");

    write_object(&pool, dir, b"lost");
    mem.fail_writes_after(Some(0));
    let err = pool.sync_generation().expect_err("write fault");
    assert!(err.is_durability_fault());
    assert!(pool.is_suspended());
    assert!(pool.pool_stats().suspended);
    assert_eq!(pool.uberblock().expect("uberblock"), published);
    assert_eq!(pool.synced_txg(), published.txg);

    assert!(matches!(pool.sync_generation(), Err(StrataError::Suspended)));
    assert!(matches!(pool.create_directory(pool.root_id(), "z"), Err(StrataError::Suspended)));
    assert!(matches!(pool.reserve(dir, Default::default()), Err(StrataError::Suspended)));
    let handle = pool.hold_objset(dir).expect("hold");
    assert!(matches!(pool.begin_tx(&handle), Err(StrataError::Suspended)));
    assert_eq!(StrataError::Suspended.to_errno(), err.to_errno());
    drop(handle);

    // The published state is intact.
    mem.fail_writes_after(None);
    let store: Arc<dyn BlockStore> = mem.clone();
    let pool = Pool::import(test_config(), store, published).expect("import");
    let handle = pool.hold_objset(dir).expect("hold");
    assert_eq!(handle.read_object(first).expect("read"), b"durable");
    assert_eq!(handle.object_ids(), vec![first]);
}

#[test]
fn fault_inside_admin_task_suspends_pool() {
    let (pool, mem) = new_pool();
    mem.fail_writes_after(Some(0));
    let err = pool
        .create_directory(pool.root_id(), "doomed")
        .expect_err("write fault");
    assert!(err.is_durability_fault());
    assert!(pool.is_suspended());
}

// ---------------------------------------------------------------------------
// Scenario 3: namespace
// ---------------------------------------------------------------------------

#[test]
fn namespace_paths_rename_and_destroy() {
    let (pool, _) = new_pool();
    let root = pool.root_id();
    let a = pool.create_directory(root, "a").expect("a");
    let b = pool.create_directory(root, "b").expect("b");
    let c = pool.create_directory(a, "c").expect("c");

    let opened = pool.open_directory("tank/a/c").expect("open");
    assert_eq!(opened.id(), c);
    assert_eq!(pool.open_directory(c).expect("by id").name(), opened.name());
    assert!(matches!(pool.open_directory("tank/missing"), Err(StrataError::NotFound(_))));
    assert!(matches!(pool.create_directory(a, "c"), Err(StrataError::Exists(_))));
    assert!(matches!(pool.create_directory(a, "x/y"), Err(StrataError::InvalidArgument(_))));
    assert!(matches!(
        pool.create_directory(a, &"n".repeat(300)),
        Err(StrataError::NameTooLong(_))
    ));
    assert_eq!(pool.children(a).expect("children").get("c"), Some(&c));

    write_object(&pool, c, &[5; 4096]);
    pool.sync_generation().expect("sync");
    let used_c = pool.stats(c).expect("c").used;
    assert!(pool.stats(a).expect("a").used_by_children >= used_c);

    pool.rename_directory(c, b, "c2").expect("rename");
    assert_eq!(pool.directory_name(c).expect("name"), "tank/b/c2");
    assert!(pool.children(a).expect("a").is_empty());
    assert_eq!(pool.stats(a).expect("a").used_by_children, 0);
    assert_eq!(pool.stats(b).expect("b").used_by_children, used_c);
    assert!(matches!(
        pool.rename_directory(b, c, "loop"),
        Err(StrataError::InvalidArgument(_))
    ));

    assert!(matches!(pool.destroy_directory(b), Err(StrataError::NotEmpty(_))));
    assert!(matches!(pool.destroy_directory(root), Err(StrataError::Busy(_))));
    {
        let _open = pool.hold_objset(c).expect("hold");
        assert!(matches!(pool.destroy_directory(c), Err(StrataError::Busy(_))));
    }
    // An open directory handle pins it just like an object set hold.
    assert!(matches!(pool.destroy_directory(c), Err(StrataError::Busy(_))));
    drop(opened);

    let root_used = pool.stats(root).expect("root").used;
    pool.destroy_directory(c).expect("destroy");
    assert!(matches!(pool.open_directory("tank/b/c2"), Err(StrataError::NotFound(_))));
    assert!(pool.children(b).expect("b").is_empty());
    assert!(pool.stats(root).expect("root").used < root_used);
    for dir in [root, a, b] {
        let stats = pool.stats(dir).expect("stats");
        assert_eq!(stats.breakdown.expect("breakdown").iter().sum::<u64>(), stats.used);
    }
}

// ---------------------------------------------------------------------------
// Scenario 4: eviction and ownership
// ---------------------------------------------------------------------------

#[test]
fn idle_objsets_and_directories_are_evicted() {
    let (pool, _) = new_pool();
    let a = pool.create_directory(pool.root_id(), "a").expect("a");
    assert!(!pool.is_directory_cached(a));
    let evicted = pool.pool_stats().evicted_objsets;
    assert!(evicted >= 1);

    let handle = pool.hold_objset(a).expect("hold");
    assert!(pool.is_directory_cached(a));
    pool.sync_generation().expect("sync");
    assert!(pool.is_directory_cached(a), "held object set pins its directory");
    assert_eq!(pool.pool_stats().evicted_objsets, evicted);

    drop(handle);
    pool.sync_generation().expect("sync");
    assert!(!pool.is_directory_cached(a));
    assert!(pool.pool_stats().evicted_objsets > evicted);
    assert_eq!(pool.stats(a).expect("reload").name, "tank/a");
}

#[test]
fn ownership_is_exclusive() {
    let (pool, _) = new_pool();
    let a = pool.create_directory(pool.root_id(), "a").expect("a");
    let owner = pool.own_objset(a).expect("own");
    assert!(owner.is_owner());
    assert!(matches!(pool.own_objset(a), Err(StrataError::Busy(_))));
    let reader = pool.hold_objset(a).expect("hold");
    assert!(!reader.is_owner());
    drop(owner);
    let again = pool.own_objset(a).expect("own after release");
    assert_eq!(again.dir_id(), a);
    drop(reader);
}

// ---------------------------------------------------------------------------
// Scenario 5: triggers and configuration
// ---------------------------------------------------------------------------

#[test]
fn tick_syncs_on_interval_and_dirty_threshold() {
    let clock = Arc::new(ManualClock::new());
    let config = PoolConfig {
        generation: GenerationConfig {
            sync_interval: Duration::from_secs(5),
            dirty_threshold: 1 << 20,
        },
        ..test_config()
    };
    let store: Arc<dyn BlockStore> = Arc::new(MemBlockStore::new(64 << 20));
    let pool = Pool::create_with_clock(config, store, clock.clone()).expect("create");
    let dir = pool.create_directory(pool.root_id(), "t").expect("dir");

    assert_eq!(pool.tick().expect("tick"), None);
    clock.advance(Duration::from_secs(6));
    let synced = pool.tick().expect("tick").expect("interval elapsed");
    assert_eq!(pool.synced_txg(), synced);
    assert_eq!(pool.tick().expect("tick"), None);

    write_object(&pool, dir, &vec![0; 2 << 20]);
    let synced = pool.tick().expect("tick").expect("dirty threshold crossed");
    assert_eq!(pool.synced_txg(), synced);
    assert!(pool.stats(dir).expect("stats").used >= 2 << 20);
}

#[test]
fn invalid_configuration_is_rejected() {
    let store: Arc<dyn BlockStore> = Arc::new(MemBlockStore::new(1 << 20));
    let missing = PoolConfig::default();
    assert!(matches!(
        Pool::create(missing, Arc::clone(&store)),
        Err(StrataError::InvalidArgument(_))
    ));
    let odd = PoolConfig {
        block_granularity: 1000,
        ..test_config()
    };
    assert!(matches!(Pool::create(odd, Arc::clone(&store)), Err(StrataError::InvalidArgument(_))));
    let bad_name = PoolConfig {
        name: "a/b".to_owned(),
        ..test_config()
    };
    assert!(matches!(Pool::create(bad_name, store), Err(StrataError::InvalidArgument(_))));
}

#[test]
fn config_round_trips_through_json() {
    let config = test_config();
    let json = serde_json::to_string(&config).expect("serialize");
    let back: PoolConfig = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back, config);
    let sparse: PoolConfig = serde_json::from_str(r#"{"capacity_bytes": 4096}"#).expect("defaults");
    assert_eq!(sparse.name, "tank");
    assert_eq!(sparse.slop_shift, 5);
    assert_eq!(sparse.capacity_bytes, 4096);
}

// ---------------------------------------------------------------------------
// Scenario 6: count limits
// ---------------------------------------------------------------------------

#[test]
fn filesystem_limit_bounds_creates_anywhere_below() {
    let (pool, _) = new_pool();
    let root = pool.root_id();
    let home = pool.create_directory(root, "home").expect("home");
    let alice = pool.create_directory(home, "alice").expect("alice");
    // The meta directory is not a filesystem.
    assert_eq!(pool.stats(root).expect("root").filesystem_count, 2);

    pool.set_filesystem_limit(home, Some(2)).expect("limit");
    pool.create_directory(alice, "docs").expect("second below home");
    let err = pool.create_directory(home, "bob").expect_err("third below home");
    assert!(matches!(err, StrataError::QuotaExceeded));
    assert!(pool.children(home).expect("children").get("bob").is_none());

    let stats = pool.stats(home).expect("home");
    assert_eq!((stats.filesystem_count, stats.filesystem_limit), (2, Some(2)));
    pool.create_directory(root, "srv").expect("outside the limited subtree");

    let docs = pool.children(alice).expect("children")["docs"];
    pool.destroy_directory(docs).expect("destroy");
    pool.create_directory(home, "bob").expect("room after destroy");

    pool.set_filesystem_limit(home, None).expect("clear");
    pool.create_directory(home, "carol").expect("unlimited");
}

#[test]
fn snapshot_limit_counts_descendant_snapshots() {
    let (pool, _) = new_pool();
    let root = pool.root_id();
    let home = pool.create_directory(root, "home").expect("home");
    let alice = pool.create_directory(home, "alice").expect("alice");
    pool.set_snapshot_limit(home, Some(1)).expect("limit");

    pool.snapshot(alice, "monday").expect("first snapshot");
    assert_eq!(pool.stats(home).expect("home").snapshot_count, 1);
    assert_eq!(pool.stats(root).expect("root").snapshot_count, 1);
    assert!(matches!(pool.snapshot(home, "tuesday"), Err(StrataError::QuotaExceeded)));
    assert!(matches!(pool.snapshot(alice, "tuesday"), Err(StrataError::QuotaExceeded)));
    pool.snapshot(root, "tuesday").expect("root is not limited");
    assert_eq!(pool.stats(root).expect("root").snapshot_count, 2);
}

#[test]
fn rename_moves_counts_and_respects_destination_limits() {
    let (pool, mem) = new_pool();
    let root = pool.root_id();
    let src = pool.create_directory(root, "src").expect("src");
    let dst = pool.create_directory(root, "dst").expect("dst");
    let d = pool.create_directory(src, "d").expect("d");
    pool.create_directory(d, "e").expect("e");
    pool.snapshot(d, "snap").expect("snapshot");

    pool.set_filesystem_limit(dst, Some(1)).expect("fs limit");
    assert!(matches!(
        pool.rename_directory(d, dst, "d"),
        Err(StrataError::QuotaExceeded)
    ));
    pool.set_filesystem_limit(dst, Some(2)).expect("fs limit");
    pool.set_snapshot_limit(dst, Some(1)).expect("snapshot limit");
    // The root's own limit is not consulted for a move beneath it.
    pool.set_filesystem_limit(root, Some(4)).expect("root limit");
    pool.rename_directory(d, dst, "d").expect("rename");

    let src_stats = pool.stats(src).expect("src");
    let dst_stats = pool.stats(dst).expect("dst");
    assert_eq!((src_stats.filesystem_count, src_stats.snapshot_count), (0, 0));
    assert_eq!((dst_stats.filesystem_count, dst_stats.snapshot_count), (2, 1));
    assert_eq!(pool.stats(root).expect("root").filesystem_count, 4);

    // Counts and limits are durable.
    pool.sync_generation().expect("sync");
    let uberblock = pool.uberblock().expect("uberblock");
    drop(pool);
    let store: Arc<dyn BlockStore> = mem;
    let pool = Pool::import(test_config(), store, uberblock).expect("import");
    let dst_stats = pool.stats(dst).expect("dst");
    assert_eq!(dst_stats.filesystem_limit, Some(2));
    assert_eq!(dst_stats.snapshot_limit, Some(1));
    assert_eq!(dst_stats.filesystem_count, 2);
    assert!(matches!(
        pool.create_directory(dst, "more"),
        Err(StrataError::QuotaExceeded)
    ));
}
