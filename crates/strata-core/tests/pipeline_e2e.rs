#![forbid(unsafe_code)]
//! End-to-end commit pipeline tests.
//!
//! Scenarios tested:
//! 1. Reconciliation applies one increment per identity, however many
//!    objects each identity owns.
//! 2. Per-identity usage follows ownership changes and frees.
//! 3. Dataset usage equals the bytes of the blocks it references.
//! 4. Snapshots keep overwritten blocks alive and read-only.
//! 5. The userspace upgrade accounts pre-existing objects and can be
//!    interrupted without losing progress.
//! 6. Property: per-identity usage equals the sum of what each identity's
//!    live objects are charged, for random object sizes and owners.

use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::{Arc, Barrier};
use strata_core::{
    BlockStore, DirId, FeatureFlags, IdentityKind, MemBlockStore, ObjectId, Owner, Pool, PoolConfig,
    StrataError, UpgradeStatus,
};

const KIB: u64 = 1024;
/// Charge for an object of at most 508 bytes: one data unit plus its
/// descriptor.
const SMALL_OBJECT: u64 = 512 + 512;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config(features: FeatureFlags) -> PoolConfig {
    PoolConfig {
        min_slop_bytes: 0,
        features,
        ..PoolConfig::with_capacity(64 << 20)
    }
}

fn new_pool(features: FeatureFlags) -> Pool {
    let store: Arc<dyn BlockStore> = Arc::new(MemBlockStore::new(128 << 20));
    Pool::create(config(features), store).expect("create pool")
}

/// Create `count` objects of `len` bytes in one transaction; object `i` is
/// owned by `owner(i)`.
fn populate(pool: &Pool, dir: DirId, count: u64, len: usize, owner: impl Fn(u64) -> Owner) -> Vec<ObjectId> {
    let handle = pool.hold_objset(dir).expect("hold");
    let mut tx = pool.begin_tx(&handle).expect("tx");
    tx.assign(count * len as u64, count * (len as u64 + KIB), false)
        .expect("assign");
    let ids = (0..count)
        .map(|i| {
            let id = tx.create_object(owner(i)).expect("create");
            tx.write(id, &vec![0x5a; len]).expect("write");
            id
        })
        .collect();
    tx.commit();
    ids
}

fn overwrite(pool: &Pool, dir: DirId, id: ObjectId, data: &[u8]) {
    let handle = pool.hold_objset(dir).expect("hold");
    let mut tx = pool.begin_tx(&handle).expect("tx");
    tx.assign(data.len() as u64, data.len() as u64 + KIB, false)
        .expect("assign");
    tx.write(id, data).expect("write");
    tx.commit();
}

// ---------------------------------------------------------------------------
// Scenario 1: one increment per identity
// ---------------------------------------------------------------------------

#[test]
fn thousand_objects_eight_identities_apply_eight_increments() {
    let features = FeatureFlags {
        object_accounting: false,
        ..FeatureFlags::default()
    };
    let pool = new_pool(features);
    let dir = pool.create_directory(pool.root_id(), "d").expect("dir");
    let handle = pool.own_objset(dir).expect("own");

    populate(&pool, dir, 1000, 100, |i| Owner::new(i % 8, 100));
    pool.sync_generation().expect("sync");

    assert_eq!(handle.accounting_increments(IdentityKind::User), 8);
    assert_eq!(handle.accounting_increments(IdentityKind::Group), 1);
    assert_eq!(handle.accounting_increments(IdentityKind::Project), 1);
    for user in 0..8 {
        // 100 bytes plus the checksum trailer round up to one 512-byte unit,
        // on top of the 512-byte descriptor.
        assert_eq!(handle.space_used(IdentityKind::User, user), 125 * SMALL_OBJECT);
        assert_eq!(handle.objects_used(IdentityKind::User, user), 0);
    }
    assert_eq!(handle.space_used(IdentityKind::Group, 100), 1000 * SMALL_OBJECT);
    assert_eq!(handle.root_phys().fill, 1000);
}

#[test]
fn concurrent_writers_reconcile_once() {
    let pool = new_pool(FeatureFlags::default());
    let dir = pool.create_directory(pool.root_id(), "par").expect("dir");
    let handle = pool.own_objset(dir).expect("own");

    let barrier = Arc::new(Barrier::new(4));
    std::thread::scope(|s| {
        for t in 0..4_u64 {
            let barrier = Arc::clone(&barrier);
            let pool = &pool;
            s.spawn(move || {
                barrier.wait();
                populate(pool, dir, 50, 200, |_| Owner::new(t, 0));
            });
        }
    });
    pool.sync_generation().expect("sync");

    assert_eq!(handle.object_ids().len(), 200);
    for user in 0..4 {
        assert_eq!(handle.space_used(IdentityKind::User, user), 50 * SMALL_OBJECT);
        assert_eq!(handle.objects_used(IdentityKind::User, user), 50);
    }
    assert_eq!(handle.objects_used(IdentityKind::Group, 0), 200);
}

// ---------------------------------------------------------------------------
// Scenario 2: ownership changes and frees
// ---------------------------------------------------------------------------

#[test]
fn identity_usage_follows_owner_changes_and_frees() {
    let pool = new_pool(FeatureFlags::default());
    let dir = pool.create_directory(pool.root_id(), "u").expect("dir");
    let handle = pool.own_objset(dir).expect("own");
    let ids = populate(&pool, dir, 5, 1000, |i| {
        Owner::new(if i < 3 { 1 } else { 2 }, 10).with_project(7)
    });
    pool.sync_generation().expect("sync");

    // 1000 bytes seal into a 1 KiB block, plus the descriptor.
    let each = KIB + 512;
    assert_eq!(handle.space_used(IdentityKind::User, 1), 3 * each);
    assert_eq!(handle.space_used(IdentityKind::User, 2), 2 * each);
    assert_eq!(handle.objects_used(IdentityKind::User, 1), 3);
    assert_eq!(handle.space_used(IdentityKind::Project, 7), 5 * each);
    assert_eq!(handle.objects_used(IdentityKind::Project, 7), 5);

    {
        let mut tx = pool.begin_tx(&handle).expect("tx");
        tx.assign(0, 0, true).expect("assign");
        tx.set_owner(ids[0], Owner::new(2, 10).with_project(7)).expect("chown");
        tx.free(ids[4]).expect("free");
        tx.commit();
    }
    pool.sync_generation().expect("sync");

    assert_eq!(handle.space_used(IdentityKind::User, 1), 2 * each);
    assert_eq!(handle.space_used(IdentityKind::User, 2), 2 * each);
    assert_eq!(handle.objects_used(IdentityKind::User, 2), 2);
    assert_eq!(handle.space_used(IdentityKind::Group, 10), 4 * each);
    assert_eq!(handle.objects_used(IdentityKind::Project, 7), 4);
    assert!(!handle.contains(ids[4]));
    assert!(matches!(handle.read_object(ids[4]), Err(StrataError::NotFound(_))));

    let entries = handle.accounting_entries(IdentityKind::User);
    assert_eq!(entries.get("1"), Some(&3072));
    assert_eq!(entries.get("obj-1"), Some(&2));
}

#[test]
fn disabled_accounting_keeps_tables_empty() {
    let pool = new_pool(FeatureFlags::none());
    let dir = pool.create_directory(pool.root_id(), "plain").expect("dir");
    let handle = pool.own_objset(dir).expect("own");
    populate(&pool, dir, 10, 100, |_| Owner::new(5, 5));
    pool.sync_generation().expect("sync");

    assert!(!handle.accounting_active());
    assert!(!handle.userspace_present());
    assert_eq!(handle.space_used(IdentityKind::User, 5), 0);
    assert!(handle.accounting_entries(IdentityKind::User).is_empty());
}

// ---------------------------------------------------------------------------
// Scenario 3: usage matches referenced blocks
// ---------------------------------------------------------------------------

#[test]
fn dataset_usage_matches_live_blocks_and_breakdown_sums() {
    let pool = new_pool(FeatureFlags::default());
    let top = pool.create_directory(pool.root_id(), "top").expect("top");
    let dir = pool.create_directory(top, "leaf").expect("leaf");
    pool.set_reservation(dir, 256 * KIB).expect("reservation");
    let handle = pool.own_objset(dir).expect("own");

    let ids = populate(&pool, dir, 20, 3000, |i| Owner::new(i % 3, 0));
    pool.sync_generation().expect("sync");
    overwrite(&pool, dir, ids[0], &[1; 9000]);
    pool.sync_generation().expect("sync");

    let live: u64 = handle.live_blocks().iter().map(|bp| bp.physical_size).sum();
    let stats = pool.stats(dir).expect("stats");
    assert_eq!(stats.used_by_dataset, live);
    assert_eq!(stats.used, live);
    assert_eq!(stats.referenced, live);
    assert!(stats.logical_used >= 20 * 3000);
    assert_eq!(stats.compression_ratio, stats.logical_used * 100 / stats.compressed);

    for id in [pool.root_id(), top, dir] {
        let stats = pool.stats(id).expect("stats");
        let breakdown = stats.breakdown.expect("breakdown tracked");
        assert_eq!(breakdown.iter().sum::<u64>(), stats.used, "directory {id}");
    }
    // `top` carries the unused part of the reservation as child usage.
    let top_stats = pool.stats(top).expect("top");
    assert_eq!(top_stats.used_by_children, (256 * KIB).max(stats.used));
}

#[test]
fn overwritten_blocks_are_freed_two_generations_later() {
    let mem = Arc::new(MemBlockStore::new(128 << 20));
    let store: Arc<dyn BlockStore> = mem.clone();
    let pool = Pool::create(config(FeatureFlags::default()), store).expect("create");
    let dir = pool.create_directory(pool.root_id(), "cow").expect("dir");
    let ids = populate(&pool, dir, 1, 32 * 1024, |_| Owner::new(1, 1));
    pool.sync_generation().expect("sync");

    overwrite(&pool, dir, ids[0], &[9; 32 * 1024]);
    pool.sync_generation().expect("sync");
    let deferred = pool.pool_stats().deferred;
    assert!(deferred >= 32 * KIB, "old data block is held back: {deferred}");

    pool.sync_generation().expect("sync");
    pool.sync_generation().expect("sync");
    assert!(pool.pool_stats().deferred < deferred);
    assert!(mem.free_count() > 0);
}

// ---------------------------------------------------------------------------
// Scenario 4: snapshots
// ---------------------------------------------------------------------------

#[test]
fn snapshot_preserves_overwritten_data() {
    let pool = new_pool(FeatureFlags::default());
    let dir = pool.create_directory(pool.root_id(), "snap").expect("dir");
    let ids = populate(&pool, dir, 1, 8192, |_| Owner::new(1, 1));
    pool.sync_generation().expect("sync");

    let snap_txg = pool.snapshot(dir, "s1").expect("snapshot");
    assert_eq!(pool.snapshots(dir).expect("list").get("s1"), Some(&snap_txg));
    assert!(matches!(pool.snapshot(dir, "s1"), Err(StrataError::Exists(_))));
    assert!(matches!(pool.snapshot(dir, "bad@name"), Err(StrataError::InvalidArgument(_))));

    overwrite(&pool, dir, ids[0], &[2; 8192]);
    pool.sync_generation().expect("sync");

    let stats = pool.stats(dir).expect("stats");
    assert!(stats.used_by_snapshots >= 8 * KIB);
    assert!(stats.used >= stats.used_by_dataset + stats.used_by_snapshots);

    let head = pool.hold_objset(dir).expect("head");
    assert_eq!(head.read_object(ids[0]).expect("head read"), vec![2; 8192]);
    let snap = pool.hold_snapshot(dir, "s1").expect("snapshot");
    assert_eq!(snap.read_object(ids[0]).expect("snap read"), vec![0x5a; 8192]);

    assert!(matches!(pool.begin_tx(&snap), Err(StrataError::ReadOnly)));
    assert!(matches!(snap.write_object(pool.open_txg(), ids[0], b"x"), Err(StrataError::ReadOnly)));
    assert!(matches!(pool.hold_snapshot(dir, "missing"), Err(StrataError::NotFound(_))));
    drop((head, snap));
    assert!(matches!(pool.destroy_directory(dir), Err(StrataError::Busy(_))));
}

// ---------------------------------------------------------------------------
// Scenario 5: userspace upgrade
// ---------------------------------------------------------------------------

#[test]
fn upgrade_accounts_objects_written_before_accounting() {
    let pool = new_pool(FeatureFlags::none());
    let dir = pool.create_directory(pool.root_id(), "old").expect("dir");
    populate(&pool, dir, 5, 100, |_| Owner::new(42, 42));
    pool.sync_generation().expect("sync");

    let handle = pool.own_objset(dir).expect("own");
    assert!(matches!(pool.start_userspace_upgrade(&handle), Err(StrataError::NotSupported(_))));

    pool.enable_features(FeatureFlags::default());
    let reader = pool.hold_objset(dir).expect("hold");
    assert!(matches!(pool.start_userspace_upgrade(&reader), Err(StrataError::InvalidArgument(_))));
    drop(reader);

    pool.start_userspace_upgrade(&handle).expect("start");
    assert_eq!(pool.wait_userspace_upgrade(&handle), UpgradeStatus::Complete);
    pool.sync_generation().expect("sync");

    assert!(handle.userspace_present());
    assert_eq!(handle.space_used(IdentityKind::User, 42), 5 * SMALL_OBJECT);
    assert_eq!(handle.objects_used(IdentityKind::User, 42), 5);
    assert_eq!(pool.userspace_upgrade_status(&handle), UpgradeStatus::Complete);

    // Already complete: returns at once.
    pool.start_userspace_upgrade(&handle).expect("restart");
    assert_eq!(pool.userspace_upgrade_status(&handle), UpgradeStatus::Complete);
}

#[test]
fn interrupted_upgrade_keeps_partial_progress() {
    let pool = new_pool(FeatureFlags::none());
    let dir = pool.create_directory(pool.root_id(), "big").expect("dir");
    populate(&pool, dir, 2000, 100, |_| Owner::new(9, 9));
    pool.sync_generation().expect("sync");
    pool.enable_features(FeatureFlags::default());

    let handle = pool.own_objset(dir).expect("own");
    pool.start_userspace_upgrade(&handle).expect("start");
    let done = match pool.stop_userspace_upgrade(&handle) {
        UpgradeStatus::Interrupted { done } => done,
        UpgradeStatus::Complete => 2000,
        other => panic!("unexpected upgrade status {other:?}"),
    };
    pool.sync_generation().expect("sync");
    assert_eq!(handle.objects_used(IdentityKind::User, 9), done);

    if done < 2000 {
        assert!(!handle.userspace_present());
        pool.start_userspace_upgrade(&handle).expect("resume");
        assert_eq!(pool.wait_userspace_upgrade(&handle), UpgradeStatus::Complete);
        pool.sync_generation().expect("sync");
    }
    assert!(handle.userspace_present());
    assert_eq!(handle.objects_used(IdentityKind::User, 9), 2000);
    assert_eq!(handle.space_used(IdentityKind::User, 9), 2000 * SMALL_OBJECT);
}

#[test]
fn upgrade_is_refused_on_snapshots() {
    let pool = new_pool(FeatureFlags::default());
    let dir = pool.create_directory(pool.root_id(), "s").expect("dir");
    pool.snapshot(dir, "now").expect("snapshot");
    let snap = pool.hold_snapshot(dir, "now").expect("hold snapshot");
    assert!(matches!(pool.start_userspace_upgrade(&snap), Err(StrataError::ReadOnly)));
}

// ---------------------------------------------------------------------------
// Scenario 6: reconciliation property
// ---------------------------------------------------------------------------

/// Descriptor plus the sealed data rounded to the 512-byte unit.
fn charge_for(len: usize) -> u64 {
    512 + (len as u64 + 4).div_ceil(512) * 512
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn identity_usage_matches_live_objects(
        objects in proptest::collection::vec((0..5_u64, 1..3000_usize), 1..60),
        frees in proptest::collection::vec(any::<bool>(), 60),
    ) {
        let pool = new_pool(FeatureFlags::default());
        let dir = pool.create_directory(pool.root_id(), "p").expect("dir");
        let handle = pool.own_objset(dir).expect("own");

        let mut ids = Vec::new();
        {
            let mut tx = pool.begin_tx(&handle).expect("tx");
            tx.assign(0, 4 << 20, false).expect("assign");
            for &(user, len) in &objects {
                let id = tx.create_object(Owner::new(user, 1)).expect("create");
                tx.write(id, &vec![3; len]).expect("write");
                ids.push(id);
            }
            tx.commit();
        }
        pool.sync_generation().expect("sync");
        {
            let mut tx = pool.begin_tx(&handle).expect("tx");
            tx.assign(0, 0, true).expect("assign");
            for (id, free) in ids.iter().zip(&frees) {
                if *free {
                    tx.free(*id).expect("free");
                }
            }
            tx.commit();
        }
        pool.sync_generation().expect("sync");

        let mut expected: BTreeMap<u64, (u64, u64)> = BTreeMap::new();
        for (i, &(user, len)) in objects.iter().enumerate() {
            if !frees[i] {
                let entry = expected.entry(user).or_default();
                entry.0 += charge_for(len);
                entry.1 += 1;
            }
        }
        let mut total = 0;
        for user in 0..5 {
            let (bytes, count) = expected.get(&user).copied().unwrap_or_default();
            prop_assert_eq!(handle.space_used(IdentityKind::User, user), bytes);
            prop_assert_eq!(handle.objects_used(IdentityKind::User, user), count);
            total += bytes;
        }
        prop_assert_eq!(handle.space_used(IdentityKind::Group, 1), total);
    }
}
