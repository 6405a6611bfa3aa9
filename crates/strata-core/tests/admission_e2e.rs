#![forbid(unsafe_code)]
//! End-to-end admission tests against a whole pool.
//!
//! Scenarios tested:
//! 1. A child quota binds while its parent still has headroom.
//! 2. A sibling sees the unused part of a reservation as unavailable.
//! 3. Concurrent reservations against one leaf never both succeed.
//! 4. Requests land exactly on a quota boundary.
//! 5. Ticket cancellation is idempotent; outstanding tickets clear at sync.
//! 6. Tickets taken while generations sync concurrently are released by the
//!    sync of the generation they were issued in.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use strata_core::{
    BlockStore, DirId, MemBlockStore, ObjectId, Owner, Pool, PoolConfig, ReserveRequest, Result,
    StrataError, Ticket,
};

const KIB: u64 = 1024;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn new_pool() -> Pool {
    let store: Arc<dyn BlockStore> = Arc::new(MemBlockStore::new(64 << 20));
    let config = PoolConfig {
        min_slop_bytes: 0,
        ..PoolConfig::with_capacity(16 << 20)
    };
    Pool::create(config, store).expect("create pool")
}

fn reserve(pool: &Pool, dir: DirId, physical: u64) -> Result<Ticket> {
    pool.reserve(
        dir,
        ReserveRequest {
            physical,
            ..ReserveRequest::default()
        },
    )
}

/// Write one object of `len` bytes into `dir`'s dataset and sync it.
fn write_object(pool: &Pool, dir: DirId, len: u64) -> ObjectId {
    let handle = pool.hold_objset(dir).expect("hold objset");
    let mut tx = pool.begin_tx(&handle).expect("begin tx");
    tx.assign(len, len + KIB, false).expect("assign");
    let id = tx.create_object(Owner::new(1000, 1000)).expect("create object");
    tx.write(id, &vec![0xab; usize::try_from(len).expect("len")])
        .expect("write");
    tx.commit();
    drop(handle);
    pool.sync_generation().expect("sync");
    id
}

// ---------------------------------------------------------------------------
// Scenario 1: child quota binds under parent headroom
// ---------------------------------------------------------------------------

#[test]
fn child_quota_binds_while_parent_has_headroom() {
    let pool = new_pool();
    let top = pool.create_directory(pool.root_id(), "top").expect("top");
    let a = pool.create_directory(top, "a").expect("a");
    let b = pool.create_directory(top, "b").expect("b");
    pool.set_quota(top, 120 * KIB).expect("quota top");
    pool.set_quota(a, 60 * KIB).expect("quota a");
    pool.set_reservation(b, 30 * KIB).expect("reservation b");

    let ticket = reserve(&pool, a, 55 * KIB).expect("55 KiB fits under 60 KiB");
    // Retryable while the first ticket is still outstanding.
    assert!(matches!(reserve(&pool, a, 10 * KIB), Err(StrataError::Restart)));
    assert!(pool.cancel(&ticket));

    write_object(&pool, a, 55 * KIB);
    let used_a = pool.stats(a).expect("stats a").used;
    assert!(used_a + 10 * KIB > 60 * KIB, "a uses {used_a}");

    let err = reserve(&pool, a, 10 * KIB).expect_err("over a's quota");
    assert!(matches!(err, StrataError::QuotaExceeded));
    assert!(err.is_admission_denied() && !err.is_retryable());
    assert!(pool.stats(top).expect("stats top").available >= 10 * KIB);
}

#[test]
fn parent_quota_binds_when_sibling_reservation_is_counted() {
    let pool = new_pool();
    let top = pool.create_directory(pool.root_id(), "top").expect("top");
    let a = pool.create_directory(top, "a").expect("a");
    let b = pool.create_directory(top, "b").expect("b");
    pool.set_quota(top, 100 * KIB).expect("quota top");
    pool.set_quota(a, 60 * KIB).expect("quota a");
    pool.set_reservation(b, 50 * KIB).expect("reservation b");

    // 55 + 50 does not fit under 100.
    assert!(matches!(reserve(&pool, a, 55 * KIB), Err(StrataError::QuotaExceeded)));
    assert_eq!(pool.tempreserved(a, pool.open_txg()).expect("a"), 0);
    assert_eq!(pool.tempreserved(top, pool.open_txg()).expect("top"), 0);
}

// ---------------------------------------------------------------------------
// Scenario 2: unused reservation
// ---------------------------------------------------------------------------

#[test]
fn sibling_available_excludes_unused_reservation() {
    let pool = new_pool();
    let x = pool.create_directory(pool.root_id(), "x").expect("x");
    let y = pool.create_directory(pool.root_id(), "y").expect("y");
    pool.set_reservation(x, 50 * KIB).expect("reservation");
    write_object(&pool, x, 18 * KIB);

    let sx = pool.stats(x).expect("stats x");
    let sy = pool.stats(y).expect("stats y");
    assert!(sx.used < 50 * KIB);
    assert_eq!(sx.available - sy.available, 50 * KIB - sx.used);

    // The root is charged the full reservation, not the usage.
    let root = pool.stats(pool.root_id()).expect("root");
    assert!(root.used_by_children >= 50 * KIB);
}

// ---------------------------------------------------------------------------
// Scenario 3: concurrent reservations
// ---------------------------------------------------------------------------

#[test]
fn concurrent_reservations_on_leaf_never_both_succeed() {
    let pool = new_pool();
    let leaf = pool.create_directory(pool.root_id(), "leaf").expect("leaf");
    pool.set_quota(leaf, 60 * KIB).expect("quota");

    for _ in 0..16 {
        let barrier = Arc::new(Barrier::new(2));
        let results: Vec<Result<Ticket>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let barrier = Arc::clone(&barrier);
                    let pool = &pool;
                    s.spawn(move || {
                        barrier.wait();
                        reserve(pool, leaf, 40 * KIB)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("reserve thread"))
                .collect()
        });
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let err = results
            .iter()
            .find_map(|r| r.as_ref().err())
            .expect("one denial");
        assert!(matches!(err, StrataError::Restart | StrataError::QuotaExceeded));
        for ticket in results.iter().flatten() {
            pool.cancel(ticket);
        }
        assert_eq!(pool.tempreserved(leaf, pool.open_txg()).expect("leaf"), 0);
    }
}

// ---------------------------------------------------------------------------
// Scenario 4: quota boundary
// ---------------------------------------------------------------------------

#[test]
fn request_to_exact_quota_succeeds_one_byte_more_fails() {
    let pool = new_pool();
    let dir = pool.create_directory(pool.root_id(), "edge").expect("edge");
    pool.set_quota(dir, 64 * KIB).expect("quota");
    write_object(&pool, dir, 8 * KIB);

    let used = pool.stats(dir).expect("stats").used;
    let room = 64 * KIB - used;
    let ticket = reserve(&pool, dir, room).expect("exactly to quota");
    assert!(pool.cancel(&ticket));
    assert!(matches!(reserve(&pool, dir, room + 1), Err(StrataError::QuotaExceeded)));
}

#[test]
fn net_free_request_ignores_directory_quota() {
    let pool = new_pool();
    let dir = pool.create_directory(pool.root_id(), "full").expect("full");
    pool.set_quota(dir, 16 * KIB).expect("quota");
    write_object(&pool, dir, 12 * KIB);

    let ticket = pool
        .reserve(
            dir,
            ReserveRequest {
                physical: 8 * KIB,
                net_free: true,
                ..ReserveRequest::default()
            },
        )
        .expect("net-free request is admitted");
    pool.cancel(&ticket);
}

#[test]
fn ref_quota_bounds_referenced_bytes() {
    let pool = new_pool();
    let dir = pool.create_directory(pool.root_id(), "refq").expect("refq");
    write_object(&pool, dir, 4 * KIB);
    let referenced = pool.stats(dir).expect("stats").referenced;
    assert!(referenced >= 4 * KIB);
    pool.set_ref_quota(dir, referenced + 2 * KIB).expect("ref quota");

    let handle = pool.hold_objset(dir).expect("hold");
    let mut tx = pool.begin_tx(&handle).expect("tx");
    assert!(matches!(tx.assign(0, 8 * KIB, false), Err(StrataError::QuotaExceeded)));
    assert_eq!(tx.txg(), None);
    tx.assign(0, KIB, false).expect("fits under ref quota");
    tx.commit();

    // Cannot drop below what is already referenced.
    assert!(matches!(pool.set_ref_quota(dir, 1), Err(StrataError::NoSpace)));
}

#[test]
fn ref_quota_only_checked_when_physical_exceeds_logical() {
    let pool = new_pool();
    let dir = pool.create_directory(pool.root_id(), "refl").expect("refl");
    write_object(&pool, dir, 4 * KIB);
    let referenced = pool.stats(dir).expect("stats").referenced;
    pool.set_ref_quota(dir, referenced + 2 * KIB).expect("ref quota");

    let handle = pool.hold_objset(dir).expect("hold");
    let mut tx = pool.begin_tx(&handle).expect("tx");
    assert!(matches!(tx.assign(4 * KIB, 8 * KIB, false), Err(StrataError::QuotaExceeded)));
    // A write whose allocation does not outgrow its buffered size skips the
    // reference quota.
    tx.assign(8 * KIB, 8 * KIB, false).expect("logical covers physical");
    drop(tx);

    let mut tx = pool.begin_tx(&handle).expect("tx");
    tx.assign(16 * KIB, 8 * KIB, false).expect("compressed write");
    drop(tx);
}

// ---------------------------------------------------------------------------
// Scenario 5: ticket lifecycle
// ---------------------------------------------------------------------------

#[test]
fn cancel_is_idempotent() {
    let pool = new_pool();
    let dir = pool.create_directory(pool.root_id(), "t").expect("t");
    let txg = pool.open_txg();
    let ticket = reserve(&pool, dir, 20 * KIB).expect("reserve");
    assert_eq!(pool.tempreserved(dir, txg).expect("dir"), 20 * KIB);

    assert!(pool.cancel(&ticket));
    assert!(!pool.cancel(&ticket));
    assert!(!pool.cancel(&ticket.clone()));
    assert_eq!(pool.tempreserved(dir, txg).expect("dir"), 0);
    assert_eq!(pool.tempreserved(pool.root_id(), txg).expect("root"), 0);
}

#[test]
fn outstanding_tickets_are_released_when_their_generation_syncs() {
    let pool = new_pool();
    let dir = pool.create_directory(pool.root_id(), "stray").expect("stray");
    let txg = pool.open_txg();
    let ticket = reserve(&pool, dir, 20 * KIB).expect("reserve");
    assert_eq!(pool.sync_generation().expect("sync"), txg);

    assert!(ticket.is_released());
    assert_eq!(pool.tempreserved(dir, txg).expect("dir"), 0);
    // Canceling after the sync released it is a no-op.
    assert!(!pool.cancel(&ticket));
}

#[test]
fn dropped_transaction_releases_its_ticket() {
    let pool = new_pool();
    let dir = pool.create_directory(pool.root_id(), "drop").expect("drop");
    let handle = pool.hold_objset(dir).expect("hold");
    let txg = {
        let mut tx = pool.begin_tx(&handle).expect("tx");
        tx.assign(0, 16 * KIB, false).expect("assign")
    };
    assert_eq!(pool.tempreserved(dir, txg).expect("dir"), 0);
}

#[test]
fn tempreserved_is_zero_for_every_directory_after_sync() {
    let pool = new_pool();
    let a = pool.create_directory(pool.root_id(), "a").expect("a");
    let b = pool.create_directory(a, "b").expect("b");
    pool.set_reservation(b, 8 * KIB).expect("reservation");

    let handle = pool.hold_objset(b).expect("hold");
    let mut tx = pool.begin_tx(&handle).expect("tx");
    let txg = tx.assign(4 * KIB, 12 * KIB, false).expect("assign");
    let id = tx.create_object(Owner::new(1, 1)).expect("object");
    tx.write(id, &[7; 4096]).expect("write");
    tx.commit();
    drop(handle);
    pool.wait_synced(txg).expect("sync");

    for dir in [pool.root_id(), a, b] {
        assert_eq!(pool.tempreserved(dir, txg).expect("tempreserved"), 0);
    }
}

#[test]
fn willuse_is_advisory_and_cleared_by_sync() {
    let pool = new_pool();
    let dir = pool.create_directory(pool.root_id(), "w").expect("w");
    pool.set_quota(dir, 32 * KIB).expect("quota");
    pool.willuse(dir, 30 * KIB as i64).expect("willuse");
    // The estimate is in flight, so the denial is retryable.
    assert!(matches!(reserve(&pool, dir, 16 * KIB), Err(StrataError::Restart)));
    pool.sync_generation().expect("sync");
    let ticket = reserve(&pool, dir, 16 * KIB).expect("estimate cleared");
    pool.cancel(&ticket);
}

// ---------------------------------------------------------------------------
// Scenario 6: admission racing generation sync
// ---------------------------------------------------------------------------

#[test]
fn tickets_issued_during_concurrent_syncs_clear_with_their_generation() {
    let pool = new_pool();
    let dir = pool.create_directory(pool.root_id(), "busy").expect("busy");
    let issued: Mutex<Vec<Ticket>> = Mutex::new(Vec::new());
    let done = AtomicBool::new(false);

    std::thread::scope(|s| {
        s.spawn(|| {
            for _ in 0..400 {
                let ticket = reserve(&pool, dir, KIB).expect("reserve");
                issued.lock().push(ticket);
            }
            done.store(true, Ordering::Release);
        });
        s.spawn(|| {
            while !done.load(Ordering::Acquire) {
                let synced = pool.sync_generation().expect("sync");
                // Every ticket issued in a generation that is now durable
                // must have been released by that generation's sync.
                for ticket in issued.lock().iter().filter(|t| t.txg() <= synced) {
                    assert!(ticket.is_released(), "ticket of {:?} outlived its sync", ticket.txg());
                }
                assert_eq!(pool.tempreserved(dir, synced).expect("dir"), 0);
            }
        });
    });

    pool.sync_generation().expect("final sync");
    for ticket in issued.lock().iter() {
        assert!(ticket.is_released());
        assert_eq!(pool.tempreserved(dir, ticket.txg()).expect("dir"), 0);
    }
}
