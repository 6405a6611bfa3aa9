#![forbid(unsafe_code)]
//! Directory-node space accounting for Strata.
//!
//! A pool's datasets form a tree of directories. Each directory carries
//! `used`, `quota` and `reservation`, plus a four-way breakdown of where its
//! used bytes live (its own head dataset, snapshots, unused child
//! reservations, actual child usage).
//!
//! Three kinds of change flow up the tree:
//!
//! - [`DirTree::willuse`]: an open-context *estimate*, recorded per
//!   generation and discarded when that generation syncs.
//! - [`DirTree::reserve`]: admission control. Promises bytes at every level
//!   up to the root and fails with `QuotaExceeded`, `NoSpace` or `Restart`.
//! - [`DirTree::diduse`]: the authoritative syncing-context charge.
//!
//! All three hand the parent the *dampened* delta computed by
//! [`parent_delta`]: growth a directory's own reservation already covers is
//! invisible above it.

mod accounting;
mod limits;
mod node;
pub mod space;
mod tempreserve;
mod tree;

pub use accounting::{DirStats, compression_ratio};
pub use limits::LimitKind;
pub use node::{DIR_FLAG_USED_BREAKDOWN, DatasetPhys, DirPhys, SnapshotPhys};
pub use space::{PoolSpace, SlopPolicy, WriteThrottle};
pub use tempreserve::{ReserveRequest, Ticket};
pub use tree::{DirHold, DirRecordSource, DirTree, check_name};

/// Portion of a change of `delta` bytes, at a directory with `used` bytes
/// and `reserved` bytes reserved, that its parent sees:
/// `max(used + delta, reserved) - max(used, reserved)`.
#[must_use]
pub fn parent_delta(used: u64, reserved: u64, delta: i64) -> i64 {
    let used = i128::from(used);
    let reserved = i128::from(reserved);
    let old = used.max(reserved);
    let new = (used + i128::from(delta)).max(reserved);
    i64::try_from(new - old).unwrap_or(if new > old { i64::MAX } else { i64::MIN })
}
