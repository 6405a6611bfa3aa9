#![forbid(unsafe_code)]
//! Identifiers and small value types shared by every Strata crate.
//!
//! Everything here is plain data: newtype ids that keep directory ids,
//! object ids, generations and physical locations from being mixed up, the
//! generation ring geometry, and the block pointer that ties a logical
//! object to the bytes written for it.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Number of generations that may be in flight at once (open, quiescing,
/// syncing, plus one slot of slack). Per-generation arrays are this long.
pub const TXG_SIZE: usize = 4;

/// Mask applied to a generation number to find its ring slot.
pub const TXG_MASK: u64 = TXG_SIZE as u64 - 1;

/// Bytes charged to an owning identity for each object, on top of the
/// object's allocated data.
pub const OBJECT_DESCRIPTOR_BYTES: u64 = 512;

/// Longest permitted directory or snapshot name component, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Prefix distinguishing object-count keys from byte-count keys in the
/// per-identity accounting tables.
pub const OBJECT_COUNT_PREFIX: &str = "obj-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct DirId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// The object-descriptor table of an object set.
    pub const META: Self = Self(0);
    /// The pool directory object inside the meta object set.
    pub const POOL_DIRECTORY: Self = Self(1);
    pub const USER_USED: Self = Self(u64::MAX);
    pub const GROUP_USED: Self = Self(u64::MAX - 1);
    pub const PROJECT_USED: Self = Self(u64::MAX - 2);

    /// Special objects are synced serially ahead of the shard fan-out and
    /// never appear in a dirty worklist.
    #[must_use]
    pub fn is_special(self) -> bool {
        self == Self::META || self.0 >= Self::PROJECT_USED.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DirId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction generation number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Txg(pub u64);

impl Txg {
    /// Index of this generation in any `TXG_SIZE`-long array.
    #[must_use]
    pub fn slot(self) -> usize {
        // Masked to TXG_MASK, always < TXG_SIZE.
        (self.0 & TXG_MASK) as usize
    }

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    #[must_use]
    pub fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl fmt::Display for Txg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque physical location handed out by the block store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockLocation(pub u64);

/// Reference to one written block.
///
/// `physical_size` is the allocation charged to the owning directory as
/// compressed bytes; `logical_size` is what was charged as uncompressed
/// bytes. A block rewritten in place within its birth generation keeps both
/// charges unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPtr {
    pub location: BlockLocation,
    pub physical_size: u64,
    pub logical_size: u64,
    pub birth: Txg,
    pub checksum: u32,
}

// ── Used-space breakdown ────────────────────────────────────────────────────

pub const USED_CATEGORY_COUNT: usize = 4;

/// Bucket a directory's used bytes are classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum UsedCategory {
    /// Blocks referenced by the directory's own head dataset.
    Head,
    /// Blocks kept alive only by snapshots.
    Snap,
    /// Unused portion of child reservations.
    ChildReserved,
    /// Space actually consumed by children.
    Child,
}

impl UsedCategory {
    pub const ALL: [Self; USED_CATEGORY_COUNT] =
        [Self::Head, Self::Snap, Self::ChildReserved, Self::Child];

    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Head => 0,
            Self::Snap => 1,
            Self::ChildReserved => 2,
            Self::Child => 3,
        }
    }
}

// ── Ownership ───────────────────────────────────────────────────────────────

/// Kind of identity an object is charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IdentityKind {
    User,
    Group,
    Project,
}

impl IdentityKind {
    pub const ALL: [Self; 3] = [Self::User, Self::Group, Self::Project];

    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::User => 0,
            Self::Group => 1,
            Self::Project => 2,
        }
    }

    /// The special object holding this kind's accounting table.
    #[must_use]
    pub fn table_object(self) -> ObjectId {
        match self {
            Self::User => ObjectId::USER_USED,
            Self::Group => ObjectId::GROUP_USED,
            Self::Project => ObjectId::PROJECT_USED,
        }
    }
}

/// The identities an object is charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Owner {
    pub user: u64,
    pub group: u64,
    pub project: u64,
}

impl Owner {
    #[must_use]
    pub fn new(user: u64, group: u64) -> Self {
        Self {
            user,
            group,
            project: 0,
        }
    }

    #[must_use]
    pub fn with_project(mut self, project: u64) -> Self {
        self.project = project;
        self
    }

    #[must_use]
    pub fn id(&self, kind: IdentityKind) -> u64 {
        match kind {
            IdentityKind::User => self.user,
            IdentityKind::Group => self.group,
            IdentityKind::Project => self.project,
        }
    }
}

/// Key for the byte-count entry of an identity.
#[must_use]
pub fn usage_key(id: u64) -> String {
    format!("{id:x}")
}

/// Key for the object-count entry of an identity.
#[must_use]
pub fn object_count_key(id: u64) -> String {
    format!("{OBJECT_COUNT_PREFIX}{id:x}")
}

// ── Names ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("empty name component")]
    Empty,
    #[error("name component longer than 255 bytes: {0}")]
    TooLong(String),
    #[error("invalid character {ch:?} in name {name:?}")]
    InvalidChar { name: String, ch: char },
}

/// Validate a single directory or snapshot name component.
pub fn validate_component(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(NameError::TooLong(name.to_owned()));
    }
    if let Some(ch) = name.chars().find(|c| matches!(c, '/' | '@') || c.is_control()) {
        return Err(NameError::InvalidChar {
            name: name.to_owned(),
            ch,
        });
    }
    Ok(())
}

/// Split a slash-separated directory path into validated components.
pub fn split_path(path: &str) -> Result<Vec<&str>, NameError> {
    let parts: Vec<&str> = path.trim_end_matches('/').split('/').collect();
    for part in &parts {
        validate_component(part)?;
    }
    Ok(parts)
}
