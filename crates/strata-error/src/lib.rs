#![forbid(unsafe_code)]
//! Error types for Strata.
//!
//! # Error Taxonomy
//!
//! | Class | Variants | Handling |
//! |-------|----------|----------|
//! | Admission denied | `QuotaExceeded`, `NoSpace`, `Restart` | Returned synchronously from reservation; `Restart` is retried by the caller, the others surface as a failure of the requested operation. |
//! | Durability fault | `Io`, `Corruption`, `Suspended` | Fatal to the generation being synced. The pool suspends and refuses further mutation. |
//! | Namespace | `NotFound`, `Exists`, `NotEmpty`, `Busy`, `NameTooLong`, `InvalidArgument` | Returned from administrative operations. |
//! | Capability | `ReadOnly`, `NotSupported` | Operation not permitted on this object set or pool. |
//! | Cooperative exit | `Interrupted` | Background task observed its exit flag. |
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`StrataError::to_errno`].
//! The mapping is exhaustive (no wildcard arms) so adding a new variant is a
//! compile error until its errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | `EIO` |
//! | `Corruption` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `QuotaExceeded` | `EDQUOT` |
//! | `NoSpace` | `ENOSPC` |
//! | `Restart` | `EAGAIN` |
//! | `NotFound` | `ENOENT` |
//! | `Exists` | `EEXIST` |
//! | `NotEmpty` | `ENOTEMPTY` |
//! | `Busy` | `EBUSY` |
//! | `InvalidArgument` | `EINVAL` |
//! | `NameTooLong` | `ENAMETOOLONG` |
//! | `ReadOnly` | `EROFS` |
//! | `NotSupported` | `EOPNOTSUPP` |
//! | `Interrupted` | `EINTR` |
//! | `Suspended` | `EIO` |
//!
//! `Restart` stands in for the kernel-internal `ERESTART`, which has no
//! userland errno; `EAGAIN` carries the same "try again" meaning.

use thiserror::Error;

/// Unified error type for all Strata operations.
#[derive(Debug, Error)]
pub enum StrataError {
    /// Operating system I/O error, or a block store write/read failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Checksum or structure mismatch on a block read back from storage.
    #[error("corrupt block at location {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Persisted record failed to encode or decode.
    #[error("invalid record format: {0}")]
    Format(String),

    /// A directory quota (or dataset reference quota) would be exceeded.
    #[error("quota exceeded")]
    QuotaExceeded,

    /// The pool, or a reservation it guarantees, cannot absorb the request.
    #[error("no space left in pool")]
    NoSpace,

    /// Admission denied while in-flight work may still free room; retry.
    #[error("admission deferred, retry")]
    Restart,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("not empty: {0}")]
    NotEmpty(String),

    /// Target is held or owned by another consumer.
    #[error("busy: {0}")]
    Busy(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("name too long: {0}")]
    NameTooLong(String),

    /// Mutation attempted on a snapshot or read-only open.
    #[error("read-only object set")]
    ReadOnly,

    #[error("not supported: {0}")]
    NotSupported(String),

    /// A cancellable task observed its exit flag.
    #[error("operation interrupted")]
    Interrupted,

    /// The pool hit a durability fault and refuses further mutation.
    #[error("pool suspended after I/O failure")]
    Suspended,
}

impl StrataError {
    /// Convert this error into a POSIX errno suitable for a syscall boundary.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(_) | Self::Corruption { .. } | Self::Suspended => libc::EIO,
            Self::Format(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::QuotaExceeded => libc::EDQUOT,
            Self::NoSpace => libc::ENOSPC,
            Self::Restart => libc::EAGAIN,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists(_) => libc::EEXIST,
            Self::NotEmpty(_) => libc::ENOTEMPTY,
            Self::Busy(_) => libc::EBUSY,
            Self::NameTooLong(_) => libc::ENAMETOOLONG,
            Self::ReadOnly => libc::EROFS,
            Self::NotSupported(_) => libc::EOPNOTSUPP,
            Self::Interrupted => libc::EINTR,
        }
    }

    /// True for the three admission-control denials.
    #[must_use]
    pub fn is_admission_denied(&self) -> bool {
        matches!(self, Self::QuotaExceeded | Self::NoSpace | Self::Restart)
    }

    /// True when the caller should retry the same request later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Restart)
    }

    /// True for errors that fault the generation being synced.
    #[must_use]
    pub fn is_durability_fault(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Corruption { .. } | Self::Suspended)
    }
}

/// Convenience alias used throughout Strata.
pub type Result<T> = std::result::Result<T, StrataError>;
