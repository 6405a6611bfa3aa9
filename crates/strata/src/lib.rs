#![forbid(unsafe_code)]
//! Strata public API facade.
//!
//! Re-exports core functionality from `strata-core` through a stable external
//! interface. This is the crate that downstream consumers (CLI, harnesses)
//! depend on.

pub use strata_core::*;
