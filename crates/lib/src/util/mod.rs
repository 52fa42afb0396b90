//! Shared utilities.
//!
//! Hashing helpers for content addressing, plus test helpers.

pub mod hash;

#[cfg(test)]
pub mod testutil;
