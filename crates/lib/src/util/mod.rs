//! Shared utilities.

pub(crate) mod sync;

#[cfg(test)]
pub mod testutil;
