//! Cross-crate integration tests for the coffer backup store.
//!
//! The [`harness`] module builds throwaway accounts on a temp directory;
//! the other modules hold the end-to-end scenarios, boundary behaviors and
//! store-wide invariant checks that exercise the engine the way a real
//! deployment would.

pub mod harness;

#[cfg(test)]
mod boundaries;
#[cfg(test)]
mod invariants;
#[cfg(test)]
mod scenarios;

pub use harness::TestStore;
