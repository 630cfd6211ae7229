#![warn(missing_docs)]

//! Account administration for the coffer backup store.
//!
//! The CLI operates directly on the store discs using the same engine as
//! the daemon; for anything mutating it takes the account's write lock
//! first, so it can run safely beside a live server. Exit codes: 0 on
//! success, 1 for lockable failures (account busy, or check finding errors
//! without `fix`), 2 for usage errors.

pub mod cli;
pub mod size;

pub use cli::{Cli, ExitCode};
pub use size::parse_size_literal;
