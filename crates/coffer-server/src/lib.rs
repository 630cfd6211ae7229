#![warn(missing_docs)]

//! Coffer backup store daemon.
//!
//! Accepts mutually-authenticated TLS connections, maps the peer
//! certificate's common name to an account, and drives a
//! [`coffer_store::StoreContext`] for the session. A housekeeping worker
//! runs alongside the sessions; coordination happens exclusively through
//! the per-account named lock plus a small line-oriented control protocol
//! (`h` reload, `t` terminate, `r<hex>` release account).

pub mod config;
pub mod control;
pub mod error;
pub mod server;
pub mod session;
pub mod tls;
pub mod worker;

pub use config::ServerConfig;
pub use control::{ControlCommand, ControlChannel, DaemonCoordinator};
pub use error::{ServerError, ServerResult};
pub use server::Daemon;
pub use session::{Command, Response, Session};
