#![warn(missing_docs)]

//! Coffer backup store engine.
//!
//! This crate is the server-side core of the coffer backup system: an
//! encrypted, de-duplicating, versioned object store kept on local discs.
//! Clients upload opaque encrypted objects; the engine persists them through
//! a striped (N data + 1 parity) file layer, tracks them in directory
//! objects with version and deletion flags, reclaims space with a
//! housekeeping pass, and can rebuild a damaged account with the
//! consistency checker.
//!
//! All I/O in this crate is synchronous. The daemon shell
//! (`coffer-server`) adapts it to async transports.

pub mod accounts;
pub mod backend;
pub mod check;
pub mod context;
pub mod directory;
pub mod error;
pub mod file_format;
pub mod housekeeping;
pub mod info;
pub mod lock;
pub mod name;
pub mod naming;
pub mod progress;
pub mod refcount;
pub mod striped;
pub mod types;
pub(crate) mod wire;

pub use accounts::{AccountDatabase, AccountManager};
pub use backend::{DiscSet, StoreBackend};
pub use check::{CheckConfig, CheckReport, StoreCheck};
pub use context::{
    AddDirectoryOutcome, HousekeepingCoordinator, NullCoordinator, ObjectKind, StoreContext,
};
pub use directory::{Directory, DirectoryEntry, EntryFlags};
pub use error::{StoreError, StoreResult};
pub use file_format::{
    combine_file, decode_file_payload, encode_diff, encode_file, reverse_diff_file,
    verify_encoded_file_format, FileStreamFormat,
};
pub use housekeeping::{
    HousekeepingConfig, HousekeepingControl, HousekeepingOutcome, HousekeepingRun, NeverStop,
};
pub use info::AccountInfo;
pub use lock::NamedLock;
pub use name::ObjectName;
pub use progress::{CountingProgressSink, NullProgressSink, ProgressSink};
pub use refcount::RefCountDatabase;
pub use striped::{StripedReader, StripedWriter};
pub use types::{AccountId, ObjectId, RevisionId};

/// Object id of every account's root directory.
pub const ROOT_DIRECTORY_ID: ObjectId = ObjectId::ROOT;

/// Number of delayed info mutations tolerated before a forced flush.
pub const STORE_INFO_SAVE_DELAY: u32 = 96;
