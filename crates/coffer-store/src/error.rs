//! Error types for the store engine.

use thiserror::Error;

use crate::types::{AccountId, ObjectId};

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error variants for store operations.
///
/// `AlreadyLocked` is expected contention and is not logged as an error at
/// this level; everything else is a genuine failure of the requested
/// operation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying disc or stream failure; retryable at caller discretion.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Object or entry does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Magic mismatch, truncated stream, or inconsistent block index.
    #[error("Corrupt object: {0}")]
    Corrupt(String),

    /// The named lock is held by another party.
    #[error("Lock already held: {path}")]
    AlreadyLocked {
        /// Path of the contended lock file.
        path: String,
    },

    /// The account's write lock could not be obtained within the retry window.
    #[error("Account {0} is locked by another process")]
    AccountLocked(AccountId),

    /// Mutating operation attempted on a read-only context.
    #[error("Store context is read-only")]
    ReadOnly,

    /// Adding the object would cross the account's hard limit.
    #[error("Storage hard limit exceeded: {used} + {adding} > {hard_limit} blocks")]
    StorageLimitExceeded {
        /// Blocks used before the operation.
        used: u64,
        /// Blocks the operation would add.
        adding: u64,
        /// The account's hard limit in blocks.
        hard_limit: u64,
    },

    /// Destination of a create or move conflicts with an existing name.
    #[error("Name already exists in directory {0}")]
    NameAlreadyExists(ObjectId),

    /// Directory operation referenced an entry that is not present.
    #[error("Entry {entry} not found in directory {directory}")]
    EntryNotFound {
        /// The missing entry's object id.
        entry: ObjectId,
        /// The directory that was searched.
        directory: ObjectId,
    },

    /// `add_file` cited a diff-from id that is not in the target directory.
    #[error("Diff-from object {0} not found in target directory")]
    DiffFromMissing(ObjectId),

    /// Envelope verification failed on an incoming file stream.
    #[error("Added file does not verify")]
    AddedFileDoesNotVerify,

    /// Account info record missing, unreadable or for the wrong account.
    #[error("Account info invalid: {0}")]
    InfoInvalid(String),

    /// No unused object id could be found during allocation.
    #[error("Could not find an unused object id during allocation")]
    IdAllocationFailed,

    /// The account does not exist in the account database.
    #[error("Account {0} does not exist")]
    AccountNotFound(AccountId),

    /// Payload streaming from the transport exceeded its deadline.
    #[error("Timed out reading file data from stream")]
    Timeout,
}

impl StoreError {
    /// True for errors that signal expected lock contention rather than a
    /// fault.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            StoreError::AlreadyLocked { .. } | StoreError::AccountLocked(_)
        )
    }

    /// A missing object, named by its id.
    pub fn object_not_found(id: ObjectId) -> Self {
        StoreError::NotFound(format!("object {id}"))
    }

    /// A corrupt object, named by its id.
    pub fn object_corrupt(id: ObjectId, reason: impl Into<String>) -> Self {
        StoreError::Corrupt(format!("object {id}: {}", reason.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contention_classification() {
        assert!(StoreError::AlreadyLocked {
            path: "x.lock".into()
        }
        .is_contention());
        assert!(StoreError::AccountLocked(AccountId(1)).is_contention());
        assert!(!StoreError::ReadOnly.is_contention());
    }

    #[test]
    fn test_display_includes_context() {
        let e = StoreError::StorageLimitExceeded {
            used: 10,
            adding: 5,
            hard_limit: 12,
        };
        let msg = e.to_string();
        assert!(msg.contains("10"));
        assert!(msg.contains("12"));
    }
}
