//! Reference count database.
//!
//! Dense `object id -> u32` map telling housekeeping when an object has no
//! remaining referents. Kept as a plain file (not striped) on the first disc
//! of the set: it is rebuilt from a tree walk whenever it is missing or
//! suspect, so redundancy buys nothing.
//!
//! ```text
//! [u32 magic 'REFC'][u32 version][u32 account_id]
//! [u32 counter for id 1][u32 counter for id 2] ...
//! ```

use std::io::{Read, Write};
use std::path::PathBuf;

use tracing::debug;

use crate::backend::DiscSet;
use crate::error::{StoreError, StoreResult};
use crate::naming::REFCOUNT_FILENAME;
use crate::types::{AccountId, ObjectId};
use crate::wire;

/// Magic word of the refcount database (`REFC`).
pub const REFCOUNT_MAGIC: u32 = 0x5245_4643;

const REFCOUNT_VERSION: u32 = 1;

/// The per-account refcount database, held in memory and committed whole.
#[derive(Debug)]
pub struct RefCountDatabase {
    path: PathBuf,
    account_id: AccountId,
    counts: Vec<u32>,
    read_only: bool,
    modified: bool,
}

impl RefCountDatabase {
    fn db_path(set: &DiscSet, account_rel: &str) -> PathBuf {
        set.dirs[0].join(account_rel).join(REFCOUNT_FILENAME)
    }

    /// Creates an empty database for a new account and writes it out.
    pub fn create_new(
        set: &DiscSet,
        account_rel: &str,
        account_id: AccountId,
    ) -> StoreResult<Self> {
        let mut db = Self {
            path: Self::db_path(set, account_rel),
            account_id,
            counts: Vec::new(),
            read_only: false,
            modified: true,
        };
        db.commit()?;
        Ok(db)
    }

    /// Creates a zero-filled database sized for ids up to `last_id`.
    ///
    /// Every counter starts at zero; the caller (the checker) is expected to
    /// repopulate it from a tree walk.
    pub fn create_for_regeneration(
        set: &DiscSet,
        account_rel: &str,
        account_id: AccountId,
        last_id: ObjectId,
    ) -> StoreResult<Self> {
        let mut db = Self {
            path: Self::db_path(set, account_rel),
            account_id,
            counts: vec![0; last_id.as_u64() as usize],
            read_only: false,
            modified: true,
        };
        db.commit()?;
        Ok(db)
    }

    /// Loads the database from disc.
    pub fn load(
        set: &DiscSet,
        account_rel: &str,
        expected_account: AccountId,
        read_only: bool,
    ) -> StoreResult<Self> {
        let path = Self::db_path(set, account_rel);
        let mut file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(format!(
                    "refcount database {}",
                    path.display()
                )))
            }
            Err(e) => return Err(StoreError::Io(e)),
        };

        let magic = wire::read_u32(&mut file)?;
        if magic != REFCOUNT_MAGIC {
            return Err(StoreError::Corrupt(format!(
                "bad refcount magic {magic:#010x}"
            )));
        }
        let version = wire::read_u32(&mut file)?;
        if version != REFCOUNT_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported refcount version {version}"
            )));
        }
        let account_id = AccountId(wire::read_u32(&mut file)?);
        if account_id != expected_account {
            return Err(StoreError::Corrupt(format!(
                "refcount db is for account {account_id}, expected {expected_account}"
            )));
        }

        let mut rest = Vec::new();
        file.read_to_end(&mut rest)?;
        if rest.len() % 4 != 0 {
            return Err(StoreError::Corrupt(
                "refcount database has a partial counter".into(),
            ));
        }
        let counts = rest
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Ok(Self {
            path,
            account_id,
            counts,
            read_only,
            modified: false,
        })
    }

    /// Highest id this database has a slot for.
    pub fn last_object_id(&self) -> ObjectId {
        ObjectId(self.counts.len() as u64)
    }

    /// Current reference count of an object; zero for unknown ids.
    pub fn refcount(&self, id: ObjectId) -> u32 {
        if id.is_none() {
            return 0;
        }
        self.counts
            .get((id.as_u64() - 1) as usize)
            .copied()
            .unwrap_or(0)
    }

    fn slot(&mut self, id: ObjectId) -> &mut u32 {
        debug_assert!(!id.is_none());
        let idx = (id.as_u64() - 1) as usize;
        if idx >= self.counts.len() {
            self.counts.resize(idx + 1, 0);
        }
        &mut self.counts[idx]
    }

    /// Adds one reference, returning the new count.
    pub fn add_reference(&mut self, id: ObjectId) -> u32 {
        self.modified = true;
        let slot = self.slot(id);
        *slot += 1;
        *slot
    }

    /// Removes one reference, returning the new count. Saturates at zero.
    pub fn remove_reference(&mut self, id: ObjectId) -> u32 {
        self.modified = true;
        let slot = self.slot(id);
        *slot = slot.saturating_sub(1);
        *slot
    }

    /// Overwrites a counter; used by regeneration.
    pub fn set_refcount(&mut self, id: ObjectId, count: u32) {
        self.modified = true;
        *self.slot(id) = count;
    }

    /// True when there are uncommitted changes.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Writes the database atomically (temp file then rename).
    pub fn commit(&mut self) -> StoreResult<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        let tmp = self.path.with_extension("db.tmp");
        {
            let mut f = std::fs::File::create(&tmp)?;
            wire::write_u32(&mut f, REFCOUNT_MAGIC)?;
            wire::write_u32(&mut f, REFCOUNT_VERSION)?;
            wire::write_u32(&mut f, self.account_id.as_u32())?;
            let mut buf = Vec::with_capacity(self.counts.len() * 4);
            for c in &self.counts {
                buf.extend_from_slice(&c.to_be_bytes());
            }
            f.write_all(&buf)?;
            f.flush()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        self.modified = false;
        debug!(account = %self.account_id, entries = self.counts.len(),
            "committed refcount database");
        Ok(())
    }
}
