//! Account management: the account database and account lifecycle.
//!
//! The account database is a small text file mapping account ids to disc
//! sets, one `<8-hex-id>:<disc set>` line per account. Creation lays down
//! the account root on every disc of the set with a fresh info record,
//! refcount database and empty root directory object.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::backend::StoreBackend;
use crate::directory::Directory;
use crate::error::{StoreError, StoreResult};
use crate::info::AccountInfo;
use crate::lock::NamedLock;
use crate::naming::{self, WRITE_LOCK_FILENAME};
use crate::refcount::RefCountDatabase;
use crate::striped::StripedWriter;
use crate::types::{AccountId, ObjectId};

/// Maximum soft limit as a percentage of the hard limit.
pub const MAX_SOFT_LIMIT_PERCENT: u64 = 97;

/// Store-relative root directory of an account.
pub fn account_root_rel(account: AccountId) -> String {
    format!("backup/{account}")
}

/// Absolute path of an account's write lock file.
///
/// The lock is a plain file on the first disc of the set; it guards the
/// whole account, so it gains nothing from striping.
pub fn write_lock_path(
    backend: &StoreBackend,
    disc_set: usize,
    account: AccountId,
) -> StoreResult<PathBuf> {
    let set = backend.disc_set(disc_set)?;
    Ok(set.dirs[0]
        .join(account_root_rel(account))
        .join(WRITE_LOCK_FILENAME))
}

/// The persistent account id to disc set mapping.
#[derive(Debug, Clone)]
pub struct AccountDatabase {
    path: PathBuf,
    accounts: BTreeMap<AccountId, usize>,
}

impl AccountDatabase {
    /// Loads the database, treating a missing file as empty.
    pub fn load(path: &Path) -> StoreResult<Self> {
        let mut accounts = BTreeMap::new();
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                for (lineno, line) in contents.lines().enumerate() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    let (id_str, set_str) = line.split_once(':').ok_or_else(|| {
                        StoreError::Corrupt(format!(
                            "account database line {}: missing separator",
                            lineno + 1
                        ))
                    })?;
                    let id = u32::from_str_radix(id_str.trim(), 16).map_err(|_| {
                        StoreError::Corrupt(format!(
                            "account database line {}: bad account id",
                            lineno + 1
                        ))
                    })?;
                    let set = set_str.trim().parse::<usize>().map_err(|_| {
                        StoreError::Corrupt(format!(
                            "account database line {}: bad disc set",
                            lineno + 1
                        ))
                    })?;
                    accounts.insert(AccountId(id), set);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::Io(e)),
        }
        Ok(Self {
            path: path.to_path_buf(),
            accounts,
        })
    }

    /// Writes the database atomically.
    pub fn save(&self) -> StoreResult<()> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut f = std::fs::File::create(&tmp)?;
            for (id, set) in &self.accounts {
                writeln!(f, "{id}:{set}")?;
            }
            f.flush()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// True when the account is registered.
    pub fn exists(&self, account: AccountId) -> bool {
        self.accounts.contains_key(&account)
    }

    /// The disc set an account lives on.
    pub fn disc_set(&self, account: AccountId) -> StoreResult<usize> {
        self.accounts
            .get(&account)
            .copied()
            .ok_or(StoreError::AccountNotFound(account))
    }

    /// Registers an account.
    pub fn add(&mut self, account: AccountId, disc_set: usize) {
        self.accounts.insert(account, disc_set);
    }

    /// Removes an account's registration.
    pub fn remove(&mut self, account: AccountId) {
        self.accounts.remove(&account);
    }

    /// Every registered account with its disc set, id order.
    pub fn all(&self) -> Vec<(AccountId, usize)> {
        self.accounts.iter().map(|(k, v)| (*k, *v)).collect()
    }
}

/// Creates, deletes and locks accounts on a backend.
pub struct AccountManager<'a> {
    backend: &'a StoreBackend,
    database: AccountDatabase,
}

impl<'a> AccountManager<'a> {
    /// Creates a manager over a loaded database.
    pub fn new(backend: &'a StoreBackend, database: AccountDatabase) -> Self {
        Self { backend, database }
    }

    /// The underlying database.
    pub fn database(&self) -> &AccountDatabase {
        &self.database
    }

    /// Validates the soft limit against the hard limit.
    pub fn check_limits(soft: u64, hard: u64) -> StoreResult<()> {
        if hard == 0 || soft > hard * MAX_SOFT_LIMIT_PERCENT / 100 {
            return Err(StoreError::InfoInvalid(format!(
                "soft limit must be at most {MAX_SOFT_LIMIT_PERCENT}% of the hard limit"
            )));
        }
        Ok(())
    }

    /// Creates an account: root directories on every disc, a fresh info
    /// record, the refcount database and an empty root directory object.
    pub fn create_account(
        &mut self,
        account: AccountId,
        disc_set: usize,
        soft_limit: u64,
        hard_limit: u64,
    ) -> StoreResult<()> {
        if self.database.exists(account) {
            return Err(StoreError::InfoInvalid(format!(
                "account {account} already exists"
            )));
        }
        Self::check_limits(soft_limit, hard_limit)?;

        let set = self.backend.disc_set(disc_set)?;
        let root_rel = account_root_rel(account);
        set.ensure_directory(&root_rel)?;

        // Root directory object, containing itself.
        let root_dir_rel = format!("{root_rel}/{}", naming::object_filename(ObjectId::ROOT));
        let root = Directory::new(ObjectId::ROOT, ObjectId::ROOT);
        let mut writer = StripedWriter::open(set, &root_dir_rel, false)?;
        root.write_to(&mut writer)?;
        let root_blocks = writer.usage_in_blocks()?;
        writer.commit(true)?;

        let mut info = AccountInfo::new(account, soft_limit, hard_limit);
        info.change_blocks_used(root_blocks as i64);
        info.change_blocks_in_directories(root_blocks as i64);
        info.adjust_num_directories(1);
        info.save(set, &root_rel)?;

        let mut refcount = RefCountDatabase::create_new(set, &root_rel, account)?;
        refcount.add_reference(ObjectId::ROOT);
        refcount.commit()?;

        self.database.add(account, disc_set);
        self.database.save()?;

        info!(account = %account, disc_set, soft_limit, hard_limit, "created account");
        Ok(())
    }

    /// Deletes an account's on-disc data and registration.
    ///
    /// The caller must hold the account's write lock (or know that nothing
    /// else is running).
    pub fn delete_account(&mut self, account: AccountId) -> StoreResult<()> {
        let disc_set = self.database.disc_set(account)?;
        let set = self.backend.disc_set(disc_set)?;
        let root_rel = account_root_rel(account);

        for disc in &set.dirs {
            let root = disc.join(&root_rel);
            match std::fs::remove_dir_all(&root) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(account = %account, disc = %disc.display(),
                        "account root already absent");
                }
                Err(e) => return Err(StoreError::Io(e)),
            }
        }

        self.database.remove(account);
        self.database.save()?;
        info!(account = %account, "deleted account");
        Ok(())
    }

    /// Resolves an account's root path and disc set.
    pub fn account_root(&self, account: AccountId) -> StoreResult<(String, usize)> {
        let disc_set = self.database.disc_set(account)?;
        Ok((account_root_rel(account), disc_set))
    }

    /// Acquires the account's write lock into `lock`.
    pub fn lock_account(&self, account: AccountId, lock: &mut NamedLock) -> StoreResult<()> {
        let disc_set = self.database.disc_set(account)?;
        let path = write_lock_path(self.backend, disc_set, account)?;
        lock.try_acquire(&path)
    }
}
