//! Per-session store context.
//!
//! A `StoreContext` is the state-carrying handle every session (and every
//! administrative tool) uses to mutate an account. It owns the account's
//! write lock, the loaded info record and refcount database, and a small
//! private directory cache. Operations are strictly sequential within one
//! context.
//!
//! Mutation ordering is deliberate: new object files are committed first,
//! the parent directory is rewritten next, and only then are refcounts and
//! info counters adjusted. A crash can therefore leave an orphan object or
//! drifted counters, both of which housekeeping and the checker heal, but
//! never a directory entry pointing at a missing or half-written object.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::accounts::{account_root_rel, write_lock_path};
use crate::backend::{DiscSet, StoreBackend};
use crate::directory::{Directory, DirectoryEntry, EntryFlags};
use crate::error::{StoreError, StoreResult};
use crate::file_format::{
    combine_file, reverse_diff_file, verify_encoded_file_format, FILE_MAGIC_V0, FILE_MAGIC_V1,
};
use crate::info::AccountInfo;
use crate::lock::NamedLock;
use crate::naming;
use crate::refcount::RefCountDatabase;
use crate::striped::{self, StripedReader, StripedWriter};
use crate::types::{AccountId, ObjectId};
use crate::STORE_INFO_SAVE_DELAY;

/// Directory cache entries kept before the whole cache is flushed.
const MAX_CACHE_SIZE: usize = 32;

/// One-second retries after nudging housekeeping off the account.
const LOCK_RETRY_ATTEMPTS: u32 = 4;

/// Channel for asking the housekeeping worker to back off an account.
///
/// The daemon implements this over the control IPC; tools that run without
/// a daemon use [`NullCoordinator`].
pub trait HousekeepingCoordinator: Send + Sync {
    /// Requests that housekeeping release `account`'s lock soon.
    fn request_account_release(&self, account: AccountId);
}

/// Coordinator for standalone use: nobody to nudge.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCoordinator;

impl HousekeepingCoordinator for NullCoordinator {
    fn request_account_release(&self, _account: AccountId) {}
}

/// Kind expectation for [`StoreContext::object_exists`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// Any object will do.
    Any,
    /// Must be a file object.
    File,
    /// Must be a directory object.
    Directory,
}

/// Result of [`StoreContext::add_directory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddDirectoryOutcome {
    /// Id of the (new or existing) directory.
    pub id: ObjectId,
    /// True when a live entry with that name already existed.
    pub already_exists: bool,
}

/// Per-session handle over one account.
pub struct StoreContext {
    backend: Arc<StoreBackend>,
    coordinator: Arc<dyn HousekeepingCoordinator>,
    account: AccountId,
    disc_set: usize,
    account_rel: String,
    read_only: bool,
    write_lock: NamedLock,
    info: Option<AccountInfo>,
    refcount: Option<RefCountDatabase>,
    dir_cache: HashMap<ObjectId, Directory>,
    save_delay: u32,
    lock_retry_sleep: Duration,
}

impl StoreContext {
    /// Creates a context bound to an account. Call [`StoreContext::open`]
    /// before using it.
    pub fn new(
        backend: Arc<StoreBackend>,
        coordinator: Arc<dyn HousekeepingCoordinator>,
        account: AccountId,
        disc_set: usize,
    ) -> Self {
        Self {
            backend,
            coordinator,
            account,
            disc_set,
            account_rel: account_root_rel(account),
            read_only: true,
            write_lock: NamedLock::new(),
            info: None,
            refcount: None,
            dir_cache: HashMap::new(),
            save_delay: STORE_INFO_SAVE_DELAY,
            lock_retry_sleep: Duration::from_secs(1),
        }
    }

    /// Shortens the lock retry interval; tests only.
    #[doc(hidden)]
    pub fn set_lock_retry_sleep(&mut self, sleep: Duration) {
        self.lock_retry_sleep = sleep;
    }

    /// The account this context serves.
    pub fn account(&self) -> AccountId {
        self.account
    }

    /// True until a write lock has been obtained.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn set(&self) -> StoreResult<&DiscSet> {
        self.backend.disc_set(self.disc_set)
    }

    fn object_rel(&self, id: ObjectId) -> String {
        format!("{}/{}", self.account_rel, naming::object_filename(id))
    }

    fn ensure_object_dir(&self, id: ObjectId) -> StoreResult<()> {
        let dir = naming::object_directory(id);
        let rel = if dir.is_empty() {
            self.account_rel.clone()
        } else {
            format!("{}/{dir}", self.account_rel)
        };
        self.set()?.ensure_directory(&rel)
    }

    /// Opens the context: acquires the write lock when `want_write`, then
    /// loads the info record and refcount database.
    pub fn open(&mut self, want_write: bool) -> StoreResult<()> {
        if want_write {
            self.attempt_write_lock()?;
        }

        let set = self.set()?;
        let info = AccountInfo::load(set, &self.account_rel, self.account, self.read_only)?;

        let refcount =
            match RefCountDatabase::load(set, &self.account_rel, self.account, self.read_only) {
                Ok(db) => db,
                Err(e) if !self.read_only => {
                    warn!(account = %self.account, error = %e,
                        "refcount database missing or corrupt, creating an empty one; \
                         housekeeping will repopulate it");
                    RefCountDatabase::create_for_regeneration(
                        set,
                        &self.account_rel,
                        self.account,
                        info.last_object_id(),
                    )?
                }
                Err(e) => return Err(e),
            };

        self.info = Some(info);
        self.refcount = Some(refcount);
        debug!(account = %self.account, read_only = self.read_only, "opened store context");
        Ok(())
    }

    /// Tries for the account write lock, asking housekeeping to yield and
    /// retrying for a bounded number of one-second intervals.
    fn attempt_write_lock(&mut self) -> StoreResult<()> {
        let lock_path = write_lock_path(&self.backend, self.disc_set, self.account)?;

        match self.write_lock.try_acquire(&lock_path) {
            Ok(()) => {
                self.read_only = false;
                return Ok(());
            }
            Err(e) if e.is_contention() => {}
            Err(e) => return Err(e),
        }

        // Housekeeping may be holding the account; ask it to stop and retry.
        self.coordinator.request_account_release(self.account);
        for _ in 0..LOCK_RETRY_ATTEMPTS {
            std::thread::sleep(self.lock_retry_sleep);
            match self.write_lock.try_acquire(&lock_path) {
                Ok(()) => {
                    self.read_only = false;
                    return Ok(());
                }
                Err(e) if e.is_contention() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::AccountLocked(self.account))
    }

    fn info(&self) -> StoreResult<&AccountInfo> {
        self.info
            .as_ref()
            .ok_or_else(|| StoreError::InfoInvalid("store info not loaded".into()))
    }

    fn info_mut(&mut self) -> StoreResult<&mut AccountInfo> {
        self.info
            .as_mut()
            .ok_or_else(|| StoreError::InfoInvalid("store info not loaded".into()))
    }

    fn refcount_mut(&mut self) -> StoreResult<&mut RefCountDatabase> {
        self.refcount
            .as_mut()
            .ok_or_else(|| StoreError::InfoInvalid("refcount database not loaded".into()))
    }

    fn require_writable(&self) -> StoreResult<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        Ok(())
    }

    /// Flushes the info record, possibly deferring it.
    ///
    /// With `allow_delay` the flush only happens every
    /// [`STORE_INFO_SAVE_DELAY`] mutations; the countdown is per-context
    /// state.
    fn save_info(&mut self, allow_delay: bool) -> StoreResult<()> {
        if allow_delay {
            self.save_delay = self.save_delay.saturating_sub(1);
            if self.save_delay > 0 {
                return Ok(());
            }
        }
        let backend = self.backend.clone();
        let set = backend.disc_set(self.disc_set)?;
        let account_rel = self.account_rel.clone();
        self.info_mut()?.save(set, &account_rel)?;
        self.save_delay = STORE_INFO_SAVE_DELAY;
        Ok(())
    }

    /// Allocates an unused object id.
    ///
    /// Because the info record is flushed lazily, a crashed session may have
    /// left objects above the recorded high-water mark; allocation probes
    /// the disc and skips collisions, forcing an eager info save when one is
    /// seen.
    fn allocate_object_id(&mut self) -> StoreResult<ObjectId> {
        for _ in 0..(STORE_INFO_SAVE_DELAY * 2) {
            let id = self.info_mut()?.allocate_object_id();
            let rel = self.object_rel(id);
            if striped::object_exists(self.set()?, &rel)?.is_none() {
                return Ok(id);
            }
            self.save_delay = 0;
            warn!(account = %self.account, id = %id,
                "allocated object id already in use, skipping");
        }
        Err(StoreError::IdAllocationFailed)
    }

    /// Removes a directory from the cache, if present.
    fn evict_directory(&mut self, id: ObjectId) {
        self.dir_cache.remove(&id);
    }

    /// Takes a directory out of the cache (reloading when stale), leaving
    /// it *out* of the cache while the caller works on it. Putting it back
    /// with [`Self::cache_directory`] is the success path; an early return
    /// on error leaves the cache clean automatically.
    fn take_directory(&mut self, id: ObjectId) -> StoreResult<Directory> {
        let rel = self.object_rel(id);
        let backend = self.backend.clone();
        let set = backend.disc_set(self.disc_set)?;

        if let Some(cached) = self.dir_cache.remove(&id) {
            match striped::object_exists(set, &rel)? {
                Some(rev) if rev == cached.revision() => {
                    trace!(directory = %id, "directory cache hit");
                    return Ok(cached);
                }
                Some(_) => {
                    trace!(directory = %id, "directory cache stale, reloading");
                }
                None => return Err(StoreError::object_not_found(id)),
            }
        }

        if self.dir_cache.len() > MAX_CACHE_SIZE {
            // Past the cap the whole cache goes; simple and rare.
            self.dir_cache.clear();
        }

        let mut reader = match StripedReader::open(set, &rel) {
            Ok(r) => r,
            Err(StoreError::NotFound(_)) => return Err(StoreError::object_not_found(id)),
            Err(e) => return Err(e),
        };
        let revision = reader.revision();
        let size_blocks = reader.usage_in_blocks();
        let bytes = reader.read_remaining()?;
        let mut dir = Directory::read_from(&mut std::io::Cursor::new(bytes))?;
        if dir.object_id() != id {
            return Err(StoreError::object_corrupt(
                id,
                format!("directory claims id {}", dir.object_id()),
            ));
        }
        dir.set_revision(revision);
        dir.set_size_in_blocks(size_blocks);
        Ok(dir)
    }

    fn cache_directory(&mut self, dir: Directory) {
        self.dir_cache.insert(dir.object_id(), dir);
    }

    /// Writes a directory back to disc and adjusts the directory block
    /// counters for any size change.
    fn save_directory(&mut self, dir: &mut Directory) -> StoreResult<()> {
        let id = dir.object_id();
        let rel = self.object_rel(id);
        let backend = self.backend.clone();
        let set = backend.disc_set(self.disc_set)?;

        let mut writer = StripedWriter::open(set, &rel, true)?;
        let mut buf = Vec::new();
        dir.write_to(&mut buf)?;
        writer.write_all(&buf)?;
        let new_blocks = writer.usage_in_blocks()?;
        writer.commit(true)?;

        let delta = new_blocks as i64 - dir.size_in_blocks() as i64;
        dir.set_size_in_blocks(new_blocks);
        if let Some(rev) = striped::object_exists(set, &rel)? {
            dir.set_revision(rev);
        }

        let info = self.info_mut()?;
        info.change_blocks_used(delta);
        info.change_blocks_in_directories(delta);
        Ok(())
    }

    /// Returns a read view of a directory, from cache when fresh.
    pub fn get_directory(&mut self, id: ObjectId) -> StoreResult<&Directory> {
        let dir = self.take_directory(id)?;
        self.cache_directory(dir);
        Ok(self.dir_cache.get(&id).expect("just cached"))
    }

    /// Adds a file object from a client-encoded envelope stream.
    ///
    /// With `diff_from` set, the stream is a patch against that object: the
    /// store reassembles the full file, then rewrites the old object as a
    /// reverse patch against the new one. The old object's rewrite is
    /// committed only after the directory update, so a crash leaves either
    /// the old state or the new state, never a mixture.
    #[allow(clippy::too_many_arguments)]
    pub fn add_file(
        &mut self,
        parent: ObjectId,
        name: &crate::name::ObjectName,
        modification_time: u64,
        attributes_hash: u64,
        diff_from: ObjectId,
        mark_same_name_as_old: bool,
        payload: &mut dyn Read,
    ) -> StoreResult<ObjectId> {
        self.require_writable()?;
        self.info()?;

        let mut dir = self.take_directory(parent)?;
        let id = self.allocate_object_id()?;
        self.ensure_object_dir(id)?;
        let new_rel = self.object_rel(id);
        let set = self.backend.disc_set(self.disc_set)?.clone();

        let mut writer = StripedWriter::open(&set, &new_rel, false)?;
        let mut space_saved: i64 = 0;
        let mut old_rewrite: Option<StripedWriter<'_>> = None;
        let mut old_rewrite_blocks: u64 = 0;
        let mut completely_different = false;

        if diff_from.is_none() {
            std::io::copy(payload, &mut writer)?;
        } else {
            if dir.find_entry_by_id(diff_from).is_none() {
                return Err(StoreError::DiffFromMissing(diff_from));
            }

            let mut patch = Vec::new();
            payload.read_to_end(&mut patch)?;
            verify_encoded_file_format(&mut std::io::Cursor::new(&patch))
                .map_err(|_| StoreError::AddedFileDoesNotVerify)?;

            let old_rel = self.object_rel(diff_from);
            let mut old_reader = StripedReader::open(&set, &old_rel)?;
            let old_blocks_before = old_reader.usage_in_blocks();

            // Reassemble the full new file from the patch and the old file.
            let mut combined = Vec::new();
            combine_file(
                &mut std::io::Cursor::new(&patch),
                &mut old_reader,
                &mut combined,
            )?;
            writer.write_all(&combined)?;

            // Rewrite the old object as a patch against the new file, but
            // hold the commit until the directory reflects the new state.
            let mut old_reader2 = StripedReader::open(&set, &old_rel)?;
            let mut rewrite = StripedWriter::open(&set, &old_rel, true)?;
            let mut rewritten = Vec::new();
            completely_different = reverse_diff_file(
                &mut std::io::Cursor::new(&combined),
                &mut old_reader2,
                &mut rewritten,
            )?;
            rewrite.write_all(&rewritten)?;
            old_rewrite_blocks = rewrite.usage_in_blocks()?;
            space_saved = old_blocks_before as i64 - old_rewrite_blocks as i64;
            old_rewrite = Some(rewrite);
        }

        // Admission control against the hard limit, counting the patch
        // shrinkage of the old version.
        let new_blocks = writer.usage_in_blocks()?;
        let info = self.info()?;
        let projected = info.blocks_used() + new_blocks as i64 - space_saved;
        if projected > info.blocks_hard_limit() as i64 {
            return Err(StoreError::StorageLimitExceeded {
                used: info.blocks_used().max(0) as u64,
                adding: new_blocks,
                hard_limit: info.blocks_hard_limit(),
            });
        }

        writer.commit(true)?;

        // Full uploads are verified once they are on disc; a stream that
        // does not parse, or that claims to be a patch, is rejected.
        if diff_from.is_none() {
            let verified = StripedReader::open(&set, &new_rel)
                .and_then(|mut r| verify_encoded_file_format(&mut r));
            let ok = matches!(verified, Ok(v) if !v.has_references);
            if !ok {
                striped::delete_object(&set, &new_rel)?;
                return Err(StoreError::AddedFileDoesNotVerify);
            }
        }

        // Update the directory; back the new object out if that fails.
        let result = (|| -> StoreResult<(i64, i64)> {
            let mut blocks_in_old: i64 = 0;
            if mark_same_name_as_old {
                for entry in dir.entries_matching_mut(EntryFlags::NONE, EntryFlags::OLD_VERSION) {
                    if entry.name == *name && entry.is_file() {
                        entry.flags.insert(EntryFlags::OLD_VERSION);
                        blocks_in_old += entry.size_in_blocks as i64;
                    }
                }
            }

            let mut adjusted_new_blocks = new_blocks as i64;
            dir.add_entry(DirectoryEntry::new(
                name.clone(),
                modification_time,
                id,
                new_blocks,
                EntryFlags::FILE,
                attributes_hash,
            ));

            if !diff_from.is_none() {
                if !completely_different {
                    let old_entry = dir
                        .find_entry_by_id_mut(diff_from)
                        .expect("checked before streaming");
                    old_entry.depends_newer = id;
                    let new_entry = dir.find_entry_by_id_mut(id).expect("just added");
                    new_entry.depends_older = diff_from;
                }

                let old_entry = dir
                    .find_entry_by_id_mut(diff_from)
                    .expect("checked before streaming");
                let old_size = old_entry.size_in_blocks as i64;
                old_entry.size_in_blocks = old_rewrite_blocks;
                adjusted_new_blocks += old_rewrite_blocks as i64 - old_size;
                blocks_in_old += old_rewrite_blocks as i64 - old_size;
            }

            self.save_directory(&mut dir)?;
            Ok((adjusted_new_blocks, blocks_in_old))
        })();

        let (adjusted_new_blocks, blocks_in_old) = match result {
            Ok(v) => v,
            Err(e) => {
                if let Err(del) = striped::delete_object(&set, &new_rel) {
                    warn!(object = %id, error = %del, "failed to back out new object");
                }
                self.evict_directory(parent);
                return Err(e);
            }
        };
        self.cache_directory(dir);

        // The directory now reflects the new state, so the old version's
        // rewrite may become visible. Past this point the new object is
        // never backed out: if the rewrite commit fails, the old object
        // simply stays a full file (its entry size drifts until the next
        // check) and the upload still stands.
        if let Some(rewrite) = old_rewrite.take() {
            if let Err(e) = rewrite.commit(true) {
                warn!(account = %self.account, old = %diff_from, error = %e,
                    "failed to commit old version as patch; keeping it whole");
            }
        }

        // Counter and refcount updates come last; drift here is healed by
        // housekeeping.
        let info = self.info_mut()?;
        if diff_from.is_none() {
            info.adjust_num_files(1);
        } else {
            info.adjust_num_old_files(1);
        }
        info.change_blocks_used(adjusted_new_blocks);
        info.change_blocks_in_current_files(adjusted_new_blocks - blocks_in_old);
        info.change_blocks_in_old_files(blocks_in_old);

        self.refcount_mut()?.add_reference(id);
        self.save_info(false)?;

        debug!(account = %self.account, parent = %parent, id = %id,
            diff_from = %diff_from, blocks = new_blocks, "added file");
        Ok(id)
    }

    /// Flags every live entry named `name` as deleted.
    ///
    /// Returns the id of the current (non-old) version, or
    /// [`ObjectId::NONE`] when nothing matched.
    pub fn delete_file(
        &mut self,
        parent: ObjectId,
        name: &crate::name::ObjectName,
    ) -> StoreResult<ObjectId> {
        self.require_writable()?;

        let mut dir = self.take_directory(parent)?;
        let mut found = ObjectId::NONE;
        let mut changed = false;
        let mut blocks_deleted: i64 = 0;

        for entry in dir.entries_matching_mut(EntryFlags::FILE, EntryFlags::DELETED) {
            if entry.name == *name {
                entry.flags.insert(EntryFlags::DELETED);
                changed = true;
                blocks_deleted += entry.size_in_blocks as i64;
                if !entry.is_old() {
                    found = entry.object_id;
                }
            }
        }

        if changed {
            if let Err(e) = self.save_directory(&mut dir) {
                self.evict_directory(parent);
                return Err(e);
            }
            self.cache_directory(dir);

            let info = self.info_mut()?;
            info.adjust_num_files(-1);
            info.adjust_num_deleted_files(1);
            info.change_blocks_in_deleted_files(blocks_deleted);
            self.save_info(false)?;
        } else {
            self.cache_directory(dir);
        }

        Ok(found)
    }

    /// Clears the deleted flag on entries referencing `id`.
    ///
    /// Returns true when a current (non-old) version was restored.
    pub fn undelete_file(&mut self, parent: ObjectId, id: ObjectId) -> StoreResult<bool> {
        self.require_writable()?;

        let mut dir = self.take_directory(parent)?;
        let mut restored_current = false;
        let mut changed = false;
        let mut blocks_delta: i64 = 0;

        for entry in
            dir.entries_matching_mut(EntryFlags::FILE | EntryFlags::DELETED, EntryFlags::NONE)
        {
            if entry.object_id == id {
                entry.flags.remove(EntryFlags::DELETED);
                changed = true;
                blocks_delta -= entry.size_in_blocks as i64;
                if !entry.is_old() {
                    restored_current = true;
                }
            }
        }

        if changed {
            if let Err(e) = self.save_directory(&mut dir) {
                self.evict_directory(parent);
                return Err(e);
            }
            self.cache_directory(dir);
            self.info_mut()?.change_blocks_in_deleted_files(blocks_delta);
            self.save_info(true)?;
        } else {
            self.cache_directory(dir);
        }

        Ok(restored_current)
    }

    /// Creates a directory, or returns the existing one of the same name.
    pub fn add_directory(
        &mut self,
        parent: ObjectId,
        name: &crate::name::ObjectName,
        attributes: &[u8],
        attributes_mod_time: u64,
    ) -> StoreResult<AddDirectoryOutcome> {
        self.require_writable()?;

        let mut dir = self.take_directory(parent)?;

        // A live directory of the same name satisfies the request.
        let existing_id = dir
            .entries_matching(
                EntryFlags::NONE,
                EntryFlags::DELETED | EntryFlags::OLD_VERSION,
            )
            .find(|e| e.name == *name)
            .map(|e| e.object_id);
        if let Some(id) = existing_id {
            self.cache_directory(dir);
            return Ok(AddDirectoryOutcome {
                id,
                already_exists: true,
            });
        }

        let id = self.allocate_object_id()?;
        self.ensure_object_dir(id)?;
        let new_rel = self.object_rel(id);
        let set = self.backend.disc_set(self.disc_set)?.clone();

        let mut empty = Directory::new(id, parent);
        empty.set_attributes(attributes.to_vec(), attributes_mod_time);
        let mut writer = StripedWriter::open(&set, &new_rel, false)?;
        let mut buf = Vec::new();
        empty.write_to(&mut buf)?;
        writer.write_all(&buf)?;
        let dir_blocks = writer.usage_in_blocks()?;
        writer.commit(true)?;

        {
            let info = self.info_mut()?;
            info.change_blocks_used(dir_blocks as i64);
            info.change_blocks_in_directories(dir_blocks as i64);
        }

        let result = (|| -> StoreResult<()> {
            dir.add_entry(DirectoryEntry::new(
                name.clone(),
                0,
                id,
                dir_blocks,
                EntryFlags::DIR,
                0,
            ));
            self.save_directory(&mut dir)?;
            self.refcount_mut()?.add_reference(id);
            Ok(())
        })();

        if let Err(e) = result {
            if let Err(del) = striped::delete_object(&set, &new_rel) {
                warn!(object = %id, error = %del, "failed to back out new directory");
            }
            self.evict_directory(parent);
            return Err(e);
        }
        self.cache_directory(dir);

        self.info_mut()?.adjust_num_directories(1);
        self.save_info(false)?;

        debug!(account = %self.account, parent = %parent, id = %id, "added directory");
        Ok(AddDirectoryOutcome {
            id,
            already_exists: false,
        })
    }

    /// Recursively flips the deleted flag over a directory subtree, then on
    /// the directory's own entry in its parent.
    pub fn delete_directory(&mut self, id: ObjectId, undelete: bool) -> StoreResult<()> {
        self.require_writable()?;
        if id == ObjectId::ROOT {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "cannot delete the account root",
            )));
        }

        let container = {
            let dir = self.take_directory(id)?;
            let container = dir.container_id();
            self.cache_directory(dir);
            container
        };

        let mut blocks_deleted: i64 = 0;
        let result = (|| -> StoreResult<()> {
            self.delete_directory_recurse(id, undelete, &mut blocks_deleted)?;

            let mut parent = self.take_directory(container)?;
            let (include, exclude) = if undelete {
                (EntryFlags::DELETED, EntryFlags::NONE)
            } else {
                (EntryFlags::NONE, EntryFlags::DELETED)
            };
            for entry in parent.entries_matching_mut(include, exclude) {
                if entry.object_id == id {
                    if undelete {
                        entry.flags.remove(EntryFlags::DELETED);
                    } else {
                        entry.flags.insert(EntryFlags::DELETED);
                    }
                    break;
                }
            }
            self.save_directory(&mut parent)?;
            self.cache_directory(parent);
            Ok(())
        })();

        if let Err(e) = result {
            self.evict_directory(container);
            self.evict_directory(id);
            return Err(e);
        }

        let info = self.info_mut()?;
        if undelete {
            info.change_blocks_in_deleted_files(-blocks_deleted);
            info.adjust_num_directories(1);
        } else {
            info.change_blocks_in_deleted_files(blocks_deleted);
            info.adjust_num_directories(-1);
        }
        self.save_info(false)?;
        Ok(())
    }

    fn delete_directory_recurse(
        &mut self,
        id: ObjectId,
        undelete: bool,
        blocks_deleted: &mut i64,
    ) -> StoreResult<()> {
        // Subdirectories first. The directory is re-taken afterwards
        // because recursion may have flushed the cache.
        let sub_dirs: Vec<ObjectId> = {
            let dir = self.take_directory(id)?;
            let (include, exclude) = if undelete {
                (EntryFlags::DIR | EntryFlags::DELETED, EntryFlags::NONE)
            } else {
                (EntryFlags::DIR, EntryFlags::DELETED)
            };
            let subs = dir
                .entries_matching(include, exclude)
                .map(|e| e.object_id)
                .collect();
            self.cache_directory(dir);
            subs
        };

        for sub in sub_dirs {
            self.delete_directory_recurse(sub, undelete, blocks_deleted)?;
        }

        let mut dir = match self.take_directory(id) {
            Ok(d) => d,
            Err(e) => {
                self.evict_directory(id);
                return Err(e);
            }
        };
        let (include, exclude) = if undelete {
            (EntryFlags::DELETED, EntryFlags::NONE)
        } else {
            (EntryFlags::NONE, EntryFlags::DELETED)
        };
        let mut changed = false;
        for entry in dir.entries_matching_mut(include, exclude) {
            if undelete {
                entry.flags.remove(EntryFlags::DELETED);
            } else {
                entry.flags.insert(EntryFlags::DELETED);
            }
            if entry.is_file() {
                *blocks_deleted += entry.size_in_blocks as i64;
            }
            changed = true;
        }

        if changed {
            if let Err(e) = self.save_directory(&mut dir) {
                self.evict_directory(id);
                return Err(e);
            }
        }
        self.cache_directory(dir);
        Ok(())
    }

    /// Moves an object (optionally all entries sharing its name) between
    /// directories, or renames within one.
    pub fn move_object(
        &mut self,
        id: ObjectId,
        from: ObjectId,
        to: ObjectId,
        new_name: &crate::name::ObjectName,
        move_all_with_same_name: bool,
        allow_over_deleted: bool,
    ) -> StoreResult<()> {
        self.require_writable()?;

        // Deleted entries may be hidden from the conflict check.
        let conflict_exclude = if allow_over_deleted {
            EntryFlags::DELETED
        } else {
            EntryFlags::NONE
        };

        if from == to {
            let mut dir = self.take_directory(from)?;
            let result = (|| -> StoreResult<()> {
                let old_name = dir
                    .find_entry_by_id(id)
                    .ok_or(StoreError::EntryNotFound {
                        entry: id,
                        directory: from,
                    })?
                    .name
                    .clone();

                if dir
                    .entries_matching(EntryFlags::NONE, conflict_exclude)
                    .any(|e| e.name == *new_name)
                {
                    return Err(StoreError::NameAlreadyExists(to));
                }

                if move_all_with_same_name {
                    for entry in dir.entries_mut() {
                        if entry.name == old_name {
                            entry.name = new_name.clone();
                        }
                    }
                } else {
                    dir.find_entry_by_id_mut(id).expect("found above").name = new_name.clone();
                }
                self.save_directory(&mut dir)
            })();

            match result {
                Ok(()) => {
                    self.cache_directory(dir);
                    return Ok(());
                }
                Err(e) => {
                    self.evict_directory(from);
                    return Err(e);
                }
            }
        }

        // Cross-directory: copy entries into the destination, remove them
        // from the source, then fix container ids of any moved directories.
        let mut moving: Vec<DirectoryEntry> = Vec::new();
        let mut dirs_to_repoint: Vec<ObjectId> = Vec::new();

        let result = (|| -> StoreResult<()> {
            {
                let src = self.take_directory(from)?;
                let entry = src.find_entry_by_id(id).ok_or(StoreError::EntryNotFound {
                    entry: id,
                    directory: from,
                })?;
                let match_name = entry.name.clone();
                for e in src.entries() {
                    let matches = if move_all_with_same_name {
                        e.name == match_name
                    } else {
                        e.object_id == id
                    };
                    if matches {
                        moving.push(e.clone());
                        if e.is_dir() {
                            dirs_to_repoint.push(e.object_id);
                        }
                    }
                }
                self.cache_directory(src);
            }

            {
                let mut dst = self.take_directory(to)?;
                if dst
                    .entries_matching(EntryFlags::NONE, conflict_exclude)
                    .any(|e| e.name == *new_name)
                {
                    self.cache_directory(dst);
                    return Err(StoreError::NameAlreadyExists(to));
                }
                for e in &moving {
                    let mut copy = e.clone();
                    copy.name = new_name.clone();
                    dst.add_entry(copy);
                }
                self.save_directory(&mut dst)?;
                self.cache_directory(dst);
            }

            let removal = (|| -> StoreResult<()> {
                let mut src = self.take_directory(from)?;
                for e in &moving {
                    src.delete_entry(e.object_id)?;
                }
                self.save_directory(&mut src)?;
                self.cache_directory(src);
                Ok(())
            })();

            if let Err(e) = removal {
                // Undo the insertion so the object is not listed twice.
                let mut dst = self.take_directory(to)?;
                for m in &moving {
                    let _ = dst.delete_entry(m.object_id);
                }
                self.save_directory(&mut dst)?;
                self.cache_directory(dst);
                return Err(e);
            }

            for dir_id in &dirs_to_repoint {
                let mut moved = self.take_directory(*dir_id)?;
                moved.set_container_id(to);
                self.save_directory(&mut moved)?;
                self.cache_directory(moved);
            }
            Ok(())
        })();

        if let Err(e) = result {
            self.evict_directory(from);
            self.evict_directory(to);
            for dir_id in &dirs_to_repoint {
                self.evict_directory(*dir_id);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Rewrites the attribute blob of a directory object.
    pub fn change_dir_attributes(
        &mut self,
        id: ObjectId,
        attributes: &[u8],
        attributes_mod_time: u64,
    ) -> StoreResult<()> {
        self.require_writable()?;

        let mut dir = self.take_directory(id)?;
        dir.set_attributes(attributes.to_vec(), attributes_mod_time);
        if let Err(e) = self.save_directory(&mut dir) {
            self.evict_directory(id);
            return Err(e);
        }
        self.cache_directory(dir);
        Ok(())
    }

    /// Updates the attributes on the live entry named `name`.
    ///
    /// Returns the entry's object id, or `None` when no live entry matched.
    pub fn change_file_attributes(
        &mut self,
        parent: ObjectId,
        name: &crate::name::ObjectName,
        attributes: &[u8],
        attributes_hash: u64,
    ) -> StoreResult<Option<ObjectId>> {
        self.require_writable()?;

        let mut dir = self.take_directory(parent)?;
        let mut found = None;
        for entry in dir.entries_matching_mut(
            EntryFlags::FILE,
            EntryFlags::DELETED | EntryFlags::OLD_VERSION,
        ) {
            if entry.name == *name {
                entry.set_attributes(attributes.to_vec(), attributes_hash);
                found = Some(entry.object_id);
                break;
            }
        }

        if found.is_none() {
            self.cache_directory(dir);
            return Ok(None);
        }

        if let Err(e) = self.save_directory(&mut dir) {
            self.evict_directory(parent);
            return Err(e);
        }
        self.cache_directory(dir);
        Ok(found)
    }

    /// Plausibility bound for object ids: anything beyond the last recorded
    /// allocation plus the lazy-save window cannot exist.
    fn id_plausible(&self, id: ObjectId) -> StoreResult<bool> {
        let last = self.info()?.last_object_id().as_u64();
        Ok(!id.is_none() && id.as_u64() <= last + 2 * STORE_INFO_SAVE_DELAY as u64)
    }

    /// Opens a raw read stream over an object.
    pub fn open_object(&self, id: ObjectId) -> StoreResult<StripedReader> {
        if !self.id_plausible(id)? {
            return Err(StoreError::object_not_found(id));
        }
        let set = self.set()?;
        match StripedReader::open(set, &self.object_rel(id)) {
            Ok(r) => Ok(r),
            Err(StoreError::NotFound(_)) => Err(StoreError::object_not_found(id)),
            Err(e) => Err(e),
        }
    }

    /// Tests whether an object exists, optionally sniffing its magic word.
    pub fn object_exists(&self, id: ObjectId, kind: ObjectKind) -> StoreResult<bool> {
        if !self.id_plausible(id)? {
            return Ok(false);
        }
        let set = self.set()?;
        let rel = self.object_rel(id);
        if kind == ObjectKind::Any {
            return Ok(striped::object_exists(set, &rel)?.is_some());
        }

        let mut reader = match StripedReader::open(set, &rel) {
            Ok(r) => r,
            Err(StoreError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let mut magic = [0u8; 4];
        if reader.read_exact(&mut magic).is_err() {
            return Ok(false);
        }
        let magic = u32::from_be_bytes(magic);
        Ok(match kind {
            ObjectKind::File => magic == FILE_MAGIC_V1 || magic == FILE_MAGIC_V0,
            ObjectKind::Directory => magic == crate::directory::DIRECTORY_MAGIC,
            ObjectKind::Any => unreachable!(),
        })
    }

    /// The client's divergence-detection marker.
    pub fn client_store_marker(&self) -> StoreResult<u64> {
        Ok(self.info()?.client_store_marker())
    }

    /// Replaces the client store marker and flushes immediately.
    pub fn set_client_store_marker(&mut self, marker: u64) -> StoreResult<()> {
        self.require_writable()?;
        self.info_mut()?.set_client_store_marker(marker);
        self.save_info(false)
    }

    /// Current usage and limits: (used, soft, hard) in blocks.
    pub fn disc_usage(&self) -> StoreResult<(u64, u64, u64)> {
        let info = self.info()?;
        Ok((
            info.blocks_used().max(0) as u64,
            info.blocks_soft_limit(),
            info.blocks_hard_limit(),
        ))
    }

    /// Read access to the loaded account info.
    pub fn account_info(&self) -> StoreResult<&AccountInfo> {
        self.info()
    }

    /// Flushes state and releases the write lock. Called at session end.
    pub fn finish(&mut self) -> StoreResult<()> {
        if !self.read_only {
            if self.info.as_ref().is_some_and(|i| i.is_modified()) {
                self.save_info(false)?;
            }
            if let Some(refcount) = self.refcount.as_mut() {
                if refcount.is_modified() {
                    refcount.commit()?;
                }
            }
        }
        self.dir_cache.clear();
        if self.write_lock.is_held() {
            self.write_lock.release()?;
            self.read_only = true;
        }
        debug!(account = %self.account, "finished store context");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{AccountDatabase, AccountManager};
    use crate::backend::single_disc_backend;
    use crate::file_format::{decode_file_payload, encode_diff, encode_file};
    use crate::name::ObjectName;
    use tempfile::TempDir;

    const ACCT: AccountId = AccountId(0xA);

    fn open_context(dir: &TempDir, soft: u64, hard: u64) -> StoreContext {
        let store_root = dir.path().join("store");
        std::fs::create_dir_all(&store_root).unwrap();
        let backend = Arc::new(single_disc_backend(&store_root, 4096));
        let db = AccountDatabase::load(&dir.path().join("accounts.txt")).unwrap();
        let mut mgr = AccountManager::new(&backend, db);
        mgr.create_account(ACCT, 0, soft, hard).unwrap();

        let mut ctx = StoreContext::new(backend, Arc::new(NullCoordinator), ACCT, 0);
        ctx.open(true).unwrap();
        ctx
    }

    fn name(s: &str) -> ObjectName {
        ObjectName::from_bytes(s.as_bytes().to_vec())
    }

    fn encoded(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        encode_file(payload, ObjectId::ROOT, 100, 7, b"", &mut out).unwrap();
        out
    }

    fn add_payload(ctx: &mut StoreContext, n: &str, payload: &[u8]) -> ObjectId {
        let stream = encoded(payload);
        ctx.add_file(
            ObjectId::ROOT,
            &name(n),
            100,
            7,
            ObjectId::NONE,
            true,
            &mut std::io::Cursor::new(stream),
        )
        .unwrap()
    }

    #[test]
    fn test_add_and_read_back_single_file() {
        let dir = TempDir::new().unwrap();
        let mut ctx = open_context(&dir, 1000, 2000);

        let payload = vec![0x42u8; 100];
        let id = add_payload(&mut ctx, "doc", &payload);
        assert_eq!(id, ObjectId(2));

        let root = ctx.get_directory(ObjectId::ROOT).unwrap();
        let entry = root.find_entry_by_id(id).unwrap();
        assert!(entry.is_file());
        assert!(entry.is_live());
        assert_eq!(entry.size_in_blocks, 1);

        let mut reader = ctx.open_object(id).unwrap();
        let payload_back = decode_file_payload(&mut reader).unwrap();
        assert_eq!(payload_back, payload);

        let info = ctx.account_info().unwrap();
        assert_eq!(info.num_files(), 1);
        assert!(info.blocks_used() >= 2);
        ctx.finish().unwrap();
    }

    #[test]
    fn test_version_chain_with_reverse_diff() {
        let dir = TempDir::new().unwrap();
        let mut ctx = open_context(&dir, 1000, 2000);

        let old_payload: Vec<u8> = (0..3 * 4096u32).map(|i| (i % 251) as u8).collect();
        let old_id = add_payload(&mut ctx, "doc", &old_payload);
        let old_envelope = {
            let mut r = ctx.open_object(old_id).unwrap();
            r.read_remaining().unwrap()
        };

        let mut new_payload = old_payload.clone();
        new_payload[0] ^= 0xFF;
        let mut patch = Vec::new();
        encode_diff(
            &new_payload,
            &mut std::io::Cursor::new(&old_envelope),
            ObjectId::ROOT,
            200,
            7,
            b"",
            &mut patch,
        )
        .unwrap();

        let new_id = ctx
            .add_file(
                ObjectId::ROOT,
                &name("doc"),
                200,
                7,
                old_id,
                true,
                &mut std::io::Cursor::new(patch),
            )
            .unwrap();

        let root = ctx.get_directory(ObjectId::ROOT).unwrap();
        let old_entry = root.find_entry_by_id(old_id).unwrap();
        assert!(old_entry.is_old());
        assert_eq!(old_entry.depends_newer, new_id);
        let new_entry = root.find_entry_by_id(new_id).unwrap();
        assert!(new_entry.is_live());
        assert_eq!(new_entry.depends_older, old_id);

        // The new object decodes to the new payload.
        let mut new_reader = ctx.open_object(new_id).unwrap();
        assert_eq!(decode_file_payload(&mut new_reader).unwrap(), new_payload);

        // The old object is now a reverse patch; combined with the new one
        // it reproduces the original envelope exactly.
        let mut old_reader = ctx.open_object(old_id).unwrap();
        let mut new_reader = ctx.open_object(new_id).unwrap();
        let mut restored = Vec::new();
        combine_file(&mut old_reader, &mut new_reader, &mut restored).unwrap();
        assert_eq!(restored, old_envelope);
        ctx.finish().unwrap();
    }

    #[test]
    fn test_diff_from_missing() {
        let dir = TempDir::new().unwrap();
        let mut ctx = open_context(&dir, 1000, 2000);
        let err = ctx
            .add_file(
                ObjectId::ROOT,
                &name("doc"),
                100,
                7,
                ObjectId(77),
                true,
                &mut std::io::Cursor::new(encoded(b"payload")),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::DiffFromMissing(ObjectId(77))));
    }

    #[test]
    fn test_hard_limit_rejects_and_leaves_no_object() {
        let dir = TempDir::new().unwrap();
        let mut ctx = open_context(&dir, 2, 3);

        let before = ctx.account_info().unwrap().blocks_used();
        let payload = vec![1u8; 20 * 4096];
        let err = ctx
            .add_file(
                ObjectId::ROOT,
                &name("big"),
                100,
                7,
                ObjectId::NONE,
                true,
                &mut std::io::Cursor::new(encoded(&payload)),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::StorageLimitExceeded { .. }));

        assert_eq!(ctx.account_info().unwrap().blocks_used(), before);
        assert!(!ctx.object_exists(ObjectId(2), ObjectKind::Any).unwrap());
        ctx.finish().unwrap();
    }

    #[test]
    fn test_garbage_upload_does_not_verify() {
        let dir = TempDir::new().unwrap();
        let mut ctx = open_context(&dir, 1000, 2000);
        let err = ctx
            .add_file(
                ObjectId::ROOT,
                &name("junk"),
                100,
                7,
                ObjectId::NONE,
                true,
                &mut std::io::Cursor::new(vec![0u8; 64]),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::AddedFileDoesNotVerify));
        assert!(!ctx.object_exists(ObjectId(2), ObjectKind::Any).unwrap());
    }

    #[test]
    fn test_delete_and_undelete_file() {
        let dir = TempDir::new().unwrap();
        let mut ctx = open_context(&dir, 1000, 2000);
        let id = add_payload(&mut ctx, "doc", &[5u8; 100]);

        let deleted_before = ctx.account_info().unwrap().blocks_in_deleted_files();
        let found = ctx.delete_file(ObjectId::ROOT, &name("doc")).unwrap();
        assert_eq!(found, id);
        let root = ctx.get_directory(ObjectId::ROOT).unwrap();
        assert!(root.find_entry_by_id(id).unwrap().is_deleted());
        let deleted_after = ctx.account_info().unwrap().blocks_in_deleted_files();
        assert_eq!(deleted_after - deleted_before, 1);

        assert!(ctx.undelete_file(ObjectId::ROOT, id).unwrap());
        let root = ctx.get_directory(ObjectId::ROOT).unwrap();
        assert!(!root.find_entry_by_id(id).unwrap().is_deleted());
        assert_eq!(
            ctx.account_info().unwrap().blocks_in_deleted_files(),
            deleted_before
        );

        // Deleting a name that does not exist reports no object.
        assert_eq!(
            ctx.delete_file(ObjectId::ROOT, &name("ghost")).unwrap(),
            ObjectId::NONE
        );
        ctx.finish().unwrap();
    }

    #[test]
    fn test_add_directory_idempotent_by_name() {
        let dir = TempDir::new().unwrap();
        let mut ctx = open_context(&dir, 1000, 2000);

        let first = ctx
            .add_directory(ObjectId::ROOT, &name("photos"), b"attrs", 50)
            .unwrap();
        assert!(!first.already_exists);

        let second = ctx
            .add_directory(ObjectId::ROOT, &name("photos"), b"other", 60)
            .unwrap();
        assert!(second.already_exists);
        assert_eq!(first.id, second.id);

        assert!(ctx
            .object_exists(first.id, ObjectKind::Directory)
            .unwrap());
        assert!(!ctx.object_exists(first.id, ObjectKind::File).unwrap());
        assert_eq!(ctx.account_info().unwrap().num_directories(), 2);
        ctx.finish().unwrap();
    }

    #[test]
    fn test_delete_directory_recursive_and_undelete_restores_flags() {
        let dir = TempDir::new().unwrap();
        let mut ctx = open_context(&dir, 1000, 2000);

        let sub = ctx
            .add_directory(ObjectId::ROOT, &name("sub"), b"", 0)
            .unwrap()
            .id;
        let stream = encoded(&[7u8; 200]);
        let file_id = ctx
            .add_file(
                sub,
                &name("inner"),
                100,
                7,
                ObjectId::NONE,
                true,
                &mut std::io::Cursor::new(stream),
            )
            .unwrap();

        let flags_before: Vec<u16> = ctx
            .get_directory(sub)
            .unwrap()
            .entries()
            .map(|e| e.flags.0)
            .collect();

        ctx.delete_directory(sub, false).unwrap();
        let subdir = ctx.get_directory(sub).unwrap();
        assert!(subdir.find_entry_by_id(file_id).unwrap().is_deleted());
        let root = ctx.get_directory(ObjectId::ROOT).unwrap();
        assert!(root.find_entry_by_id(sub).unwrap().is_deleted());

        ctx.delete_directory(sub, true).unwrap();
        let flags_after: Vec<u16> = ctx
            .get_directory(sub)
            .unwrap()
            .entries()
            .map(|e| e.flags.0)
            .collect();
        assert_eq!(flags_before, flags_after);
        let root = ctx.get_directory(ObjectId::ROOT).unwrap();
        assert!(!root.find_entry_by_id(sub).unwrap().is_deleted());
        ctx.finish().unwrap();
    }

    #[test]
    fn test_move_object_between_directories() {
        let dir = TempDir::new().unwrap();
        let mut ctx = open_context(&dir, 1000, 2000);

        let sub = ctx
            .add_directory(ObjectId::ROOT, &name("dest"), b"", 0)
            .unwrap()
            .id;
        let id = add_payload(&mut ctx, "doc", &[9u8; 50]);

        ctx.move_object(id, ObjectId::ROOT, sub, &name("renamed"), true, false)
            .unwrap();

        let root = ctx.get_directory(ObjectId::ROOT).unwrap();
        assert!(root.find_entry_by_id(id).is_none());
        let dest = ctx.get_directory(sub).unwrap();
        let moved = dest.find_entry_by_id(id).unwrap();
        assert_eq!(moved.name, name("renamed"));
        ctx.finish().unwrap();
    }

    #[test]
    fn test_move_conflicts_and_over_deleted() {
        let dir = TempDir::new().unwrap();
        let mut ctx = open_context(&dir, 1000, 2000);

        let a = add_payload(&mut ctx, "a", &[1u8; 10]);
        let _b = add_payload(&mut ctx, "b", &[2u8; 10]);

        // Renaming a over live b fails.
        let err = ctx
            .move_object(a, ObjectId::ROOT, ObjectId::ROOT, &name("b"), false, false)
            .unwrap_err();
        assert!(matches!(err, StoreError::NameAlreadyExists(_)));

        // After deleting b, the move succeeds when deleted entries are
        // allowed to be hidden.
        ctx.delete_file(ObjectId::ROOT, &name("b")).unwrap();
        let err = ctx
            .move_object(a, ObjectId::ROOT, ObjectId::ROOT, &name("b"), false, false)
            .unwrap_err();
        assert!(matches!(err, StoreError::NameAlreadyExists(_)));
        ctx.move_object(a, ObjectId::ROOT, ObjectId::ROOT, &name("b"), false, true)
            .unwrap();

        // Moving a missing entry reports EntryNotFound.
        let err = ctx
            .move_object(
                ObjectId(999),
                ObjectId::ROOT,
                ObjectId::ROOT,
                &name("x"),
                false,
                false,
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::EntryNotFound { .. }));
        ctx.finish().unwrap();
    }

    #[test]
    fn test_moved_directory_container_id_updated() {
        let dir = TempDir::new().unwrap();
        let mut ctx = open_context(&dir, 1000, 2000);

        let inner = ctx
            .add_directory(ObjectId::ROOT, &name("inner"), b"", 0)
            .unwrap()
            .id;
        let dest = ctx
            .add_directory(ObjectId::ROOT, &name("dest"), b"", 0)
            .unwrap()
            .id;

        ctx.move_object(inner, ObjectId::ROOT, dest, &name("inner"), false, false)
            .unwrap();

        let moved = ctx.get_directory(inner).unwrap();
        assert_eq!(moved.container_id(), dest);
        ctx.finish().unwrap();
    }

    #[test]
    fn test_change_attributes() {
        let dir = TempDir::new().unwrap();
        let mut ctx = open_context(&dir, 1000, 2000);

        let sub = ctx
            .add_directory(ObjectId::ROOT, &name("sub"), b"old", 1)
            .unwrap()
            .id;
        ctx.change_dir_attributes(sub, b"new", 99).unwrap();
        let subdir = ctx.get_directory(sub).unwrap();
        assert_eq!(subdir.attributes(), b"new");
        assert_eq!(subdir.attributes_mod_time(), 99);

        let id = add_payload(&mut ctx, "doc", &[3u8; 10]);
        let changed = ctx
            .change_file_attributes(ObjectId::ROOT, &name("doc"), b"fattr", 0x123)
            .unwrap();
        assert_eq!(changed, Some(id));
        let root = ctx.get_directory(ObjectId::ROOT).unwrap();
        let entry = root.find_entry_by_id(id).unwrap();
        assert_eq!(entry.attributes, b"fattr");
        assert_eq!(entry.attributes_hash, 0x123);

        let missing = ctx
            .change_file_attributes(ObjectId::ROOT, &name("nope"), b"", 0)
            .unwrap();
        assert_eq!(missing, None);
        ctx.finish().unwrap();
    }

    #[test]
    fn test_open_object_bounds() {
        let dir = TempDir::new().unwrap();
        let ctx = {
            let mut c = open_context(&dir, 1000, 2000);
            c.finish().unwrap();
            c
        };
        // Context is finished but info is still loaded for reads.
        assert!(matches!(
            ctx.open_object(ObjectId::NONE),
            Err(StoreError::NotFound(_))
        ));
        let absurd = ObjectId(10_000_000);
        assert!(matches!(
            ctx.open_object(absurd),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_client_store_marker() {
        let dir = TempDir::new().unwrap();
        let mut ctx = open_context(&dir, 1000, 2000);
        assert_eq!(ctx.client_store_marker().unwrap(), 0);
        ctx.set_client_store_marker(0xC0FFEE).unwrap();
        assert_eq!(ctx.client_store_marker().unwrap(), 0xC0FFEE);
        ctx.finish().unwrap();
    }

    #[test]
    fn test_read_only_context_rejects_mutation() {
        let dir = TempDir::new().unwrap();
        let mut ctx = open_context(&dir, 1000, 2000);
        ctx.finish().unwrap();

        let mut ro = StoreContext::new(
            ctx.backend.clone(),
            Arc::new(NullCoordinator),
            ACCT,
            0,
        );
        ro.open(false).unwrap();
        assert!(ro.is_read_only());
        let err = ro
            .add_file(
                ObjectId::ROOT,
                &name("doc"),
                0,
                0,
                ObjectId::NONE,
                true,
                &mut std::io::Cursor::new(encoded(b"x")),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::ReadOnly));
        assert!(matches!(
            ro.set_client_store_marker(1),
            Err(StoreError::ReadOnly)
        ));
    }

    #[test]
    fn test_disc_usage() {
        let dir = TempDir::new().unwrap();
        let mut ctx = open_context(&dir, 100, 200);
        let (used, soft, hard) = ctx.disc_usage().unwrap();
        assert!(used >= 1);
        assert_eq!(soft, 100);
        assert_eq!(hard, 200);
        ctx.finish().unwrap();
    }
}
