//! Housekeeping: reclaiming space from old and deleted versions.
//!
//! A housekeeping run takes the account's write lock (politely: it skips
//! the account rather than contend with a live session), walks every
//! directory depth-first, and then deletes reclaim candidates in score
//! order until the account is back under its soft limit. Patch-chain
//! elements are "baked" into standalone files before a file they depend on
//! is removed. The run finishes by rewriting the refcount database and the
//! info counters from what the scan actually saw, healing any drift left by
//! crashed sessions.
//!
//! Between candidate deletions and after every directory the run polls its
//! control channel, so a session wanting the account waits at most about a
//! second for the lock.

use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::accounts::{account_root_rel, write_lock_path};
use crate::backend::{DiscSet, StoreBackend};
use crate::directory::{Directory, EntryFlags};
use crate::error::{StoreError, StoreResult};
use crate::file_format::{combine_file, verify_encoded_file_format};
use crate::info::AccountInfo;
use crate::lock::NamedLock;
use crate::naming;
use crate::progress::ProgressSink;
use crate::refcount::RefCountDatabase;
use crate::striped::{self, StripedReader, StripedWriter};
use crate::types::{AccountId, ObjectId};

/// Tuning for a housekeeping run.
#[derive(Debug, Clone)]
pub struct HousekeepingConfig {
    /// Score weight for entries flagged only as old versions.
    pub old_version_weight: u64,
    /// Score weight for deleted entries; deleted beats old at equal age.
    pub deleted_weight: u64,
    /// Entries younger than this (by their recorded modification time, in
    /// seconds) are never reclaimed.
    pub minimum_age_secs: u64,
    /// Attempts to take the account lock before skipping the account.
    pub lock_attempts: u32,
    /// Pause between lock attempts.
    pub lock_retry: Duration,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            old_version_weight: 1,
            deleted_weight: 2,
            minimum_age_secs: 0,
            lock_attempts: 2,
            lock_retry: Duration::from_millis(200),
        }
    }
}

/// Control channel polled at yield points.
pub trait HousekeepingControl {
    /// True when the run should stop promptly, flush and release the lock.
    /// Polled between candidate deletions and after every directory.
    fn should_stop(&mut self, account: AccountId) -> bool;
}

/// A control channel that never interrupts.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverStop;

impl HousekeepingControl for NeverStop {
    fn should_stop(&mut self, _account: AccountId) -> bool {
        false
    }
}

/// What a housekeeping run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HousekeepingOutcome {
    /// The account was busy and the run skipped it entirely.
    pub skipped_locked: bool,
    /// The control channel asked the run to stop before it finished.
    pub stopped_early: bool,
    /// Directories scanned.
    pub directories_scanned: u64,
    /// Entries examined.
    pub entries_scanned: u64,
    /// File versions deleted.
    pub files_deleted: u64,
    /// Empty deleted directories removed.
    pub directories_deleted: u64,
    /// Patch-chain elements rewritten as standalone files.
    pub files_baked: u64,
    /// Blocks freed by deletions.
    pub blocks_freed: u64,
    /// Orphan objects removed because nothing references them.
    pub orphans_deleted: u64,
}

/// A reclaim candidate found during the scan.
#[derive(Debug, Clone)]
struct Candidate {
    score: u64,
    age_secs: u64,
    id: ObjectId,
    parent: ObjectId,
    size_in_blocks: u64,
}

/// Counters accumulated while scanning; becomes the new info record.
#[derive(Debug, Default, Clone)]
struct ScanTotals {
    blocks_used: i64,
    blocks_current: i64,
    blocks_old: i64,
    blocks_deleted: i64,
    blocks_dirs: i64,
    num_files: u64,
    num_old: u64,
    num_deleted: u64,
    num_dirs: u64,
}

/// One housekeeping pass over one account.
pub struct HousekeepingRun<'a> {
    backend: &'a StoreBackend,
    account: AccountId,
    disc_set: usize,
    account_rel: String,
    config: HousekeepingConfig,
}

impl<'a> HousekeepingRun<'a> {
    /// Creates a run for the given account.
    pub fn new(
        backend: &'a StoreBackend,
        account: AccountId,
        disc_set: usize,
        config: HousekeepingConfig,
    ) -> Self {
        Self {
            backend,
            account,
            disc_set,
            account_rel: account_root_rel(account),
            config,
        }
    }

    fn set(&self) -> StoreResult<&DiscSet> {
        self.backend.disc_set(self.disc_set)
    }

    fn object_rel(&self, id: ObjectId) -> String {
        format!("{}/{}", self.account_rel, naming::object_filename(id))
    }

    fn load_directory(&self, id: ObjectId) -> StoreResult<Directory> {
        let set = self.set()?;
        let mut reader = StripedReader::open(set, &self.object_rel(id))?;
        let size = reader.usage_in_blocks();
        let bytes = reader.read_remaining()?;
        let mut dir = Directory::read_from(&mut Cursor::new(bytes))?;
        dir.set_size_in_blocks(size);
        Ok(dir)
    }

    fn save_directory(&self, dir: &Directory) -> StoreResult<u64> {
        let set = self.set()?;
        let mut writer = StripedWriter::open(set, &self.object_rel(dir.object_id()), true)?;
        let mut buf = Vec::new();
        dir.write_to(&mut buf)?;
        writer.write_all(&buf)?;
        let blocks = writer.usage_in_blocks()?;
        writer.commit(true)?;
        Ok(blocks)
    }

    /// Runs housekeeping with wall-clock "now".
    pub fn run(
        &mut self,
        control: &mut dyn HousekeepingControl,
        progress: &mut dyn ProgressSink,
    ) -> StoreResult<HousekeepingOutcome> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.run_at(now, control, progress)
    }

    /// Runs housekeeping as of the given time (seconds since the epoch).
    pub fn run_at(
        &mut self,
        now_secs: u64,
        control: &mut dyn HousekeepingControl,
        progress: &mut dyn ProgressSink,
    ) -> StoreResult<HousekeepingOutcome> {
        let mut outcome = HousekeepingOutcome::default();

        // Take the lock politely; a busy account is skipped, not contended.
        let lock_path = write_lock_path(self.backend, self.disc_set, self.account)?;
        let mut lock = NamedLock::new();
        let mut attempts = self.config.lock_attempts.max(1);
        loop {
            match lock.try_acquire(&lock_path) {
                Ok(()) => break,
                Err(e) if e.is_contention() => {
                    attempts -= 1;
                    if attempts == 0 {
                        debug!(account = %self.account, "account busy, skipping housekeeping");
                        outcome.skipped_locked = true;
                        return Ok(outcome);
                    }
                    std::thread::sleep(self.config.lock_retry);
                }
                Err(e) => return Err(e),
            }
        }

        let set = self.backend.disc_set(self.disc_set)?;
        let mut account_info =
            AccountInfo::load(set, &self.account_rel, self.account, false)?;

        progress.phase("scan");
        let mut totals = ScanTotals::default();
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut refs: HashMap<ObjectId, u32> = HashMap::new();
        let mut empty_deleted_dirs: Vec<(ObjectId, ObjectId)> = Vec::new();

        // Depth-first walk. Directory emptiness is judged when the child is
        // visited, so deletion flags seen in the parent are carried down.
        let mut stack: Vec<(ObjectId, bool)> = vec![(ObjectId::ROOT, false)];
        let mut parent_of: HashMap<ObjectId, ObjectId> = HashMap::new();
        let mut scan_clean = true;
        refs.insert(ObjectId::ROOT, 1);

        while let Some((dir_id, flagged_deleted)) = stack.pop() {
            let dir = match self.load_directory(dir_id) {
                Ok(d) => d,
                Err(e) => {
                    warn!(account = %self.account, directory = %dir_id, error = %e,
                        "skipping unreadable directory; account needs a consistency check");
                    scan_clean = false;
                    continue;
                }
            };
            outcome.directories_scanned += 1;
            totals.num_dirs += 1;
            totals.blocks_used += dir.size_in_blocks() as i64;
            totals.blocks_dirs += dir.size_in_blocks() as i64;

            if flagged_deleted && dir.entry_count() == 0 && dir_id != ObjectId::ROOT {
                let parent = parent_of.get(&dir_id).copied().unwrap_or(dir.container_id());
                empty_deleted_dirs.push((parent, dir_id));
            }

            for entry in dir.entries() {
                outcome.entries_scanned += 1;
                progress.object_scanned(entry.object_id);
                *refs.entry(entry.object_id).or_insert(0) += 1;

                if entry.is_dir() {
                    parent_of.insert(entry.object_id, dir_id);
                    stack.push((entry.object_id, entry.is_deleted()));
                    continue;
                }

                let size = entry.size_in_blocks;
                totals.blocks_used += size as i64;
                if entry.is_old() {
                    totals.blocks_old += size as i64;
                    totals.num_old += 1;
                }
                if entry.is_deleted() {
                    totals.blocks_deleted += size as i64;
                    totals.num_deleted += 1;
                }
                if entry.is_live() {
                    totals.blocks_current += size as i64;
                    totals.num_files += 1;
                }

                if entry.is_old() || entry.is_deleted() {
                    let age = now_secs.saturating_sub(entry.modification_time);
                    if age < self.config.minimum_age_secs {
                        continue;
                    }
                    let weight = if entry.is_deleted() {
                        self.config.deleted_weight
                    } else {
                        self.config.old_version_weight
                    };
                    candidates.push(Candidate {
                        score: age.saturating_mul(size).saturating_mul(weight),
                        age_secs: age,
                        id: entry.object_id,
                        parent: dir_id,
                        size_in_blocks: size,
                    });
                }
            }

            if control.should_stop(self.account) {
                // The scan is incomplete, so the tallies are not the truth
                // about the account; release the lock without rewriting
                // anything.
                outcome.stopped_early = true;
                lock.release()?;
                return Ok(outcome);
            }
        }

        // Empty deleted directories go regardless of quota pressure.
        progress.phase("empty directories");
        for (parent_id, dir_id) in empty_deleted_dirs {
            match self.delete_empty_directory(parent_id, dir_id, &mut totals, &mut refs) {
                Ok(()) => {
                    outcome.directories_deleted += 1;
                    progress.object_deleted(dir_id);
                }
                Err(e) => {
                    warn!(account = %self.account, directory = %dir_id, error = %e,
                        "failed to remove empty deleted directory");
                }
            }
            if control.should_stop(self.account) {
                outcome.stopped_early = true;
                self.flush(&mut account_info, &totals, &refs, &mut lock)?;
                return Ok(outcome);
            }
        }

        // Reclaim file versions while the account is over its soft limit.
        // Highest score first; ties go to the older entry, then the smaller
        // id, so runs are deterministic.
        progress.phase("reclaim");
        candidates.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then(b.age_secs.cmp(&a.age_secs))
                .then(a.id.cmp(&b.id))
        });

        let soft = account_info.blocks_soft_limit() as i64;
        for candidate in candidates {
            if totals.blocks_used <= soft {
                break;
            }
            if control.should_stop(self.account) {
                outcome.stopped_early = true;
                break;
            }
            match self.delete_candidate(&candidate, &mut totals, &mut refs, &mut outcome) {
                Ok(()) => {
                    outcome.files_deleted += 1;
                    outcome.blocks_freed += candidate.size_in_blocks;
                    progress.object_deleted(candidate.id);
                }
                Err(e) => {
                    warn!(account = %self.account, object = %candidate.id, error = %e,
                        "failed to reclaim candidate");
                }
            }
        }

        // Objects nothing references any more are deleted outright; the
        // reference tally was rebuilt by this very scan, so zero is safe.
        // With an unreadable directory in the tree the tally is not to be
        // trusted and the orphan pass is skipped.
        if !outcome.stopped_early && scan_clean {
            progress.phase("orphans");
            let last = account_info.last_object_id().as_u64();
            for raw_id in 1..=last {
                let id = ObjectId(raw_id);
                if refs.get(&id).copied().unwrap_or(0) > 0 {
                    continue;
                }
                let rel = self.object_rel(id);
                if striped::object_exists(self.set()?, &rel)?.is_some() {
                    let blocks = striped::object_usage_blocks(self.set()?, &rel).unwrap_or(0);
                    match striped::delete_object(self.set()?, &rel) {
                        Ok(()) => {
                            outcome.orphans_deleted += 1;
                            outcome.blocks_freed += blocks;
                            progress.object_deleted(id);
                            debug!(account = %self.account, object = %id,
                                "deleted unreferenced object");
                        }
                        Err(e) => {
                            warn!(account = %self.account, object = %id, error = %e,
                                "failed to delete unreferenced object");
                        }
                    }
                }
                if control.should_stop(self.account) {
                    outcome.stopped_early = true;
                    break;
                }
            }
        }

        if scan_clean {
            self.flush(&mut account_info, &totals, &refs, &mut lock)?;
        } else {
            // Counters derived from a partial tree would be lies; leave the
            // record alone and let the checker rebuild everything.
            lock.release()?;
        }
        info!(account = %self.account,
            files_deleted = outcome.files_deleted,
            directories_deleted = outcome.directories_deleted,
            blocks_freed = outcome.blocks_freed,
            stopped_early = outcome.stopped_early,
            "housekeeping finished");
        Ok(outcome)
    }

    /// Persists corrected counters and the rebuilt refcount database, then
    /// releases the lock.
    fn flush(
        &self,
        account_info: &mut AccountInfo,
        totals: &ScanTotals,
        refs: &HashMap<ObjectId, u32>,
        lock: &mut NamedLock,
    ) -> StoreResult<()> {
        let set = self.set()?;

        account_info.set_usage_counters(
            totals.blocks_used,
            totals.blocks_current,
            totals.blocks_old,
            totals.blocks_deleted,
            totals.blocks_dirs,
            totals.num_files,
            totals.num_old,
            totals.num_deleted,
            totals.num_dirs,
        );
        account_info.save(set, &self.account_rel)?;

        let mut refcount = RefCountDatabase::create_for_regeneration(
            set,
            &self.account_rel,
            self.account,
            account_info.last_object_id(),
        )?;
        for (id, count) in refs {
            if *count > 0 {
                refcount.set_refcount(*id, *count);
            }
        }
        refcount.commit()?;

        lock.release()
    }

    fn delete_empty_directory(
        &self,
        parent_id: ObjectId,
        dir_id: ObjectId,
        totals: &mut ScanTotals,
        refs: &mut HashMap<ObjectId, u32>,
    ) -> StoreResult<()> {
        let mut parent = self.load_directory(parent_id)?;
        let dir_size = striped::object_usage_blocks(self.set()?, &self.object_rel(dir_id))?;

        parent.delete_entry(dir_id)?;
        let parent_before = parent.size_in_blocks();
        let parent_after = self.save_directory(&parent)?;
        striped::delete_object(self.set()?, &self.object_rel(dir_id))?;

        refs.insert(dir_id, 0);
        totals.num_dirs -= 1;
        totals.blocks_used -= dir_size as i64;
        totals.blocks_dirs -= dir_size as i64;
        totals.blocks_used += parent_after as i64 - parent_before as i64;
        totals.blocks_dirs += parent_after as i64 - parent_before as i64;
        Ok(())
    }

    /// Fully reassembles a file object, following its patch chain upwards.
    fn materialize_file(&self, dir: &Directory, id: ObjectId) -> StoreResult<Vec<u8>> {
        let set = self.set()?;
        let mut reader = StripedReader::open(set, &self.object_rel(id))?;
        let bytes = reader.read_remaining()?;
        let verified = verify_encoded_file_format(&mut Cursor::new(&bytes))?;
        if !verified.has_references {
            return Ok(bytes);
        }
        let entry = dir
            .find_entry_by_id(id)
            .ok_or(StoreError::EntryNotFound {
                entry: id,
                directory: dir.object_id(),
            })?;
        if entry.depends_newer.is_none() {
            return Err(StoreError::object_corrupt(
                id,
                "patch file has no depends-newer link",
            ));
        }
        let companion = self.materialize_file(dir, entry.depends_newer)?;
        let mut out = Vec::new();
        combine_file(
            &mut Cursor::new(&bytes),
            &mut Cursor::new(&companion),
            &mut out,
        )?;
        Ok(out)
    }

    /// Deletes one reclaim candidate, baking any dependent patch first.
    fn delete_candidate(
        &self,
        candidate: &Candidate,
        totals: &mut ScanTotals,
        refs: &mut HashMap<ObjectId, u32>,
        outcome: &mut HousekeepingOutcome,
    ) -> StoreResult<()> {
        let set = self.set()?;
        let mut dir = self.load_directory(candidate.parent)?;

        let entry = match dir.find_entry_by_id(candidate.id) {
            Some(e) => e.clone(),
            None => return Ok(()), // already gone
        };

        // An older version holding a patch against this file must become
        // self-contained before its companion disappears.
        if !entry.depends_older.is_none() {
            let dependent = entry.depends_older;
            let materialized = self.materialize_file(&dir, candidate.id)?;
            let dep_rel = self.object_rel(dependent);
            let mut dep_reader = StripedReader::open(set, &dep_rel)?;
            let dep_bytes = dep_reader.read_remaining()?;

            let mut baked = Vec::new();
            combine_file(
                &mut Cursor::new(&dep_bytes),
                &mut Cursor::new(&materialized),
                &mut baked,
            )?;

            let mut writer = StripedWriter::open(set, &dep_rel, true)?;
            writer.write_all(&baked)?;
            let new_blocks = writer.usage_in_blocks()?;
            writer.commit(true)?;
            outcome.files_baked += 1;

            let dep_entry = dir
                .find_entry_by_id_mut(dependent)
                .ok_or(StoreError::EntryNotFound {
                    entry: dependent,
                    directory: candidate.parent,
                })?;
            let old_blocks = dep_entry.size_in_blocks;
            dep_entry.size_in_blocks = new_blocks;
            dep_entry.depends_newer = ObjectId::NONE;
            let delta = new_blocks as i64 - old_blocks as i64;
            totals.blocks_used += delta;
            self.apply_category_delta(dep_entry.flags, delta, totals);
            debug!(account = %self.account, baked = %dependent, companion = %candidate.id,
                "baked dependent patch into standalone file");
        }

        // The newer side loses its back link.
        if !entry.depends_newer.is_none() {
            if let Some(newer) = dir.find_entry_by_id_mut(entry.depends_newer) {
                newer.depends_older = ObjectId::NONE;
            }
        }

        striped::delete_object(set, &self.object_rel(candidate.id))?;
        dir.delete_entry(candidate.id)?;
        let dir_before = dir.size_in_blocks();
        let dir_after = self.save_directory(&dir)?;

        refs.insert(candidate.id, 0);
        let size = entry.size_in_blocks as i64;
        totals.blocks_used -= size;
        self.apply_category_delta(entry.flags, -size, totals);
        if entry.is_old() {
            totals.num_old -= 1;
        }
        if entry.is_deleted() {
            totals.num_deleted -= 1;
        }
        totals.blocks_used += dir_after as i64 - dir_before as i64;
        totals.blocks_dirs += dir_after as i64 - dir_before as i64;
        Ok(())
    }

    fn apply_category_delta(&self, flags: EntryFlags, delta: i64, totals: &mut ScanTotals) {
        if flags.contains(EntryFlags::OLD_VERSION) {
            totals.blocks_old += delta;
        }
        if flags.contains(EntryFlags::DELETED) {
            totals.blocks_deleted += delta;
        }
        if !flags.intersects(EntryFlags::OLD_VERSION | EntryFlags::DELETED) {
            totals.blocks_current += delta;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{AccountDatabase, AccountManager};
    use crate::backend::single_disc_backend;
    use crate::context::{NullCoordinator, StoreContext};
    use crate::file_format::{decode_file_payload, encode_diff, encode_file};
    use crate::name::ObjectName;
    use crate::progress::CountingProgressSink;
    use std::sync::Arc;
    use tempfile::TempDir;

    const ACCT: AccountId = AccountId(0xA);

    struct StopAfter(u32);
    impl HousekeepingControl for StopAfter {
        fn should_stop(&mut self, _account: AccountId) -> bool {
            if self.0 == 0 {
                true
            } else {
                self.0 -= 1;
                false
            }
        }
    }

    fn name(s: &str) -> ObjectName {
        ObjectName::from_bytes(s.as_bytes().to_vec())
    }

    fn setup(soft: u64, hard: u64) -> (TempDir, Arc<StoreBackend>) {
        let dir = TempDir::new().unwrap();
        let store_root = dir.path().join("store");
        std::fs::create_dir_all(&store_root).unwrap();
        let backend = Arc::new(single_disc_backend(&store_root, 4096));
        let db = AccountDatabase::load(&dir.path().join("accounts.txt")).unwrap();
        let mut mgr = AccountManager::new(&backend, db);
        mgr.create_account(ACCT, 0, soft, hard).unwrap();
        (dir, backend)
    }

    fn open_ctx(backend: &Arc<StoreBackend>) -> StoreContext {
        let mut ctx = StoreContext::new(backend.clone(), Arc::new(NullCoordinator), ACCT, 0);
        ctx.open(true).unwrap();
        ctx
    }

    fn add_file(ctx: &mut StoreContext, n: &str, payload: &[u8], mtime: u64) -> ObjectId {
        let mut stream = Vec::new();
        encode_file(payload, ObjectId::ROOT, mtime, 0, b"", &mut stream).unwrap();
        ctx.add_file(
            ObjectId::ROOT,
            &name(n),
            mtime,
            0,
            ObjectId::NONE,
            true,
            &mut Cursor::new(stream),
        )
        .unwrap()
    }

    fn run_housekeeping(backend: &Arc<StoreBackend>) -> HousekeepingOutcome {
        let mut run = HousekeepingRun::new(backend, ACCT, 0, HousekeepingConfig::default());
        let mut sink = CountingProgressSink::default();
        run.run_at(1_000_000, &mut NeverStop, &mut sink).unwrap()
    }

    #[test]
    fn test_noop_when_under_soft_limit() {
        let (_dir, backend) = setup(1000, 2000);
        let mut ctx = open_ctx(&backend);
        add_file(&mut ctx, "doc", &[1u8; 100], 100);
        ctx.finish().unwrap();

        let outcome = run_housekeeping(&backend);
        assert_eq!(outcome.files_deleted, 0);
        assert!(!outcome.skipped_locked);
        assert!(outcome.entries_scanned >= 1);
    }

    #[test]
    fn test_skips_locked_account() {
        let (_dir, backend) = setup(10, 20);
        let mut ctx = open_ctx(&backend);

        let mut run = HousekeepingRun::new(
            &backend,
            ACCT,
            0,
            HousekeepingConfig {
                lock_attempts: 1,
                ..HousekeepingConfig::default()
            },
        );
        let outcome = run
            .run_at(1_000_000, &mut NeverStop, &mut CountingProgressSink::default())
            .unwrap();
        assert!(outcome.skipped_locked);
        ctx.finish().unwrap();
    }

    #[test]
    fn test_reclaims_deleted_file_when_over_soft_limit() {
        let (_dir, backend) = setup(2, 100);
        let mut ctx = open_ctx(&backend);
        let id = add_file(&mut ctx, "doc", &vec![7u8; 3 * 4096], 100);
        ctx.delete_file(ObjectId::ROOT, &name("doc")).unwrap();
        ctx.finish().unwrap();

        let outcome = run_housekeeping(&backend);
        assert_eq!(outcome.files_deleted, 1);
        assert!(outcome.blocks_freed >= 1);

        let mut ctx = open_ctx(&backend);
        let root = ctx.get_directory(ObjectId::ROOT).unwrap();
        assert!(root.find_entry_by_id(id).is_none());
        assert!(!ctx
            .object_exists(id, crate::context::ObjectKind::Any)
            .unwrap());
        let info = ctx.account_info().unwrap();
        assert_eq!(info.num_deleted_files(), 0);
        assert_eq!(info.blocks_in_deleted_files(), 0);
        ctx.finish().unwrap();

        // Refcount reflects the deletion.
        let set = backend.disc_set(0).unwrap();
        let db = RefCountDatabase::load(set, &account_root_rel(ACCT), ACCT, true).unwrap();
        assert_eq!(db.refcount(id), 0);
    }

    #[test]
    fn test_bakes_patch_chain_before_deleting_companion() {
        // Soft limit chosen so the run stops after reclaiming the one
        // deleted (new) version, leaving the baked old version in place.
        let (_dir, backend) = setup(6, 1000);
        let mut ctx = open_ctx(&backend);

        let old_payload: Vec<u8> = (0..4 * 4096u32).map(|i| (i % 241) as u8).collect();
        let old_id = add_file(&mut ctx, "doc", &old_payload, 100);
        let old_envelope = {
            let mut r = ctx.open_object(old_id).unwrap();
            r.read_remaining().unwrap()
        };

        let mut new_payload = old_payload.clone();
        new_payload[10] ^= 0x55;
        let mut patch = Vec::new();
        encode_diff(
            &new_payload,
            &mut Cursor::new(&old_envelope),
            ObjectId::ROOT,
            200,
            0,
            b"",
            &mut patch,
        )
        .unwrap();
        let new_id = ctx
            .add_file(
                ObjectId::ROOT,
                &name("doc"),
                200,
                0,
                old_id,
                true,
                &mut Cursor::new(patch),
            )
            .unwrap();

        // Delete the *new* version so housekeeping wants to reclaim it while
        // the old version still depends on it.
        ctx.delete_file(ObjectId::ROOT, &name("doc")).unwrap();
        ctx.finish().unwrap();

        let outcome = run_housekeeping(&backend);
        assert!(outcome.files_deleted >= 1);
        assert_eq!(outcome.files_baked, 1);

        let mut ctx = open_ctx(&backend);
        let root = ctx.get_directory(ObjectId::ROOT).unwrap();
        assert!(root.find_entry_by_id(new_id).is_none());
        let old_entry = root.find_entry_by_id(old_id).unwrap();
        assert!(old_entry.depends_newer.is_none());
        assert!(old_entry.depends_older.is_none());

        // The baked old version is standalone and decodes to its payload.
        let mut reader = ctx.open_object(old_id).unwrap();
        assert_eq!(decode_file_payload(&mut reader).unwrap(), old_payload);
        ctx.finish().unwrap();
    }

    #[test]
    fn test_removes_empty_deleted_directory() {
        let (_dir, backend) = setup(1000, 2000);
        let mut ctx = open_ctx(&backend);
        let sub = ctx
            .add_directory(ObjectId::ROOT, &name("empty"), b"", 0)
            .unwrap()
            .id;
        ctx.delete_directory(sub, false).unwrap();
        ctx.finish().unwrap();

        let outcome = run_housekeeping(&backend);
        assert_eq!(outcome.directories_deleted, 1);

        let mut ctx = open_ctx(&backend);
        let root = ctx.get_directory(ObjectId::ROOT).unwrap();
        assert!(root.find_entry_by_id(sub).is_none());
        assert_eq!(ctx.account_info().unwrap().num_directories(), 1);
        ctx.finish().unwrap();
    }

    #[test]
    fn test_retention_keeps_young_entries() {
        let (_dir, backend) = setup(1, 1000);
        let mut ctx = open_ctx(&backend);
        add_file(&mut ctx, "doc", &vec![9u8; 2 * 4096], 999_000);
        ctx.delete_file(ObjectId::ROOT, &name("doc")).unwrap();
        ctx.finish().unwrap();

        let mut run = HousekeepingRun::new(
            &backend,
            ACCT,
            0,
            HousekeepingConfig {
                minimum_age_secs: 10_000,
                ..HousekeepingConfig::default()
            },
        );
        // Entry is 1000 seconds old at run time, younger than retention.
        let outcome = run
            .run_at(1_000_000, &mut NeverStop, &mut CountingProgressSink::default())
            .unwrap();
        assert_eq!(outcome.files_deleted, 0);
    }

    #[test]
    fn test_control_stop_flushes_and_releases() {
        let (_dir, backend) = setup(1, 1000);
        let mut ctx = open_ctx(&backend);
        for i in 0..3 {
            add_file(&mut ctx, &format!("f{i}"), &vec![i as u8; 4096], 100);
            ctx.delete_file(ObjectId::ROOT, &name(&format!("f{i}"))).unwrap();
        }
        ctx.finish().unwrap();

        let mut run = HousekeepingRun::new(&backend, ACCT, 0, HousekeepingConfig::default());
        let outcome = run
            .run_at(
                1_000_000,
                &mut StopAfter(1),
                &mut CountingProgressSink::default(),
            )
            .unwrap();
        assert!(outcome.stopped_early);

        // The lock must be free again.
        let mut lock = NamedLock::new();
        let lock_path = write_lock_path(&backend, 0, ACCT).unwrap();
        lock.try_acquire(&lock_path).unwrap();
    }

    #[test]
    fn test_counters_corrected_after_drift() {
        let (_dir, backend) = setup(1000, 2000);
        let mut ctx = open_ctx(&backend);
        add_file(&mut ctx, "doc", &[5u8; 100], 100);
        ctx.finish().unwrap();

        // Sabotage the counters, then let housekeeping heal them.
        let set = backend.disc_set(0).unwrap();
        let rel = account_root_rel(ACCT);
        let mut info = AccountInfo::load(set, &rel, ACCT, false).unwrap();
        let true_used = info.blocks_used();
        info.change_blocks_used(500);
        info.adjust_num_files(7);
        info.save(set, &rel).unwrap();

        run_housekeeping(&backend);

        let healed = AccountInfo::load(set, &rel, ACCT, true).unwrap();
        assert_eq!(healed.blocks_used(), true_used);
        assert_eq!(healed.num_files(), 1);
    }

    #[test]
    fn test_orphan_object_reclaimed() {
        let (_dir, backend) = setup(1000, 2000);
        let mut ctx = open_ctx(&backend);
        let id = add_file(&mut ctx, "doc", &[5u8; 100], 100);
        ctx.finish().unwrap();

        // Simulate a crashed add_file: an object exists on disc with no
        // directory entry.
        let set = backend.disc_set(0).unwrap();
        let orphan_rel = format!("{}/o7f", account_root_rel(ACCT));
        let mut w = StripedWriter::open(set, &orphan_rel, false).unwrap();
        let mut env = Vec::new();
        encode_file(&[1u8; 50], ObjectId::ROOT, 0, 0, b"", &mut env).unwrap();
        w.write_all(&env).unwrap();
        w.commit(true).unwrap();

        // Push the recorded high-water mark past the orphan.
        let rel = account_root_rel(ACCT);
        let mut info = AccountInfo::load(set, &rel, ACCT, false).unwrap();
        info.raise_last_object_id(ObjectId(0x7f));
        info.save(set, &rel).unwrap();

        let outcome = run_housekeeping(&backend);
        assert_eq!(outcome.orphans_deleted, 1);
        assert!(striped::object_exists(set, &orphan_rel).unwrap().is_none());

        // The referenced file survived.
        let mut ctx = open_ctx(&backend);
        assert!(ctx
            .object_exists(id, crate::context::ObjectKind::File)
            .unwrap());
        ctx.finish().unwrap();
    }
}
