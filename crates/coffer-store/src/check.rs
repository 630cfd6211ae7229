//! Account consistency check and repair.
//!
//! The checker works from the discs upward, trusting nothing in the info
//! record. Phase 1 walks the radix id space and classifies every object by
//! its magic word, building an in-memory index. Phase 2 reconciles every
//! directory against that index, dropping entries that point at missing or
//! mismatched objects and marking what is legitimately contained. Orphans
//! left over are re-homed under a `lost+found` directory in the account
//! root, wrong container ids are rewritten, and finally the info record and
//! refcount database are rebuilt from what was actually found.
//!
//! Every phase is idempotent: running the check twice on an undamaged
//! account reports zero errors the second time and changes nothing.
//!
//! The caller must hold the account's write lock.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};

use tracing::{info, warn};

use crate::accounts::account_root_rel;
use crate::backend::{DiscSet, StoreBackend};
use crate::directory::{Directory, DirectoryEntry, EntryFlags, DIRECTORY_MAGIC};
use crate::error::{StoreError, StoreResult};
use crate::file_format::{verify_encoded_file_format, FILE_MAGIC_V0, FILE_MAGIC_V1};
use crate::info::AccountInfo;
use crate::name::ObjectName;
use crate::naming::{self, INFO_FILENAME, REFCOUNT_FILENAME, WRITE_LOCK_FILENAME};
use crate::progress::ProgressSink;
use crate::refcount::RefCountDatabase;
use crate::striped::{self, DirListKind, StripedReader, StripedWriter};
use crate::types::{AccountId, ObjectId};

/// Options for a check run.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckConfig {
    /// Repair what can be repaired; without this the check only reports.
    pub fix_errors: bool,
    /// Suppress per-error log output.
    pub quiet: bool,
}

/// What a check run found and did.
#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    /// Inconsistencies found (and fixed, when fixing was enabled).
    pub errors_found: u64,
    /// Objects examined in phase 1.
    pub objects_scanned: u64,
    /// Orphans attached under `lost+found`.
    pub orphans_rehomed: u64,
    /// The `lost+found` directory, when one was used.
    pub lost_and_found_id: Option<ObjectId>,
}

#[derive(Debug, Clone)]
struct ObjInfo {
    is_file: bool,
    container: ObjectId,
    size_in_blocks: u64,
    contained: bool,
}

#[derive(Debug, Default)]
struct Totals {
    blocks_current: i64,
    blocks_old: i64,
    blocks_deleted: i64,
    num_files: u64,
    num_old: u64,
    num_deleted: u64,
}

/// One consistency check over one (locked) account.
pub struct StoreCheck<'a> {
    backend: &'a StoreBackend,
    account: AccountId,
    disc_set: usize,
    account_rel: String,
    config: CheckConfig,

    index: BTreeMap<ObjectId, ObjInfo>,
    dirs_with_wrong_container: Vec<(ObjectId, ObjectId)>,
    totals: Totals,
    lost_serial: u32,
}

impl<'a> StoreCheck<'a> {
    /// Creates a check for the given account.
    pub fn new(
        backend: &'a StoreBackend,
        account: AccountId,
        disc_set: usize,
        config: CheckConfig,
    ) -> Self {
        Self {
            backend,
            account,
            disc_set,
            account_rel: account_root_rel(account),
            config,
            index: BTreeMap::new(),
            dirs_with_wrong_container: Vec::new(),
            totals: Totals::default(),
            lost_serial: 0,
        }
    }

    fn set(&self) -> StoreResult<&DiscSet> {
        self.backend.disc_set(self.disc_set)
    }

    fn object_rel(&self, id: ObjectId) -> String {
        format!("{}/{}", self.account_rel, naming::object_filename(id))
    }

    fn note_error(&self, report: &mut CheckReport, progress: &mut dyn ProgressSink, what: &str) {
        report.errors_found += 1;
        progress.error_found(what);
        if !self.config.quiet {
            warn!(account = %self.account, fix = self.config.fix_errors, "{what}");
        }
    }

    /// Runs the check. The account's write lock must already be held.
    pub fn run(&mut self, progress: &mut dyn ProgressSink) -> StoreResult<CheckReport> {
        let mut report = CheckReport::default();

        let mut account_info = AccountInfo::load(
            self.set()?,
            &self.account_rel,
            self.account,
            !self.config.fix_errors,
        )?;

        progress.phase("check objects");
        self.check_objects(&mut report, progress)?;

        progress.phase("check directories");
        self.check_directories(&mut report, progress)?;

        progress.phase("check root");
        self.check_root(&mut report, progress)?;

        progress.phase("re-home orphans");
        self.rehome_orphans(&mut account_info, &mut report, progress)?;

        progress.phase("fix container ids");
        self.fix_container_ids(&mut report, progress)?;

        progress.phase("rewrite info");
        if self.config.fix_errors {
            self.write_new_info(&mut account_info)?;
        }

        info!(account = %self.account, errors = report.errors_found,
            fixed = self.config.fix_errors, scanned = report.objects_scanned,
            "consistency check finished");
        Ok(report)
    }

    // ---- phase 1: classify every object on disc --------------------------

    fn check_objects(
        &mut self,
        report: &mut CheckReport,
        progress: &mut dyn ProgressSink,
    ) -> StoreResult<()> {
        self.scan_level(String::new(), 0, 0, report, progress)
    }

    /// Recursively scans one radix directory level. `start_id` carries the
    /// id bits contributed by the directory names above this level.
    fn scan_level(
        &mut self,
        suffix: String,
        start_id: u64,
        depth: u32,
        report: &mut CheckReport,
        progress: &mut dyn ProgressSink,
    ) -> StoreResult<()> {
        let full_rel = if suffix.is_empty() {
            self.account_rel.clone()
        } else {
            format!("{}/{suffix}", self.account_rel)
        };
        let set = self.set()?;

        let mut present: Vec<(u64, String)> = Vec::new();
        for name in striped::read_directory(set, &full_rel, DirListKind::FilesOnly)? {
            if depth == 0
                && (name == INFO_FILENAME
                    || name == REFCOUNT_FILENAME
                    || name == WRITE_LOCK_FILENAME)
            {
                continue;
            }
            match naming::parse_object_leaf(&name) {
                Some(leaf) => present.push((start_id | leaf, name)),
                None => {
                    self.note_error(
                        report,
                        progress,
                        &format!("spurious file {full_rel}/{name}"),
                    );
                    if self.config.fix_errors {
                        remove_raw_name(self.set()?, &full_rel, &name)?;
                    }
                }
            }
        }

        present.sort();
        for (raw_id, leaf_name) in present {
            let id = ObjectId(raw_id);
            report.objects_scanned += 1;
            progress.object_scanned(id);
            if !self.check_and_add_object(id)? {
                self.note_error(
                    report,
                    progress,
                    &format!("corrupt or unreadable object {id}"),
                );
                if self.config.fix_errors {
                    match striped::delete_object(self.set()?, &self.object_rel(id)) {
                        Ok(()) | Err(StoreError::NotFound(_)) => {}
                        Err(e) => {
                            warn!(object = %id, error = %e, "failed to delete bad object");
                        }
                    }
                    // Whatever representation is left goes too.
                    let _ = remove_raw_name(self.set()?, &full_rel, &leaf_name);
                }
            }
        }

        let sub_dirs = striped::read_directory(self.set()?, &full_rel, DirListKind::DirsOnly)?;
        for name in sub_dirs {
            match naming::parse_segment_dir(&name) {
                Some(n) => {
                    let child_suffix = if suffix.is_empty() {
                        name.clone()
                    } else {
                        format!("{suffix}/{name}")
                    };
                    let child_start = start_id | (n << (naming::SEGMENT_BITS * (depth + 1)));
                    self.scan_level(child_suffix, child_start, depth + 1, report, progress)?;
                }
                None => {
                    self.note_error(
                        report,
                        progress,
                        &format!("spurious directory {full_rel}/{name}"),
                    );
                    if self.config.fix_errors {
                        for disc in &self.set()?.dirs {
                            let path = disc.join(&full_rel).join(&name);
                            if path.is_dir() {
                                std::fs::remove_dir_all(&path)?;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Classifies one object, adding it to the index. False means the file
    /// is unreadable or lies about itself and should be deleted.
    fn check_and_add_object(&mut self, id: ObjectId) -> StoreResult<bool> {
        let set = self.set()?;
        let mut reader = match StripedReader::open(set, &self.object_rel(id)) {
            Ok(r) => r,
            Err(StoreError::NotFound(_) | StoreError::Corrupt(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let size = reader.usage_in_blocks();

        let mut magic_bytes = [0u8; 4];
        if reader.read_exact(&mut magic_bytes).is_err() {
            return Ok(false);
        }
        let magic = u32::from_be_bytes(magic_bytes);
        let bytes = {
            let mut rest = Vec::with_capacity(reader.len() as usize);
            rest.extend_from_slice(&magic_bytes);
            if reader.read_to_end(&mut rest).is_err() {
                return Ok(false);
            }
            rest
        };

        let (is_file, container) = match magic {
            DIRECTORY_MAGIC => {
                let dir = match Directory::read_from(&mut Cursor::new(&bytes)) {
                    Ok(d) => d,
                    Err(_) => return Ok(false),
                };
                if dir.object_id() != id {
                    return Ok(false);
                }
                (false, dir.container_id())
            }
            FILE_MAGIC_V1 | FILE_MAGIC_V0 => {
                // A file posing as the account root would be load-bearing
                // nonsense; classify it as bad.
                if id == ObjectId::ROOT {
                    return Ok(false);
                }
                match verify_encoded_file_format(&mut Cursor::new(&bytes)) {
                    Ok(v) => (true, v.container_id),
                    Err(_) => return Ok(false),
                }
            }
            _ => return Ok(false),
        };

        self.index.insert(
            id,
            ObjInfo {
                is_file,
                container,
                size_in_blocks: size,
                contained: false,
            },
        );
        Ok(true)
    }

    // ---- phase 2: reconcile directories against the index ----------------

    fn check_directories(
        &mut self,
        report: &mut CheckReport,
        progress: &mut dyn ProgressSink,
    ) -> StoreResult<()> {
        let dir_ids: Vec<ObjectId> = self
            .index
            .iter()
            .filter(|(_, i)| !i.is_file)
            .map(|(id, _)| *id)
            .collect();

        for dir_id in dir_ids {
            let mut dir = self.load_directory(dir_id)?;
            let mut modified = dir.check_and_fix();
            if modified {
                self.note_error(
                    report,
                    progress,
                    &format!("directory {dir_id} has bad structure"),
                );
            }

            let mut to_delete: Vec<ObjectId> = Vec::new();
            let mut entry_fixes: Vec<(ObjectId, u64)> = Vec::new();
            for entry in dir.entries() {
                let target = entry.object_id;
                let bad = match self.index.get_mut(&target) {
                    None => true,
                    Some(obj) if obj.is_file == entry.is_dir() => {
                        // Kind mismatch.
                        true
                    }
                    Some(obj) if obj.contained => {
                        // Second reference to the same object.
                        true
                    }
                    Some(obj) => {
                        obj.contained = true;
                        if obj.container != dir_id {
                            if obj.is_file {
                                // Files move between directories; quietly
                                // adopt the observed parent.
                                obj.container = dir_id;
                            } else {
                                self.dirs_with_wrong_container.push((target, dir_id));
                                obj.container = dir_id;
                            }
                        }
                        if obj.is_file && entry.size_in_blocks != obj.size_in_blocks {
                            entry_fixes.push((target, obj.size_in_blocks));
                        }
                        false
                    }
                };
                if bad {
                    to_delete.push(target);
                }
            }

            for (target, dir_id_for_log) in self
                .dirs_with_wrong_container
                .iter()
                .filter(|(_, parent)| *parent == dir_id)
                .map(|(t, p)| (*t, *p))
                .collect::<Vec<_>>()
            {
                self.note_error(
                    report,
                    progress,
                    &format!("directory {target} has wrong container id (in {dir_id_for_log})"),
                );
            }

            for (target, correct_size) in &entry_fixes {
                self.note_error(
                    report,
                    progress,
                    &format!("entry {target} in directory {dir_id} has wrong size"),
                );
                if let Some(e) = dir.find_entry_by_id_mut(*target) {
                    e.size_in_blocks = *correct_size;
                }
                modified = true;
            }

            if !to_delete.is_empty() {
                for target in &to_delete {
                    self.note_error(
                        report,
                        progress,
                        &format!("directory {dir_id} references bad object {target}"),
                    );
                    dir.delete_entry(*target)?;
                }
                dir.check_and_fix();
                modified = true;
            }

            // Tally what survived.
            for entry in dir.entries() {
                if entry.is_file() {
                    let size = entry.size_in_blocks as i64;
                    if entry.is_old() {
                        self.totals.blocks_old += size;
                        self.totals.num_old += 1;
                    }
                    if entry.is_deleted() {
                        self.totals.blocks_deleted += size;
                        self.totals.num_deleted += 1;
                    }
                    if entry.is_live() {
                        self.totals.blocks_current += size;
                        self.totals.num_files += 1;
                    }
                }
            }

            if modified && self.config.fix_errors {
                self.save_directory(&dir)?;
                let new_blocks = striped::object_usage_blocks(self.set()?, &self.object_rel(dir_id))?;
                if let Some(obj) = self.index.get_mut(&dir_id) {
                    obj.size_in_blocks = new_blocks;
                }
            }
        }
        Ok(())
    }

    // ---- phase 3: the root must exist ------------------------------------

    fn check_root(
        &mut self,
        report: &mut CheckReport,
        progress: &mut dyn ProgressSink,
    ) -> StoreResult<()> {
        let ok = matches!(self.index.get(&ObjectId::ROOT), Some(obj) if !obj.is_file);
        if ok {
            if let Some(obj) = self.index.get_mut(&ObjectId::ROOT) {
                obj.contained = true; // the root contains itself
            }
            return Ok(());
        }

        self.note_error(report, progress, "account root directory is missing");
        if !self.config.fix_errors {
            return Ok(());
        }

        let root = Directory::new(ObjectId::ROOT, ObjectId::ROOT);
        let blocks = self.write_directory_object(&root, true)?;
        self.index.insert(
            ObjectId::ROOT,
            ObjInfo {
                is_file: false,
                container: ObjectId::ROOT,
                size_in_blocks: blocks,
                contained: true,
            },
        );
        Ok(())
    }

    // ---- phase 4: orphans into lost+found --------------------------------

    fn rehome_orphans(
        &mut self,
        account_info: &mut AccountInfo,
        report: &mut CheckReport,
        progress: &mut dyn ProgressSink,
    ) -> StoreResult<()> {
        let orphans: Vec<(ObjectId, bool, u64)> = self
            .index
            .iter()
            .filter(|(id, obj)| !obj.contained && **id != ObjectId::ROOT)
            .map(|(id, obj)| (*id, obj.is_file, obj.size_in_blocks))
            .collect();
        if orphans.is_empty() {
            return Ok(());
        }

        for (id, _, _) in &orphans {
            self.note_error(report, progress, &format!("object {id} is unattached"));
        }
        if !self.config.fix_errors {
            return Ok(());
        }

        let lost_found = self.ensure_lost_and_found(account_info)?;
        report.lost_and_found_id = Some(lost_found);

        // Directories first so a later pass could re-link files into them;
        // then files under synthetic names.
        let mut lf_dir = self.load_directory(lost_found)?;
        for (id, is_file, size) in orphans.iter().filter(|(_, f, _)| !f).chain(
            orphans.iter().filter(|(_, f, _)| *f),
        ) {
            self.lost_serial += 1;
            let name = ObjectName::synthetic_lost_found(self.lost_serial);
            let flags = if *is_file {
                EntryFlags::FILE
            } else {
                EntryFlags::DIR
            };
            lf_dir.add_entry(DirectoryEntry::new(name, 0, *id, *size, flags, 0));

            if !*is_file {
                // Repoint the orphan directory at its new home.
                let mut orphan_dir = self.load_directory(*id)?;
                orphan_dir.set_container_id(lost_found);
                self.save_directory(&orphan_dir)?;
                let new_blocks = striped::object_usage_blocks(self.set()?, &self.object_rel(*id))?;
                if let Some(obj) = self.index.get_mut(id) {
                    obj.size_in_blocks = new_blocks;
                }
            }

            if let Some(obj) = self.index.get_mut(id) {
                obj.contained = true;
                obj.container = lost_found;
            }
            if *is_file {
                self.totals.blocks_current += *size as i64;
                self.totals.num_files += 1;
            }
            report.orphans_rehomed += 1;
        }
        self.save_directory(&lf_dir)?;
        let new_blocks = striped::object_usage_blocks(self.set()?, &self.object_rel(lost_found))?;
        if let Some(obj) = self.index.get_mut(&lost_found) {
            obj.size_in_blocks = new_blocks;
        }
        Ok(())
    }

    /// Finds or creates the `lost+found` directory under the root.
    fn ensure_lost_and_found(&mut self, account_info: &mut AccountInfo) -> StoreResult<ObjectId> {
        let lf_name = ObjectName::from_bytes(b"lost+found".to_vec());

        let mut root = self.load_directory(ObjectId::ROOT)?;
        if let Some(existing) = root
            .entries()
            .find(|e| e.name == lf_name && e.is_dir())
            .map(|e| e.object_id)
        {
            if self.index.contains_key(&existing) {
                return Ok(existing);
            }
        }

        // Allocate above everything seen on disc and everything the info
        // record has promised.
        let max_seen = self.index.keys().next_back().copied().unwrap_or(ObjectId::ROOT);
        account_info.raise_last_object_id(max_seen);
        let id = account_info.allocate_object_id();

        let lf = Directory::new(id, ObjectId::ROOT);
        let blocks = self.write_directory_object(&lf, false)?;

        root.add_entry(DirectoryEntry::new(
            lf_name,
            0,
            id,
            blocks,
            EntryFlags::DIR,
            0,
        ));
        self.save_directory(&root)?;
        let new_blocks =
            striped::object_usage_blocks(self.set()?, &self.object_rel(ObjectId::ROOT))?;
        if let Some(obj) = self.index.get_mut(&ObjectId::ROOT) {
            obj.size_in_blocks = new_blocks;
        }

        self.index.insert(
            id,
            ObjInfo {
                is_file: false,
                container: ObjectId::ROOT,
                size_in_blocks: blocks,
                contained: true,
            },
        );
        Ok(id)
    }

    // ---- phase 5: wrong container ids ------------------------------------

    fn fix_container_ids(
        &mut self,
        _report: &mut CheckReport,
        _progress: &mut dyn ProgressSink,
    ) -> StoreResult<()> {
        if !self.config.fix_errors {
            return Ok(());
        }
        let fixes = std::mem::take(&mut self.dirs_with_wrong_container);
        for (dir_id, correct_parent) in fixes {
            let mut dir = self.load_directory(dir_id)?;
            if dir.container_id() != correct_parent {
                dir.set_container_id(correct_parent);
                self.save_directory(&dir)?;
                let new_blocks = striped::object_usage_blocks(self.set()?, &self.object_rel(dir_id))?;
                if let Some(obj) = self.index.get_mut(&dir_id) {
                    obj.size_in_blocks = new_blocks;
                }
            }
        }
        Ok(())
    }

    // ---- phase 6: rebuild info and refcounts -----------------------------

    fn write_new_info(&mut self, account_info: &mut AccountInfo) -> StoreResult<()> {
        let mut blocks_used: i64 = 0;
        let mut blocks_dirs: i64 = 0;
        let mut num_dirs: u64 = 0;
        let mut max_id = ObjectId::ROOT;
        for (id, obj) in &self.index {
            blocks_used += obj.size_in_blocks as i64;
            if !obj.is_file {
                blocks_dirs += obj.size_in_blocks as i64;
                num_dirs += 1;
            }
            if *id > max_id {
                max_id = *id;
            }
        }

        account_info.raise_last_object_id(max_id);
        account_info.set_usage_counters(
            blocks_used,
            self.totals.blocks_current,
            self.totals.blocks_old,
            self.totals.blocks_deleted,
            blocks_dirs,
            self.totals.num_files,
            self.totals.num_old,
            self.totals.num_deleted,
            num_dirs,
        );
        let set = self.set()?;
        account_info.save(set, &self.account_rel)?;

        let mut refcount = RefCountDatabase::create_for_regeneration(
            set,
            &self.account_rel,
            self.account,
            account_info.last_object_id(),
        )?;
        for (id, obj) in &self.index {
            if obj.contained {
                refcount.set_refcount(*id, 1);
            }
        }
        refcount.commit()?;
        Ok(())
    }

    // ---- helpers ---------------------------------------------------------

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
        self.write_directory_object(dir, true)
    }

    fn write_directory_object(&self, dir: &Directory, overwrite: bool) -> StoreResult<u64> {
        let set = self.set()?;
        let rel = self.object_rel(dir.object_id());
        let seg_dir = naming::object_directory(dir.object_id());
        let parent_rel = if seg_dir.is_empty() {
            self.account_rel.clone()
        } else {
            format!("{}/{seg_dir}", self.account_rel)
        };
        set.ensure_directory(&parent_rel)?;

        let mut writer = StripedWriter::open(set, &rel, overwrite)?;
        let mut buf = Vec::new();
        dir.write_to(&mut buf)?;
        writer.write_all(&buf)?;
        let blocks = writer.usage_in_blocks()?;
        writer.commit(true)?;
        Ok(blocks)
    }
}

/// Removes a raw (non-object) filename from a store directory on every disc.
fn remove_raw_name(set: &DiscSet, rel_dir: &str, name: &str) -> StoreResult<()> {
    for disc in &set.dirs {
        let path = disc.join(rel_dir).join(name);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::Io(e)),
        }
    }
    Ok(())
}
