//! Directory objects.
//!
//! A directory is an ordered list of entries plus its own attribute blob and
//! a pointer at its containing directory. The serialized form is a wire
//! contract: all integers network order, and two directories with the same
//! semantic content round-trip byte-identically.
//!
//! ```text
//! [u32 magic 'dir1'][u64 object_id][u64 container_id][u32 options]
//!   options bit 0 -> [u64 attr_mod_time][u32 len][attributes]
//! [u32 n_entries][entries ...]
//!
//! entry: [u32 len][name][u64 mtime][u64 object_id][u64 size_blocks]
//!        [u16 flags][u64 attr_hash][u32 len][attributes]
//!        [u64 depends_older][u64 depends_newer]
//! ```

use std::io::{Read, Write};

use tracing::warn;

use crate::error::{StoreError, StoreResult};
use crate::name::ObjectName;
use crate::types::{ObjectId, RevisionId};
use crate::wire;

/// Magic word of serialized directory objects (`dir1`).
pub const DIRECTORY_MAGIC: u32 = 0x6469_7231;

const OPT_HAS_ATTRIBUTES: u32 = 1 << 0;
const MAX_ATTRIBUTES_LEN: u32 = 1024 * 1024;
const MAX_ENTRIES: u32 = 4 * 1024 * 1024;

/// Entry flag bits.
///
/// Kind bits are exclusive (exactly one of `FILE`/`DIR` on a valid entry);
/// lifecycle bits are independent; `CONTAINED` is transient checker state
/// and never meaningful on disc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryFlags(pub u16);

impl EntryFlags {
    /// Entry references a file object.
    pub const FILE: EntryFlags = EntryFlags(0x0001);
    /// Entry references a directory object.
    pub const DIR: EntryFlags = EntryFlags(0x0002);
    /// Entry has been superseded by a newer version of the same name.
    pub const OLD_VERSION: EntryFlags = EntryFlags(0x0004);
    /// Entry has been deleted and awaits housekeeping.
    pub const DELETED: EntryFlags = EntryFlags(0x0008);
    /// Transient: seen attached to exactly one parent during a check run.
    pub const CONTAINED: EntryFlags = EntryFlags(0x4000);
    /// Empty mask: include everything / exclude nothing.
    pub const NONE: EntryFlags = EntryFlags(0);

    const KNOWN: u16 = 0x0001 | 0x0002 | 0x0004 | 0x0008 | 0x4000;

    /// True when every bit of `other` is set in `self`.
    pub fn contains(self, other: EntryFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when `self` and `other` share any bit.
    pub fn intersects(self, other: EntryFlags) -> bool {
        self.0 & other.0 != 0
    }

    /// Sets the given bits.
    pub fn insert(&mut self, other: EntryFlags) {
        self.0 |= other.0;
    }

    /// Clears the given bits.
    pub fn remove(&mut self, other: EntryFlags) {
        self.0 &= !other.0;
    }

    /// Bits outside the known set.
    pub fn unknown_bits(self) -> u16 {
        self.0 & !Self::KNOWN
    }

    /// Flag-mask filter used by directory iteration: all `include` bits must
    /// be present and no `exclude` bit may be.
    pub fn matches(self, include: EntryFlags, exclude: EntryFlags) -> bool {
        self.contains(include) && !self.intersects(exclude)
    }
}

impl std::ops::BitOr for EntryFlags {
    type Output = EntryFlags;
    fn bitor(self, rhs: EntryFlags) -> EntryFlags {
        EntryFlags(self.0 | rhs.0)
    }
}

/// One named reference from a directory to an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Opaque encrypted name.
    pub name: ObjectName,
    /// Modification time reported by the client, 64-bit.
    pub modification_time: u64,
    /// The referenced object.
    pub object_id: ObjectId,
    /// Striped storage cost of the referenced object.
    pub size_in_blocks: u64,
    /// Kind and lifecycle flags.
    pub flags: EntryFlags,
    /// Hash of the client-side attributes, for cheap change detection.
    pub attributes_hash: u64,
    /// Optional attribute blob (opaque, encrypted).
    pub attributes: Vec<u8>,
    /// Patch chain link: the older version this object's patch depends on.
    pub depends_older: ObjectId,
    /// Patch chain link: the newer version depending on this object.
    pub depends_newer: ObjectId,
}

impl DirectoryEntry {
    /// Creates an entry with empty attributes and no dependency links.
    pub fn new(
        name: ObjectName,
        modification_time: u64,
        object_id: ObjectId,
        size_in_blocks: u64,
        flags: EntryFlags,
        attributes_hash: u64,
    ) -> Self {
        Self {
            name,
            modification_time,
            object_id,
            size_in_blocks,
            flags,
            attributes_hash,
            attributes: Vec::new(),
            depends_older: ObjectId::NONE,
            depends_newer: ObjectId::NONE,
        }
    }

    /// Entry references a file object.
    pub fn is_file(&self) -> bool {
        self.flags.contains(EntryFlags::FILE)
    }

    /// Entry references a directory object.
    pub fn is_dir(&self) -> bool {
        self.flags.contains(EntryFlags::DIR)
    }

    /// Entry carries the `Deleted` lifecycle flag.
    pub fn is_deleted(&self) -> bool {
        self.flags.contains(EntryFlags::DELETED)
    }

    /// Entry carries the `OldVersion` lifecycle flag.
    pub fn is_old(&self) -> bool {
        self.flags.contains(EntryFlags::OLD_VERSION)
    }

    /// Neither old nor deleted.
    pub fn is_live(&self) -> bool {
        !self.is_deleted() && !self.is_old()
    }

    /// Replaces the attribute blob and its hash.
    pub fn set_attributes(&mut self, attributes: Vec<u8>, attributes_hash: u64) {
        self.attributes = attributes;
        self.attributes_hash = attributes_hash;
    }

    fn write_to(&self, w: &mut impl Write) -> std::io::Result<()> {
        self.name.write_to(w)?;
        wire::write_u64(w, self.modification_time)?;
        wire::write_u64(w, self.object_id.as_u64())?;
        wire::write_u64(w, self.size_in_blocks)?;
        wire::write_u16(w, self.flags.0)?;
        wire::write_u64(w, self.attributes_hash)?;
        wire::write_blob(w, &self.attributes)?;
        wire::write_u64(w, self.depends_older.as_u64())?;
        wire::write_u64(w, self.depends_newer.as_u64())?;
        Ok(())
    }

    fn read_from(r: &mut impl Read) -> std::io::Result<Self> {
        let name = ObjectName::read_from(r)?;
        let modification_time = wire::read_u64(r)?;
        let object_id = ObjectId(wire::read_u64(r)?);
        let size_in_blocks = wire::read_u64(r)?;
        let flags = EntryFlags(wire::read_u16(r)?);
        let attributes_hash = wire::read_u64(r)?;
        let attributes = wire::read_blob(r, MAX_ATTRIBUTES_LEN)?;
        let depends_older = ObjectId(wire::read_u64(r)?);
        let depends_newer = ObjectId(wire::read_u64(r)?);
        Ok(Self {
            name,
            modification_time,
            object_id,
            size_in_blocks,
            flags,
            attributes_hash,
            attributes,
            depends_older,
            depends_newer,
        })
    }
}

/// A directory object: header, attributes and entry list.
#[derive(Debug, Clone)]
pub struct Directory {
    object_id: ObjectId,
    container_id: ObjectId,
    attributes: Vec<u8>,
    attributes_mod_time: u64,
    entries: Vec<DirectoryEntry>,

    // Runtime bookkeeping, never serialized.
    revision: RevisionId,
    size_in_blocks: u64,
}

impl Directory {
    /// Creates an empty directory object.
    pub fn new(object_id: ObjectId, container_id: ObjectId) -> Self {
        Self {
            object_id,
            container_id,
            attributes: Vec::new(),
            attributes_mod_time: 0,
            entries: Vec::new(),
            revision: RevisionId::default(),
            size_in_blocks: 0,
        }
    }

    /// This directory's object id.
    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    /// Id of the directory containing this one (root contains itself).
    pub fn container_id(&self) -> ObjectId {
        self.container_id
    }

    /// Repoints the container id; used by move and by the checker.
    pub fn set_container_id(&mut self, container: ObjectId) {
        self.container_id = container;
    }

    /// The directory's own attribute blob.
    pub fn attributes(&self) -> &[u8] {
        &self.attributes
    }

    /// Modification time of the attribute blob.
    pub fn attributes_mod_time(&self) -> u64 {
        self.attributes_mod_time
    }

    /// Replaces the directory's attribute blob.
    pub fn set_attributes(&mut self, attributes: Vec<u8>, mod_time: u64) {
        self.attributes = attributes;
        self.attributes_mod_time = mod_time;
    }

    /// Revision of the on-disc file this copy was loaded from.
    pub fn revision(&self) -> RevisionId {
        self.revision
    }

    /// Stamps the revision after load or save.
    pub fn set_revision(&mut self, revision: RevisionId) {
        self.revision = revision;
    }

    /// Storage cost of this directory object itself, in blocks.
    pub fn size_in_blocks(&self) -> u64 {
        self.size_in_blocks
    }

    /// Records the storage cost after load or save.
    pub fn set_size_in_blocks(&mut self, blocks: u64) {
        self.size_in_blocks = blocks;
    }

    /// Number of entries, all flags included.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Appends an entry; the caller guarantees name uniqueness among live
    /// entries.
    pub fn add_entry(&mut self, entry: DirectoryEntry) -> &mut DirectoryEntry {
        self.entries.push(entry);
        self.entries.last_mut().expect("just pushed")
    }

    /// Finds any entry referencing `id`.
    pub fn find_entry_by_id(&self, id: ObjectId) -> Option<&DirectoryEntry> {
        self.entries.iter().find(|e| e.object_id == id)
    }

    /// Mutable lookup by referenced id.
    pub fn find_entry_by_id_mut(&mut self, id: ObjectId) -> Option<&mut DirectoryEntry> {
        self.entries.iter_mut().find(|e| e.object_id == id)
    }

    /// Removes the entry referencing `id`.
    pub fn delete_entry(&mut self, id: ObjectId) -> StoreResult<()> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.object_id == id)
            .ok_or(StoreError::EntryNotFound {
                entry: id,
                directory: self.object_id,
            })?;
        self.entries.remove(idx);
        Ok(())
    }

    /// Iterates entries whose flags satisfy the include/exclude masks.
    pub fn entries_matching(
        &self,
        include: EntryFlags,
        exclude: EntryFlags,
    ) -> impl Iterator<Item = &DirectoryEntry> {
        self.entries
            .iter()
            .filter(move |e| e.flags.matches(include, exclude))
    }

    /// Mutable flag-filtered iteration.
    pub fn entries_matching_mut(
        &mut self,
        include: EntryFlags,
        exclude: EntryFlags,
    ) -> impl Iterator<Item = &mut DirectoryEntry> {
        self.entries
            .iter_mut()
            .filter(move |e| e.flags.matches(include, exclude))
    }

    /// All entries in order.
    pub fn entries(&self) -> impl Iterator<Item = &DirectoryEntry> {
        self.entries.iter()
    }

    /// All entries, mutable.
    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut DirectoryEntry> {
        self.entries.iter_mut()
    }

    /// Serializes the directory. Stable: equal content yields equal bytes.
    pub fn write_to(&self, w: &mut impl Write) -> std::io::Result<()> {
        wire::write_u32(w, DIRECTORY_MAGIC)?;
        wire::write_u64(w, self.object_id.as_u64())?;
        wire::write_u64(w, self.container_id.as_u64())?;

        let options = if self.attributes.is_empty() && self.attributes_mod_time == 0 {
            0
        } else {
            OPT_HAS_ATTRIBUTES
        };
        wire::write_u32(w, options)?;
        if options & OPT_HAS_ATTRIBUTES != 0 {
            wire::write_u64(w, self.attributes_mod_time)?;
            wire::write_blob(w, &self.attributes)?;
        }

        wire::write_u32(w, self.entries.len() as u32)?;
        for entry in &self.entries {
            entry.write_to(w)?;
        }
        Ok(())
    }

    /// Parses a serialized directory, checking the magic word.
    pub fn read_from(r: &mut impl Read) -> StoreResult<Self> {
        let magic = wire::read_u32(r)?;
        if magic != DIRECTORY_MAGIC {
            return Err(StoreError::Corrupt(format!(
                "bad directory magic {magic:#010x}"
            )));
        }
        let object_id = ObjectId(wire::read_u64(r)?);
        let container_id = ObjectId(wire::read_u64(r)?);
        let options = wire::read_u32(r)?;

        let (attributes_mod_time, attributes) = if options & OPT_HAS_ATTRIBUTES != 0 {
            let t = wire::read_u64(r)?;
            let a = wire::read_blob(r, MAX_ATTRIBUTES_LEN)?;
            (t, a)
        } else {
            (0, Vec::new())
        };

        let n = wire::read_u32(r)?;
        if n > MAX_ENTRIES {
            return Err(StoreError::Corrupt(format!(
                "directory {object_id} claims {n} entries"
            )));
        }
        let mut entries = Vec::with_capacity(n as usize);
        for _ in 0..n {
            entries.push(DirectoryEntry::read_from(r)?);
        }

        Ok(Self {
            object_id,
            container_id,
            attributes,
            attributes_mod_time,
            entries,
            revision: RevisionId::default(),
            size_in_blocks: 0,
        })
    }

    /// Drops structurally invalid entries and clears transient flags.
    ///
    /// Returns true when anything was changed. Invalid means: unknown flag
    /// bits, kind bits not exactly one of file/dir, or an empty name.
    pub fn check_and_fix(&mut self) -> bool {
        let mut modified = false;

        let before = self.entries.len();
        self.entries.retain(|e| {
            if e.flags.unknown_bits() != 0 {
                warn!(directory = %self.object_id, entry = %e.object_id,
                    flags = e.flags.0, "dropping entry with unknown flag bits");
                return false;
            }
            let kind_ok = e.is_file() != e.is_dir();
            if !kind_ok {
                warn!(directory = %self.object_id, entry = %e.object_id,
                    "dropping entry with inconsistent kind flags");
                return false;
            }
            if e.name.is_empty() {
                warn!(directory = %self.object_id, entry = %e.object_id,
                    "dropping entry with empty name");
                return false;
            }
            true
        });
        modified |= self.entries.len() != before;

        for e in &mut self.entries {
            if e.flags.intersects(EntryFlags::CONTAINED) {
                e.flags.remove(EntryFlags::CONTAINED);
                modified = true;
            }
        }

        modified
    }
}
