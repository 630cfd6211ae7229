//! Striped object file layer.
//!
//! A logical object is addressed by a store-relative path. Before commit it
//! is a single temporary file (`<path>.cw`) on one disc of the set; a
//! committed object is either a single file (`<path>.cf`) or, once
//! converted, `N` data stripes (`<path>.cs<k>`) plus one parity stripe
//! (`<path>.csp`) spread over the set's discs. Data is block-interleaved at
//! the set's block size; the parity stripe is the XOR of each interleave
//! group and ends with a big-endian `u64` total-length trailer.
//!
//! Reads reassemble the stream and can survive the loss of any single
//! stripe. Writes leave no partial visible state: the temp file is removed
//! on failure and conversion renames stripes only after all of them have
//! been written.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use tracing::{debug, warn};

use crate::backend::DiscSet;
use crate::error::{StoreError, StoreResult};
use crate::types::RevisionId;

const TEMP_SUFFIX: &str = ".cw";
const SINGLE_SUFFIX: &str = ".cf";
const STRIPE_PREFIX: &str = ".cs";
const PARITY_SUFFIX: &str = ".csp";
const PARITY_TRAILER_LEN: u64 = 8;

/// Filter for [`read_directory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirListKind {
    /// Subdirectories only.
    DirsOnly,
    /// Object files only (logical names, stripe forms merged).
    FilesOnly,
}

fn single_path(set: &DiscSet, rel: &str) -> PathBuf {
    set.path_on_disc(set.disc_for(rel, 0), &format!("{rel}{SINGLE_SUFFIX}"))
}

fn temp_path(set: &DiscSet, rel: &str) -> PathBuf {
    set.path_on_disc(set.disc_for(rel, 0), &format!("{rel}{TEMP_SUFFIX}"))
}

fn stripe_path(set: &DiscSet, rel: &str, k: usize) -> PathBuf {
    set.path_on_disc(set.disc_for(rel, k), &format!("{rel}{STRIPE_PREFIX}{k}"))
}

fn parity_path(set: &DiscSet, rel: &str) -> PathBuf {
    set.path_on_disc(
        set.disc_for(rel, set.data_stripes()),
        &format!("{rel}{PARITY_SUFFIX}"),
    )
}

/// Searches every disc for `rel` with `suffix`; the hashed placement is the
/// common case but a repaired or migrated set may hold files elsewhere.
fn find_anywhere(set: &DiscSet, rel: &str, suffix: &str) -> Option<PathBuf> {
    let name = format!("{rel}{suffix}");
    set.dirs
        .iter()
        .map(|d| d.join(&name))
        .find(|p| p.is_file())
}

fn mtime_usecs(meta: &std::fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Length of interleave block `i` in a stream of `total_len` bytes.
fn block_len(i: u64, total_len: u64, block_size: u64) -> u64 {
    let start = i * block_size;
    if start >= total_len {
        0
    } else {
        (total_len - start).min(block_size)
    }
}

/// Per-stripe byte lengths plus parity length (without trailer) for a
/// converted stream of `len` bytes.
fn striped_layout(len: u64, block_size: u64, n_data: u64) -> (Vec<u64>, u64) {
    let blocks = len.div_ceil(block_size);
    let mut stripe_lens = vec![0u64; n_data as usize];
    for i in 0..blocks {
        stripe_lens[(i % n_data) as usize] += block_len(i, len, block_size);
    }
    let mut parity_len = 0u64;
    let mut j = 0u64;
    while j * n_data < blocks {
        parity_len += block_len(j * n_data, len, block_size);
        j += 1;
    }
    (stripe_lens, parity_len)
}

/// Storage cost in blocks of a stream of `len` bytes committed to `set`.
pub fn predicted_usage_blocks(set: &DiscSet, len: u64) -> u64 {
    if !set.striping_enabled() {
        return set.bytes_to_blocks(len);
    }
    let (stripe_lens, parity_len) = striped_layout(len, set.block_size, set.data_stripes() as u64);
    let mut blocks = set.bytes_to_blocks(parity_len + PARITY_TRAILER_LEN);
    for l in stripe_lens {
        blocks += set.bytes_to_blocks(l);
    }
    blocks
}

/// Write handle for one object.
///
/// The temp file is deleted on drop unless [`StripedWriter::commit`] was
/// called.
#[derive(Debug)]
pub struct StripedWriter<'a> {
    set: &'a DiscSet,
    rel: String,
    temp: PathBuf,
    file: Option<File>,
    committed: bool,
}

impl<'a> StripedWriter<'a> {
    /// Opens a writer for the object at `rel`.
    ///
    /// Refuses to open when the object already exists unless
    /// `allow_overwrite` is set; the existing form stays visible until
    /// commit.
    pub fn open(set: &'a DiscSet, rel: &str, allow_overwrite: bool) -> StoreResult<Self> {
        if !allow_overwrite && object_exists(set, rel)?.is_some() {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("object {rel} already exists"),
            )));
        }

        let temp = temp_path(set, rel);
        if let Some(parent) = temp.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp)?;

        Ok(Self {
            set,
            rel: rel.to_string(),
            temp,
            file: Some(file),
            committed: false,
        })
    }

    /// Bytes written so far.
    pub fn len(&mut self) -> StoreResult<u64> {
        let file = self.file.as_mut().expect("writer already finished");
        Ok(file.metadata()?.len())
    }

    /// True when nothing has been written yet.
    pub fn is_empty(&mut self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Storage cost in blocks the object will occupy once committed.
    pub fn usage_in_blocks(&mut self) -> StoreResult<u64> {
        let len = self.len()?;
        Ok(predicted_usage_blocks(self.set, len))
    }

    /// Commits the object, making it visible under its final name.
    ///
    /// With `convert_to_striped` (and a striping-capable set) the stream is
    /// split into data + parity stripes; otherwise it is renamed in place as
    /// a single file. Leftover files of the other representation are removed
    /// so an overwrite never leaves a mixed form behind.
    pub fn commit(mut self, convert_to_striped: bool) -> StoreResult<()> {
        let mut file = self.file.take().expect("writer already finished");
        file.flush()?;
        let len = file.metadata()?.len();

        if convert_to_striped && self.set.striping_enabled() {
            self.convert(&mut file, len)?;
            std::fs::remove_file(&self.temp)?;
            remove_if_present(&single_path(self.set, &self.rel))?;
        } else {
            drop(file);
            let target = single_path(self.set, &self.rel);
            std::fs::rename(&self.temp, &target)?;
            for k in 0..self.set.data_stripes() {
                remove_if_present(&stripe_path(self.set, &self.rel, k))?;
            }
            remove_if_present(&parity_path(self.set, &self.rel))?;
        }

        debug!(object = %self.rel, striped = convert_to_striped, "committed object");
        self.committed = true;
        Ok(())
    }

    fn convert(&self, file: &mut File, len: u64) -> StoreResult<()> {
        let bs = self.set.block_size;
        let n = self.set.data_stripes();

        // Write each stripe to its own temp name, then rename the whole
        // group. A crash mid-rename leaves a readable mixture: the reader
        // tolerates one missing stripe and the checker removes strays.
        let mut stripe_temps = Vec::with_capacity(n + 1);
        let mut stripe_files = Vec::with_capacity(n);
        for k in 0..n {
            let target = stripe_path(self.set, &self.rel, k);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = target.with_extension(format!("cs{k}t"));
            stripe_files.push(File::create(&tmp)?);
            stripe_temps.push((tmp, target));
        }
        let parity_target = parity_path(self.set, &self.rel);
        if let Some(parent) = parity_target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let parity_tmp = parity_target.with_extension("cspt");
        let mut parity_file = File::create(&parity_tmp)?;

        file.seek(SeekFrom::Start(0))?;
        let blocks = len.div_ceil(bs);
        let mut parity_block = vec![0u8; bs as usize];
        let mut group_max = 0usize;
        let mut buf = vec![0u8; bs as usize];
        for i in 0..blocks {
            let bl = block_len(i, len, bs) as usize;
            file.read_exact(&mut buf[..bl])?;
            stripe_files[(i % n as u64) as usize].write_all(&buf[..bl])?;

            let k = (i % n as u64) as usize;
            if k == 0 {
                parity_block.iter_mut().for_each(|b| *b = 0);
                group_max = 0;
            }
            for (p, b) in parity_block.iter_mut().zip(&buf[..bl]) {
                *p ^= *b;
            }
            group_max = group_max.max(bl);
            if k == n - 1 || i == blocks - 1 {
                parity_file.write_all(&parity_block[..group_max])?;
            }
        }
        parity_file.write_all(&len.to_be_bytes())?;

        for f in &mut stripe_files {
            f.flush()?;
        }
        parity_file.flush()?;
        drop(stripe_files);
        drop(parity_file);

        std::fs::rename(&parity_tmp, &parity_target)?;
        for (tmp, target) in stripe_temps {
            std::fs::rename(&tmp, &target)?;
        }
        Ok(())
    }

    /// Abandons the write and removes the temp file.
    pub fn discard(mut self) -> StoreResult<()> {
        self.file.take();
        std::fs::remove_file(&self.temp)?;
        self.committed = true;
        Ok(())
    }
}

impl Write for StripedWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file
            .as_mut()
            .expect("writer already finished")
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.as_mut().expect("writer already finished").flush()
    }
}

impl Drop for StripedWriter<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.file.take();
            if let Err(e) = std::fs::remove_file(&self.temp) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(temp = %self.temp.display(), error = %e,
                        "failed to remove abandoned temp file");
                }
            }
        }
    }
}

enum ReaderRepr {
    Single {
        file: File,
    },
    Striped {
        stripes: Vec<Option<File>>,
        parity: Option<File>,
        block_size: u64,
    },
}

/// Read handle over a committed object, reassembling stripes as needed.
pub struct StripedReader {
    repr: ReaderRepr,
    len: u64,
    pos: u64,
    revision: RevisionId,
    usage_blocks: u64,
}

impl StripedReader {
    /// Opens the object at `rel` for reading.
    ///
    /// Fails with `NotFound` when no representation exists, and `Corrupt`
    /// when more than one stripe of a converted object is missing.
    pub fn open(set: &DiscSet, rel: &str) -> StoreResult<Self> {
        if let Some(path) = find_anywhere(set, rel, SINGLE_SUFFIX) {
            let file = File::open(&path)?;
            let meta = file.metadata()?;
            let len = meta.len();
            return Ok(Self {
                repr: ReaderRepr::Single { file },
                len,
                pos: 0,
                revision: RevisionId(mtime_usecs(&meta).wrapping_add(len)),
                usage_blocks: set.bytes_to_blocks(len),
            });
        }

        let n = set.data_stripes();
        let mut stripes: Vec<Option<File>> = Vec::with_capacity(n);
        let mut stripe_lens: Vec<Option<u64>> = Vec::with_capacity(n);
        let mut missing = 0usize;
        let mut newest_mtime = 0u64;
        let mut usage_bytes_rounded = 0u64;
        for k in 0..n {
            match find_anywhere(set, rel, &format!("{STRIPE_PREFIX}{k}")) {
                Some(p) => {
                    let f = File::open(&p)?;
                    let meta = f.metadata()?;
                    newest_mtime = newest_mtime.max(mtime_usecs(&meta));
                    usage_bytes_rounded += set.bytes_to_blocks(meta.len());
                    stripe_lens.push(Some(meta.len()));
                    stripes.push(Some(f));
                }
                None => {
                    missing += 1;
                    stripe_lens.push(None);
                    stripes.push(None);
                }
            }
        }
        let parity = match find_anywhere(set, rel, PARITY_SUFFIX) {
            Some(p) => {
                let f = File::open(&p)?;
                let meta = f.metadata()?;
                newest_mtime = newest_mtime.max(mtime_usecs(&meta));
                usage_bytes_rounded += set.bytes_to_blocks(meta.len());
                Some(f)
            }
            None => None,
        };

        if stripes.iter().all(|s| s.is_none()) && parity.is_none() {
            return Err(StoreError::NotFound(format!("object {rel}")));
        }
        if missing > 1 || (missing == 1 && parity.is_none()) {
            return Err(StoreError::Corrupt(format!(
                "object {rel}: {missing} data stripes missing"
            )));
        }

        // Total length: sum of data stripes when complete, else the parity
        // trailer.
        let len = if missing == 0 {
            stripe_lens.iter().map(|l| l.unwrap()).sum()
        } else {
            let parity_file = parity.as_ref().unwrap();
            let plen = parity_file.metadata()?.len();
            if plen < PARITY_TRAILER_LEN {
                return Err(StoreError::Corrupt(format!(
                    "object {rel}: parity stripe truncated"
                )));
            }
            let mut trailer = [0u8; 8];
            parity_file.read_exact_at(&mut trailer, plen - PARITY_TRAILER_LEN)?;
            u64::from_be_bytes(trailer)
        };

        // A reconstructed-form read must account what is actually on disc.
        Ok(Self {
            repr: ReaderRepr::Striped {
                stripes,
                parity,
                block_size: set.block_size,
            },
            len,
            pos: 0,
            revision: RevisionId(newest_mtime.wrapping_add(len)),
            usage_blocks: usage_bytes_rounded,
        })
    }

    /// Total logical length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True for zero-length objects.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Revision stamp of the on-disc object.
    pub fn revision(&self) -> RevisionId {
        self.revision
    }

    /// Storage cost of the object in blocks.
    pub fn usage_in_blocks(&self) -> u64 {
        self.usage_blocks
    }

    /// Reads the remainder of the stream into a buffer.
    pub fn read_remaining(&mut self) -> StoreResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.len.saturating_sub(self.pos) as usize);
        self.read_to_end(&mut out)?;
        Ok(out)
    }

    fn read_at_pos(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        if pos >= self.len || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min((self.len - pos) as usize);

        match &self.repr {
            ReaderRepr::Single { file } => file.read_at(&mut buf[..want], pos),
            ReaderRepr::Striped {
                stripes,
                parity,
                block_size,
            } => {
                let bs = *block_size;
                let n = stripes.len() as u64;
                let block = pos / bs;
                let k = (block % n) as usize;
                let j = block / n;
                let off = pos % bs;
                let bl = block_len(block, self.len, bs);
                let take = want.min((bl - off) as usize);

                match &stripes[k] {
                    Some(f) => f.read_at(&mut buf[..take], j * bs + off),
                    None => {
                        let rebuilt = rebuild_block(
                            stripes,
                            parity.as_ref().expect("recovery requires parity"),
                            j,
                            k,
                            bs,
                            self.len,
                        )?;
                        let src = &rebuilt[off as usize..off as usize + take];
                        buf[..take].copy_from_slice(src);
                        Ok(take)
                    }
                }
            }
        }
    }
}

/// Reconstructs missing data block `j * n + missing_k` from parity.
fn rebuild_block(
    stripes: &[Option<File>],
    parity: &File,
    j: u64,
    missing_k: usize,
    bs: u64,
    total_len: u64,
) -> io::Result<Vec<u8>> {
    let n = stripes.len() as u64;
    let group_first = j * n;
    let group_len = block_len(group_first, total_len, bs) as usize;

    let mut acc = vec![0u8; group_len];
    parity.read_exact_at(&mut acc, j * bs)?;

    let mut tmp = vec![0u8; group_len];
    for (k, stripe) in stripes.iter().enumerate() {
        if k == missing_k {
            continue;
        }
        let bl = block_len(group_first + k as u64, total_len, bs) as usize;
        if bl == 0 {
            continue;
        }
        let f = stripe.as_ref().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                "two data stripes missing, cannot rebuild",
            )
        })?;
        f.read_exact_at(&mut tmp[..bl], j * bs)?;
        for (a, b) in acc.iter_mut().zip(&tmp[..bl]) {
            *a ^= *b;
        }
    }

    let want = block_len(group_first + missing_k as u64, total_len, bs) as usize;
    acc.truncate(want);
    Ok(acc)
}

impl Read for StripedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at_pos(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for StripedReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(d) => self.len as i64 + d,
            SeekFrom::Current(d) => self.pos as i64 + d,
        };
        if new < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start",
            ));
        }
        self.pos = new as u64;
        Ok(self.pos)
    }
}

/// Tests whether the object exists, returning its revision when it does.
pub fn object_exists(set: &DiscSet, rel: &str) -> StoreResult<Option<RevisionId>> {
    match StripedReader::open(set, rel) {
        Ok(r) => Ok(Some(r.revision())),
        Err(StoreError::NotFound(_)) => Ok(None),
        // A half-present object exists for the purposes of overwrite checks.
        Err(StoreError::Corrupt(_)) => Ok(Some(RevisionId(0))),
        Err(e) => Err(e),
    }
}

/// Storage cost in blocks of a committed object.
pub fn object_usage_blocks(set: &DiscSet, rel: &str) -> StoreResult<u64> {
    Ok(StripedReader::open(set, rel)?.usage_in_blocks())
}

/// Deletes every representation of the object.
pub fn delete_object(set: &DiscSet, rel: &str) -> StoreResult<()> {
    let mut removed = false;
    for suffix in [SINGLE_SUFFIX, PARITY_SUFFIX, TEMP_SUFFIX] {
        let name = format!("{rel}{suffix}");
        for disc in &set.dirs {
            removed |= remove_if_present(&disc.join(&name))?;
        }
    }
    for k in 0..set.data_stripes() {
        let name = format!("{rel}{STRIPE_PREFIX}{k}");
        for disc in &set.dirs {
            removed |= remove_if_present(&disc.join(&name))?;
        }
    }
    if !removed {
        return Err(StoreError::NotFound(format!("object {rel}")));
    }
    debug!(object = %rel, "deleted object");
    Ok(())
}

fn remove_if_present(path: &std::path::Path) -> StoreResult<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StoreError::Io(e)),
    }
}

/// Maps an on-disc filename back to its logical object name.
///
/// `o1a.cs0` and `o1a.cf` both map to `o1a`; names that are not a known
/// representation are returned unchanged so callers can flag them.
fn logical_name(file_name: &str) -> String {
    if let Some(stem) = file_name.strip_suffix(SINGLE_SUFFIX) {
        return stem.to_string();
    }
    if let Some(stem) = file_name.strip_suffix(PARITY_SUFFIX) {
        return stem.to_string();
    }
    if let Some(idx) = file_name.rfind(STRIPE_PREFIX) {
        let (stem, suffix) = file_name.split_at(idx);
        if suffix[STRIPE_PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_digit())
            && suffix.len() > STRIPE_PREFIX.len()
        {
            return stem.to_string();
        }
    }
    file_name.to_string()
}

/// Lists the logical contents of a store directory across all discs.
///
/// Results are deduplicated and sorted. Temp and stripe representations
/// collapse to their logical object name; anything unrecognised is returned
/// verbatim.
pub fn read_directory(
    set: &DiscSet,
    rel_dir: &str,
    kind: DirListKind,
) -> StoreResult<Vec<String>> {
    let mut names = std::collections::BTreeSet::new();
    for disc in &set.dirs {
        let dir = if rel_dir.is_empty() {
            disc.clone()
        } else {
            disc.join(rel_dir)
        };
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(StoreError::Io(e)),
        };
        for entry in entries {
            let entry = entry?;
            let is_dir = entry.file_type()?.is_dir();
            let name = entry.file_name().to_string_lossy().into_owned();
            match kind {
                DirListKind::DirsOnly if is_dir => {
                    names.insert(name);
                }
                DirListKind::FilesOnly if !is_dir => {
                    names.insert(logical_name(&name));
                }
                _ => {}
            }
        }
    }
    Ok(names.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DiscSet;
    use tempfile::TempDir;

    fn single_set(dir: &TempDir) -> DiscSet {
        DiscSet::new(vec![dir.path().to_path_buf()], 64)
    }

    fn triple_set(dirs: &[TempDir; 3]) -> DiscSet {
        DiscSet::new(dirs.iter().map(|d| d.path().to_path_buf()).collect(), 64)
    }

    fn write_object(set: &DiscSet, rel: &str, data: &[u8], convert: bool) {
        let mut w = StripedWriter::open(set, rel, false).unwrap();
        w.write_all(data).unwrap();
        w.commit(convert).unwrap();
    }

    #[test]
    fn test_single_disc_round_trip() {
        let dir = TempDir::new().unwrap();
        let set = single_set(&dir);
        let data = b"hello store".to_vec();
        write_object(&set, "o02", &data, true);

        let mut r = StripedReader::open(&set, "o02").unwrap();
        assert_eq!(r.len(), data.len() as u64);
        assert_eq!(r.read_remaining().unwrap(), data);
        assert_eq!(r.usage_in_blocks(), 1);
    }

    #[test]
    fn test_striped_round_trip() {
        let dirs = [
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
        ];
        let set = triple_set(&dirs);
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        write_object(&set, "o03", &data, true);

        let mut r = StripedReader::open(&set, "o03").unwrap();
        assert_eq!(r.read_remaining().unwrap(), data);
    }

    #[test]
    fn test_striped_survives_one_missing_stripe() {
        let dirs = [
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
        ];
        let set = triple_set(&dirs);
        let data: Vec<u8> = (0..777u32).map(|i| (i * 7 % 256) as u8).collect();
        write_object(&set, "o04", &data, true);

        // Remove each stripe in turn; every time the stream must rebuild.
        for k in 0..set.data_stripes() {
            let victim = super::stripe_path(&set, "o04", k);
            let bytes = std::fs::read(&victim).unwrap();
            std::fs::remove_file(&victim).unwrap();

            let mut r = StripedReader::open(&set, "o04").unwrap();
            assert_eq!(r.read_remaining().unwrap(), data, "stripe {k}");

            std::fs::write(&victim, bytes).unwrap();
        }
    }

    #[test]
    fn test_striped_missing_parity_still_reads() {
        let dirs = [
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
        ];
        let set = triple_set(&dirs);
        let data = vec![0xAB; 500];
        write_object(&set, "o05", &data, true);

        std::fs::remove_file(super::parity_path(&set, "o05")).unwrap();
        let mut r = StripedReader::open(&set, "o05").unwrap();
        assert_eq!(r.read_remaining().unwrap(), data);
    }

    #[test]
    fn test_two_missing_is_corrupt() {
        let dirs = [
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
        ];
        let set = triple_set(&dirs);
        write_object(&set, "o06", &[1u8; 300], true);

        std::fs::remove_file(super::stripe_path(&set, "o06", 0)).unwrap();
        std::fs::remove_file(super::stripe_path(&set, "o06", 1)).unwrap();
        match StripedReader::open(&set, "o06") {
            Err(StoreError::Corrupt(_)) => {}
            other => panic!("expected Corrupt, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_missing_object_is_not_found() {
        let dir = TempDir::new().unwrap();
        let set = single_set(&dir);
        match StripedReader::open(&set, "o99") {
            Err(StoreError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other.err()),
        }
        assert!(object_exists(&set, "o99").unwrap().is_none());
    }

    #[test]
    fn test_overwrite_requires_flag() {
        let dir = TempDir::new().unwrap();
        let set = single_set(&dir);
        write_object(&set, "o07", b"first", false);

        assert!(StripedWriter::open(&set, "o07", false).is_err());

        let mut w = StripedWriter::open(&set, "o07", true).unwrap();
        w.write_all(b"second").unwrap();
        w.commit(false).unwrap();

        let mut r = StripedReader::open(&set, "o07").unwrap();
        assert_eq!(r.read_remaining().unwrap(), b"second");
    }

    #[test]
    fn test_abandoned_writer_removes_temp() {
        let dir = TempDir::new().unwrap();
        let set = single_set(&dir);
        {
            let mut w = StripedWriter::open(&set, "o08", false).unwrap();
            w.write_all(b"junk").unwrap();
        }
        assert!(object_exists(&set, "o08").unwrap().is_none());
        assert_eq!(
            read_directory(&set, "", DirListKind::FilesOnly).unwrap(),
            Vec::<String>::new()
        );
    }

    #[test]
    fn test_revision_advances_on_rewrite() {
        let dir = TempDir::new().unwrap();
        let set = single_set(&dir);
        write_object(&set, "o09", b"v1", false);
        let first = object_exists(&set, "o09").unwrap().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut w = StripedWriter::open(&set, "o09", true).unwrap();
        w.write_all(b"v2 with more bytes").unwrap();
        w.commit(false).unwrap();
        let second = object_exists(&set, "o09").unwrap().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_delete_removes_all_forms() {
        let dirs = [
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
        ];
        let set = triple_set(&dirs);
        write_object(&set, "o0a", &[9u8; 200], true);
        delete_object(&set, "o0a").unwrap();
        assert!(object_exists(&set, "o0a").unwrap().is_none());
        assert!(matches!(
            delete_object(&set, "o0a"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_listing_merges_stripe_forms() {
        let dirs = [
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
        ];
        let set = triple_set(&dirs);
        set.ensure_directory("ab").unwrap();
        write_object(&set, "ab/o01", &[1u8; 100], true);
        write_object(&set, "ab/o02", &[2u8; 100], false);

        let files = read_directory(&set, "ab", DirListKind::FilesOnly).unwrap();
        assert_eq!(files, vec!["o01".to_string(), "o02".to_string()]);

        let dirs_listed = read_directory(&set, "", DirListKind::DirsOnly).unwrap();
        assert_eq!(dirs_listed, vec!["ab".to_string()]);
    }

    #[test]
    fn test_predicted_usage_matches_actual() {
        let dirs = [
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
        ];
        let set = triple_set(&dirs);
        for len in [0usize, 1, 63, 64, 65, 128, 1000, 4096] {
            let rel = format!("o{len:02x}");
            let data = vec![0x5A; len];
            write_object(&set, &rel, &data, true);
            let actual = object_usage_blocks(&set, &rel).unwrap();
            assert_eq!(
                predicted_usage_blocks(&set, len as u64),
                actual,
                "len {len}"
            );
        }
    }

    #[test]
    fn test_seek_and_partial_reads() {
        let dirs = [
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
        ];
        let set = triple_set(&dirs);
        let data: Vec<u8> = (0..512u32).map(|i| i as u8).collect();
        write_object(&set, "o0b", &data, true);

        let mut r = StripedReader::open(&set, "o0b").unwrap();
        r.seek(SeekFrom::Start(100)).unwrap();
        let mut buf = [0u8; 10];
        r.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, &data[100..110]);

        r.seek(SeekFrom::End(-4)).unwrap();
        let mut tail = Vec::new();
        r.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, &data[508..]);
    }
}
