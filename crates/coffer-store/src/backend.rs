//! Store backend handle: the configured disc sets.
//!
//! The backend is created once at daemon start and threaded explicitly
//! through contexts, housekeeping and the checker. There is no process-wide
//! controller.

use std::path::{Path, PathBuf};

use crate::error::{StoreError, StoreResult};

/// One group of disc directories holding striped objects.
///
/// With `M` directories, a converted object is stored as `M - 1` data
/// stripes plus one parity stripe, one file per directory. Sets with fewer
/// than three directories store objects as single files only.
#[derive(Debug, Clone)]
pub struct DiscSet {
    /// Root directories of the discs in this set.
    pub dirs: Vec<PathBuf>,
    /// Storage accounting unit in bytes; also the stripe interleave size.
    pub block_size: u64,
}

impl DiscSet {
    /// Creates a disc set over the given directories.
    pub fn new(dirs: Vec<PathBuf>, block_size: u64) -> Self {
        assert!(!dirs.is_empty(), "disc set needs at least one directory");
        assert!(block_size > 0, "block size must be positive");
        Self { dirs, block_size }
    }

    /// Number of disc directories in the set.
    pub fn disc_count(&self) -> usize {
        self.dirs.len()
    }

    /// True when objects committed to this set are split into stripes.
    pub fn striping_enabled(&self) -> bool {
        self.dirs.len() >= 3
    }

    /// Number of data stripes for converted objects.
    pub fn data_stripes(&self) -> usize {
        if self.striping_enabled() {
            self.dirs.len() - 1
        } else {
            1
        }
    }

    /// Disc index holding stripe `k` of the object at `rel_path`.
    ///
    /// The start disc is derived from the path so load spreads across the
    /// set; stripe files of one object land on consecutive discs.
    pub fn disc_for(&self, rel_path: &str, stripe: usize) -> usize {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for b in rel_path.bytes() {
            hash ^= b as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        ((hash as usize) + stripe) % self.dirs.len()
    }

    /// Absolute path of `rel_path` on disc `disc`.
    pub fn path_on_disc(&self, disc: usize, rel_path: &str) -> PathBuf {
        self.dirs[disc].join(rel_path)
    }

    /// Rounds a byte length up to whole storage blocks.
    pub fn bytes_to_blocks(&self, len: u64) -> u64 {
        len.div_ceil(self.block_size)
    }

    /// Creates `rel_dir` (and parents) on every disc of the set.
    pub fn ensure_directory(&self, rel_dir: &str) -> StoreResult<()> {
        for disc in &self.dirs {
            let path = if rel_dir.is_empty() {
                disc.clone()
            } else {
                disc.join(rel_dir)
            };
            std::fs::create_dir_all(&path)?;
        }
        Ok(())
    }

    /// True when `rel_dir` exists on at least one disc.
    pub fn directory_exists(&self, rel_dir: &str) -> bool {
        self.dirs.iter().any(|d| d.join(rel_dir).is_dir())
    }
}

/// The set of disc sets available to this store process.
#[derive(Debug, Clone)]
pub struct StoreBackend {
    disc_sets: Vec<DiscSet>,
}

impl StoreBackend {
    /// Creates a backend over the configured disc sets.
    pub fn new(disc_sets: Vec<DiscSet>) -> Self {
        Self { disc_sets }
    }

    /// Looks up a disc set by number.
    pub fn disc_set(&self, number: usize) -> StoreResult<&DiscSet> {
        self.disc_sets.get(number).ok_or_else(|| {
            StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("disc set {number} is not configured"),
            ))
        })
    }

    /// Number of configured disc sets.
    pub fn disc_set_count(&self) -> usize {
        self.disc_sets.len()
    }
}

/// Builds a single-disc backend rooted at `dir`, useful for tools and tests.
pub fn single_disc_backend(dir: &Path, block_size: u64) -> StoreBackend {
    StoreBackend::new(vec![DiscSet::new(vec![dir.to_path_buf()], block_size)])
}
