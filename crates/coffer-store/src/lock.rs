//! Inter-process advisory locking over a filesystem path.
//!
//! One lock file guards one account. Acquisition never blocks: contention is
//! reported as [`StoreError::AlreadyLocked`] and is an expected condition,
//! not a fault. Several backends are available because not every filesystem
//! honours every locking primitive; `Flock` is the default on the platforms
//! this crate targets.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

/// Locking primitive used to claim the lock file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMethod {
    /// Whole-file advisory lock via `flock(2)`.
    #[default]
    Flock,
    /// Record lock over the whole file via `fcntl(2)` `F_SETLK`.
    RecordLock,
    /// Plain create-exclusive. No kernel lock; stale files are possible
    /// after a crash, so this is the fallback of last resort.
    CreateExclusive,
}

/// An exclusive advisory lock on a filesystem path.
///
/// The lock file exists while the lock is held. Release deletes the file
/// *before* closing the descriptor: once we close, another process can
/// acquire, and deleting afterwards would remove their lock file from under
/// them.
#[derive(Debug)]
pub struct NamedLock {
    held: Option<(File, PathBuf)>,
    method: LockMethod,
}

impl NamedLock {
    /// Creates an unlocked lock using the default method.
    pub fn new() -> Self {
        Self::with_method(LockMethod::default())
    }

    /// Creates an unlocked lock with an explicit backend.
    pub fn with_method(method: LockMethod) -> Self {
        Self { held: None, method }
    }

    /// True while this instance holds a lock.
    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// Attempts to acquire the lock at `path` without blocking.
    ///
    /// Errors with [`StoreError::AlreadyLocked`] when another process holds
    /// it, or [`StoreError::Io`] for anything unexpected.
    pub fn try_acquire(&mut self, path: &Path) -> StoreResult<()> {
        if self.held.is_some() {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "named lock instance already locking something",
            )));
        }

        let file = match self.method {
            LockMethod::CreateExclusive => self.open_exclusive(path)?,
            LockMethod::Flock | LockMethod::RecordLock => self.open_and_lock(path)?,
        };

        // The previous holder may have deleted the file between our open and
        // our lock. Holding a lock on an unlinked inode guards nothing.
        if self.method != LockMethod::CreateExclusive && !path.exists() {
            warn!(path = %path.display(), "lock file vanished after locking, retry");
            drop(file);
            return Err(StoreError::AlreadyLocked {
                path: path.display().to_string(),
            });
        }

        debug!(path = %path.display(), method = ?self.method, "acquired named lock");
        self.held = Some((file, path.to_path_buf()));
        Ok(())
    }

    fn open_exclusive(&self, path: &Path) -> StoreResult<File> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(f) => Ok(f),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(StoreError::AlreadyLocked {
                    path: path.display().to_string(),
                })
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn open_and_lock(&self, path: &Path) -> StoreResult<File> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let fd = file.as_raw_fd();
        let rc = match self.method {
            LockMethod::Flock => unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) },
            LockMethod::RecordLock => {
                let mut fl: libc::flock = unsafe { std::mem::zeroed() };
                fl.l_type = libc::F_WRLCK as libc::c_short;
                fl.l_whence = libc::SEEK_SET as libc::c_short;
                fl.l_start = 0;
                fl.l_len = 0;
                unsafe { libc::fcntl(fd, libc::F_SETLK, &fl) }
            }
            LockMethod::CreateExclusive => unreachable!(),
        };

        if rc != 0 {
            let err = io::Error::last_os_error();
            drop(file);
            let code = err.raw_os_error().unwrap_or(0);
            if code == libc::EWOULDBLOCK || code == libc::EAGAIN || code == libc::EACCES {
                return Err(StoreError::AlreadyLocked {
                    path: path.display().to_string(),
                });
            }
            return Err(StoreError::Io(err));
        }
        Ok(file)
    }

    /// Releases the lock, deleting the lock file.
    pub fn release(&mut self) -> StoreResult<()> {
        let (file, path) = match self.held.take() {
            Some(h) => h,
            None => {
                return Err(StoreError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    "named lock not held",
                )))
            }
        };

        // A missing lock file is tolerated: deleting a whole account
        // removes it together with the account root.
        let unlink = |p: &Path| match std::fs::remove_file(p) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        };

        match self.method {
            LockMethod::CreateExclusive => {
                // No kernel lock: close first, then unlink.
                drop(file);
                unlink(&path)?;
            }
            _ => {
                // Unlink while the lock is still held, then close.
                unlink(&path)?;
                drop(file);
            }
        }

        debug!(path = %path.display(), "released named lock");
        Ok(())
    }
}

impl Default for NamedLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NamedLock {
    fn drop(&mut self) {
        if self.held.is_some() {
            if let Err(e) = self.release() {
                warn!(error = %e, "failed to release named lock on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("write.lock");

        let mut lock = NamedLock::new();
        lock.try_acquire(&path).unwrap();
        assert!(lock.is_held());
        assert!(path.exists());

        lock.release().unwrap();
        assert!(!lock.is_held());
        assert!(!path.exists());
    }

    #[test]
    fn test_contention_reported_as_already_locked() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("write.lock");

        let mut first = NamedLock::new();
        first.try_acquire(&path).unwrap();

        let mut second = NamedLock::with_method(LockMethod::CreateExclusive);
        match second.try_acquire(&path) {
            Err(StoreError::AlreadyLocked { .. }) => {}
            other => panic!("expected AlreadyLocked, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_reacquire_after_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("write.lock");

        let mut lock = NamedLock::with_method(LockMethod::CreateExclusive);
        lock.try_acquire(&path).unwrap();
        lock.release().unwrap();
        lock.try_acquire(&path).unwrap();
        assert!(lock.is_held());
    }

    #[test]
    fn test_drop_releases() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("write.lock");
        {
            let mut lock = NamedLock::new();
            lock.try_acquire(&path).unwrap();
        }
        assert!(!path.exists());

        let mut again = NamedLock::new();
        again.try_acquire(&path).unwrap();
    }

    #[test]
    fn test_record_lock_backend() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("write.lock");

        let mut lock = NamedLock::with_method(LockMethod::RecordLock);
        lock.try_acquire(&path).unwrap();
        assert!(path.exists());
        lock.release().unwrap();
    }
}
