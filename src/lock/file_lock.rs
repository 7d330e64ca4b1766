// src/lock/file_lock.rs

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// A held advisory lock. Dropping the guard releases it.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Fully qualified: std's inherent `File::unlock` has different
        // semantics on newer toolchains.
        match FileExt::unlock(&self.file) {
            Ok(()) => trace!(path = ?self.path, mode = ?self.mode, "released advisory lock"),
            Err(e) => debug!(
                path = ?self.path,
                error = %e,
                "unlock failed; lock is dropped with the handle"
            ),
        }
    }
}

/// Native advisory locks (`flock` on Unix, `LockFileEx` on Windows).
///
/// Locks belong to the open file handle, so two handles in the same process
/// conflict exactly like two processes would.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileLocker;

impl FileLocker {
    /// Try to take an exclusive lock on `path`, creating the file if needed.
    ///
    /// Returns `Ok(None)` when any other handle holds a lock on it.
    pub fn acquire_exclusive(&self, path: &Path) -> io::Result<Option<LockGuard>> {
        self.try_exclusive(path, true)
    }

    /// Like [`acquire_exclusive`](Self::acquire_exclusive), but a missing
    /// file is reported as `NotFound` instead of being created.
    pub fn acquire_exclusive_existing(&self, path: &Path) -> io::Result<Option<LockGuard>> {
        self.try_exclusive(path, false)
    }

    fn try_exclusive(&self, path: &Path, create: bool) -> io::Result<Option<LockGuard>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(path)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Some(LockGuard {
                file,
                path: path.to_path_buf(),
                mode: LockMode::Exclusive,
            })),
            Err(e) if is_contended(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Try to take a shared lock on an existing file.
    ///
    /// Returns `Ok(None)` when a writer holds it exclusively; a missing file
    /// is reported as `NotFound`.
    pub fn acquire_shared(&self, path: &Path) -> io::Result<Option<LockGuard>> {
        let file = File::open(path)?;

        match FileExt::try_lock_shared(&file) {
            Ok(()) => Ok(Some(LockGuard {
                file,
                path: path.to_path_buf(),
                mode: LockMode::Shared,
            })),
            Err(e) if is_contended(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn is_contended(err: &io::Error) -> bool {
    match (err.raw_os_error(), fs2::lock_contended_error().raw_os_error()) {
        (Some(actual), Some(contended)) => actual == contended,
        _ => err.kind() == io::ErrorKind::WouldBlock,
    }
}
