// src/lock/build_dir.rs

//! "Is this kernel built, being built, or unbuilt?" across processes.
//!
//! Layout under the kernel cache directory:
//!
//! ```text
//! <dir>/<stem>.json   descriptor
//! <dir>/<stem>.o      binary
//! <dir>/<stem>.lock   sentinel; exclusively locked by the builder-of-record
//! ```
//!
//! `<stem>` is the variant's file stem, so the whole and split artifacts of
//! one kernel are locked independently.
//!
//! Sentinel files are never deleted here. The builder keeps its guard in a
//! process-local table until it calls [`BuildDirLock::release`] after
//! publishing (or failing) its result, or [`BuildDirLock::release_all`] at
//! teardown.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info};

use crate::errors::{BuildError, Result};
use crate::lock::file_lock::{FileLocker, LockGuard};
use crate::types::ArtifactVariant;

/// Outcome of probing the build directory for one kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildDirState {
    /// Descriptor and binary are present and not being written.
    Found,
    /// This call took the sentinel lock; the caller is now the builder.
    Acquired,
    /// This process already holds the sentinel lock.
    HeldByUs,
    /// Another process holds the sentinel lock.
    HeldElsewhere,
}

impl BuildDirState {
    pub fn is_found(self) -> bool {
        matches!(self, BuildDirState::Found)
    }

    pub fn is_building(self) -> bool {
        matches!(self, BuildDirState::HeldByUs | BuildDirState::HeldElsewhere)
    }
}

#[derive(Debug)]
pub struct BuildDirLock {
    dir: PathBuf,
    locker: FileLocker,
    held: Mutex<HashMap<String, LockGuard>>,
}

impl BuildDirLock {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locker: FileLocker,
            held: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn sentinel_path(&self, kernel: &str, variant: ArtifactVariant) -> PathBuf {
        self.dir.join(format!("{}.lock", variant.file_stem(kernel)))
    }

    /// Full probe: finished artifacts first, then the sentinel lock.
    pub fn check_result_in_build_dir(
        &self,
        kernel: &str,
        variant: ArtifactVariant,
    ) -> Result<BuildDirState> {
        if self.holds(kernel, variant) {
            return Ok(BuildDirState::HeldByUs);
        }
        if self.artifacts_present(kernel, variant)? {
            debug!(kernel = %kernel, "artifacts present in build dir");
            return Ok(BuildDirState::Found);
        }

        let state = self.acquire(kernel, variant)?;
        if state == BuildDirState::Acquired && self.artifacts_present(kernel, variant)? {
            // A builder finished between the first probe and our lock.
            self.release(kernel, variant);
            return Ok(BuildDirState::Found);
        }
        Ok(state)
    }

    /// Take the sentinel lock without probing for artifacts.
    pub fn acquire(&self, kernel: &str, variant: ArtifactVariant) -> Result<BuildDirState> {
        let stem = variant.file_stem(kernel);
        let mut held = self.held_table();
        if held.contains_key(&stem) {
            return Ok(BuildDirState::HeldByUs);
        }

        fs::create_dir_all(&self.dir).map_err(|e| {
            BuildError::ResourceError(format!("creating lock directory {:?}: {e}", self.dir))
        })?;

        let sentinel = self.sentinel_path(kernel, variant);
        match self.locker.acquire_exclusive(&sentinel) {
            Ok(Some(guard)) => {
                info!(
                    kernel = %kernel,
                    ?variant,
                    "acquired build lock; this process is the builder"
                );
                held.insert(stem, guard);
                Ok(BuildDirState::Acquired)
            }
            Ok(None) => {
                debug!(kernel = %kernel, ?variant, "build lock held by another process");
                Ok(BuildDirState::HeldElsewhere)
            }
            Err(e) => Err(BuildError::ResourceError(format!(
                "opening lock file {:?}: {e}",
                sentinel
            ))),
        }
    }

    pub fn holds(&self, kernel: &str, variant: ArtifactVariant) -> bool {
        self.held_table().contains_key(&variant.file_stem(kernel))
    }

    /// Release the builder lock for one variant of `kernel`. Returns whether
    /// it was held.
    pub fn release(&self, kernel: &str, variant: ArtifactVariant) -> bool {
        let released = self.held_table().remove(&variant.file_stem(kernel)).is_some();
        if released {
            debug!(kernel = %kernel, ?variant, "released build lock");
        }
        released
    }

    /// Release every lock this process holds. Returns how many were held.
    pub fn release_all(&self) -> usize {
        let mut held = self.held_table();
        let count = held.len();
        held.clear();
        if count > 0 {
            info!(count, dir = ?self.dir, "released all build locks");
        }
        count
    }

    pub fn held_count(&self) -> usize {
        self.held_table().len()
    }

    /// Both files exist and neither is exclusively locked by a writer.
    fn artifacts_present(&self, kernel: &str, variant: ArtifactVariant) -> Result<bool> {
        let stem = variant.file_stem(kernel);
        let descriptor = self.dir.join(format!("{stem}.json"));
        let binary = self.dir.join(format!("{stem}.o"));

        let Some(_descriptor_guard) = self.try_shared(&descriptor)? else {
            return Ok(false);
        };
        let Some(_binary_guard) = self.try_shared(&binary)? else {
            return Ok(false);
        };
        Ok(true)
    }

    fn try_shared(&self, path: &Path) -> Result<Option<LockGuard>> {
        match self.locker.acquire_shared(path) {
            Ok(guard) => Ok(guard),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BuildError::ResourceError(format!("probing {:?}: {e}", path))),
        }
    }

    fn held_table(&self) -> MutexGuard<'_, HashMap<String, LockGuard>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
