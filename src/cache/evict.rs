// src/cache/evict.rs

//! Size-budget eviction for the compile cache.
//!
//! Entries (descriptor + binary) are removed oldest access first until the
//! cache fits `max_bytes`. An entry is only removed while this process holds
//! its sentinel lock and exclusive locks on both of its files, so nothing
//! being built, rebuilt or read anywhere is evicted. Sentinels themselves are
//! left in place.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::cache::artifact::KernelDescriptor;
use crate::cache::store::{CacheStore, read_dir_or_empty};
use crate::errors::Result;
use crate::lock::{FileLocker, LockGuard};
use crate::types::{ArtifactVariant, CacheMode};

/// Temp files younger than this may still be in the middle of a write.
const ORPHAN_MIN_AGE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub scanned: usize,
    pub evicted: usize,
    pub skipped_locked: usize,
    pub orphans_removed: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

#[derive(Debug)]
struct Entry {
    kernel: String,
    variant: ArtifactVariant,
    descriptor: PathBuf,
    binary: PathBuf,
    bytes: u64,
    last_access: SystemTime,
}

impl CacheStore {
    /// Evict entries until the compile cache fits its size budget.
    ///
    /// A budget of zero means unlimited; only orphaned temp files are
    /// cleaned up then.
    pub fn evict_to_budget(&self) -> Result<EvictionReport> {
        let mut report = EvictionReport::default();
        if self.mode() == CacheMode::Disable {
            return Ok(report);
        }

        let dir = self.kernel_dir();
        report.orphans_removed = remove_orphans(&dir)? + remove_orphans(&self.precompile_dir())?;

        let mut entries = scan_entries(&dir)?;
        report.scanned = entries.len();
        report.bytes_before = entries.iter().map(|e| e.bytes).sum();
        report.bytes_after = report.bytes_before;

        let budget = self.settings().max_bytes;
        if budget == 0 || report.bytes_before <= budget {
            debug!(bytes = report.bytes_before, budget, "cache within budget");
            return Ok(report);
        }

        entries.sort_by_key(|e| e.last_access);
        let locker = FileLocker;
        for entry in entries {
            if report.bytes_after <= budget {
                break;
            }

            let sentinel = dir.join(format!("{}.lock", entry.variant.file_stem(&entry.kernel)));
            let _sentinel_guard = match locker.acquire_exclusive(&sentinel) {
                Ok(Some(guard)) => guard,
                Ok(None) => {
                    debug!(kernel = %entry.kernel, "entry is being built; not evicting");
                    report.skipped_locked += 1;
                    continue;
                }
                Err(e) => {
                    warn!(kernel = %entry.kernel, error = %e, "cannot lock entry for eviction");
                    report.skipped_locked += 1;
                    continue;
                }
            };

            let Some(_file_guards) = lock_entry_files(&locker, &entry) else {
                debug!(
                    kernel = %entry.kernel,
                    variant = ?entry.variant,
                    "entry is being read; not evicting"
                );
                report.skipped_locked += 1;
                continue;
            };

            // Descriptor first: without it the entry is already a miss.
            if let Err(e) = fs::remove_file(&entry.descriptor) {
                warn!(path = ?entry.descriptor, error = %e, "failed to evict descriptor");
                continue;
            }
            if let Err(e) = fs::remove_file(&entry.binary) {
                warn!(path = ?entry.binary, error = %e, "failed to evict binary");
            }
            self.forget_stem(&entry.kernel, entry.variant);
            report.evicted += 1;
            report.bytes_after = report.bytes_after.saturating_sub(entry.bytes);
            debug!(
                kernel = %entry.kernel,
                variant = ?entry.variant,
                bytes = entry.bytes,
                "evicted cache entry"
            );
        }

        info!(
            evicted = report.evicted,
            skipped = report.skipped_locked,
            bytes_before = report.bytes_before,
            bytes_after = report.bytes_after,
            budget,
            "cache eviction finished"
        );
        Ok(report)
    }
}

fn scan_entries(dir: &Path) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    for dirent in read_dir_or_empty(dir)? {
        let descriptor = dirent.path();
        if descriptor.extension().is_none_or(|ext| ext != "json") {
            continue;
        }
        let Some(stem) = descriptor.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if stem.starts_with('.') {
            continue;
        }

        let binary = dir.join(format!("{stem}.o"));
        let kernel = kernel_of(&descriptor).unwrap_or_else(|| stem.to_string());
        let variant = if ArtifactVariant::Split.file_stem(&kernel) == stem {
            ArtifactVariant::Split
        } else {
            ArtifactVariant::Whole
        };

        let descriptor_meta = dirent.metadata()?;
        let binary_meta = fs::metadata(&binary).ok();
        let bytes = descriptor_meta.len() + binary_meta.as_ref().map_or(0, |m| m.len());
        let last_access = binary_meta
            .as_ref()
            .and_then(|m| m.accessed().or_else(|_| m.modified()).ok())
            .or_else(|| descriptor_meta.modified().ok())
            .unwrap_or(SystemTime::UNIX_EPOCH);

        entries.push(Entry {
            kernel,
            variant,
            descriptor,
            binary,
            bytes,
            last_access,
        });
    }
    Ok(entries)
}

/// Exclusive locks on the entry's descriptor and binary, or `None` while a
/// reader or writer holds either of them. A file that is already gone needs
/// no lock.
fn lock_entry_files(locker: &FileLocker, entry: &Entry) -> Option<Vec<LockGuard>> {
    let mut guards = Vec::with_capacity(2);
    for path in [&entry.descriptor, &entry.binary] {
        match locker.acquire_exclusive_existing(path) {
            Ok(Some(guard)) => guards.push(guard),
            Ok(None) => return None,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = ?path, error = %e, "cannot lock entry file for eviction");
                return None;
            }
        }
    }
    Some(guards)
}

fn kernel_of(descriptor: &Path) -> Option<String> {
    let data = fs::read_to_string(descriptor).ok()?;
    serde_json::from_str::<KernelDescriptor>(&data)
        .ok()
        .map(|d| d.kernel_name)
}

/// Remove `.tmp-*` files left behind by writers that died mid-write.
fn remove_orphans(dir: &Path) -> Result<usize> {
    let now = SystemTime::now();
    let locker = FileLocker;
    let mut removed = 0;

    for dirent in read_dir_or_empty(dir)? {
        let path = dirent.path();
        let is_tmp = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(".tmp-"));
        if !is_tmp {
            continue;
        }

        let old_enough = dirent
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age >= ORPHAN_MIN_AGE);
        if !old_enough {
            continue;
        }

        // A live writer keeps its temp file exclusively locked.
        match locker.acquire_shared(&path) {
            Ok(Some(guard)) => {
                drop(guard);
                match fs::remove_file(&path) {
                    Ok(()) => {
                        debug!(path = ?path, "removed orphaned temp file");
                        removed += 1;
                    }
                    Err(e) => {
                        warn!(path = ?path, error = %e, "failed to remove orphaned temp file")
                    }
                }
            }
            Ok(None) => {}
            Err(e) => debug!(path = ?path, error = %e, "skipping temp file"),
        }
    }
    Ok(removed)
}
