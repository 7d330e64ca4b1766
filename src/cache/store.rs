// src/cache/store.rs

//! The result cache: an in-memory index in front of a shared directory.
//!
//! ```text
//! <root>/kernel/<stem>.json   descriptor (checksum recorded)
//! <root>/kernel/<stem>.o      binary
//! <root>/kernel/<stem>.lock   build sentinel (see `lock::build_dir`)
//! <root>/pre/<kernel>.json    pre-compile result
//! ```
//!
//! Writes are copy-then-publish: each file goes through a temp file and an
//! atomic rename (binary first, descriptor last), and the in-memory index
//! is only updated afterwards. A reader therefore never sees a descriptor
//! whose binary is incomplete.

use std::collections::HashMap;
use std::fs::{self, File, FileTimes};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use anyhow::Context;
use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::cache::artifact::{CompiledArtifact, PreCompileEntry};
use crate::config::CacheSettings;
use crate::errors::{BuildError, Result};
use crate::types::{ArtifactVariant, CacheMode};

pub const KERNEL_DIR: &str = "kernel";
pub const PRECOMPILE_DIR: &str = "pre";

type CompiledIndex = HashMap<(String, ArtifactVariant), Arc<CompiledArtifact>>;

#[derive(Debug)]
pub struct CacheStore {
    settings: CacheSettings,
    compiled: Mutex<CompiledIndex>,
    precompiled: Mutex<HashMap<String, PreCompileEntry>>,
}

/// Snapshot of what the cache holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub disk_entries: usize,
    pub disk_bytes: u64,
    pub precompile_entries: usize,
    pub indexed_in_memory: usize,
}

impl CacheStore {
    /// Open the cache described by `settings`, creating its directories
    /// unless the cache is disabled.
    pub fn open(settings: CacheSettings) -> Result<Self> {
        if settings.mode != CacheMode::Disable {
            for dir in [settings.dir.join(KERNEL_DIR), settings.dir.join(PRECOMPILE_DIR)] {
                fs::create_dir_all(&dir).map_err(|e| {
                    BuildError::ResourceError(format!("creating cache directory {:?}: {e}", dir))
                })?;
            }
        }
        info!(dir = ?settings.dir, mode = ?settings.mode, "opened result cache");
        Ok(Self {
            settings,
            compiled: Mutex::new(HashMap::new()),
            precompiled: Mutex::new(HashMap::new()),
        })
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn mode(&self) -> CacheMode {
        self.settings.mode
    }

    pub fn kernel_dir(&self) -> PathBuf {
        self.settings.dir.join(KERNEL_DIR)
    }

    pub fn precompile_dir(&self) -> PathBuf {
        self.settings.dir.join(PRECOMPILE_DIR)
    }

    pub fn descriptor_path(&self, kernel: &str, variant: ArtifactVariant) -> PathBuf {
        self.kernel_dir().join(format!("{}.json", variant.file_stem(kernel)))
    }

    pub fn binary_path(&self, kernel: &str, variant: ArtifactVariant) -> PathBuf {
        self.kernel_dir().join(format!("{}.o", variant.file_stem(kernel)))
    }

    /// Look up a finished artifact: memory first, then disk.
    ///
    /// A disk entry is trusted only if its binary matches the recorded
    /// checksum; corrupt entries are reported as a miss.
    pub fn match_compile_cache(
        &self,
        kernel: &str,
        variant: ArtifactVariant,
    ) -> Option<Arc<CompiledArtifact>> {
        if !self.settings.mode.reads() {
            return None;
        }
        self.load_published(kernel, variant)
    }

    /// Look up an entry some builder has published, even when this cache
    /// does not serve lookups (`Force` still picks up a peer's build).
    pub fn load_published(
        &self,
        kernel: &str,
        variant: ArtifactVariant,
    ) -> Option<Arc<CompiledArtifact>> {
        if self.settings.mode == CacheMode::Disable {
            return None;
        }

        let key = (kernel.to_string(), variant);
        if let Some(hit) = self.compiled_index().get(&key) {
            debug!(kernel = %kernel, ?variant, "compile cache hit (memory)");
            return Some(Arc::clone(hit));
        }

        let descriptor = self.descriptor_path(kernel, variant);
        if !descriptor.is_file() {
            return None;
        }

        match CompiledArtifact::load(&descriptor, variant, true) {
            Ok(artifact) => {
                touch(&artifact.binary_path);
                let artifact = Arc::new(artifact);
                self.compiled_index().insert(key, Arc::clone(&artifact));
                debug!(kernel = %kernel, ?variant, "compile cache hit (disk)");
                Some(artifact)
            }
            Err(e) => {
                warn!(kernel = %kernel, error = %e, "ignoring unusable cache entry");
                None
            }
        }
    }

    /// Copy a freshly built artifact into the cache and publish it.
    ///
    /// Returns the cached copy, or `None` when the cache does not write.
    pub fn set_compile_result(
        &self,
        artifact: &CompiledArtifact,
    ) -> Result<Option<Arc<CompiledArtifact>>> {
        if !self.settings.mode.writes() {
            return Ok(None);
        }

        let kernel = artifact.kernel_name.as_str();
        let variant = artifact.variant;
        let binary_dest = self.binary_path(kernel, variant);
        let descriptor_dest = self.descriptor_path(kernel, variant);

        let mut descriptor = artifact.descriptor.clone();
        descriptor.binary_file = file_name_of(&binary_dest)?;
        descriptor.checksum = Some(artifact.checksum.clone());
        let descriptor_bytes = serde_json::to_vec_pretty(&descriptor)?;

        write_atomically(&binary_dest, |out| {
            let mut src = File::open(&artifact.binary_path)?;
            io::copy(&mut src, out).map(|_| ())
        })
        .with_context(|| format!("caching binary for {kernel}"))?;
        write_atomically(&descriptor_dest, |out| out.write_all(&descriptor_bytes))
            .with_context(|| format!("caching descriptor for {kernel}"))?;

        let cached = Arc::new(CompiledArtifact {
            kernel_name: kernel.to_string(),
            variant,
            descriptor_path: descriptor_dest,
            binary_path: binary_dest,
            descriptor,
            checksum: artifact.checksum.clone(),
            size: artifact.size,
        });
        self.compiled_index()
            .insert((kernel.to_string(), variant), Arc::clone(&cached));
        info!(kernel = %kernel, ?variant, size = artifact.size, "stored compile result in cache");
        Ok(Some(cached))
    }

    pub fn match_precompile_cache(&self, kernel: &str) -> Option<PreCompileEntry> {
        if !self.settings.mode.reads() {
            return None;
        }
        if let Some(hit) = self.precompile_index().get(kernel) {
            return Some(hit.clone());
        }

        let path = self.precompile_dir().join(format!("{kernel}.json"));
        let data = fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<PreCompileEntry>(&data) {
            Ok(entry) if entry.kernel_name == kernel => {
                self.precompile_index().insert(kernel.to_string(), entry.clone());
                debug!(kernel = %kernel, "pre-compile cache hit (disk)");
                Some(entry)
            }
            Ok(entry) => {
                warn!(
                    kernel = %kernel,
                    recorded = %entry.kernel_name,
                    "pre-compile entry names another kernel"
                );
                None
            }
            Err(e) => {
                warn!(kernel = %kernel, error = %e, "ignoring unreadable pre-compile entry");
                None
            }
        }
    }

    /// Returns whether the entry was written.
    pub fn set_precompile_result(&self, entry: &PreCompileEntry) -> Result<bool> {
        if !self.settings.mode.writes() {
            return Ok(false);
        }
        let path = self.precompile_dir().join(format!("{}.json", entry.kernel_name));
        let bytes = serde_json::to_vec_pretty(entry)?;
        write_atomically(&path, |out| out.write_all(&bytes))
            .with_context(|| format!("caching pre-compile result for {}", entry.kernel_name))?;
        self.precompile_index()
            .insert(entry.kernel_name.clone(), entry.clone());
        info!(
            kernel = %entry.kernel_name,
            core_type = %entry.core_type,
            "stored pre-compile result in cache"
        );
        Ok(true)
    }

    /// Drop the in-memory index; later lookups go to disk.
    pub fn forget_in_memory(&self) {
        self.compiled_index().clear();
        self.precompile_index().clear();
    }

    pub(crate) fn forget_stem(&self, kernel: &str, variant: ArtifactVariant) {
        self.compiled_index().remove(&(kernel.to_string(), variant));
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let mut stats = CacheStats {
            indexed_in_memory: self.compiled_index().len(),
            ..CacheStats::default()
        };
        if self.settings.mode == CacheMode::Disable {
            return Ok(stats);
        }

        for entry in read_dir_or_empty(&self.kernel_dir())? {
            let path = entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some("json") => {
                    stats.disk_entries += 1;
                    stats.disk_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
                }
                Some("o") => stats.disk_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0),
                _ => {}
            }
        }
        stats.precompile_entries = read_dir_or_empty(&self.precompile_dir())?
            .iter()
            .filter(|e| e.path().extension().is_some_and(|x| x == "json"))
            .count();
        Ok(stats)
    }

    fn compiled_index(&self) -> MutexGuard<'_, CompiledIndex> {
        self.compiled.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn precompile_index(&self) -> MutexGuard<'_, HashMap<String, PreCompileEntry>> {
        self.precompiled.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Write `dest` through a locked temp file in the same directory, then
/// rename it into place.
pub(crate) fn write_atomically(
    dest: &Path,
    fill: impl FnOnce(&mut File) -> io::Result<()>,
) -> anyhow::Result<()> {
    let dir = dest
        .parent()
        .with_context(|| format!("{:?} has no parent directory", dest))?;
    fs::create_dir_all(dir).with_context(|| format!("creating {:?}", dir))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(dir)
        .with_context(|| format!("creating temp file in {:?}", dir))?;
    // Readers probing with a shared lock treat the file as absent until the
    // handle below is dropped.
    FileExt::lock_exclusive(tmp.as_file())?;
    fill(tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;
    let file = tmp
        .persist(dest)
        .map_err(|e| e.error)
        .with_context(|| format!("renaming temp file onto {:?}", dest))?;
    drop(file);
    Ok(())
}

pub(crate) fn read_dir_or_empty(dir: &Path) -> Result<Vec<fs::DirEntry>> {
    match fs::read_dir(dir) {
        Ok(entries) => Ok(entries.collect::<io::Result<Vec<_>>>()?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| BuildError::ContentError(format!("{:?} has no usable file name", path)))
}

/// Record an access for oldest-first eviction.
fn touch(path: &Path) {
    let now = SystemTime::now();
    let result = File::open(path).and_then(|f| f.set_times(FileTimes::new().set_accessed(now)));
    if let Err(e) = result {
        debug!(path = ?path, error = %e, "could not update access time");
    }
}
