// src/config/model.rs

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::types::CacheMode;

/// Configuration as read from a TOML file, before validation.
///
/// ```toml
/// [cache]
/// dir = ".kernel_cache"
/// mode = "enable"
/// max_size_mb = 512
///
/// [build]
/// kernel_meta_dir = "kernel_meta"
///
/// [backend]
/// cmd = "kernel-compiler"
/// jobs = 4
///
/// [binary]
/// registry = "binary_registry.json"
/// ```
///
/// All sections are optional and have reasonable defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub cache: CacheSection,

    #[serde(default)]
    pub build: BuildSection,

    #[serde(default)]
    pub backend: BackendSection,

    #[serde(default)]
    pub binary: BinarySection,
}

/// `[cache]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    /// Root of the shared, content-addressed result cache.
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,

    #[serde(default)]
    pub mode: CacheMode,

    /// Size budget for eviction; `0` disables eviction.
    #[serde(default)]
    pub max_size_mb: u64,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".kernel_cache")
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            mode: CacheMode::default(),
            max_size_mb: 0,
        }
    }
}

/// `[build]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildSection {
    /// Working directory the backend writes in-progress outputs into.
    #[serde(default = "default_kernel_meta_dir")]
    pub kernel_meta_dir: PathBuf,

    /// Sleep between collection cycles in `wait_all_finished`.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound for `wait_all_finished`; `0` waits forever.
    #[serde(default)]
    pub wait_timeout_secs: u64,
}

fn default_kernel_meta_dir() -> PathBuf {
    PathBuf::from("kernel_meta")
}

fn default_poll_interval_ms() -> u64 {
    20
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            kernel_meta_dir: default_kernel_meta_dir(),
            poll_interval_ms: default_poll_interval_ms(),
            wait_timeout_secs: 0,
        }
    }
}

/// `[backend]` section, used by the process backend.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendSection {
    /// Program invoked as `<cmd> <input.json> <kernel_meta_dir>`.
    #[serde(default = "default_backend_cmd")]
    pub cmd: String,

    /// Maximum number of concurrent compile processes.
    #[serde(default = "default_jobs")]
    pub jobs: usize,
}

fn default_backend_cmd() -> String {
    "kernel-compiler".to_string()
}

fn default_jobs() -> usize {
    4
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            cmd: default_backend_cmd(),
            jobs: default_jobs(),
        }
    }
}

/// `[binary]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct BinarySection {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Index of installed prebuilt kernels; no registry if absent.
    #[serde(default)]
    pub registry: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

impl Default for BinarySection {
    fn default() -> Self {
        Self {
            enabled: true,
            registry: None,
        }
    }
}

/// Validated configuration.
///
/// Only obtainable through `Config::try_from(RawConfigFile)` (see
/// `validate.rs`) or [`Config::default`].
#[derive(Debug, Clone)]
pub struct Config {
    pub cache: CacheSection,
    pub build: BuildSection,
    pub backend: BackendSection,
    pub binary: BinarySection,
}

impl Config {
    pub(crate) fn new_unchecked(raw: RawConfigFile) -> Self {
        Self {
            cache: raw.cache,
            build: raw.build,
            backend: raw.backend,
            binary: raw.binary,
        }
    }

    /// The subset of settings that shapes the cache/lock subsystem.
    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            dir: self.cache.dir.clone(),
            mode: self.cache.mode,
            max_bytes: self.cache.max_size_mb.saturating_mul(1024 * 1024),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.build.poll_interval_ms)
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        match self.build.wait_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new_unchecked(RawConfigFile::default())
    }
}

/// Cache-relevant settings; a change here triggers a subsystem refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    pub dir: PathBuf,
    pub mode: CacheMode,
    /// `0` means unlimited.
    pub max_bytes: u64,
}
