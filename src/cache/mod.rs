// src/cache/mod.rs

//! Persistent, content-addressed result cache.
//!
//! - [`hash`] computes binary checksums.
//! - [`artifact`] defines the on-disk descriptor and the in-memory artifact.
//! - [`store`] is the cache itself: an in-memory index mirroring the disk.
//! - [`evict`] keeps the cache under its size budget.

pub mod artifact;
pub mod evict;
pub mod hash;
pub mod store;

pub use artifact::{CompileInfo, CompiledArtifact, KernelDescriptor, PreCompileEntry};
pub use evict::EvictionReport;
pub use store::{CacheStats, CacheStore, KERNEL_DIR, PRECOMPILE_DIR};
