// src/binary/mod.rs

//! Prebuilt kernel reuse gate.
//!
//! Before anything touches the cache or the backend, a single-op task asks
//! the installed-kernel registry whether a matching precompiled binary
//! exists. A match resolves the task immediately with `Binary` provenance.

pub mod registry;

use std::sync::Arc;

use crate::cache::CompiledArtifact;
use crate::config::Config;
use crate::errors::Result;
use crate::graph::OpDesc;

pub use registry::{JsonRegistry, RegistryEntry, TensorPattern};

/// Source of installed, precompiled kernels.
pub trait PrebuiltRegistry: Send + Sync {
    /// Return a validated artifact for `op`, if one is installed.
    fn lookup(&self, op: &OpDesc) -> Option<Arc<CompiledArtifact>>;
}

/// Registry that never matches.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRegistry;

impl PrebuiltRegistry for NoRegistry {
    fn lookup(&self, _op: &OpDesc) -> Option<Arc<CompiledArtifact>> {
        None
    }
}

/// The registry described by `[binary]`.
pub fn registry_from_config(cfg: &Config) -> Result<Box<dyn PrebuiltRegistry>> {
    match (&cfg.binary.registry, cfg.binary.enabled) {
        (Some(path), true) => Ok(Box::new(JsonRegistry::load(path)?)),
        _ => Ok(Box::new(NoRegistry)),
    }
}
