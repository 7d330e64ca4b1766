// src/binary/registry.rs

//! JSON index of installed kernels.
//!
//! ```json
//! {
//!   "kernels": [
//!     {
//!       "op_type": "Add",
//!       "inputs": [ { "dtype": "float16", "format": "ND", "shape": [-1, 16] } ],
//!       "attrs": { "alpha": 1 },
//!       "descriptor": "add/add_f16.json",
//!       "binary": "add/add_f16.o"
//!     }
//!   ]
//! }
//! ```
//!
//! Relative paths are resolved against the index file's directory. A shape
//! dimension of `-1` matches any size; `attrs` lists only the attributes an
//! entry pins down.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::binary::PrebuiltRegistry;
use crate::cache::CompiledArtifact;
use crate::errors::Result;
use crate::graph::{OpDesc, TensorDesc};
use crate::types::ArtifactVariant;

const ANY_DIM: i64 = -1;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TensorPattern {
    pub dtype: String,
    pub format: String,
    pub shape: Vec<i64>,
}

impl TensorPattern {
    fn matches(&self, tensor: &TensorDesc) -> bool {
        self.dtype == tensor.dtype
            && self.format == tensor.format
            && self.shape.len() == tensor.shape.len()
            && self
                .shape
                .iter()
                .zip(&tensor.shape)
                .all(|(want, have)| *want == ANY_DIM || want == have)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegistryEntry {
    pub op_type: String,
    #[serde(default)]
    pub inputs: Vec<TensorPattern>,
    #[serde(default)]
    pub attrs: BTreeMap<String, Value>,
    pub descriptor: PathBuf,
    pub binary: PathBuf,
}

impl RegistryEntry {
    fn matches(&self, op: &OpDesc) -> bool {
        self.op_type == op.op_type
            && self.inputs.len() == op.inputs.len()
            && self
                .inputs
                .iter()
                .zip(&op.inputs)
                .all(|(pattern, input)| pattern.matches(&input.tensor))
            && self
                .attrs
                .iter()
                .all(|(key, want)| op.attrs.get(key) == Some(want))
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    kernels: Vec<RegistryEntry>,
}

#[derive(Debug)]
pub struct JsonRegistry {
    root: PathBuf,
    entries: Vec<RegistryEntry>,
}

impl JsonRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading binary registry {:?}", path))?;
        let file: RegistryFile = serde_json::from_str(&data)?;
        let root = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        info!(path = ?path, entries = file.kernels.len(), "loaded binary registry");
        Ok(Self::from_entries(root, file.kernels))
    }

    pub fn from_entries(root: impl Into<PathBuf>, entries: Vec<RegistryEntry>) -> Self {
        Self {
            root: root.into(),
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn validate(&self, entry: &RegistryEntry) -> anyhow::Result<CompiledArtifact> {
        let descriptor = self.root.join(&entry.descriptor);
        let binary = self.root.join(&entry.binary);
        let artifact = CompiledArtifact::load(&descriptor, ArtifactVariant::Whole, false)?;
        if artifact.binary_path != binary {
            anyhow::bail!(
                "descriptor {:?} points at {:?}, registry expects {:?}",
                descriptor,
                artifact.binary_path,
                binary
            );
        }
        Ok(artifact)
    }
}

impl PrebuiltRegistry for JsonRegistry {
    fn lookup(&self, op: &OpDesc) -> Option<Arc<CompiledArtifact>> {
        for entry in self.entries.iter().filter(|e| e.matches(op)) {
            match self.validate(entry) {
                Ok(artifact) => {
                    debug!(
                        op_type = %op.op_type,
                        kernel = %artifact.kernel_name,
                        "prebuilt kernel matched"
                    );
                    return Some(Arc::new(artifact));
                }
                Err(e) => {
                    warn!(op_type = %op.op_type, error = %e, "skipping unusable prebuilt kernel")
                }
            }
        }
        None
    }
}
