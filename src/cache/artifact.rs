// src/cache/artifact.rs

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cache::hash::compute_file_hash;
use crate::graph::KernelBinding;
use crate::types::ArtifactVariant;

/// Secondary cache key the runtime uses to find tiling information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileInfo {
    pub key: String,
    pub json: String,
}

/// Descriptor document stored next to every kernel binary.
///
/// Unknown fields written by the backend are preserved in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelDescriptor {
    pub kernel_name: String,
    /// Binary file name, relative to the descriptor's directory.
    pub binary_file: String,
    /// Hex checksum of the binary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile_info: Option<CompileInfo>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A kernel binary plus its parsed descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledArtifact {
    pub kernel_name: String,
    pub variant: ArtifactVariant,
    pub descriptor_path: PathBuf,
    pub binary_path: PathBuf,
    pub descriptor: KernelDescriptor,
    pub checksum: String,
    pub size: u64,
}

impl CompiledArtifact {
    /// Load an artifact from its descriptor file.
    ///
    /// With `require_checksum`, a descriptor without a recorded checksum is
    /// rejected; a recorded checksum must always match the binary.
    pub fn load(
        descriptor_path: &Path,
        variant: ArtifactVariant,
        require_checksum: bool,
    ) -> Result<Self> {
        let data = fs::read_to_string(descriptor_path)
            .with_context(|| format!("reading kernel descriptor {:?}", descriptor_path))?;
        let descriptor: KernelDescriptor = serde_json::from_str(&data)
            .with_context(|| format!("parsing kernel descriptor {:?}", descriptor_path))?;

        if !is_plain_file_name(&descriptor.binary_file) {
            bail!(
                "descriptor {:?} names binary {:?} outside its directory",
                descriptor_path,
                descriptor.binary_file
            );
        }

        let dir = descriptor_path.parent().unwrap_or_else(|| Path::new("."));
        let binary_path = dir.join(&descriptor.binary_file);
        let checksum = compute_file_hash(&binary_path)?;

        match descriptor.checksum.as_deref() {
            Some(recorded) if recorded != checksum => bail!(
                "checksum mismatch for {:?}: descriptor records {recorded}, \
                 binary hashes to {checksum}",
                binary_path
            ),
            None if require_checksum => {
                bail!("descriptor {:?} records no checksum", descriptor_path)
            }
            _ => {}
        }

        let size = fs::metadata(&binary_path)
            .with_context(|| format!("reading metadata of {:?}", binary_path))?
            .len();

        Ok(Self {
            kernel_name: descriptor.kernel_name.clone(),
            variant,
            descriptor_path: descriptor_path.to_path_buf(),
            binary_path,
            descriptor,
            checksum,
            size,
        })
    }

    pub fn compile_info(&self) -> Option<&CompileInfo> {
        self.descriptor.compile_info.as_ref()
    }

    /// What gets written back onto the host node.
    pub fn binding(&self) -> KernelBinding {
        KernelBinding {
            kernel_name: self.kernel_name.clone(),
            descriptor_path: self.descriptor_path.clone(),
            binary_path: self.binary_path.clone(),
            compile_info_key: self.compile_info().map(|c| c.key.clone()),
            compile_info_json: self.compile_info().map(|c| c.json.clone()),
        }
    }
}

/// Result of a pre-compile (core-type and fusion-pattern selection).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreCompileEntry {
    pub kernel_name: String,
    pub core_type: String,
    pub pattern: String,
}

fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}
