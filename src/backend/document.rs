// src/backend/document.rs

//! The compiler-input document.
//!
//! ```json
//! {
//!   "kernel_name": "te_fused_add_relu_…",
//!   "op_unique_key": "te_fused_add_relu_…",
//!   "namespace": "fusion_op",
//!   "kind": "compile",
//!   "variant": "whole",
//!   "op_list": [ { "id": 1, "op_type": "Add", ... }, ... ],
//!   "options": { "kernel_meta_dir": "kernel_meta", "output_file": "te_fused_….json" }
//! }
//! ```
//!
//! `op_list` is in topological order (producers first).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::store::write_atomically;
use crate::errors::{BuildError, Result};
use crate::graph::{KernelIdentity, NodeRef, OpDesc};
use crate::types::{ArtifactVariant, TaskKind, TaskNamespace};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentOptions {
    pub kernel_meta_dir: PathBuf,
    /// File name the backend writes its primary output to, inside
    /// `kernel_meta_dir`.
    pub output_file: String,
}

impl DocumentOptions {
    pub fn output_path(&self) -> PathBuf {
        self.kernel_meta_dir.join(&self.output_file)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDocument {
    pub kernel_name: String,
    pub op_unique_key: String,
    pub namespace: TaskNamespace,
    pub kind: TaskKind,
    pub variant: ArtifactVariant,
    pub op_list: Vec<OpDesc>,
    pub options: DocumentOptions,
}

impl InputDocument {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| {
            BuildError::ContentError(format!(
                "cannot serialize input document for {}: {e}",
                self.kernel_name
            ))
        })
    }

    /// `<kernel_meta>/<stem>.input.json`
    pub fn input_path(&self) -> PathBuf {
        self.options
            .kernel_meta_dir
            .join(format!("{}.input.json", self.variant.file_stem(&self.kernel_name)))
    }
}

pub fn build_input_document(
    identity: &KernelIdentity,
    namespace: TaskNamespace,
    kind: TaskKind,
    variant: ArtifactVariant,
    nodes: &[NodeRef],
    kernel_meta_dir: &Path,
) -> Result<InputDocument> {
    let op_list = identity
        .topo_order
        .iter()
        .map(|&i| {
            nodes.get(i).map(|n| n.desc().clone()).ok_or_else(|| {
                BuildError::ContentError(format!(
                    "topological order references node #{i} of a {}-node set",
                    nodes.len()
                ))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let output_file = match kind {
        TaskKind::Compile => format!("{}.json", variant.file_stem(&identity.kernel_name)),
        TaskKind::PreCompile => format!("{}.pre.json", identity.kernel_name),
    };

    Ok(InputDocument {
        kernel_name: identity.kernel_name.clone(),
        op_unique_key: identity.op_unique_key.clone(),
        namespace,
        kind,
        variant,
        op_list,
        options: DocumentOptions {
            kernel_meta_dir: kernel_meta_dir.to_path_buf(),
            output_file,
        },
    })
}

/// Write the document to its input path, creating `kernel_meta` if needed.
pub fn dump_input_document(doc: &InputDocument) -> Result<PathBuf> {
    let bytes = doc.to_json()?;
    let dir = &doc.options.kernel_meta_dir;
    fs::create_dir_all(dir)
        .map_err(|e| {
            BuildError::ResourceError(format!("creating kernel_meta directory {:?}: {e}", dir))
        })?;

    let path = doc.input_path();
    write_atomically(&path, |out| std::io::Write::write_all(out, &bytes))
        .map_err(|e| {
            BuildError::ResourceError(format!("writing input document {:?}: {e:#}", path))
        })?;
    info!(kernel = %doc.kernel_name, path = ?path, "wrote compiler input document");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::graph::{InputDesc, InputSource, OpNode, TensorDesc, compute_kernel_identity};

    fn tensor() -> TensorDesc {
        TensorDesc {
            shape: vec![8, 16],
            dtype: "float16".into(),
            format: "ND".into(),
            ori_shape: None,
            ori_format: None,
        }
    }

    fn op(id: u64, op_type: &str, source: InputSource) -> OpDesc {
        OpDesc {
            id,
            name: format!("{op_type}_{id}"),
            op_type: op_type.into(),
            inputs: vec![InputDesc { tensor: tensor(), source }],
            outputs: vec![tensor()],
            attrs: BTreeMap::new(),
            kernel_name_override: None,
        }
    }

    #[test]
    fn op_list_follows_topological_order() {
        // Consumer listed before producer.
        let nodes = vec![
            OpNode::new(op(2, "Relu", InputSource::Node { id: 1, output: 0 })),
            OpNode::new(op(1, "Add", InputSource::External { arg: 0 })),
        ];
        let identity = compute_kernel_identity(TaskNamespace::FusionOp, &nodes).unwrap();
        let doc = build_input_document(
            &identity,
            TaskNamespace::FusionOp,
            TaskKind::Compile,
            ArtifactVariant::Whole,
            &nodes,
            Path::new("meta"),
        )
        .unwrap();

        let ids: Vec<u64> = doc.op_list.iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(
            doc.options.output_path(),
            Path::new("meta").join(format!("{}.json", identity.kernel_name))
        );
    }

    #[test]
    fn dump_writes_parseable_document() {
        let tmp = tempfile::tempdir().unwrap();
        let meta = tmp.path().join("kernel_meta");
        let nodes = vec![OpNode::new(op(1, "Add", InputSource::External { arg: 0 }))];
        let identity = compute_kernel_identity(TaskNamespace::SingleOp, &nodes).unwrap();
        let doc = build_input_document(
            &identity,
            TaskNamespace::SingleOp,
            TaskKind::PreCompile,
            ArtifactVariant::Whole,
            &nodes,
            &meta,
        )
        .unwrap();

        let path = dump_input_document(&doc).unwrap();
        assert_eq!(path, meta.join(format!("{}.input.json", identity.kernel_name)));
        let back: InputDocument = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(back, doc);
        assert!(back.options.output_file.ends_with(".pre.json"));
    }
}
