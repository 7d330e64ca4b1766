// src/graph/mod.rs

//! Read model of the host graph.
//!
//! - [`node`] holds operator descriptions and the write-back slot the
//!   coordinator fills once a kernel is bound to a node.
//! - [`naming`] derives deterministic kernel names from node sets.

pub mod naming;
pub mod node;

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::errors::Result;
use crate::types::{TaskKind, TaskNamespace};

pub use naming::{KernelIdentity, compute_kernel_identity, is_valid_kernel_name};
pub use node::{InputDesc, InputSource, KernelBinding, NodeId, NodeRef, OpDesc, OpNode, TensorDesc};

/// On-disk description of one build request, as consumed by the CLI.
///
/// ```json
/// { "namespace": "fusion_op", "nodes": [ { "id": 1, "op_type": "Add", ... } ] }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct NodeSetFile {
    #[serde(default)]
    pub namespace: TaskNamespace,
    #[serde(default)]
    pub kind: TaskKind,
    pub nodes: Vec<OpDesc>,
}

impl NodeSetFile {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading node set {:?}", path))?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Wrap every description into a shared host node.
    pub fn into_nodes(self) -> Vec<NodeRef> {
        self.nodes.into_iter().map(OpNode::new).collect()
    }
}
