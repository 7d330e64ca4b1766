// src/graph/node.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Host-assigned node identity, unique within one graph.
pub type NodeId = u64;

/// Shared handle on a host node. The host graph owns the node; build tasks
/// only hold references to it.
pub type NodeRef = Arc<OpNode>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorDesc {
    pub shape: Vec<i64>,
    pub dtype: String,
    pub format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ori_shape: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ori_format: Option<String>,
}

/// Where an operator input comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputSource {
    /// Argument `arg` of the generated kernel.
    External { arg: usize },
    /// Output `output` of another node in the same set.
    Node { id: NodeId, output: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDesc {
    #[serde(flatten)]
    pub tensor: TensorDesc,
    pub source: InputSource,
}

/// Operator description as supplied by the host graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpDesc {
    pub id: NodeId,
    #[serde(default)]
    pub name: String,
    pub op_type: String,
    #[serde(default)]
    pub inputs: Vec<InputDesc>,
    #[serde(default)]
    pub outputs: Vec<TensorDesc>,
    #[serde(default)]
    pub attrs: BTreeMap<String, Value>,
    /// Debug/tuning annotation replacing the computed kernel name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_name_override: Option<String>,
}

impl OpDesc {
    /// Attributes that influence code generation. Keys starting with `_`
    /// are host-private annotations.
    pub fn significant_attrs(&self) -> BTreeMap<&str, &Value> {
        self.attrs
            .iter()
            .filter(|(k, _)| !k.starts_with('_'))
            .map(|(k, v)| (k.as_str(), v))
            .collect()
    }

    /// Content document used for hashing: no ids, no names, no private
    /// attributes, no input wiring (wiring is hashed structurally).
    pub fn canonical_json(&self) -> Value {
        let inputs: Vec<&TensorDesc> = self.inputs.iter().map(|i| &i.tensor).collect();
        json!({
            "op_type": self.op_type,
            "inputs": inputs,
            "outputs": self.outputs,
            "attrs": self.significant_attrs(),
        })
    }
}

/// What the coordinator writes back onto a node once its kernel is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelBinding {
    pub kernel_name: String,
    pub descriptor_path: PathBuf,
    pub binary_path: PathBuf,
    pub compile_info_key: Option<String>,
    pub compile_info_json: Option<String>,
}

#[derive(Debug)]
pub struct OpNode {
    desc: OpDesc,
    binding: RwLock<Option<KernelBinding>>,
}

impl OpNode {
    pub fn new(desc: OpDesc) -> NodeRef {
        Arc::new(Self {
            desc,
            binding: RwLock::new(None),
        })
    }

    pub fn desc(&self) -> &OpDesc {
        &self.desc
    }

    pub fn binding(&self) -> Option<KernelBinding> {
        self.binding
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn bind_kernel(&self, binding: KernelBinding) {
        *self
            .binding
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(binding);
    }
}
