#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kernelbuild::config::{Config, RawConfigFile};
use kernelbuild::graph::{InputDesc, InputSource, NodeId, NodeRef, OpDesc, OpNode, TensorDesc};
use kernelbuild::types::CacheMode;
use serde_json::Value;

/// Builder for `Config` rooted in a test directory.
///
/// Defaults: cache under `<root>/cache`, kernel_meta under `<root>/meta`,
/// 1 ms poll interval, 10 s wait timeout, no binary registry.
pub struct ConfigBuilder {
    raw: RawConfigFile,
}

impl ConfigBuilder {
    pub fn new(root: &Path) -> Self {
        let mut raw = RawConfigFile::default();
        raw.cache.dir = root.join("cache");
        raw.build.kernel_meta_dir = root.join("meta");
        raw.build.poll_interval_ms = 1;
        raw.build.wait_timeout_secs = 10;
        Self { raw }
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.raw.cache.dir = dir.into();
        self
    }

    pub fn kernel_meta_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.raw.build.kernel_meta_dir = dir.into();
        self
    }

    pub fn mode(mut self, mode: CacheMode) -> Self {
        self.raw.cache.mode = mode;
        self
    }

    pub fn max_size_mb(mut self, mb: u64) -> Self {
        self.raw.cache.max_size_mb = mb;
        self
    }

    pub fn registry(mut self, path: impl Into<PathBuf>) -> Self {
        self.raw.binary.registry = Some(path.into());
        self
    }

    pub fn binary_enabled(mut self, enabled: bool) -> Self {
        self.raw.binary.enabled = enabled;
        self
    }

    pub fn wait_timeout_secs(mut self, secs: u64) -> Self {
        self.raw.build.wait_timeout_secs = secs;
        self
    }

    pub fn build(self) -> Config {
        Config::try_from(self.raw).expect("Failed to build valid config from builder")
    }
}

pub fn tensor(shape: &[i64], dtype: &str) -> TensorDesc {
    TensorDesc {
        shape: shape.to_vec(),
        dtype: dtype.to_string(),
        format: "ND".to_string(),
        ori_shape: None,
        ori_format: None,
    }
}

/// Builder for `OpDesc`. Every input and output uses the builder's current
/// tensor shape and dtype.
pub struct OpDescBuilder {
    desc: OpDesc,
    shape: Vec<i64>,
    dtype: String,
}

impl OpDescBuilder {
    pub fn new(id: NodeId, op_type: &str) -> Self {
        Self {
            desc: OpDesc {
                id,
                name: format!("{}_{id}", op_type.to_lowercase()),
                op_type: op_type.to_string(),
                inputs: vec![],
                outputs: vec![],
                attrs: BTreeMap::new(),
                kernel_name_override: None,
            },
            shape: vec![16, 16],
            dtype: "float16".to_string(),
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.desc.name = name.to_string();
        self
    }

    pub fn shape(mut self, shape: &[i64]) -> Self {
        self.shape = shape.to_vec();
        self
    }

    pub fn dtype(mut self, dtype: &str) -> Self {
        self.dtype = dtype.to_string();
        self
    }

    pub fn external_input(mut self, arg: usize) -> Self {
        self.desc.inputs.push(InputDesc {
            tensor: tensor(&self.shape, &self.dtype),
            source: InputSource::External { arg },
        });
        self
    }

    pub fn input_from(mut self, producer: NodeId, output: usize) -> Self {
        self.desc.inputs.push(InputDesc {
            tensor: tensor(&self.shape, &self.dtype),
            source: InputSource::Node { id: producer, output },
        });
        self
    }

    pub fn output(mut self) -> Self {
        self.desc.outputs.push(tensor(&self.shape, &self.dtype));
        self
    }

    pub fn attr(mut self, key: &str, value: Value) -> Self {
        self.desc.attrs.insert(key.to_string(), value);
        self
    }

    pub fn kernel_name_override(mut self, name: &str) -> Self {
        self.desc.kernel_name_override = Some(name.to_string());
        self
    }

    pub fn build(self) -> OpDesc {
        self.desc
    }

    pub fn node(self) -> NodeRef {
        OpNode::new(self.build())
    }
}

/// A one-input, one-output elementwise op.
pub fn unary_op(id: NodeId, op_type: &str) -> OpDesc {
    OpDescBuilder::new(id, op_type).external_input(0).output().build()
}

/// `Add(arg0, arg1) -> Relu`, with the nodes listed in the given order.
pub fn add_relu(add_id: NodeId, relu_id: NodeId, relu_first: bool) -> Vec<NodeRef> {
    let add = OpDescBuilder::new(add_id, "Add")
        .external_input(0)
        .external_input(1)
        .output()
        .node();
    let relu = OpDescBuilder::new(relu_id, "Relu")
        .input_from(add_id, 0)
        .output()
        .node();
    if relu_first { vec![relu, add] } else { vec![add, relu] }
}
