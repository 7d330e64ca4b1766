// src/graph/naming.rs

//! Deterministic, content-derived kernel names.
//!
//! A kernel name must be identical for every node set with the same
//! operator types, tensors, significant attributes and fusion topology,
//! regardless of the order in which the host lists the nodes. Every cache
//! and dedup layer keys on it.
//!
//! Each node gets a structural digest computed in topological order: its
//! canonical content plus, per input slot, either the external argument
//! index or the producer's digest and output index. The kernel digest then
//! hashes the namespace and the *sorted* node digests.

use std::collections::HashMap;
use std::sync::LazyLock;

use blake3::{Hash, Hasher};
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use regex::Regex;
use tracing::{debug, warn};

use crate::errors::{BuildError, Result};
use crate::graph::node::{InputSource, NodeRef, OpDesc};
use crate::types::TaskNamespace;

/// Bumped whenever the hashing scheme changes, invalidating old caches.
const NAMING_SCHEME: &[u8] = b"kernelbuild-name-v1";

/// Longest op-type segment embedded in a fused kernel name.
const MAX_TYPE_SEGMENT: usize = 48;

static KERNEL_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("kernel name regex is valid"));

/// Names end up as file stems in the shared cache directory.
pub fn is_valid_kernel_name(name: &str) -> bool {
    name.len() <= 255 && KERNEL_NAME_RE.is_match(name)
}

/// Result of naming a node set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelIdentity {
    /// Name used for dedup and caching (may be an override).
    pub kernel_name: String,
    /// The computed name, kept even when overridden.
    pub op_unique_key: String,
    /// Indices into the input node slice, producers before consumers.
    pub topo_order: Vec<usize>,
}

/// Compute the kernel identity of `nodes` within `namespace`.
pub fn compute_kernel_identity(
    namespace: TaskNamespace,
    nodes: &[NodeRef],
) -> Result<KernelIdentity> {
    let descs: Vec<&OpDesc> = nodes.iter().map(|n| n.desc()).collect();

    if descs.is_empty() {
        return Err(BuildError::ContentError("node set is empty".to_string()));
    }
    if namespace == TaskNamespace::SingleOp && descs.len() != 1 {
        return Err(BuildError::ContentError(format!(
            "single-op build expects exactly one node (got {})",
            descs.len()
        )));
    }

    let topology = Topology::build(&descs)?;
    let digests = node_digests(&descs, &topology)?;

    let mut sorted: Vec<&Hash> = digests.iter().collect();
    sorted.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));

    let mut hasher = Hasher::new();
    hasher.update(NAMING_SCHEME);
    hasher.update(namespace.as_str().as_bytes());
    for digest in sorted {
        hasher.update(digest.as_bytes());
    }
    let hex = hasher.finalize().to_hex();

    let computed = match namespace {
        TaskNamespace::SingleOp => format!("{}_{}", snake_case(&descs[0].op_type), hex),
        TaskNamespace::FusionOp => {
            format!("te_fused_{}_{}", fused_type_segment(&descs, &topology, &digests), hex)
        }
        TaskNamespace::TaskFusion => format!("task_fusion_{hex}"),
    };

    if !is_valid_kernel_name(&computed) {
        return Err(BuildError::ContentError(format!(
            "op type(s) do not yield a usable kernel name: {computed}"
        )));
    }

    let kernel_name = match override_for(&descs)? {
        Some(name) => {
            debug!(
                kernel = %name,
                op_unique_key = %computed,
                "kernel name overridden by annotation"
            );
            name
        }
        None => computed.clone(),
    };

    Ok(KernelIdentity {
        kernel_name,
        op_unique_key: computed,
        topo_order: topology.order,
    })
}

/// Producer→consumer graph of a node set, checked for dangling references
/// and cycles.
struct Topology {
    index: HashMap<u64, usize>,
    graph: DiGraphMap<usize, ()>,
    order: Vec<usize>,
}

impl Topology {
    fn build(descs: &[&OpDesc]) -> Result<Self> {
        let mut index = HashMap::with_capacity(descs.len());
        let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();

        for (i, desc) in descs.iter().enumerate() {
            if desc.op_type.trim().is_empty() {
                return Err(BuildError::ContentError(format!(
                    "node {} has an empty op_type",
                    desc.id
                )));
            }
            if index.insert(desc.id, i).is_some() {
                return Err(BuildError::ContentError(format!("node id {} appears twice", desc.id)));
            }
            graph.add_node(i);
        }

        for (i, desc) in descs.iter().enumerate() {
            for input in &desc.inputs {
                if let InputSource::Node { id, output } = input.source {
                    let producer = *index.get(&id).ok_or_else(|| {
                        BuildError::ContentError(format!(
                            "node {} reads from node {id}, which is not part of the set",
                            desc.id
                        ))
                    })?;
                    if output >= descs[producer].outputs.len() {
                        return Err(BuildError::ContentError(format!(
                            "node {} reads output {output} of node {id}, which has {} outputs",
                            desc.id,
                            descs[producer].outputs.len()
                        )));
                    }
                    graph.add_edge(producer, i, ());
                }
            }
        }

        let order = toposort(&graph, None).map_err(|cycle| {
            BuildError::ContentError(format!(
                "fusion topology has a cycle through node {}",
                descs[cycle.node_id()].id
            ))
        })?;

        Ok(Self { index, graph, order })
    }

    /// Longest path from any source node, per node.
    fn depths(&self) -> Vec<usize> {
        let mut depth = vec![0usize; self.order.len()];
        for &node in &self.order {
            let d = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .map(|p| depth[p] + 1)
                .max()
                .unwrap_or(0);
            depth[node] = d;
        }
        depth
    }
}

fn node_digests(descs: &[&OpDesc], topology: &Topology) -> Result<Vec<Hash>> {
    let mut digests: Vec<Option<Hash>> = vec![None; descs.len()];

    for &i in &topology.order {
        let desc = descs[i];
        let mut hasher = Hasher::new();
        hasher.update(&serde_json::to_vec(&desc.canonical_json())?);

        for (slot, input) in desc.inputs.iter().enumerate() {
            match input.source {
                InputSource::External { arg } => {
                    hasher.update(format!("|in{slot}:ext:{arg}").as_bytes());
                }
                InputSource::Node { id, output } => {
                    let producer = topology.index[&id];
                    let upstream = digests[producer].ok_or_else(|| {
                        BuildError::ContentError(format!(
                            "node {id} was not ordered before node {}",
                            desc.id
                        ))
                    })?;
                    hasher.update(format!("|in{slot}:node:{output}:").as_bytes());
                    hasher.update(upstream.as_bytes());
                }
            }
        }

        digests[i] = Some(hasher.finalize());
    }

    digests
        .into_iter()
        .enumerate()
        .map(|(i, d)| {
            d.ok_or_else(|| {
                BuildError::ContentError(format!("node {} has no digest", descs[i].id))
            })
        })
        .collect()
}

/// Human-readable op-type part of a fused kernel name, ordered by depth so
/// it does not depend on host node order.
fn fused_type_segment(descs: &[&OpDesc], topology: &Topology, digests: &[Hash]) -> String {
    let depths = topology.depths();
    let mut ranked: Vec<(usize, String, &[u8; 32])> = descs
        .iter()
        .enumerate()
        .map(|(i, d)| (depths[i], snake_case(&d.op_type), digests[i].as_bytes()))
        .collect();
    ranked.sort();

    let mut segment = ranked
        .into_iter()
        .map(|(_, name, _)| name)
        .collect::<Vec<_>>()
        .join("_");
    if segment.len() > MAX_TYPE_SEGMENT {
        segment.truncate(MAX_TYPE_SEGMENT);
        while segment.ends_with('_') {
            segment.pop();
        }
    }
    segment
}

fn override_for(descs: &[&OpDesc]) -> Result<Option<String>> {
    let overrides: Vec<&str> = descs
        .iter()
        .filter_map(|d| d.kernel_name_override.as_deref())
        .collect();

    match (descs.len(), overrides.as_slice()) {
        (_, []) => Ok(None),
        (1, [name]) => {
            if is_valid_kernel_name(name) {
                Ok(Some(name.to_string()))
            } else {
                Err(BuildError::ContentError(format!("invalid kernel name override: {name:?}")))
            }
        }
        _ => {
            warn!(
                count = overrides.len(),
                "kernel name overrides only apply to single nodes; ignoring"
            );
            Ok(None)
        }
    }
}

/// `MatMulV2` → `mat_mul_v2`; anything outside `[A-Za-z0-9]` becomes `_`.
fn snake_case(op_type: &str) -> String {
    let mut out = String::with_capacity(op_type.len() + 4);
    let mut prev_lower_or_digit = false;
    for ch in op_type.chars() {
        if ch.is_ascii_uppercase() {
            if prev_lower_or_digit {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
            prev_lower_or_digit = false;
        } else if ch.is_ascii_alphanumeric() {
            out.push(ch);
            prev_lower_or_digit = true;
        } else {
            if !out.ends_with('_') {
                out.push('_');
            }
            prev_lower_or_digit = false;
        }
    }
    out.trim_matches('_').to_string()
}
