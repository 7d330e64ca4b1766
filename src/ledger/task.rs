// src/ledger/task.rs

use std::fmt;
use std::sync::Arc;

use crate::backend::InputDocument;
use crate::graph::{NodeRef, OpDesc};
use crate::ledger::result::BuildResult;
use crate::types::{ArtifactVariant, TaskKind, TaskNamespace};

/// Caller-assigned task identity, unique per submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    pub graph_id: u32,
    pub task_id: u32,
}

impl TaskKey {
    pub fn new(graph_id: u32, task_id: u32) -> Self {
        Self { graph_id, task_id }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.graph_id, self.task_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskStatus {
    #[default]
    Pending,
    Succeeded,
    Failed,
    /// Finished without producing anything to report (dump-only).
    CompletedDoNotPersist,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Pending)
    }
}

/// Per-submission knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildStrategy {
    /// Consult the prebuilt registry for single-op tasks.
    pub reuse_binary: bool,
    /// Only write the compiler-input document; never compile.
    pub dump_only: bool,
}

impl Default for BuildStrategy {
    fn default() -> Self {
        Self {
            reuse_binary: true,
            dump_only: false,
        }
    }
}

/// One request to produce a kernel or a pre-compile result.
#[derive(Debug, Clone)]
pub struct BuildTask {
    key: TaskKey,
    namespace: TaskNamespace,
    kind: TaskKind,
    variant: ArtifactVariant,
    nodes: Vec<NodeRef>,
    kernel_name: String,
    op_unique_key: String,
    document: Option<Arc<InputDocument>>,
    status: TaskStatus,
    result: Option<BuildResult>,
}

impl BuildTask {
    pub fn new(graph_id: u32, task_id: u32, namespace: TaskNamespace, nodes: Vec<NodeRef>) -> Self {
        Self {
            key: TaskKey::new(graph_id, task_id),
            namespace,
            kind: TaskKind::Compile,
            variant: ArtifactVariant::Whole,
            nodes,
            kernel_name: String::new(),
            op_unique_key: String::new(),
            document: None,
            status: TaskStatus::Pending,
            result: None,
        }
    }

    pub fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_variant(mut self, variant: ArtifactVariant) -> Self {
        self.variant = variant;
        self
    }

    pub fn key(&self) -> TaskKey {
        self.key
    }

    pub fn namespace(&self) -> TaskNamespace {
        self.namespace
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn variant(&self) -> ArtifactVariant {
        self.variant
    }

    pub fn nodes(&self) -> &[NodeRef] {
        &self.nodes
    }

    /// The operator description of a single-node task.
    pub fn op_desc(&self) -> Option<&OpDesc> {
        match self.nodes.as_slice() {
            [node] => Some(node.desc()),
            _ => None,
        }
    }

    pub fn kernel_name(&self) -> &str {
        &self.kernel_name
    }

    pub fn op_unique_key(&self) -> &str {
        &self.op_unique_key
    }

    pub fn document(&self) -> Option<&Arc<InputDocument>> {
        self.document.as_ref()
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn result(&self) -> Option<&BuildResult> {
        self.result.as_ref()
    }

    pub(crate) fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.result = None;
        self.document = None;
    }

    pub(crate) fn set_identity(&mut self, kernel_name: String, op_unique_key: String) {
        self.kernel_name = kernel_name;
        self.op_unique_key = op_unique_key;
    }

    pub(crate) fn attach_document(&mut self, document: Arc<InputDocument>) {
        self.document = Some(document);
    }

    pub(crate) fn mark_do_not_persist(&mut self) {
        self.status = TaskStatus::CompletedDoNotPersist;
    }

    /// Record the final result and write the kernel back onto the nodes.
    pub(crate) fn complete(&mut self, result: BuildResult) {
        self.status = if result.is_success() {
            TaskStatus::Succeeded
        } else {
            TaskStatus::Failed
        };
        if let Some(artifact) = result.artifact.as_ref().filter(|_| result.is_success()) {
            let binding = artifact.binding();
            for node in &self.nodes {
                node.bind_kernel(binding.clone());
            }
        }
        self.result = Some(result);
    }
}
