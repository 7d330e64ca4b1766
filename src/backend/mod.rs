// src/backend/mod.rs

//! Compile backend abstraction.
//!
//! The coordinator talks to a `CompileBackend` instead of spawning compiler
//! processes itself. The boundary is deliberately thin: `submit` only says
//! whether a job was accepted, and results come back out of band through
//! `poll`.
//!
//! - [`document`] builds the compiler-input document handed to a backend.
//! - [`process`] provides `ProcessBackend`, which runs an external compiler
//!   command per job on a Tokio runtime.
//! - Tests plug in their own backend (see `kernelbuild-test-utils`).

pub mod document;
pub mod process;

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::{ArtifactVariant, TaskKind};

pub use document::{DocumentOptions, InputDocument, build_input_document, dump_input_document};
pub use process::ProcessBackend;

/// One unit of work for a backend.
#[derive(Debug, Clone)]
pub struct CompileJob {
    pub graph_id: u32,
    pub task_id: u32,
    pub kernel_name: String,
    pub kind: TaskKind,
    pub variant: ArtifactVariant,
    pub document: Arc<InputDocument>,
}

impl CompileJob {
    /// Where the backend is expected to leave its primary output.
    pub fn output_path(&self) -> PathBuf {
        self.document.options.output_path()
    }
}

/// Core-type and fusion-pattern selection produced by a pre-compile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreCompileOutcome {
    pub core_type: String,
    pub pattern: String,
}

/// A finished backend job, keyed by the task that submitted it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompileCompletion {
    pub graph_id: u32,
    pub task_id: u32,
    /// `0` means success.
    pub status_code: i32,
    pub result: String,
    pub info_msg: String,
    pub err_args: String,
    pub exception: String,
    /// Descriptor written by the backend; defaults to the job's output path.
    pub descriptor_path: Option<PathBuf>,
    pub pre_compile: Option<PreCompileOutcome>,
}

impl CompileCompletion {
    pub fn succeeded(&self) -> bool {
        self.status_code == 0
    }
}

/// Trait abstracting how compile jobs are executed.
///
/// Implementations must not block in either method; the coordinator calls
/// them while holding its own locks.
pub trait CompileBackend: Send {
    /// Hand a job to the backend. `false` means it was rejected and no
    /// completion will ever be reported for it.
    fn submit(&mut self, job: CompileJob) -> bool;

    /// Drain completions that arrived since the last call.
    fn poll(&mut self) -> Vec<CompileCompletion>;
}

impl<B: CompileBackend + ?Sized> CompileBackend for Box<B> {
    fn submit(&mut self, job: CompileJob) -> bool {
        (**self).submit(job)
    }

    fn poll(&mut self) -> Vec<CompileCompletion> {
        (**self).poll()
    }
}
