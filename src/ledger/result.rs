// src/ledger/result.rs

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::{CompileCompletion, PreCompileOutcome};
use crate::cache::{CompileInfo, CompiledArtifact, PreCompileEntry};

/// Where a result came from. Only `Online` results are written to the
/// disk cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompileRetType {
    /// Fresh compile by this process.
    #[default]
    Online,
    /// Result cache, another task's build, or another process's build.
    Cache,
    /// Installed prebuilt kernel.
    Binary,
}

impl fmt::Display for CompileRetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompileRetType::Online => "online",
            CompileRetType::Cache => "cache",
            CompileRetType::Binary => "binary",
        };
        f.write_str(s)
    }
}

/// Outcome of one compile or pre-compile.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildResult {
    /// `0` means success.
    pub status_code: i32,
    pub result: String,
    pub info_msg: String,
    /// Raw backend diagnostics, for error reporting only.
    pub err_args: String,
    pub exception: String,
    pub compile_ret_type: CompileRetType,
    pub artifact: Option<Arc<CompiledArtifact>>,
    pub compile_info: Option<CompileInfo>,
    pub pre_compile: Option<PreCompileOutcome>,
}

impl BuildResult {
    pub fn is_success(&self) -> bool {
        self.status_code == 0
    }

    fn with_artifact(artifact: Arc<CompiledArtifact>, ret: CompileRetType) -> Self {
        Self {
            result: "SUCCESS".to_string(),
            compile_ret_type: ret,
            compile_info: artifact.compile_info().cloned(),
            artifact: Some(artifact),
            ..Self::default()
        }
    }

    pub fn online(artifact: Arc<CompiledArtifact>, info_msg: String) -> Self {
        Self {
            info_msg,
            ..Self::with_artifact(artifact, CompileRetType::Online)
        }
    }

    pub fn from_cache(artifact: Arc<CompiledArtifact>) -> Self {
        Self::with_artifact(artifact, CompileRetType::Cache)
    }

    pub fn from_binary(artifact: Arc<CompiledArtifact>) -> Self {
        Self::with_artifact(artifact, CompileRetType::Binary)
    }

    pub fn precompiled(outcome: PreCompileOutcome, ret: CompileRetType, info_msg: String) -> Self {
        Self {
            result: "SUCCESS".to_string(),
            info_msg,
            compile_ret_type: ret,
            pre_compile: Some(outcome),
            ..Self::default()
        }
    }

    pub fn from_precompile_cache(entry: PreCompileEntry) -> Self {
        let outcome = PreCompileOutcome {
            core_type: entry.core_type,
            pattern: entry.pattern,
        };
        Self::precompiled(outcome, CompileRetType::Cache, String::new())
    }

    /// A failure produced locally (no backend diagnostics).
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status_code: 1,
            result: "FAILED".to_string(),
            info_msg: message.into(),
            ..Self::default()
        }
    }

    /// A backend-reported failure, diagnostics preserved.
    pub fn backend_failure(completion: CompileCompletion) -> Self {
        Self {
            status_code: if completion.status_code == 0 { 1 } else { completion.status_code },
            result: completion.result,
            info_msg: completion.info_msg,
            err_args: completion.err_args,
            exception: completion.exception,
            ..Self::default()
        }
    }

    /// The same result as seen by a task that waited on someone else's build.
    pub fn as_coalesced(&self) -> Self {
        let mut copy = self.clone();
        if copy.compile_ret_type == CompileRetType::Online {
            copy.compile_ret_type = CompileRetType::Cache;
        }
        copy
    }

    /// Human-readable failure summary.
    pub fn error_message(&self) -> Option<String> {
        if self.is_success() {
            return None;
        }
        let mut msg = format!("status {}", self.status_code);
        for part in [&self.info_msg, &self.exception] {
            if !part.is_empty() {
                msg.push_str(": ");
                msg.push_str(part);
            }
        }
        Some(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesced_copy_is_attributed_to_cache() {
        let outcome = PreCompileOutcome {
            core_type: "AiCore".into(),
            pattern: "Opaque".into(),
        };
        let online = BuildResult::precompiled(outcome, CompileRetType::Online, String::new());
        assert_eq!(online.as_coalesced().compile_ret_type, CompileRetType::Cache);

        let binary = BuildResult {
            compile_ret_type: CompileRetType::Binary,
            ..BuildResult::default()
        };
        assert_eq!(binary.as_coalesced().compile_ret_type, CompileRetType::Binary);
    }

    #[test]
    fn backend_failure_keeps_diagnostics() {
        let completion = CompileCompletion {
            status_code: 2,
            info_msg: "tiling failed".into(),
            exception: "Traceback".into(),
            err_args: "--op Add".into(),
            ..CompileCompletion::default()
        };
        let result = BuildResult::backend_failure(completion);
        assert!(!result.is_success());
        assert_eq!(result.err_args, "--op Add");
        assert_eq!(result.error_message().unwrap(), "status 2: tiling failed: Traceback");
    }
}
