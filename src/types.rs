// src/types.rs

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How the result cache participates in a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    /// Look up and store results (default).
    #[default]
    Enable,
    /// Never read or write the cache; every lookup misses.
    Disable,
    /// Skip lookups but still store fresh results, refreshing the cache.
    Force,
}

impl CacheMode {
    pub fn reads(self) -> bool {
        matches!(self, CacheMode::Enable)
    }

    pub fn writes(self) -> bool {
        !matches!(self, CacheMode::Disable)
    }
}

impl FromStr for CacheMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "enable" => Ok(CacheMode::Enable),
            "disable" => Ok(CacheMode::Disable),
            "force" => Ok(CacheMode::Force),
            other => Err(format!(
                "invalid cache mode: {other} (expected \"enable\", \"disable\" or \"force\")"
            )),
        }
    }
}

/// Independent single-flight namespaces.
///
/// Kernel names carry a namespace-specific prefix, so the same name never
/// appears in two namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskNamespace {
    #[default]
    SingleOp,
    FusionOp,
    TaskFusion,
}

impl TaskNamespace {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskNamespace::SingleOp => "single_op",
            TaskNamespace::FusionOp => "fusion_op",
            TaskNamespace::TaskFusion => "task_fusion",
        }
    }
}

impl fmt::Display for TaskNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a task asks the backend to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// A kernel binary plus its descriptor.
    #[default]
    Compile,
    /// Core-type and fusion-pattern selection only.
    PreCompile,
}

/// Which artifact flavour a compile produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactVariant {
    #[default]
    Whole,
    /// Split (multi-binary) kernels stored under `<kernel>_split`.
    Split,
}

impl ArtifactVariant {
    /// File stem used for this variant of `kernel`.
    pub fn file_stem(self, kernel: &str) -> String {
        match self {
            ArtifactVariant::Whole => kernel.to_string(),
            ArtifactVariant::Split => format!("{kernel}_split"),
        }
    }
}
