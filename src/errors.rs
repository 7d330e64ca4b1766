// src/errors.rs

//! Crate-wide error type and result alias.
//!
//! The variants follow the failure taxonomy of the build coordinator:
//! content and resource errors fail a single task, coordination errors fail
//! a whole collection cycle, backend errors are carried inside
//! [`BuildResult`](crate::ledger::BuildResult) and only surface here when a
//! backend cannot be driven at all.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid node set: {0}")]
    ContentError(String),

    #[error("Resource error: {0}")]
    ResourceError(String),

    #[error("Coordination error: {0}")]
    CoordinationError(String),

    #[error("Backend error: {0}")]
    BackendError(String),

    #[error("Duplicate task: graph {graph_id}, task {task_id}")]
    DuplicateTask { graph_id: u32, task_id: u32 },

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BuildError {
    /// Whether this error only concerns the task that triggered it.
    ///
    /// Coordination errors mean a ledger invariant was about to be broken
    /// and are never task-local.
    pub fn is_task_local(&self) -> bool {
        !matches!(self, BuildError::CoordinationError(_))
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, BuildError>;
