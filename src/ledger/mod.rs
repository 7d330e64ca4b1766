// src/ledger/mod.rs

//! Task ledger and coordination.
//!
//! - [`task`] defines build tasks, their keys and status.
//! - [`result`] defines build results and their provenance.
//! - [`wait_queue`] holds the per-kernel single-flight wait entries.
//! - [`coordinator`] ties ledger tables, cache, build lock, prebuilt
//!   registry and backend together behind `submit` / `collect`.

pub mod coordinator;
pub mod result;
pub mod task;
pub mod wait_queue;

pub use coordinator::{CompletionRecord, Coordinator, LedgerStats};
pub use result::{BuildResult, CompileRetType};
pub use task::{BuildStrategy, BuildTask, TaskKey, TaskStatus};
pub use wait_queue::{BuilderOrigin, KernelWaitQueue, WaitEntry, WaitKey};
