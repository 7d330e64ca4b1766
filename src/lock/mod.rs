// src/lock/mod.rs

//! Cross-process coordination through advisory file locks.
//!
//! - [`file_lock`] is the capability layer: non-blocking shared/exclusive
//!   locks on ordinary files, released when the guard drops.
//! - [`build_dir`] implements the "built / being built / unbuilt" protocol
//!   over the kernel cache directory.
//!
//! There is no other synchronisation between processes sharing a cache
//! directory; every cross-process guarantee reduces to these locks being
//! taken and interpreted correctly.

pub mod build_dir;
pub mod file_lock;

pub use build_dir::{BuildDirLock, BuildDirState};
pub use file_lock::{FileLocker, LockGuard, LockMode};
