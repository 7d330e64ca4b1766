// src/ledger/wait_queue.rs

//! Single-flight wait queues.
//!
//! One entry per kernel that is being produced right now. The first task to
//! miss the cache opens the entry and becomes its builder; identical
//! requests arriving while the entry exists join it. When the build
//! finishes the entry is resolved and removed in one step, so a kernel name
//! is never in flight twice.
//!
//! Entries are keyed per namespace, task kind and artifact variant. Compile
//! and pre-compile requests for the same kernel never share an entry.

use std::collections::HashMap;

use crate::errors::{BuildError, Result};
use crate::ledger::result::BuildResult;
use crate::ledger::task::TaskKey;
use crate::types::{ArtifactVariant, TaskKind, TaskNamespace};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WaitKey {
    pub namespace: TaskNamespace,
    pub kind: TaskKind,
    pub variant: ArtifactVariant,
    pub kernel_name: String,
}

/// Who is producing the result a wait entry is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderOrigin {
    /// A task of this process, dispatched to our backend.
    Local(TaskKey),
    /// Another process holds the build lock.
    External,
}

#[derive(Debug, Clone)]
pub struct WaitEntry {
    pub origin: BuilderOrigin,
    /// Set only once, when the entry is resolved.
    pub result: Option<BuildResult>,
    /// Every task waiting on this kernel, the builder included.
    pub waiters: Vec<TaskKey>,
}

#[derive(Debug, Default)]
pub struct KernelWaitQueue {
    entries: HashMap<WaitKey, WaitEntry>,
}

impl KernelWaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &WaitKey) -> Option<&WaitEntry> {
        self.entries.get(key)
    }

    /// Append `waiter` to an in-flight entry. Returns `false` if there is
    /// no entry for `key`.
    pub fn join(&mut self, key: &WaitKey, waiter: TaskKey) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                if !entry.waiters.contains(&waiter) {
                    entry.waiters.push(waiter);
                }
                true
            }
            None => false,
        }
    }

    /// Open a fresh entry with `first` as its only waiter.
    pub fn open(&mut self, key: WaitKey, origin: BuilderOrigin, first: TaskKey) -> Result<()> {
        if self.entries.contains_key(&key) {
            return Err(BuildError::CoordinationError(format!(
                "duplicate wait entry for kernel {} ({})",
                key.kernel_name, key.namespace
            )));
        }
        self.entries.insert(
            key,
            WaitEntry {
                origin,
                result: None,
                waiters: vec![first],
            },
        );
        Ok(())
    }

    /// Make `builder` the local builder of an entry, joining it if needed.
    pub fn promote(&mut self, key: &WaitKey, builder: TaskKey) -> Result<()> {
        let entry = self.entries.get_mut(key).ok_or_else(|| {
            BuildError::CoordinationError(format!(
                "no wait entry to promote for kernel {}",
                key.kernel_name
            ))
        })?;
        entry.origin = BuilderOrigin::Local(builder);
        if !entry.waiters.contains(&builder) {
            entry.waiters.insert(0, builder);
        }
        Ok(())
    }

    /// Attach the result and remove the entry.
    pub fn resolve(&mut self, key: &WaitKey, result: BuildResult) -> Option<WaitEntry> {
        let mut entry = self.entries.remove(key)?;
        entry.result = Some(result);
        Some(entry)
    }

    /// Entries currently waiting on another process.
    pub fn external_keys(&self) -> Vec<WaitKey> {
        self.entries
            .iter()
            .filter(|(_, e)| e.origin == BuilderOrigin::External)
            .map(|(k, _)| k.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(kernel: &str) -> WaitKey {
        WaitKey {
            namespace: TaskNamespace::SingleOp,
            kind: TaskKind::Compile,
            variant: ArtifactVariant::Whole,
            kernel_name: kernel.to_string(),
        }
    }

    #[test]
    fn join_requires_open_entry() {
        let mut queue = KernelWaitQueue::new();
        assert!(!queue.join(&key("k"), TaskKey::new(1, 1)));

        queue.open(key("k"), BuilderOrigin::Local(TaskKey::new(1, 1)), TaskKey::new(1, 1)).unwrap();
        assert!(queue.join(&key("k"), TaskKey::new(1, 2)));
        assert!(queue.join(&key("k"), TaskKey::new(1, 2)));
        assert_eq!(queue.get(&key("k")).unwrap().waiters.len(), 2);
    }

    #[test]
    fn second_open_is_a_coordination_error() {
        let mut queue = KernelWaitQueue::new();
        queue.open(key("k"), BuilderOrigin::External, TaskKey::new(1, 1)).unwrap();
        let err = queue.open(key("k"), BuilderOrigin::External, TaskKey::new(1, 2)).unwrap_err();
        assert!(!err.is_task_local());
    }

    #[test]
    fn namespaces_and_kinds_do_not_share_entries() {
        let mut queue = KernelWaitQueue::new();
        queue.open(key("k"), BuilderOrigin::External, TaskKey::new(1, 1)).unwrap();

        let fused = WaitKey {
            namespace: TaskNamespace::FusionOp,
            ..key("k")
        };
        let pre = WaitKey {
            kind: TaskKind::PreCompile,
            ..key("k")
        };
        assert!(!queue.join(&fused, TaskKey::new(1, 2)));
        assert!(!queue.join(&pre, TaskKey::new(1, 3)));
    }

    #[test]
    fn resolve_removes_entry_and_promote_reorders_builder() {
        let mut queue = KernelWaitQueue::new();
        queue.open(key("k"), BuilderOrigin::External, TaskKey::new(1, 1)).unwrap();
        queue.join(&key("k"), TaskKey::new(1, 2));
        assert_eq!(queue.external_keys(), vec![key("k")]);

        queue.promote(&key("k"), TaskKey::new(1, 2)).unwrap();
        assert!(queue.external_keys().is_empty());
        assert_eq!(queue.get(&key("k")).unwrap().origin, BuilderOrigin::Local(TaskKey::new(1, 2)));

        let entry = queue.resolve(&key("k"), BuildResult::failed("x")).unwrap();
        assert!(entry.result.is_some());
        assert!(queue.is_empty());
        assert!(queue.resolve(&key("k"), BuildResult::failed("x")).is_none());
    }
}
