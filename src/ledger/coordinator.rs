// src/ledger/coordinator.rs

//! The process-wide build coordinator.
//!
//! Submission resolves a task as cheaply as possible, in this order:
//!
//! 1. prebuilt registry (single-op tasks only)
//! 2. an in-flight build of the same kernel in this process (coalesce)
//! 3. the result cache, behind the cross-process build lock
//! 4. a fresh dispatch to the backend
//!
//! Two mutexes: `ledger` guards every table, `backend` serializes calls into
//! the backend. Lock order is ledger → backend. `collect` polls the backend
//! first and releases it before taking the ledger, so the two never
//! deadlock. Nothing here blocks except [`Coordinator::wait_all_finished`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::backend::{
    CompileBackend, CompileCompletion, CompileJob, InputDocument, build_input_document,
    dump_input_document,
};
use crate::binary::PrebuiltRegistry;
use crate::cache::{CacheStore, CompiledArtifact, PreCompileEntry};
use crate::config::{CacheSettings, Config};
use crate::errors::{BuildError, Result};
use crate::graph::compute_kernel_identity;
use crate::ledger::result::{BuildResult, CompileRetType};
use crate::ledger::task::{BuildStrategy, BuildTask, TaskKey, TaskStatus};
use crate::ledger::wait_queue::{BuilderOrigin, KernelWaitQueue, WaitEntry, WaitKey};
use crate::lock::{BuildDirLock, BuildDirState};
use crate::types::{CacheMode, TaskKind, TaskNamespace};

/// One finished task, as handed back to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRecord {
    pub graph_id: u32,
    pub task_id: u32,
    pub kernel_name: String,
    pub op_unique_key: String,
    pub status: TaskStatus,
    pub status_code: i32,
    pub compile_ret_type: CompileRetType,
    pub outcome: BuildResult,
}

impl CompletionRecord {
    fn from_task(task: &BuildTask) -> Self {
        let outcome = task
            .result()
            .cloned()
            .unwrap_or_else(|| BuildResult::failed("task finished without a result"));
        let key = task.key();
        Self {
            graph_id: key.graph_id,
            task_id: key.task_id,
            kernel_name: task.kernel_name().to_string(),
            op_unique_key: task.op_unique_key().to_string(),
            status: task.status(),
            status_code: outcome.status_code,
            compile_ret_type: outcome.compile_ret_type,
            outcome,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerStats {
    pub dispatched: usize,
    pub finished: usize,
    pub reported: usize,
    pub in_flight_kernels: usize,
    pub held_build_locks: usize,
    pub retired_subsystems: usize,
}

/// Cache store and build lock over one cache directory.
#[derive(Debug)]
struct CacheSubsystem {
    settings: CacheSettings,
    store: CacheStore,
    build_lock: BuildDirLock,
}

impl CacheSubsystem {
    fn open(settings: CacheSettings) -> Result<Self> {
        let store = CacheStore::open(settings.clone())?;
        let build_lock = BuildDirLock::new(store.kernel_dir());
        Ok(Self {
            settings,
            store,
            build_lock,
        })
    }

    /// A disabled cache has no shared directory to lock.
    fn locks_enabled(&self) -> bool {
        self.settings.mode != CacheMode::Disable
    }

    /// Trim the cache back under its size budget after a publish. Entries
    /// whose build lock this process still holds are kept.
    fn enforce_budget(&self) {
        if self.settings.max_bytes == 0 {
            return;
        }
        match self.store.evict_to_budget() {
            Ok(report) if report.evicted > 0 => debug!(
                evicted = report.evicted,
                bytes_after = report.bytes_after,
                "cache trimmed after publish"
            ),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "cache eviction after publish failed"),
        }
    }
}

/// A task waiting for a result, plus what it needs to finish.
#[derive(Debug)]
struct InFlight {
    task: BuildTask,
    wait_key: WaitKey,
    subsystem: Arc<CacheSubsystem>,
}

#[derive(Debug)]
struct Ledger {
    config: Config,
    config_changed: bool,
    subsystem: Arc<CacheSubsystem>,
    retired: Vec<Arc<CacheSubsystem>>,
    queue: KernelWaitQueue,
    dispatched: HashMap<TaskKey, InFlight>,
    finished: BTreeMap<u32, BTreeMap<u32, BuildTask>>,
    reported: HashSet<TaskKey>,
}

impl Ledger {
    fn knows(&self, key: TaskKey) -> bool {
        self.dispatched.contains_key(&key)
            || self.reported.contains(&key)
            || self
                .finished
                .get(&key.graph_id)
                .is_some_and(|tasks| tasks.contains_key(&key.task_id))
    }

    fn file_finished(&mut self, task: BuildTask) {
        debug_assert!(task.status().is_terminal(), "filing unfinished task {}", task.key());
        let key = task.key();
        self.finished
            .entry(key.graph_id)
            .or_default()
            .insert(key.task_id, task);
    }

    fn file_in_flight(
        &mut self,
        mut task: BuildTask,
        document: Arc<InputDocument>,
        wait_key: WaitKey,
        subsystem: Arc<CacheSubsystem>,
    ) {
        task.attach_document(document);
        self.dispatched.insert(
            task.key(),
            InFlight {
                task,
                wait_key,
                subsystem,
            },
        );
    }

    fn has_outstanding(&self, graph_id: u32) -> bool {
        self.finished.contains_key(&graph_id)
            || self.dispatched.keys().any(|k| k.graph_id == graph_id)
    }

    /// Swap in a new cache subsystem if the cache settings changed since the
    /// last submission. In-flight tasks keep the one they started with.
    fn refresh_subsystem(&mut self) -> Result<()> {
        if !self.config_changed {
            return Ok(());
        }
        let wanted = self.config.cache_settings();
        if wanted != self.subsystem.settings {
            let fresh = Arc::new(CacheSubsystem::open(wanted)?);
            let old = std::mem::replace(&mut self.subsystem, fresh);
            info!(
                old_dir = ?old.settings.dir,
                new_dir = ?self.subsystem.settings.dir,
                mode = ?self.subsystem.settings.mode,
                "cache subsystem refreshed after configuration change"
            );
            self.retired.push(old);
        }
        self.config_changed = false;
        Ok(())
    }

    /// Hand every finished task of `graph_id` back, each key at most once.
    fn drain_reports(&mut self, graph_id: u32) -> Vec<CompletionRecord> {
        let Some(tasks) = self.finished.remove(&graph_id) else {
            return Vec::new();
        };
        let mut records = Vec::with_capacity(tasks.len());
        for task in tasks.into_values() {
            if !self.reported.insert(task.key()) {
                debug!(graph_id, task_id = task.key().task_id, "dropping duplicate report");
                continue;
            }
            records.push(CompletionRecord::from_task(&task));
        }
        records
    }

    /// Finish every waiter of a resolved entry. `builder` gets the result as
    /// is; everyone else sees it attributed to the cache.
    fn finish_waiters(&mut self, entry: WaitEntry, builder: Option<TaskKey>) {
        let Some(result) = entry.result else {
            return;
        };
        let shared = result.as_coalesced();
        for waiter in entry.waiters {
            match self.dispatched.remove(&waiter) {
                Some(InFlight { mut task, .. }) => {
                    let own = if Some(waiter) == builder { result.clone() } else { shared.clone() };
                    task.complete(own);
                    self.file_finished(task);
                }
                None => warn!(task = %waiter, "waiter vanished before its kernel finished"),
            }
        }
    }
}

/// How submission of a compile task resolves against cache and lock.
enum Claim {
    Cached(Arc<CompiledArtifact>),
    Build,
    InFlightHere,
    InFlightElsewhere,
}

fn wait_key_of(task: &BuildTask) -> WaitKey {
    WaitKey {
        namespace: task.namespace(),
        kind: task.kind(),
        variant: task.variant(),
        kernel_name: task.kernel_name().to_string(),
    }
}

fn job_for(task: &BuildTask, document: Arc<InputDocument>) -> CompileJob {
    let key = task.key();
    CompileJob {
        graph_id: key.graph_id,
        task_id: key.task_id,
        kernel_name: task.kernel_name().to_string(),
        kind: task.kind(),
        variant: task.variant(),
        document,
    }
}

fn claim_from_lock(state: BuildDirState, kernel: &str) -> Result<Claim> {
    match state {
        BuildDirState::Acquired => Ok(Claim::Build),
        BuildDirState::HeldElsewhere => Ok(Claim::InFlightElsewhere),
        BuildDirState::HeldByUs => Err(BuildError::CoordinationError(format!(
            "build lock for {kernel} is held by this process but no build is in flight"
        ))),
        BuildDirState::Found => Err(BuildError::CoordinationError(format!(
            "lock acquisition for {kernel} reported a finished artifact"
        ))),
    }
}

/// Process-wide coordinator for build tasks.
pub struct Coordinator {
    ledger: Mutex<Ledger>,
    backend: Mutex<Box<dyn CompileBackend>>,
    registry: Box<dyn PrebuiltRegistry>,
}

impl Coordinator {
    pub fn init(
        config: Config,
        backend: Box<dyn CompileBackend>,
        registry: Box<dyn PrebuiltRegistry>,
    ) -> Result<Self> {
        let subsystem = Arc::new(CacheSubsystem::open(config.cache_settings())?);
        info!(
            cache_dir = ?subsystem.settings.dir,
            mode = ?subsystem.settings.mode,
            kernel_meta = ?config.build.kernel_meta_dir,
            "build coordinator initialised"
        );
        Ok(Self {
            ledger: Mutex::new(Ledger {
                config,
                config_changed: false,
                subsystem,
                retired: Vec::new(),
                queue: KernelWaitQueue::new(),
                dispatched: HashMap::new(),
                finished: BTreeMap::new(),
                reported: HashSet::new(),
            }),
            backend: Mutex::new(backend),
            registry,
        })
    }

    /// Submit one task.
    ///
    /// `Err` means the task was rejected and the ledger is unchanged. A
    /// backend rejection is not an error: the task is filed as `Failed` and
    /// reported by the next [`collect`](Self::collect).
    pub fn submit(&self, mut task: BuildTask, strategy: BuildStrategy) -> Result<TaskStatus> {
        task.reset();
        let key = task.key();
        let mut ledger = self.ledger_guard();
        if ledger.knows(key) {
            return Err(BuildError::DuplicateTask {
                graph_id: key.graph_id,
                task_id: key.task_id,
            });
        }
        ledger.refresh_subsystem()?;

        let identity = compute_kernel_identity(task.namespace(), task.nodes())?;
        task.set_identity(identity.kernel_name.clone(), identity.op_unique_key.clone());
        let document = Arc::new(build_input_document(
            &identity,
            task.namespace(),
            task.kind(),
            task.variant(),
            task.nodes(),
            &ledger.config.build.kernel_meta_dir,
        )?);
        document.to_json()?;

        if strategy.dump_only {
            drop(ledger);
            dump_input_document(&document)?;
            task.attach_document(document);
            task.mark_do_not_persist();
            info!(
                graph_id = key.graph_id,
                task_id = key.task_id,
                kernel = %task.kernel_name(),
                "dump-only task completed"
            );
            return Ok(TaskStatus::CompletedDoNotPersist);
        }

        match task.kind() {
            TaskKind::Compile => self.submit_compile(&mut ledger, task, document, strategy),
            TaskKind::PreCompile => self.submit_precompile(&mut ledger, task, document),
        }
    }

    fn submit_compile(
        &self,
        ledger: &mut Ledger,
        mut task: BuildTask,
        document: Arc<InputDocument>,
        strategy: BuildStrategy,
    ) -> Result<TaskStatus> {
        let key = task.key();

        if strategy.reuse_binary
            && ledger.config.binary.enabled
            && task.namespace() == TaskNamespace::SingleOp
        {
            if let Some(artifact) = task.op_desc().and_then(|op| self.registry.lookup(op)) {
                info!(
                    graph_id = key.graph_id,
                    task_id = key.task_id,
                    kernel = %artifact.kernel_name,
                    "reusing prebuilt kernel"
                );
                task.complete(BuildResult::from_binary(artifact));
                ledger.file_finished(task);
                return Ok(TaskStatus::Succeeded);
            }
        }

        let subsystem = Arc::clone(&ledger.subsystem);
        let wait_key = wait_key_of(&task);

        match Self::claim_compile(&ledger.queue, &subsystem, &wait_key)? {
            Claim::Cached(artifact) => {
                debug!(
                    graph_id = key.graph_id,
                    task_id = key.task_id,
                    kernel = %wait_key.kernel_name,
                    "compile cache hit"
                );
                task.complete(BuildResult::from_cache(artifact));
                ledger.file_finished(task);
                Ok(TaskStatus::Succeeded)
            }
            Claim::InFlightHere => {
                if !ledger.queue.join(&wait_key, key) {
                    return Err(BuildError::CoordinationError(format!(
                        "kernel {} is in flight but has no wait entry",
                        wait_key.kernel_name
                    )));
                }
                debug!(
                    graph_id = key.graph_id,
                    task_id = key.task_id,
                    kernel = %wait_key.kernel_name,
                    "coalesced onto in-flight build"
                );
                ledger.file_in_flight(task, document, wait_key, subsystem);
                Ok(TaskStatus::Pending)
            }
            Claim::InFlightElsewhere => {
                if !ledger.queue.join(&wait_key, key) {
                    ledger.queue.open(wait_key.clone(), BuilderOrigin::External, key)?;
                    info!(
                        graph_id = key.graph_id,
                        task_id = key.task_id,
                        kernel = %wait_key.kernel_name,
                        "kernel is being built by another process; waiting"
                    );
                }
                ledger.file_in_flight(task, document, wait_key, subsystem);
                Ok(TaskStatus::Pending)
            }
            Claim::Build => self.dispatch(ledger, task, document, wait_key, subsystem),
        }
    }

    fn claim_compile(
        queue: &KernelWaitQueue,
        subsystem: &CacheSubsystem,
        wait_key: &WaitKey,
    ) -> Result<Claim> {
        let kernel = wait_key.kernel_name.as_str();
        let variant = wait_key.variant;

        if let Some(BuilderOrigin::Local(_)) = queue.get(wait_key).map(|e| e.origin) {
            return Ok(Claim::InFlightHere);
        }
        if let Some(artifact) = subsystem.store.match_compile_cache(kernel, variant) {
            return Ok(Claim::Cached(artifact));
        }
        if !subsystem.locks_enabled() {
            return Ok(Claim::Build);
        }

        let state = if subsystem.store.mode().reads() {
            subsystem.build_lock.check_result_in_build_dir(kernel, variant)?
        } else {
            subsystem.build_lock.acquire(kernel, variant)?
        };

        if state.is_found() {
            if let Some(artifact) = subsystem.store.match_compile_cache(kernel, variant) {
                return Ok(Claim::Cached(artifact));
            }
            warn!(kernel = %kernel, "cached entry is unusable; rebuilding");
            return claim_from_lock(subsystem.build_lock.acquire(kernel, variant)?, kernel);
        }
        claim_from_lock(state, kernel)
    }

    fn submit_precompile(
        &self,
        ledger: &mut Ledger,
        mut task: BuildTask,
        document: Arc<InputDocument>,
    ) -> Result<TaskStatus> {
        let key = task.key();
        let subsystem = Arc::clone(&ledger.subsystem);

        if let Some(entry) = subsystem.store.match_precompile_cache(task.kernel_name()) {
            debug!(
                graph_id = key.graph_id,
                task_id = key.task_id,
                kernel = %task.kernel_name(),
                "pre-compile cache hit"
            );
            task.complete(BuildResult::from_precompile_cache(entry));
            ledger.file_finished(task);
            return Ok(TaskStatus::Succeeded);
        }

        let wait_key = wait_key_of(&task);
        if ledger.queue.join(&wait_key, key) {
            ledger.file_in_flight(task, document, wait_key, subsystem);
            return Ok(TaskStatus::Pending);
        }
        self.dispatch(ledger, task, document, wait_key, subsystem)
    }

    /// Submit `task` as the builder of its kernel.
    fn dispatch(
        &self,
        ledger: &mut Ledger,
        mut task: BuildTask,
        document: Arc<InputDocument>,
        wait_key: WaitKey,
        subsystem: Arc<CacheSubsystem>,
    ) -> Result<TaskStatus> {
        let key = task.key();
        let accepted = self.backend_guard().submit(job_for(&task, Arc::clone(&document)));

        if !accepted {
            warn!(
                graph_id = key.graph_id,
                task_id = key.task_id,
                kernel = %wait_key.kernel_name,
                "backend rejected job"
            );
            if task.kind() == TaskKind::Compile {
                subsystem.build_lock.release(&wait_key.kernel_name, wait_key.variant);
            }
            task.attach_document(document);
            task.complete(BuildResult::failed("backend rejected the job"));
            ledger.file_finished(task);
            return Ok(TaskStatus::Failed);
        }

        if ledger.queue.get(&wait_key).is_some() {
            // Only an external wait can be open here; it now has a local builder.
            ledger.queue.promote(&wait_key, key)?;
        } else {
            ledger.queue.open(wait_key.clone(), BuilderOrigin::Local(key), key)?;
        }
        info!(
            graph_id = key.graph_id,
            task_id = key.task_id,
            kernel = %wait_key.kernel_name,
            kind = ?task.kind(),
            "dispatched build job"
        );
        ledger.file_in_flight(task, document, wait_key, subsystem);
        Ok(TaskStatus::Pending)
    }

    /// One non-blocking collection cycle for `graph_id`.
    ///
    /// Every task key is returned at most once for the lifetime of the
    /// coordinator. A coordination error is returned after the remaining
    /// completions were processed; finished tasks stay queued for the next
    /// cycle in that case.
    pub fn collect(&self, graph_id: u32) -> Result<Vec<CompletionRecord>> {
        let completions = self.backend_guard().poll();

        let mut ledger = self.ledger_guard();
        let mut failure = None;
        for completion in completions {
            if let Err(e) = self.apply_completion(&mut ledger, completion) {
                error!(error = %e, "failed to apply completion");
                failure.get_or_insert(e);
            }
        }
        if let Err(e) = self.reprobe_external(&mut ledger) {
            error!(error = %e, "failed to re-probe cross-process builds");
            failure.get_or_insert(e);
        }
        if let Some(e) = failure {
            return Err(e);
        }
        Ok(ledger.drain_reports(graph_id))
    }

    fn apply_completion(&self, ledger: &mut Ledger, completion: CompileCompletion) -> Result<()> {
        let key = TaskKey::new(completion.graph_id, completion.task_id);
        let Some(in_flight) = ledger.dispatched.get(&key) else {
            warn!(
                graph_id = key.graph_id,
                task_id = key.task_id,
                "completion for a task that is not in flight; skipping"
            );
            return Ok(());
        };

        let wait_key = in_flight.wait_key.clone();
        let subsystem = Arc::clone(&in_flight.subsystem);
        let result = Self::result_from_completion(&subsystem, &in_flight.task, completion);
        if wait_key.kind == TaskKind::Compile {
            subsystem.build_lock.release(&wait_key.kernel_name, wait_key.variant);
        }

        info!(
            graph_id = key.graph_id,
            task_id = key.task_id,
            kernel = %wait_key.kernel_name,
            status_code = result.status_code,
            "build finished"
        );

        let Some(entry) = ledger.queue.resolve(&wait_key, result.clone()) else {
            if let Some(InFlight { mut task, .. }) = ledger.dispatched.remove(&key) {
                task.complete(result);
                ledger.file_finished(task);
            }
            return Err(BuildError::CoordinationError(format!(
                "task {key} finished kernel {} but no wait entry exists",
                wait_key.kernel_name
            )));
        };
        if entry.origin != BuilderOrigin::Local(key) {
            warn!(
                task = %key,
                origin = ?entry.origin,
                "completion from a task that is not the recorded builder"
            );
        }

        ledger.finish_waiters(entry, Some(key));
        if let Some(InFlight { mut task, .. }) = ledger.dispatched.remove(&key) {
            task.complete(result);
            ledger.file_finished(task);
        }
        Ok(())
    }

    fn result_from_completion(
        subsystem: &CacheSubsystem,
        task: &BuildTask,
        completion: CompileCompletion,
    ) -> BuildResult {
        if !completion.succeeded() {
            warn!(
                kernel = %task.kernel_name(),
                status_code = completion.status_code,
                "backend reported a failed build"
            );
            return BuildResult::backend_failure(completion);
        }

        match task.kind() {
            TaskKind::Compile => {
                let descriptor = completion
                    .descriptor_path
                    .clone()
                    .or_else(|| task.document().map(|d| d.options.output_path()));
                let Some(descriptor) = descriptor else {
                    return BuildResult::failed("backend did not say where it wrote the kernel");
                };

                let fresh = match CompiledArtifact::load(&descriptor, task.variant(), false) {
                    Ok(fresh) => fresh,
                    Err(e) => {
                        return BuildResult::failed(format!(
                            "backend reported success but its output is unusable: {e:#}"
                        ));
                    }
                };
                if fresh.kernel_name != task.kernel_name() {
                    return BuildResult::failed(format!(
                        "backend produced kernel {} instead of {}",
                        fresh.kernel_name,
                        task.kernel_name()
                    ));
                }

                let artifact = match subsystem.store.set_compile_result(&fresh) {
                    Ok(Some(cached)) => {
                        subsystem.enforce_budget();
                        cached
                    }
                    Ok(None) => Arc::new(fresh),
                    Err(e) => {
                        warn!(
                            kernel = %task.kernel_name(),
                            error = %e,
                            "failed to cache compile result"
                        );
                        Arc::new(fresh)
                    }
                };
                BuildResult::online(artifact, completion.info_msg)
            }
            TaskKind::PreCompile => match completion.pre_compile {
                Some(outcome) => {
                    let entry = PreCompileEntry {
                        kernel_name: task.kernel_name().to_string(),
                        core_type: outcome.core_type.clone(),
                        pattern: outcome.pattern.clone(),
                    };
                    if let Err(e) = subsystem.store.set_precompile_result(&entry) {
                        warn!(
                            kernel = %task.kernel_name(),
                            error = %e,
                            "failed to cache pre-compile result"
                        );
                    }
                    BuildResult::precompiled(outcome, CompileRetType::Online, completion.info_msg)
                }
                None => BuildResult::failed("pre-compile finished without a core-type selection"),
            },
        }
    }

    /// Check every kernel another process is building: pick up its result,
    /// or take over if the builder vanished.
    fn reprobe_external(&self, ledger: &mut Ledger) -> Result<()> {
        for wait_key in ledger.queue.external_keys() {
            let kernel = wait_key.kernel_name.as_str();
            let first = ledger
                .queue
                .get(&wait_key)
                .and_then(|e| e.waiters.first().copied());
            let Some(first) = first else {
                continue;
            };
            let subsystem = ledger.dispatched.get(&first).map(|f| Arc::clone(&f.subsystem));
            let Some(subsystem) = subsystem else {
                return Err(BuildError::CoordinationError(format!(
                    "waiter {first} of kernel {kernel} is not in flight"
                )));
            };

            let checked = subsystem
                .build_lock
                .check_result_in_build_dir(kernel, wait_key.variant);
            let mut state = match checked {
                Ok(state) => state,
                Err(e) if e.is_task_local() => {
                    warn!(
                        kernel = %kernel,
                        error = %e,
                        "cannot probe build directory; still waiting"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            if state.is_found() {
                if let Some(artifact) = subsystem.store.load_published(kernel, wait_key.variant) {
                    info!(kernel = %kernel, "kernel published by another process");
                    let resolved = ledger
                        .queue
                        .resolve(&wait_key, BuildResult::from_cache(artifact));
                    if let Some(entry) = resolved {
                        ledger.finish_waiters(entry, None);
                    }
                    continue;
                }
                warn!(kernel = %kernel, "published entry is unusable; rebuilding");
                state = subsystem.build_lock.acquire(kernel, wait_key.variant)?;
            }

            match claim_from_lock(state, kernel)? {
                Claim::Build => self.take_over(ledger, &wait_key, first, &subsystem)?,
                _ => debug!(kernel = %kernel, "still being built elsewhere"),
            }
        }
        Ok(())
    }

    /// The external builder of `wait_key` is gone and we hold its lock now:
    /// dispatch the first waiter's job.
    fn take_over(
        &self,
        ledger: &mut Ledger,
        wait_key: &WaitKey,
        first: TaskKey,
        subsystem: &CacheSubsystem,
    ) -> Result<()> {
        let job = ledger
            .dispatched
            .get(&first)
            .and_then(|f| f.task.document().map(|doc| job_for(&f.task, Arc::clone(doc))))
            .ok_or_else(|| {
                BuildError::CoordinationError(format!(
                    "waiter {first} has no input document to build from"
                ))
            })?;

        info!(
            kernel = %wait_key.kernel_name,
            task = %first,
            "builder in another process vanished; taking over"
        );
        if self.backend_guard().submit(job) {
            ledger.queue.promote(wait_key, first)
        } else {
            warn!(kernel = %wait_key.kernel_name, "backend rejected take-over job");
            subsystem.build_lock.release(&wait_key.kernel_name, wait_key.variant);
            let failed = BuildResult::failed("backend rejected the job");
            if let Some(entry) = ledger.queue.resolve(wait_key, failed) {
                ledger.finish_waiters(entry, Some(first));
            }
            Ok(())
        }
    }

    /// Collect until nothing of `graph_id` is left in flight.
    ///
    /// Sleeps `build.poll_interval_ms` between cycles and gives up after
    /// `build.wait_timeout_secs` (if non-zero).
    pub fn wait_all_finished(&self, graph_id: u32) -> Result<Vec<CompletionRecord>> {
        let (interval, timeout) = {
            let ledger = self.ledger_guard();
            (ledger.config.poll_interval(), ledger.config.wait_timeout())
        };
        let started = Instant::now();
        let mut records = Vec::new();

        loop {
            records.extend(self.collect(graph_id)?);
            if !self.ledger_guard().has_outstanding(graph_id) {
                return Ok(records);
            }
            if let Some(limit) = timeout {
                if started.elapsed() >= limit {
                    return Err(BuildError::BackendError(format!(
                        "graph {graph_id}: still waiting for builds after {limit:?}"
                    )));
                }
            }
            thread::sleep(interval);
        }
    }

    /// Install a new configuration; the cache subsystem follows on the next
    /// submission if its settings changed.
    pub fn update_config(&self, config: Config) {
        let mut ledger = self.ledger_guard();
        ledger.config = config;
        ledger.config_changed = true;
        debug!("configuration updated");
    }

    /// Release every build lock held by this process. Returns how many were
    /// released.
    pub fn teardown(&self) -> usize {
        let mut ledger = self.ledger_guard();
        let mut released = ledger.subsystem.build_lock.release_all();
        for old in ledger.retired.drain(..) {
            released += old.build_lock.release_all();
        }
        info!(
            released,
            dispatched = ledger.dispatched.len(),
            "build coordinator torn down"
        );
        released
    }

    pub fn stats(&self) -> LedgerStats {
        let ledger = self.ledger_guard();
        LedgerStats {
            dispatched: ledger.dispatched.len(),
            finished: ledger.finished.values().map(BTreeMap::len).sum(),
            reported: ledger.reported.len(),
            in_flight_kernels: ledger.queue.len(),
            held_build_locks: ledger.subsystem.build_lock.held_count()
                + ledger.retired.iter().map(|s| s.build_lock.held_count()).sum::<usize>(),
            retired_subsystems: ledger.retired.len(),
        }
    }

    fn ledger_guard(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn backend_guard(&self) -> MutexGuard<'_, Box<dyn CompileBackend>> {
        self.backend.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
