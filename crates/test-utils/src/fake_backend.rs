use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use kernelbuild::backend::{CompileBackend, CompileCompletion, CompileJob, PreCompileOutcome};
use kernelbuild::types::TaskKind;
use serde_json::json;

#[derive(Default)]
struct FakeState {
    submitted: Vec<CompileJob>,
    completed: HashSet<(u32, u32)>,
    ready: VecDeque<CompileCompletion>,
    delivered: Vec<CompileCompletion>,
    reject_next: usize,
    binary_len: usize,
}

/// A fake backend that:
/// - records which jobs were submitted
/// - only completes a job when the test says so, through its
///   [`FakeBackendHandle`]
pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    pub fn new() -> (Self, FakeBackendHandle) {
        let state = Arc::new(Mutex::new(FakeState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            FakeBackendHandle { state },
        )
    }

    pub fn boxed() -> (Box<dyn CompileBackend>, FakeBackendHandle) {
        let (backend, handle) = Self::new();
        (Box::new(backend), handle)
    }
}

impl CompileBackend for FakeBackend {
    fn submit(&mut self, job: CompileJob) -> bool {
        let mut state = lock(&self.state);
        if state.reject_next > 0 {
            state.reject_next -= 1;
            return false;
        }
        state.submitted.push(job);
        true
    }

    fn poll(&mut self) -> Vec<CompileCompletion> {
        let mut state = lock(&self.state);
        let ready: Vec<_> = state.ready.drain(..).collect();
        state.delivered.extend(ready.iter().cloned());
        ready
    }
}

/// Test-side control over a [`FakeBackend`].
#[derive(Clone)]
pub struct FakeBackendHandle {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBackendHandle {
    pub fn submitted(&self) -> Vec<CompileJob> {
        lock(&self.state).submitted.clone()
    }

    pub fn submit_count(&self) -> usize {
        lock(&self.state).submitted.len()
    }

    /// Reject the next `n` submissions.
    pub fn reject_next(&self, n: usize) {
        lock(&self.state).reject_next = n;
    }

    /// Make every binary written from now on exactly `len` bytes long.
    pub fn binary_size(&self, len: usize) {
        lock(&self.state).binary_len = len;
    }

    /// Finish a submitted job successfully, writing its outputs into
    /// `kernel_meta` the way a real compiler would.
    pub fn complete_success(&self, graph_id: u32, task_id: u32) {
        let mut state = lock(&self.state);
        let job = find_job(&state, graph_id, task_id);
        let completion = match job.kind {
            TaskKind::Compile => {
                let descriptor = write_outputs(&job, state.binary_len);
                CompileCompletion {
                    graph_id,
                    task_id,
                    status_code: 0,
                    result: "SUCCESS".into(),
                    info_msg: format!("built {}", job.kernel_name),
                    descriptor_path: Some(descriptor),
                    ..CompileCompletion::default()
                }
            }
            TaskKind::PreCompile => CompileCompletion {
                graph_id,
                task_id,
                status_code: 0,
                result: "SUCCESS".into(),
                pre_compile: Some(PreCompileOutcome {
                    core_type: "AiCore".into(),
                    pattern: "ElemWise".into(),
                }),
                ..CompileCompletion::default()
            },
        };
        state.completed.insert((graph_id, task_id));
        state.ready.push_back(completion);
    }

    pub fn complete_failure(&self, graph_id: u32, task_id: u32, status_code: i32, message: &str) {
        let mut state = lock(&self.state);
        find_job(&state, graph_id, task_id);
        state.completed.insert((graph_id, task_id));
        state.ready.push_back(CompileCompletion {
            graph_id,
            task_id,
            status_code,
            result: "FAILED".into(),
            info_msg: message.into(),
            exception: format!("fake compiler error: {message}"),
            ..CompileCompletion::default()
        });
    }

    /// Successfully complete every submitted job not completed yet.
    pub fn complete_all(&self) {
        let open: Vec<(u32, u32)> = {
            let state = lock(&self.state);
            state
                .submitted
                .iter()
                .map(|j| (j.graph_id, j.task_id))
                .filter(|key| !state.completed.contains(key))
                .collect()
        };
        for (graph_id, task_id) in open {
            self.complete_success(graph_id, task_id);
        }
    }

    /// Queue every completion delivered so far for delivery again.
    pub fn redeliver_all(&self) {
        let mut state = lock(&self.state);
        let again = state.delivered.clone();
        state.ready.extend(again);
    }
}

fn lock(state: &Mutex<FakeState>) -> MutexGuard<'_, FakeState> {
    state.lock().unwrap()
}

fn find_job(state: &FakeState, graph_id: u32, task_id: u32) -> CompileJob {
    state
        .submitted
        .iter()
        .find(|j| j.graph_id == graph_id && j.task_id == task_id)
        .cloned()
        .unwrap_or_else(|| panic!("no job submitted for ({graph_id}, {task_id})"))
}

/// Write `<stem>.o` and `<stem>.json` into the job's kernel_meta directory.
/// A `binary_len` of zero writes a short text binary.
fn write_outputs(job: &CompileJob, binary_len: usize) -> PathBuf {
    let descriptor_path = job.output_path();
    let dir = descriptor_path.parent().unwrap().to_path_buf();
    fs::create_dir_all(&dir).unwrap();

    let stem = descriptor_path.file_stem().unwrap().to_string_lossy().to_string();
    let binary_file = format!("{stem}.o");
    let binary = match binary_len {
        0 => format!("binary of {}", job.kernel_name).into_bytes(),
        len => vec![b'k'; len],
    };
    fs::write(dir.join(&binary_file), binary).unwrap();

    let descriptor = json!({
        "kernel_name": job.kernel_name,
        "binary_file": binary_file,
        "compile_info": {
            "key": format!("{}_info", job.kernel_name),
            "json": "{\"block_dim\":8}"
        },
        "block_dim": 8
    });
    fs::write(&descriptor_path, descriptor.to_string()).unwrap();
    descriptor_path
}
