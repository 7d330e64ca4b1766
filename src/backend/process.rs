// src/backend/process.rs

//! Backend that runs an external compiler process per job.
//!
//! Each accepted job is written to `<kernel_meta>/<stem>.input.json` and
//! executed as `<cmd> <input.json> <kernel_meta_dir>` in its own Tokio task.
//! A semaphore caps the number of concurrent compiler processes. Finished
//! jobs are pushed onto an unbounded channel which [`ProcessBackend::poll`]
//! drains without blocking.

use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::process::Command;
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, error, info, warn};

use crate::backend::document::dump_input_document;
use crate::backend::{CompileBackend, CompileCompletion, CompileJob, PreCompileOutcome};
use crate::config::BackendSection;
use crate::types::TaskKind;

pub struct ProcessBackend {
    handle: Handle,
    cmd: String,
    permits: Arc<Semaphore>,
    tx: mpsc::UnboundedSender<CompileCompletion>,
    rx: mpsc::UnboundedReceiver<CompileCompletion>,
}

impl ProcessBackend {
    /// Create a backend spawning its jobs onto `handle`.
    pub fn new(handle: Handle, cfg: &BackendSection) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            handle,
            cmd: cfg.cmd.clone(),
            permits: Arc::new(Semaphore::new(cfg.jobs.max(1))),
            tx,
            rx,
        }
    }
}

impl CompileBackend for ProcessBackend {
    fn submit(&mut self, job: CompileJob) -> bool {
        if let Err(e) = dump_input_document(&job.document) {
            warn!(
                kernel = %job.kernel_name,
                error = %e,
                "rejecting job: cannot write input document"
            );
            return false;
        }

        debug!(
            graph_id = job.graph_id,
            task_id = job.task_id,
            kernel = %job.kernel_name,
            "queued compile job"
        );

        let cmd = self.cmd.clone();
        let permits = Arc::clone(&self.permits);
        let tx = self.tx.clone();
        self.handle.spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let completion = run_job(&cmd, &job).await.unwrap_or_else(|err| {
                error!(kernel = %job.kernel_name, error = %err, "compile job execution error");
                CompileCompletion {
                    graph_id: job.graph_id,
                    task_id: job.task_id,
                    status_code: -1,
                    result: "FAILED".to_string(),
                    exception: format!("{err:#}"),
                    ..CompileCompletion::default()
                }
            });
            // The receiver only goes away with the backend itself.
            let _ = tx.send(completion);
        });
        true
    }

    fn poll(&mut self) -> Vec<CompileCompletion> {
        let mut done = Vec::new();
        while let Ok(completion) = self.rx.try_recv() {
            done.push(completion);
        }
        done
    }
}

async fn run_job(cmd: &str, job: &CompileJob) -> Result<CompileCompletion> {
    let input = job.document.input_path();
    let meta_dir = &job.document.options.kernel_meta_dir;
    info!(
        graph_id = job.graph_id,
        task_id = job.task_id,
        kernel = %job.kernel_name,
        cmd = %cmd,
        "starting compiler process"
    );

    let output = Command::new(cmd)
        .arg(&input)
        .arg(meta_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("running compiler '{cmd}' for kernel '{}'", job.kernel_name))?;

    let status_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    for line in stderr.lines() {
        debug!(kernel = %job.kernel_name, "stderr: {}", line);
    }
    info!(
        kernel = %job.kernel_name,
        exit_code = status_code,
        success = output.status.success(),
        "compiler process exited"
    );

    let mut completion = CompileCompletion {
        graph_id: job.graph_id,
        task_id: job.task_id,
        status_code,
        info_msg: stdout,
        ..CompileCompletion::default()
    };

    if !output.status.success() {
        completion.result = "FAILED".to_string();
        completion.err_args = format!("{cmd} {} {}", input.display(), meta_dir.display());
        completion.exception = stderr;
        return Ok(completion);
    }

    completion.result = "SUCCESS".to_string();
    let produced = job.output_path();
    match job.kind {
        TaskKind::Compile => completion.descriptor_path = Some(produced),
        TaskKind::PreCompile => {
            let data = tokio::fs::read_to_string(&produced)
                .await
                .with_context(|| format!("reading pre-compile output {:?}", produced))?;
            let outcome: PreCompileOutcome = serde_json::from_str(&data)
                .with_context(|| format!("parsing pre-compile output {:?}", produced))?;
            completion.pre_compile = Some(outcome);
        }
    }
    Ok(completion)
}
