// src/lib.rs

pub mod backend;
pub mod binary;
pub mod cache;
pub mod cli;
pub mod config;
pub mod errors;
pub mod graph;
pub mod ledger;
pub mod lock;
pub mod logging;
pub mod types;

use std::path::Path;

use anyhow::{Result, bail};
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::backend::ProcessBackend;
use crate::binary::registry_from_config;
use crate::cache::CacheStore;
use crate::cli::{CacheAction, CliArgs, Command};
use crate::config::{Config, default_config_path, load_and_validate};
use crate::graph::{NodeSetFile, compute_kernel_identity};
use crate::ledger::{BuildStrategy, BuildTask, CompletionRecord, Coordinator, TaskStatus};

/// High-level entry point used by `main.rs`.
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = load_config(args.config.as_deref())?;

    match args.command {
        Command::Name { nodes } => print_name(&nodes),
        Command::Build {
            nodes,
            graph_id,
            dump_only,
            no_binary,
        } => {
            let strategy = BuildStrategy {
                reuse_binary: !no_binary,
                dump_only,
            };
            // The coordinator blocks while waiting; keep it off the async workers.
            let handle = Handle::current();
            tokio::task::spawn_blocking(move || build(cfg, handle, &nodes, graph_id, strategy))
                .await?
        }
        Command::Cache { action } => cache_command(&cfg, action),
    }
}

/// Explicit `--config` must exist; the default path is optional.
fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Ok(load_and_validate(path)?),
        None => {
            let default = default_config_path();
            if default.is_file() {
                Ok(load_and_validate(&default)?)
            } else {
                debug!(path = ?default, "no config file; using defaults");
                Ok(Config::default())
            }
        }
    }
}

fn print_name(nodes: &Path) -> Result<()> {
    let set = NodeSetFile::load(nodes)?;
    let namespace = set.namespace;
    let identity = compute_kernel_identity(namespace, &set.into_nodes())?;
    if identity.kernel_name == identity.op_unique_key {
        println!("{}", identity.kernel_name);
    } else {
        println!("{} (computed {})", identity.kernel_name, identity.op_unique_key);
    }
    Ok(())
}

fn build(
    cfg: Config,
    handle: Handle,
    nodes: &Path,
    graph_id: u32,
    strategy: BuildStrategy,
) -> Result<()> {
    let set = NodeSetFile::load(nodes)?;
    let (namespace, kind) = (set.namespace, set.kind);

    let backend = ProcessBackend::new(handle, &cfg.backend);
    let registry = registry_from_config(&cfg)?;
    let coordinator = Coordinator::init(cfg, Box::new(backend), registry)?;

    let task = BuildTask::new(graph_id, 0, namespace, set.into_nodes()).with_kind(kind);
    let status = coordinator.submit(task, strategy)?;
    info!(graph_id, ?status, "task submitted");

    if status == TaskStatus::CompletedDoNotPersist {
        println!("input document written; nothing compiled");
        coordinator.teardown();
        return Ok(());
    }

    let records = coordinator.wait_all_finished(graph_id);
    coordinator.teardown();
    let records = records?;

    let mut failed = 0;
    for record in &records {
        print_record(record);
        if record.status != TaskStatus::Succeeded {
            failed += 1;
        }
    }
    if failed > 0 {
        bail!("{failed} build task(s) failed");
    }
    Ok(())
}

fn print_record(record: &CompletionRecord) {
    let location = record
        .outcome
        .artifact
        .as_ref()
        .map(|a| a.binary_path.display().to_string())
        .or_else(|| {
            record
                .outcome
                .pre_compile
                .as_ref()
                .map(|p| format!("core_type={} pattern={}", p.core_type, p.pattern))
        })
        .unwrap_or_default();
    println!(
        "{}\t{:?}\t{}\t{}",
        record.kernel_name, record.status, record.compile_ret_type, location
    );
    if let Some(msg) = record.outcome.error_message() {
        println!("  {msg}");
    }
}

fn cache_command(cfg: &Config, action: CacheAction) -> Result<()> {
    let store = CacheStore::open(cfg.cache_settings())?;
    match action {
        CacheAction::Stats => {
            let stats = store.stats()?;
            println!("cache dir:          {}", store.settings().dir.display());
            println!("mode:               {:?}", store.mode());
            println!("kernel entries:     {}", stats.disk_entries);
            println!("kernel bytes:       {}", stats.disk_bytes);
            println!("pre-compile entries: {}", stats.precompile_entries);
        }
        CacheAction::Evict => {
            let report = store.evict_to_budget()?;
            println!(
                "evicted {} of {} entries ({} busy, {} orphaned temp files removed); \
                 {} -> {} bytes",
                report.evicted,
                report.scanned,
                report.skipped_locked,
                report.orphans_removed,
                report.bytes_before,
                report.bytes_after
            );
        }
    }
    Ok(())
}
