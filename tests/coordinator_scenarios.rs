// tests/coordinator_scenarios.rs

mod common;

use std::error::Error;
use std::fs;
use std::sync::Arc;

use serde_json::json;
use tempfile::tempdir;

use kernelbuild::binary::registry_from_config;
use kernelbuild::errors::BuildError;
use kernelbuild::graph::{OpNode, compute_kernel_identity};
use kernelbuild::ledger::{BuildStrategy, BuildTask, CompileRetType, Coordinator, TaskStatus};
use kernelbuild::types::{ArtifactVariant, CacheMode, TaskKind, TaskNamespace};
use kernelbuild_test_utils::builders::{ConfigBuilder, add_relu, unary_op};
use kernelbuild_test_utils::fake_backend::FakeBackend;

use common::{coordinator, coordinator_with};

type TestResult = Result<(), Box<dyn Error>>;

fn relu_task(graph_id: u32, task_id: u32) -> BuildTask {
    // Node ids differ per task; the content does not.
    let node = OpNode::new(unary_op(100 + u64::from(task_id), "Relu"));
    BuildTask::new(graph_id, task_id, TaskNamespace::SingleOp, vec![node])
}

#[test]
fn identical_submissions_share_one_build() -> TestResult {
    let dir = tempdir()?;
    let (coord, backend) = coordinator(dir.path());

    let node = OpNode::new(unary_op(1, "Relu"));
    let first = BuildTask::new(1, 1, TaskNamespace::SingleOp, vec![Arc::clone(&node)]);
    assert_eq!(coord.submit(first, BuildStrategy::default())?, TaskStatus::Pending);
    assert_eq!(coord.submit(relu_task(1, 2), BuildStrategy::default())?, TaskStatus::Pending);
    assert_eq!(backend.submit_count(), 1);
    assert!(coord.collect(1)?.is_empty());

    backend.complete_success(1, 1);
    let mut records = coord.collect(1)?;
    records.sort_by_key(|r| r.task_id);
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.status_code == 0 && r.status == TaskStatus::Succeeded));
    assert_eq!(records[0].compile_ret_type, CompileRetType::Online);
    assert_eq!(records[1].compile_ret_type, CompileRetType::Cache);
    assert_eq!(records[0].kernel_name, records[1].kernel_name);

    assert!(coord.collect(1)?.is_empty());

    // The node carries the cached artifact, not the kernel_meta copy.
    let binding = node.binding().ok_or("node was not bound")?;
    assert!(binding.binary_path.starts_with(dir.path().join("cache")));
    assert_eq!(binding.compile_info_key, Some(format!("{}_info", records[0].kernel_name)));

    let stats = coord.stats();
    assert_eq!(stats.dispatched, 0);
    assert_eq!(stats.in_flight_kernels, 0);
    assert_eq!(stats.held_build_locks, 0);
    assert_eq!(stats.reported, 2);
    Ok(())
}

#[test]
fn populated_cache_resolves_without_backend() -> TestResult {
    let dir = tempdir()?;
    {
        let (coord, backend) = coordinator(dir.path());
        coord.submit(relu_task(1, 1), BuildStrategy::default())?;
        backend.complete_success(1, 1);
        assert_eq!(coord.wait_all_finished(1)?.len(), 1);
        coord.teardown();
    }

    let (coord, backend) = coordinator(dir.path());
    assert_eq!(coord.submit(relu_task(2, 1), BuildStrategy::default())?, TaskStatus::Succeeded);
    assert_eq!(backend.submit_count(), 0);

    let records = coord.collect(2)?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].compile_ret_type, CompileRetType::Cache);
    assert!(records[0].outcome.artifact.is_some());
    Ok(())
}

#[test]
fn reordered_fusion_sets_coalesce() -> TestResult {
    let dir = tempdir()?;
    let (coord, backend) = coordinator(dir.path());

    let a = BuildTask::new(1, 1, TaskNamespace::FusionOp, add_relu(1, 2, false));
    let b = BuildTask::new(1, 2, TaskNamespace::FusionOp, add_relu(7, 8, true));
    coord.submit(a, BuildStrategy::default())?;
    coord.submit(b, BuildStrategy::default())?;
    assert_eq!(backend.submit_count(), 1);
    assert!(backend.submitted()[0].kernel_name.starts_with("te_fused_add_relu_"));

    backend.complete_all();
    assert_eq!(coord.wait_all_finished(1)?.len(), 2);
    Ok(())
}

#[test]
fn failed_build_fails_every_waiter() -> TestResult {
    let dir = tempdir()?;
    let (coord, backend) = coordinator(dir.path());

    coord.submit(relu_task(1, 1), BuildStrategy::default())?;
    coord.submit(relu_task(1, 2), BuildStrategy::default())?;
    backend.complete_failure(1, 1, 5, "tiling failed");

    let records = coord.collect(1)?;
    assert_eq!(records.len(), 2);
    for record in &records {
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.status_code, 5);
        assert!(record.outcome.error_message().unwrap_or_default().contains("tiling failed"));
    }
    assert_eq!(coord.stats().held_build_locks, 0);

    // Nothing was cached; a new request builds again.
    assert_eq!(coord.submit(relu_task(1, 3), BuildStrategy::default())?, TaskStatus::Pending);
    assert_eq!(backend.submit_count(), 2);
    Ok(())
}

#[test]
fn backend_rejection_fails_only_that_task() -> TestResult {
    let dir = tempdir()?;
    let (coord, backend) = coordinator(dir.path());

    backend.reject_next(1);
    assert_eq!(coord.submit(relu_task(1, 1), BuildStrategy::default())?, TaskStatus::Failed);
    let stats = coord.stats();
    assert_eq!(stats.finished, 1);
    assert_eq!(stats.in_flight_kernels, 0);
    assert_eq!(stats.held_build_locks, 0);

    let records = coord.collect(1)?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, TaskStatus::Failed);

    assert_eq!(coord.submit(relu_task(1, 2), BuildStrategy::default())?, TaskStatus::Pending);
    assert_eq!(backend.submit_count(), 1);
    Ok(())
}

#[test]
fn duplicate_keys_are_rejected() -> TestResult {
    let dir = tempdir()?;
    let (coord, backend) = coordinator(dir.path());

    coord.submit(relu_task(1, 1), BuildStrategy::default())?;
    let err = coord.submit(relu_task(1, 1), BuildStrategy::default()).unwrap_err();
    assert!(matches!(err, BuildError::DuplicateTask { graph_id: 1, task_id: 1 }));

    backend.complete_all();
    coord.wait_all_finished(1)?;
    let err = coord.submit(relu_task(1, 1), BuildStrategy::default()).unwrap_err();
    assert!(matches!(err, BuildError::DuplicateTask { .. }));
    Ok(())
}

#[test]
fn invalid_node_set_leaves_ledger_untouched() -> TestResult {
    let dir = tempdir()?;
    let (coord, backend) = coordinator(dir.path());

    let empty = BuildTask::new(1, 1, TaskNamespace::FusionOp, vec![]);
    let err = coord.submit(empty, BuildStrategy::default()).unwrap_err();
    assert!(matches!(err, BuildError::ContentError(_)));
    assert_eq!(coord.stats(), Default::default());
    assert_eq!(backend.submit_count(), 0);

    // The key was never recorded.
    assert_eq!(coord.submit(relu_task(1, 1), BuildStrategy::default())?, TaskStatus::Pending);
    Ok(())
}

#[test]
fn dump_only_writes_document_and_reports_nothing() -> TestResult {
    let dir = tempdir()?;
    let (coord, backend) = coordinator(dir.path());

    let task = relu_task(1, 1);
    let kernel = compute_kernel_identity(TaskNamespace::SingleOp, task.nodes())?.kernel_name;
    let strategy = BuildStrategy {
        dump_only: true,
        ..BuildStrategy::default()
    };
    assert_eq!(coord.submit(task, strategy)?, TaskStatus::CompletedDoNotPersist);

    let document = dir.path().join("meta").join(format!("{kernel}.input.json"));
    let parsed: serde_json::Value = serde_json::from_str(&fs::read_to_string(document)?)?;
    assert_eq!(parsed["kernel_name"], json!(kernel));
    assert_eq!(parsed["op_list"][0]["op_type"], json!("Relu"));

    assert_eq!(backend.submit_count(), 0);
    assert!(coord.collect(1)?.is_empty());
    Ok(())
}

#[test]
fn disabled_cache_still_coalesces_but_never_stores() -> TestResult {
    let dir = tempdir()?;
    let config = ConfigBuilder::new(dir.path()).mode(CacheMode::Disable).build();
    let (coord, backend) = coordinator_with(config);

    coord.submit(relu_task(1, 1), BuildStrategy::default())?;
    coord.submit(relu_task(1, 2), BuildStrategy::default())?;
    assert_eq!(backend.submit_count(), 1);
    backend.complete_all();
    let records = coord.wait_all_finished(1)?;
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.status == TaskStatus::Succeeded));
    assert!(!dir.path().join("cache").exists());

    assert_eq!(coord.submit(relu_task(1, 3), BuildStrategy::default())?, TaskStatus::Pending);
    assert_eq!(backend.submit_count(), 2);
    Ok(())
}

#[test]
fn force_mode_rebuilds_over_existing_entry() -> TestResult {
    let dir = tempdir()?;
    {
        let (coord, backend) = coordinator(dir.path());
        coord.submit(relu_task(1, 1), BuildStrategy::default())?;
        backend.complete_all();
        coord.wait_all_finished(1)?;
    }

    let config = ConfigBuilder::new(dir.path()).mode(CacheMode::Force).build();
    let (coord, backend) = coordinator_with(config);
    assert_eq!(coord.submit(relu_task(2, 1), BuildStrategy::default())?, TaskStatus::Pending);
    backend.complete_all();
    let records = coord.wait_all_finished(2)?;
    assert_eq!(records[0].compile_ret_type, CompileRetType::Online);
    Ok(())
}

#[test]
fn precompile_results_are_cached_separately() -> TestResult {
    let dir = tempdir()?;
    let (coord, backend) = coordinator(dir.path());

    let pre = relu_task(1, 1).with_kind(TaskKind::PreCompile);
    assert_eq!(coord.submit(pre, BuildStrategy::default())?, TaskStatus::Pending);
    // A compile of the same kernel is its own build.
    assert_eq!(coord.submit(relu_task(1, 2), BuildStrategy::default())?, TaskStatus::Pending);
    assert_eq!(backend.submit_count(), 2);

    backend.complete_success(1, 1);
    let records = coord.collect(1)?;
    assert_eq!(records.len(), 1);
    let outcome = records[0].outcome.pre_compile.clone().ok_or("no pre-compile outcome")?;
    assert_eq!(outcome.core_type, "AiCore");

    let again = relu_task(2, 1).with_kind(TaskKind::PreCompile);
    assert_eq!(coord.submit(again, BuildStrategy::default())?, TaskStatus::Succeeded);
    assert_eq!(backend.submit_count(), 2);
    Ok(())
}

#[test]
fn config_change_switches_cache_directory() -> TestResult {
    let dir = tempdir()?;
    let (coord, backend) = coordinator(dir.path());

    coord.submit(relu_task(1, 1), BuildStrategy::default())?;
    backend.complete_all();
    coord.wait_all_finished(1)?;

    let moved = ConfigBuilder::new(dir.path()).cache_dir(dir.path().join("cache2")).build();
    coord.update_config(moved);
    assert_eq!(coord.submit(relu_task(1, 2), BuildStrategy::default())?, TaskStatus::Pending);
    assert!(dir.path().join("cache2").join("kernel").is_dir());
    assert_eq!(coord.stats().retired_subsystems, 1);

    // Same settings again: no further refresh.
    coord.update_config(
        ConfigBuilder::new(dir.path())
            .cache_dir(dir.path().join("cache2"))
            .build(),
    );
    coord.submit(relu_task(1, 3), BuildStrategy::default())?;
    assert_eq!(coord.stats().retired_subsystems, 1);
    assert_eq!(coord.teardown(), 1);
    Ok(())
}

#[test]
fn prebuilt_registry_short_circuits_single_ops() -> TestResult {
    let dir = tempdir()?;
    let installed = dir.path().join("installed");
    fs::create_dir_all(&installed)?;
    fs::write(installed.join("relu_f16.o"), b"prebuilt relu")?;
    fs::write(
        installed.join("relu_f16.json"),
        json!({ "kernel_name": "relu_f16", "binary_file": "relu_f16.o" }).to_string(),
    )?;
    let index = json!({
        "kernels": [{
            "op_type": "Relu",
            "inputs": [{ "dtype": "float16", "format": "ND", "shape": [-1, -1] }],
            "descriptor": "relu_f16.json",
            "binary": "relu_f16.o"
        }]
    });
    fs::write(installed.join("registry.json"), index.to_string())?;

    let config = ConfigBuilder::new(dir.path()).registry(installed.join("registry.json")).build();
    let registry = registry_from_config(&config)?;
    let (backend, handle) = FakeBackend::boxed();
    let coord = Coordinator::init(config, backend, registry)?;

    let node = OpNode::new(unary_op(1, "Relu"));
    let task = BuildTask::new(1, 1, TaskNamespace::SingleOp, vec![Arc::clone(&node)]);
    assert_eq!(coord.submit(task, BuildStrategy::default())?, TaskStatus::Succeeded);
    assert_eq!(handle.submit_count(), 0);
    assert_eq!(node.binding().ok_or("not bound")?.kernel_name, "relu_f16");

    let records = coord.collect(1)?;
    assert_eq!(records[0].compile_ret_type, CompileRetType::Binary);

    let no_binary = BuildStrategy {
        reuse_binary: false,
        ..BuildStrategy::default()
    };
    assert_eq!(coord.submit(relu_task(1, 2), no_binary)?, TaskStatus::Pending);
    assert_eq!(handle.submit_count(), 1);
    Ok(())
}

#[test]
fn stale_completion_is_skipped() -> TestResult {
    let dir = tempdir()?;
    let (coord, backend) = coordinator(dir.path());

    coord.submit(relu_task(1, 1), BuildStrategy::default())?;
    backend.complete_success(1, 1);
    assert_eq!(coord.collect(1)?.len(), 1);

    // The same completion arriving again is not an error.
    backend.redeliver_all();
    assert!(coord.collect(1)?.is_empty());
    Ok(())
}

#[test]
fn split_and_whole_variants_build_separately() -> TestResult {
    let dir = tempdir()?;
    let (coord, backend) = coordinator(dir.path());

    coord.submit(relu_task(1, 1), BuildStrategy::default())?;
    coord.submit(
        relu_task(1, 2).with_variant(ArtifactVariant::Split),
        BuildStrategy::default(),
    )?;
    assert_eq!(backend.submit_count(), 2);

    backend.complete_all();
    let mut records = coord.wait_all_finished(1)?;
    records.sort_by_key(|r| r.task_id);
    assert!(records.iter().all(|r| r.status.is_terminal()));
    assert!(records.iter().all(|r| r.compile_ret_type == CompileRetType::Online));
    assert_eq!(records[0].kernel_name, records[1].kernel_name);

    let whole = records[0].outcome.artifact.as_ref().ok_or("no whole artifact")?;
    let split = records[1].outcome.artifact.as_ref().ok_or("no split artifact")?;
    assert_eq!(split.variant, ArtifactVariant::Split);
    assert_ne!(whole.binary_path, split.binary_path);

    // Each variant is now served from its own cache entry.
    assert_eq!(
        coord.submit(
            relu_task(2, 1).with_variant(ArtifactVariant::Split),
            BuildStrategy::default()
        )?,
        TaskStatus::Succeeded
    );
    assert_eq!(backend.submit_count(), 2);
    Ok(())
}
