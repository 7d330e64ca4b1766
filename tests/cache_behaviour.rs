// tests/cache_behaviour.rs

mod common;

use std::error::Error;
use std::fs;

use tempfile::tempdir;

use kernelbuild::cache::CacheStore;
use kernelbuild::graph::NodeRef;
use kernelbuild::ledger::{BuildStrategy, BuildTask, CompileRetType, TaskStatus};
use kernelbuild::types::{ArtifactVariant, CacheMode, TaskNamespace};
use kernelbuild_test_utils::builders::{ConfigBuilder, OpDescBuilder};

use common::{coordinator, coordinator_with};

type TestResult = Result<(), Box<dyn Error>>;

fn mul_node(rows: i64) -> NodeRef {
    OpDescBuilder::new(1, "Mul")
        .shape(&[rows, 8])
        .external_input(0)
        .external_input(1)
        .output()
        .node()
}

fn mul_task(graph_id: u32, task_id: u32, rows: i64) -> BuildTask {
    BuildTask::new(graph_id, task_id, TaskNamespace::SingleOp, vec![mul_node(rows)])
}

/// Build one kernel per entry of `rows` and return the kernel names.
fn populate(root: &std::path::Path, rows: &[i64]) -> Result<Vec<String>, Box<dyn Error>> {
    let (coord, backend) = coordinator(root);
    for (task_id, r) in rows.iter().enumerate() {
        coord.submit(mul_task(1, task_id as u32, *r), BuildStrategy::default())?;
    }
    backend.complete_all();
    let records = coord.wait_all_finished(1)?;
    assert!(records.iter().all(|r| r.status == TaskStatus::Succeeded));
    Ok(backend.submitted().into_iter().map(|j| j.kernel_name).collect())
}

#[test]
fn published_entries_are_visible_to_a_fresh_store() -> TestResult {
    let dir = tempdir()?;
    let kernels = populate(dir.path(), &[4, 8])?;

    let settings = ConfigBuilder::new(dir.path()).build().cache_settings();
    let store = CacheStore::open(settings)?;
    let stats = store.stats()?;
    assert_eq!(stats.disk_entries, 2);
    assert_eq!(stats.indexed_in_memory, 0);

    for kernel in &kernels {
        let hit = store
            .match_compile_cache(kernel, ArtifactVariant::Whole)
            .ok_or("published entry not found")?;
        assert_eq!(&hit.kernel_name, kernel);
        assert!(hit.binary_path.starts_with(store.kernel_dir()));
    }
    Ok(())
}

#[test]
fn tampered_binary_is_rebuilt() -> TestResult {
    let dir = tempdir()?;
    let kernels = populate(dir.path(), &[4])?;

    let settings = ConfigBuilder::new(dir.path()).build().cache_settings();
    let store = CacheStore::open(settings)?;
    fs::write(store.binary_path(&kernels[0], ArtifactVariant::Whole), b"not the same bytes")?;

    let (coord, backend) = coordinator(dir.path());
    assert_eq!(coord.submit(mul_task(2, 1, 4), BuildStrategy::default())?, TaskStatus::Pending);
    assert_eq!(backend.submit_count(), 1);

    backend.complete_all();
    let records = coord.wait_all_finished(2)?;
    assert_eq!(records[0].compile_ret_type, CompileRetType::Online);

    // The republished entry verifies again.
    store.forget_in_memory();
    assert!(store.match_compile_cache(&kernels[0], ArtifactVariant::Whole).is_some());
    Ok(())
}

#[test]
fn eviction_skips_entries_being_rebuilt() -> TestResult {
    let dir = tempdir()?;
    let kernels = populate(dir.path(), &[2, 3, 5])?;

    // A forced rebuild holds the first kernel's build lock.
    let (rebuilder, rebuild_backend) =
        coordinator_with(ConfigBuilder::new(dir.path()).mode(CacheMode::Force).build());
    rebuilder.submit(mul_task(7, 1, 2), BuildStrategy::default())?;
    assert_eq!(rebuild_backend.submit_count(), 1);

    let mut settings = ConfigBuilder::new(dir.path()).build().cache_settings();
    settings.max_bytes = 1;
    let store = CacheStore::open(settings)?;
    let report = store.evict_to_budget()?;

    assert_eq!(report.scanned, 3);
    assert_eq!(report.evicted, 2);
    assert_eq!(report.skipped_locked, 1);
    assert!(report.bytes_after < report.bytes_before);

    assert!(store.descriptor_path(&kernels[0], ArtifactVariant::Whole).exists());
    assert!(!store.descriptor_path(&kernels[1], ArtifactVariant::Whole).exists());
    assert!(!store.descriptor_path(&kernels[2], ArtifactVariant::Whole).exists());
    Ok(())
}

#[test]
fn evicted_entry_is_built_again() -> TestResult {
    let dir = tempdir()?;
    populate(dir.path(), &[6])?;

    let mut settings = ConfigBuilder::new(dir.path()).build().cache_settings();
    settings.max_bytes = 1;
    assert_eq!(CacheStore::open(settings)?.evict_to_budget()?.evicted, 1);

    let (coord, backend) = coordinator(dir.path());
    assert_eq!(coord.submit(mul_task(3, 1, 6), BuildStrategy::default())?, TaskStatus::Pending);
    assert_eq!(backend.submit_count(), 1);
    Ok(())
}

#[test]
fn unlimited_budget_keeps_everything() -> TestResult {
    let dir = tempdir()?;
    populate(dir.path(), &[1, 2])?;

    let settings = ConfigBuilder::new(dir.path()).max_size_mb(0).build().cache_settings();
    let report = CacheStore::open(settings)?.evict_to_budget()?;
    assert_eq!(report.scanned, 2);
    assert_eq!(report.evicted, 0);
    assert_eq!(report.bytes_after, report.bytes_before);
    Ok(())
}

#[test]
fn publishing_over_budget_evicts_older_entries() -> TestResult {
    let dir = tempdir()?;
    let config = ConfigBuilder::new(dir.path()).max_size_mb(1).build();
    let settings = config.cache_settings();
    let (coord, backend) = coordinator_with(config);
    backend.binary_size(600 * 1024);

    coord.submit(mul_task(1, 1, 4), BuildStrategy::default())?;
    backend.complete_all();
    coord.wait_all_finished(1)?;

    coord.submit(mul_task(2, 1, 8), BuildStrategy::default())?;
    backend.complete_all();
    let records = coord.wait_all_finished(2)?;
    assert_eq!(records[0].status, TaskStatus::Succeeded);

    let kernels: Vec<String> = backend.submitted().into_iter().map(|j| j.kernel_name).collect();
    let store = CacheStore::open(settings)?;
    assert!(!store.descriptor_path(&kernels[0], ArtifactVariant::Whole).exists());
    assert!(store.descriptor_path(&kernels[1], ArtifactVariant::Whole).exists());

    // The evicted kernel is a miss for the coordinator that evicted it.
    assert_eq!(coord.submit(mul_task(3, 1, 4), BuildStrategy::default())?, TaskStatus::Pending);
    assert_eq!(backend.submit_count(), 3);
    Ok(())
}
