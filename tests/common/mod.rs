#![allow(dead_code)]

use std::path::Path;

use kernelbuild::binary::NoRegistry;
use kernelbuild::config::Config;
use kernelbuild::ledger::Coordinator;
use kernelbuild_test_utils::builders::ConfigBuilder;
use kernelbuild_test_utils::fake_backend::{FakeBackend, FakeBackendHandle};
use kernelbuild_test_utils::init_tracing;

/// A coordinator over `root` driven by a fake backend.
pub fn coordinator(root: &Path) -> (Coordinator, FakeBackendHandle) {
    coordinator_with(ConfigBuilder::new(root).build())
}

pub fn coordinator_with(config: Config) -> (Coordinator, FakeBackendHandle) {
    init_tracing();
    let (backend, handle) = FakeBackend::boxed();
    let coordinator = Coordinator::init(config, backend, Box::new(NoRegistry)).unwrap();
    (coordinator, handle)
}
