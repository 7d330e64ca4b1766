//! Test support for `kernelbuild`.
//!
//! - [`fake_backend`]: a compile backend the test completes by hand.
//! - [`builders`]: configs rooted in a temp dir, and op descriptions.

pub mod builders;
pub mod fake_backend;

pub use builders::{ConfigBuilder, OpDescBuilder};
pub use fake_backend::{FakeBackend, FakeBackendHandle};

use std::sync::Once;
use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

/// Used when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "kernelbuild=debug,warn";

/// Install a tracing subscriber for the current test binary.
///
/// Output goes through the test writer and is only shown for failing tests
/// or with `--nocapture`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
        // Some other test in this binary may own the global subscriber.
        let _ = fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_thread_names(true)
            .try_init();
    });
}
