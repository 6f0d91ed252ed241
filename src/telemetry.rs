//! Optional tracing setup, mirroring the teacher's
//! `tools::synthetic_node::enable_tracing`. The crate never installs a
//! global subscriber on its own; hosts and tests opt in explicitly.

use tracing_subscriber::{fmt, EnvFilter};

/// Installs an `EnvFilter`-driven `fmt` subscriber for the current process.
/// Safe to call multiple times from independent test binaries; later
/// calls after the first are no-ops.
pub fn init() {
    let _ = fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
