//! Development-time tracing for the orchestrator.
//!
//! Tracing is diagnostics only: it goes to stderr and is filtered by
//! `RUST_LOG`. The audit artifact of a run is the exported execution trace
//! (`io/trace_export`), which is written regardless of the log filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the stderr subscriber. Defaults to `warn` when `RUST_LOG` is unset.
///
/// ```bash
/// RUST_LOG=orchestrator=debug orchestrator validate --plan plan.json
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    // A subscriber already installed by the host application is kept.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
