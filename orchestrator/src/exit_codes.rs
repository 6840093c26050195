//! Stable exit codes for orchestrator CLI commands.

/// Command succeeded (plan valid, report written).
pub const OK: i32 = 0;
/// Plan, state, or config was rejected, or another error occurred.
pub const INVALID: i32 = 1;
