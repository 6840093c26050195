//! I/O helpers for the orchestrator CLI and embedding applications.

pub mod config;
pub mod plan_document;
pub mod trace_export;
