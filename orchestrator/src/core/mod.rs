//! Deterministic, pure logic shared by the orchestration engine.
//!
//! Core modules must be free of I/O and async. They operate on in-memory
//! plans and state and return deterministic outputs suitable for tests.

pub mod gate;
pub mod plan;
pub mod state;
pub mod stats;
pub mod types;
pub mod validate;
