//! Task orchestration engine.
//!
//! Plans are DAGs of steps, each bound to a named agent capability. The
//! engine validates a plan up front, then runs it layer by layer against a
//! versioned session state, enforcing gates and recording an execution
//! trace. The crate keeps a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (plans, state, gates, validation).
//!   No I/O and no async.
//! - **[`io`]**: Config, plan documents, trace export.
//!
//! The async layer ([`executor`], [`looping`], [`sequential`],
//! [`transaction`], [`planner`]) coordinates core logic with capability calls.

pub mod capability;
pub mod core;
pub mod executor;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod planner;
pub mod sequential;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod transaction;
