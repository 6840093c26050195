//! Planner adapter: turn a planner capability's output into a [`Plan`].
//!
//! Plan generation is external. The only contract is the output shape: the
//! planner's `Success` value must deserialize as a plan document (the `goal`
//! field may be omitted and defaults to the requested goal). The plan still
//! goes through [`crate::executor::Executor::execute`], which validates it.

use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::capability::{Capability, Invocation};
use crate::core::plan::Plan;
use crate::core::state::SessionState;
use crate::core::types::ExecutionResult;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlannerError {
    #[error("planner needs clarification: {}", .0.join(", "))]
    NeedsClarification(Vec<String>),
    #[error("planner failed: {0}")]
    Failed(String),
    #[error("planner did not run: {0}")]
    Skipped(String),
    #[error("planner output is not a plan: {0}")]
    Malformed(String),
}

/// Invoke `planner` with the goal and a state snapshot and parse its plan.
#[instrument(skip_all, fields(planner = planner.name(), goal = %goal))]
pub async fn plan_from_capability(
    planner: &dyn Capability,
    goal: &str,
    state: &SessionState,
) -> Result<Plan, PlannerError> {
    let mut invocation = Invocation::new("plan");
    invocation.params.insert("goal".to_string(), json!(goal));
    invocation.state = state.snapshot();

    match planner.invoke(invocation).await {
        ExecutionResult::Success(value) => parse_plan(value, goal),
        ExecutionResult::NeedsClarification(fields) => Err(PlannerError::NeedsClarification(fields)),
        ExecutionResult::Failed(reason) => Err(PlannerError::Failed(reason)),
        ExecutionResult::Skipped(reason) => Err(PlannerError::Skipped(reason.to_string())),
    }
}

fn parse_plan(mut value: Value, goal: &str) -> Result<Plan, PlannerError> {
    if let Value::Object(fields) = &mut value {
        fields
            .entry("goal")
            .or_insert_with(|| Value::String(goal.to_string()));
    }
    let plan: Plan =
        serde_json::from_value(value).map_err(|err| PlannerError::Malformed(err.to_string()))?;
    debug!(steps = plan.len(), "planner produced plan");
    Ok(plan)
}
