//! Shared deterministic types for orchestration core logic.
//!
//! These types define stable contracts between the executor, the controllers
//! and capability implementations. They serialize into exported traces, so
//! their serde shape is part of the audit format.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of one step. Immutable once recorded in a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum ExecutionResult {
    /// The capability produced a value. An empty value is still a success.
    Success(Value),
    /// The capability lacks input; execution halts and the signal goes to the caller.
    NeedsClarification(Vec<String>),
    /// The capability (or input binding) failed.
    Failed(String),
    /// The step never ran.
    Skipped(SkipReason),
}

impl ExecutionResult {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    pub fn clarify<S: Into<String>>(fields: impl IntoIterator<Item = S>) -> Self {
        Self::NeedsClarification(fields.into_iter().map(Into::into).collect())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::NeedsClarification(_) => "needs_clarification",
            Self::Failed(_) => "failed",
            Self::Skipped(_) => "skipped",
        }
    }
}

/// Why a step was not dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// A required gate evaluated to `Blocked` when the step became ready.
    GateBlocked { gate: String, message: String },
    /// A hard dependency did not succeed.
    Upstream { step: String },
}

impl SkipReason {
    /// Name of the blocking gate, if the skip came from one.
    pub fn gate(&self) -> Option<&str> {
        match self {
            Self::GateBlocked { gate, .. } => Some(gate),
            Self::Upstream { .. } => None,
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GateBlocked { gate, message } => write!(f, "gate '{gate}' blocked: {message}"),
            Self::Upstream { step } => write!(f, "upstream step '{step}' did not succeed"),
        }
    }
}

/// Capability variant. Only conversational capabilities may address the end user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Conversational,
    #[default]
    Worker,
}

/// Party that must answer a clarification request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    /// The code that submitted the plan (worker clarifications).
    Caller,
    /// The human in the conversation (conversational clarifications).
    EndUser,
}

impl From<CapabilityKind> for Audience {
    fn from(kind: CapabilityKind) -> Self {
        match kind {
            CapabilityKind::Conversational => Audience::EndUser,
            CapabilityKind::Worker => Audience::Caller,
        }
    }
}

/// Halting signal raised by a step that needs more input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clarification {
    pub step_id: String,
    pub missing_fields: Vec<String>,
    pub audience: Audience,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn results_serialize_with_status_tag() {
        let value = serde_json::to_value(ExecutionResult::Success(json!([]))).expect("json");
        assert_eq!(value, json!({"status": "success", "detail": []}));

        let skipped = ExecutionResult::Skipped(SkipReason::GateBlocked {
            gate: "authentication".to_string(),
            message: "MISSING".to_string(),
        });
        let value = serde_json::to_value(&skipped).expect("json");
        assert_eq!(
            value,
            json!({
                "status": "skipped",
                "detail": {"kind": "gate_blocked", "gate": "authentication", "message": "MISSING"}
            })
        );
        let back: ExecutionResult = serde_json::from_value(value).expect("parse");
        assert_eq!(back, skipped);
    }

    #[test]
    fn worker_clarifications_go_to_caller() {
        assert_eq!(Audience::from(CapabilityKind::Worker), Audience::Caller);
        assert_eq!(
            Audience::from(CapabilityKind::Conversational),
            Audience::EndUser
        );
    }
}
