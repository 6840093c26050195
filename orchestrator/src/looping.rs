//! Bounded act → review refinement loop.
//!
//! Each cycle is a two-step plan run through the [`Executor`]: the actor
//! produces a candidate, the reviewer judges it. Reviewer feedback threads
//! into the next acting input. The loop never runs more than
//! `max_iterations` acting cycles.
//!
//! Cancellation is observed between cycles only: a cycle that has started
//! always runs its review.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::plan::{Plan, Step};
use crate::core::state::SessionState;
use crate::core::types::{Clarification, ExecutionResult};
use crate::core::validate::PlanError;
use crate::executor::{ExecutionReport, ExecutionStop, Executor, TraceEntry};

/// State key holding the most recent candidate.
pub const CANDIDATE_KEY: &str = "loop.candidate";
/// State key holding the most recent review.
pub const REVIEW_KEY: &str = "loop.review";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoopError {
    #[error("max_iterations must be at least 1")]
    ZeroIterations,
    #[error("cycle plan rejected: {0}")]
    Plan(#[from] PlanError),
}

/// Reviewer verdict, parsed from the review step's value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Review {
    Satisfied,
    Unsatisfied {
        #[serde(default)]
        feedback: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Satisfied,
    MaxIterations,
    Cancelled,
    Failed,
    NeedsClarification,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Satisfied => "satisfied",
            Self::MaxIterations => "max_iterations",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::NeedsClarification => "needs_clarification",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopState {
    pub iteration_count: u32,
    pub max_iterations: u32,
    pub exit_reason: Option<ExitReason>,
}

impl LoopState {
    fn enter(max_iterations: u32) -> Self {
        Self {
            iteration_count: 0,
            max_iterations,
            exit_reason: None,
        }
    }
}

/// Summary of one loop invocation.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    /// Last candidate the actor produced, if any.
    pub result: Option<Value>,
    pub state: LoopState,
    pub final_state: SessionState,
    /// Trace entries of every cycle, in execution order.
    pub trace: Vec<TraceEntry>,
    pub clarification: Option<Clarification>,
    pub failure: Option<String>,
}

/// Drives the actor/reviewer pair named by capability.
pub struct LoopController<'a> {
    executor: &'a Executor,
    actor: String,
    reviewer: String,
}

enum Cycle {
    Reviewed(Review),
    Exit(ExitReason),
}

impl<'a> LoopController<'a> {
    pub fn new(executor: &'a Executor, actor: impl Into<String>, reviewer: impl Into<String>) -> Self {
        Self {
            executor,
            actor: actor.into(),
            reviewer: reviewer.into(),
        }
    }

    /// Run up to `max_iterations` act → review cycles over `task`.
    #[instrument(skip_all, fields(actor = %self.actor, reviewer = %self.reviewer, max_iterations = max_iterations))]
    pub async fn run(
        &self,
        task: Value,
        initial: SessionState,
        max_iterations: u32,
        cancel: &CancellationToken,
    ) -> Result<LoopOutcome, LoopError> {
        if max_iterations == 0 {
            return Err(LoopError::ZeroIterations);
        }

        let mut loop_state = LoopState::enter(max_iterations);
        let mut outcome = LoopOutcome {
            result: None,
            state: loop_state.clone(),
            final_state: initial,
            trace: Vec::new(),
            clarification: None,
            failure: None,
        };
        let mut feedback: Option<String> = None;

        let exit = loop {
            if cancel.is_cancelled() {
                break ExitReason::Cancelled;
            }

            let iteration = loop_state.iteration_count + 1;
            let plan = self.cycle_plan(&task, iteration, feedback.as_deref(), outcome.result.as_ref());
            let state = std::mem::take(&mut outcome.final_state);
            let report = self
                .executor
                .execute(&plan, state, &CancellationToken::new())
                .await?;

            if report.entry(&act_id(iteration)).is_some() {
                loop_state.iteration_count = iteration;
            }
            let cycle = self.judge(&report, iteration, &mut outcome);
            outcome.final_state = report.final_state;
            outcome.trace.extend(report.trace);

            match cycle {
                Cycle::Exit(reason) => break reason,
                Cycle::Reviewed(Review::Satisfied) => break ExitReason::Satisfied,
                Cycle::Reviewed(Review::Unsatisfied { feedback: next }) => {
                    debug!(iteration, feedback = %next, "candidate rejected");
                    if loop_state.iteration_count >= max_iterations {
                        break ExitReason::MaxIterations;
                    }
                    feedback = Some(next);
                }
            }
        };

        info!(
            iterations = loop_state.iteration_count,
            exit_reason = exit.as_str(),
            "loop exited"
        );
        loop_state.exit_reason = Some(exit);
        outcome.state = loop_state;
        Ok(outcome)
    }

    fn cycle_plan(
        &self,
        task: &Value,
        iteration: u32,
        feedback: Option<&str>,
        previous: Option<&Value>,
    ) -> Plan {
        let act = act_id(iteration);
        Plan::new(format!("refine iteration {iteration}"))
            .step(
                Step::new(&act, &self.actor)
                    .purpose("produce a candidate")
                    .bind_literal("task", task.clone())
                    .bind_literal("iteration", json!(iteration))
                    .bind_literal("feedback", feedback.map_or(Value::Null, |text| json!(text)))
                    .bind_literal("previous", previous.cloned().unwrap_or(Value::Null))
                    .writes(CANDIDATE_KEY),
            )
            .step(
                Step::new(review_id(iteration), &self.reviewer)
                    .purpose("review the candidate")
                    .depends_on(act)
                    .bind_literal("task", task.clone())
                    .bind_state("candidate", CANDIDATE_KEY)
                    .writes(REVIEW_KEY),
            )
    }

    fn judge(&self, report: &ExecutionReport, iteration: u32, outcome: &mut LoopOutcome) -> Cycle {
        if let Some(candidate) = report.result(&act_id(iteration)).and_then(ExecutionResult::value) {
            outcome.result = Some(candidate.clone());
        }
        match &report.stop {
            ExecutionStop::Cancelled { .. } => return Cycle::Exit(ExitReason::Cancelled),
            ExecutionStop::Clarification(clarification) => {
                outcome.clarification = Some(clarification.clone());
                return Cycle::Exit(ExitReason::NeedsClarification);
            }
            ExecutionStop::Completed => {}
        }

        for id in [act_id(iteration), review_id(iteration)] {
            match report.result(&id) {
                Some(ExecutionResult::Failed(reason)) => {
                    warn!(step = %id, reason = %reason, "loop step failed");
                    outcome.failure = Some(reason.clone());
                    return Cycle::Exit(ExitReason::Failed);
                }
                Some(ExecutionResult::Skipped(reason)) => {
                    outcome.failure = Some(reason.to_string());
                    return Cycle::Exit(ExitReason::Failed);
                }
                _ => {}
            }
        }

        let verdict = report
            .result(&review_id(iteration))
            .and_then(ExecutionResult::value)
            .cloned()
            .unwrap_or(Value::Null);
        match serde_json::from_value::<Review>(verdict) {
            Ok(review) => Cycle::Reviewed(review),
            Err(err) => {
                outcome.failure = Some(format!("malformed review: {err}"));
                Cycle::Exit(ExitReason::Failed)
            }
        }
    }
}

fn act_id(iteration: u32) -> String {
    format!("act-{iteration}")
}

fn review_id(iteration: u32) -> String {
    format!("review-{iteration}")
}
