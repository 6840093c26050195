//! Linear pipeline mode.
//!
//! A sequence is a degenerate plan where every stage hard-depends on the one
//! before it, so the first stage that does not succeed stops the chain and
//! no later stage is invoked.

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::core::plan::{Plan, Step};
use crate::core::state::SessionState;
use crate::core::types::{Clarification, ExecutionResult, SkipReason};
use crate::core::validate::PlanError;
use crate::executor::{ExecutionReport, ExecutionStop, Executor};

/// How the chain ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SequenceStatus {
    Completed,
    Failed { stage: String, reason: String },
    Blocked { stage: String, reason: SkipReason },
    NeedsClarification(Clarification),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct SequenceOutcome {
    pub status: SequenceStatus,
    /// Value of the last stage that succeeded.
    pub output: Option<Value>,
    pub report: ExecutionReport,
}

impl SequenceOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == SequenceStatus::Completed
    }
}

pub struct SequentialController<'a> {
    executor: &'a Executor,
}

impl<'a> SequentialController<'a> {
    pub fn new(executor: &'a Executor) -> Self {
        Self { executor }
    }

    /// Run `stages` in order. Existing `depends_on` edges are kept; each stage
    /// additionally depends on its predecessor.
    #[instrument(skip_all, fields(goal = %goal.as_ref(), stages = stages.len()))]
    pub async fn run(
        &self,
        goal: impl AsRef<str>,
        stages: Vec<Step>,
        initial: SessionState,
        cancel: &CancellationToken,
    ) -> Result<SequenceOutcome, PlanError> {
        let order: Vec<String> = stages.iter().map(|stage| stage.id.clone()).collect();
        let plan = Plan::chain(goal.as_ref(), stages);
        let report = self.executor.execute(&plan, initial, cancel).await?;

        let mut output = None;
        let mut status = SequenceStatus::Completed;
        for id in &order {
            match report.result(id) {
                Some(ExecutionResult::Success(value)) => output = Some(value.clone()),
                Some(ExecutionResult::Failed(reason)) => {
                    status = SequenceStatus::Failed {
                        stage: id.clone(),
                        reason: reason.clone(),
                    };
                    break;
                }
                Some(ExecutionResult::Skipped(reason)) => {
                    status = SequenceStatus::Blocked {
                        stage: id.clone(),
                        reason: reason.clone(),
                    };
                    break;
                }
                Some(ExecutionResult::NeedsClarification(_)) | None => break,
            }
        }
        match &report.stop {
            ExecutionStop::Clarification(clarification) => {
                status = SequenceStatus::NeedsClarification(clarification.clone());
            }
            ExecutionStop::Cancelled { .. } => status = SequenceStatus::Cancelled,
            ExecutionStop::Completed => {}
        }

        info!(?status, "sequence finished");
        Ok(SequenceOutcome {
            status,
            output,
            report,
        })
    }
}
