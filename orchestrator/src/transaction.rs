//! Gated commit workflow.
//!
//! A transaction walks strictly forward through
//! `CollectingSubject → ValidatingSubject → CheckingPrecondition →
//! AwaitingConfirmation → Committing → {Posted | Aborted}`. The first three
//! phases are gates evaluated against the current state; the commit
//! capability is invoked at most once per run and only after an explicit
//! affirmative confirmation flag.
//!
//! The commit is an ordinary one-step plan whose declared write is the
//! transaction key, so the receipt reaches the store through the executor
//! like any other step output.
//!
//! A run that stops in `AwaitingConfirmation` is resumable: once the caller
//! records the confirmation, running the workflow again re-evaluates every
//! gate from the start.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::core::gate::{FlagGate, Gate, GateStatus, PresenceGate, ThresholdGate};
use crate::core::plan::{Binding, Plan, Step};
use crate::core::state::SessionState;
use crate::core::types::{Clarification, ExecutionResult};
use crate::core::validate::PlanError;
use crate::executor::{ExecutionReport, ExecutionStop, Executor};

/// State keys used by the funds-transfer preset.
pub mod transfer_keys {
    pub const PAYEE_ID: &str = "transfer.payee_id";
    pub const ACCOUNT_VALID: &str = "transfer.account_valid";
    pub const AVAILABLE: &str = "transfer.available";
    pub const AMOUNT: &str = "transfer.amount";
    pub const CONFIRMED: &str = "transfer.confirmed";
    pub const TRANSFER_ID: &str = "transfer.transfer_id";
}

const COMMIT_STEP: &str = "commit";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "reason", rename_all = "snake_case")]
pub enum Phase {
    CollectingSubject,
    ValidatingSubject,
    CheckingPrecondition,
    AwaitingConfirmation,
    Committing,
    Posted,
    Aborted(String),
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Posted | Self::Aborted(_))
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CollectingSubject => f.write_str("collecting_subject"),
            Self::ValidatingSubject => f.write_str("validating_subject"),
            Self::CheckingPrecondition => f.write_str("checking_precondition"),
            Self::AwaitingConfirmation => f.write_str("awaiting_confirmation"),
            Self::Committing => f.write_str("committing"),
            Self::Posted => f.write_str("posted"),
            Self::Aborted(reason) => write!(f, "aborted ({reason})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransactionOutcome {
    /// Phase the run ended in: terminal, or `AwaitingConfirmation`.
    pub phase: Phase,
    /// Every phase entered, in order, starting with `CollectingSubject`.
    pub history: Vec<Phase>,
    pub final_state: SessionState,
    pub transaction_id: Option<String>,
    /// Report of the commit run, when the commit step was submitted.
    pub commit: Option<ExecutionReport>,
    pub clarification: Option<Clarification>,
}

impl TransactionOutcome {
    pub fn is_posted(&self) -> bool {
        self.phase == Phase::Posted
    }
}

pub struct TransactionalWorkflow {
    subject: Arc<dyn Gate>,
    validation: Arc<dyn Gate>,
    precondition: Arc<dyn Gate>,
    confirmation_key: String,
    commit_capability: String,
    commit_bindings: BTreeMap<String, Binding>,
    transaction_key: String,
}

impl TransactionalWorkflow {
    pub fn new(
        subject: Arc<dyn Gate>,
        validation: Arc<dyn Gate>,
        precondition: Arc<dyn Gate>,
        commit_capability: impl Into<String>,
    ) -> Self {
        Self {
            subject,
            validation,
            precondition,
            confirmation_key: "confirmed".to_string(),
            commit_capability: commit_capability.into(),
            commit_bindings: BTreeMap::new(),
            transaction_key: "transaction_id".to_string(),
        }
    }

    /// Canonical funds-transfer wiring over the `transfer.*` keys.
    pub fn funds_transfer(commit_capability: impl Into<String>) -> Self {
        use transfer_keys::{ACCOUNT_VALID, AMOUNT, AVAILABLE, CONFIRMED, PAYEE_ID, TRANSFER_ID};

        Self::new(
            Arc::new(PresenceGate::new("counterpart", PAYEE_ID, "counterpart not found")),
            Arc::new(FlagGate::new(
                "source_account",
                ACCOUNT_VALID,
                "source account not found",
            )),
            Arc::new(ThresholdGate::new(
                "sufficient_funds",
                AVAILABLE,
                AMOUNT,
                "insufficient funds",
            )),
            commit_capability,
        )
        .confirmation_key(CONFIRMED)
        .bind("payee_id", PAYEE_ID)
        .bind("amount", AMOUNT)
        .transaction_key(TRANSFER_ID)
    }

    pub fn confirmation_key(mut self, key: impl Into<String>) -> Self {
        self.confirmation_key = key.into();
        self
    }

    /// Bind a commit parameter to a state key.
    pub fn bind(mut self, param: impl Into<String>, key: impl Into<String>) -> Self {
        self.commit_bindings
            .insert(param.into(), Binding::State(key.into()));
        self
    }

    /// State key the commit receipt is written to.
    pub fn transaction_key(mut self, key: impl Into<String>) -> Self {
        self.transaction_key = key.into();
        self
    }

    /// Advance from `CollectingSubject` as far as the state allows.
    ///
    /// Returns `Err` only when the commit plan is rejected by validation
    /// (unregistered commit capability or an unbound commit parameter); the
    /// commit capability is not invoked in that case.
    #[instrument(skip_all, fields(commit = %self.commit_capability))]
    pub async fn run(
        &self,
        executor: &Executor,
        state: SessionState,
        cancel: &CancellationToken,
    ) -> Result<TransactionOutcome, PlanError> {
        let mut outcome = TransactionOutcome {
            phase: Phase::CollectingSubject,
            history: vec![Phase::CollectingSubject],
            final_state: state,
            transaction_id: None,
            commit: None,
            clarification: None,
        };

        let gates = [
            (&self.subject, Phase::ValidatingSubject),
            (&self.validation, Phase::CheckingPrecondition),
            (&self.precondition, Phase::AwaitingConfirmation),
        ];
        for (gate, next) in gates {
            if let GateStatus::Blocked(reason) = gate.evaluate(&outcome.final_state) {
                warn!(gate = gate.name(), phase = %outcome.phase, reason = %reason, "transaction gate blocked");
                outcome.advance(Phase::Aborted(reason));
                return Ok(outcome);
            }
            outcome.advance(next);
        }

        match outcome.final_state.value(&self.confirmation_key) {
            Some(Value::Bool(true)) => outcome.advance(Phase::Committing),
            Some(Value::Bool(false)) => {
                outcome.advance(Phase::Aborted("confirmation declined".to_string()));
                return Ok(outcome);
            }
            _ => {
                info!(key = %self.confirmation_key, "awaiting confirmation");
                return Ok(outcome);
            }
        }

        let plan = Plan::new(format!("commit via {}", self.commit_capability)).step(Step {
            input_bindings: self.commit_bindings.clone(),
            ..Step::new(COMMIT_STEP, &self.commit_capability)
                .purpose("commit the transaction")
                .writes(&self.transaction_key)
        });
        let state = std::mem::take(&mut outcome.final_state);
        let report = executor.execute(&plan, state, cancel).await?;
        outcome.final_state = report.final_state.clone();

        let next = match (&report.stop, report.result(COMMIT_STEP)) {
            (ExecutionStop::Cancelled { .. }, _) => Phase::Aborted("cancelled".to_string()),
            (ExecutionStop::Clarification(clarification), _) => {
                outcome.clarification = Some(clarification.clone());
                Phase::Aborted(format!(
                    "commit needs clarification: {}",
                    clarification.missing_fields.join(", ")
                ))
            }
            (_, Some(ExecutionResult::Success(value))) => {
                outcome.transaction_id = transaction_id(value);
                Phase::Posted
            }
            (_, Some(ExecutionResult::Failed(reason))) => Phase::Aborted(reason.clone()),
            (_, Some(ExecutionResult::Skipped(reason))) => Phase::Aborted(reason.to_string()),
            (_, Some(ExecutionResult::NeedsClarification(_)) | None) => {
                Phase::Aborted("commit did not run".to_string())
            }
        };
        outcome.commit = Some(report);
        info!(phase = %next, "transaction finished");
        outcome.advance(next);
        Ok(outcome)
    }
}

impl TransactionOutcome {
    fn advance(&mut self, next: Phase) {
        self.history.push(next.clone());
        self.phase = next;
    }
}

/// A commit value is either the id itself or an object carrying `transaction_id`.
fn transaction_id(value: &Value) -> Option<String> {
    match value {
        Value::String(id) => Some(id.clone()),
        Value::Object(fields) => fields
            .get("transaction_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityRegistry, Registry, ToolCapability};
    use crate::core::gate::GateRegistry;
    use serde_json::json;
    use transfer_keys::{ACCOUNT_VALID, AMOUNT, AVAILABLE, CONFIRMED, PAYEE_ID, TRANSFER_ID};

    fn executor() -> Executor {
        Executor::new(Registry::new(
            CapabilityRegistry::new()
                .with(ToolCapability::worker("post_transfer", |inv| {
                    assert_eq!(inv.param("amount"), Some(&json!(250)));
                    ExecutionResult::Success(json!({"transaction_id": "tx-77"}))
                }))
                .with(ToolCapability::worker("reject_transfer", |_| {
                    ExecutionResult::failed("core banking unavailable")
                })),
            GateRegistry::new(),
        ))
    }

    fn ready_state(confirmed: Option<bool>) -> SessionState {
        let mut state = SessionState::from_values([
            (PAYEE_ID, json!("p-9")),
            (ACCOUNT_VALID, json!(true)),
            (AVAILABLE, json!(1000)),
            (AMOUNT, json!(250)),
        ])
        .expect("state");
        if let Some(flag) = confirmed {
            state.set(CONFIRMED, json!(flag)).expect("confirm");
        }
        state
    }

    #[tokio::test]
    async fn confirmed_transfer_posts() {
        let exec = executor();
        let outcome = TransactionalWorkflow::funds_transfer("post_transfer")
            .run(&exec, ready_state(Some(true)), &CancellationToken::new())
            .await
            .expect("run");

        assert!(outcome.is_posted());
        assert_eq!(outcome.transaction_id.as_deref(), Some("tx-77"));
        assert_eq!(
            outcome.final_state.get(TRANSFER_ID).expect("receipt"),
            &json!({"transaction_id": "tx-77"})
        );
        let commit = outcome.commit.as_ref().expect("commit report");
        let diff = &commit.entry(COMMIT_STEP).expect("commit entry").state_diff;
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].key, TRANSFER_ID);
        assert_eq!(
            outcome.history,
            vec![
                Phase::CollectingSubject,
                Phase::ValidatingSubject,
                Phase::CheckingPrecondition,
                Phase::AwaitingConfirmation,
                Phase::Committing,
                Phase::Posted,
            ]
        );
    }

    #[tokio::test]
    async fn missing_confirmation_waits_and_declined_aborts() {
        let exec = executor();
        let workflow = TransactionalWorkflow::funds_transfer("post_transfer");

        let waiting = workflow
            .run(&exec, ready_state(None), &CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(waiting.phase, Phase::AwaitingConfirmation);
        assert!(waiting.commit.is_none());

        let declined = workflow
            .run(&exec, ready_state(Some(false)), &CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(
            declined.phase,
            Phase::Aborted("confirmation declined".to_string())
        );
        assert!(declined.commit.is_none());
    }

    #[tokio::test]
    async fn insufficient_funds_aborts_at_precondition() {
        let exec = executor();
        let mut state = ready_state(Some(true));
        state.set(AMOUNT, json!(5000)).expect("amount");

        let outcome = TransactionalWorkflow::funds_transfer("post_transfer")
            .run(&exec, state, &CancellationToken::new())
            .await
            .expect("run");

        assert_eq!(outcome.phase, Phase::Aborted("insufficient funds".to_string()));
        assert_eq!(outcome.history.len(), 4);
        assert!(outcome.commit.is_none());
    }

    #[tokio::test]
    async fn failed_commit_aborts() {
        let exec = executor();
        let outcome = TransactionalWorkflow::funds_transfer("reject_transfer")
            .run(&exec, ready_state(Some(true)), &CancellationToken::new())
            .await
            .expect("run");

        assert_eq!(
            outcome.phase,
            Phase::Aborted("core banking unavailable".to_string())
        );
        assert!(outcome.transaction_id.is_none());
        assert!(!outcome.final_state.contains(TRANSFER_ID));
    }

    #[test]
    fn transaction_id_accepts_string_or_object() {
        assert_eq!(transaction_id(&json!("tx-1")), Some("tx-1".to_string()));
        assert_eq!(
            transaction_id(&json!({"transaction_id": "tx-2"})),
            Some("tx-2".to_string())
        );
        assert_eq!(transaction_id(&json!(42)), None);
    }
}
