//! Layered DAG executor.
//!
//! A validated plan runs layer by layer. Steps inside a layer are dispatched
//! concurrently and joined at a barrier; their writes are committed in
//! ascending step id order before the next layer becomes ready, so every
//! capability in layer N+1 observes the complete effects of layer N.
//!
//! Execution never returns an error once validation passes. Failures, skips
//! and halts are recorded in the trace instead; that includes timeouts,
//! capability panics and outputs that violate a step's declared schema.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::capability::{Invocation, Registry};
use crate::core::gate::GateStatus;
use crate::core::plan::{Binding, Plan, Step};
use crate::core::state::{SessionState, StateChange};
use crate::core::types::{Audience, Clarification, ExecutionResult, SkipReason};
use crate::core::validate::{Layering, PlanError, validate};

/// Dispatch limits applied to every layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Upper bound on concurrent capability calls within one layer.
    pub max_parallel: usize,
    /// A call running longer than this resolves to `Failed`.
    pub step_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel: 8,
            step_timeout: Duration::from_secs(60),
        }
    }
}

/// One recorded step outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub step_id: String,
    pub capability: String,
    pub layer: usize,
    pub result: ExecutionResult,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub state_diff: Vec<StateChange>,
}

impl TraceEntry {
    /// Entry for a step resolved without dispatch (skipped, or unbindable input).
    fn resolved(step: &Step, layer: usize, result: ExecutionResult) -> Self {
        let now = Utc::now();
        Self {
            step_id: step.id.clone(),
            capability: step.capability.clone(),
            layer,
            result,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            state_diff: Vec::new(),
        }
    }
}

/// Why the run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ExecutionStop {
    /// Every layer ran (individual steps may still have failed or been skipped).
    Completed,
    /// A step needs more input; later layers were not started.
    Clarification(Clarification),
    /// The token fired before `layer` started.
    Cancelled { layer: usize },
}

impl ExecutionStop {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Clarification(_) => "needs_clarification",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub goal: String,
    pub layering: Layering,
    pub final_state: SessionState,
    pub trace: Vec<TraceEntry>,
    pub stop: ExecutionStop,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionReport {
    pub fn result(&self, step_id: &str) -> Option<&ExecutionResult> {
        self.entry(step_id).map(|entry| &entry.result)
    }

    pub fn entry(&self, step_id: &str) -> Option<&TraceEntry> {
        self.trace.iter().find(|entry| entry.step_id == step_id)
    }

    pub fn succeeded(&self, step_id: &str) -> bool {
        self.result(step_id).is_some_and(ExecutionResult::is_success)
    }

    pub fn clarification(&self) -> Option<&Clarification> {
        match &self.stop {
            ExecutionStop::Clarification(clarification) => Some(clarification),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.stop, ExecutionStop::Cancelled { .. })
    }

    pub fn duration_ms(&self) -> u64 {
        millis_between(self.started_at, self.finished_at)
    }
}

pub struct Executor {
    registry: Registry,
    config: ExecutorConfig,
}

struct Dispatched<'a> {
    step: &'a Step,
    result: ExecutionResult,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    elapsed: Duration,
}

impl Executor {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> ExecutorConfig {
        self.config
    }

    /// Validate `plan` against this executor's registry without running it.
    pub fn validate(&self, plan: &Plan, initial: &SessionState) -> Result<Layering, PlanError> {
        validate(plan, &initial.key_set(), &self.registry)
    }

    /// Run `plan` to completion, halt, or cancellation.
    ///
    /// Returns `Err` only when validation rejects the plan, in which case no
    /// capability has been invoked.
    #[instrument(skip_all, fields(goal = %plan.goal, steps = plan.len()))]
    pub async fn execute(
        &self,
        plan: &Plan,
        initial: SessionState,
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport, PlanError> {
        let layering = self.validate(plan, &initial).inspect_err(|err| {
            warn!(error = %err, "plan rejected");
        })?;
        let started_at = Utc::now();
        let mut state = initial;
        let mut trace: Vec<TraceEntry> = Vec::with_capacity(plan.len());
        let mut outcomes: BTreeMap<String, bool> = BTreeMap::new();
        let mut stop = ExecutionStop::Completed;

        for (index, layer) in layering.layers().iter().enumerate() {
            if cancel.is_cancelled() {
                info!(layer = index, "execution cancelled at layer boundary");
                stop = ExecutionStop::Cancelled { layer: index };
                break;
            }

            let mut entries: BTreeMap<&str, TraceEntry> = BTreeMap::new();
            let mut ready = Vec::new();
            for id in layer {
                let Some(step) = plan.get(id) else {
                    continue;
                };
                match self.prepare(step, &state, &outcomes) {
                    Ok(invocation) => ready.push((step, invocation)),
                    Err(result) => {
                        log_unready(step, &result);
                        entries.insert(&step.id, TraceEntry::resolved(step, index, result));
                    }
                }
            }

            for done in self.dispatch(ready).await {
                entries.insert(
                    &done.step.id,
                    TraceEntry {
                        step_id: done.step.id.clone(),
                        capability: done.step.capability.clone(),
                        layer: index,
                        result: done.result,
                        started_at: done.started_at,
                        finished_at: done.finished_at,
                        duration_ms: u64::try_from(done.elapsed.as_millis()).unwrap_or(u64::MAX),
                        state_diff: Vec::new(),
                    },
                );
            }

            let mut halt: Option<Clarification> = None;
            for (id, mut entry) in entries {
                let Some(step) = plan.get(id) else {
                    continue;
                };
                match &entry.result {
                    ExecutionResult::Success(value) => {
                        entry.state_diff = commit_writes(step, value, &mut state);
                    }
                    ExecutionResult::NeedsClarification(fields) => {
                        info!(step = %id, missing = ?fields, "step needs clarification");
                        if halt.is_none() {
                            halt = Some(Clarification {
                                step_id: step.id.clone(),
                                missing_fields: fields.clone(),
                                audience: self.audience_for(step),
                            });
                        }
                    }
                    ExecutionResult::Failed(_) | ExecutionResult::Skipped(_) => {}
                }
                outcomes.insert(step.id.clone(), entry.result.is_success());
                trace.push(entry);
            }

            if let Some(clarification) = halt {
                stop = ExecutionStop::Clarification(clarification);
                break;
            }
        }

        info!(stop = stop.label(), recorded = trace.len(), "execution finished");
        Ok(ExecutionReport {
            goal: plan.goal.clone(),
            layering,
            final_state: state,
            trace,
            stop,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Resolve prerequisites, gates and bindings for a step about to become ready.
    fn prepare(
        &self,
        step: &Step,
        state: &SessionState,
        outcomes: &BTreeMap<String, bool>,
    ) -> Result<Invocation, ExecutionResult> {
        if let Some(upstream) = step
            .depends_on
            .iter()
            .find(|dep| !outcomes.get(dep.as_str()).copied().unwrap_or(false))
        {
            return Err(ExecutionResult::Skipped(SkipReason::Upstream {
                step: upstream.clone(),
            }));
        }

        for name in &step.required_gates {
            let Some(gate) = self.registry.gates.get(name) else {
                return Err(ExecutionResult::failed(format!(
                    "gate '{name}' is not registered"
                )));
            };
            if let GateStatus::Blocked(message) = gate.evaluate(state) {
                return Err(ExecutionResult::Skipped(SkipReason::GateBlocked {
                    gate: name.clone(),
                    message,
                }));
            }
        }

        let mut params = BTreeMap::new();
        for (param, binding) in &step.input_bindings {
            let value = match binding {
                Binding::State(key) => state
                    .get(key)
                    .map_err(|err| ExecutionResult::failed(err.to_string()))?
                    .clone(),
                Binding::Literal(value) => value.clone(),
            };
            params.insert(param.clone(), value);
        }

        Ok(Invocation {
            step_id: step.id.clone(),
            params,
            state: state.snapshot(),
        })
    }

    async fn dispatch<'a>(&self, ready: Vec<(&'a Step, Invocation)>) -> Vec<Dispatched<'a>> {
        let mut calls = Vec::with_capacity(ready.len());
        for (step, invocation) in ready {
            calls.push(self.call(step, invocation));
        }
        stream::iter(calls)
            .buffer_unordered(self.config.max_parallel.max(1))
            .collect()
            .await
    }

    /// Invoke one capability under the step timeout. A panic inside the
    /// capability resolves to `Failed` like any other error.
    async fn call<'a>(&self, step: &'a Step, invocation: Invocation) -> Dispatched<'a> {
        let timeout = self.config.step_timeout;
        info!(step = %step.id, capability = %step.capability, "step started");
        let started_at = Utc::now();
        let clock = Instant::now();
        let result = match self.registry.capabilities.resolve(&step.capability) {
            None => ExecutionResult::failed(format!(
                "capability '{}' is not registered",
                step.capability
            )),
            Some(capability) => {
                let guarded = AssertUnwindSafe(capability.invoke(invocation)).catch_unwind();
                match tokio::time::timeout(timeout, guarded).await {
                    Ok(Ok(result)) => conform(step, result),
                    Ok(Err(panic)) => ExecutionResult::failed(format!(
                        "capability panicked: {}",
                        panic_message(&*panic)
                    )),
                    Err(_) => ExecutionResult::failed(format!(
                        "timed out after {}ms",
                        timeout.as_millis()
                    )),
                }
            }
        };
        let elapsed = clock.elapsed();
        match &result {
            ExecutionResult::Failed(reason) => {
                warn!(step = %step.id, reason = %reason, "step failed");
            }
            other => {
                info!(
                    step = %step.id,
                    status = other.label(),
                    elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    "step finished"
                );
            }
        }
        Dispatched {
            step,
            result,
            started_at,
            finished_at: Utc::now(),
            elapsed,
        }
    }

    fn audience_for(&self, step: &Step) -> Audience {
        self.registry
            .capabilities
            .resolve(&step.capability)
            .map(|capability| Audience::from(capability.kind()))
            .unwrap_or(Audience::Caller)
    }
}

fn log_unready(step: &Step, result: &ExecutionResult) {
    match result {
        ExecutionResult::Skipped(reason @ SkipReason::GateBlocked { .. }) => {
            warn!(step = %step.id, %reason, "step skipped");
        }
        ExecutionResult::Skipped(reason) => {
            info!(step = %step.id, %reason, "step skipped");
        }
        ExecutionResult::Failed(reason) => {
            warn!(step = %step.id, reason = %reason, "step failed before dispatch");
        }
        _ => {}
    }
}

/// Commit a successful step's declared writes.
///
/// A single declared key receives the whole value. With several keys the
/// value must be an object; each key takes the field named by the full key
/// or, failing that, by its last dotted segment. Keys with no matching field
/// are left untouched.
fn commit_writes(step: &Step, value: &Value, state: &mut SessionState) -> Vec<StateChange> {
    let assignments: Vec<(&String, &Value)> = if step.writes.len() == 1 {
        step.writes.iter().map(|key| (key, value)).collect()
    } else {
        let Some(object) = value.as_object() else {
            if !step.writes.is_empty() {
                warn!(step = %step.id, "multi-key writes need an object value; nothing committed");
            }
            return Vec::new();
        };
        step.writes
            .iter()
            .filter_map(|key| {
                let segment = key.rsplit('.').next().unwrap_or(key);
                object
                    .get(key.as_str())
                    .or_else(|| object.get(segment))
                    .map(|field| (key, field))
            })
            .collect()
    };

    let mut changes = Vec::with_capacity(assignments.len());
    for (key, field) in assignments {
        match state.apply(key, field.clone()) {
            Ok(change) => {
                debug!(step = %step.id, key = %key, version = change.version, "state committed");
                changes.push(change);
            }
            Err(err) => warn!(step = %step.id, error = %err, "state write refused"),
        }
    }
    changes
}

/// Check a successful output against the step's declared schema.
fn conform(step: &Step, result: ExecutionResult) -> ExecutionResult {
    let ExecutionResult::Success(value) = &result else {
        return result;
    };
    let validator = match step.output_validator() {
        Ok(Some(validator)) => validator,
        Ok(None) => return result,
        Err(message) => return ExecutionResult::failed(format!("invalid output schema: {message}")),
    };
    let errors: Vec<String> = validator.iter_errors(value).map(|err| err.to_string()).collect();
    if errors.is_empty() {
        result
    } else {
        ExecutionResult::failed(format!(
            "output does not match schema: {}",
            errors.join("; ")
        ))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn millis_between(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    u64::try_from((end - start).num_milliseconds()).unwrap_or(0)
}
