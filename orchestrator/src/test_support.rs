//! Test-only helpers: scripted capabilities and executor builders.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use crate::capability::{Capability, CapabilityRegistry, Invocation, Registry};
use crate::core::gate::GateRegistry;
use crate::core::types::{CapabilityKind, ExecutionResult};
use crate::executor::Executor;

/// Capability that replays queued results, then repeats a fallback.
///
/// Every call is counted and its invocation recorded, so tests can assert
/// both how often and with what a capability was called.
pub struct ScriptedCapability {
    name: String,
    kind: CapabilityKind,
    script: Mutex<VecDeque<ExecutionResult>>,
    fallback: ExecutionResult,
    calls: AtomicUsize,
    invocations: Mutex<Vec<Invocation>>,
}

impl ScriptedCapability {
    pub fn new(name: &str, results: impl IntoIterator<Item = ExecutionResult>) -> Self {
        Self {
            name: name.to_string(),
            kind: CapabilityKind::Worker,
            script: Mutex::new(results.into_iter().collect()),
            fallback: ExecutionResult::failed(format!("{name}: script exhausted")),
            calls: AtomicUsize::new(0),
            invocations: Mutex::new(Vec::new()),
        }
    }

    /// Capability that always succeeds with `value`.
    pub fn succeeding(name: &str, value: Value) -> Self {
        Self::new(name, []).with_fallback(ExecutionResult::Success(value))
    }

    /// Capability that always fails with `reason`.
    pub fn failing(name: &str, reason: &str) -> Self {
        Self::new(name, []).with_fallback(ExecutionResult::failed(reason))
    }

    pub fn with_fallback(mut self, fallback: ExecutionResult) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn conversational(mut self) -> Self {
        self.kind = CapabilityKind::Conversational;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Capability for ScriptedCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CapabilityKind {
        self.kind
    }

    async fn invoke(&self, invocation: Invocation) -> ExecutionResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(invocation);
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Registry holding `capabilities` and `gates`.
pub fn registry(
    capabilities: impl IntoIterator<Item = Arc<dyn Capability>>,
    gates: GateRegistry,
) -> Registry {
    let mut registered = CapabilityRegistry::new();
    for capability in capabilities {
        registered.register(capability);
    }
    Registry::new(registered, gates)
}

/// Executor with default limits over `capabilities` and `gates`.
pub fn executor(
    capabilities: impl IntoIterator<Item = Arc<dyn Capability>>,
    gates: GateRegistry,
) -> Executor {
    Executor::new(registry(capabilities, gates))
}

/// Fresh directory for trace export tests.
pub fn export_dir() -> tempfile::TempDir {
    tempfile::tempdir().unwrap_or_else(|err| panic!("create export dir: {err}"))
}
