//! Agent capability abstraction.
//!
//! The [`Capability`] trait decouples orchestration from whatever actually
//! produces an answer: an LLM-backed agent, a deterministic data lookup, or a
//! scripted fake in tests. Capabilities only see the parameters their step
//! binds plus a read-only state snapshot; they never touch the store.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::gate::GateRegistry;
use crate::core::state::StateSnapshot;
use crate::core::types::{CapabilityKind, ExecutionResult};
use crate::core::validate::Catalog;

/// Structured input for one capability call.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub step_id: String,
    pub params: BTreeMap<String, Value>,
    pub state: StateSnapshot,
}

impl Invocation {
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            params: BTreeMap::new(),
            state: StateSnapshot::default(),
        }
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    /// String parameter, or a `NeedsClarification` naming it when absent.
    pub fn require_str(&self, name: &str) -> Result<&str, ExecutionResult> {
        self.param(name)
            .and_then(Value::as_str)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| ExecutionResult::clarify([name]))
    }
}

#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    /// Worker unless overridden; only conversational capabilities address the end user.
    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Worker
    }

    /// Must resolve to one of the four results; panics and user prompts are not part
    /// of the contract.
    async fn invoke(&self, invocation: Invocation) -> ExecutionResult;
}

type ToolFn = dyn Fn(&Invocation) -> ExecutionResult + Send + Sync;

/// Synchronous capability backed by a closure (deterministic tools, data agents).
pub struct ToolCapability {
    name: String,
    kind: CapabilityKind,
    func: Box<ToolFn>,
}

impl ToolCapability {
    pub fn worker(
        name: impl Into<String>,
        func: impl Fn(&Invocation) -> ExecutionResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            kind: CapabilityKind::Worker,
            func: Box::new(func),
        }
    }

    pub fn conversational(
        name: impl Into<String>,
        func: impl Fn(&Invocation) -> ExecutionResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind: CapabilityKind::Conversational,
            ..Self::worker(name, func)
        }
    }
}

#[async_trait]
impl Capability for ToolCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CapabilityKind {
        self.kind
    }

    async fn invoke(&self, invocation: Invocation) -> ExecutionResult {
        (self.func)(&invocation)
    }
}

/// Capabilities by name. The executor resolves `Step::capability` here at dispatch.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    capabilities: BTreeMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability under its own name, replacing any previous one.
    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        self.capabilities
            .insert(capability.name().to_string(), capability);
    }

    pub fn with(mut self, capability: impl Capability + 'static) -> Self {
        self.register(Arc::new(capability));
        self
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.capabilities.keys().cloned().collect()
    }
}

/// Everything a plan can reference by name.
#[derive(Clone, Default)]
pub struct Registry {
    pub capabilities: CapabilityRegistry,
    pub gates: GateRegistry,
}

impl Registry {
    pub fn new(capabilities: CapabilityRegistry, gates: GateRegistry) -> Self {
        Self {
            capabilities,
            gates,
        }
    }
}

impl Catalog for Registry {
    fn has_capability(&self, name: &str) -> bool {
        self.capabilities.contains(name)
    }

    fn has_gate(&self, name: &str) -> bool {
        self.gates.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn tool_capability_runs_closure() {
        let tool = ToolCapability::worker("echo", |inv| {
            ExecutionResult::Success(inv.param("text").cloned().unwrap_or(Value::Null))
        });
        let mut invocation = Invocation::new("s1");
        invocation.params.insert("text".to_string(), json!("hi"));

        assert_eq!(tool.kind(), CapabilityKind::Worker);
        assert_eq!(
            tool.invoke(invocation).await,
            ExecutionResult::Success(json!("hi"))
        );
    }

    #[test]
    fn require_str_asks_for_missing_field() {
        let mut invocation = Invocation::new("s1");
        invocation.params.insert("blank".to_string(), json!("  "));
        assert_eq!(
            invocation.require_str("payee"),
            Err(ExecutionResult::clarify(["payee"]))
        );
        assert_eq!(
            invocation.require_str("blank"),
            Err(ExecutionResult::clarify(["blank"]))
        );
    }

    #[test]
    fn registry_reports_registered_names() {
        let registry = Registry::new(
            CapabilityRegistry::new()
                .with(ToolCapability::worker("b", |_| ExecutionResult::Success(json!(null))))
                .with(ToolCapability::conversational("a", |_| {
                    ExecutionResult::Success(json!(null))
                })),
            GateRegistry::new(),
        );
        assert_eq!(registry.capabilities.names(), vec!["a", "b"]);
        assert!(registry.has_capability("a"));
        assert!(!registry.has_gate("a"));
        assert_eq!(
            registry.capabilities.resolve("a").expect("a").kind(),
            CapabilityKind::Conversational
        );
    }
}
