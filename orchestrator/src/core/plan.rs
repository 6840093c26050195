//! Plan representation: a DAG of steps bound to capabilities.

use std::collections::{BTreeMap, BTreeSet};

use jsonschema::{Draft, Validator};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Source of one capability parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Binding {
    /// Read the value of a session-state key when the step is dispatched.
    State(String),
    /// A constant embedded in the plan.
    Literal(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub capability: String,
    /// Human-readable, never interpreted.
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub input_bindings: BTreeMap<String, Binding>,
    /// Hard prerequisites: if any does not succeed this step is skipped.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Ordering-only prerequisites: must resolve first, outcome ignored.
    #[serde(default)]
    pub after: BTreeSet<String>,
    #[serde(default)]
    pub writes: BTreeSet<String>,
    #[serde(default)]
    pub required_gates: Vec<String>,
    /// JSON Schema (draft 2020-12) a successful output must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

impl Step {
    pub fn new(id: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capability: capability.into(),
            purpose: String::new(),
            input_bindings: BTreeMap::new(),
            depends_on: BTreeSet::new(),
            after: BTreeSet::new(),
            writes: BTreeSet::new(),
            required_gates: Vec::new(),
            output_schema: None,
        }
    }

    pub fn purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purpose = purpose.into();
        self
    }

    pub fn bind_state(mut self, param: impl Into<String>, key: impl Into<String>) -> Self {
        self.input_bindings
            .insert(param.into(), Binding::State(key.into()));
        self
    }

    pub fn bind_literal(mut self, param: impl Into<String>, value: Value) -> Self {
        self.input_bindings
            .insert(param.into(), Binding::Literal(value));
        self
    }

    pub fn depends_on(mut self, step: impl Into<String>) -> Self {
        self.depends_on.insert(step.into());
        self
    }

    pub fn after(mut self, step: impl Into<String>) -> Self {
        self.after.insert(step.into());
        self
    }

    pub fn writes(mut self, key: impl Into<String>) -> Self {
        self.writes.insert(key.into());
        self
    }

    pub fn gate(mut self, gate: impl Into<String>) -> Self {
        self.required_gates.push(gate.into());
        self
    }

    pub fn output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// Compile `output_schema`, if the step declares one.
    pub fn output_validator(&self) -> Result<Option<Validator>, String> {
        let Some(schema) = &self.output_schema else {
            return Ok(None);
        };
        jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(schema)
            .map(Some)
            .map_err(|err| err.to_string())
    }

    /// Hard and soft prerequisites together, in id order.
    pub fn prerequisites(&self) -> impl Iterator<Item = &String> {
        self.depends_on.union(&self.after)
    }

    /// State keys this step reads through its bindings.
    pub fn state_reads(&self) -> impl Iterator<Item = &str> {
        self.input_bindings.values().filter_map(|binding| match binding {
            Binding::State(key) => Some(key.as_str()),
            Binding::Literal(_) => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub goal: String,
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn get(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.id == id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Chain `steps` so that each depends on its predecessor.
    pub fn chain(goal: impl Into<String>, steps: impl IntoIterator<Item = Step>) -> Self {
        let mut plan = Self::new(goal);
        let mut previous: Option<String> = None;
        for mut step in steps {
            if let Some(prev) = previous.take() {
                step.depends_on.insert(prev);
            }
            previous = Some(step.id.clone());
            plan.steps.push(step);
        }
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chain_links_each_step_to_previous() {
        let plan = Plan::chain(
            "goal",
            [Step::new("a", "x"), Step::new("b", "x"), Step::new("c", "x")],
        );
        assert!(plan.get("a").expect("a").depends_on.is_empty());
        assert!(plan.get("b").expect("b").depends_on.contains("a"));
        assert!(plan.get("c").expect("c").depends_on.contains("b"));
        assert_eq!(plan.get("c").expect("c").depends_on.len(), 1);
    }

    #[test]
    fn plan_document_parses_with_defaults() {
        let plan: Plan = serde_json::from_value(json!({
            "goal": "transfer",
            "steps": [
                {"id": "lookup", "capability": "search_payees",
                 "input_bindings": {"query": {"state": "transfer.payee_name"},
                                    "limit": {"literal": 5}},
                 "writes": ["transfer.payee_id"]},
                {"id": "balance", "capability": "get_balance", "depends_on": ["lookup"]}
            ]
        }))
        .expect("parse plan");

        let lookup = plan.get("lookup").expect("lookup");
        assert_eq!(
            lookup.input_bindings.get("query"),
            Some(&Binding::State("transfer.payee_name".to_string()))
        );
        assert_eq!(lookup.state_reads().collect::<Vec<_>>(), vec!["transfer.payee_name"]);
        let balance = plan.get("balance").expect("balance");
        assert!(balance.writes.is_empty());
        assert!(balance.required_gates.is_empty());
        assert!(balance.output_schema.is_none());
    }

    #[test]
    fn output_validator_compiles_declared_schema() {
        let step = Step::new("search", "product_search")
            .output_schema(json!({"type": "object", "required": ["products"]}));
        let validator = step.output_validator().expect("compiles").expect("declared");
        assert!(validator.is_valid(&json!({"products": []})));
        assert!(!validator.is_valid(&json!({"items": []})));

        assert!(Step::new("plain", "x").output_validator().expect("none").is_none());
        assert!(
            Step::new("bad", "x")
                .output_schema(json!({"type": 5}))
                .output_validator()
                .is_err()
        );
    }
}
