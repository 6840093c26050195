//! Static plan validation and topological layering.
//!
//! Validation is pure and runs before any capability is invoked, so a plan is
//! either rejected whole or executed against a consistent dependency graph.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use thiserror::Error;

use crate::core::plan::Plan;
use crate::core::state::is_reserved;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },
    #[error("dependency cycle among steps: {}", .0.join(", "))]
    CycleDetected(Vec<String>),
    #[error("step '{step}' reads '{key}' which no dependency writes and the initial state lacks")]
    UnresolvedBinding { step: String, key: String },
    #[error("independent steps '{first}' and '{second}' both write '{key}'")]
    WriteConflict {
        first: String,
        second: String,
        key: String,
    },
    #[error("step '{step}' writes reserved key '{key}'")]
    ReservedWrite { step: String, key: String },
    #[error("step '{step}' references unknown capability '{capability}'")]
    UnknownCapability { step: String, capability: String },
    #[error("step '{step}' references unknown gate '{gate}'")]
    UnknownGate { step: String, gate: String },
    #[error("step '{step}' declares an invalid output schema: {message}")]
    InvalidOutputSchema { step: String, message: String },
}

/// Names a plan is allowed to reference.
pub trait Catalog {
    fn has_capability(&self, name: &str) -> bool;
    fn has_gate(&self, name: &str) -> bool;
}

/// Catalog backed by plain name lists (CLI and config-driven validation).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameCatalog {
    pub capabilities: BTreeSet<String>,
    pub gates: BTreeSet<String>,
}

impl NameCatalog {
    pub fn new<C, G>(capabilities: C, gates: G) -> Self
    where
        C: IntoIterator,
        C::Item: Into<String>,
        G: IntoIterator,
        G::Item: Into<String>,
    {
        Self {
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            gates: gates.into_iter().map(Into::into).collect(),
        }
    }
}

impl Catalog for NameCatalog {
    fn has_capability(&self, name: &str) -> bool {
        self.capabilities.contains(name)
    }

    fn has_gate(&self, name: &str) -> bool {
        self.gates.contains(name)
    }
}

/// Steps grouped by topological layer; ids ascending within a layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Layering {
    layers: Vec<Vec<String>>,
}

impl Layering {
    pub fn layers(&self) -> &[Vec<String>] {
        &self.layers
    }

    pub fn layer_of(&self, step_id: &str) -> Option<usize> {
        self.layers
            .iter()
            .position(|layer| layer.iter().any(|id| id == step_id))
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

/// Validate `plan` against the initial state keys and a catalog.
///
/// Checks run in a fixed order and the first violation is returned:
/// - unique step ids
/// - every prerequisite names an existing step
/// - the prerequisite graph is acyclic (self edges included)
/// - every state binding is an initial key or written by a hard ancestor
/// - independent steps declare disjoint `writes`
/// - no step writes the reserved environment region
/// - every capability and gate name is registered
/// - every declared output schema compiles
pub fn validate(
    plan: &Plan,
    initial_keys: &BTreeSet<String>,
    catalog: &dyn Catalog,
) -> Result<Layering, PlanError> {
    check_unique_ids(plan)?;
    check_known_dependencies(plan)?;
    let layering = layer_plan(plan)?;
    let graph = Ancestry::build(plan, &layering);
    check_bindings(plan, initial_keys, &graph)?;
    check_write_conflicts(plan, &graph)?;
    check_reserved_writes(plan)?;
    check_catalog(plan, catalog)?;
    check_output_schemas(plan)?;
    Ok(layering)
}

fn check_unique_ids(plan: &Plan) -> Result<(), PlanError> {
    let mut seen = HashSet::new();
    for step in &plan.steps {
        if !seen.insert(step.id.as_str()) {
            return Err(PlanError::DuplicateStep(step.id.clone()));
        }
    }
    Ok(())
}

fn check_known_dependencies(plan: &Plan) -> Result<(), PlanError> {
    let ids: HashSet<&str> = plan.steps.iter().map(|step| step.id.as_str()).collect();
    for step in &plan.steps {
        for dep in step.prerequisites() {
            if !ids.contains(dep.as_str()) {
                return Err(PlanError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Kahn's algorithm by levels. Leftover nodes are trimmed down to the ones
/// that sit on (or between) cycles before being reported.
fn layer_plan(plan: &Plan) -> Result<Layering, PlanError> {
    let mut remaining: BTreeMap<&str, BTreeSet<&str>> = plan
        .steps
        .iter()
        .map(|step| {
            let prereqs = step.prerequisites().map(String::as_str).collect();
            (step.id.as_str(), prereqs)
        })
        .collect();

    let mut layers = Vec::new();
    loop {
        let ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, prereqs)| prereqs.is_empty())
            .map(|(id, _)| *id)
            .collect();
        if ready.is_empty() {
            break;
        }
        for id in &ready {
            remaining.remove(id);
        }
        for prereqs in remaining.values_mut() {
            for id in &ready {
                prereqs.remove(id);
            }
        }
        layers.push(ready.into_iter().map(str::to_string).collect());
    }

    if remaining.is_empty() {
        return Ok(Layering { layers });
    }
    Err(PlanError::CycleDetected(cycle_members(remaining)))
}

fn cycle_members(mut remaining: BTreeMap<&str, BTreeSet<&str>>) -> Vec<String> {
    // Drop nodes nothing else in the leftover set waits on; they are only
    // downstream of a cycle.
    loop {
        let needed: HashSet<&str> = remaining.values().flatten().copied().collect();
        let before = remaining.len();
        remaining.retain(|id, _| needed.contains(id));
        if remaining.len() == before {
            break;
        }
    }
    remaining.keys().map(|id| id.to_string()).collect()
}

/// Transitive ancestor sets, computed once in layer order.
struct Ancestry {
    hard: BTreeMap<String, BTreeSet<String>>,
    all: BTreeMap<String, BTreeSet<String>>,
}

impl Ancestry {
    fn build(plan: &Plan, layering: &Layering) -> Self {
        let mut hard: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut all: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for id in layering.layers().iter().flatten() {
            let Some(step) = plan.get(id) else {
                continue;
            };
            let mut hard_set = BTreeSet::new();
            for dep in &step.depends_on {
                hard_set.insert(dep.clone());
                if let Some(upstream) = hard.get(dep) {
                    hard_set.extend(upstream.iter().cloned());
                }
            }
            let mut all_set = BTreeSet::new();
            for dep in step.prerequisites() {
                all_set.insert(dep.clone());
                if let Some(upstream) = all.get(dep) {
                    all_set.extend(upstream.iter().cloned());
                }
            }
            hard.insert(id.clone(), hard_set);
            all.insert(id.clone(), all_set);
        }
        Self { hard, all }
    }

    fn hard_ancestors(&self, id: &str) -> impl Iterator<Item = &String> {
        self.hard.get(id).into_iter().flatten()
    }

    fn ordered(&self, a: &str, b: &str) -> bool {
        self.all.get(a).is_some_and(|set| set.contains(b))
            || self.all.get(b).is_some_and(|set| set.contains(a))
    }
}

fn check_bindings(
    plan: &Plan,
    initial_keys: &BTreeSet<String>,
    graph: &Ancestry,
) -> Result<(), PlanError> {
    for step in &plan.steps {
        for key in step.state_reads() {
            if initial_keys.contains(key) {
                continue;
            }
            let produced = graph.hard_ancestors(&step.id).any(|ancestor| {
                plan.get(ancestor)
                    .is_some_and(|upstream| upstream.writes.contains(key))
            });
            if !produced {
                return Err(PlanError::UnresolvedBinding {
                    step: step.id.clone(),
                    key: key.to_string(),
                });
            }
        }
    }
    Ok(())
}

fn check_write_conflicts(plan: &Plan, graph: &Ancestry) -> Result<(), PlanError> {
    let mut steps: Vec<_> = plan.steps.iter().collect();
    steps.sort_by(|a, b| a.id.cmp(&b.id));
    for (idx, first) in steps.iter().enumerate() {
        for second in &steps[idx + 1..] {
            if graph.ordered(&first.id, &second.id) {
                continue;
            }
            if let Some(key) = first.writes.intersection(&second.writes).next() {
                return Err(PlanError::WriteConflict {
                    first: first.id.clone(),
                    second: second.id.clone(),
                    key: key.clone(),
                });
            }
        }
    }
    Ok(())
}

fn check_reserved_writes(plan: &Plan) -> Result<(), PlanError> {
    for step in &plan.steps {
        if let Some(key) = step.writes.iter().find(|key| is_reserved(key)) {
            return Err(PlanError::ReservedWrite {
                step: step.id.clone(),
                key: key.clone(),
            });
        }
    }
    Ok(())
}

fn check_catalog(plan: &Plan, catalog: &dyn Catalog) -> Result<(), PlanError> {
    for step in &plan.steps {
        if !catalog.has_capability(&step.capability) {
            return Err(PlanError::UnknownCapability {
                step: step.id.clone(),
                capability: step.capability.clone(),
            });
        }
        if let Some(gate) = step
            .required_gates
            .iter()
            .find(|gate| !catalog.has_gate(gate))
        {
            return Err(PlanError::UnknownGate {
                step: step.id.clone(),
                gate: gate.clone(),
            });
        }
    }
    Ok(())
}

fn check_output_schemas(plan: &Plan) -> Result<(), PlanError> {
    for step in &plan.steps {
        step.output_validator()
            .map_err(|message| PlanError::InvalidOutputSchema {
                step: step.id.clone(),
                message,
            })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::Step;

    fn catalog() -> NameCatalog {
        NameCatalog::new(["tool"], ["auth"])
    }

    fn keys(keys: &[&str]) -> BTreeSet<String> {
        keys.iter().map(|key| key.to_string()).collect()
    }

    #[test]
    fn independent_steps_share_layer_zero() {
        let plan = Plan::new("g")
            .step(Step::new("b", "tool").writes("y"))
            .step(Step::new("a", "tool").writes("x"))
            .step(Step::new("c", "tool").depends_on("a").depends_on("b"));

        let layering = validate(&plan, &keys(&[]), &catalog()).expect("valid");
        assert_eq!(
            layering.layers(),
            &[vec!["a".to_string(), "b".to_string()], vec!["c".to_string()]]
        );
        assert_eq!(layering.layer_of("c"), Some(1));
    }

    #[test]
    fn duplicate_ids_are_rejected_first() {
        let plan = Plan::new("g")
            .step(Step::new("a", "missing").depends_on("a"))
            .step(Step::new("a", "tool"));
        assert_eq!(
            validate(&plan, &keys(&[]), &catalog()),
            Err(PlanError::DuplicateStep("a".to_string()))
        );
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let plan = Plan::new("g").step(Step::new("a", "tool").depends_on("a"));
        assert_eq!(
            validate(&plan, &keys(&[]), &catalog()),
            Err(PlanError::CycleDetected(vec!["a".to_string()]))
        );
    }

    #[test]
    fn cycle_report_excludes_downstream_steps() {
        let plan = Plan::new("g")
            .step(Step::new("a", "tool").depends_on("c"))
            .step(Step::new("b", "tool").depends_on("a"))
            .step(Step::new("c", "tool").after("b"))
            .step(Step::new("d", "tool").depends_on("c"))
            .step(Step::new("root", "tool"));
        assert_eq!(
            validate(&plan, &keys(&[]), &catalog()),
            Err(PlanError::CycleDetected(vec![
                "a".to_string(),
                "b".to_string(),
                "c".to_string()
            ]))
        );
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let plan = Plan::new("g").step(Step::new("a", "tool").after("ghost"));
        assert_eq!(
            validate(&plan, &keys(&[]), &catalog()),
            Err(PlanError::UnknownDependency {
                step: "a".to_string(),
                dependency: "ghost".to_string()
            })
        );
    }

    #[test]
    fn bindings_resolve_from_initial_state_or_transitive_dependency() {
        let plan = Plan::new("g")
            .step(Step::new("a", "tool").writes("x"))
            .step(Step::new("b", "tool").depends_on("a"))
            .step(
                Step::new("c", "tool")
                    .depends_on("b")
                    .bind_state("x", "x")
                    .bind_state("user", "user_id"),
            );
        assert!(validate(&plan, &keys(&["user_id"]), &catalog()).is_ok());
        assert_eq!(
            validate(&plan, &keys(&[]), &catalog()),
            Err(PlanError::UnresolvedBinding {
                step: "c".to_string(),
                key: "user_id".to_string()
            })
        );
    }

    #[test]
    fn soft_edges_do_not_resolve_bindings() {
        let plan = Plan::new("g")
            .step(Step::new("a", "tool").writes("x"))
            .step(Step::new("b", "tool").after("a").bind_state("x", "x"));
        assert_eq!(
            validate(&plan, &keys(&[]), &catalog()),
            Err(PlanError::UnresolvedBinding {
                step: "b".to_string(),
                key: "x".to_string()
            })
        );
    }

    #[test]
    fn independent_overlapping_writes_conflict() {
        let plan = Plan::new("g")
            .step(Step::new("root", "tool"))
            .step(Step::new("b", "tool").depends_on("root").writes("out"))
            .step(Step::new("a", "tool").depends_on("root").writes("out"));
        assert_eq!(
            validate(&plan, &keys(&[]), &catalog()),
            Err(PlanError::WriteConflict {
                first: "a".to_string(),
                second: "b".to_string(),
                key: "out".to_string()
            })
        );
    }

    #[test]
    fn ordered_steps_may_overwrite_the_same_key() {
        let plan = Plan::new("g")
            .step(Step::new("draft", "tool").writes("out"))
            .step(Step::new("final", "tool").after("draft").writes("out"));
        assert!(validate(&plan, &keys(&[]), &catalog()).is_ok());
    }

    #[test]
    fn env_writes_are_rejected() {
        let plan = Plan::new("g").step(Step::new("a", "tool").writes("env.currency"));
        assert_eq!(
            validate(&plan, &keys(&[]), &catalog()),
            Err(PlanError::ReservedWrite {
                step: "a".to_string(),
                key: "env.currency".to_string()
            })
        );
    }

    #[test]
    fn unregistered_names_are_rejected() {
        let plan = Plan::new("g").step(Step::new("a", "nope"));
        assert_eq!(
            validate(&plan, &keys(&[]), &catalog()),
            Err(PlanError::UnknownCapability {
                step: "a".to_string(),
                capability: "nope".to_string()
            })
        );

        let plan = Plan::new("g").step(Step::new("a", "tool").gate("scope"));
        assert_eq!(
            validate(&plan, &keys(&[]), &catalog()),
            Err(PlanError::UnknownGate {
                step: "a".to_string(),
                gate: "scope".to_string()
            })
        );
    }

    #[test]
    fn uncompilable_output_schema_is_rejected() {
        let plan = Plan::new("g").step(
            Step::new("a", "tool").output_schema(serde_json::json!({"type": "not-a-type"})),
        );
        assert!(matches!(
            validate(&plan, &keys(&[]), &catalog()),
            Err(PlanError::InvalidOutputSchema { ref step, .. }) if step == "a"
        ));
    }

    #[test]
    fn empty_plan_is_valid() {
        let layering = validate(&Plan::new("noop"), &keys(&[]), &catalog()).expect("valid");
        assert!(layering.is_empty());
    }
}
