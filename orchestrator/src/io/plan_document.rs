//! Plan and initial-state documents (JSON) with schema validation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use serde_json::{Map, Value};

use crate::core::plan::Plan;
use crate::core::state::{ENV_PREFIX, SessionState};

/// JSON Schema (draft 2020-12) every plan document must satisfy.
pub const PLAN_SCHEMA_V1: &str = include_str!("../../schemas/plan/v1.schema.json");

/// Load a plan document from disk: schema check, then deserialization.
pub fn load_plan(path: &Path) -> Result<Plan> {
    let raw = fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    parse_plan(&raw).with_context(|| format!("load plan {}", path.display()))
}

pub fn parse_plan(raw: &str) -> Result<Plan> {
    let instance: Value = serde_json::from_str(raw).context("parse plan json")?;
    let schema: Value = serde_json::from_str(PLAN_SCHEMA_V1).context("parse plan schema")?;
    validate_schema(&instance, &schema)?;
    serde_json::from_value(instance).context("deserialize plan")
}

/// Load an initial state document: a flat JSON object of dotted keys.
///
/// Keys under `env.` populate the read-only environment region.
pub fn load_state(path: &Path) -> Result<SessionState> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("read state {}", path.display()))?;
    parse_state(&raw).with_context(|| format!("load state {}", path.display()))
}

pub fn parse_state(raw: &str) -> Result<SessionState> {
    let value: Value = serde_json::from_str(raw).context("parse state json")?;
    let Value::Object(fields) = value else {
        bail!("state document must be a JSON object");
    };
    let (env, values): (Map<String, Value>, Map<String, Value>) = fields
        .into_iter()
        .partition(|(key, _)| key.starts_with(ENV_PREFIX));
    let state = SessionState::from_values(values).map_err(|err| anyhow!(err))?;
    Ok(state.with_environment(env))
}

/// Validate JSON instance against a JSON Schema (Draft 2020-12).
fn validate_schema(instance: &Value, schema: &Value) -> Result<()> {
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(schema)
        .context("compile json schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}
