//! Named preconditions over session state.
//!
//! Gates are pure functions of the state they are handed. The executor
//! evaluates them every time a guarded step becomes ready, never caching a
//! verdict, so a gate opened by an upstream write unblocks its dependents at
//! the next layer boundary.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::state::SessionState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum GateStatus {
    Open,
    Blocked(String),
}

impl GateStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

pub trait Gate: Send + Sync {
    fn name(&self) -> &str;
    fn evaluate(&self, state: &SessionState) -> GateStatus;
}

/// Gates by name. Steps reference gates through this registry.
#[derive(Clone, Default)]
pub struct GateRegistry {
    gates: BTreeMap<String, Arc<dyn Gate>>,
}

impl GateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a gate under its own name, replacing any previous one.
    pub fn register(&mut self, gate: Arc<dyn Gate>) {
        self.gates.insert(gate.name().to_string(), gate);
    }

    pub fn with(mut self, gate: impl Gate + 'static) -> Self {
        self.register(Arc::new(gate));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Gate>> {
        self.gates.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.gates.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.gates.keys().cloned().collect()
    }
}

type Predicate = dyn Fn(&SessionState) -> bool + Send + Sync;

/// Gate built from an arbitrary predicate and a fixed unmet message.
pub struct PredicateGate {
    name: String,
    unmet_message: String,
    predicate: Box<Predicate>,
}

impl PredicateGate {
    pub fn new(
        name: impl Into<String>,
        unmet_message: impl Into<String>,
        predicate: impl Fn(&SessionState) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            unmet_message: unmet_message.into(),
            predicate: Box::new(predicate),
        }
    }
}

impl Gate for PredicateGate {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, state: &SessionState) -> GateStatus {
        if (self.predicate)(state) {
            GateStatus::Open
        } else {
            GateStatus::Blocked(self.unmet_message.clone())
        }
    }
}

/// Open iff `key` holds JSON `true`.
pub struct FlagGate {
    name: String,
    key: String,
    unmet_message: String,
}

impl FlagGate {
    pub fn new(
        name: impl Into<String>,
        key: impl Into<String>,
        unmet_message: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            unmet_message: unmet_message.into(),
        }
    }
}

impl Gate for FlagGate {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, state: &SessionState) -> GateStatus {
        match state.value(&self.key) {
            Some(Value::Bool(true)) => GateStatus::Open,
            _ => GateStatus::Blocked(self.unmet_message.clone()),
        }
    }
}

/// Open iff `key` is present and not null.
pub struct PresenceGate {
    name: String,
    key: String,
    unmet_message: String,
}

impl PresenceGate {
    pub fn new(
        name: impl Into<String>,
        key: impl Into<String>,
        unmet_message: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            unmet_message: unmet_message.into(),
        }
    }
}

impl Gate for PresenceGate {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, state: &SessionState) -> GateStatus {
        match state.value(&self.key) {
            None | Some(Value::Null) => GateStatus::Blocked(self.unmet_message.clone()),
            Some(_) => GateStatus::Open,
        }
    }
}

/// Open iff the number at `key` is at least the number at `minimum_key`
/// (e.g. available balance versus requested amount).
pub struct ThresholdGate {
    name: String,
    key: String,
    minimum_key: String,
    unmet_message: String,
}

impl ThresholdGate {
    pub fn new(
        name: impl Into<String>,
        key: impl Into<String>,
        minimum_key: impl Into<String>,
        unmet_message: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            minimum_key: minimum_key.into(),
            unmet_message: unmet_message.into(),
        }
    }
}

impl Gate for ThresholdGate {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, state: &SessionState) -> GateStatus {
        let actual = state.value(&self.key).and_then(Value::as_f64);
        let minimum = state.value(&self.minimum_key).and_then(Value::as_f64);
        match (actual, minimum) {
            (Some(actual), Some(minimum)) if actual >= minimum => GateStatus::Open,
            (Some(_), Some(_)) => GateStatus::Blocked(self.unmet_message.clone()),
            (None, _) => GateStatus::Blocked(format!("'{}' is not a number", self.key)),
            (_, None) => GateStatus::Blocked(format!("'{}' is not a number", self.minimum_key)),
        }
    }
}

/// Lookup of principals with a backing record (e.g. a user directory).
pub trait PrincipalDirectory: Send + Sync {
    fn exists(&self, user_id: &str) -> bool;
}

impl PrincipalDirectory for BTreeSet<String> {
    fn exists(&self, user_id: &str) -> bool {
        self.contains(user_id)
    }
}

pub const AUTHENTICATION_GATE: &str = "authentication";
pub const LOGIN_FLAG_KEY: &str = "is_user_id_updated";
pub const USER_ID_KEY: &str = "user_id";

/// Open iff the login flag is set and `user_id` names a well-formed, known user.
///
/// Blocked reasons: `NOT_AUTHENTICATED`, `MISSING`, `INVALID_FORMAT`,
/// `USER_NOT_FOUND`.
pub struct AuthenticationGate {
    directory: Arc<dyn PrincipalDirectory>,
}

impl AuthenticationGate {
    pub fn new(directory: Arc<dyn PrincipalDirectory>) -> Self {
        Self { directory }
    }
}

impl Gate for AuthenticationGate {
    fn name(&self) -> &str {
        AUTHENTICATION_GATE
    }

    fn evaluate(&self, state: &SessionState) -> GateStatus {
        if state.value(LOGIN_FLAG_KEY) != Some(&Value::Bool(true)) {
            return GateStatus::Blocked("NOT_AUTHENTICATED".to_string());
        }
        let user_id = match state.value(USER_ID_KEY).and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id,
            _ => return GateStatus::Blocked("MISSING".to_string()),
        };
        if !is_valid_user_id(user_id) {
            return GateStatus::Blocked("INVALID_FORMAT".to_string());
        }
        if !self.directory.exists(user_id) {
            return GateStatus::Blocked("USER_NOT_FOUND".to_string());
        }
        GateStatus::Open
    }
}

fn is_valid_user_id(user_id: &str) -> bool {
    use std::sync::LazyLock;
    static USER_ID_RE: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{2,31}$").unwrap());
    USER_ID_RE.is_match(user_id)
}

/// Open iff every domain the intent requests is in the allowed set.
///
/// The intent's domains are read from `intent_key` as a string or a list of
/// strings. Out-of-scope requests are refused, never reinterpreted.
pub struct ScopeGate {
    name: String,
    intent_key: String,
    allowed: BTreeSet<String>,
}

impl ScopeGate {
    pub fn new<I>(name: impl Into<String>, intent_key: impl Into<String>, allowed: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            name: name.into(),
            intent_key: intent_key.into(),
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }

    fn requested(&self, state: &SessionState) -> Option<BTreeSet<String>> {
        match state.value(&self.intent_key)? {
            Value::String(domain) => Some(BTreeSet::from([domain.clone()])),
            Value::Array(items) => items
                .iter()
                .map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => None,
        }
    }
}

impl Gate for ScopeGate {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, state: &SessionState) -> GateStatus {
        let Some(requested) = self.requested(state) else {
            return GateStatus::Blocked(format!("no intent domain recorded at '{}'", self.intent_key));
        };
        if requested.is_empty() {
            return GateStatus::Blocked("intent declares no domain".to_string());
        }
        let outside: Vec<&str> = requested
            .iter()
            .filter(|domain| !self.allowed.contains(*domain))
            .map(String::as_str)
            .collect();
        if outside.is_empty() {
            GateStatus::Open
        } else {
            GateStatus::Blocked(format!(
                "request is outside the supported scope: {}",
                outside.join(", ")
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(values: serde_json::Value) -> SessionState {
        let map = values.as_object().cloned().unwrap_or_default();
        SessionState::from_values(map).expect("state")
    }

    fn directory() -> Arc<dyn PrincipalDirectory> {
        Arc::new(BTreeSet::from(["user_001".to_string()]))
    }

    #[test]
    fn authentication_requires_flag_format_and_record() {
        let gate = AuthenticationGate::new(directory());

        let cases = [
            (json!({}), GateStatus::Blocked("NOT_AUTHENTICATED".to_string())),
            (
                json!({"is_user_id_updated": true}),
                GateStatus::Blocked("MISSING".to_string()),
            ),
            (
                json!({"is_user_id_updated": true, "user_id": "x!"}),
                GateStatus::Blocked("INVALID_FORMAT".to_string()),
            ),
            (
                json!({"is_user_id_updated": true, "user_id": "user_999"}),
                GateStatus::Blocked("USER_NOT_FOUND".to_string()),
            ),
            (
                json!({"is_user_id_updated": "true", "user_id": "user_001"}),
                GateStatus::Blocked("NOT_AUTHENTICATED".to_string()),
            ),
            (
                json!({"is_user_id_updated": true, "user_id": "user_001"}),
                GateStatus::Open,
            ),
        ];
        for (values, expected) in cases {
            assert_eq!(gate.evaluate(&state(values.clone())), expected, "{values}");
        }
    }

    #[test]
    fn scope_gate_refuses_out_of_scope_domains() {
        let gate = ScopeGate::new("banking_scope", "intent.domains", ["accounts", "transfers"]);

        assert_eq!(
            gate.evaluate(&state(json!({"intent.domains": ["accounts"]}))),
            GateStatus::Open
        );
        assert_eq!(
            gate.evaluate(&state(json!({"intent.domains": "transfers"}))),
            GateStatus::Open
        );
        assert_eq!(
            gate.evaluate(&state(json!({"intent.domains": ["accounts", "weather"]}))),
            GateStatus::Blocked("request is outside the supported scope: weather".to_string())
        );
        assert!(!gate.evaluate(&state(json!({}))).is_open());
        assert!(!gate.evaluate(&state(json!({"intent.domains": []}))).is_open());
    }

    #[test]
    fn threshold_gate_compares_numbers() {
        let gate = ThresholdGate::new(
            "sufficient_funds",
            "transfer.available",
            "transfer.amount",
            "insufficient funds",
        );
        assert!(
            gate.evaluate(&state(json!({"transfer.available": 100.0, "transfer.amount": 100})))
                .is_open()
        );
        assert_eq!(
            gate.evaluate(&state(json!({"transfer.available": 10, "transfer.amount": 100}))),
            GateStatus::Blocked("insufficient funds".to_string())
        );
        assert!(
            !gate
                .evaluate(&state(json!({"transfer.amount": 1})))
                .is_open()
        );
    }

    #[test]
    fn flag_and_presence_gates() {
        let flag = FlagGate::new("confirmed", "transfer.confirmed", "not confirmed");
        assert!(flag.evaluate(&state(json!({"transfer.confirmed": true}))).is_open());
        assert!(!flag.evaluate(&state(json!({"transfer.confirmed": 1}))).is_open());

        let presence = PresenceGate::new("payee", "transfer.payee_id", "counterpart not found");
        assert!(presence.evaluate(&state(json!({"transfer.payee_id": "P1"}))).is_open());
        assert_eq!(
            presence.evaluate(&state(json!({"transfer.payee_id": null}))),
            GateStatus::Blocked("counterpart not found".to_string())
        );
    }

    #[test]
    fn predicate_gate_reevaluates_current_state() {
        let gate = PredicateGate::new("enrolled", "not enrolled", |state| {
            state.value("advisory.enrolled") == Some(&json!(true))
        });
        let mut current = SessionState::new();
        assert!(!gate.evaluate(&current).is_open());
        current.set("advisory.enrolled", json!(true)).expect("set");
        assert!(gate.evaluate(&current).is_open());
    }

    #[test]
    fn registry_resolves_by_name() {
        let registry = GateRegistry::new()
            .with(AuthenticationGate::new(directory()))
            .with(FlagGate::new("confirmed", "k", "no"));
        assert!(registry.contains(AUTHENTICATION_GATE));
        assert_eq!(registry.names(), vec!["authentication", "confirmed"]);
        assert!(registry.get("missing").is_none());
    }
}
