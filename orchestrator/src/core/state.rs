//! Versioned key/value state scoped to one conversation.
//!
//! The store is the only channel through which capabilities exchange data.
//! Keys are exact dotted strings (`transfer.payee_id`); there are no wildcard
//! reads or writes. Every write bumps a per-key version counter that only
//! ever moves forward.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Key prefix of the read-only environment region (locale, currency, ...).
pub const ENV_PREFIX: &str = "env.";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("missing state key '{0}'")]
    MissingState(String),
    #[error("state key '{0}' is read-only")]
    ReadOnly(String),
}

/// A stored value together with its write counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub value: Value,
    pub version: u64,
}

/// One committed write, as recorded in execution traces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    pub after: Value,
    pub version: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    entries: BTreeMap<String, StateEntry>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an initial state from plain key/value pairs.
    ///
    /// Keys under [`ENV_PREFIX`] are rejected here; the environment region is
    /// populated only through [`SessionState::with_environment`].
    pub fn from_values<K, I>(values: I) -> Result<Self, StateError>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let mut state = Self::new();
        for (key, value) in values {
            state.set(key, value)?;
        }
        Ok(state)
    }

    /// Write the ambient environment region once. Keys are stored under
    /// `env.` whether or not the caller already prefixed them; a key that is
    /// already present keeps its first value and version.
    pub fn with_environment<K, I>(mut self, env: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        for (key, value) in env {
            let key: String = key.into();
            let key = if key.starts_with(ENV_PREFIX) {
                key
            } else {
                format!("{ENV_PREFIX}{key}")
            };
            self.entries
                .entry(key)
                .or_insert(StateEntry { value, version: 1 });
        }
        self
    }

    pub fn get(&self, key: &str) -> Result<&Value, StateError> {
        self.value(key)
            .ok_or_else(|| StateError::MissingState(key.to_string()))
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).map(|entry| &entry.value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn version(&self, key: &str) -> Option<u64> {
        self.entries.get(key).map(|entry| entry.version)
    }

    /// Overwrite `key` and return its new version.
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Result<u64, StateError> {
        let key = key.into();
        if is_reserved(&key) {
            return Err(StateError::ReadOnly(key));
        }
        let entry = self.entries.entry(key).or_insert(StateEntry {
            value: Value::Null,
            version: 0,
        });
        entry.value = value;
        entry.version += 1;
        Ok(entry.version)
    }

    /// Overwrite `key` and describe the change for trace consumers.
    pub fn apply(&mut self, key: &str, value: Value) -> Result<StateChange, StateError> {
        let before = self.value(key).cloned();
        let version = self.set(key, value.clone())?;
        Ok(StateChange {
            key: key.to_string(),
            before,
            after: value,
            version,
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn key_set(&self) -> BTreeSet<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Immutable copy of the current values.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            values: self
                .entries
                .iter()
                .map(|(key, entry)| (key.clone(), entry.value.clone()))
                .collect(),
        }
    }
}

/// Read-only view handed to capabilities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateSnapshot {
    values: BTreeMap<String, Value>,
}

impl StateSnapshot {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(key, value)| (key.as_str(), value))
    }
}

pub fn is_reserved(key: &str) -> bool {
    key.starts_with(ENV_PREFIX)
}
