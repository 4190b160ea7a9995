//! Contexts: typed key/value pairs scoping when data applies
//!
//! A [`ContextValue`] is a raw `key=value` pair. A [`ContextSet`] is an
//! unordered collection of them; the empty set is the global context.
//! [`ContextDefinition`]s give a key its value type, its matching rule, and
//! the way a subject's current values are discovered.

mod builtin;
mod inheritance;

pub use builtin::{
    EnumContextDefinition, IpSetContextDefinition, SimpleContextDefinition, TimeComparison,
    TimeContextDefinition, SERVER_TAG_CONTEXT,
};
pub use inheritance::ContextInheritance;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{PermsError, Result};
use crate::subject::CalculatedSubject;

/// A single `key=value` context entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextValue {
    key: String,
    #[serde(rename = "value")]
    raw_value: String,
}

impl ContextValue {
    pub fn new(key: impl Into<String>, raw_value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            raw_value: raw_value.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn raw_value(&self) -> &str {
        &self.raw_value
    }
}

impl fmt::Display for ContextValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.raw_value)
    }
}

impl FromStr for ContextValue {
    type Err = PermsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok(ContextValue::new(key.trim(), value.trim()))
            }
            _ => Err(PermsError::InvalidContext {
                key: s.to_string(),
                value: String::new(),
            }),
        }
    }
}

/// An unordered set of contexts, kept sorted so it can key caches directly
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextSet(BTreeSet<ContextValue>);

impl ContextSet {
    /// The global (empty) context set
    pub fn global() -> Self {
        Self::default()
    }

    pub fn of<I: IntoIterator<Item = ContextValue>>(values: I) -> Self {
        values.into_iter().collect()
    }

    pub fn is_global(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContextValue> {
        self.0.iter()
    }

    pub fn contains(&self, value: &ContextValue) -> bool {
        self.0.contains(value)
    }

    /// First value stored under `key`
    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.0.iter().find(|v| v.key == key)
    }

    pub fn with(&self, value: ContextValue) -> Self {
        let mut set = self.0.clone();
        set.insert(value);
        Self(set)
    }

    pub fn without(&self, value: &ContextValue) -> Self {
        let mut set = self.0.clone();
        set.remove(value);
        Self(set)
    }

    pub fn is_subset(&self, other: &ContextSet) -> bool {
        self.0.is_subset(&other.0)
    }
}

impl FromIterator<ContextValue> for ContextSet {
    fn from_iter<T: IntoIterator<Item = ContextValue>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a ContextSet {
    type Item = &'a ContextValue;
    type IntoIter = std::collections::btree_set::Iter<'a, ContextValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl IntoIterator for ContextSet {
    type Item = ContextValue;
    type IntoIter = std::collections::btree_set::IntoIter<ContextValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl fmt::Display for ContextSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "global");
        }
        write!(f, "{{")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", value)?;
        }
        write!(f, "}}")
    }
}

/// Describes one context key: its value type and matching rule
///
/// Platform integrations implement this for live contexts (a player's world,
/// their address); the engine only consumes the capabilities.
pub trait ContextDefinition: Send + Sync + 'static {
    type Value: Send;

    /// The context key this definition handles
    fn name(&self) -> &str;

    fn serialize(&self, value: &Self::Value) -> String;

    fn deserialize(&self, raw: &str) -> Option<Self::Value>;

    /// Whether a stored value `own` applies to a tested value `test`
    fn matches(&self, own: &Self::Value, test: &Self::Value) -> bool;

    /// Stored values are conditions on the current values (a network, a time
    /// window) rather than values the query must name
    ///
    /// Exact matching only tests filter contexts against the query; they do
    /// not count towards the set equality.
    fn is_filter(&self) -> bool {
        false
    }

    /// Report the values currently active for `subject`
    fn accumulate_current_values(
        &self,
        subject: &CalculatedSubject,
        consumer: &mut dyn FnMut(Self::Value),
    );
}

/// Object-safe view of a [`ContextDefinition`] working on raw strings
pub trait DynContextDefinition: Send + Sync {
    fn name(&self) -> &str;

    /// Round-trip a raw value through the definition, `None` if it does not parse
    fn normalize(&self, raw: &str) -> Option<String>;

    fn matches_raw(&self, own: &str, test: &str) -> bool;

    fn is_filter(&self) -> bool;

    fn current_values(&self, subject: &CalculatedSubject) -> Vec<ContextValue>;
}

impl<D: ContextDefinition> DynContextDefinition for D {
    fn name(&self) -> &str {
        ContextDefinition::name(self)
    }

    fn normalize(&self, raw: &str) -> Option<String> {
        self.deserialize(raw).map(|v| self.serialize(&v))
    }

    fn matches_raw(&self, own: &str, test: &str) -> bool {
        match (self.deserialize(own), self.deserialize(test)) {
            (Some(own), Some(test)) => self.matches(&own, &test),
            _ => own == test,
        }
    }

    fn is_filter(&self) -> bool {
        ContextDefinition::is_filter(self)
    }

    fn current_values(&self, subject: &CalculatedSubject) -> Vec<ContextValue> {
        let mut values = Vec::new();
        let key = ContextDefinition::name(self).to_string();
        self.accumulate_current_values(subject, &mut |value| {
            values.push(ContextValue::new(key.clone(), self.serialize(&value)));
        });
        values
    }
}

/// Registered context definitions, keyed by context name
#[derive(Default)]
pub struct ContextDefinitionRegistry {
    definitions: RwLock<HashMap<String, Arc<dyn DynContextDefinition>>>,
}

impl fmt::Debug for ContextDefinitionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys = self.keys();
        keys.sort();
        f.debug_struct("ContextDefinitionRegistry")
            .field("keys", &keys)
            .finish()
    }
}

impl ContextDefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition, replacing any existing one with the same name
    pub fn register<D: ContextDefinition>(&self, definition: D) {
        let name = ContextDefinition::name(&definition).to_string();
        tracing::debug!("Registered context definition {}", name);
        self.definitions.write().insert(name, Arc::new(definition));
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn DynContextDefinition>> {
        self.definitions.read().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.definitions.read().keys().cloned().collect()
    }

    /// Build a context value, validating it against its definition if one exists
    pub fn parse(&self, key: &str, raw: &str) -> Result<ContextValue> {
        match self.get(key) {
            Some(def) => def
                .normalize(raw)
                .map(|normalized| ContextValue::new(key, normalized))
                .ok_or_else(|| PermsError::InvalidContext {
                    key: key.to_string(),
                    value: raw.to_string(),
                }),
            None => Ok(ContextValue::new(key, raw)),
        }
    }

    /// Whether stored value `own` applies to tested value `test`
    ///
    /// Keys must agree; unregistered keys compare raw values.
    pub fn matches(&self, own: &ContextValue, test: &ContextValue) -> bool {
        if own.key != test.key {
            return false;
        }
        match self.get(&own.key) {
            Some(def) => def.matches_raw(&own.raw_value, &test.raw_value),
            None => own.raw_value == test.raw_value,
        }
    }

    /// Whether `key` names a filter context
    pub fn is_filter(&self, key: &str) -> bool {
        self.get(key).is_some_and(|def| def.is_filter())
    }

    /// Collect every registered definition's current values for `subject`
    pub fn accumulate(&self, subject: &CalculatedSubject) -> ContextSet {
        let definitions: Vec<_> = self.definitions.read().values().cloned().collect();
        definitions
            .iter()
            .flat_map(|def| def.current_values(subject))
            .collect()
    }
}
