//! Context inheritance (e.g. `world=nether` inheriting from `world=overworld`)
//!
//! Consulted while expanding an active context set, never while matching a
//! stored segment directly.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use super::{ContextSet, ContextValue};
use crate::error::PermsError;

/// Immutable map from a context value to the values it inherits from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, Vec<String>>", into = "BTreeMap<String, Vec<String>>")]
pub struct ContextInheritance {
    parents: HashMap<ContextValue, Vec<ContextValue>>,
}

impl ContextInheritance {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct parents of `value`, in priority order
    pub fn parents(&self, value: &ContextValue) -> &[ContextValue] {
        self.parents.get(value).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn all_parents(&self) -> &HashMap<ContextValue, Vec<ContextValue>> {
        &self.parents
    }

    /// Copy with `value`'s parents replaced; an empty list removes the entry
    pub fn with_parents(&self, value: ContextValue, parents: Vec<ContextValue>) -> Self {
        let mut next = self.parents.clone();
        if parents.is_empty() {
            next.remove(&value);
        } else {
            next.insert(value, parents);
        }
        Self { parents: next }
    }

    /// Transitive parents of `value`, breadth first, excluding `value` itself
    pub fn ancestors(&self, value: &ContextValue) -> Vec<ContextValue> {
        let mut seen: HashSet<&ContextValue> = HashSet::new();
        seen.insert(value);
        let mut queue: VecDeque<&ContextValue> = VecDeque::from([value]);
        let mut out = Vec::new();

        while let Some(current) = queue.pop_front() {
            for parent in self.parents(current) {
                if seen.insert(parent) {
                    out.push(parent.clone());
                    queue.push_back(parent);
                }
            }
        }
        out
    }

    /// `contexts` plus every inherited value of its members
    pub fn expand(&self, contexts: &ContextSet) -> ContextSet {
        contexts
            .iter()
            .flat_map(|value| std::iter::once(value.clone()).chain(self.ancestors(value)))
            .collect()
    }

    /// Alternative sets formed by swapping one member for one of its ancestors
    ///
    /// Ordered by member, then by inheritance distance; `contexts` itself is
    /// not included.
    pub fn substitutions(&self, contexts: &ContextSet) -> Vec<ContextSet> {
        let mut out: Vec<ContextSet> = Vec::new();
        for value in contexts {
            let base = contexts.without(value);
            for ancestor in self.ancestors(value) {
                let candidate = base.with(ancestor);
                if candidate != *contexts && !out.contains(&candidate) {
                    out.push(candidate);
                }
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }
}

impl TryFrom<BTreeMap<String, Vec<String>>> for ContextInheritance {
    type Error = PermsError;

    fn try_from(raw: BTreeMap<String, Vec<String>>) -> Result<Self, Self::Error> {
        let mut parents = HashMap::with_capacity(raw.len());
        for (child, raw_parents) in raw {
            let child: ContextValue = child.parse()?;
            let parsed = raw_parents
                .iter()
                .map(|p| p.parse())
                .collect::<Result<Vec<ContextValue>, _>>()?;
            if !parsed.is_empty() {
                parents.insert(child, parsed);
            }
        }
        Ok(Self { parents })
    }
}

impl From<ContextInheritance> for BTreeMap<String, Vec<String>> {
    fn from(inheritance: ContextInheritance) -> Self {
        inheritance
            .parents
            .into_iter()
            .map(|(child, parents)| {
                (
                    child.to_string(),
                    parents.iter().map(ToString::to_string).collect(),
                )
            })
            .collect()
    }
}
