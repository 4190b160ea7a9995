//! The data bundle stored for one exact context set

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::node_tree::NodeTree;
use crate::subject::SubjectRef;

/// Permission key that sets a segment's default value
pub const DEFAULT_PERMISSION: &str = "*";

/// Permissions, options, parents and default value for one context set
///
/// Permission values: positive grants, negative denies, zero is undefined.
/// Magnitude acts as a weight when merging sources. Permission keys are
/// case-insensitive and stored lower-cased. Every `with_*` method returns a
/// new segment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Segment {
    #[serde(
        skip_serializing_if = "HashMap::is_empty",
        deserialize_with = "lowercase_keys"
    )]
    permissions: HashMap<String, i32>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    options: HashMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    parents: Vec<SubjectRef>,
    #[serde(skip_serializing_if = "is_zero")]
    default_value: i32,
}

fn is_zero(value: &i32) -> bool {
    *value == 0
}

fn lowercase_keys<'de, D: Deserializer<'de>>(deserializer: D) -> Result<HashMap<String, i32>, D::Error> {
    let raw = HashMap::<String, i32>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .filter(|(_, value)| *value != 0)
        .map(|(key, value)| (key.to_lowercase(), value))
        .collect())
}

impl Segment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn permissions(&self) -> &HashMap<String, i32> {
        &self.permissions
    }

    pub fn permission(&self, key: &str) -> i32 {
        self.permissions
            .get(&key.to_lowercase())
            .copied()
            .unwrap_or(0)
    }

    pub fn options(&self) -> &HashMap<String, String> {
        &self.options
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn parents(&self) -> &[SubjectRef] {
        &self.parents
    }

    pub fn default_value(&self) -> i32 {
        self.default_value
    }

    /// Nothing set at all
    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
            && self.options.is_empty()
            && self.parents.is_empty()
            && self.default_value == 0
    }

    /// Set a permission; `0` unsets it and `*` sets the default value
    pub fn with_permission(&self, key: &str, value: i32) -> Self {
        if key == DEFAULT_PERMISSION {
            return self.with_default_value(value);
        }
        let key = key.to_lowercase();
        let mut next = self.clone();
        if value == 0 {
            next.permissions.remove(&key);
        } else {
            next.permissions.insert(key, value);
        }
        next
    }

    /// Replace all permissions
    pub fn with_permissions(&self, permissions: HashMap<String, i32>) -> Self {
        let mut next = Self {
            permissions: HashMap::new(),
            ..self.clone()
        };
        for (key, value) in permissions {
            next = next.with_permission(&key, value);
        }
        next
    }

    pub fn without_permissions(&self) -> Self {
        Self {
            permissions: HashMap::new(),
            ..self.clone()
        }
    }

    /// Set an option; `None` unsets it
    pub fn with_option(&self, key: &str, value: Option<&str>) -> Self {
        let mut next = self.clone();
        match value {
            Some(value) => {
                next.options.insert(key.to_string(), value.to_string());
            }
            None => {
                next.options.remove(key);
            }
        }
        next
    }

    pub fn with_options(&self, options: HashMap<String, String>) -> Self {
        Self {
            options,
            ..self.clone()
        }
    }

    pub fn without_options(&self) -> Self {
        Self {
            options: HashMap::new(),
            ..self.clone()
        }
    }

    /// Append a parent at the lowest priority; already present is a no-op
    pub fn with_added_parent(&self, parent: SubjectRef) -> Self {
        if self.parents.contains(&parent) {
            return self.clone();
        }
        let mut next = self.clone();
        next.parents.push(parent);
        next
    }

    pub fn with_removed_parent(&self, parent: &SubjectRef) -> Self {
        let mut next = self.clone();
        next.parents.retain(|p| p != parent);
        next
    }

    /// Replace the parent list, dropping duplicates after their first occurrence
    pub fn with_parents(&self, parents: Vec<SubjectRef>) -> Self {
        let mut deduped: Vec<SubjectRef> = Vec::with_capacity(parents.len());
        for parent in parents {
            if !deduped.contains(&parent) {
                deduped.push(parent);
            }
        }
        Self {
            parents: deduped,
            ..self.clone()
        }
    }

    pub fn without_parents(&self) -> Self {
        Self {
            parents: Vec::new(),
            ..self.clone()
        }
    }

    pub fn with_default_value(&self, value: i32) -> Self {
        Self {
            default_value: value,
            ..self.clone()
        }
    }

    /// Overlay `other` on top of this segment
    ///
    /// Permissions and options from `other` overwrite, its parents are appended
    /// if missing, and its default value replaces ours when non-zero.
    pub fn merged_with(&self, other: &Segment) -> Self {
        let mut next = self.clone();
        next.permissions
            .extend(other.permissions.iter().map(|(k, v)| (k.clone(), *v)));
        next.options
            .extend(other.options.iter().map(|(k, v)| (k.clone(), v.clone())));
        for parent in &other.parents {
            if !next.parents.contains(parent) {
                next.parents.push(parent.clone());
            }
        }
        if other.default_value != 0 {
            next.default_value = other.default_value;
        }
        next
    }

    /// Wildcard tree over this segment's permissions alone
    pub fn node_tree(&self) -> NodeTree {
        NodeTree::of(
            self.permissions.iter().map(|(k, v)| (k.as_str(), *v)),
            self.default_value,
        )
    }
}
