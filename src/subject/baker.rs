//! Flattening a subject and its ancestry into one queryable view
//!
//! Sources are visited in priority order: the subject's own segments
//! (transient and persistent, ordered by match rank), then each parent
//! depth-first in declared order, then the type defaults and global defaults
//! subjects. Each matched segment contributes one permission layer; the first
//! layer that configures a permission decides it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::warn;

use super::matcher::SegmentMatcher;
use super::SubjectRef;
use crate::context::ContextSet;
use crate::data::ImmutableSubjectData;
use crate::node_tree::NodeTree;

/// Both data sources of one subject as seen by a bake
#[derive(Debug, Clone)]
pub(crate) struct SubjectSnapshot {
    pub persistent: Arc<ImmutableSubjectData>,
    pub transient: Arc<ImmutableSubjectData>,
    pub transient_has_priority: bool,
}

/// Inputs shared by every step of one bake
pub(crate) struct BakeOptions<'a> {
    pub matcher: SegmentMatcher<'a>,
    /// Visited after the subject's own ancestry, in order
    pub defaults: Vec<SubjectRef>,
}

/// Aggregated result for one (subject, context set)
#[derive(Debug, Default)]
pub(crate) struct BakedSubjectData {
    layers: Vec<NodeTree>,
    default_value: i32,
    options: HashMap<String, String>,
    parents: Vec<SubjectRef>,
    ancestors: HashSet<SubjectRef>,
}

impl BakedSubjectData {
    /// First non-zero answer across layers, then the first non-zero default
    pub(crate) fn permission(&self, permission: &str) -> i32 {
        self.layers
            .iter()
            .map(|layer| layer.get_explicit(permission))
            .find(|value| *value != 0)
            .unwrap_or(self.default_value)
    }

    /// Explicitly configured permissions, each taken from its highest-priority layer
    pub(crate) fn permissions(&self) -> HashMap<String, i32> {
        let mut out = HashMap::new();
        for layer in &self.layers {
            for (key, value) in layer.as_map() {
                out.entry(key).or_insert(value);
            }
        }
        out
    }

    pub(crate) fn default_value(&self) -> i32 {
        self.default_value
    }

    pub(crate) fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub(crate) fn options(&self) -> &HashMap<String, String> {
        &self.options
    }

    /// Direct parents of the baked subject
    pub(crate) fn parents(&self) -> &[SubjectRef] {
        &self.parents
    }

    /// Every subject visited while baking, resident or not
    pub(crate) fn ancestors(&self) -> &HashSet<SubjectRef> {
        &self.ancestors
    }
}

/// Bake `base` under `contexts`
///
/// `resolve` supplies resident subjects; anything it cannot supply
/// contributes nothing. A parent already on the current inheritance path is
/// reported and skipped, so cyclic graphs terminate.
pub(crate) fn bake<F>(
    base: &SubjectRef,
    contexts: &ContextSet,
    options: &BakeOptions<'_>,
    resolve: F,
) -> BakedSubjectData
where
    F: Fn(&SubjectRef) -> Option<SubjectSnapshot>,
{
    let mut baked = BakedSubjectData::default();
    let mut default_found = false;

    let roots = std::iter::once(base).chain(options.defaults.iter());
    for root in roots {
        let mut stack: Vec<(SubjectRef, usize)> = vec![(root.clone(), 0)];
        let mut path: Vec<SubjectRef> = Vec::new();

        while let Some((subject, depth)) = stack.pop() {
            path.truncate(depth);
            if path.contains(&subject) {
                warn!(
                    "Circular inheritance detected while resolving {}: {} is its own ancestor via {}",
                    base,
                    subject,
                    path.last().map(ToString::to_string).unwrap_or_default()
                );
                continue;
            }
            if !baked.ancestors.insert(subject.clone()) {
                continue;
            }
            path.push(subject.clone());

            let Some(snapshot) = resolve(&subject) else {
                continue;
            };

            let (first, second) = if snapshot.transient_has_priority {
                (&snapshot.transient, &snapshot.persistent)
            } else {
                (&snapshot.persistent, &snapshot.transient)
            };
            let mut matched: Vec<_> = options
                .matcher
                .matching(first, contexts)
                .into_iter()
                .map(|(rank, c, s)| (rank, 0u8, c, s))
                .chain(
                    options
                        .matcher
                        .matching(second, contexts)
                        .into_iter()
                        .map(|(rank, c, s)| (rank, 1u8, c, s)),
                )
                .collect();
            matched.sort_by(|a, b| (a.0, a.1, a.2).cmp(&(b.0, b.1, b.2)));

            let mut parents: Vec<SubjectRef> = Vec::new();
            for (_, _, _, segment) in matched {
                baked.layers.push(segment.node_tree());
                if !default_found && segment.default_value() != 0 {
                    baked.default_value = segment.default_value();
                    default_found = true;
                }
                for (key, value) in segment.options() {
                    baked
                        .options
                        .entry(key.clone())
                        .or_insert_with(|| value.clone());
                }
                for parent in segment.parents() {
                    if !parents.contains(parent) {
                        parents.push(parent.clone());
                    }
                }
            }

            for parent in parents.iter().rev() {
                stack.push((parent.clone(), depth + 1));
            }
            if subject == *base {
                baked.parents = parents;
            }
        }
    }

    baked
}
