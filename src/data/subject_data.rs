//! Immutable per-subject snapshot keyed by context set

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::segment::Segment;
use crate::context::ContextSet;
use crate::subject::SubjectRef;

/// All stored data for one subject: at most one [`Segment`] per context set
///
/// Queries here are exact: a segment is only visible through the very context
/// set it was stored under. Every mutator returns a new snapshot sharing the
/// untouched segments; segments that become empty are dropped, so setting and
/// then clearing a value restores an equal snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<SegmentRecord>", into = "Vec<SegmentRecord>")]
pub struct ImmutableSubjectData {
    segments: HashMap<ContextSet, Arc<Segment>>,
}

/// Serialized form of one segment together with its contexts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentRecord {
    #[serde(default)]
    contexts: ContextSet,
    #[serde(flatten)]
    segment: Segment,
}

impl From<Vec<SegmentRecord>> for ImmutableSubjectData {
    fn from(records: Vec<SegmentRecord>) -> Self {
        records
            .into_iter()
            .fold(ImmutableSubjectData::new(), |data, record| {
                data.update_segment(&record.contexts, |seg| seg.merged_with(&record.segment))
            })
    }
}

impl From<ImmutableSubjectData> for Vec<SegmentRecord> {
    fn from(data: ImmutableSubjectData) -> Self {
        let mut records: Vec<SegmentRecord> = data
            .segments
            .into_iter()
            .map(|(contexts, segment)| SegmentRecord {
                contexts,
                segment: Arc::unwrap_or_clone(segment),
            })
            .collect();
        records.sort_by(|a, b| a.contexts.cmp(&b.contexts));
        records
    }
}

impl ImmutableSubjectData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The segment stored under exactly `contexts`
    pub fn segment(&self, contexts: &ContextSet) -> Option<&Segment> {
        self.segments.get(contexts).map(Arc::as_ref)
    }

    pub fn segments(&self) -> impl Iterator<Item = (&ContextSet, &Segment)> {
        self.segments.iter().map(|(c, s)| (c, s.as_ref()))
    }

    /// Every context set that has data
    pub fn active_contexts(&self) -> Vec<ContextSet> {
        let mut sets: Vec<ContextSet> = self.segments.keys().cloned().collect();
        sets.sort();
        sets
    }

    /// Apply `f` to the segment for `contexts` (empty if absent)
    pub fn update_segment<F>(&self, contexts: &ContextSet, f: F) -> Self
    where
        F: FnOnce(&Segment) -> Segment,
    {
        let empty = Segment::default();
        let current = self.segments.get(contexts).map(Arc::as_ref).unwrap_or(&empty);
        let updated = f(current);
        if updated == *current {
            return self.clone();
        }

        let mut segments = self.segments.clone();
        if updated.is_empty() {
            segments.remove(contexts);
        } else {
            segments.insert(contexts.clone(), Arc::new(updated));
        }
        Self { segments }
    }

    // Permissions

    pub fn permissions(&self, contexts: &ContextSet) -> HashMap<String, i32> {
        self.segment(contexts)
            .map(|s| s.permissions().clone())
            .unwrap_or_default()
    }

    pub fn permission(&self, contexts: &ContextSet, key: &str) -> i32 {
        self.segment(contexts).map(|s| s.permission(key)).unwrap_or(0)
    }

    /// Permissions of every segment, grouped by their own context set
    pub fn all_permissions(&self) -> HashMap<ContextSet, HashMap<String, i32>> {
        self.segments
            .iter()
            .filter(|(_, s)| !s.permissions().is_empty())
            .map(|(c, s)| (c.clone(), s.permissions().clone()))
            .collect()
    }

    /// Set a permission; `0` unsets it
    pub fn set_permission(&self, contexts: &ContextSet, key: &str, value: i32) -> Self {
        self.update_segment(contexts, |s| s.with_permission(key, value))
    }

    pub fn set_permissions(&self, contexts: &ContextSet, permissions: HashMap<String, i32>) -> Self {
        self.update_segment(contexts, |s| s.with_permissions(permissions))
    }

    pub fn clear_permissions(&self, contexts: &ContextSet) -> Self {
        self.update_segment(contexts, Segment::without_permissions)
    }

    pub fn clear_all_permissions(&self) -> Self {
        self.map_all(Segment::without_permissions)
    }

    // Options

    pub fn options(&self, contexts: &ContextSet) -> HashMap<String, String> {
        self.segment(contexts)
            .map(|s| s.options().clone())
            .unwrap_or_default()
    }

    pub fn option(&self, contexts: &ContextSet, key: &str) -> Option<&str> {
        self.segment(contexts).and_then(|s| s.option(key))
    }

    pub fn all_options(&self) -> HashMap<ContextSet, HashMap<String, String>> {
        self.segments
            .iter()
            .filter(|(_, s)| !s.options().is_empty())
            .map(|(c, s)| (c.clone(), s.options().clone()))
            .collect()
    }

    /// Set an option; `None` unsets it
    pub fn set_option(&self, contexts: &ContextSet, key: &str, value: Option<&str>) -> Self {
        self.update_segment(contexts, |s| s.with_option(key, value))
    }

    pub fn set_options(&self, contexts: &ContextSet, options: HashMap<String, String>) -> Self {
        self.update_segment(contexts, |s| s.with_options(options))
    }

    pub fn clear_options(&self, contexts: &ContextSet) -> Self {
        self.update_segment(contexts, Segment::without_options)
    }

    pub fn clear_all_options(&self) -> Self {
        self.map_all(Segment::without_options)
    }

    // Parents

    pub fn parents(&self, contexts: &ContextSet) -> Vec<SubjectRef> {
        self.segment(contexts)
            .map(|s| s.parents().to_vec())
            .unwrap_or_default()
    }

    pub fn all_parents(&self) -> HashMap<ContextSet, Vec<SubjectRef>> {
        self.segments
            .iter()
            .filter(|(_, s)| !s.parents().is_empty())
            .map(|(c, s)| (c.clone(), s.parents().to_vec()))
            .collect()
    }

    pub fn add_parent(&self, contexts: &ContextSet, parent: SubjectRef) -> Self {
        self.update_segment(contexts, |s| s.with_added_parent(parent))
    }

    pub fn remove_parent(&self, contexts: &ContextSet, parent: &SubjectRef) -> Self {
        self.update_segment(contexts, |s| s.with_removed_parent(parent))
    }

    pub fn set_parents(&self, contexts: &ContextSet, parents: Vec<SubjectRef>) -> Self {
        self.update_segment(contexts, |s| s.with_parents(parents))
    }

    pub fn clear_parents(&self, contexts: &ContextSet) -> Self {
        self.update_segment(contexts, Segment::without_parents)
    }

    pub fn clear_all_parents(&self) -> Self {
        self.map_all(Segment::without_parents)
    }

    // Default values

    pub fn default_value(&self, contexts: &ContextSet) -> i32 {
        self.segment(contexts).map(Segment::default_value).unwrap_or(0)
    }

    pub fn all_default_values(&self) -> HashMap<ContextSet, i32> {
        self.segments
            .iter()
            .filter(|(_, s)| s.default_value() != 0)
            .map(|(c, s)| (c.clone(), s.default_value()))
            .collect()
    }

    pub fn set_default_value(&self, contexts: &ContextSet, value: i32) -> Self {
        self.update_segment(contexts, |s| s.with_default_value(value))
    }

    /// Overlay every segment of `other` onto this snapshot
    pub fn merge_from(&self, other: &ImmutableSubjectData) -> Self {
        other.segments.iter().fold(self.clone(), |data, (contexts, seg)| {
            data.update_segment(contexts, |own| own.merged_with(seg))
        })
    }

    fn map_all<F>(&self, f: F) -> Self
    where
        F: Fn(&Segment) -> Segment,
    {
        let segments = self
            .segments
            .iter()
            .filter_map(|(contexts, seg)| {
                let updated = f(seg);
                if updated.is_empty() {
                    None
                } else if updated == **seg {
                    Some((contexts.clone(), seg.clone()))
                } else {
                    Some((contexts.clone(), Arc::new(updated)))
                }
            })
            .collect();
        Self { segments }
    }
}
