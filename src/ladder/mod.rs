//! Rank ladders: ordered promotion tracks
//!
//! Index 0 is the lowest rank. Every operation returns a new ladder; an
//! operation that changes nothing hands back the very same `Arc`, so callers
//! detect no-ops with `Arc::ptr_eq` (or [`Change::changed`]).

mod cache;

pub use cache::RankLadderCache;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::ContextSet;
use crate::data::{Change, ImmutableSubjectData};
use crate::error::Result;
use crate::subject::{CalculatedSubject, SubjectRef};

/// A named, ordered list of ranks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankLadder {
    name: String,
    ranks: Vec<SubjectRef>,
}

impl RankLadder {
    pub fn new(name: &str, ranks: Vec<SubjectRef>) -> Self {
        Self {
            name: name.to_string(),
            ranks,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ranks from lowest to highest
    pub fn ranks(&self) -> &[SubjectRef] {
        &self.ranks
    }

    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    /// Position of `subject`; the first one if listed more than once
    pub fn index_of(&self, subject: &SubjectRef) -> Option<usize> {
        self.ranks.iter().position(|rank| rank == subject)
    }

    fn with_ranks(&self, ranks: Vec<SubjectRef>) -> Arc<Self> {
        Arc::new(Self {
            name: self.name.clone(),
            ranks,
        })
    }

    /// Append `subject` as the new highest rank
    pub fn add_rank(self: &Arc<Self>, subject: SubjectRef) -> Arc<Self> {
        if self.index_of(&subject).is_some() {
            return self.clone();
        }
        let mut ranks = self.ranks.clone();
        ranks.push(subject);
        self.with_ranks(ranks)
    }

    /// Insert `subject` before the rank currently at `position`
    ///
    /// Positions past the end append. A subject already on the ladder is
    /// moved; since its removal shifts everything above it down by one, the
    /// target position is adjusted so that moving a rank up by one actually
    /// swaps it with its neighbour.
    pub fn add_rank_at(self: &Arc<Self>, subject: SubjectRef, position: usize) -> Arc<Self> {
        let mut ranks = self.ranks.clone();
        let mut position = position.min(ranks.len());

        if let Some(current) = self.index_of(&subject) {
            if current < position {
                position -= 1;
            }
            if current == position {
                return self.clone();
            }
            ranks.remove(current);
        }
        ranks.insert(position, subject);
        self.with_ranks(ranks)
    }

    /// Move `subject` by `delta` places (positive is up); absent subjects are a no-op
    pub fn move_rank(self: &Arc<Self>, subject: SubjectRef, delta: isize) -> Arc<Self> {
        let Some(current) = self.index_of(&subject) else {
            return self.clone();
        };
        let target = if delta > 0 {
            current.saturating_add(delta.unsigned_abs()).saturating_add(1)
        } else {
            current.saturating_sub(delta.unsigned_abs())
        };
        self.add_rank_at(subject, target)
    }

    pub fn remove_rank(self: &Arc<Self>, subject: &SubjectRef) -> Arc<Self> {
        if self.index_of(subject).is_none() {
            return self.clone();
        }
        let ranks = self
            .ranks
            .iter()
            .filter(|rank| *rank != subject)
            .cloned()
            .collect();
        self.with_ranks(ranks)
    }

    /// Replace the subject's rank under `contexts` with the next one up
    ///
    /// Unchanged when no parent under exactly `contexts` is on this ladder,
    /// or when it already holds the top rank.
    pub fn promote(
        &self,
        contexts: &ContextSet,
        data: &Arc<ImmutableSubjectData>,
    ) -> Change<ImmutableSubjectData> {
        self.step(contexts, data, 1)
    }

    /// Replace the subject's rank under `contexts` with the next one down
    pub fn demote(
        &self,
        contexts: &ContextSet,
        data: &Arc<ImmutableSubjectData>,
    ) -> Change<ImmutableSubjectData> {
        self.step(contexts, data, -1)
    }

    /// [`promote`](Self::promote) applied through the subject's persistent data
    pub async fn promote_subject(
        &self,
        contexts: &ContextSet,
        subject: &CalculatedSubject,
    ) -> Result<Change<ImmutableSubjectData>> {
        subject
            .update(false, |data| {
                self.stepped(contexts, data, 1)
                    .unwrap_or_else(|| data.clone())
            })
            .await
    }

    /// [`demote`](Self::demote) applied through the subject's persistent data
    pub async fn demote_subject(
        &self,
        contexts: &ContextSet,
        subject: &CalculatedSubject,
    ) -> Result<Change<ImmutableSubjectData>> {
        subject
            .update(false, |data| {
                self.stepped(contexts, data, -1)
                    .unwrap_or_else(|| data.clone())
            })
            .await
    }

    fn step(
        &self,
        contexts: &ContextSet,
        data: &Arc<ImmutableSubjectData>,
        direction: isize,
    ) -> Change<ImmutableSubjectData> {
        match self.stepped(contexts, data, direction) {
            Some(next) => Change::new(data.clone(), Arc::new(next)),
            None => Change::unchanged(data.clone()),
        }
    }

    fn stepped(
        &self,
        contexts: &ContextSet,
        data: &ImmutableSubjectData,
        direction: isize,
    ) -> Option<ImmutableSubjectData> {
        let parents = data.parents(contexts);
        let (slot, index) = parents
            .iter()
            .enumerate()
            .find_map(|(slot, parent)| self.index_of(parent).map(|index| (slot, index)))?;

        let target = index.checked_add_signed(direction)?;
        let replacement = self.ranks.get(target)?.clone();

        let mut next = parents;
        next[slot] = replacement;
        Some(data.set_parents(contexts, next))
    }
}
