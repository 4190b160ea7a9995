//! Segment selection for an active context set

use crate::config::ContextMatching;
use crate::context::{ContextDefinitionRegistry, ContextInheritance, ContextSet, ContextValue};
use crate::data::{ImmutableSubjectData, Segment};

/// Ordering key of a matched segment; lower sorts first
pub(crate) type MatchRank = (usize, usize);

/// Picks the segments of a subject that apply under a query context set
pub(crate) struct SegmentMatcher<'a> {
    mode: ContextMatching,
    registry: &'a ContextDefinitionRegistry,
    inheritance: &'a ContextInheritance,
}

impl<'a> SegmentMatcher<'a> {
    pub(crate) fn new(
        mode: ContextMatching,
        registry: &'a ContextDefinitionRegistry,
        inheritance: &'a ContextInheritance,
    ) -> Self {
        Self {
            mode,
            registry,
            inheritance,
        }
    }

    /// Segments of `data` applying to `query`, best match first
    pub(crate) fn matching<'d>(
        &self,
        data: &'d ImmutableSubjectData,
        query: &ContextSet,
    ) -> Vec<(MatchRank, &'d ContextSet, &'d Segment)> {
        let mut matched: Vec<(MatchRank, &ContextSet, &Segment)> = match self.mode {
            ContextMatching::Exact => self.exact(data, query),
            ContextMatching::Subset => self.subset(data, query),
        };
        matched.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        matched
    }

    /// Segments naming exactly the query's values, with filter contexts
    /// (networks, time windows) tested against the query instead
    ///
    /// Inherited substitutions rank after the query itself. Within one
    /// candidate, segments constrained by more filters rank first.
    fn exact<'d>(
        &self,
        data: &'d ImmutableSubjectData,
        query: &ContextSet,
    ) -> Vec<(MatchRank, &'d ContextSet, &'d Segment)> {
        let substitutions = self.inheritance.substitutions(query);
        let candidates: Vec<(Vec<&ContextValue>, Vec<&ContextValue>)> = std::iter::once(query)
            .chain(substitutions.iter())
            .map(|candidate| self.split(candidate))
            .collect();

        data.segments()
            .filter_map(|(contexts, segment)| {
                let (named, filters) = self.split(contexts);
                candidates
                    .iter()
                    .position(|(query_named, query_filters)| {
                        self.one_to_one(&named, query_named)
                            && filters.iter().all(|own| {
                                query_filters.iter().any(|test| self.registry.matches(own, test))
                            })
                    })
                    .map(|index| ((index, usize::MAX - filters.len()), contexts, segment))
            })
            .collect()
    }

    /// Every segment covered by the query plus its inherited values
    ///
    /// More contexts rank first; among equally specific segments, those
    /// relying less on inherited values win.
    fn subset<'d>(
        &self,
        data: &'d ImmutableSubjectData,
        query: &ContextSet,
    ) -> Vec<(MatchRank, &'d ContextSet, &'d Segment)> {
        let expanded = self.inheritance.expand(query);

        data.segments()
            .filter(|(contexts, _)| contexts.iter().all(|own| self.matched_by(own, &expanded)))
            .map(|(contexts, segment)| {
                let inherited = contexts
                    .iter()
                    .filter(|own| !self.matched_by(own, query))
                    .count();
                ((usize::MAX - contexts.len(), inherited), contexts, segment)
            })
            .collect()
    }

    /// Named values and filter values of `set`
    fn split<'s>(&self, set: &'s ContextSet) -> (Vec<&'s ContextValue>, Vec<&'s ContextValue>) {
        set.iter().partition(|value| !self.registry.is_filter(value.key()))
    }

    /// Pair every stored value with a distinct query value, leaving none over
    fn one_to_one(&self, own: &[&ContextValue], query: &[&ContextValue]) -> bool {
        if own.len() != query.len() {
            return false;
        }
        let mut used = vec![false; query.len()];
        for value in own {
            let slot = (0..query.len()).find(|&i| !used[i] && self.registry.matches(value, query[i]));
            match slot {
                Some(i) => used[i] = true,
                None => return false,
            }
        }
        true
    }

    fn matched_by(&self, own: &ContextValue, candidates: &ContextSet) -> bool {
        candidates.iter().any(|test| self.registry.matches(own, test))
    }
}
