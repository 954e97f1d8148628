//! Time-range and parameter queries over staged data.

use crate::merge::Direction;
use crate::sample::{ParamId, Sample, Timestamp};
use std::fmt;

/// Parameter filter: decides which parameter ids a search matches.
pub type ParamPredicate = Box<dyn Fn(ParamId) -> bool + Send + Sync>;

/// A search over staged samples.
///
/// Bounds are strict on both sides: a sample matches only when
/// `lower_bound < timestamp < upper_bound`.
pub struct SearchQuery {
    /// Exclusive lower timestamp bound.
    pub lower_bound: Timestamp,
    /// Exclusive upper timestamp bound.
    pub upper_bound: Timestamp,
    /// Direction of the merged result stream.
    pub direction: Direction,
    predicate: ParamPredicate,
}

impl SearchQuery {
    /// Query matching every parameter id inside `(lower_bound, upper_bound)`.
    pub fn all_params(lower_bound: Timestamp, upper_bound: Timestamp, direction: Direction) -> Self {
        Self::with_predicate(lower_bound, upper_bound, direction, |_| true)
    }

    /// Query matching a single parameter id.
    pub fn for_param(
        lower_bound: Timestamp,
        upper_bound: Timestamp,
        direction: Direction,
        param_id: ParamId,
    ) -> Self {
        Self::with_predicate(lower_bound, upper_bound, direction, move |id| id == param_id)
    }

    /// Query with a custom parameter predicate.
    pub fn with_predicate(
        lower_bound: Timestamp,
        upper_bound: Timestamp,
        direction: Direction,
        predicate: impl Fn(ParamId) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            lower_bound,
            upper_bound,
            direction,
            predicate: Box::new(predicate),
        }
    }

    /// Whether `sample` satisfies both the time bounds and the predicate.
    pub fn matches(&self, sample: &Sample) -> bool {
        self.lower_bound < sample.timestamp
            && sample.timestamp < self.upper_bound
            && self.matches_param(sample.param_id)
    }

    pub(crate) fn matches_param(&self, param_id: ParamId) -> bool {
        (self.predicate)(param_id)
    }
}

impl fmt::Debug for SearchQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchQuery")
            .field("lower_bound", &self.lower_bound)
            .field("upper_bound", &self.upper_bound)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_are_strict() {
        let query = SearchQuery::all_params(10, 20, Direction::Forward);
        assert!(!query.matches(&Sample::new(10, 1, 0)));
        assert!(query.matches(&Sample::new(11, 1, 0)));
        assert!(query.matches(&Sample::new(19, 1, 0)));
        assert!(!query.matches(&Sample::new(20, 1, 0)));
    }

    #[test]
    fn test_param_predicate_filters() {
        let query = SearchQuery::for_param(0, 100, Direction::Forward, 7);
        assert!(query.matches(&Sample::new(50, 7, 0)));
        assert!(!query.matches(&Sample::new(50, 8, 0)));
    }

    #[test]
    fn test_custom_predicate() {
        let query = SearchQuery::with_predicate(0, 100, Direction::Backward, |id| id % 2 == 0);
        assert!(query.matches(&Sample::new(1, 4, 0)));
        assert!(!query.matches(&Sample::new(1, 5, 0)));
    }
}
