//! Single-condition evaluation.
//!
//! [`ConditionEvaluator`] runs one [`Condition`] against a [`SeriesBackend`]:
//! every returned series is reduced and judged, firing series become matches
//! and the rest become ok matches. A query that returns no series at all is
//! judged as "no value" and, if that fires, reported as a single
//! [`NO_DATA_METRIC`](crate::types::NO_DATA_METRIC) match.

use beacon_metrics::{SeriesBackend, SeriesQuery, TimeRange};
use tracing::debug;

use crate::error::Result;
use crate::types::{Condition, ConditionResult, EvalMatch, normalize_tags};

/// Evaluates conditions against a time-series backend.
#[derive(Clone, Copy)]
pub struct ConditionEvaluator<'a> {
    backend: &'a dyn SeriesBackend,
}

impl std::fmt::Debug for ConditionEvaluator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionEvaluator").finish_non_exhaustive()
    }
}

impl<'a> ConditionEvaluator<'a> {
    /// Creates an evaluator over `backend`.
    #[must_use]
    pub const fn new(backend: &'a dyn SeriesBackend) -> Self {
        Self { backend }
    }

    /// Evaluates the condition at position `index` over `range`.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Validation` for an unusable metric name and
    /// `AlertError::Query` if the backend fails.
    pub fn evaluate(
        &self,
        index: usize,
        condition: &Condition,
        range: TimeRange,
    ) -> Result<ConditionResult> {
        let mut query = SeriesQuery::new(condition.query.metric_name()?).range(range);
        for (key, value) in &condition.query.filters {
            query = query.filter(key.clone(), value.clone());
        }
        for key in &condition.query.group_by {
            query = query.group_by(key.clone());
        }

        let series = self.backend.select(&query)?;
        let metric = condition.query.metric_label();

        let mut matches = Vec::new();
        let mut ok_matches = Vec::new();
        let mut empty_series = 0;

        for s in &series {
            let reduced = s.reduce(condition.reducer);
            let fires = condition.evaluator.eval(reduced);

            if reduced.is_none() {
                empty_series += 1;
            }

            let build = || EvalMatch {
                metric: metric.clone(),
                tags: normalize_tags(&s.tags),
                value: reduced,
            };
            if fires {
                matches.push(build());
            } else if reduced.is_some() {
                ok_matches.push(build());
            }
        }

        if series.is_empty() && condition.evaluator.eval(None) {
            matches.push(EvalMatch::no_data());
        }

        debug!(
            condition = index,
            metric = %metric,
            series = series.len(),
            firing = matches.len(),
            ok = ok_matches.len(),
            "evaluated condition"
        );

        Ok(ConditionResult {
            index,
            bucket: condition.bucket_key(index),
            firing: !matches.is_empty(),
            no_data_found: empty_series == series.len(),
            operator: condition.operator,
            matches,
            ok_matches,
        })
    }

    /// Evaluates an ordered condition list, stopping at the first error.
    ///
    /// Every condition is queried. Use [`combine_with`](crate::combinator::combine_with)
    /// to stop querying once an `and` short-circuits.
    ///
    /// # Errors
    ///
    /// Returns the first evaluation error.
    pub fn evaluate_all(
        &self,
        conditions: &[Condition],
        range: TimeRange,
    ) -> Result<Vec<ConditionResult>> {
        conditions
            .iter()
            .enumerate()
            .map(|(index, condition)| self.evaluate(index, condition, range))
            .collect()
    }
}
