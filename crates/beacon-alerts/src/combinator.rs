//! Boolean combination of condition results.
//!
//! Results are folded in condition order. The first result seeds `firing`;
//! every later one is folded in with its own operator:
//!
//! - `or`: `firing ||= result.firing`, and the correlated set becomes the
//!   union, de-duplicated with [`EvalMatch::same_entity`]
//! - `and`: `firing &&= result.firing`, and the correlated set becomes the
//!   intersection with the new matches; an empty intersection stops firing
//!   and short-circuits the remaining conditions, which are then never
//!   evaluated when folding through [`combine_with`]
//!
//! Each condition also leaves a bucket of its own matches, keyed
//! `field--index`. The largest bucket (lowest index on ties) is the canonical
//! set used for resource generation. Under `and` the first bucket keeps its
//! unfiltered matches, so the canonical set is not an N-way intersection.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::types::{ConditionResult, EvalMatch, Operator};

/// The matches a single condition contributed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchBucket {
    /// `field--index`.
    pub key: String,
    /// Condition position.
    pub index: usize,
    /// Matches kept from that condition.
    pub matches: Vec<EvalMatch>,
}

/// The outcome of combining a rule's condition results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CombinedResult {
    /// True if the rule fires.
    pub firing: bool,
    /// True if every evaluated condition found no data.
    pub no_data_found: bool,
    /// Number of conditions folded before stopping.
    pub evaluated: usize,
    /// Per-condition buckets in condition order.
    pub buckets: Vec<MatchBucket>,
    /// Matches correlated across all folded conditions.
    pub correlated: Vec<EvalMatch>,
    /// Non-firing series from every folded condition.
    pub ok_matches: Vec<EvalMatch>,
}

impl CombinedResult {
    /// Returns the largest bucket, preferring the lowest index on ties.
    #[must_use]
    pub fn canonical_bucket(&self) -> Option<&MatchBucket> {
        self.buckets.iter().fold(None, |best: Option<&MatchBucket>, b| match best {
            Some(current) if current.matches.len() >= b.matches.len() => Some(current),
            _ => Some(b),
        })
    }

    /// Returns the canonical match set.
    #[must_use]
    pub fn canonical(&self) -> &[EvalMatch] {
        self.canonical_bucket()
            .map(|b| b.matches.as_slice())
            .unwrap_or_default()
    }
}

/// Incremental fold of condition results.
///
/// Results are pushed one at a time, in condition order. Once an `and`
/// intersection comes up empty the fold stops and further results are
/// ignored, so a caller can skip evaluating the remaining conditions.
#[derive(Debug, Clone, PartialEq)]
pub struct Combiner {
    combined: CombinedResult,
    stopped: bool,
}

impl Default for Combiner {
    fn default() -> Self {
        Self::new()
    }
}

impl Combiner {
    /// Creates an empty fold.
    #[must_use]
    pub fn new() -> Self {
        Self {
            combined: CombinedResult {
                no_data_found: true,
                ..CombinedResult::default()
            },
            stopped: false,
        }
    }

    /// Returns true once the fold has short-circuited.
    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Folds in the next result.
    ///
    /// Returns false if no further results are needed.
    pub fn push(&mut self, result: ConditionResult) -> bool {
        if self.stopped {
            return false;
        }

        let combined = &mut self.combined;
        let position = combined.evaluated;
        combined.evaluated += 1;
        combined.no_data_found &= result.no_data_found;
        combined.ok_matches.extend(result.ok_matches);

        if position == 0 {
            combined.firing = result.firing;
            combined.correlated.clone_from(&result.matches);
            combined.buckets.push(MatchBucket {
                key: result.bucket,
                index: result.index,
                matches: result.matches,
            });
            return true;
        }

        match result.operator {
            Operator::Or => {
                combined.firing = combined.firing || result.firing;
                for m in &result.matches {
                    if !combined.correlated.iter().any(|c| c.same_entity(m)) {
                        combined.correlated.push(m.clone());
                    }
                }
                combined.buckets.push(MatchBucket {
                    key: result.bucket,
                    index: result.index,
                    matches: result.matches,
                });
            }
            Operator::And => {
                combined.firing = combined.firing && result.firing;
                let retained: Vec<EvalMatch> = result
                    .matches
                    .into_iter()
                    .filter(|m| combined.correlated.iter().any(|c| c.same_entity(m)))
                    .collect();
                combined
                    .correlated
                    .retain(|c| retained.iter().any(|m| m.same_entity(c)));

                let empty = retained.is_empty();
                combined.buckets.push(MatchBucket {
                    key: result.bucket,
                    index: result.index,
                    matches: retained,
                });

                if empty {
                    debug!(
                        condition = result.index,
                        "no correlated matches, stopping combination"
                    );
                    combined.firing = false;
                    self.stopped = true;
                }
            }
        }

        !self.stopped
    }

    /// Finishes the fold.
    #[must_use]
    pub fn finish(mut self) -> CombinedResult {
        if self.combined.evaluated == 0 {
            self.combined.no_data_found = false;
        }
        self.combined
    }
}

/// Folds already evaluated condition results in the order given.
#[must_use]
pub fn combine(results: Vec<ConditionResult>) -> CombinedResult {
    let mut combiner = Combiner::new();
    for result in results {
        if !combiner.push(result) {
            break;
        }
    }
    combiner.finish()
}

/// Evaluates and folds `count` conditions lazily.
///
/// `source` is called with each condition index in order and is never called
/// again after the fold short-circuits.
///
/// # Errors
///
/// Returns the first error from `source`.
pub fn combine_with<F>(count: usize, mut source: F) -> Result<CombinedResult>
where
    F: FnMut(usize) -> Result<ConditionResult>,
{
    let mut combiner = Combiner::new();
    for index in 0..count {
        if !combiner.push(source(index)?) {
            break;
        }
    }
    Ok(combiner.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AlertError;

    fn result(index: usize, operator: Operator, matches: Vec<EvalMatch>) -> ConditionResult {
        ConditionResult {
            index,
            bucket: format!("f{index}--{index}"),
            firing: !matches.is_empty(),
            no_data_found: false,
            operator,
            matches,
            ok_matches: vec![],
        }
    }

    fn vm(id: &str) -> EvalMatch {
        EvalMatch::new("vm_cpu.usage_active", 1.0).tag("vm_id", id)
    }

    fn host(id: &str) -> EvalMatch {
        EvalMatch::new("host_cpu.usage_active", 1.0).tag("host_id", id)
    }

    #[test]
    fn first_result_seeds_firing() {
        let combined = combine(vec![result(0, Operator::And, vec![vm("i-1")])]);
        assert!(combined.firing);
        assert_eq!(combined.correlated, vec![vm("i-1")]);
        assert_eq!(combined.canonical(), &[vm("i-1")]);
    }

    #[test]
    fn empty_input_does_not_fire() {
        let combined = combine(vec![]);
        assert!(!combined.firing);
        assert!(combined.canonical().is_empty());
        assert!(!combined.no_data_found);
    }

    #[test]
    fn and_intersects_by_identity() {
        let combined = combine(vec![
            result(0, Operator::And, vec![vm("i-1"), vm("i-2")]),
            result(1, Operator::And, vec![vm("i-2"), vm("i-3")]),
        ]);

        assert!(combined.firing);
        assert_eq!(combined.correlated, vec![vm("i-2")]);
        assert_eq!(combined.buckets[1].matches, vec![vm("i-2")]);
    }

    #[test]
    fn and_without_shared_identity_tags_is_empty() {
        let combined = combine(vec![
            result(0, Operator::And, vec![vm("i-1")]),
            result(1, Operator::And, vec![host("h-1")]),
        ]);

        assert!(!combined.firing);
        assert!(combined.correlated.is_empty());
    }

    #[test]
    fn and_short_circuits_on_empty_intersection() {
        let combined = combine(vec![
            result(0, Operator::And, vec![vm("i-1")]),
            result(1, Operator::And, vec![vm("i-9")]),
            result(2, Operator::Or, vec![vm("i-1")]),
        ]);

        assert!(!combined.firing);
        assert_eq!(combined.evaluated, 2);
        assert_eq!(combined.buckets.len(), 2);
    }

    #[test]
    fn or_unions_without_duplicates() {
        let combined = combine(vec![
            result(0, Operator::And, vec![vm("i-1")]),
            result(1, Operator::Or, vec![vm("i-1"), vm("i-2")]),
        ]);

        assert!(combined.firing);
        assert_eq!(combined.correlated, vec![vm("i-1"), vm("i-2")]);
    }

    #[test]
    fn or_fires_when_either_side_fires() {
        let combined = combine(vec![
            result(0, Operator::And, vec![]),
            result(1, Operator::Or, vec![vm("i-2")]),
        ]);
        assert!(combined.firing);
        assert_eq!(combined.canonical(), &[vm("i-2")]);
    }

    #[test]
    fn canonical_is_largest_bucket_not_intersection() {
        let combined = combine(vec![
            result(0, Operator::And, vec![vm("i-1"), vm("i-2"), vm("i-3")]),
            result(1, Operator::And, vec![vm("i-1")]),
        ]);

        assert_eq!(combined.correlated, vec![vm("i-1")]);
        assert_eq!(combined.canonical_bucket().map(|b| b.index), Some(0));
        assert_eq!(combined.canonical().len(), 3);
    }

    #[test]
    fn canonical_ties_go_to_lowest_index() {
        let combined = combine(vec![
            result(0, Operator::And, vec![vm("i-1")]),
            result(1, Operator::Or, vec![vm("i-2")]),
        ]);
        assert_eq!(combined.canonical_bucket().map(|b| b.key.as_str()), Some("f0--0"));
    }

    #[test]
    fn ok_matches_accumulate() {
        let mut first = result(0, Operator::And, vec![vm("i-1")]);
        first.ok_matches = vec![vm("i-5")];
        let mut second = result(1, Operator::Or, vec![]);
        second.ok_matches = vec![vm("i-6")];

        let combined = combine(vec![first, second]);
        assert_eq!(combined.ok_matches, vec![vm("i-5"), vm("i-6")]);
    }

    mod lazy_tests {
        use super::*;

        #[test]
        fn stops_calling_source_after_empty_intersection() {
            let mut calls = Vec::new();
            let combined = combine_with(3, |index| {
                calls.push(index);
                match index {
                    0 => Ok(result(0, Operator::And, vec![vm("i-1")])),
                    1 => Ok(result(1, Operator::And, vec![vm("i-2")])),
                    _ => Err(AlertError::validation("condition 2 must not run")),
                }
            })
            .unwrap();

            assert_eq!(calls, vec![0, 1]);
            assert!(!combined.firing);
            assert_eq!(combined.evaluated, 2);
        }

        #[test]
        fn source_error_propagates_before_short_circuit() {
            let outcome = combine_with(2, |index| match index {
                0 => Ok(result(0, Operator::And, vec![vm("i-1")])),
                _ => Err(AlertError::validation("backend down")),
            });
            assert!(matches!(outcome, Err(AlertError::Validation { .. })));
        }

        #[test]
        fn matches_eager_fold() {
            let results = vec![
                result(0, Operator::And, vec![vm("i-1"), vm("i-2")]),
                result(1, Operator::Or, vec![vm("i-3")]),
                result(2, Operator::And, vec![vm("i-2")]),
            ];
            let lazy = combine_with(results.len(), |index| Ok(results[index].clone())).unwrap();
            assert_eq!(lazy, combine(results));
        }

        #[test]
        fn pushes_after_stop_are_ignored() {
            let mut combiner = Combiner::new();
            assert!(combiner.push(result(0, Operator::And, vec![vm("i-1")])));
            assert!(!combiner.push(result(1, Operator::And, vec![host("h-1")])));
            assert!(combiner.is_stopped());
            assert!(!combiner.push(result(2, Operator::Or, vec![vm("i-1")])));
            assert_eq!(combiner.finish().buckets.len(), 2);
        }
    }
}
