//! Evaluation types.
//!
//! - [`EvalMatch`]: one series that a condition reported on
//! - [`ComparisonOperator`] and [`Evaluator`]: how a reduced value is judged
//! - [`Condition`]: query + reducer + evaluator + boolean operator
//! - [`ConditionResult`]: the outcome of evaluating one condition

use std::collections::BTreeMap;

use beacon_metrics::{Aggregation, MetricName};
use serde::{Deserialize, Serialize};

use crate::error::{AlertError, Result};

/// Label set attached to a match.
pub type Tags = BTreeMap<String, String>;

/// Metric name used for the synthetic match produced when a query returns no series.
pub const NO_DATA_METRIC: &str = "NoData";

/// Tag keys ending in this suffix identify an external entity.
pub const IDENTITY_SUFFIX: &str = "_id";

/// A single series that a condition reported on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalMatch {
    /// `measurement.field`, or [`NO_DATA_METRIC`].
    pub metric: String,
    /// Normalised series tags.
    #[serde(default)]
    pub tags: Tags,
    /// The reduced value. Absent only on the no-data match.
    pub value: Option<f64>,
}

impl EvalMatch {
    /// Creates a match with a reduced value and no tags.
    #[must_use]
    pub fn new(metric: impl Into<String>, value: f64) -> Self {
        Self {
            metric: metric.into(),
            tags: Tags::new(),
            value: Some(value),
        }
    }

    /// Creates the synthetic match reported when a query returned nothing.
    #[must_use]
    pub fn no_data() -> Self {
        Self {
            metric: NO_DATA_METRIC.to_string(),
            tags: Tags::new(),
            value: None,
        }
    }

    /// Adds a tag and returns self for chaining.
    #[must_use]
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Returns true for the synthetic no-data match.
    #[must_use]
    pub fn is_no_data(&self) -> bool {
        self.value.is_none() && self.metric == NO_DATA_METRIC
    }

    /// Iterates over the identity tags (keys ending in `_id`).
    pub fn identity_tags(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tags
            .iter()
            .filter(|(k, _)| k.ends_with(IDENTITY_SUFFIX))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns true if both matches denote the same external entity.
    ///
    /// At least one identity tag must be present on both sides, and every
    /// identity tag present on both sides must carry the same value.
    #[must_use]
    pub fn same_entity(&self, other: &Self) -> bool {
        let mut shared = 0;
        for (key, value) in self.identity_tags() {
            if let Some(theirs) = other.tags.get(key) {
                if theirs != value {
                    return false;
                }
                shared += 1;
            }
        }
        shared > 0
    }
}

/// Normalises raw series tags into match tags.
///
/// Empty values are dropped. `ip` is taken from the first key with an `ip`
/// segment other than `host_ip`, falling back to `host_ip`. `name` falls back
/// to `host`, and `brand` to `platform` or `hypervisor`.
#[must_use]
pub fn normalize_tags(raw: &Tags) -> Tags {
    let mut tags: Tags = raw
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    if !tags.contains_key("ip") {
        let derived = tags
            .iter()
            .find(|(k, _)| k.as_str() != "host_ip" && k.split('_').any(|seg| seg == "ip"))
            .or_else(|| tags.get_key_value("host_ip"))
            .map(|(_, v)| v.clone());
        if let Some(ip) = derived {
            tags.insert("ip".to_string(), ip);
        }
    }

    if !tags.contains_key("name") {
        if let Some(host) = tags.get("host").cloned() {
            tags.insert("name".to_string(), host);
        }
    }

    if !tags.contains_key("brand") {
        if let Some(brand) = ["platform", "hypervisor"]
            .iter()
            .find_map(|k| tags.get(*k).cloned())
        {
            tags.insert("brand".to_string(), brand);
        }
    }

    tags
}

/// How a condition relates to the conditions before it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    /// Both this and the preceding conditions must fire.
    #[default]
    And,
    /// Either this or the preceding conditions must fire.
    Or,
}

impl Operator {
    /// Returns the operator as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::And => "and",
            Self::Or => "or",
        }
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Comparison operators for threshold evaluators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOperator {
    /// Greater than (>).
    #[serde(rename = ">")]
    GreaterThan,
    /// Greater than or equal (>=).
    #[serde(rename = ">=")]
    GreaterThanOrEqual,
    /// Less than (<).
    #[serde(rename = "<")]
    LessThan,
    /// Less than or equal (<=).
    #[serde(rename = "<=")]
    LessThanOrEqual,
    /// Equal (==).
    #[serde(rename = "==")]
    Equal,
    /// Not equal (!=).
    #[serde(rename = "!=")]
    NotEqual,
}

impl ComparisonOperator {
    /// Evaluates the comparison between two values.
    #[must_use]
    pub fn evaluate(&self, left: f64, right: f64) -> bool {
        match self {
            Self::GreaterThan => left > right,
            Self::GreaterThanOrEqual => left >= right,
            Self::LessThan => left < right,
            Self::LessThanOrEqual => left <= right,
            Self::Equal => (left - right).abs() < f64::EPSILON,
            Self::NotEqual => (left - right).abs() >= f64::EPSILON,
        }
    }

    /// Returns the operator as a string symbol.
    #[must_use]
    pub const fn as_symbol(&self) -> &'static str {
        match self {
            Self::GreaterThan => ">",
            Self::GreaterThanOrEqual => ">=",
            Self::LessThan => "<",
            Self::LessThanOrEqual => "<=",
            Self::Equal => "==",
            Self::NotEqual => "!=",
        }
    }
}

impl std::fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_symbol())
    }
}

/// Judges a reduced value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Evaluator {
    /// Fires when `value <op> threshold`.
    Threshold {
        /// Comparison to apply.
        op: ComparisonOperator,
        /// Right-hand side of the comparison.
        threshold: f64,
    },
    /// Fires when `lower < value < upper`.
    WithinRange {
        /// Exclusive lower bound.
        lower: f64,
        /// Exclusive upper bound.
        upper: f64,
    },
    /// Fires when `value < lower` or `value > upper`.
    OutsideRange {
        /// Lower bound.
        lower: f64,
        /// Upper bound.
        upper: f64,
    },
    /// Fires when the series reduced to nothing.
    NoValue,
}

impl Evaluator {
    /// Shorthand for a threshold evaluator.
    #[must_use]
    pub const fn threshold(op: ComparisonOperator, threshold: f64) -> Self {
        Self::Threshold { op, threshold }
    }

    /// Returns true if the reduced value fires.
    #[must_use]
    pub fn eval(&self, value: Option<f64>) -> bool {
        match (self, value) {
            (Self::NoValue, value) => value.is_none(),
            (_, None) => false,
            (Self::Threshold { op, threshold }, Some(v)) => op.evaluate(v, *threshold),
            (Self::WithinRange { lower, upper }, Some(v)) => *lower < v && v < *upper,
            (Self::OutsideRange { lower, upper }, Some(v)) => v < *lower || v > *upper,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::WithinRange { lower, upper } | Self::OutsideRange { lower, upper }
                if lower >= upper =>
            {
                Err(AlertError::validation(format!(
                    "range lower bound {lower} must be below upper bound {upper}"
                )))
            }
            _ => Ok(()),
        }
    }
}

/// What a condition reads from the time-series backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricQuery {
    /// Measurement, e.g. `vm_cpu`.
    pub measurement: String,
    /// Field within the measurement, e.g. `usage_active`.
    pub field: String,
    /// Label equality filters.
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
    /// Label keys to group by. Empty groups by every label.
    #[serde(default)]
    pub group_by: Vec<String>,
}

impl MetricQuery {
    /// Returns the `measurement.field` label used on matches.
    #[must_use]
    pub fn metric_label(&self) -> String {
        format!("{}.{}", self.measurement, self.field)
    }

    /// Returns the backend metric name.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Validation` if the pair does not form a valid name.
    pub fn metric_name(&self) -> Result<MetricName> {
        MetricName::from_parts(&self.measurement, &self.field)
            .map_err(|e| AlertError::validation(format!("{}: {e}", self.metric_label())))
    }
}

/// One step of a rule: query, reduce, evaluate, combine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// The series to read.
    pub query: MetricQuery,
    /// How each series is reduced.
    #[serde(default)]
    pub reducer: Aggregation,
    /// How the reduced value is judged.
    pub evaluator: Evaluator,
    /// Relation to the preceding condition. Ignored on the first condition.
    #[serde(default)]
    pub operator: Operator,
}

impl Condition {
    /// Creates an `and` condition averaging `measurement.field`.
    #[must_use]
    pub fn new(measurement: impl Into<String>, field: impl Into<String>, evaluator: Evaluator) -> Self {
        Self {
            query: MetricQuery {
                measurement: measurement.into(),
                field: field.into(),
                filters: BTreeMap::new(),
                group_by: Vec::new(),
            },
            reducer: Aggregation::default(),
            evaluator,
            operator: Operator::default(),
        }
    }

    /// Sets the reducer.
    #[must_use]
    pub const fn reducer(mut self, reducer: Aggregation) -> Self {
        self.reducer = reducer;
        self
    }

    /// Sets the operator.
    #[must_use]
    pub const fn operator(mut self, operator: Operator) -> Self {
        self.operator = operator;
        self
    }

    /// Adds a label filter.
    #[must_use]
    pub fn filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.filters.insert(key.into(), value.into());
        self
    }

    /// Adds a group-by key.
    #[must_use]
    pub fn group_by(mut self, key: impl Into<String>) -> Self {
        self.query.group_by.push(key.into());
        self
    }

    /// Returns the bucket key of this condition at position `index`.
    #[must_use]
    pub fn bucket_key(&self, index: usize) -> String {
        format!("{}--{index}", self.query.field)
    }

    /// Validates the condition.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Validation` if the query or evaluator is malformed.
    pub fn validate(&self) -> Result<()> {
        if self.query.measurement.is_empty() || self.query.field.is_empty() {
            return Err(AlertError::validation(
                "condition measurement and field cannot be empty",
            ));
        }
        self.query.metric_name()?;
        self.evaluator.validate()
    }
}

/// Validates an ordered condition list.
///
/// # Errors
///
/// Returns `AlertError::Validation` if the list is empty or any condition is malformed.
pub fn validate_conditions(conditions: &[Condition]) -> Result<()> {
    if conditions.is_empty() {
        return Err(AlertError::validation("at least one condition is required"));
    }
    conditions.iter().try_for_each(Condition::validate)
}

/// The outcome of evaluating one condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionResult {
    /// Position of the condition in its rule.
    pub index: usize,
    /// Bucket key, `field--index`.
    pub bucket: String,
    /// True if at least one series fired.
    pub firing: bool,
    /// True if every series reduced to nothing, or there were none.
    pub no_data_found: bool,
    /// Relation to the preceding condition.
    pub operator: Operator,
    /// Series that fired.
    pub matches: Vec<EvalMatch>,
    /// Series that reduced to a value but did not fire.
    pub ok_matches: Vec<EvalMatch>,
}

#[cfg(test)]
mod tests {
    use super::*;

    mod eval_match_tests {
        use super::*;

        #[test]
        fn identity_tags_end_in_id() {
            let m = EvalMatch::new("vm_cpu.usage_active", 1.0)
                .tag("vm_id", "i-1")
                .tag("host_id", "h-1")
                .tag("vm_name", "web1");
            let ids: Vec<_> = m.identity_tags().collect();
            assert_eq!(ids, vec![("host_id", "h-1"), ("vm_id", "i-1")]);
        }

        #[test]
        fn same_entity_when_shared_ids_agree() {
            let a = EvalMatch::new("a", 1.0).tag("vm_id", "i-1").tag("host_id", "h-1");
            let b = EvalMatch::new("b", 2.0).tag("vm_id", "i-1");
            assert!(a.same_entity(&b));
            assert!(b.same_entity(&a));
        }

        #[test]
        fn different_entity_when_any_shared_id_differs() {
            let a = EvalMatch::new("a", 1.0).tag("vm_id", "i-1").tag("host_id", "h-1");
            let b = EvalMatch::new("b", 2.0).tag("vm_id", "i-1").tag("host_id", "h-2");
            assert!(!a.same_entity(&b));
        }

        #[test]
        fn different_entity_without_shared_ids() {
            let a = EvalMatch::new("a", 1.0).tag("vm_id", "i-1");
            let b = EvalMatch::new("b", 2.0).tag("host_id", "h-1");
            assert!(!a.same_entity(&b));
        }

        #[test]
        fn no_data_match_shape() {
            let m = EvalMatch::no_data();
            assert!(m.is_no_data());
            assert_eq!(m.metric, NO_DATA_METRIC);
            assert!(!EvalMatch::new(NO_DATA_METRIC, 0.0).is_no_data());
        }
    }

    mod normalize_tests {
        use super::*;

        fn raw(pairs: &[(&str, &str)]) -> Tags {
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect()
        }

        #[test]
        fn drops_empty_values() {
            let tags = normalize_tags(&raw(&[("vm_id", "i-1"), ("zone", "")]));
            assert!(!tags.contains_key("zone"));
        }

        #[test]
        fn derives_ip_from_ip_segment() {
            let tags = normalize_tags(&raw(&[("vm_ip", "10.0.0.5"), ("host_ip", "10.0.0.1")]));
            assert_eq!(tags.get("ip").map(String::as_str), Some("10.0.0.5"));
        }

        #[test]
        fn falls_back_to_host_ip() {
            let tags = normalize_tags(&raw(&[("host_ip", "10.0.0.1"), ("description", "x")]));
            assert_eq!(tags.get("ip").map(String::as_str), Some("10.0.0.1"));
        }

        #[test]
        fn name_falls_back_to_host() {
            let tags = normalize_tags(&raw(&[("host", "node-7")]));
            assert_eq!(tags.get("name").map(String::as_str), Some("node-7"));

            let tags = normalize_tags(&raw(&[("host", "node-7"), ("name", "web1")]));
            assert_eq!(tags.get("name").map(String::as_str), Some("web1"));
        }

        #[test]
        fn brand_falls_back_to_platform() {
            let tags = normalize_tags(&raw(&[("platform", "kvm")]));
            assert_eq!(tags.get("brand").map(String::as_str), Some("kvm"));
        }
    }

    mod evaluator_tests {
        use super::*;
        use test_case::test_case;

        #[test_case(ComparisonOperator::GreaterThan, 90.0, true ; "gt fires")]
        #[test_case(ComparisonOperator::GreaterThan, 80.0, false ; "gt equal does not fire")]
        #[test_case(ComparisonOperator::GreaterThanOrEqual, 80.0, true ; "gte equal fires")]
        #[test_case(ComparisonOperator::LessThan, 10.0, true ; "lt fires")]
        #[test_case(ComparisonOperator::LessThanOrEqual, 80.0, true ; "lte equal fires")]
        #[test_case(ComparisonOperator::Equal, 80.0, true ; "eq fires")]
        #[test_case(ComparisonOperator::NotEqual, 80.0, false ; "ne equal does not fire")]
        fn threshold(op: ComparisonOperator, value: f64, fires: bool) {
            assert_eq!(Evaluator::threshold(op, 80.0).eval(Some(value)), fires);
        }

        #[test]
        fn threshold_never_fires_without_value() {
            let eval = Evaluator::threshold(ComparisonOperator::LessThan, 10.0);
            assert!(!eval.eval(None));
        }

        #[test_case(5.0, true ; "inside")]
        #[test_case(1.0, false ; "on lower bound")]
        #[test_case(12.0, false ; "above")]
        fn within_range(value: f64, fires: bool) {
            let eval = Evaluator::WithinRange { lower: 1.0, upper: 10.0 };
            assert_eq!(eval.eval(Some(value)), fires);
        }

        #[test_case(0.5, true ; "below")]
        #[test_case(5.0, false ; "inside")]
        #[test_case(10.5, true ; "above")]
        fn outside_range(value: f64, fires: bool) {
            let eval = Evaluator::OutsideRange { lower: 1.0, upper: 10.0 };
            assert_eq!(eval.eval(Some(value)), fires);
        }

        #[test]
        fn no_value_fires_only_without_value() {
            assert!(Evaluator::NoValue.eval(None));
            assert!(!Evaluator::NoValue.eval(Some(0.0)));
        }

        #[test]
        fn evaluator_deserializes_tagged() {
            let eval: Evaluator =
                serde_json::from_str(r#"{"type":"threshold","op":"<","threshold":10.0}"#).unwrap();
            assert_eq!(eval, Evaluator::threshold(ComparisonOperator::LessThan, 10.0));
        }
    }

    mod condition_tests {
        use super::*;

        #[test]
        fn bucket_key_is_field_and_index() {
            let cond = Condition::new(
                "vm_cpu",
                "usage_active",
                Evaluator::threshold(ComparisonOperator::GreaterThan, 80.0),
            );
            assert_eq!(cond.bucket_key(2), "usage_active--2");
            assert_eq!(cond.query.metric_label(), "vm_cpu.usage_active");
        }

        #[test]
        fn defaults_apply_when_deserializing() {
            let cond: Condition = serde_json::from_str(
                r#"{"query":{"measurement":"vm_mem","field":"used_percent"},
                    "evaluator":{"type":"threshold","op":">","threshold":90.0}}"#,
            )
            .unwrap();
            assert_eq!(cond.operator, Operator::And);
            assert_eq!(cond.reducer, Aggregation::Avg);
        }

        #[test]
        fn empty_field_is_invalid() {
            let cond = Condition::new("vm_cpu", "", Evaluator::NoValue);
            match cond.validate() {
                Err(AlertError::Validation { reason }) => assert!(reason.contains("empty")),
                _ => panic!("expected Validation error"),
            }
        }

        #[test]
        fn inverted_range_is_invalid() {
            let cond = Condition::new(
                "vm_cpu",
                "usage_active",
                Evaluator::WithinRange { lower: 10.0, upper: 1.0 },
            );
            assert!(cond.validate().is_err());
        }

        #[test]
        fn empty_condition_list_is_invalid() {
            assert!(validate_conditions(&[]).is_err());
        }
    }
}
