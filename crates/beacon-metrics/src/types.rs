//! Core types for the metrics layer.
//!
//! - [`MetricPoint`]: A single measurement with timestamp, value, and labels
//! - [`MetricName`]: A validated metric name
//! - [`TimeRange`]: A time range for queries
//! - [`Aggregation`]: Reducers that collapse a series into one value

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{MetricsError, Result};

/// A single metric data point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    /// The measured value. `NaN` marks a null sample.
    pub value: f64,
    /// Dimensional labels (e.g., `vm_id`, `host_name`).
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl MetricPoint {
    /// Creates a new metric point with the given timestamp and value.
    #[must_use]
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self {
            timestamp,
            value,
            labels: HashMap::new(),
        }
    }

    /// Adds a label to this metric point and returns self for chaining.
    #[must_use]
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Returns the current timestamp in milliseconds.
    #[must_use]
    pub fn now_timestamp() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Creates a new metric point with the current timestamp.
    #[must_use]
    pub fn now(value: f64) -> Self {
        Self::new(Self::now_timestamp(), value)
    }
}

/// A validated metric name.
///
/// Metric names must be non-empty, at most 256 characters, start with a
/// letter or underscore, and contain only alphanumerics, underscores and colons.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MetricName(String);

impl MetricName {
    /// Maximum allowed length for a metric name.
    pub const MAX_LENGTH: usize = 256;

    /// Creates a new validated metric name.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError::InvalidMetricName` if the name is invalid.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();

        if name.is_empty() {
            return Err(MetricsError::InvalidMetricName {
                reason: "metric name cannot be empty".to_string(),
            });
        }

        if name.len() > Self::MAX_LENGTH {
            return Err(MetricsError::InvalidMetricName {
                reason: format!(
                    "metric name exceeds maximum length of {} characters",
                    Self::MAX_LENGTH
                ),
            });
        }

        if let Some(c) = name.chars().next() {
            if !c.is_ascii_alphabetic() && c != '_' {
                return Err(MetricsError::InvalidMetricName {
                    reason: "metric name must start with a letter or underscore".to_string(),
                });
            }
        }

        if let Some(c) = name
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && *c != '_' && *c != ':')
        {
            return Err(MetricsError::InvalidMetricName {
                reason: format!("invalid character '{c}' in metric name"),
            });
        }

        Ok(Self(name))
    }

    /// Builds the storage name for a `measurement` / `field` pair.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError::InvalidMetricName` if the joined name is invalid.
    pub fn from_parts(measurement: &str, field: &str) -> Result<Self> {
        Self::new(format!("{measurement}_{field}"))
    }

    /// Returns the metric name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for MetricName {
    type Error = MetricsError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<MetricName> for String {
    fn from(name: MetricName) -> Self {
        name.0
    }
}

impl std::fmt::Display for MetricName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for MetricName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A time range for metric queries.
///
/// Both start and end are inclusive Unix timestamps in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive), in milliseconds.
    pub start: i64,
    /// End timestamp (inclusive), in milliseconds.
    pub end: i64,
}

impl TimeRange {
    /// Creates a new time range.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError::InvalidTimeRange` if start > end.
    pub const fn new(start: i64, end: i64) -> Result<Self> {
        if start > end {
            return Err(MetricsError::InvalidTimeRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Creates a time range covering the `millis` preceding `end`.
    #[must_use]
    pub const fn ending_at(end: i64, millis: i64) -> Self {
        Self {
            start: end - millis,
            end,
        }
    }

    /// Creates a time range for the last N milliseconds from now.
    #[must_use]
    pub fn last_millis(millis: i64) -> Self {
        Self::ending_at(MetricPoint::now_timestamp(), millis)
    }

    /// Creates a time range for the last N minutes from now.
    #[must_use]
    pub fn last_minutes(minutes: i64) -> Self {
        Self::last_millis(minutes * 60 * 1000)
    }

    /// Creates a time range for the last N hours from now.
    #[must_use]
    pub fn last_hours(hours: i64) -> Self {
        Self::last_minutes(hours * 60)
    }

    /// Returns the duration of this time range in milliseconds.
    #[must_use]
    pub const fn duration_millis(&self) -> i64 {
        self.end - self.start
    }

    /// Checks if a timestamp falls within this range (inclusive).
    #[must_use]
    pub const fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }
}

/// Reducers that collapse a series into a single value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    /// Sum of all values.
    Sum,
    /// Average (mean) of all values.
    #[default]
    Avg,
    /// Minimum value.
    Min,
    /// Maximum value.
    Max,
    /// Last (most recent) value.
    Last,
    /// Count of data points, nulls included.
    Count,
    /// Median value.
    Median,
    /// Difference between the last and first value.
    Diff,
    /// Difference between the last and first value as a percentage of the first.
    PercentDiff,
    /// Count of non-null data points.
    CountNonNull,
}

impl Aggregation {
    /// Returns the reducer name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
            Self::Last => "last",
            Self::Count => "count",
            Self::Median => "median",
            Self::Diff => "diff",
            Self::PercentDiff => "percent_diff",
            Self::CountNonNull => "count_non_null",
        }
    }

    /// Applies this aggregation to a slice of values in timestamp order.
    ///
    /// `NaN` values are treated as nulls and skipped by every reducer except
    /// [`Aggregation::Count`]. Returns `None` when nothing is left to reduce.
    #[must_use]
    pub fn apply(&self, values: &[f64]) -> Option<f64> {
        if let Self::Count = self {
            return (!values.is_empty()).then_some(values.len() as f64);
        }

        let present: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
        if present.is_empty() {
            return None;
        }

        match self {
            Self::Sum => Some(present.iter().sum()),
            Self::Avg => Some(present.iter().sum::<f64>() / present.len() as f64),
            Self::Min => present.iter().copied().reduce(f64::min),
            Self::Max => present.iter().copied().reduce(f64::max),
            Self::Last => present.last().copied(),
            Self::Count => None,
            Self::CountNonNull => Some(present.len() as f64),
            Self::Median => {
                let mut sorted = present;
                sorted.sort_by(f64::total_cmp);
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    Some((sorted[mid - 1] + sorted[mid]) / 2.0)
                } else {
                    Some(sorted[mid])
                }
            }
            Self::Diff => {
                let first = present.first()?;
                let last = present.last()?;
                Some(last - first)
            }
            Self::PercentDiff => {
                let first = *present.first()?;
                let last = *present.last()?;
                if first.abs() < f64::EPSILON {
                    return None;
                }
                Some((last - first) / first.abs() * 100.0)
            }
        }
    }
}

impl std::fmt::Display for Aggregation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod metric_name_tests {
        use super::*;

        #[test]
        fn valid_metric_name() {
            let name = MetricName::new("vm_cpu_usage_active").unwrap();
            assert_eq!(name.as_str(), "vm_cpu_usage_active");
        }

        #[test]
        fn from_parts_joins_with_underscore() {
            let name = MetricName::from_parts("vm_mem", "used_percent").unwrap();
            assert_eq!(name.as_str(), "vm_mem_used_percent");
        }

        #[test]
        fn empty_metric_name_fails() {
            match MetricName::new("") {
                Err(MetricsError::InvalidMetricName { reason }) => {
                    assert!(reason.contains("empty"));
                }
                _ => panic!("expected InvalidMetricName error"),
            }
        }

        #[test]
        fn metric_name_starting_with_number_fails() {
            match MetricName::new("0_invalid") {
                Err(MetricsError::InvalidMetricName { reason }) => {
                    assert!(reason.contains("start with"));
                }
                _ => panic!("expected InvalidMetricName error"),
            }
        }

        #[test]
        fn metric_name_with_invalid_characters_fails() {
            assert!(MetricName::new("invalid-name").is_err());
            assert!(MetricName::new("invalid.name").is_err());
            assert!(MetricName::new("invalid name").is_err());
        }

        #[test]
        fn metric_name_too_long_fails() {
            let long_name = "a".repeat(MetricName::MAX_LENGTH + 1);
            assert!(MetricName::new(long_name).is_err());
        }

        #[test]
        fn deserializing_validates() {
            let parsed: serde_json::Result<MetricName> = serde_json::from_str("\"bad-name\"");
            assert!(parsed.is_err());

            let parsed: MetricName = serde_json::from_str("\"good_name\"").unwrap();
            assert_eq!(parsed.as_str(), "good_name");
        }
    }

    mod time_range_tests {
        use super::*;

        #[test]
        fn start_greater_than_end_fails() {
            match TimeRange::new(2000, 1000) {
                Err(MetricsError::InvalidTimeRange { start, end }) => {
                    assert_eq!(start, 2000);
                    assert_eq!(end, 1000);
                }
                _ => panic!("expected InvalidTimeRange error"),
            }
        }

        #[test]
        fn contains_is_inclusive() {
            let range = TimeRange::new(1000, 2000).unwrap();
            assert!(range.contains(1000));
            assert!(range.contains(2000));
            assert!(!range.contains(999));
            assert!(!range.contains(2001));
        }

        #[test]
        fn ending_at_spans_duration() {
            let range = TimeRange::ending_at(10_000, 4_000);
            assert_eq!(range.start, 6_000);
            assert_eq!(range.duration_millis(), 4_000);
        }

        #[test]
        fn last_hours_duration() {
            assert_eq!(TimeRange::last_hours(1).duration_millis(), 3_600_000);
        }
    }

    mod aggregation_tests {
        use super::*;
        use test_case::test_case;

        #[test_case(Aggregation::Sum, Some(15.0) ; "sum")]
        #[test_case(Aggregation::Avg, Some(3.0) ; "avg")]
        #[test_case(Aggregation::Min, Some(1.0) ; "min")]
        #[test_case(Aggregation::Max, Some(5.0) ; "max")]
        #[test_case(Aggregation::Last, Some(5.0) ; "last")]
        #[test_case(Aggregation::Count, Some(5.0) ; "count")]
        #[test_case(Aggregation::Median, Some(3.0) ; "median")]
        #[test_case(Aggregation::Diff, Some(3.0) ; "diff")]
        #[test_case(Aggregation::PercentDiff, Some(150.0) ; "percent diff")]
        #[test_case(Aggregation::CountNonNull, Some(5.0) ; "count non null")]
        fn reduces_sample(agg: Aggregation, expected: Option<f64>) {
            let values = [2.0, 1.0, 3.0, 4.0, 5.0];
            assert_eq!(agg.apply(&values), expected);
        }

        #[test]
        fn median_of_even_count_averages_middle_pair() {
            assert_eq!(Aggregation::Median.apply(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        }

        #[test]
        fn nulls_are_skipped_except_by_count() {
            let values = [f64::NAN, 2.0, f64::NAN, 4.0];
            assert_eq!(Aggregation::Avg.apply(&values), Some(3.0));
            assert_eq!(Aggregation::CountNonNull.apply(&values), Some(2.0));
            assert_eq!(Aggregation::Count.apply(&values), Some(4.0));
        }

        #[test]
        fn all_null_reduces_to_none() {
            let values = [f64::NAN, f64::NAN];
            assert_eq!(Aggregation::Max.apply(&values), None);
            assert_eq!(Aggregation::CountNonNull.apply(&values), None);
        }

        #[test]
        fn empty_slice_reduces_to_none() {
            for agg in [Aggregation::Sum, Aggregation::Count, Aggregation::Median] {
                assert_eq!(agg.apply(&[]), None);
            }
        }

        #[test]
        fn percent_diff_from_zero_is_none() {
            assert_eq!(Aggregation::PercentDiff.apply(&[0.0, 10.0]), None);
        }

        #[test]
        fn serializes_snake_case() {
            let json = serde_json::to_string(&Aggregation::PercentDiff).unwrap();
            assert_eq!(json, "\"percent_diff\"");
            assert_eq!(Aggregation::CountNonNull.to_string(), "count_non_null");
        }
    }
}
