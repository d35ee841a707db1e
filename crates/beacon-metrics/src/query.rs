//! Grouped series queries.
//!
//! A [`SeriesQuery`] selects the points of one metric inside a time range,
//! keeps those whose labels match every filter, and splits them into
//! [`Series`] by their group-by label values. Anything that can answer such a
//! query implements [`SeriesBackend`].

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{Aggregation, MetricName, MetricPoint, TimeRange};

/// Converts a Duration to milliseconds as i64.
#[allow(clippy::cast_possible_truncation)]
const fn duration_to_millis(duration: Duration) -> i64 {
    duration.as_millis() as i64
}

/// One grouped series returned by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    /// The metric this series belongs to.
    pub name: MetricName,
    /// The label values shared by every point of the series.
    pub tags: BTreeMap<String, String>,
    /// Points in timestamp order.
    pub points: Vec<MetricPoint>,
}

impl Series {
    /// Creates an empty series.
    #[must_use]
    pub const fn new(name: MetricName, tags: BTreeMap<String, String>) -> Self {
        Self {
            name,
            tags,
            points: Vec::new(),
        }
    }

    /// Returns the point values in timestamp order.
    #[must_use]
    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.value).collect()
    }

    /// Reduces the series to a single value.
    #[must_use]
    pub fn reduce(&self, aggregation: Aggregation) -> Option<f64> {
        aggregation.apply(&self.values())
    }
}

/// A grouped series query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesQuery {
    /// The metric to read.
    pub metric: MetricName,
    /// The time window to read.
    pub range: TimeRange,
    /// Label equality filters; every one must match.
    pub filters: BTreeMap<String, String>,
    /// Label keys to group by. Empty groups by the full label set.
    pub group_by: Vec<String>,
}

impl SeriesQuery {
    /// Creates a query for the last hour of `metric`.
    #[must_use]
    pub fn new(metric: MetricName) -> Self {
        Self {
            metric,
            range: TimeRange::last_hours(1),
            filters: BTreeMap::new(),
            group_by: Vec::new(),
        }
    }

    /// Sets the time range for the query.
    #[must_use]
    pub const fn range(mut self, range: TimeRange) -> Self {
        self.range = range;
        self
    }

    /// Sets the query to look back `duration` from `end`.
    #[must_use]
    pub const fn lookback(mut self, end: i64, duration: Duration) -> Self {
        self.range = TimeRange::ending_at(end, duration_to_millis(duration));
        self
    }

    /// Adds a label filter.
    #[must_use]
    pub fn filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(key.into(), value.into());
        self
    }

    /// Adds a group-by label key.
    #[must_use]
    pub fn group_by(mut self, key: impl Into<String>) -> Self {
        self.group_by.push(key.into());
        self
    }

    /// Returns true if the point falls inside the range and passes every filter.
    #[must_use]
    pub fn selects(&self, point: &MetricPoint) -> bool {
        self.range.contains(point.timestamp)
            && self
                .filters
                .iter()
                .all(|(k, v)| point.labels.get(k).is_some_and(|pv| pv == v))
    }

    /// Returns the grouping key of a point.
    #[must_use]
    pub fn group_key(&self, point: &MetricPoint) -> BTreeMap<String, String> {
        if self.group_by.is_empty() {
            return point
                .labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
        }
        self.group_by
            .iter()
            .filter_map(|k| point.labels.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }
}

/// A time-series backend that can answer grouped series queries.
///
/// An unknown metric is not an error: it yields no series.
pub trait SeriesBackend: Send + Sync {
    /// Executes the query.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached or rejects the query.
    fn select(&self, query: &SeriesQuery) -> Result<Vec<Series>>;
}
