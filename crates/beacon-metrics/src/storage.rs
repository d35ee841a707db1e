//! In-memory metric storage with retention policies.
//!
//! [`MetricStore`] keeps points per metric in timestamp order, expires data
//! older than the retention window, and answers grouped [`SeriesQuery`]s.

use std::collections::{BTreeMap, HashMap};
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::debug;

use crate::error::{MetricsError, Result};
use crate::query::{Series, SeriesBackend, SeriesQuery};
use crate::types::{MetricName, MetricPoint, TimeRange};

/// One line of a newline-delimited JSON sample feed.
#[derive(Debug, Deserialize)]
struct Sample {
    metric: MetricName,
    #[serde(flatten)]
    point: MetricPoint,
}

/// Thread-safe in-memory storage for metrics.
#[derive(Debug)]
pub struct MetricStore {
    /// The retention duration for metrics (in milliseconds).
    retention_millis: i64,
    /// The actual data storage, keyed by metric name.
    data: Arc<RwLock<HashMap<MetricName, Vec<MetricPoint>>>>,
}

impl MetricStore {
    /// Creates a new metric store with the given retention duration.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(retention: Duration) -> Self {
        Self {
            retention_millis: retention.as_millis() as i64,
            data: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns the retention duration in milliseconds.
    #[must_use]
    pub const fn retention_millis(&self) -> i64 {
        self.retention_millis
    }

    /// Pushes a new metric point to the store.
    ///
    /// The point is inserted in timestamp order and expired data is dropped.
    pub fn push(&self, name: &MetricName, point: MetricPoint) {
        let cutoff = MetricPoint::now_timestamp() - self.retention_millis;

        let mut data = self.data.write();
        let points = data.entry(name.clone()).or_default();
        insert_point(points, point, cutoff);

        debug!(
            metric = %name,
            points_count = points.len(),
            "pushed metric point"
        );
    }

    /// Pushes multiple metric points under a single lock.
    pub fn push_batch(&self, metrics: Vec<(MetricName, MetricPoint)>) {
        let cutoff = MetricPoint::now_timestamp() - self.retention_millis;

        let mut data = self.data.write();
        for (name, point) in metrics {
            insert_point(data.entry(name).or_default(), point, cutoff);
        }
    }

    /// Loads newline-delimited JSON samples of the form
    /// `{"metric": "...", "timestamp": ms, "value": v, "labels": {...}}`.
    ///
    /// Blank lines are ignored. Returns the number of samples loaded.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError::InvalidSample` for an unreadable or malformed line.
    pub fn load_samples(&self, reader: impl BufRead) -> Result<usize> {
        let mut batch = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| MetricsError::InvalidSample {
                reason: format!("line {}: {e}", index + 1),
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let sample: Sample =
                serde_json::from_str(&line).map_err(|e| MetricsError::InvalidSample {
                    reason: format!("line {}: {e}", index + 1),
                })?;
            batch.push((sample.metric, sample.point));
        }

        let loaded = batch.len();
        self.push_batch(batch);
        debug!(samples = loaded, "loaded metric samples");
        Ok(loaded)
    }

    /// Returns every point of `name` inside the time range.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError::MetricNotFound` if the metric doesn't exist.
    pub fn query(&self, name: &MetricName, range: TimeRange) -> Result<Vec<MetricPoint>> {
        let data = self.data.read();
        let points = data.get(name).ok_or_else(|| MetricsError::MetricNotFound {
            name: name.to_string(),
        })?;

        Ok(points
            .iter()
            .filter(|p| range.contains(p.timestamp))
            .cloned()
            .collect())
    }

    /// Returns the number of data points for a given metric.
    #[must_use]
    pub fn metric_count(&self, name: &MetricName) -> usize {
        let data = self.data.read();
        data.get(name).map_or(0, Vec::len)
    }

    /// Clears all metrics from the store.
    pub fn clear(&self) {
        self.data.write().clear();
    }

    /// Expires old data across all metrics and drops empty series.
    pub fn expire_old_data(&self) {
        let cutoff = MetricPoint::now_timestamp() - self.retention_millis;

        let mut data = self.data.write();
        for points in data.values_mut() {
            points.retain(|p| p.timestamp >= cutoff);
        }
        data.retain(|_, v| !v.is_empty());
    }
}

fn insert_point(points: &mut Vec<MetricPoint>, point: MetricPoint, cutoff: i64) {
    points.retain(|p| p.timestamp >= cutoff);
    let insert_pos = points
        .binary_search_by_key(&point.timestamp, |p| p.timestamp)
        .unwrap_or_else(|pos| pos);
    points.insert(insert_pos, point);
}

impl SeriesBackend for MetricStore {
    fn select(&self, query: &SeriesQuery) -> Result<Vec<Series>> {
        let data = self.data.read();
        let Some(points) = data.get(&query.metric) else {
            return Ok(Vec::new());
        };

        let mut groups: BTreeMap<BTreeMap<String, String>, Series> = BTreeMap::new();
        for point in points.iter().filter(|p| query.selects(p)) {
            let key = query.group_key(point);
            groups
                .entry(key.clone())
                .or_insert_with(|| Series::new(query.metric.clone(), key))
                .points
                .push(point.clone());
        }

        debug!(
            metric = %query.metric,
            series = groups.len(),
            "selected series"
        );

        Ok(groups.into_values().collect())
    }
}

impl Clone for MetricStore {
    fn clone(&self) -> Self {
        Self {
            retention_millis: self.retention_millis,
            data: Arc::clone(&self.data),
        }
    }
}

impl Default for MetricStore {
    fn default() -> Self {
        // One day covers the default rule lookback.
        Self::new(Duration::from_secs(24 * 3600))
    }
}
