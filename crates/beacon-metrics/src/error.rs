//! Error types for the beacon-metrics crate.

use thiserror::Error;

/// Errors that can occur in the metrics layer.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// The metric name is invalid (empty or contains invalid characters).
    #[error("invalid metric name: {reason}")]
    InvalidMetricName {
        /// The reason the name is invalid.
        reason: String,
    },

    /// The time range is invalid (start > end).
    #[error("invalid time range: start={start}, end={end}")]
    InvalidTimeRange {
        /// Start timestamp.
        start: i64,
        /// End timestamp.
        end: i64,
    },

    /// A metric with the given name was not found.
    #[error("metric not found: {name}")]
    MetricNotFound {
        /// The metric name that was not found.
        name: String,
    },

    /// The backend could not answer a series query.
    #[error("query failed: {reason}")]
    QueryFailed {
        /// The reason the query failed.
        reason: String,
    },

    /// Sample data could not be decoded.
    #[error("invalid sample data: {reason}")]
    InvalidSample {
        /// The reason the sample is invalid.
        reason: String,
    },
}

impl From<serde_json::Error> for MetricsError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidSample {
            reason: err.to_string(),
        }
    }
}

/// Result type for metrics operations.
pub type Result<T> = std::result::Result<T, MetricsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_invalid_metric_name() {
        let err = MetricsError::InvalidMetricName {
            reason: "empty name".to_string(),
        };
        assert_eq!(err.to_string(), "invalid metric name: empty name");
    }

    #[test]
    fn error_display_invalid_time_range() {
        let err = MetricsError::InvalidTimeRange { start: 100, end: 50 };
        assert_eq!(err.to_string(), "invalid time range: start=100, end=50");
    }

    #[test]
    fn error_display_query_failed() {
        let err = MetricsError::QueryFailed {
            reason: "connection refused".to_string(),
        };
        assert_eq!(err.to_string(), "query failed: connection refused");
    }

    #[test]
    fn serde_error_becomes_invalid_sample() {
        let parse: std::result::Result<u32, _> = serde_json::from_str("not json");
        let err: MetricsError = parse.unwrap_err().into();
        assert!(matches!(err, MetricsError::InvalidSample { .. }));
    }
}
