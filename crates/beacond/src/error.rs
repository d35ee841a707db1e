//! Error types for beacond.

use thiserror::Error;

/// Errors that can occur while wiring or running the daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A data file could not be loaded.
    #[error("failed to load '{path}': {reason}")]
    Load {
        /// The offending file.
        path: String,
        /// What went wrong.
        reason: String,
    },

    /// Engine error.
    #[error("engine error: {0}")]
    Engine(#[from] beacon_alerts::AlertError),

    /// Metrics error.
    #[error("metrics error: {0}")]
    Metrics(#[from] beacon_metrics::MetricsError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for daemon operations.
pub type Result<T> = std::result::Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = DaemonError::Config("sweep_interval_secs must be positive".to_string());
        assert_eq!(
            err.to_string(),
            "configuration error: sweep_interval_secs must be positive"
        );
    }

    #[test]
    fn engine_error_converts() {
        let err: DaemonError = beacon_alerts::AlertError::not_found("rule scale_up").into();
        assert!(matches!(err, DaemonError::Engine(_)));
        assert_eq!(err.to_string(), "engine error: not found: rule scale_up");
    }
}
