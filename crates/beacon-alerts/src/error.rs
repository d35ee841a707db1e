//! Error types for the beacon-alerts crate.

use thiserror::Error;

/// Errors that can occur in the correlation engine.
#[derive(Debug, Error)]
pub enum AlertError {
    /// Nothing matched where exactly one thing was expected: no driver for a
    /// tag shape, no lookup for a resource kind, no rule for a type.
    #[error("not found: {what}")]
    NotFound {
        /// Description of what was missing.
        what: String,
    },

    /// More than one thing matched where at most one was allowed.
    #[error("duplicate match: {what}")]
    DuplicateMatch {
        /// Description of the ambiguity.
        what: String,
    },

    /// Malformed rule or alert configuration.
    #[error("validation failed: {reason}")]
    Validation {
        /// The reason validation failed.
        reason: String,
    },

    /// The time-series backend failed.
    #[error("query error: {0}")]
    Query(#[from] beacon_metrics::MetricsError),

    /// An external resource lookup failed.
    #[error("lookup of {kind} '{id}' failed: {reason}")]
    Lookup {
        /// Resource kind that was looked up.
        kind: String,
        /// Identity value that was looked up.
        id: String,
        /// The reason the lookup failed.
        reason: String,
    },

    /// A persistence operation failed.
    #[error("store error: {reason}")]
    Store {
        /// The reason the operation failed.
        reason: String,
    },

    /// A cycle for the same rule is already running.
    #[error("cycle already in progress for rule {rule}")]
    CycleInProgress {
        /// The busy rule.
        rule: String,
    },

    /// Several independent failures collected while processing a batch.
    #[error("{} error(s): {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<AlertError>),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

fn join_errors(errors: &[AlertError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl AlertError {
    /// Shorthand for [`AlertError::NotFound`].
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Shorthand for [`AlertError::Validation`].
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for AlertError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, AlertError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_not_found() {
        let err = AlertError::not_found("driver for tags {zone=z1}");
        assert_eq!(err.to_string(), "not found: driver for tags {zone=z1}");
    }

    #[test]
    fn error_display_duplicate_match() {
        let err = AlertError::DuplicateMatch {
            what: "vm/web1".to_string(),
        };
        assert_eq!(err.to_string(), "duplicate match: vm/web1");
    }

    #[test]
    fn error_display_validation() {
        let err = AlertError::validation("period must be positive");
        assert_eq!(err.to_string(), "validation failed: period must be positive");
    }

    #[test]
    fn error_display_lookup() {
        let err = AlertError::Lookup {
            kind: "vm".to_string(),
            id: "i-1".to_string(),
            reason: "unknown id".to_string(),
        };
        assert_eq!(err.to_string(), "lookup of vm 'i-1' failed: unknown id");
    }

    #[test]
    fn error_display_cycle_in_progress() {
        let err = AlertError::CycleInProgress {
            rule: "scale_down".to_string(),
        };
        assert_eq!(err.to_string(), "cycle already in progress for rule scale_down");
    }

    #[test]
    fn error_display_aggregate() {
        let err = AlertError::Aggregate(vec![
            AlertError::not_found("a"),
            AlertError::validation("b"),
        ]);
        assert_eq!(
            err.to_string(),
            "2 error(s): not found: a; validation failed: b"
        );
    }

    #[test]
    fn metrics_error_converts() {
        let err: AlertError = beacon_metrics::MetricsError::QueryFailed {
            reason: "timeout".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "query error: query failed: timeout");
    }

    #[test]
    fn serde_error_converts() {
        let parse: std::result::Result<u32, _> = serde_json::from_str("nope");
        let err: AlertError = parse.unwrap_err().into();
        assert!(matches!(err, AlertError::Serialization(_)));
    }
}
