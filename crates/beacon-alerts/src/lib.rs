//! Alert correlation and problem reconciliation for Beacon.
//!
//! `beacon-alerts` evaluates time-series conditions, correlates their matches
//! across conditions by identity tags, maps correlated matches to external
//! resources, and keeps two persisted views in step with the latest results:
//!
//! - **Problem rows**: one row per rule type and resource, diffed against the
//!   previous cycle with create/update/delete semantics
//! - **Alert joints**: a many-to-many edge table between alerts and resources,
//!   with a derived, time-decayed status per resource
//!
//! # Pipeline
//!
//! ```text
//! ConditionEvaluator -> combine -> ResourceMapper -> ReconcilerDiff
//!                                \-> AlertRecord -> JointStateMachine
//! ```
//!
//! # Example
//!
//! ```rust
//! use beacon_alerts::{
//!     LookupRegistry, MemoryStore, ResourceDescriptor, ResourceKind, RuleConfig, RuleEngine,
//!     RuleKind, Stores,
//! };
//! use beacon_metrics::{MetricName, MetricPoint, MetricStore};
//! use std::sync::Arc;
//!
//! let metrics = MetricStore::default();
//! let cpu = MetricName::from_parts("vm_cpu", "usage_active").unwrap();
//! metrics.push(&cpu, MetricPoint::now(97.0).label("vm_id", "i-1"));
//!
//! let lookups = LookupRegistry::from_descriptors(vec![
//!     ResourceDescriptor::new(ResourceKind::Vm, "i-1", "web1"),
//! ]);
//! let store = MemoryStore::new();
//! let engine = RuleEngine::new(Arc::new(metrics), lookups, Stores::memory(&store));
//! for rule in RuleConfig::defaults() {
//!     engine.upsert_rule(rule).unwrap();
//! }
//!
//! let report = engine.run_cycle(RuleKind::ScaleUp).unwrap();
//! assert!(report.firing);
//! assert_eq!(engine.list_problems(RuleKind::ScaleUp).unwrap()[0].name, "web1");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod combinator;
pub mod condition;
pub mod drivers;
pub mod error;
pub mod joints;
pub mod manager;
pub mod mapper;
pub mod reconcile;
pub mod records;
pub mod rules;
pub mod status;
pub mod store;
pub mod types;

// Re-export main types at crate root
pub use combinator::{CombinedResult, Combiner, MatchBucket, combine, combine_with};
pub use condition::ConditionEvaluator;
pub use drivers::{DriverFactory, DriverRegistry, ResourceDriver, TagShapeFactory};
pub use error::{AlertError, Result};
pub use joints::{JointOutcome, JointStateMachine};
pub use manager::{AlertEvaluation, CycleReport, EngineConfig, RuleEngine, Stores};
pub use mapper::{LookupRegistry, ResourceDescriptor, ResourceLookup, ResourceMapper, StaticCatalog};
pub use reconcile::{ReconcilePlan, ReconcileReport, ReconcilerDiff};
pub use records::{
    AlertRecord, AlertResource, AlertState, Problem, ProblemRecord, ResourceAlertJoint,
    ResourceKey, ResourceKind, ResourceStatus,
};
pub use rules::{AlertDefinition, RuleConfig, RuleKind, RuleSettings, ScaleSettings, parse_duration};
pub use status::{ALERTING_DECAY_SECS, derive_status, derive_status_with};
pub use store::{MemoryStore, ProblemStore, RecordStore, ResourceStore};
pub use types::{
    ComparisonOperator, Condition, ConditionResult, EvalMatch, Evaluator, MetricQuery, Operator,
    Tags, normalize_tags,
};
