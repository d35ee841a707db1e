//! Embedded time-series store and series reducers for the beacon alert engine.
//!
//! `beacon-metrics` provides the time-series side of alert evaluation:
//!
//! - **Grouped series queries**: select one metric over a window, filter by
//!   labels, and split the result into series by label values
//! - **Reducers**: collapse a series to a single value (`avg`, `median`,
//!   `percent_diff`, ...)
//! - **Pluggable backends**: anything implementing [`SeriesBackend`] can feed
//!   the evaluator; [`MetricStore`] is the embedded implementation
//!
//! # Example
//!
//! ```rust
//! use beacon_metrics::{Aggregation, MetricName, MetricPoint, MetricStore, SeriesBackend, SeriesQuery};
//! use std::time::Duration;
//!
//! let store = MetricStore::new(Duration::from_secs(3600));
//! let name = MetricName::from_parts("vm_cpu", "usage_active").unwrap();
//!
//! store.push(&name, MetricPoint::now(91.0).label("vm_id", "i-1"));
//!
//! let series = store.select(&SeriesQuery::new(name).group_by("vm_id")).unwrap();
//! assert_eq!(series[0].reduce(Aggregation::Avg), Some(91.0));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod error;
pub mod query;
pub mod storage;
pub mod types;

// Re-export main types at crate root
pub use error::{MetricsError, Result};
pub use query::{Series, SeriesBackend, SeriesQuery};
pub use storage::MetricStore;
pub use types::{Aggregation, MetricName, MetricPoint, TimeRange};
