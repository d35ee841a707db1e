//! beacond - Beacon alert correlation daemon
//!
//! Wires the engine from a [`DaemonConfig`](config::DaemonConfig): the
//! embedded metric store, the resource inventory, the repository snapshot,
//! and the configured rules and alerts. The binary then either schedules the
//! engine or runs it once.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod fixtures;
pub mod scheduler;

use std::sync::Arc;

use beacon_alerts::{DriverRegistry, LookupRegistry, MemoryStore, RuleEngine, Stores};
use beacon_metrics::MetricStore;
use tracing::info;

use crate::config::DaemonConfig;
use crate::error::Result;

/// A wired daemon.
#[derive(Debug)]
pub struct Daemon {
    /// The engine shared by every scheduled task.
    pub engine: Arc<RuleEngine>,
    /// The embedded metric store backing the engine.
    pub metrics: MetricStore,
    /// The repository backing every store.
    pub store: MemoryStore,
}

impl Daemon {
    /// Builds the engine and loads every configured data file.
    ///
    /// # Errors
    ///
    /// Returns an error if a data file cannot be loaded or a rule or alert is
    /// rejected by the engine.
    pub fn build(config: &DaemonConfig) -> Result<Self> {
        let metrics = MetricStore::new(config.data.retention());
        if let Some(path) = &config.data.samples {
            fixtures::load_samples(&metrics, path)?;
        }

        let lookups = match &config.data.inventory {
            Some(path) => fixtures::load_inventory(path)?,
            None => LookupRegistry::new(),
        };

        let store = match &config.data.snapshot {
            Some(path) => MemoryStore::with_snapshot(path)?,
            None => MemoryStore::new(),
        };

        let engine = RuleEngine::with_config(
            config.engine.engine_config(),
            Arc::new(metrics.clone()),
            Arc::new(DriverRegistry::with_defaults()),
            Arc::new(lookups),
            Stores::memory(&store),
        );
        for rule in &config.rules {
            engine.upsert_rule(rule.clone())?;
        }
        for alert in &config.alerts {
            engine.add_alert(alert.clone())?;
        }

        info!(
            rules = config.rules.len(),
            alerts = config.alerts.len(),
            "engine ready"
        );

        Ok(Self {
            engine: Arc::new(engine),
            metrics,
            store,
        })
    }
}
