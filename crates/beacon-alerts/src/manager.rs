//! The rule engine.
//!
//! [`RuleEngine`] owns the registries, the stores and the configured rules and
//! alerts, and runs the two pipelines:
//!
//! - rule cycles: evaluate, combine, map, then diff problem rows
//! - alert evaluations: evaluate, combine, commit a record, then update joints

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use beacon_metrics::{SeriesBackend, TimeRange};
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::combinator::{CombinedResult, combine_with};
use crate::condition::ConditionEvaluator;
use crate::drivers::DriverRegistry;
use crate::error::{AlertError, Result};
use crate::joints::{JointOutcome, JointStateMachine};
use crate::mapper::{LookupRegistry, ResourceMapper};
use crate::reconcile::{ReconcileReport, ReconcilerDiff};
use crate::records::{AlertRecord, AlertResource, AlertState, ProblemRecord, ResourceKey};
use crate::rules::{AlertDefinition, RuleConfig, RuleKind};
use crate::status::ALERTING_DECAY_SECS;
use crate::store::{MemoryStore, ProblemStore, RecordStore, ResourceStore};
use crate::types::Condition;

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long an alerting joint keeps its resource alerting (in seconds).
    pub alerting_decay_secs: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            alerting_decay_secs: ALERTING_DECAY_SECS,
        }
    }
}

/// The persistence collaborators of an engine.
#[derive(Clone)]
pub struct Stores {
    /// Problem rows.
    pub problems: Arc<dyn ProblemStore>,
    /// Resources and joints.
    pub resources: Arc<dyn ResourceStore>,
    /// Alert records.
    pub records: Arc<dyn RecordStore>,
}

impl Stores {
    /// Backs every store with the same in-memory repository.
    #[must_use]
    pub fn memory(store: &MemoryStore) -> Self {
        Self {
            problems: Arc::new(store.clone()),
            resources: Arc::new(store.clone()),
            records: Arc::new(store.clone()),
        }
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

/// The result of one rule cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Conditions evaluated before combination stopped.
    pub conditions_evaluated: usize,
    /// Whether the rule fired.
    pub firing: bool,
    /// Problem rows produced by the mapper.
    pub problems: usize,
    /// Writes applied to the problem store.
    pub reconcile: ReconcileReport,
}

/// The result of one alert evaluation.
#[derive(Debug)]
pub struct AlertEvaluation {
    /// The committed record.
    pub record: AlertRecord,
    /// Joint changes caused by the record.
    pub joints: JointOutcome,
}

/// Marks a rule or alert as running until dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

/// Runs rule cycles and alert evaluations.
pub struct RuleEngine {
    config: EngineConfig,
    backend: Arc<dyn SeriesBackend>,
    drivers: Arc<DriverRegistry>,
    lookups: Arc<LookupRegistry>,
    stores: Stores,
    rules: Arc<RwLock<HashMap<RuleKind, RuleConfig>>>,
    alerts: Arc<RwLock<HashMap<String, AlertDefinition>>>,
    last_run: Arc<RwLock<HashMap<RuleKind, DateTime<Utc>>>>,
    in_flight: Mutex<HashSet<String>>,
    /// Held around every joint-table mutation.
    joint_lock: Mutex<()>,
}

impl std::fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEngine")
            .field("config", &self.config)
            .field("drivers", &self.drivers)
            .field("lookups", &self.lookups)
            .field("rules", &self.rules.read().keys().collect::<Vec<_>>())
            .field("alerts", &self.alerts.read().len())
            .finish_non_exhaustive()
    }
}

impl RuleEngine {
    /// Creates an engine with the built-in drivers and default configuration.
    #[must_use]
    pub fn new(backend: Arc<dyn SeriesBackend>, lookups: LookupRegistry, stores: Stores) -> Self {
        Self::with_config(
            EngineConfig::default(),
            backend,
            Arc::new(DriverRegistry::with_defaults()),
            Arc::new(lookups),
            stores,
        )
    }

    /// Creates an engine from explicit parts.
    #[must_use]
    pub fn with_config(
        config: EngineConfig,
        backend: Arc<dyn SeriesBackend>,
        drivers: Arc<DriverRegistry>,
        lookups: Arc<LookupRegistry>,
        stores: Stores,
    ) -> Self {
        Self {
            config,
            backend,
            drivers,
            lookups,
            stores,
            rules: Arc::new(RwLock::new(HashMap::new())),
            alerts: Arc::new(RwLock::new(HashMap::new())),
            last_run: Arc::new(RwLock::new(HashMap::new())),
            in_flight: Mutex::new(HashSet::new()),
            joint_lock: Mutex::new(()),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ============ Rule Management ============

    /// Adds or replaces the rule of its type.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Validation` if the rule is malformed.
    pub fn upsert_rule(&self, rule: RuleConfig) -> Result<()> {
        rule.validate()?;
        info!(rule = %rule.kind(), name = %rule.name, enabled = rule.enabled, "configured rule");
        self.rules.write().insert(rule.kind(), rule);
        Ok(())
    }

    /// Removes the rule of a type. Returns true if one was configured.
    pub fn remove_rule(&self, kind: RuleKind) -> bool {
        let removed = self.rules.write().remove(&kind).is_some();
        if removed {
            info!(rule = %kind, "removed rule");
        }
        removed
    }

    /// Returns the rule of a type.
    #[must_use]
    pub fn get_rule(&self, kind: RuleKind) -> Option<RuleConfig> {
        self.rules.read().get(&kind).cloned()
    }

    /// Returns every configured rule, ordered by type.
    #[must_use]
    pub fn list_rules(&self) -> Vec<RuleConfig> {
        let mut rules: Vec<RuleConfig> = self.rules.read().values().cloned().collect();
        rules.sort_by_key(RuleConfig::kind);
        rules
    }

    /// Returns when a rule last completed a cycle.
    #[must_use]
    pub fn last_run(&self, kind: RuleKind) -> Option<DateTime<Utc>> {
        self.last_run.read().get(&kind).copied()
    }

    // ============ Alert Management ============

    /// Adds an alert definition.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Validation` if the alert is malformed and
    /// `AlertError::DuplicateMatch` if its ID is taken.
    pub fn add_alert(&self, alert: AlertDefinition) -> Result<()> {
        alert.validate()?;
        let mut alerts = self.alerts.write();
        if alerts.contains_key(&alert.id) {
            return Err(AlertError::DuplicateMatch {
                what: format!("alert '{}'", alert.id),
            });
        }
        info!(alert = %alert.id, name = %alert.name, "added alert");
        alerts.insert(alert.id.clone(), alert);
        Ok(())
    }

    /// Removes an alert and detaches it from every resource.
    ///
    /// Returns false if the alert was not defined.
    ///
    /// # Errors
    ///
    /// Returns a store error if the alert's joints cannot be read.
    pub fn remove_alert(&self, alert_id: &str) -> Result<bool> {
        if self.alerts.write().remove(alert_id).is_none() {
            return Ok(false);
        }
        let outcome = {
            let _joints = self.joint_lock.lock();
            self.joints().detach_alert(alert_id, Utc::now())?
        };
        for e in &outcome.errors {
            warn!(alert = %alert_id, error = %e, "failed to detach removed alert");
        }
        info!(alert = %alert_id, detached = outcome.detached, "removed alert");
        Ok(true)
    }

    /// Returns an alert definition.
    #[must_use]
    pub fn get_alert(&self, alert_id: &str) -> Option<AlertDefinition> {
        self.alerts.read().get(alert_id).cloned()
    }

    /// Returns every alert definition, ordered by ID.
    #[must_use]
    pub fn list_alerts(&self) -> Vec<AlertDefinition> {
        let mut alerts: Vec<AlertDefinition> = self.alerts.read().values().cloned().collect();
        alerts.sort_by(|a, b| a.id.cmp(&b.id));
        alerts
    }

    // ============ Rule Cycles ============

    /// Runs one cycle of a rule at the current time.
    ///
    /// # Errors
    ///
    /// See [`run_cycle_at`](Self::run_cycle_at).
    pub fn run_cycle(&self, kind: RuleKind) -> Result<CycleReport> {
        self.run_cycle_at(kind, Utc::now())
    }

    /// Runs one cycle of a rule as of `now`.
    ///
    /// A failed evaluation leaves the persisted problem rows untouched.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::NotFound` if no rule of that type is configured,
    /// `AlertError::CycleInProgress` if the rule is already running,
    /// `AlertError::Query` if the backend fails, and store errors.
    pub fn run_cycle_at(&self, kind: RuleKind, now: DateTime<Utc>) -> Result<CycleReport> {
        let rule = self
            .get_rule(kind)
            .ok_or_else(|| AlertError::not_found(format!("rule {kind}")))?;
        let _guard = self.begin(format!("rule:{kind}"), kind.as_str())?;

        let range = lookback(now, rule.time_from()?)?;
        let combined = self.evaluate_conditions(rule.settings.conditions(), range)?;

        let problems: Vec<ProblemRecord> = if combined.firing {
            ResourceMapper::new(&self.drivers, &self.lookups).map(&rule, &combined, now)
        } else {
            Vec::new()
        };

        let report = CycleReport {
            conditions_evaluated: combined.evaluated,
            firing: combined.firing,
            problems: problems.len(),
            reconcile: self.reconcile(kind, problems)?,
        };
        self.last_run.write().insert(kind, now);

        info!(
            rule = %kind,
            firing = report.firing,
            problems = report.problems,
            "rule cycle complete"
        );
        Ok(report)
    }

    /// Replaces the persisted problem rows of a rule type.
    ///
    /// # Errors
    ///
    /// Returns the first store error.
    pub fn reconcile(&self, kind: RuleKind, new: Vec<ProblemRecord>) -> Result<ReconcileReport> {
        ReconcilerDiff::new(&*self.stores.problems).reconcile(kind, new)
    }

    /// Returns the persisted problem rows of a rule type.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub fn list_problems(&self, kind: RuleKind) -> Result<Vec<ProblemRecord>> {
        self.stores.problems.list_problems(kind)
    }

    // ============ Alert Evaluation ============

    /// Evaluates an alert at the current time.
    ///
    /// # Errors
    ///
    /// See [`evaluate_alert_at`](Self::evaluate_alert_at).
    pub fn evaluate_alert(&self, alert_id: &str) -> Result<AlertEvaluation> {
        self.evaluate_alert_at(alert_id, Utc::now())
    }

    /// Evaluates an alert as of `now`, commits the record and updates joints.
    ///
    /// Joint failures after the commit are logged and returned in
    /// [`AlertEvaluation::joints`]; they do not fail the evaluation.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::NotFound` for an unknown alert,
    /// `AlertError::Validation` for a disabled one,
    /// `AlertError::CycleInProgress` if it is already being evaluated,
    /// `AlertError::Query` if the backend fails, and store errors from the
    /// record commit.
    pub fn evaluate_alert_at(&self, alert_id: &str, now: DateTime<Utc>) -> Result<AlertEvaluation> {
        let alert = self
            .get_alert(alert_id)
            .ok_or_else(|| AlertError::not_found(format!("alert '{alert_id}'")))?;
        if !alert.enabled {
            return Err(AlertError::validation(format!("alert '{alert_id}' is disabled")));
        }
        let _guard = self.begin(format!("alert:{alert_id}"), alert_id)?;

        let range = lookback(now, alert.time_from()?)?;
        let combined = self.evaluate_conditions(&alert.conditions, range)?;

        let record = if combined.firing {
            AlertRecord::new(alert_id, AlertState::Alerting, combined.canonical().to_vec())
        } else {
            AlertRecord::new(alert_id, AlertState::Ok, combined.ok_matches)
        }
        .at(now);

        self.stores.records.insert_record(record.clone())?;
        debug!(alert = %alert_id, state = %record.state, matches = record.eval_data.len(), "committed alert record");

        let joints = self.reconcile_from_record(&record, now);
        Ok(AlertEvaluation { record, joints })
    }

    /// Applies a committed record to the joint table.
    ///
    /// Failures are logged and collected in the returned outcome.
    pub fn reconcile_from_record(&self, record: &AlertRecord, now: DateTime<Utc>) -> JointOutcome {
        let _joints = self.joint_lock.lock();
        let outcome = match self.joints().reconcile_from_record_at(record, now) {
            Ok(outcome) => outcome,
            Err(e) => JointOutcome {
                errors: vec![e],
                ..JointOutcome::default()
            },
        };
        for e in &outcome.errors {
            warn!(alert = %record.alert_id, record = %record.id, error = %e, "joint reconciliation error");
        }
        outcome
    }

    /// Returns the newest committed record of an alert.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub fn latest_record(&self, alert_id: &str) -> Result<Option<AlertRecord>> {
        self.stores.records.latest_record(alert_id)
    }

    // ============ Resources ============

    /// Detaches a resource from an alert explicitly.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::NotFound` if no resource has `key`.
    pub fn resolve(&self, key: &ResourceKey, alert_id: &str) -> Result<bool> {
        let _joints = self.joint_lock.lock();
        self.joints().resolve(key, alert_id, Utc::now())
    }

    /// Re-derives every resource status. Returns how many changed.
    ///
    /// Waits for any in-progress joint reconciliation to finish first.
    ///
    /// # Errors
    ///
    /// Returns the first store error.
    pub fn refresh_statuses(&self, now: DateTime<Utc>) -> Result<usize> {
        let _joints = self.joint_lock.lock();
        self.joints().refresh_statuses(now)
    }

    /// Returns every resource.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub fn list_resources(&self) -> Result<Vec<AlertResource>> {
        self.stores.resources.list_resources()
    }

    // ============ Internals ============

    fn joints(&self) -> JointStateMachine<'_> {
        JointStateMachine::new(&*self.stores.resources, &self.drivers)
            .with_decay(Duration::seconds(self.config.alerting_decay_secs))
    }

    fn evaluate_conditions(
        &self,
        conditions: &[Condition],
        range: TimeRange,
    ) -> Result<CombinedResult> {
        let evaluator = ConditionEvaluator::new(&*self.backend);
        combine_with(conditions.len(), |index| {
            evaluator.evaluate(index, &conditions[index], range)
        })
    }

    fn begin(&self, key: String, name: &str) -> Result<InFlight<'_>> {
        let mut running = self.in_flight.lock();
        if !running.insert(key.clone()) {
            debug!(key = %key, "skipping, already running");
            return Err(AlertError::CycleInProgress {
                rule: name.to_string(),
            });
        }
        Ok(InFlight {
            set: &self.in_flight,
            key,
        })
    }
}

/// Builds the query window ending at `now`.
fn lookback(now: DateTime<Utc>, window: StdDuration) -> Result<TimeRange> {
    let millis = i64::try_from(window.as_millis())
        .map_err(|_| AlertError::validation(format!("lookback {window:?} is too large")))?;
    Ok(TimeRange::ending_at(now.timestamp_millis(), millis))
}
