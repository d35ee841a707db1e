//! Periodic scheduling of rule cycles, alert evaluations and decay sweeps.
//!
//! Every enabled rule and alert gets its own task ticking at its own
//! interval. The synchronous engine work runs on the blocking pool, and a
//! task never starts a tick before its previous one finished; missed ticks
//! are skipped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use beacon_alerts::{AlertError, RuleEngine};
use beacon_metrics::MetricStore;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between decay sweeps.
    pub sweep_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Handle for controlling the scheduler's tasks.
#[derive(Debug)]
pub struct SchedulerHandle {
    running: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Check if the scheduler is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of completed ticks across all tasks.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    /// Number of spawned tasks.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Stop every task.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// A unit of scheduled work.
#[derive(Debug, Clone)]
enum Job {
    Rule(beacon_alerts::RuleKind),
    Alert(String),
    Sweep,
}

impl Job {
    fn run(&self, engine: &RuleEngine, metrics: Option<&MetricStore>) {
        match self {
            Self::Rule(kind) => match engine.run_cycle(*kind) {
                Ok(report) => debug!(rule = %kind, problems = report.problems, "scheduled cycle done"),
                Err(AlertError::CycleInProgress { .. }) => {
                    debug!(rule = %kind, "cycle still running, skipped");
                }
                Err(e) => warn!(rule = %kind, error = %e, "rule cycle failed"),
            },
            Self::Alert(id) => match engine.evaluate_alert(id) {
                Ok(evaluation) => debug!(alert = %id, state = %evaluation.record.state, "scheduled evaluation done"),
                Err(AlertError::CycleInProgress { .. }) => {
                    debug!(alert = %id, "evaluation still running, skipped");
                }
                Err(e) => warn!(alert = %id, error = %e, "alert evaluation failed"),
            },
            Self::Sweep => {
                if let Some(metrics) = metrics {
                    metrics.expire_old_data();
                }
                match engine.refresh_statuses(Utc::now()) {
                    Ok(changed) => debug!(changed, "decay sweep done"),
                    Err(e) => warn!(error = %e, "decay sweep failed"),
                }
            }
        }
    }
}

/// Start one task per enabled rule and alert plus the decay sweep.
///
/// Returns a handle to control the tasks.
pub fn start(
    engine: Arc<RuleEngine>,
    metrics: Option<MetricStore>,
    config: &SchedulerConfig,
) -> SchedulerHandle {
    let mut handle = SchedulerHandle {
        running: Arc::new(AtomicBool::new(true)),
        ticks: Arc::new(AtomicU64::new(0)),
        tasks: Vec::new(),
    };

    let mut jobs: Vec<(Job, Duration)> = Vec::new();
    for rule in engine.list_rules().into_iter().filter(|r| r.enabled) {
        match rule.period() {
            Ok(period) => jobs.push((Job::Rule(rule.kind()), period)),
            Err(e) => warn!(rule = %rule.kind(), error = %e, "not scheduling rule"),
        }
    }
    for alert in engine.list_alerts().into_iter().filter(|a| a.enabled) {
        match alert.interval() {
            Ok(interval) => jobs.push((Job::Alert(alert.id.clone()), interval)),
            Err(e) => warn!(alert = %alert.id, error = %e, "not scheduling alert"),
        }
    }
    jobs.push((Job::Sweep, config.sweep_interval));

    for (job, period) in jobs {
        info!(job = ?job, period = ?period, "scheduling");
        let task = spawn_job(
            job,
            period,
            Arc::clone(&engine),
            metrics.clone(),
            Arc::clone(&handle.running),
            Arc::clone(&handle.ticks),
        );
        handle.tasks.push(task);
    }

    handle
}

fn spawn_job(
    job: Job,
    period: Duration,
    engine: Arc<RuleEngine>,
    metrics: Option<MetricStore>,
    running: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval_timer = tokio::time::interval(period);
        interval_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while running.load(Ordering::SeqCst) {
            interval_timer.tick().await;

            if !running.load(Ordering::SeqCst) {
                break;
            }

            let engine = Arc::clone(&engine);
            let metrics = metrics.clone();
            let work = job.clone();
            let result =
                tokio::task::spawn_blocking(move || work.run(&engine, metrics.as_ref())).await;
            if let Err(e) = result {
                error!(job = ?job, error = %e, "scheduled job panicked");
            }
            ticks.fetch_add(1, Ordering::SeqCst);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_alerts::{
        LookupRegistry, MemoryStore, ResourceDescriptor, ResourceKind, RuleConfig, RuleKind,
        Stores,
    };
    use beacon_metrics::{MetricName, MetricPoint};

    fn engine_with_hot_vm() -> (Arc<RuleEngine>, MetricStore) {
        let metrics = MetricStore::default();
        metrics.push(
            &MetricName::new("vm_cpu_usage_active").unwrap(),
            MetricPoint::now(97.0).label("vm_id", "i-1"),
        );
        let lookups = LookupRegistry::from_descriptors(vec![ResourceDescriptor::new(
            ResourceKind::Vm,
            "i-1",
            "web1",
        )]);
        let engine = RuleEngine::new(
            Arc::new(metrics.clone()),
            lookups,
            Stores::memory(&MemoryStore::new()),
        );
        for rule in RuleConfig::defaults() {
            engine.upsert_rule(rule).unwrap();
        }
        (Arc::new(engine), metrics)
    }

    #[test]
    fn scheduler_config_default() {
        assert_eq!(SchedulerConfig::default().sweep_interval, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn first_tick_runs_every_rule() {
        let (engine, metrics) = engine_with_hot_vm();
        let handle = start(Arc::clone(&engine), Some(metrics), &SchedulerConfig::default());
        assert!(handle.is_running());
        assert_eq!(handle.task_count(), 3);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while engine.last_run(RuleKind::ScaleUp).is_none() {
            assert!(tokio::time::Instant::now() < deadline, "rule never ran");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(engine.list_problems(RuleKind::ScaleUp).unwrap().len(), 1);
        handle.stop();
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn disabled_rules_are_not_scheduled() {
        let (engine, _metrics) = engine_with_hot_vm();
        let mut rule = engine.get_rule(RuleKind::ScaleDown).unwrap();
        rule.enabled = false;
        engine.upsert_rule(rule).unwrap();

        let handle = start(engine, None, &SchedulerConfig::default());
        assert_eq!(handle.task_count(), 2);
        handle.stop();
    }

    #[tokio::test]
    async fn stop_halts_ticks() {
        let (engine, _metrics) = engine_with_hot_vm();
        let config = SchedulerConfig {
            sweep_interval: Duration::from_millis(10),
        };
        let handle = start(engine, None, &config);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while handle.ticks() < 3 {
            assert!(tokio::time::Instant::now() < deadline, "scheduler never ticked");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        handle.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after_stop = handle.ticks();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.ticks(), after_stop);
    }
}
