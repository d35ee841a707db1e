//! Persisted entities.
//!
//! - [`AlertRecord`]: immutable snapshot of one alert evaluation
//! - [`AlertResource`]: an external entity currently referenced by an alert
//! - [`ResourceAlertJoint`]: the edge between a resource and an alert
//! - [`ProblemRecord`]: one reconciled problem row per rule type and resource

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rules::RuleKind;
use crate::types::EvalMatch;

/// The state an alert evaluation ended in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    /// Not evaluated yet.
    #[default]
    Unknown,
    /// Conditions did not fire.
    Ok,
    /// Conditions fired.
    Alerting,
    /// Evaluation is suspended.
    Paused,
}

impl AlertState {
    /// Returns the state as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Ok => "ok",
            Self::Alerting => "alerting",
            Self::Paused => "paused",
        }
    }
}

impl std::fmt::Display for AlertState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable per-evaluation snapshot of an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    /// Record ID.
    pub id: String,
    /// The alert this record belongs to.
    pub alert_id: String,
    /// Outcome of the evaluation.
    pub state: AlertState,
    /// Matches backing the outcome.
    pub eval_data: Vec<EvalMatch>,
    /// When the evaluation was committed.
    pub created_at: DateTime<Utc>,
}

impl AlertRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(alert_id: impl Into<String>, state: AlertState, eval_data: Vec<EvalMatch>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            alert_id: alert_id.into(),
            state,
            eval_data,
            created_at: Utc::now(),
        }
    }

    /// Overrides the creation time.
    #[must_use]
    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// Kind of external resource an alert can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Virtual machine.
    Vm,
    /// Physical host.
    Host,
    /// Relational database instance.
    Rds,
    /// Cache instance.
    Redis,
    /// Object storage bucket.
    Oss,
    /// Cloud account.
    Cloudaccount,
    /// Block storage pool.
    Storage,
}

impl ResourceKind {
    /// All kinds, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::Vm,
        Self::Host,
        Self::Rds,
        Self::Redis,
        Self::Oss,
        Self::Cloudaccount,
        Self::Storage,
    ];

    /// Returns the kind as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Vm => "vm",
            Self::Host => "host",
            Self::Rds => "rds",
            Self::Redis => "redis",
            Self::Oss => "oss",
            Self::Cloudaccount => "cloudaccount",
            Self::Storage => "storage",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The universal idempotency key of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Resource name, unique within its kind.
    pub name: String,
}

impl ResourceKey {
    /// Creates a key.
    #[must_use]
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Materialised alert status of a resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    /// No alert references the resource.
    #[default]
    Init,
    /// At least one alert references the resource.
    Attach,
    /// An alert fired on the resource recently.
    Alerting,
}

impl ResourceStatus {
    /// Returns the status as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Attach => "attach",
            Self::Alerting => "alerting",
        }
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An external entity referenced by at least one alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertResource {
    /// Row ID.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Resource name.
    pub name: String,
    /// External identity value the resource was last seen with.
    pub res_id: String,
    /// Materialised status.
    pub status: ResourceStatus,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// When the row was last changed.
    pub updated_at: DateTime<Utc>,
}

impl AlertResource {
    /// Creates a fresh resource row for `key`.
    #[must_use]
    pub fn new(key: &ResourceKey, res_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: key.kind,
            name: key.name.clone(),
            res_id: res_id.into(),
            status: ResourceStatus::Init,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the resource key.
    #[must_use]
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.kind, self.name.clone())
    }
}

/// Edge between a resource and an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAlertJoint {
    /// Resource row ID.
    pub resource_id: String,
    /// Alert ID.
    pub alert_id: String,
    /// Record that last touched the edge.
    pub alert_record_id: String,
    /// Alert state carried by the edge.
    pub alert_state: AlertState,
    /// When the alert last fired on the resource.
    pub trigger_time: DateTime<Utc>,
    /// Snapshot of the match that produced the edge.
    pub data: EvalMatch,
}

/// One problem row per rule type and external resource, replaced every cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemRecord {
    /// Row ID. Kept across updates.
    pub id: String,
    /// Rule type that produced the row.
    pub rule_type: RuleKind,
    /// External resource ID.
    pub res_id: String,
    /// External resource kind.
    pub res_kind: ResourceKind,
    /// External resource name.
    pub name: String,
    /// Rule configuration in effect when the row was produced.
    pub monitor_config: serde_json::Value,
    /// Resource metadata returned by the lookup.
    pub res_meta: serde_json::Value,
    /// Per-condition findings for this resource.
    pub problems: Vec<Problem>,
    /// Suggested remediation.
    pub action: String,
    /// When the row was last written.
    pub updated_at: DateTime<Utc>,
}

impl ProblemRecord {
    /// Returns true if everything except the row ID and timestamp is equal.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.rule_type == other.rule_type
            && self.res_id == other.res_id
            && self.res_kind == other.res_kind
            && self.name == other.name
            && self.monitor_config == other.monitor_config
            && self.res_meta == other.res_meta
            && self.problems == other.problems
            && self.action == other.action
    }
}

/// A single finding within a problem row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    /// Condition bucket the finding came from.
    pub bucket: String,
    /// `measurement.field`.
    pub metric: String,
    /// Reduced value.
    pub value: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&AlertState::Alerting).unwrap(), "\"alerting\"");
        assert_eq!(AlertState::default(), AlertState::Unknown);
    }

    #[test]
    fn resource_key_display() {
        let key = ResourceKey::new(ResourceKind::Vm, "web1");
        assert_eq!(key.to_string(), "vm/web1");
    }

    #[test]
    fn resource_kind_round_trips_through_serde() {
        for kind in ResourceKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            let back: ResourceKind = serde_json::from_str(&json).unwrap();
            assert_eq!(back, kind);
        }
    }

    #[test]
    fn new_resource_starts_in_init() {
        let now = Utc::now();
        let res = AlertResource::new(&ResourceKey::new(ResourceKind::Host, "node-1"), "h-1", now);
        assert_eq!(res.status, ResourceStatus::Init);
        assert_eq!(res.key(), ResourceKey::new(ResourceKind::Host, "node-1"));
        assert_eq!(res.created_at, now);
    }

    #[test]
    fn record_ids_are_unique() {
        let a = AlertRecord::new("a1", AlertState::Ok, vec![]);
        let b = AlertRecord::new("a1", AlertState::Ok, vec![]);
        assert_ne!(a.id, b.id);
    }
}
