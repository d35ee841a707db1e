//! Persistence traits and the in-memory repository.
//!
//! The engine only talks to [`ProblemStore`], [`ResourceStore`] and
//! [`RecordStore`]. [`MemoryStore`] implements all three behind one lock and
//! can mirror its state to a JSON snapshot after every mutation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AlertError, Result};
use crate::records::{AlertRecord, AlertResource, ProblemRecord, ResourceAlertJoint, ResourceKey};
use crate::rules::RuleKind;

/// Storage of reconciled problem rows.
pub trait ProblemStore: Send + Sync {
    /// Lists the rows of one rule type.
    fn list_problems(&self, rule: RuleKind) -> Result<Vec<ProblemRecord>>;

    /// Inserts a new row.
    fn insert_problem(&self, record: ProblemRecord) -> Result<()>;

    /// Replaces an existing row with the same ID.
    fn update_problem(&self, record: ProblemRecord) -> Result<()>;

    /// Deletes a row by ID.
    fn delete_problem(&self, id: &str) -> Result<()>;
}

/// Storage of alert resources and their joints.
pub trait ResourceStore: Send + Sync {
    /// Returns every resource row stored under `key`.
    ///
    /// A healthy store returns at most one row.
    fn find_resources(&self, key: &ResourceKey) -> Result<Vec<AlertResource>>;

    /// Fetches a resource by row ID.
    fn get_resource(&self, id: &str) -> Result<Option<AlertResource>>;

    /// Lists every resource.
    fn list_resources(&self) -> Result<Vec<AlertResource>>;

    /// Inserts a resource. Fails with `DuplicateMatch` if its key exists.
    fn insert_resource(&self, resource: AlertResource) -> Result<()>;

    /// Replaces an existing resource with the same ID.
    fn update_resource(&self, resource: AlertResource) -> Result<()>;

    /// Deletes a resource by row ID.
    fn delete_resource(&self, id: &str) -> Result<()>;

    /// Fetches the joint for a `(resource, alert)` pair.
    fn get_joint(&self, resource_id: &str, alert_id: &str) -> Result<Option<ResourceAlertJoint>>;

    /// Lists the joints of a resource.
    fn joints_for_resource(&self, resource_id: &str) -> Result<Vec<ResourceAlertJoint>>;

    /// Lists the joints of an alert.
    fn joints_for_alert(&self, alert_id: &str) -> Result<Vec<ResourceAlertJoint>>;

    /// Inserts a joint. Fails with `DuplicateMatch` if the pair is already joined.
    fn insert_joint(&self, joint: ResourceAlertJoint) -> Result<()>;

    /// Replaces an existing joint for the same pair.
    fn update_joint(&self, joint: ResourceAlertJoint) -> Result<()>;

    /// Deletes a joint. Returns false if the pair was not joined.
    fn delete_joint(&self, resource_id: &str, alert_id: &str) -> Result<bool>;
}

/// Storage of alert evaluation records.
pub trait RecordStore: Send + Sync {
    /// Appends a record.
    fn insert_record(&self, record: AlertRecord) -> Result<()>;

    /// Returns the newest record of an alert.
    fn latest_record(&self, alert_id: &str) -> Result<Option<AlertRecord>>;

    /// Returns every record of an alert, oldest first.
    fn records_for(&self, alert_id: &str) -> Result<Vec<AlertRecord>>;
}

/// Serialised form of the repository.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    problems: Vec<ProblemRecord>,
    #[serde(default)]
    resources: Vec<AlertResource>,
    #[serde(default)]
    joints: Vec<ResourceAlertJoint>,
    #[serde(default)]
    records: Vec<AlertRecord>,
}

#[derive(Debug, Default)]
struct State {
    problems: HashMap<String, ProblemRecord>,
    resources: HashMap<String, AlertResource>,
    joints: HashMap<(String, String), ResourceAlertJoint>,
    records: Vec<AlertRecord>,
}

impl State {
    fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            problems: snapshot
                .problems
                .into_iter()
                .map(|p| (p.id.clone(), p))
                .collect(),
            resources: snapshot
                .resources
                .into_iter()
                .map(|r| (r.id.clone(), r))
                .collect(),
            joints: snapshot
                .joints
                .into_iter()
                .map(|j| ((j.resource_id.clone(), j.alert_id.clone()), j))
                .collect(),
            records: snapshot.records,
        }
    }

    fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            problems: self.problems.values().cloned().collect(),
            resources: self.resources.values().cloned().collect(),
            joints: self.joints.values().cloned().collect(),
            records: self.records.clone(),
        }
    }
}

/// In-memory repository implementing every store trait.
///
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
    snapshot_path: Option<PathBuf>,
}

impl MemoryStore {
    /// Creates an empty, unpersisted store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store mirrored to a JSON snapshot at `path`.
    ///
    /// Existing state is loaded from the file. A missing file starts empty.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Store` if the file exists but cannot be read and
    /// `AlertError::Serialization` if it is not a valid snapshot.
    pub fn with_snapshot(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| AlertError::Store {
                reason: format!("failed to read snapshot '{}': {e}", path.display()),
            })?;
            let snapshot: Snapshot = serde_json::from_str(&content)?;
            debug!(
                path = %path.display(),
                resources = snapshot.resources.len(),
                problems = snapshot.problems.len(),
                "loaded store snapshot"
            );
            State::from_snapshot(snapshot)
        } else {
            State::default()
        };

        Ok(Self {
            state: Arc::new(RwLock::new(state)),
            snapshot_path: Some(path),
        })
    }

    /// Returns the snapshot path, if any.
    #[must_use]
    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    /// Writes the current state to `path`.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Store` if the file cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let snapshot = self.state.read().to_snapshot();
        let json = serde_json::to_string_pretty(&snapshot)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| AlertError::Store {
                    reason: format!("failed to create '{}': {e}", parent.display()),
                })?;
            }
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)
            .and_then(|()| std::fs::rename(&tmp, path))
            .map_err(|e| AlertError::Store {
                reason: format!("failed to write snapshot '{}': {e}", path.display()),
            })
    }

    fn persist(&self) {
        if let Some(path) = &self.snapshot_path {
            if let Err(e) = self.save_to(path) {
                warn!(error = %e, "failed to snapshot store");
            }
        }
    }

    fn missing(what: &str, id: &str) -> AlertError {
        AlertError::not_found(format!("{what} {id}"))
    }
}

impl ProblemStore for MemoryStore {
    fn list_problems(&self, rule: RuleKind) -> Result<Vec<ProblemRecord>> {
        let state = self.state.read();
        let mut rows: Vec<ProblemRecord> = state
            .problems
            .values()
            .filter(|p| p.rule_type == rule)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.res_id.cmp(&b.res_id));
        Ok(rows)
    }

    fn insert_problem(&self, record: ProblemRecord) -> Result<()> {
        {
            let mut state = self.state.write();
            if state.problems.contains_key(&record.id) {
                return Err(AlertError::DuplicateMatch {
                    what: format!("problem {}", record.id),
                });
            }
            state.problems.insert(record.id.clone(), record);
        }
        self.persist();
        Ok(())
    }

    fn update_problem(&self, record: ProblemRecord) -> Result<()> {
        {
            let mut state = self.state.write();
            let slot = state
                .problems
                .get_mut(&record.id)
                .ok_or_else(|| Self::missing("problem", &record.id))?;
            *slot = record;
        }
        self.persist();
        Ok(())
    }

    fn delete_problem(&self, id: &str) -> Result<()> {
        if self.state.write().problems.remove(id).is_none() {
            return Err(Self::missing("problem", id));
        }
        self.persist();
        Ok(())
    }
}

impl ResourceStore for MemoryStore {
    fn find_resources(&self, key: &ResourceKey) -> Result<Vec<AlertResource>> {
        let state = self.state.read();
        Ok(state
            .resources
            .values()
            .filter(|r| r.kind == key.kind && r.name == key.name)
            .cloned()
            .collect())
    }

    fn get_resource(&self, id: &str) -> Result<Option<AlertResource>> {
        Ok(self.state.read().resources.get(id).cloned())
    }

    fn list_resources(&self) -> Result<Vec<AlertResource>> {
        let mut rows: Vec<AlertResource> = self.state.read().resources.values().cloned().collect();
        rows.sort_by_key(AlertResource::key);
        Ok(rows)
    }

    fn insert_resource(&self, resource: AlertResource) -> Result<()> {
        {
            let mut state = self.state.write();
            if state
                .resources
                .values()
                .any(|r| r.kind == resource.kind && r.name == resource.name)
            {
                return Err(AlertError::DuplicateMatch {
                    what: format!("resource {}", resource.key()),
                });
            }
            state.resources.insert(resource.id.clone(), resource);
        }
        self.persist();
        Ok(())
    }

    fn update_resource(&self, resource: AlertResource) -> Result<()> {
        {
            let mut state = self.state.write();
            let slot = state
                .resources
                .get_mut(&resource.id)
                .ok_or_else(|| Self::missing("resource", &resource.id))?;
            *slot = resource;
        }
        self.persist();
        Ok(())
    }

    fn delete_resource(&self, id: &str) -> Result<()> {
        {
            let mut state = self.state.write();
            if state.joints.keys().any(|(rid, _)| rid == id) {
                return Err(AlertError::Store {
                    reason: format!("resource {id} still has joints"),
                });
            }
            if state.resources.remove(id).is_none() {
                return Err(Self::missing("resource", id));
            }
        }
        self.persist();
        Ok(())
    }

    fn get_joint(&self, resource_id: &str, alert_id: &str) -> Result<Option<ResourceAlertJoint>> {
        let key = (resource_id.to_string(), alert_id.to_string());
        Ok(self.state.read().joints.get(&key).cloned())
    }

    fn joints_for_resource(&self, resource_id: &str) -> Result<Vec<ResourceAlertJoint>> {
        Ok(self
            .state
            .read()
            .joints
            .values()
            .filter(|j| j.resource_id == resource_id)
            .cloned()
            .collect())
    }

    fn joints_for_alert(&self, alert_id: &str) -> Result<Vec<ResourceAlertJoint>> {
        Ok(self
            .state
            .read()
            .joints
            .values()
            .filter(|j| j.alert_id == alert_id)
            .cloned()
            .collect())
    }

    fn insert_joint(&self, joint: ResourceAlertJoint) -> Result<()> {
        {
            let mut state = self.state.write();
            if !state.resources.contains_key(&joint.resource_id) {
                return Err(Self::missing("resource", &joint.resource_id));
            }
            let key = (joint.resource_id.clone(), joint.alert_id.clone());
            if state.joints.contains_key(&key) {
                return Err(AlertError::DuplicateMatch {
                    what: format!("joint {} -> {}", joint.resource_id, joint.alert_id),
                });
            }
            state.joints.insert(key, joint);
        }
        self.persist();
        Ok(())
    }

    fn update_joint(&self, joint: ResourceAlertJoint) -> Result<()> {
        {
            let mut state = self.state.write();
            let key = (joint.resource_id.clone(), joint.alert_id.clone());
            let slot = state
                .joints
                .get_mut(&key)
                .ok_or_else(|| Self::missing("joint", &format!("{} -> {}", key.0, key.1)))?;
            *slot = joint;
        }
        self.persist();
        Ok(())
    }

    fn delete_joint(&self, resource_id: &str, alert_id: &str) -> Result<bool> {
        let key = (resource_id.to_string(), alert_id.to_string());
        let removed = self.state.write().joints.remove(&key).is_some();
        if removed {
            self.persist();
        }
        Ok(removed)
    }
}

impl RecordStore for MemoryStore {
    fn insert_record(&self, record: AlertRecord) -> Result<()> {
        self.state.write().records.push(record);
        self.persist();
        Ok(())
    }

    fn latest_record(&self, alert_id: &str) -> Result<Option<AlertRecord>> {
        Ok(self
            .state
            .read()
            .records
            .iter()
            .rev()
            .find(|r| r.alert_id == alert_id)
            .cloned())
    }

    fn records_for(&self, alert_id: &str) -> Result<Vec<AlertRecord>> {
        Ok(self
            .state
            .read()
            .records
            .iter()
            .filter(|r| r.alert_id == alert_id)
            .cloned()
            .collect())
    }
}
