//! Alert to resource joints.
//!
//! [`JointStateMachine`] applies a committed [`AlertRecord`] to the
//! many-to-many edge table between alerts and resources. Each
//! `(resource, alert)` pair moves `absent -> attached -> absent`:
//!
//! - an `alerting` record attaches (creating the resource on first use) or
//!   refreshes the existing joint
//! - an `ok` record detaches
//! - resources that were attached to the alert but no longer appear in the
//!   record are detached regardless of state
//!
//! A resource lives exactly as long as it has joints, and its status is
//! re-derived whenever one of its joints changes.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::drivers::{DriverRegistry, ResourceDriver};
use crate::error::{AlertError, Result};
use crate::records::{
    AlertRecord, AlertResource, AlertState, ResourceAlertJoint, ResourceKey, ResourceStatus,
};
use crate::status::{ALERTING_DECAY_SECS, derive_status_with};
use crate::store::ResourceStore;
use crate::types::EvalMatch;

/// What a reconciliation changed.
#[derive(Debug, Default)]
pub struct JointOutcome {
    /// Joints created.
    pub attached: usize,
    /// Joints refreshed in place.
    pub updated: usize,
    /// Joints removed.
    pub detached: usize,
    /// Resources created on first attach.
    pub resources_created: usize,
    /// Resources deleted after their last detach.
    pub resources_deleted: usize,
    /// Per-match failures. The remaining matches were still processed.
    pub errors: Vec<AlertError>,
}

impl JointOutcome {
    /// Returns true if no joint or resource changed.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.attached == 0
            && self.updated == 0
            && self.detached == 0
            && self.resources_created == 0
            && self.resources_deleted == 0
    }

    /// Converts collected per-match failures into an error.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Aggregate` if any match failed.
    pub fn into_result(mut self) -> Result<Self> {
        if self.errors.is_empty() {
            Ok(self)
        } else {
            Err(AlertError::Aggregate(std::mem::take(&mut self.errors)))
        }
    }
}

/// Drives the joint lifecycle for committed alert records.
#[derive(Clone, Copy)]
pub struct JointStateMachine<'a> {
    store: &'a dyn ResourceStore,
    drivers: &'a DriverRegistry,
    decay: Duration,
}

impl std::fmt::Debug for JointStateMachine<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JointStateMachine")
            .field("decay", &self.decay)
            .finish_non_exhaustive()
    }
}

impl<'a> JointStateMachine<'a> {
    /// Creates a state machine with the default decay window.
    #[must_use]
    pub fn new(store: &'a dyn ResourceStore, drivers: &'a DriverRegistry) -> Self {
        Self {
            store,
            drivers,
            decay: Duration::seconds(ALERTING_DECAY_SECS),
        }
    }

    /// Overrides the alerting decay window.
    #[must_use]
    pub const fn with_decay(mut self, decay: Duration) -> Self {
        self.decay = decay;
        self
    }

    /// Applies a committed record using the current time.
    ///
    /// # Errors
    ///
    /// Returns a store error if the alert's current joints cannot be read.
    /// Per-match failures are collected in [`JointOutcome::errors`].
    pub fn reconcile_from_record(&self, record: &AlertRecord) -> Result<JointOutcome> {
        self.reconcile_from_record_at(record, Utc::now())
    }

    /// Applies a committed record as of `now`.
    ///
    /// # Errors
    ///
    /// See [`reconcile_from_record`](Self::reconcile_from_record).
    pub fn reconcile_from_record_at(
        &self,
        record: &AlertRecord,
        now: DateTime<Utc>,
    ) -> Result<JointOutcome> {
        let mut outcome = JointOutcome::default();

        let mut old_resources = Vec::new();
        for joint in self.store.joints_for_alert(&record.alert_id)? {
            if let Some(resource) = self.store.get_resource(&joint.resource_id)? {
                old_resources.push(resource);
            }
        }

        let mut seen: HashSet<ResourceKey> = HashSet::new();
        for m in &record.eval_data {
            if m.is_no_data() {
                continue;
            }

            let driver = match self.drivers.resolve(m) {
                Ok(driver) => driver,
                Err(e) => {
                    warn!(alert = %record.alert_id, tags = ?m.tags, error = %e, "no driver for match");
                    outcome.errors.push(e);
                    continue;
                }
            };
            seen.insert(driver.unique_key().clone());

            let applied = match record.state {
                AlertState::Alerting => self.attach(&driver, m, record, now, &mut outcome),
                AlertState::Ok => self.recover(driver.unique_key(), &record.alert_id, now, &mut outcome),
                AlertState::Unknown | AlertState::Paused => Ok(()),
            };
            if let Err(e) = applied {
                warn!(alert = %record.alert_id, resource = %driver.unique_key(), error = %e, "failed to apply match");
                outcome.errors.push(e);
            }
        }

        for resource in old_resources {
            if seen.contains(&resource.key()) {
                continue;
            }
            debug!(alert = %record.alert_id, resource = %resource.key(), "resource left the match set");
            if let Err(e) = self.detach(resource, &record.alert_id, now, &mut outcome) {
                outcome.errors.push(e);
            }
        }

        info!(
            alert = %record.alert_id,
            state = %record.state,
            attached = outcome.attached,
            updated = outcome.updated,
            detached = outcome.detached,
            errors = outcome.errors.len(),
            "reconciled joints"
        );
        Ok(outcome)
    }

    /// Detaches one resource from an alert explicitly.
    ///
    /// Returns false if the pair was not joined.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::NotFound` if no resource has `key`.
    pub fn resolve(&self, key: &ResourceKey, alert_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let resource = self
            .find_resource(key)?
            .ok_or_else(|| AlertError::not_found(format!("resource {key}")))?;
        let mut outcome = JointOutcome::default();
        self.detach(resource, alert_id, now, &mut outcome)?;
        Ok(outcome.detached > 0)
    }

    /// Removes every joint of an alert, e.g. after the alert was deleted.
    ///
    /// # Errors
    ///
    /// Returns a store error if the alert's joints cannot be read. Per-joint
    /// failures are collected in [`JointOutcome::errors`].
    pub fn detach_alert(&self, alert_id: &str, now: DateTime<Utc>) -> Result<JointOutcome> {
        let mut outcome = JointOutcome::default();
        for joint in self.store.joints_for_alert(alert_id)? {
            let Some(resource) = self.store.get_resource(&joint.resource_id)? else {
                continue;
            };
            if let Err(e) = self.detach(resource, alert_id, now, &mut outcome) {
                outcome.errors.push(e);
            }
        }
        Ok(outcome)
    }

    /// Re-derives the status of every resource. Returns how many changed.
    ///
    /// # Errors
    ///
    /// Returns the first store error.
    pub fn refresh_statuses(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut changed = 0;
        for resource in self.store.list_resources()? {
            let before = resource.status;
            let mut outcome = JointOutcome::default();
            match self.refresh(resource, now, &mut outcome)? {
                Some(after) if after == before => {}
                _ => changed += 1,
            }
        }
        if changed > 0 {
            debug!(changed, "refreshed resource statuses");
        }
        Ok(changed)
    }

    /// Fetches the resource stored under `key`.
    ///
    /// Two rows under the same key are tolerated; more than two is treated
    /// as corruption.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::DuplicateMatch` if more than two rows share the key.
    pub fn find_resource(&self, key: &ResourceKey) -> Result<Option<AlertResource>> {
        let rows = self.store.find_resources(key)?;
        if rows.len() > 2 {
            return Err(AlertError::DuplicateMatch {
                what: format!("{} resources named {key}", rows.len()),
            });
        }
        Ok(rows.into_iter().next())
    }

    fn attach(
        &self,
        driver: &ResourceDriver,
        m: &EvalMatch,
        record: &AlertRecord,
        now: DateTime<Utc>,
        outcome: &mut JointOutcome,
    ) -> Result<()> {
        let key = driver.unique_key();
        let mut resource = if let Some(existing) = self.find_resource(key)? {
            existing
        } else {
            let created = AlertResource::new(key, driver.identity_value(), now);
            self.store.insert_resource(created.clone())?;
            outcome.resources_created += 1;
            debug!(resource = %key, "created resource");
            created
        };

        if let Some(mut joint) = self.store.get_joint(&resource.id, &record.alert_id)? {
            joint.data = m.clone();
            joint.trigger_time = record.created_at;
            joint.alert_record_id.clone_from(&record.id);
            joint.alert_state = record.state;
            self.store.update_joint(joint)?;
            outcome.updated += 1;
        } else {
            self.store.insert_joint(ResourceAlertJoint {
                resource_id: resource.id.clone(),
                alert_id: record.alert_id.clone(),
                alert_record_id: record.id.clone(),
                alert_state: record.state,
                trigger_time: record.created_at,
                data: m.clone(),
            })?;
            outcome.attached += 1;
            debug!(resource = %key, alert = %record.alert_id, "attached");
        }

        driver.identity_value().clone_into(&mut resource.res_id);
        self.refresh(resource, now, outcome)?;
        Ok(())
    }

    fn recover(
        &self,
        key: &ResourceKey,
        alert_id: &str,
        now: DateTime<Utc>,
        outcome: &mut JointOutcome,
    ) -> Result<()> {
        match self.find_resource(key)? {
            Some(resource) => self.detach(resource, alert_id, now, outcome),
            None => Ok(()),
        }
    }

    fn detach(
        &self,
        resource: AlertResource,
        alert_id: &str,
        now: DateTime<Utc>,
        outcome: &mut JointOutcome,
    ) -> Result<()> {
        if self.store.delete_joint(&resource.id, alert_id)? {
            outcome.detached += 1;
            debug!(resource = %resource.key(), alert = %alert_id, "detached");
        }
        self.refresh(resource, now, outcome)?;
        Ok(())
    }

    /// Deletes an orphaned resource or re-derives its status.
    ///
    /// Returns the new status, or `None` if the resource was deleted.
    fn refresh(
        &self,
        mut resource: AlertResource,
        now: DateTime<Utc>,
        outcome: &mut JointOutcome,
    ) -> Result<Option<ResourceStatus>> {
        let joints = self.store.joints_for_resource(&resource.id)?;
        if joints.is_empty() {
            self.store.delete_resource(&resource.id)?;
            outcome.resources_deleted += 1;
            debug!(resource = %resource.key(), "deleted resource with no joints");
            return Ok(None);
        }

        let status = derive_status_with(&joints, now, self.decay);
        resource.status = status;
        resource.updated_at = now;
        self.store.update_resource(resource)?;
        Ok(Some(status))
    }
}
