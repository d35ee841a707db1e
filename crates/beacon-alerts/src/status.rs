//! Derived per-resource status.
//!
//! A resource with no joints is `init`, with at least one joint `attach`, and
//! `alerting` while some joint fired within the decay window.

use chrono::{DateTime, Duration, Utc};

use crate::records::{AlertState, ResourceAlertJoint, ResourceStatus};

/// How long, in seconds, an alerting joint keeps its resource in `alerting`.
pub const ALERTING_DECAY_SECS: i64 = 30 * 60;

/// Derives a status using the default decay window.
#[must_use]
pub fn derive_status(joints: &[ResourceAlertJoint], now: DateTime<Utc>) -> ResourceStatus {
    derive_status_with(joints, now, Duration::seconds(ALERTING_DECAY_SECS))
}

/// Derives a status with an explicit decay window.
#[must_use]
pub fn derive_status_with(
    joints: &[ResourceAlertJoint],
    now: DateTime<Utc>,
    decay: Duration,
) -> ResourceStatus {
    if joints.is_empty() {
        return ResourceStatus::Init;
    }

    let fresh = joints
        .iter()
        .any(|j| j.alert_state == AlertState::Alerting && now - j.trigger_time < decay);

    if fresh {
        ResourceStatus::Alerting
    } else {
        ResourceStatus::Attach
    }
}
