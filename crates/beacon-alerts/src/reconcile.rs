//! Create/update/delete diffing of problem rows.
//!
//! Rows are keyed by external resource ID within one rule type. Given the
//! persisted set and a freshly computed set:
//!
//! - keys in both are updated in place (the persisted row ID is kept)
//! - keys only in the new set are inserted
//! - keys only in the persisted set are deleted
//!
//! Updates are unconditional, so replaying the same new set yields the same
//! updates and no inserts or deletes.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::error::Result;
use crate::records::ProblemRecord;
use crate::rules::RuleKind;
use crate::store::ProblemStore;

/// The writes needed to move the persisted set to the new set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    /// Rows to insert.
    pub inserts: Vec<ProblemRecord>,
    /// Rows to overwrite, carrying the persisted row IDs.
    pub updates: Vec<ProblemRecord>,
    /// Persisted rows to delete.
    pub deletes: Vec<ProblemRecord>,
}

impl ReconcilePlan {
    /// Computes the plan.
    ///
    /// Duplicate keys in `new` collapse to the last occurrence.
    #[must_use]
    pub fn compute(old: Vec<ProblemRecord>, new: Vec<ProblemRecord>) -> Self {
        let mut old_map: HashMap<String, ProblemRecord> =
            old.into_iter().map(|r| (r.res_id.clone(), r)).collect();

        let mut order: Vec<String> = Vec::new();
        let mut latest: HashMap<String, ProblemRecord> = HashMap::new();
        for record in new {
            if latest.insert(record.res_id.clone(), record.clone()).is_none() {
                order.push(record.res_id);
            }
        }

        let mut plan = Self::default();
        for key in order {
            let Some(mut record) = latest.remove(&key) else {
                continue;
            };
            match old_map.remove(&key) {
                Some(existing) => {
                    record.id = existing.id;
                    plan.updates.push(record);
                }
                None => plan.inserts.push(record),
            }
        }

        let mut deletes: Vec<ProblemRecord> = old_map.into_values().collect();
        deletes.sort_by(|a, b| a.res_id.cmp(&b.res_id));
        plan.deletes = deletes;
        plan
    }

    /// Returns true if the plan writes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// Counts of the writes a reconciliation performed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Rows inserted.
    pub inserted: usize,
    /// Rows updated.
    pub updated: usize,
    /// Rows deleted.
    pub deleted: usize,
}

/// Applies reconcile plans to a [`ProblemStore`].
#[derive(Clone, Copy)]
pub struct ReconcilerDiff<'a> {
    store: &'a dyn ProblemStore,
}

impl std::fmt::Debug for ReconcilerDiff<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcilerDiff").finish_non_exhaustive()
    }
}

impl<'a> ReconcilerDiff<'a> {
    /// Creates a reconciler over `store`.
    #[must_use]
    pub const fn new(store: &'a dyn ProblemStore) -> Self {
        Self { store }
    }

    /// Replaces the persisted rows of `rule` with `new`.
    ///
    /// Every row in `new` must carry `rule` as its rule type.
    ///
    /// # Errors
    ///
    /// Returns the first store error. Writes already applied stay applied.
    pub fn reconcile(&self, rule: RuleKind, new: Vec<ProblemRecord>) -> Result<ReconcileReport> {
        let old = self.store.list_problems(rule)?;
        let plan = ReconcilePlan::compute(old, new);
        self.apply(rule, plan)
    }

    /// Applies a precomputed plan.
    ///
    /// # Errors
    ///
    /// Returns the first store error.
    pub fn apply(&self, rule: RuleKind, plan: ReconcilePlan) -> Result<ReconcileReport> {
        let report = ReconcileReport {
            inserted: plan.inserts.len(),
            updated: plan.updates.len(),
            deleted: plan.deletes.len(),
        };

        for record in plan.updates {
            debug!(rule = %rule, res_id = %record.res_id, "updating problem");
            self.store.update_problem(record)?;
        }
        for record in plan.inserts {
            debug!(rule = %rule, res_id = %record.res_id, "inserting problem");
            self.store.insert_problem(record)?;
        }
        for record in plan.deletes {
            debug!(rule = %rule, res_id = %record.res_id, "deleting problem");
            self.store.delete_problem(&record.id)?;
        }

        info!(
            rule = %rule,
            inserted = report.inserted,
            updated = report.updated,
            deleted = report.deleted,
            "reconciled problems"
        );
        Ok(report)
    }
}
