//! Mapping correlated matches to external resources and problem rows.
//!
//! For each canonical match the [`ResourceMapper`] resolves the driver kind,
//! then tries the kind's [`ResourceLookup`] with every identity tag of the
//! match in turn. The first tag that resolves fixes the mapping identity, and
//! the problem row gathers findings from every bucket whose matches carry
//! that same identity tag and value.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::combinator::CombinedResult;
use crate::drivers::DriverRegistry;
use crate::error::{AlertError, Result};
use crate::records::{Problem, ProblemRecord, ResourceKind};
use crate::rules::RuleConfig;
use crate::types::EvalMatch;

/// An external resource as reported by a lookup service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// External ID.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Owning project, if any.
    #[serde(default)]
    pub project: Option<String>,
    /// Cloud provider, if any.
    #[serde(default)]
    pub provider: Option<String>,
    /// Arbitrary metadata copied into problem rows.
    #[serde(default)]
    pub meta: serde_json::Value,
}

impl ResourceDescriptor {
    /// Creates a descriptor without project, provider or metadata.
    #[must_use]
    pub fn new(kind: ResourceKind, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            project: None,
            provider: None,
            meta: serde_json::Value::Null,
        }
    }
}

/// Looks up external resources of one kind by ID.
pub trait ResourceLookup: Send + Sync {
    /// The kind this lookup serves.
    fn kind(&self) -> ResourceKind;

    /// Fetches a resource by external ID.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Lookup` if the resource is unknown or the service fails.
    fn get_by_id(&self, id: &str) -> Result<ResourceDescriptor>;
}

/// A lookup served from an in-memory table.
#[derive(Debug, Clone)]
pub struct StaticCatalog {
    kind: ResourceKind,
    entries: Arc<RwLock<HashMap<String, ResourceDescriptor>>>,
}

impl StaticCatalog {
    /// Creates an empty catalog for `kind`.
    #[must_use]
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Adds or replaces an entry.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Validation` if the descriptor's kind differs from the catalog's.
    pub fn insert(&self, descriptor: ResourceDescriptor) -> Result<()> {
        if descriptor.kind != self.kind {
            return Err(AlertError::validation(format!(
                "{} '{}' does not belong in the {} catalog",
                descriptor.kind, descriptor.id, self.kind
            )));
        }
        self.entries.write().insert(descriptor.id.clone(), descriptor);
        Ok(())
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl ResourceLookup for StaticCatalog {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    fn get_by_id(&self, id: &str) -> Result<ResourceDescriptor> {
        self.entries
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| AlertError::Lookup {
                kind: self.kind.to_string(),
                id: id.to_string(),
                reason: "unknown id".to_string(),
            })
    }
}

/// Per-kind lookup table. Built once at startup and shared.
#[derive(Default, Clone)]
pub struct LookupRegistry {
    lookups: HashMap<ResourceKind, Arc<dyn ResourceLookup>>,
}

impl std::fmt::Debug for LookupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookupRegistry")
            .field("kinds", &self.lookups.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl LookupRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a lookup, replacing any previous one for the same kind.
    pub fn register(&mut self, lookup: Arc<dyn ResourceLookup>) {
        debug!(kind = %lookup.kind(), "registered resource lookup");
        self.lookups.insert(lookup.kind(), lookup);
    }

    /// Builds a registry of static catalogs from a descriptor list.
    #[must_use]
    pub fn from_descriptors(descriptors: Vec<ResourceDescriptor>) -> Self {
        let mut catalogs: HashMap<ResourceKind, StaticCatalog> = HashMap::new();
        for descriptor in descriptors {
            let catalog = catalogs
                .entry(descriptor.kind)
                .or_insert_with(|| StaticCatalog::new(descriptor.kind));
            catalog
                .entries
                .write()
                .insert(descriptor.id.clone(), descriptor);
        }

        let mut registry = Self::new();
        for catalog in catalogs.into_values() {
            registry.register(Arc::new(catalog));
        }
        registry
    }

    /// Returns the lookup for `kind`.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::NotFound` if no lookup serves the kind.
    pub fn get(&self, kind: ResourceKind) -> Result<&dyn ResourceLookup> {
        self.lookups
            .get(&kind)
            .map(|lookup| &**lookup)
            .ok_or_else(|| AlertError::not_found(format!("resource lookup for {kind}")))
    }
}

/// Turns a combined rule result into problem rows.
#[derive(Debug, Clone, Copy)]
pub struct ResourceMapper<'a> {
    drivers: &'a DriverRegistry,
    lookups: &'a LookupRegistry,
}

impl<'a> ResourceMapper<'a> {
    /// Creates a mapper.
    #[must_use]
    pub const fn new(drivers: &'a DriverRegistry, lookups: &'a LookupRegistry) -> Self {
        Self { drivers, lookups }
    }

    /// Resolves the external resource behind a match.
    ///
    /// Returns the winning identity tag, its value, and the descriptor, or
    /// `None` if no identity tag resolves.
    ///
    /// # Errors
    ///
    /// Returns driver dispatch errors and `AlertError::NotFound` if no lookup
    /// serves the driver's kind.
    pub fn resolve(&self, m: &EvalMatch) -> Result<Option<(String, String, ResourceDescriptor)>> {
        let driver = self.drivers.resolve(m)?;
        let lookup = self.lookups.get(driver.kind())?;

        for (tag, value) in m.identity_tags() {
            match lookup.get_by_id(value) {
                Ok(descriptor) => {
                    return Ok(Some((tag.to_string(), value.to_string(), descriptor)));
                }
                Err(e) => {
                    debug!(tag = %tag, value = %value, error = %e, "identity tag did not resolve");
                }
            }
        }

        Ok(None)
    }

    /// Builds one problem row per resolvable canonical match.
    ///
    /// Matches that cannot be resolved or whose resource is ignored by the
    /// rule are skipped and logged.
    #[must_use]
    pub fn map(
        &self,
        rule: &RuleConfig,
        combined: &CombinedResult,
        now: DateTime<Utc>,
    ) -> Vec<ProblemRecord> {
        let monitor_config = payload("monitor_config", &rule.settings);
        let mut records = Vec::new();

        for m in combined.canonical() {
            let (tag, value, descriptor) = match self.resolve(m) {
                Ok(Some(found)) => found,
                Ok(None) => {
                    warn!(rule = %rule.kind(), tags = ?m.tags, "no identity tag resolved to a resource");
                    continue;
                }
                Err(e) => {
                    warn!(rule = %rule.kind(), tags = ?m.tags, error = %e, "failed to map match");
                    continue;
                }
            };

            if rule.is_ignored(&descriptor.id) {
                debug!(rule = %rule.kind(), res_id = %descriptor.id, "resource ignored");
                continue;
            }

            let problems = combined
                .buckets
                .iter()
                .flat_map(|bucket| {
                    bucket
                        .matches
                        .iter()
                        .filter(|bm| bm.tags.get(&tag) == Some(&value))
                        .map(|bm| Problem {
                            bucket: bucket.key.clone(),
                            metric: bm.metric.clone(),
                            value: bm.value,
                        })
                })
                .collect();

            records.push(ProblemRecord {
                id: Uuid::new_v4().to_string(),
                rule_type: rule.kind(),
                res_id: descriptor.id.clone(),
                res_kind: descriptor.kind,
                name: descriptor.name.clone(),
                monitor_config: monitor_config.clone(),
                res_meta: payload("res_meta", &descriptor),
                problems,
                action: rule.settings.action().to_string(),
                updated_at: now,
            });
        }

        records
    }
}

/// Serializes a problem row payload. A failure is logged and stored as `null`.
fn payload<T: Serialize>(field: &str, value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        warn!(field, error = %e, "failed to serialize problem payload");
        serde_json::Value::Null
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combinator::MatchBucket;

    fn vm(id: &str, metric: &str, value: f64) -> EvalMatch {
        EvalMatch::new(metric, value).tag("vm_id", id).tag("vm_name", format!("name-{id}"))
    }

    fn lookups() -> LookupRegistry {
        LookupRegistry::from_descriptors(vec![
            ResourceDescriptor::new(ResourceKind::Vm, "i-1", "web1"),
            ResourceDescriptor::new(ResourceKind::Vm, "i-2", "web2"),
            ResourceDescriptor::new(ResourceKind::Host, "h-1", "node-1"),
        ])
    }

    fn combined(buckets: Vec<Vec<EvalMatch>>) -> CombinedResult {
        CombinedResult {
            firing: true,
            buckets: buckets
                .into_iter()
                .enumerate()
                .map(|(index, matches)| MatchBucket {
                    key: format!("f--{index}"),
                    index,
                    matches,
                })
                .collect(),
            ..CombinedResult::default()
        }
    }

    fn rule() -> RuleConfig {
        RuleConfig::defaults().remove(0)
    }

    mod catalog_tests {
        use super::*;

        #[test]
        fn unknown_id_is_lookup_error() {
            let catalog = StaticCatalog::new(ResourceKind::Vm);
            match catalog.get_by_id("i-404") {
                Err(AlertError::Lookup { kind, id, .. }) => {
                    assert_eq!(kind, "vm");
                    assert_eq!(id, "i-404");
                }
                _ => panic!("expected Lookup error"),
            }
        }

        #[test]
        fn rejects_foreign_kind() {
            let catalog = StaticCatalog::new(ResourceKind::Vm);
            let err = catalog.insert(ResourceDescriptor::new(ResourceKind::Host, "h-1", "n"));
            assert!(err.is_err());
            assert!(catalog.is_empty());
        }

        #[test]
        fn registry_groups_by_kind() {
            let registry = lookups();
            assert_eq!(registry.get(ResourceKind::Vm).unwrap().get_by_id("i-2").unwrap().name, "web2");
            assert!(matches!(
                registry.get(ResourceKind::Oss),
                Err(AlertError::NotFound { .. })
            ));
        }
    }

    mod map_tests {
        use super::*;

        #[test]
        fn builds_row_per_canonical_match() {
            let drivers = DriverRegistry::with_defaults();
            let lookups = lookups();
            let mapper = ResourceMapper::new(&drivers, &lookups);

            let result = combined(vec![
                vec![vm("i-1", "vm_cpu.usage_active", 3.0), vm("i-2", "vm_cpu.usage_active", 4.0)],
                vec![vm("i-1", "vm_mem.used_percent", 12.0)],
            ]);

            let rows = mapper.map(&rule(), &result, Utc::now());
            assert_eq!(rows.len(), 2);

            let web1 = rows.iter().find(|r| r.res_id == "i-1").unwrap();
            assert_eq!(web1.name, "web1");
            assert_eq!(web1.res_kind, ResourceKind::Vm);
            assert_eq!(web1.problems.len(), 2);
            assert_eq!(web1.problems[1].bucket, "f--1");
            assert_eq!(web1.problems[1].metric, "vm_mem.used_percent");

            let web2 = rows.iter().find(|r| r.res_id == "i-2").unwrap();
            assert_eq!(web2.problems.len(), 1);
        }

        #[test]
        fn first_resolving_identity_tag_wins() {
            let drivers = DriverRegistry::with_defaults();
            let lookups = lookups();
            let mapper = ResourceMapper::new(&drivers, &lookups);

            // host_id sorts first but the vm lookup only knows i-1.
            let m = EvalMatch::new("vm_cpu.usage_active", 2.0)
                .tag("host_id", "h-1")
                .tag("vm_id", "i-1");
            let (tag, value, descriptor) = mapper.resolve(&m).unwrap().unwrap();
            assert_eq!(tag, "vm_id");
            assert_eq!(value, "i-1");
            assert_eq!(descriptor.name, "web1");
        }

        #[test]
        fn unresolvable_matches_are_skipped() {
            let drivers = DriverRegistry::with_defaults();
            let lookups = lookups();
            let mapper = ResourceMapper::new(&drivers, &lookups);

            let result = combined(vec![vec![
                vm("i-404", "vm_cpu.usage_active", 1.0),
                EvalMatch::new("x.y", 1.0).tag("zone", "z1"),
                vm("i-1", "vm_cpu.usage_active", 1.0),
            ]]);

            let rows = mapper.map(&rule(), &result, Utc::now());
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].res_id, "i-1");
        }

        #[test]
        fn ignored_resources_are_dropped() {
            let drivers = DriverRegistry::with_defaults();
            let lookups = lookups();
            let mapper = ResourceMapper::new(&drivers, &lookups);
            let mut rule = rule();
            rule.ignored.insert("i-1".to_string());

            let result = combined(vec![vec![vm("i-1", "vm_cpu.usage_active", 1.0)]]);
            assert!(mapper.map(&rule, &result, Utc::now()).is_empty());
        }

        #[test]
        fn row_carries_rule_settings_and_action() {
            let drivers = DriverRegistry::with_defaults();
            let lookups = lookups();
            let mapper = ResourceMapper::new(&drivers, &lookups);
            let rule = rule();

            let result = combined(vec![vec![vm("i-1", "vm_cpu.usage_active", 1.0)]]);
            let rows = mapper.map(&rule, &result, Utc::now());

            assert_eq!(rows[0].rule_type, rule.kind());
            assert_eq!(rows[0].action, rule.settings.action());
            assert_eq!(rows[0].monitor_config["type"], "scale_down");
            assert_eq!(rows[0].res_meta["id"], "i-1");
        }
    }

    mod payload_tests {
        use super::*;

        struct Unserializable;

        impl Serialize for Unserializable {
            fn serialize<S: serde::Serializer>(&self, _serializer: S) -> std::result::Result<S::Ok, S::Error> {
                Err(serde::ser::Error::custom("opaque handle"))
            }
        }

        #[test]
        fn serializes_descriptor() {
            let descriptor = ResourceDescriptor::new(ResourceKind::Vm, "i-1", "web1");
            let value = payload("res_meta", &descriptor);
            assert_eq!(value["id"], "i-1");
            assert_eq!(value["name"], "web1");
        }

        #[test]
        fn failure_becomes_null() {
            assert_eq!(payload("res_meta", &Unserializable), serde_json::Value::Null);
        }
    }
}
