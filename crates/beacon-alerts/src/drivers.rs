//! Identity drivers.
//!
//! A [`DriverFactory`] recognises one tag shape (e.g. "has `vm_id`") and turns
//! a match of that shape into a [`ResourceDriver`] carrying the resource's
//! unique `{kind, name}` key. The [`DriverRegistry`] dispatches a match to the
//! single factory that claims it; predicates are expected to be mutually
//! exclusive, and an ambiguous match is an error rather than a guess.

use tracing::debug;

use crate::error::{AlertError, Result};
use crate::records::{ResourceKey, ResourceKind};
use crate::types::EvalMatch;

/// Resolves a match to a concrete resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDriver {
    key: ResourceKey,
    identity_tag: String,
    identity_value: String,
}

impl ResourceDriver {
    /// Creates a driver.
    #[must_use]
    pub fn new(
        key: ResourceKey,
        identity_tag: impl Into<String>,
        identity_value: impl Into<String>,
    ) -> Self {
        Self {
            key,
            identity_tag: identity_tag.into(),
            identity_value: identity_value.into(),
        }
    }

    /// Returns the `{kind, name}` idempotency key.
    #[must_use]
    pub const fn unique_key(&self) -> &ResourceKey {
        &self.key
    }

    /// Returns the resource kind.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        self.key.kind
    }

    /// Returns the tag the identity was read from, e.g. `vm_id`.
    #[must_use]
    pub fn identity_tag(&self) -> &str {
        &self.identity_tag
    }

    /// Returns the external identity value.
    #[must_use]
    pub fn identity_value(&self) -> &str {
        &self.identity_value
    }
}

/// Recognises one tag shape.
pub trait DriverFactory: Send + Sync {
    /// The resource kind this factory produces.
    fn kind(&self) -> ResourceKind;

    /// Returns true if the match has this factory's tag shape.
    fn matches(&self, m: &EvalMatch) -> bool;

    /// Builds a driver for a match this factory claimed.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::NotFound` if the match lacks the identity tag.
    fn driver_for(&self, m: &EvalMatch) -> Result<ResourceDriver>;
}

/// A factory keyed on the presence and absence of tags.
///
/// The resource name is read from `{prefix}_name`, then `name`, then the
/// identity value itself.
#[derive(Debug, Clone)]
pub struct TagShapeFactory {
    kind: ResourceKind,
    identity_tag: &'static str,
    name_tag: &'static str,
    excluded: &'static [&'static str],
}

impl TagShapeFactory {
    /// Creates a factory requiring `identity_tag` and none of `excluded`.
    #[must_use]
    pub const fn new(
        kind: ResourceKind,
        identity_tag: &'static str,
        name_tag: &'static str,
        excluded: &'static [&'static str],
    ) -> Self {
        Self {
            kind,
            identity_tag,
            name_tag,
            excluded,
        }
    }

    /// The built-in factories, one per [`ResourceKind`].
    #[must_use]
    pub fn builtin() -> Vec<Self> {
        const NOT_VM: &[&str] = &["vm_id"];
        const NOT_COMPUTE: &[&str] = &["vm_id", "host_id"];
        const ACCOUNT_ONLY: &[&str] = &[
            "vm_id",
            "host_id",
            "dbinstance_id",
            "elasticcache_id",
            "bucket_id",
            "storage_id",
        ];

        vec![
            Self::new(ResourceKind::Vm, "vm_id", "vm_name", &[]),
            Self::new(ResourceKind::Host, "host_id", "host_name", NOT_VM),
            Self::new(ResourceKind::Rds, "dbinstance_id", "dbinstance_name", NOT_COMPUTE),
            Self::new(ResourceKind::Redis, "elasticcache_id", "elasticcache_name", NOT_COMPUTE),
            Self::new(ResourceKind::Oss, "bucket_id", "bucket_name", NOT_COMPUTE),
            Self::new(ResourceKind::Storage, "storage_id", "storage_name", NOT_COMPUTE),
            Self::new(
                ResourceKind::Cloudaccount,
                "cloudaccount_id",
                "cloudaccount_name",
                ACCOUNT_ONLY,
            ),
        ]
    }
}

impl DriverFactory for TagShapeFactory {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    fn matches(&self, m: &EvalMatch) -> bool {
        m.tags.contains_key(self.identity_tag)
            && !self.excluded.iter().any(|t| m.tags.contains_key(*t))
    }

    fn driver_for(&self, m: &EvalMatch) -> Result<ResourceDriver> {
        let id = m
            .tags
            .get(self.identity_tag)
            .ok_or_else(|| AlertError::not_found(format!("tag {} on match", self.identity_tag)))?;
        let name = m
            .tags
            .get(self.name_tag)
            .or_else(|| m.tags.get("name"))
            .unwrap_or(id);

        Ok(ResourceDriver::new(
            ResourceKey::new(self.kind, name.clone()),
            self.identity_tag,
            id.clone(),
        ))
    }
}

/// Dispatch table from tag shapes to resource kinds.
///
/// Built once at startup and shared; there is no global registry.
#[derive(Default)]
pub struct DriverRegistry {
    factories: Vec<Box<dyn DriverFactory>>,
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field(
                "kinds",
                &self.factories.iter().map(|f| f.kind()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl DriverRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in factories.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for factory in TagShapeFactory::builtin() {
            registry.register(Box::new(factory));
        }
        registry
    }

    /// Adds a factory.
    pub fn register(&mut self, factory: Box<dyn DriverFactory>) {
        debug!(kind = %factory.kind(), "registered driver factory");
        self.factories.push(factory);
    }

    /// Returns the number of registered factories.
    #[must_use]
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Returns true if no factory is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Resolves the driver for a match.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::NotFound` if no factory claims the match and
    /// `AlertError::DuplicateMatch` if more than one does.
    pub fn resolve(&self, m: &EvalMatch) -> Result<ResourceDriver> {
        let mut claimed = self.factories.iter().filter(|f| f.matches(m));

        let Some(factory) = claimed.next() else {
            return Err(AlertError::not_found(format!(
                "driver for tags {:?}",
                m.tags.keys().collect::<Vec<_>>()
            )));
        };

        let others: Vec<ResourceKind> = claimed.map(|f| f.kind()).collect();
        if !others.is_empty() {
            return Err(AlertError::DuplicateMatch {
                what: format!(
                    "tags {:?} claimed by {} and {:?}",
                    m.tags.keys().collect::<Vec<_>>(),
                    factory.kind(),
                    others
                ),
            });
        }

        factory.driver_for(m)
    }
}
