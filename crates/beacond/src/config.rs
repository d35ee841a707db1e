//! Daemon configuration.
//!
//! Loaded from a TOML file:
//! - engine tunables and the decay sweep interval
//! - data files: resource inventory, metric samples, state snapshot
//! - rule and alert definitions

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use beacon_alerts::{AlertDefinition, EngineConfig, RuleConfig};
use serde::{Deserialize, Serialize};

use crate::error::{DaemonError, Result};

/// Engine and scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineSection {
    /// How long an alerting joint keeps its resource alerting (in seconds).
    pub alerting_decay_secs: i64,
    /// How often resource statuses are re-derived (in seconds).
    pub sweep_interval_secs: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            alerting_decay_secs: EngineConfig::default().alerting_decay_secs,
            sweep_interval_secs: 60,
        }
    }
}

impl EngineSection {
    /// Converts to the engine's configuration.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            alerting_decay_secs: self.alerting_decay_secs,
        }
    }

    /// Returns the sweep interval.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Data files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DataSection {
    /// JSON array of resource descriptors served by the lookups.
    pub inventory: Option<PathBuf>,
    /// Newline-delimited JSON metric samples loaded at startup.
    pub samples: Option<PathBuf>,
    /// JSON snapshot of problems, resources, joints and records.
    pub snapshot: Option<PathBuf>,
    /// How long metric samples are kept (in hours).
    pub retention_hours: u64,
}

impl Default for DataSection {
    fn default() -> Self {
        Self {
            inventory: None,
            samples: None,
            snapshot: None,
            retention_hours: 24,
        }
    }
}

/// Main daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonConfig {
    /// Engine settings.
    #[serde(default)]
    pub engine: EngineSection,
    /// Data files.
    #[serde(default)]
    pub data: DataSection,
    /// Rule definitions, at most one per type.
    #[serde(default = "RuleConfig::defaults")]
    pub rules: Vec<RuleConfig>,
    /// Alert definitions.
    #[serde(default)]
    pub alerts: Vec<AlertDefinition>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            engine: EngineSection::default(),
            data: DataSection::default(),
            rules: RuleConfig::defaults(),
            alerts: Vec::new(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a TOML file.
    ///
    /// Relative data paths are resolved against the file's directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DaemonError::Config(format!(
                "failed to read config file '{}': {e}",
                path.display()
            ))
        })?;

        let mut config = Self::from_toml(&content)?;
        if let Some(base) = path.parent() {
            config.data.resolve_against(base);
        }
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| DaemonError::Config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if a value cannot be represented in TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DaemonError::Config(format!("failed to serialize config: {e}")))
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.engine.sweep_interval_secs == 0 {
            return Err(DaemonError::Config(
                "sweep_interval_secs must be positive".to_string(),
            ));
        }
        if self.engine.alerting_decay_secs <= 0 {
            return Err(DaemonError::Config(
                "alerting_decay_secs must be positive".to_string(),
            ));
        }
        if self.data.retention_hours == 0 {
            return Err(DaemonError::Config(
                "retention_hours must be positive".to_string(),
            ));
        }

        let mut kinds = HashSet::new();
        for rule in &self.rules {
            rule.validate()?;
            if !kinds.insert(rule.kind()) {
                return Err(DaemonError::Config(format!(
                    "rule type {} is configured more than once",
                    rule.kind()
                )));
            }
        }

        let mut ids = HashSet::new();
        for alert in &self.alerts {
            alert.validate()?;
            if !ids.insert(alert.id.as_str()) {
                return Err(DaemonError::Config(format!(
                    "alert id '{}' is configured more than once",
                    alert.id
                )));
            }
        }

        Ok(())
    }
}

impl DataSection {
    fn resolve_against(&mut self, base: &Path) {
        for path in [&mut self.inventory, &mut self.samples, &mut self.snapshot]
            .into_iter()
            .flatten()
        {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    /// Returns the metric retention.
    #[must_use]
    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_alerts::RuleKind;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
[engine]
sweep_interval_secs = 30

[data]
inventory = "inventory.json"
snapshot = "/var/lib/beacon/state.json"

[[rules]]
name = "hot vms"
period = "1h"

[rules.settings]
type = "scale_up"

[[rules.settings.conditions]]
query = { measurement = "vm_cpu", field = "usage_active", group_by = ["vm_id"] }
evaluator = { type = "threshold", op = ">", threshold = 85.0 }

[[alerts]]
id = "a1"
name = "cpu"
interval = "30s"

[[alerts.conditions]]
query = { measurement = "vm_cpu", field = "usage_active", group_by = ["vm_id", "vm_name"] }
reducer = "max"
evaluator = { type = "threshold", op = ">", threshold = 95.0 }
"#;

    #[test]
    fn parses_full_file() {
        let config = DaemonConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.engine.sweep_interval_secs, 30);
        assert_eq!(config.engine.alerting_decay_secs, 1800);
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].kind(), RuleKind::ScaleUp);
        assert_eq!(config.rules[0].time_from, "24h");
        assert_eq!(config.alerts[0].interval().unwrap(), Duration::from_secs(30));
        assert_eq!(config.alerts[0].time_from, "5m");
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = DaemonConfig::from_toml("").unwrap();
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.data.retention(), Duration::from_secs(86_400));
    }

    #[test]
    fn default_config_survives_toml() {
        let config = DaemonConfig::default();
        let parsed = DaemonConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn rejects_duplicate_rule_types() {
        let mut config = DaemonConfig::default();
        config.rules.push(config.rules[0].clone());
        match config.validate() {
            Err(DaemonError::Config(msg)) => assert!(msg.contains("more than once")),
            _ => panic!("expected Config error"),
        }
    }

    #[test]
    fn rejects_zero_sweep() {
        let mut config = DaemonConfig::default();
        config.engine.sweep_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_rule() {
        let toml = SAMPLE.replace("period = \"1h\"", "period = \"soon\"");
        assert!(matches!(
            DaemonConfig::from_toml(&toml),
            Err(DaemonError::Engine(_))
        ));
    }

    #[test]
    fn relative_paths_follow_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beacond.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = DaemonConfig::from_file(&path).unwrap();
        assert_eq!(config.data.inventory, Some(dir.path().join("inventory.json")));
        assert_eq!(
            config.data.snapshot,
            Some(PathBuf::from("/var/lib/beacon/state.json"))
        );
    }

    #[test]
    fn unreadable_or_malformed_file_is_config_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[engine").unwrap();
        assert!(matches!(
            DaemonConfig::from_file(file.path()),
            Err(DaemonError::Config(_))
        ));
        assert!(matches!(
            DaemonConfig::from_file("/nonexistent/beacond.toml"),
            Err(DaemonError::Config(_))
        ));
    }
}
