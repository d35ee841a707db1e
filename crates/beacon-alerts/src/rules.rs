//! Rule and alert configuration.
//!
//! A [`RuleConfig`] drives one scheduled reconciliation per [`RuleKind`].
//! Its settings are a tagged union resolved by the `type` discriminant, so a
//! `scale_down` rule can only ever carry scale-down settings.
//!
//! An [`AlertDefinition`] is a monitored alert whose evaluations are committed
//! as [`AlertRecord`](crate::records::AlertRecord)s.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AlertError, Result};
use crate::types::{ComparisonOperator, Condition, Evaluator, Operator, validate_conditions};

/// Default scheduling period of a rule.
pub const DEFAULT_PERIOD: &str = "12h";

/// Default lookback window of a rule.
pub const DEFAULT_TIME_FROM: &str = "24h";

/// Default lookback window of an alert.
pub const DEFAULT_ALERT_TIME_FROM: &str = "5m";

/// Default evaluation interval of an alert.
pub const DEFAULT_ALERT_INTERVAL: &str = "1m";

/// Parses durations like `30s`, `5m`, `12h`, `1d` and `1d12h`.
///
/// # Errors
///
/// Returns `AlertError::Validation` for empty input, a missing or unknown
/// unit, or a number without a unit.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(AlertError::validation("duration cannot be empty"));
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    for c in input.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit_secs = match c {
            'd' => 86_400,
            'h' => 3_600,
            'm' => 60,
            's' => 1,
            other => {
                return Err(AlertError::validation(format!(
                    "invalid duration '{input}': unknown unit '{other}'"
                )));
            }
        };
        let amount: u64 = digits.parse().map_err(|_| {
            AlertError::validation(format!("invalid duration '{input}': unit without a number"))
        })?;
        total = amount
            .checked_mul(unit_secs)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(|| AlertError::validation(format!("duration '{input}' overflows")))?;
        digits.clear();
    }

    if !digits.is_empty() {
        return Err(AlertError::validation(format!(
            "invalid duration '{input}': trailing number without a unit"
        )));
    }

    Ok(Duration::from_secs(total))
}

/// The type of a scheduled rule. At most one rule exists per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Finds resources that are consistently underused.
    ScaleDown,
    /// Finds resources that are consistently overloaded.
    ScaleUp,
}

impl RuleKind {
    /// All kinds.
    pub const ALL: [Self; 2] = [Self::ScaleDown, Self::ScaleUp];

    /// Returns the kind as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ScaleDown => "scale_down",
            Self::ScaleUp => "scale_up",
        }
    }
}

impl std::fmt::Display for RuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RuleKind {
    type Err = AlertError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scale_down" => Ok(Self::ScaleDown),
            "scale_up" => Ok(Self::ScaleUp),
            other => Err(AlertError::not_found(format!("rule type '{other}'"))),
        }
    }
}

/// Settings shared by the scaling rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleSettings {
    /// Ordered conditions combined with their operators.
    pub conditions: Vec<Condition>,
    /// Overrides the default remediation text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

/// Per-type rule settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleSettings {
    /// Settings of a [`RuleKind::ScaleDown`] rule.
    ScaleDown(ScaleSettings),
    /// Settings of a [`RuleKind::ScaleUp`] rule.
    ScaleUp(ScaleSettings),
}

impl RuleSettings {
    /// Returns the rule type these settings belong to.
    #[must_use]
    pub const fn kind(&self) -> RuleKind {
        match self {
            Self::ScaleDown(_) => RuleKind::ScaleDown,
            Self::ScaleUp(_) => RuleKind::ScaleUp,
        }
    }

    /// Returns the ordered conditions.
    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        match self {
            Self::ScaleDown(s) | Self::ScaleUp(s) => &s.conditions,
        }
    }

    /// Returns the remediation text.
    #[must_use]
    pub fn action(&self) -> &str {
        match self {
            Self::ScaleDown(s) => s
                .action
                .as_deref()
                .unwrap_or("downsize to a smaller instance specification"),
            Self::ScaleUp(s) => s
                .action
                .as_deref()
                .unwrap_or("upsize to a larger instance specification"),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_period() -> String {
    DEFAULT_PERIOD.to_string()
}

fn default_time_from() -> String {
    DEFAULT_TIME_FROM.to_string()
}

/// A scheduled reconciliation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Display name.
    pub name: String,
    /// Disabled rules are never scheduled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// How often the rule runs, e.g. `12h`.
    #[serde(default = "default_period")]
    pub period: String,
    /// Lookback window of every query, e.g. `24h`.
    #[serde(default = "default_time_from")]
    pub time_from: String,
    /// Per-type settings.
    pub settings: RuleSettings,
    /// External resource IDs whose problems are suppressed.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub ignored: BTreeSet<String>,
}

impl RuleConfig {
    /// Creates an enabled rule with default period and lookback.
    #[must_use]
    pub fn new(name: impl Into<String>, settings: RuleSettings) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            period: default_period(),
            time_from: default_time_from(),
            settings,
            ignored: BTreeSet::new(),
        }
    }

    /// Returns the rule type.
    #[must_use]
    pub const fn kind(&self) -> RuleKind {
        self.settings.kind()
    }

    /// Returns the parsed scheduling period.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Validation` if the period is malformed.
    pub fn period(&self) -> Result<Duration> {
        parse_duration(&self.period)
    }

    /// Returns the parsed lookback window.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Validation` if the window is malformed.
    pub fn time_from(&self) -> Result<Duration> {
        parse_duration(&self.time_from)
    }

    /// Returns true if problems for `res_id` are suppressed.
    #[must_use]
    pub fn is_ignored(&self, res_id: &str) -> bool {
        self.ignored.contains(res_id)
    }

    /// Validates the rule.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Validation` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AlertError::validation("rule name cannot be empty"));
        }
        if self.period()?.is_zero() {
            return Err(AlertError::validation(format!(
                "rule '{}' period must be positive",
                self.name
            )));
        }
        if self.time_from()?.is_zero() {
            return Err(AlertError::validation(format!(
                "rule '{}' time_from must be positive",
                self.name
            )));
        }
        validate_conditions(self.settings.conditions())
            .map_err(|e| AlertError::validation(format!("rule '{}': {e}", self.name)))
    }

    /// Returns the built-in rules.
    #[must_use]
    pub fn defaults() -> Vec<Self> {
        let scale_down = ScaleSettings {
            conditions: vec![
                Condition::new(
                    "vm_cpu",
                    "usage_active",
                    Evaluator::threshold(ComparisonOperator::LessThan, 10.0),
                )
                .group_by("vm_id"),
                Condition::new(
                    "vm_mem",
                    "used_percent",
                    Evaluator::threshold(ComparisonOperator::LessThan, 20.0),
                )
                .group_by("vm_id"),
            ],
            action: None,
        };
        let scale_up = ScaleSettings {
            conditions: vec![
                Condition::new(
                    "vm_cpu",
                    "usage_active",
                    Evaluator::threshold(ComparisonOperator::GreaterThan, 80.0),
                )
                .group_by("vm_id"),
                Condition::new(
                    "vm_mem",
                    "used_percent",
                    Evaluator::threshold(ComparisonOperator::GreaterThan, 90.0),
                )
                .group_by("vm_id")
                .operator(Operator::Or),
            ],
            action: None,
        };

        vec![
            Self::new("idle instances", RuleSettings::ScaleDown(scale_down)),
            Self::new("overloaded instances", RuleSettings::ScaleUp(scale_up)),
        ]
    }
}

fn default_alert_time_from() -> String {
    DEFAULT_ALERT_TIME_FROM.to_string()
}

fn default_alert_interval() -> String {
    DEFAULT_ALERT_INTERVAL.to_string()
}

/// A monitored alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertDefinition {
    /// Alert ID.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Disabled alerts are never evaluated.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Ordered conditions combined with their operators.
    pub conditions: Vec<Condition>,
    /// Lookback window of every query.
    #[serde(default = "default_alert_time_from")]
    pub time_from: String,
    /// How often the alert is evaluated.
    #[serde(default = "default_alert_interval")]
    pub interval: String,
}

impl AlertDefinition {
    /// Creates an enabled alert with default lookback and interval.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, conditions: Vec<Condition>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            enabled: true,
            conditions,
            time_from: default_alert_time_from(),
            interval: default_alert_interval(),
        }
    }

    /// Returns the parsed lookback window.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Validation` if the window is malformed.
    pub fn time_from(&self) -> Result<Duration> {
        parse_duration(&self.time_from)
    }

    /// Returns the parsed evaluation interval.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Validation` if the interval is malformed.
    pub fn interval(&self) -> Result<Duration> {
        parse_duration(&self.interval)
    }

    /// Validates the alert.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Validation` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(AlertError::validation("alert id cannot be empty"));
        }
        if self.interval()?.is_zero() || self.time_from()?.is_zero() {
            return Err(AlertError::validation(format!(
                "alert '{}' interval and time_from must be positive",
                self.id
            )));
        }
        validate_conditions(&self.conditions)
            .map_err(|e| AlertError::validation(format!("alert '{}': {e}", self.id)))
    }
}
