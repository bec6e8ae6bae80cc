//! Alert records and lifecycle enums
//!
//! An alert is created by the alert service from a rule action, lives in
//! `alerts.active` until it is resolved (automatically or by command), and
//! then moves to `alerts.resolved`. The record is a wire type: clients see
//! it verbatim in full-state snapshots and patches, so field names are
//! camelCase and timestamps are ISO-8601.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Alert severity, ordered least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    #[default]
    Info,
    Warning,
    Critical,
    Emergency,
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertLevel::Info => write!(f, "info"),
            AlertLevel::Warning => write!(f, "warning"),
            AlertLevel::Critical => write!(f, "critical"),
            AlertLevel::Emergency => write!(f, "emergency"),
        }
    }
}

/// Where an alert is in its lifecycle.
///
/// `status == Resolved` exactly when the record lives in `alerts.resolved`.
/// `Expired` is terminal for auto-expire notices and only ever appears in
/// the patch that removes the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    #[default]
    Active,
    Resolved,
    Expired,
}

/// A tracked alert record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// Process-unique id (UUID v4).
    pub id: String,
    /// Domain kind, e.g. "anchor", "ais", "weather", "system".
    #[serde(rename = "type")]
    pub alert_type: String,
    /// Grouping for client display, e.g. "navigation", "environment".
    pub category: String,
    /// Component that raised the alert, e.g. "rule-engine".
    pub source: String,
    pub level: AlertLevel,
    /// Short human title (push notification title).
    pub label: String,
    /// Full human message (push notification body).
    pub message: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
    pub muted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub muted_until: Option<DateTime<Utc>>,
    pub status: AlertStatus,
    /// Short string key identifying the domain condition
    /// ("critical_range", "anchor_dragging", "ais_proximity", ...).
    /// Used for deduplication and resolution targeting.
    pub trigger: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    /// Opaque payload forwarded to clients and push notifications.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    /// Client-side action descriptors (buttons, deep links). Opaque here.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Value>,
    /// Whether this alert should fan out to push providers.
    pub phone_notification: bool,
    /// Sticky alerts stay visible until explicitly dismissed by the user.
    pub sticky: bool,
    /// Whether a resolution rule may close this alert automatically.
    pub auto_resolvable: bool,
    /// Whether the expiry sweep may remove this alert.
    #[serde(default)]
    pub auto_expire: bool,
    /// Lifetime in milliseconds from creation (with `auto_expire`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution_data: Option<Value>,
}

impl Alert {
    /// True when this alert blocks a new alert for the same trigger:
    /// active and not yet acknowledged by the user.
    pub fn is_open_for_trigger(&self, trigger: &str) -> bool {
        self.status == AlertStatus::Active && !self.acknowledged && self.trigger == trigger
    }
}

/// Partial alert data carried by a `CreateAlert` rule action.
///
/// The alert service merges this over its record template; everything left
/// `None` takes the template default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertSpec {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub alert_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<AlertLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_notification: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sticky: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_resolvable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_expire: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
}
