//! Rule actions
//!
//! The rule engine's output vocabulary. Each variant is a discriminated
//! record: the consumer matches on the tag and reads only the fields
//! documented for that variant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{AlertLevel, AlertSpec};

/// Declarative action emitted by a rule.
///
/// The alert service consumes `CreateAlert`, `ResolveAlerts`,
/// `Notification`, and `WeatherAlert`; the remaining variants are part of
/// the wire vocabulary and are logged until a consumer lands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RuleAction {
    #[serde(rename = "CREATE_ALERT")]
    CreateAlert { data: AlertSpec },

    /// Resolve every active, auto-resolvable, unacknowledged alert with
    /// this trigger.
    #[serde(rename = "RESOLVE_ALERT", alias = "RESOLVE_ALERTS")]
    ResolveAlerts {
        trigger: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },

    /// Informational broadcast; no alert record is created.
    #[serde(rename = "NOTIFICATION")]
    Notification {
        category: String,
        severity: AlertLevel,
        message: String,
    },

    #[serde(rename = "WEATHER_ALERT")]
    WeatherAlert {
        severity: AlertLevel,
        code: String,
        message: String,
    },

    #[serde(rename = "CREW_ALERT")]
    CrewAlert { message: String },

    #[serde(rename = "SET_SYNC_PROFILE")]
    SetSyncProfile { config: Value },
}

/// A rule action stamped with its provenance by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRecord {
    #[serde(flatten)]
    pub action: RuleAction,
    pub rule_id: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_tag_round_trip() {
        let action = RuleAction::ResolveAlerts {
            trigger: "ais_proximity".to_string(),
            data: None,
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "RESOLVE_ALERT");

        // The legacy plural tag parses to the same variant.
        let parsed: RuleAction =
            serde_json::from_str(r#"{"type":"RESOLVE_ALERTS","trigger":"x"}"#).unwrap();
        assert!(matches!(parsed, RuleAction::ResolveAlerts { .. }));
    }

    #[test]
    fn test_action_record_flattens() {
        let record = ActionRecord {
            action: RuleAction::CrewAlert {
                message: "all hands".to_string(),
            },
            rule_id: "crew-call".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "CREW_ALERT");
        assert_eq!(json["ruleId"], "crew-call");
    }
}
