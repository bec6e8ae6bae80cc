//! Shared data structures for the relay core
//!
//! This module defines the types that cross component boundaries:
//! - Alert records and their lifecycle enums (alert service, rules, clients)
//! - Rule actions (rule engine -> alert service)
//! - Decoded sensor records (BLE parsers -> state core)
//! - Geographic primitives shared by the rule set

mod alert;
mod action;
mod sensor;

pub use alert::*;
pub use action::*;
pub use sensor::*;

use serde::{Deserialize, Serialize};

// ============================================================================
// Geographic Primitives
// ============================================================================

/// A WGS-84 coordinate pair.
///
/// Positions arrive from the navigation feed and from AIS target records.
/// Missing fields deserialize as `None` so a partially-populated target
/// never aborts rule evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

// ============================================================================
// Distance Units
// ============================================================================

/// User-facing distance unit preference (`units.distance` in the document).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceUnit {
    #[default]
    Meters,
    Feet,
}

impl DistanceUnit {
    /// Parse the document's `units.distance` string; unknown values fall
    /// back to meters.
    pub fn parse(s: &str) -> Self {
        match s {
            "feet" => Self::Feet,
            _ => Self::Meters,
        }
    }

    /// Short display suffix ("m" / "ft").
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Meters => "m",
            Self::Feet => "ft",
        }
    }

    /// Convert a distance in meters to this unit.
    pub fn from_meters(self, meters: f64) -> f64 {
        match self {
            Self::Meters => meters,
            Self::Feet => meters * 3.280_84,
        }
    }
}

/// Format a distance (given in meters) for alert messages, e.g. `"30 m"`.
///
/// Values are rounded to the nearest whole unit - alert text is for humans
/// standing in a cockpit, not for navigation.
pub fn format_distance(meters: f64, unit: DistanceUnit) -> String {
    format!("{:.0} {}", unit.from_meters(meters), unit.suffix())
}

// ============================================================================
// Update Kind
// ============================================================================

/// Classifies a state mutation for replication (`updateType` on the wire)
/// and selects the BLE batching window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    /// First sighting of a BLE device (1000 ms batch window).
    Discovery,
    /// Refresh of an already-known BLE device (250 ms batch window).
    Update,
    /// Decoded sensor payload for a selected device.
    Sensor,
    /// User-supplied device metadata (label, notes, encryption key).
    Metadata,
}

impl UpdateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Update => "update",
            Self::Sensor => "sensor",
            Self::Metadata => "metadata",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_unit_parse() {
        assert_eq!(DistanceUnit::parse("meters"), DistanceUnit::Meters);
        assert_eq!(DistanceUnit::parse("feet"), DistanceUnit::Feet);
        assert_eq!(DistanceUnit::parse("fathoms"), DistanceUnit::Meters);
    }

    #[test]
    fn test_format_distance() {
        assert_eq!(format_distance(30.2, DistanceUnit::Meters), "30 m");
        assert_eq!(format_distance(30.0, DistanceUnit::Feet), "98 ft");
    }

    #[test]
    fn test_update_kind_wire_form() {
        let json = serde_json::to_string(&UpdateKind::Discovery).unwrap();
        assert_eq!(json, "\"discovery\"");
    }
}
