//! Decoded BLE sensor records and device projection
//!
//! A `SensorRecord` is the typed result of running a manufacturer-data
//! payload through a registered parser. Fields that the device reported as
//! "no reading" (all-ones sentinel at the field's bit width) are `None`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A decoded sensor broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SensorRecord {
    BatteryMonitor(BatteryMonitorRecord),
    SolarCharger(SolarChargerRecord),
    Inverter(InverterRecord),
    DcDcConverter(DcDcConverterRecord),
    SmartLithium(SmartLithiumRecord),
    /// Output of a JSON-configured layout parser: named fields only.
    Generic {
        model: String,
        fields: serde_json::Map<String, Value>,
    },
}

/// Victron battery monitor (BMV / SmartShunt) broadcast.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryMonitorRecord {
    /// Time-to-go in minutes.
    pub remaining_mins: Option<u16>,
    /// Battery voltage (V).
    pub voltage: Option<f64>,
    /// Raw alarm bitfield.
    pub alarm: Option<u16>,
    /// Auxiliary input raw value (meaning depends on `aux_mode`).
    pub aux: Option<u16>,
    /// 0 = aux voltage, 1 = mid voltage, 2 = temperature, 3 = disabled.
    pub aux_mode: u8,
    /// Battery current (A, negative = discharge).
    pub current: Option<f64>,
    /// Consumed charge (Ah).
    pub consumed_ah: Option<f64>,
    /// State of charge (%).
    pub soc: Option<f64>,
    /// Computed V * A (W); present only when both inputs are.
    pub power: Option<f64>,
}

/// Victron MPPT solar charger broadcast.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolarChargerRecord {
    pub device_state: Option<u8>,
    pub charger_error: Option<u8>,
    /// Battery voltage (V).
    pub battery_voltage: Option<f64>,
    /// Battery charging current (A).
    pub battery_current: Option<f64>,
    /// Yield today (kWh).
    pub yield_today: Option<f64>,
    /// Instantaneous PV power (W).
    pub pv_power: Option<f64>,
    /// Load output current (A).
    pub load_current: Option<f64>,
}

/// Victron Phoenix inverter broadcast.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InverterRecord {
    pub device_state: Option<u8>,
    pub alarm: Option<u16>,
    pub battery_voltage: Option<f64>,
    /// AC apparent power (VA).
    pub ac_apparent_power: Option<u16>,
    /// AC output voltage (V).
    pub ac_voltage: Option<f64>,
    /// AC output current (A).
    pub ac_current: Option<f64>,
}

/// Victron Orion DC/DC converter broadcast.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DcDcConverterRecord {
    pub device_state: Option<u8>,
    pub charger_error: Option<u8>,
    /// Input voltage (V).
    pub input_voltage: Option<f64>,
    /// Output voltage (V).
    pub output_voltage: Option<f64>,
    /// Raw off-reason bitfield.
    pub off_reason: Option<u32>,
}

/// Victron Smart Lithium battery broadcast.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartLithiumRecord {
    pub bms_flags: Option<u32>,
    pub error: Option<u16>,
    /// Per-cell voltages (V); cells the device did not report are absent.
    pub cell_voltages: Vec<Option<f64>>,
    pub battery_voltage: Option<f64>,
    pub balancer_status: Option<u8>,
    /// Battery temperature (degrees C).
    pub temperature: Option<f64>,
}

// ============================================================================
// BLE Device Projection
// ============================================================================

/// User-editable device metadata, applied via `bluetooth:update-metadata`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Hex-encoded 16-byte AES key for encrypted advertisements.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
}

/// A BLE device as projected into `bluetooth.devices.<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BleDevice {
    /// Stable device id (MAC address or platform identifier).
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub manufacturer_id: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i16>,
    pub last_seen: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensor_data: Option<SensorRecord>,
    #[serde(default)]
    pub metadata: DeviceMetadata,
}
