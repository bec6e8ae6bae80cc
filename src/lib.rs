//! Pelorus: onboard marine telemetry relay
//!
//! Single-node appliance server that ingests live data (BLE sensor
//! broadcasts, navigation feeds, weather and tide providers), maintains
//! one authoritative application state, evaluates anchor-watch and
//! proximity rules over it, and replicates changes to clients - with push
//! notifications for devices without a live transport.
//!
//! ## Architecture
//!
//! - **State core**: single-writer document mutated through JSON-Patch,
//!   replicated as incremental patches plus gated full snapshots
//! - **Rule engine**: dependency-indexed, debounced evaluation of domain
//!   rules; emits declarative actions
//! - **Alert service**: alert lifecycle, push token store, provider
//!   dispatch (APNS / FCM / Expo)
//! - **BLE**: parser registry, Victron AES-CTR codec, scan/rest loop

pub mod alerts;
pub mod ble;
pub mod config;
pub mod feeds;
pub mod rules;
pub mod state;
pub mod storage;
pub mod types;

// Re-export the component entry points
pub use alerts::{AlertHandle, AlertService};
pub use rules::RuleEngine;
pub use state::{ReplicationEvent, StateCore, StateHandle};

// Re-export commonly used types
pub use types::{
    ActionRecord, Alert, AlertLevel, AlertSpec, AlertStatus, Position, RuleAction,
    SensorRecord, UpdateKind,
};
