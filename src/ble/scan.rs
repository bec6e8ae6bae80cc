//! BLE scan loop
//!
//! Cycles scan (10 s) and rest (5 s) phases against an
//! [`AdvertisementSource`], which hides the actual radio. During a scan
//! phase advertisements are parsed and merged into a per-cycle map by
//! device id; at scan end the batch lands in the state core. Sensor
//! records for user-selected devices are pushed separately so clients get
//! them on the faster sensor channel.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{manufacturer_id, ParseOptions, ParserRegistry};
use crate::config::defaults::{REST_PHASE_SECS, SCAN_PHASE_SECS};
use crate::state::{StateError, StateHandle};
use crate::types::{BleDevice, DeviceMetadata, SensorRecord, UpdateKind};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("scan source error: {0}")]
    Source(String),

    #[error("scan source closed")]
    Closed,
}

/// One observed BLE advertisement.
#[derive(Debug, Clone)]
pub struct Advertisement {
    /// Stable device id (MAC address or platform identifier).
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub manufacturer_data: Vec<u8>,
}

/// Radio abstraction. `next_advertisement` returns `Ok(None)` when the
/// source is exhausted (replay reached EOF).
#[async_trait]
pub trait AdvertisementSource: Send {
    /// Called at each scan-phase start.
    async fn start_scan(&mut self) -> Result<(), ScanError> {
        Ok(())
    }

    /// Called at each scan-phase end.
    async fn stop_scan(&mut self) -> Result<(), ScanError> {
        Ok(())
    }

    async fn next_advertisement(&mut self) -> Result<Option<Advertisement>, ScanError>;

    fn source_name(&self) -> &str;
}

/// Per-device settings snapshotted from the document at cycle start.
#[derive(Default)]
struct CycleConfig {
    encryption_keys: HashMap<String, Vec<u8>>,
    selected: HashSet<String>,
}

/// The scan/rest cycle task.
pub struct ScanLoop<S: AdvertisementSource> {
    source: S,
    registry: ParserRegistry,
    state: StateHandle,
    /// Ids seen in earlier cycles; first sight is a discovery.
    known: HashSet<String>,
}

impl<S: AdvertisementSource> ScanLoop<S> {
    pub fn new(source: S, registry: ParserRegistry, state: StateHandle) -> Self {
        Self {
            source,
            registry,
            state,
            known: HashSet::new(),
        }
    }

    /// Run scan/rest cycles until cancellation or source exhaustion.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(source = self.source.source_name(), "BLE scan loop started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let config = self.cycle_config().await;

            let _ = self.state.update_bluetooth_scanning_status(true).await;
            if let Err(e) = self.source.start_scan().await {
                warn!(error = %e, "Failed to start scan - resting");
                if !self.rest(&cancel).await {
                    break;
                }
                continue;
            }

            let exhausted = match self.scan_phase(&cancel, &config).await {
                Ok(exhausted) => exhausted,
                Err(e) => {
                    warn!(error = %e, "Scan phase failed");
                    false
                }
            };

            let _ = self.source.stop_scan().await;
            let _ = self.state.update_bluetooth_scanning_status(false).await;

            if exhausted {
                info!("Advertisement source exhausted - scan loop ending");
                break;
            }
            if cancel.is_cancelled() || !self.rest(&cancel).await {
                break;
            }
        }
        info!("BLE scan loop stopped");
    }

    /// Snapshot encryption keys and the selected set from the document.
    async fn cycle_config(&self) -> CycleConfig {
        let mut config = CycleConfig::default();
        if let Ok(Some(Value::Object(devices))) = self.state.get("/bluetooth/devices").await {
            for (id, device) in devices {
                let key_hex = device
                    .get("metadata")
                    .and_then(|m| m.get("encryptionKey"))
                    .and_then(Value::as_str);
                if let Some(key_hex) = key_hex {
                    match hex::decode(key_hex) {
                        Ok(key) => {
                            config.encryption_keys.insert(id.clone(), key);
                        }
                        Err(e) => {
                            debug!(device = %id, error = %e, "Bad encryption key hex");
                        }
                    }
                }
            }
        }
        if let Ok(Some(Value::Object(selected))) =
            self.state.get("/bluetooth/selectedDevices").await
        {
            config.selected.extend(selected.keys().cloned());
        }
        config
    }

    /// One scan phase: collect, parse, merge; push the batch at the end.
    /// Returns true when the source reported EOF.
    async fn scan_phase(
        &mut self,
        cancel: &CancellationToken,
        config: &CycleConfig,
    ) -> Result<bool, ScanError> {
        let deadline = Instant::now() + Duration::from_secs(SCAN_PHASE_SECS);
        let mut cycle: HashMap<String, (Advertisement, Option<SensorRecord>)> = HashMap::new();
        let mut exhausted = false;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep_until(deadline) => break,
                adv = self.source.next_advertisement() => {
                    match adv {
                        Ok(Some(adv)) => {
                            let record = self.parse_advertisement(&adv, config);
                            // Later sightings in the same cycle win, but a
                            // decoded record is never replaced by a miss.
                            match cycle.get_mut(&adv.id) {
                                Some((slot_adv, slot_record)) => {
                                    *slot_adv = adv;
                                    if record.is_some() {
                                        *slot_record = record;
                                    }
                                }
                                None => {
                                    cycle.insert(adv.id.clone(), (adv, record));
                                }
                            }
                        }
                        Ok(None) => {
                            exhausted = true;
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "Advertisement source error");
                            exhausted = true;
                            break;
                        }
                    }
                }
            }
        }

        if !cycle.is_empty() {
            self.push_batch(cycle, config).await;
        }
        Ok(exhausted)
    }

    fn parse_advertisement(
        &self,
        adv: &Advertisement,
        config: &CycleConfig,
    ) -> Option<SensorRecord> {
        let parser = self.registry.find_parser_for(&adv.manufacturer_data)?;
        let opts = ParseOptions {
            encryption_key: config.encryption_keys.get(&adv.id).cloned(),
        };
        match parser.parse(&adv.manufacturer_data, &opts) {
            Ok(record) => record,
            Err(e) => {
                debug!(device = %adv.id, error = %e, "Unparseable advertisement");
                None
            }
        }
    }

    async fn push_batch(
        &mut self,
        cycle: HashMap<String, (Advertisement, Option<SensorRecord>)>,
        config: &CycleConfig,
    ) {
        let count = cycle.len();
        for (id, (adv, record)) in cycle {
            let kind = if self.known.insert(id.clone()) {
                UpdateKind::Discovery
            } else {
                UpdateKind::Update
            };
            let device = BleDevice {
                id: id.clone(),
                name: adv.name,
                manufacturer_id: manufacturer_id(&adv.manufacturer_data).unwrap_or(0),
                rssi: adv.rssi,
                last_seen: Utc::now(),
                sensor_data: record.clone(),
                metadata: DeviceMetadata::default(),
            };
            if let Err(e) = self.state.update_bluetooth_device(&device, kind).await {
                self.log_push_failure(&e);
                return;
            }
            if config.selected.contains(&id) {
                if let Some(record) = record {
                    if let Err(e) = self
                        .state
                        .update_bluetooth_device_sensor_data(&id, &record)
                        .await
                    {
                        self.log_push_failure(&e);
                        return;
                    }
                }
            }
        }
        debug!(devices = count, "Scan cycle batch pushed");
    }

    fn log_push_failure(&self, e: &StateError) {
        warn!(error = %e, "State core rejected scan batch");
    }

    async fn rest(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            () = cancel.cancelled() => false,
            () = tokio::time::sleep(Duration::from_secs(REST_PHASE_SECS)) => true,
        }
    }
}

// ============================================================================
// Stdin Replay Source
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StdinAdvertisement {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    rssi: Option<i16>,
    /// Hex-encoded manufacturer data.
    manufacturer_data: String,
}

/// Replay source reading one JSON advertisement per stdin line:
/// `{"id":"aa:bb","rssi":-60,"manufacturerData":"e102..."}`.
/// Used for development and integration tests without a radio.
pub struct StdinAdvertisementSource {
    lines: tokio::io::Lines<BufReader<tokio::io::Stdin>>,
}

impl StdinAdvertisementSource {
    pub fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }
}

impl Default for StdinAdvertisementSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AdvertisementSource for StdinAdvertisementSource {
    async fn next_advertisement(&mut self) -> Result<Option<Advertisement>, ScanError> {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|e| ScanError::Source(e.to_string()))?;
            let Some(line) = line else {
                return Ok(None);
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<StdinAdvertisement>(line) {
                Ok(adv) => {
                    let data = match hex::decode(&adv.manufacturer_data) {
                        Ok(data) => data,
                        Err(e) => {
                            warn!(error = %e, "Bad manufacturerData hex - line skipped");
                            continue;
                        }
                    };
                    return Ok(Some(Advertisement {
                        id: adv.id,
                        name: adv.name,
                        rssi: adv.rssi,
                        manufacturer_data: data,
                    }));
                }
                Err(e) => {
                    warn!(error = %e, "Bad advertisement line - skipped");
                }
            }
        }
    }

    fn source_name(&self) -> &str {
        "stdin"
    }
}
