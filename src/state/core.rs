//! State core writer task
//!
//! A single logical writer owns the document. Producers (BLE loop, feed
//! fetchers, the alert service, the transport front-end) hold a cloneable
//! [`StateHandle`] over a bounded command channel - the system's
//! backpressure lever - and the writer applies mutations in arrival order.
//!
//! Every applied patch is emitted on the replication broadcast channel;
//! full snapshots are interleaved per the cadence predicate
//! (`should_emit_full_state`). Deltas feed the rule engine over a separate
//! channel so rule evaluation never blocks producers.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::document::{escape_token, StateDocument};
use super::patch::{apply_validated, filter_ops, PatchError, PatchOp, StateDelta};
use super::schema::default_document;
use crate::config::defaults::{
    DISCOVERY_BATCH_WINDOW_MS, FULL_STATE_INTERVAL_SECS, MUTATION_CHANNEL_BOUND,
    REPLICATION_CHANNEL_CAPACITY, UPDATE_BATCH_WINDOW_MS,
};
use crate::types::{BleDevice, DeviceMetadata, SensorRecord, UpdateKind};

/// Sub-trees that survive an external full-state swap: they are
/// authoritative on this appliance and no external feeder owns them.
const PRESERVED_SUBTREES: &[&str] = &["anchor", "tides", "forecast", "bluetooth"];

// ============================================================================
// Replication Events
// ============================================================================

/// Broadcast replication event, serialized verbatim onto client transports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ReplicationEvent {
    #[serde(rename = "state:full-update", rename_all = "camelCase")]
    FullUpdate {
        data: Value,
        boat_id: String,
        role: String,
        /// Unix milliseconds.
        timestamp: i64,
    },
    #[serde(rename = "state:patch", rename_all = "camelCase")]
    Patch {
        data: Vec<PatchOp>,
        boat_id: String,
        /// Unix milliseconds.
        timestamp: i64,
        update_type: Option<UpdateKind>,
    },
}

impl ReplicationEvent {
    /// Wire name of the event, for the recording sink.
    pub fn name(&self) -> &'static str {
        match self {
            ReplicationEvent::FullUpdate { .. } => "state:full-update",
            ReplicationEvent::Patch { .. } => "state:patch",
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Requests accepted by the writer task.
pub(crate) enum StateCommand {
    ApplyPatch {
        ops: Vec<PatchOp>,
        update_type: Option<UpdateKind>,
        reply: Option<oneshot::Sender<Result<(), PatchError>>>,
    },
    SetWeatherData(Value),
    SetTideData(Value),
    ReceiveExternalStateUpdate(Value),
    UpdateAnchorState(Value),
    QueueBluetoothDevice {
        device: Value,
        kind: UpdateKind,
    },
    UpdateBluetoothSensorData {
        id: String,
        data: Value,
    },
    SetBluetoothSelected {
        id: String,
        selected: bool,
    },
    UpdateBluetoothStatus(Value),
    UpdateBluetoothScanning(bool),
    UpdateBluetoothMetadata {
        id: String,
        metadata: DeviceMetadata,
    },
    ClientAttached,
    Get {
        pointer: String,
        reply: oneshot::Sender<Option<Value>>,
    },
    Snapshot {
        reply: oneshot::Sender<Value>,
    },
}

/// Handle errors surfaced to producers.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error("state core unavailable")]
    CoreClosed,
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable producer-side handle to the state core.
///
/// All mutation methods suspend when the command channel is full; that is
/// the intended backpressure behavior, not an error.
#[derive(Clone)]
pub struct StateHandle {
    tx: mpsc::Sender<StateCommand>,
    events: broadcast::Sender<ReplicationEvent>,
}

impl StateHandle {
    async fn send(&self, cmd: StateCommand) -> Result<(), StateError> {
        self.tx.send(cmd).await.map_err(|_| StateError::CoreClosed)
    }

    /// Subscribe to the replication stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.events.subscribe()
    }

    /// Submit a JSON-Patch and wait for the apply result.
    pub async fn apply_patch(&self, ops: Vec<PatchOp>) -> Result<(), StateError> {
        self.apply_patch_tagged(ops, None).await
    }

    /// Submit a JSON-Patch with a replication `updateType` tag.
    pub async fn apply_patch_tagged(
        &self,
        ops: Vec<PatchOp>,
        update_type: Option<UpdateKind>,
    ) -> Result<(), StateError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(StateCommand::ApplyPatch {
            ops,
            update_type,
            reply: Some(reply_tx),
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| StateError::CoreClosed)?
            .map_err(StateError::Patch)
    }

    /// Submit a raw wire-form ops array (client submissions). Structural
    /// problems are rejected here, before the core is involved.
    pub async fn apply_patch_value(&self, raw: &Value) -> Result<(), StateError> {
        let ops = PatchOp::parse_array(raw)?;
        self.apply_patch(ops).await
    }

    /// Replace the `forecast` sub-tree wholesale.
    pub async fn set_weather_data(&self, value: Value) -> Result<(), StateError> {
        self.send(StateCommand::SetWeatherData(value)).await
    }

    /// Replace the `tides` sub-tree wholesale.
    pub async fn set_tide_data(&self, value: Value) -> Result<(), StateError> {
        self.send(StateCommand::SetTideData(value)).await
    }

    /// Swap in an externally-produced document, preserving the locally
    /// authoritative sub-trees (`anchor`, `tides`, `forecast`, `bluetooth`).
    pub async fn receive_external_state_update(&self, value: Value) -> Result<(), StateError> {
        self.send(StateCommand::ReceiveExternalStateUpdate(value))
            .await
    }

    /// Replace `/anchor` (convenience over `apply_patch`).
    pub async fn update_anchor_state(&self, value: Value) -> Result<(), StateError> {
        self.send(StateCommand::UpdateAnchorState(value)).await
    }

    /// Enqueue a BLE device record for the per-kind batch window.
    pub async fn update_bluetooth_device(
        &self,
        device: &BleDevice,
        kind: UpdateKind,
    ) -> Result<(), StateError> {
        let device = serde_json::to_value(device)
            .map_err(|e| StateError::Patch(PatchError::Malformed(e.to_string())))?;
        self.send(StateCommand::QueueBluetoothDevice { device, kind })
            .await
    }

    /// Push a decoded sensor record for a device (applied immediately).
    pub async fn update_bluetooth_device_sensor_data(
        &self,
        id: &str,
        record: &SensorRecord,
    ) -> Result<(), StateError> {
        let data = serde_json::to_value(record)
            .map_err(|e| StateError::Patch(PatchError::Malformed(e.to_string())))?;
        self.send(StateCommand::UpdateBluetoothSensorData {
            id: id.to_string(),
            data,
        })
        .await
    }

    pub async fn set_bluetooth_device_selected(
        &self,
        id: &str,
        selected: bool,
    ) -> Result<(), StateError> {
        self.send(StateCommand::SetBluetoothSelected {
            id: id.to_string(),
            selected,
        })
        .await
    }

    pub async fn update_bluetooth_status(&self, status: Value) -> Result<(), StateError> {
        self.send(StateCommand::UpdateBluetoothStatus(status)).await
    }

    pub async fn update_bluetooth_scanning_status(&self, scanning: bool) -> Result<(), StateError> {
        self.send(StateCommand::UpdateBluetoothScanning(scanning))
            .await
    }

    /// Apply a `bluetooth:update-metadata` client command.
    pub async fn update_bluetooth_metadata(
        &self,
        device_id: &str,
        metadata: DeviceMetadata,
    ) -> Result<(), StateError> {
        self.send(StateCommand::UpdateBluetoothMetadata {
            id: device_id.to_string(),
            metadata,
        })
        .await
    }

    /// Notify the core that a client transport attached.
    pub async fn client_attached(&self) -> Result<(), StateError> {
        self.send(StateCommand::ClientAttached).await
    }

    /// Copy-on-read lookup of a sub-tree by JSON pointer.
    pub async fn get(&self, pointer: &str) -> Result<Option<Value>, StateError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(StateCommand::Get {
            pointer: pointer.to_string(),
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| StateError::CoreClosed)
    }

    /// Copy of the entire document.
    pub async fn snapshot(&self) -> Result<Value, StateError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(StateCommand::Snapshot { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| StateError::CoreClosed)
    }
}

// ============================================================================
// BLE Batch Queue
// ============================================================================

/// Pending BLE device writes, committed after a fixed window from the
/// first enqueue. Two instances exist, one per batching kind.
struct BatchQueue {
    kind: UpdateKind,
    window: Duration,
    pending: HashMap<String, Value>,
    deadline: Option<Instant>,
}

impl BatchQueue {
    fn new(kind: UpdateKind, window: Duration) -> Self {
        Self {
            kind,
            window,
            pending: HashMap::new(),
            deadline: None,
        }
    }

    fn enqueue(&mut self, id: String, device: Value) {
        if self.pending.is_empty() {
            self.deadline = Some(Instant::now() + self.window);
        }
        self.pending.insert(id, device);
    }

    fn due(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(d) if d <= now)
    }

    fn take(&mut self) -> HashMap<String, Value> {
        self.deadline = None;
        std::mem::take(&mut self.pending)
    }
}

// ============================================================================
// Core
// ============================================================================

/// The writer task state. Construct with [`StateCore::new`], then consume
/// with [`run`](StateCore::run) on its own task.
pub struct StateCore {
    doc: StateDocument,
    boat_id: String,
    cmd_rx: mpsc::Receiver<StateCommand>,
    events_tx: broadcast::Sender<ReplicationEvent>,
    delta_tx: mpsc::UnboundedSender<StateDelta>,
    has_sent_initial_full_state: bool,
    last_full_state_time: Option<Instant>,
    discovery_batch: BatchQueue,
    update_batch: BatchQueue,
}

impl StateCore {
    /// Build the core plus its producer handle and the rule-engine delta
    /// stream. The document starts from the default schema.
    pub fn new(
        boat_id: String,
    ) -> (Self, StateHandle, mpsc::UnboundedReceiver<StateDelta>) {
        Self::with_document(boat_id, default_document())
    }

    /// Build the core around a specific initial document (tests, replay).
    pub fn with_document(
        boat_id: String,
        document: Value,
    ) -> (Self, StateHandle, mpsc::UnboundedReceiver<StateDelta>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(MUTATION_CHANNEL_BOUND);
        let (events_tx, _) = broadcast::channel(REPLICATION_CHANNEL_CAPACITY);
        let (delta_tx, delta_rx) = mpsc::unbounded_channel();

        let core = Self {
            doc: StateDocument::new(document),
            boat_id,
            cmd_rx,
            events_tx: events_tx.clone(),
            delta_tx,
            has_sent_initial_full_state: false,
            last_full_state_time: None,
            discovery_batch: BatchQueue::new(
                UpdateKind::Discovery,
                Duration::from_millis(DISCOVERY_BATCH_WINDOW_MS),
            ),
            update_batch: BatchQueue::new(
                UpdateKind::Update,
                Duration::from_millis(UPDATE_BATCH_WINDOW_MS),
            ),
        };
        let handle = StateHandle {
            tx: cmd_tx,
            events: events_tx,
        };
        (core, handle, delta_rx)
    }

    /// Run until cancellation. Pending batch timers die with the task.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(boat_id = %self.boat_id, "State core started");
        loop {
            let next_deadline = self.next_batch_deadline();
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("State core shutting down");
                    break;
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => break,
                    }
                }
                () = sleep_until_option(next_deadline), if next_deadline.is_some() => {
                    self.commit_due_batches();
                }
            }
        }
    }

    fn next_batch_deadline(&self) -> Option<Instant> {
        match (self.discovery_batch.deadline, self.update_batch.deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn handle_command(&mut self, cmd: StateCommand) {
        match cmd {
            StateCommand::ApplyPatch {
                ops,
                update_type,
                reply,
            } => {
                self.apply(ops, update_type);
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            }
            StateCommand::SetWeatherData(value) => {
                self.apply(
                    vec![PatchOp::Replace {
                        path: "/forecast".to_string(),
                        value,
                    }],
                    None,
                );
            }
            StateCommand::SetTideData(value) => {
                self.apply(
                    vec![PatchOp::Replace {
                        path: "/tides".to_string(),
                        value,
                    }],
                    None,
                );
            }
            StateCommand::ReceiveExternalStateUpdate(value) => {
                self.external_state_update(value);
            }
            StateCommand::UpdateAnchorState(value) => {
                self.apply(
                    vec![PatchOp::Replace {
                        path: "/anchor".to_string(),
                        value,
                    }],
                    None,
                );
            }
            StateCommand::QueueBluetoothDevice { device, kind } => {
                self.queue_bluetooth_device(device, kind);
            }
            StateCommand::UpdateBluetoothSensorData { id, data } => {
                self.bluetooth_sensor_data(&id, data);
            }
            StateCommand::SetBluetoothSelected { id, selected } => {
                self.bluetooth_selected(&id, selected);
            }
            StateCommand::UpdateBluetoothStatus(status) => {
                self.apply(
                    vec![PatchOp::Replace {
                        path: "/bluetooth/status".to_string(),
                        value: status,
                    }],
                    None,
                );
            }
            StateCommand::UpdateBluetoothScanning(scanning) => {
                self.apply(
                    vec![PatchOp::Replace {
                        path: "/bluetooth/status/scanning".to_string(),
                        value: json!(scanning),
                    }],
                    None,
                );
            }
            StateCommand::UpdateBluetoothMetadata { id, metadata } => {
                self.bluetooth_metadata(&id, metadata);
            }
            StateCommand::ClientAttached => {
                if !self.has_sent_initial_full_state {
                    self.emit_full_state(self.doc.clone_root());
                }
            }
            StateCommand::Get { pointer, reply } => {
                let _ = reply.send(self.doc.get(&pointer).cloned());
            }
            StateCommand::Snapshot { reply } => {
                let _ = reply.send(self.doc.clone_root());
            }
        }
    }

    /// Filter, validate, apply, and emit one patch submission.
    fn apply(&mut self, ops: Vec<PatchOp>, update_type: Option<UpdateKind>) {
        let ops = filter_ops(ops);
        if ops.is_empty() {
            return;
        }

        // The snapshot interleaved with a mutation is the pre-apply
        // document, so `full-update + patch` composes exactly.
        let needs_full = self.should_emit_full_state();
        let pre_apply = needs_full.then(|| self.doc.clone_root());

        let source = update_type.map_or("state", UpdateKind::as_str);
        let (applied, delta) = apply_validated(&mut self.doc, ops, source);
        if applied.is_empty() {
            return;
        }

        if let Some(snapshot) = pre_apply {
            self.emit_full_state(snapshot);
        }

        let event = ReplicationEvent::Patch {
            data: applied,
            boat_id: self.boat_id.clone(),
            timestamp: Utc::now().timestamp_millis(),
            update_type,
        };
        let _ = self.events_tx.send(event);

        if self.delta_tx.send(delta).is_err() {
            debug!("No rule engine attached - delta dropped");
        }
    }

    fn should_emit_full_state(&self) -> bool {
        if !self.has_sent_initial_full_state {
            return true;
        }
        match self.last_full_state_time {
            Some(last) => last.elapsed() >= Duration::from_secs(FULL_STATE_INTERVAL_SECS),
            None => true,
        }
    }

    fn emit_full_state(&mut self, data: Value) {
        let event = ReplicationEvent::FullUpdate {
            data,
            boat_id: self.boat_id.clone(),
            role: "boat-server".to_string(),
            timestamp: Utc::now().timestamp_millis(),
        };
        let _ = self.events_tx.send(event);
        self.has_sent_initial_full_state = true;
        self.last_full_state_time = Some(Instant::now());
    }

    fn external_state_update(&mut self, mut value: Value) {
        if !value.is_object() {
            warn!("External state update is not an object - ignored");
            return;
        }
        // Preserved sub-trees are authoritative here; carry them across.
        for key in PRESERVED_SUBTREES {
            if let Some(current) = self.doc.get(&format!("/{key}")) {
                value[*key] = current.clone();
            }
        }
        self.apply(
            vec![PatchOp::Replace {
                path: String::new(),
                value,
            }],
            None,
        );
    }

    fn queue_bluetooth_device(&mut self, device: Value, kind: UpdateKind) {
        let Some(id) = device.get("id").and_then(Value::as_str).map(String::from) else {
            warn!("Bluetooth device without id - dropped");
            return;
        };
        let queue = match kind {
            UpdateKind::Discovery => &mut self.discovery_batch,
            _ => &mut self.update_batch,
        };
        queue.enqueue(id, device);
    }

    fn commit_due_batches(&mut self) {
        let now = Instant::now();
        for which in [true, false] {
            let queue = if which {
                &mut self.discovery_batch
            } else {
                &mut self.update_batch
            };
            if !queue.due(now) {
                continue;
            }
            let kind = queue.kind;
            let pending = queue.take();
            if pending.is_empty() {
                continue;
            }
            let ops = self.batch_ops(pending);
            debug!(kind = kind.as_str(), ops = ops.len(), "Committing BLE batch");
            self.apply(ops, Some(kind));
        }
    }

    /// Turn a pending device map into a patch batch, reconciling each
    /// incoming record with the current document value.
    fn batch_ops(&self, pending: HashMap<String, Value>) -> Vec<PatchOp> {
        let mut ops = Vec::with_capacity(pending.len() + 1);
        for (id, incoming) in pending {
            let pointer = format!("/bluetooth/devices/{}", escape_token(&id));
            let (merged, exists) = match self.doc.get(&pointer) {
                Some(existing) => (merge_device(existing, incoming), true),
                None => (incoming, false),
            };

            let selected_pointer = format!("/bluetooth/selectedDevices/{}", escape_token(&id));
            if self.doc.contains(&selected_pointer) {
                ops.push(PatchOp::Replace {
                    path: selected_pointer,
                    value: merged.clone(),
                });
            }
            ops.push(if exists {
                PatchOp::Replace {
                    path: pointer,
                    value: merged,
                }
            } else {
                PatchOp::Add {
                    path: pointer,
                    value: merged,
                }
            });
        }
        ops.push(PatchOp::Replace {
            path: "/bluetooth/lastUpdated".to_string(),
            value: json!(Utc::now().to_rfc3339()),
        });
        ops
    }

    fn bluetooth_sensor_data(&mut self, id: &str, data: Value) {
        let pointer = format!("/bluetooth/devices/{}/sensorData", escape_token(id));
        let op = if self.doc.contains(&pointer) {
            PatchOp::Replace {
                path: pointer,
                value: data.clone(),
            }
        } else {
            PatchOp::Add {
                path: pointer,
                value: data.clone(),
            }
        };
        let mut ops = vec![op];

        let selected = format!("/bluetooth/selectedDevices/{}/sensorData", escape_token(id));
        if self
            .doc
            .contains(&format!("/bluetooth/selectedDevices/{}", escape_token(id)))
        {
            ops.push(PatchOp::Add {
                path: selected,
                value: data,
            });
        }
        self.apply(ops, Some(UpdateKind::Sensor));
    }

    fn bluetooth_selected(&mut self, id: &str, selected: bool) {
        let device_pointer = format!("/bluetooth/devices/{}", escape_token(id));
        let selected_pointer = format!("/bluetooth/selectedDevices/{}", escape_token(id));

        let ops = if selected {
            let Some(device) = self.doc.get(&device_pointer).cloned() else {
                warn!(device = id, "Cannot select unknown bluetooth device");
                return;
            };
            vec![if self.doc.contains(&selected_pointer) {
                PatchOp::Replace {
                    path: selected_pointer,
                    value: device,
                }
            } else {
                PatchOp::Add {
                    path: selected_pointer,
                    value: device,
                }
            }]
        } else {
            vec![PatchOp::Remove {
                path: selected_pointer,
            }]
        };
        self.apply(ops, Some(UpdateKind::Metadata));
    }

    fn bluetooth_metadata(&mut self, id: &str, metadata: DeviceMetadata) {
        let pointer = format!("/bluetooth/devices/{}/metadata", escape_token(id));
        let merged = match self
            .doc
            .get(&pointer)
            .and_then(|v| serde_json::from_value::<DeviceMetadata>(v.clone()).ok())
        {
            Some(existing) => DeviceMetadata {
                user_label: metadata.user_label.or(existing.user_label),
                notes: metadata.notes.or(existing.notes),
                encryption_key: metadata.encryption_key.or(existing.encryption_key),
            },
            None => metadata,
        };
        let value = match serde_json::to_value(&merged) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Failed to serialize device metadata");
                return;
            }
        };
        let op = if self.doc.contains(&pointer) {
            PatchOp::Replace {
                path: pointer,
                value,
            }
        } else {
            PatchOp::Add {
                path: pointer,
                value,
            }
        };
        self.apply(vec![op], Some(UpdateKind::Metadata));
    }
}

async fn sleep_until_option(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        // Guarded by `if next_deadline.is_some()` in the select arm.
        None => std::future::pending().await,
    }
}

/// Reconcile an incoming device record with the stored one: user-set
/// metadata and the last decoded sensor payload survive a plain discovery
/// refresh that does not carry them.
fn merge_device(existing: &Value, incoming: Value) -> Value {
    let Value::Object(mut incoming) = incoming else {
        return incoming;
    };
    if let Value::Object(existing) = existing {
        match incoming.get_mut("metadata") {
            None | Some(Value::Null) => {
                if let Some(meta) = existing.get("metadata") {
                    incoming.insert("metadata".to_string(), meta.clone());
                }
            }
            Some(Value::Object(incoming_meta)) => {
                if let Some(Value::Object(existing_meta)) = existing.get("metadata") {
                    for (k, v) in existing_meta {
                        incoming_meta.entry(k.clone()).or_insert_with(|| v.clone());
                    }
                }
            }
            Some(_) => {}
        }
        if !incoming.contains_key("sensorData") {
            if let Some(data) = existing.get("sensorData") {
                incoming.insert("sensorData".to_string(), data.clone());
            }
        }
    }
    Value::Object(incoming)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    fn spawn_core() -> (
        StateHandle,
        mpsc::UnboundedReceiver<StateDelta>,
        CancellationToken,
    ) {
        let (core, handle, delta_rx) = StateCore::new("boat-1".to_string());
        let cancel = CancellationToken::new();
        tokio::spawn(core.run(cancel.clone()));
        (handle, delta_rx, cancel)
    }

    fn next_patch(rx: &mut broadcast::Receiver<ReplicationEvent>) -> ReplicationEvent {
        loop {
            match rx.try_recv() {
                Ok(ev @ ReplicationEvent::Patch { .. }) => return ev,
                Ok(ReplicationEvent::FullUpdate { .. }) => continue,
                Err(e) => panic!("expected patch event: {e}"),
            }
        }
    }

    #[tokio::test]
    async fn test_replace_missing_parent_dropped_then_add_creates() {
        let (core, handle, _delta_rx) =
            StateCore::with_document("b".to_string(), json!({}));
        let cancel = CancellationToken::new();
        tokio::spawn(core.run(cancel.clone()));
        let mut events = handle.subscribe();

        handle
            .apply_patch(vec![PatchOp::Replace {
                path: "/a/b".to_string(),
                value: json!(1),
            }])
            .await
            .unwrap();
        assert_eq!(handle.get("/a").await.unwrap(), None);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

        handle
            .apply_patch(vec![PatchOp::Add {
                path: "/a/b".to_string(),
                value: json!(1),
            }])
            .await
            .unwrap();
        assert_eq!(handle.get("/a/b").await.unwrap(), Some(json!(1)));

        // First successful apply: full-update precedes the patch.
        match events.try_recv().unwrap() {
            ReplicationEvent::FullUpdate { data, role, .. } => {
                assert_eq!(role, "boat-server");
                assert_eq!(data, json!({}));
            }
            other => panic!("expected full-update, got {other:?}"),
        }
        match events.try_recv().unwrap() {
            ReplicationEvent::Patch { data, .. } => {
                assert_eq!(data.len(), 1);
                assert_eq!(data[0].path(), "/a/b");
            }
            other => panic!("expected patch, got {other:?}"),
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_malformed_patch_rejected_without_mutation() {
        let (handle, _delta_rx, cancel) = spawn_core();
        let raw = json!([{"op": "test", "path": "/a", "value": 1}]);
        assert!(handle.apply_patch_value(&raw).await.is_err());
        assert_eq!(handle.get("/a").await.unwrap(), None);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_external_update_preserves_local_subtrees() {
        let (handle, _delta_rx, cancel) = spawn_core();
        handle
            .update_anchor_state(json!({"anchorDeployed": true}))
            .await
            .unwrap();
        handle
            .receive_external_state_update(json!({
                "navigation": {"position": {"latitude": 1.0, "longitude": 2.0}},
                "anchor": {"anchorDeployed": false}
            }))
            .await
            .unwrap();

        let anchor = handle.get("/anchor").await.unwrap().unwrap();
        assert_eq!(anchor["anchorDeployed"], json!(true));
        let nav = handle.get("/navigation/position").await.unwrap().unwrap();
        assert_eq!(nav["latitude"], json!(1.0));
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ble_batch_commits_after_window() {
        let (handle, _delta_rx, cancel) = spawn_core();
        let mut events = handle.subscribe();

        let device = BleDevice {
            id: "aa:bb".to_string(),
            name: Some("Shunt".to_string()),
            manufacturer_id: 0x02e1,
            rssi: Some(-60),
            last_seen: Utc::now(),
            sensor_data: None,
            metadata: DeviceMetadata::default(),
        };
        handle
            .update_bluetooth_device(&device, UpdateKind::Discovery)
            .await
            .unwrap();

        // Not yet committed inside the window.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(
            handle.get("/bluetooth/devices/aa:bb").await.unwrap(),
            None
        );

        tokio::time::sleep(Duration::from_millis(600)).await;
        let stored = handle.get("/bluetooth/devices/aa:bb").await.unwrap();
        assert!(stored.is_some());

        // The committed batch is tagged with its kind.
        loop {
            match events.try_recv() {
                Ok(ReplicationEvent::Patch { update_type, .. }) => {
                    assert_eq!(update_type, Some(UpdateKind::Discovery));
                    break;
                }
                Ok(ReplicationEvent::FullUpdate { .. }) => continue,
                Err(e) => panic!("no patch event: {e}"),
            }
        }
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_preserves_user_label() {
        let (handle, _delta_rx, cancel) = spawn_core();

        let mut device = BleDevice {
            id: "aa:cc".to_string(),
            name: Some("SmartShunt HQ2".to_string()),
            manufacturer_id: 0x02e1,
            rssi: Some(-70),
            last_seen: Utc::now(),
            sensor_data: None,
            metadata: DeviceMetadata::default(),
        };
        handle
            .update_bluetooth_device(&device, UpdateKind::Discovery)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        handle
            .update_bluetooth_metadata(
                "aa:cc",
                DeviceMetadata {
                    user_label: Some("House bank".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // A fresh discovery sweep without metadata must not clobber it.
        device.rssi = Some(-55);
        handle
            .update_bluetooth_device(&device, UpdateKind::Discovery)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let stored = handle
            .get("/bluetooth/devices/aa:cc")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored["metadata"]["userLabel"], json!("House bank"));
        assert_eq!(stored["rssi"], json!(-55));
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_state_cadence() {
        let (handle, _delta_rx, cancel) = spawn_core();
        let mut events = handle.subscribe();

        handle
            .apply_patch(vec![PatchOp::Add {
                path: "/x".to_string(),
                value: json!(1),
            }])
            .await
            .unwrap();
        // First mutation: full-update then patch.
        assert!(matches!(
            events.try_recv().unwrap(),
            ReplicationEvent::FullUpdate { .. }
        ));
        next_patch(&mut events);

        // Inside the window: patch only.
        handle
            .apply_patch(vec![PatchOp::Replace {
                path: "/x".to_string(),
                value: json!(2),
            }])
            .await
            .unwrap();
        assert!(matches!(
            events.try_recv().unwrap(),
            ReplicationEvent::Patch { .. }
        ));

        // After the interval, the next mutation interleaves a full-update.
        tokio::time::sleep(Duration::from_secs(FULL_STATE_INTERVAL_SECS + 1)).await;
        handle
            .apply_patch(vec![PatchOp::Replace {
                path: "/x".to_string(),
                value: json!(3),
            }])
            .await
            .unwrap();
        assert!(matches!(
            events.try_recv().unwrap(),
            ReplicationEvent::FullUpdate { .. }
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            ReplicationEvent::Patch { .. }
        ));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_client_attach_emits_initial_full_state_once() {
        let (handle, _delta_rx, cancel) = spawn_core();
        let mut events = handle.subscribe();

        handle.client_attached().await.unwrap();
        handle.client_attached().await.unwrap();
        // Force queue drain so both commands have been processed.
        let _ = handle.snapshot().await.unwrap();

        assert!(matches!(
            events.try_recv().unwrap(),
            ReplicationEvent::FullUpdate { .. }
        ));
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
        cancel.cancel();
    }

    #[test]
    fn test_merge_device_keeps_sensor_data() {
        let existing = json!({"id": "x", "sensorData": {"type": "batteryMonitor"},
                              "metadata": {"userLabel": "Bow"}});
        let incoming = json!({"id": "x", "rssi": -42});
        let merged = merge_device(&existing, incoming);
        assert_eq!(merged["sensorData"]["type"], json!("batteryMonitor"));
        assert_eq!(merged["metadata"]["userLabel"], json!("Bow"));
        assert_eq!(merged["rssi"], json!(-42));
    }
}
