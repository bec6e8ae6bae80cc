//! Alert service
//!
//! Owns the active/resolved lifecycle. Rule actions come in on the action
//! channel; client commands (acknowledge, mute, resolve, push
//! registration) come in on the command channel. Every mutation of
//! `alerts.*` goes back through the state core's patch API as a wholesale
//! replace of both sequences, so the active->resolved move is atomic for
//! observers.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dispatch::{dispatch_alert, ProviderResolver};
use super::providers::ProviderSet;
use super::tokens::{Platform, PushTokenStore};
use crate::config::defaults::{
    ALERT_EXPIRY_SWEEP_SECS, MAX_RESOLVED_ALERTS, PUSH_SEND_TIMEOUT_SECS,
    RESOLUTION_NOTICE_EXPIRES_MS, TOKEN_MAX_IDLE_DAYS, TOKEN_PURGE_INTERVAL_SECS,
};
use crate::config::PushConfig;
use crate::state::{PatchOp, StateHandle};
use crate::types::{
    ActionRecord, Alert, AlertLevel, AlertSpec, AlertStatus, RuleAction,
};

/// Capacity of the client command channel.
const COMMAND_CHANNEL_BOUND: usize = 64;

/// Capacity of the informational notification broadcast.
const NOTIFICATION_CHANNEL_CAPACITY: usize = 64;

/// Informational broadcast produced by `NOTIFICATION` rule actions.
/// No alert record is created for these.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub category: String,
    pub severity: AlertLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum AlertServiceError {
    #[error("unknown push platform: {0}")]
    UnknownPlatform(String),

    #[error("alert service unavailable")]
    ServiceClosed,
}

enum AlertCommand {
    RegisterPushToken {
        client_id: String,
        platform: String,
        token: String,
        device_id: Option<String>,
        reply: oneshot::Sender<Result<(), AlertServiceError>>,
    },
    UnregisterPushToken {
        client_id: String,
    },
    SetClientActive {
        client_id: String,
    },
    SetClientInactive {
        client_id: String,
    },
    Acknowledge {
        id: String,
    },
    Mute {
        id: String,
        until: Option<DateTime<Utc>>,
    },
    Unmute {
        id: String,
    },
    Resolve {
        id: String,
        resolution: Option<Value>,
    },
}

/// Cloneable front-end handle to the alert service.
#[derive(Clone)]
pub struct AlertHandle {
    tx: mpsc::Sender<AlertCommand>,
}

impl AlertHandle {
    async fn send(&self, cmd: AlertCommand) -> Result<(), AlertServiceError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| AlertServiceError::ServiceClosed)
    }

    /// Store (or overwrite) a client's push token and issue the
    /// "Registration Verified" test notification.
    pub async fn register_push_token(
        &self,
        client_id: &str,
        platform: &str,
        token: &str,
        device_id: Option<String>,
    ) -> Result<(), AlertServiceError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(AlertCommand::RegisterPushToken {
            client_id: client_id.to_string(),
            platform: platform.to_string(),
            token: token.to_string(),
            device_id,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| AlertServiceError::ServiceClosed)?
    }

    pub async fn unregister_push_token(&self, client_id: &str) -> Result<(), AlertServiceError> {
        self.send(AlertCommand::UnregisterPushToken {
            client_id: client_id.to_string(),
        })
        .await
    }

    /// Mark a client's transport live; live clients are excluded from
    /// push fan-out and their token's `lastActive` ticks.
    pub async fn set_client_active(&self, client_id: &str) -> Result<(), AlertServiceError> {
        self.send(AlertCommand::SetClientActive {
            client_id: client_id.to_string(),
        })
        .await
    }

    pub async fn set_client_inactive(&self, client_id: &str) -> Result<(), AlertServiceError> {
        self.send(AlertCommand::SetClientInactive {
            client_id: client_id.to_string(),
        })
        .await
    }

    pub async fn acknowledge_alert(&self, id: &str) -> Result<(), AlertServiceError> {
        self.send(AlertCommand::Acknowledge { id: id.to_string() }).await
    }

    pub async fn mute_alert(
        &self,
        id: &str,
        until: Option<DateTime<Utc>>,
    ) -> Result<(), AlertServiceError> {
        self.send(AlertCommand::Mute {
            id: id.to_string(),
            until,
        })
        .await
    }

    pub async fn unmute_alert(&self, id: &str) -> Result<(), AlertServiceError> {
        self.send(AlertCommand::Unmute { id: id.to_string() }).await
    }

    /// Explicit resolve by id: works on acknowledged and
    /// non-auto-resolvable alerts too, and emits no resolution notice.
    pub async fn resolve_alert(
        &self,
        id: &str,
        resolution: Option<Value>,
    ) -> Result<(), AlertServiceError> {
        self.send(AlertCommand::Resolve {
            id: id.to_string(),
            resolution,
        })
        .await
    }
}

/// The alert lifecycle task.
pub struct AlertService {
    state: StateHandle,
    actions_rx: mpsc::Receiver<Vec<ActionRecord>>,
    commands_rx: mpsc::Receiver<AlertCommand>,
    active: Vec<Alert>,
    resolved: Vec<Alert>,
    tokens: PushTokenStore,
    active_clients: HashSet<String>,
    providers: Arc<ProviderSet>,
    notifications_tx: broadcast::Sender<NotificationEvent>,
    /// Invalid-token lists reported back by spawned dispatch tasks.
    dispatch_tx: mpsc::UnboundedSender<Vec<String>>,
    dispatch_rx: mpsc::UnboundedReceiver<Vec<String>>,
}

impl AlertService {
    pub fn new(
        state: StateHandle,
        actions_rx: mpsc::Receiver<Vec<ActionRecord>>,
        push_config: PushConfig,
        token_store_path: PathBuf,
    ) -> (Self, AlertHandle) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_BOUND);
        let (notifications_tx, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let service = Self {
            state,
            actions_rx,
            commands_rx,
            active: Vec::new(),
            resolved: Vec::new(),
            tokens: PushTokenStore::new(token_store_path),
            active_clients: HashSet::new(),
            providers: Arc::new(ProviderSet::new(push_config)),
            notifications_tx,
            dispatch_tx,
            dispatch_rx,
        };
        (service, AlertHandle { tx: commands_tx })
    }

    /// Subscribe to informational notifications.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<NotificationEvent> {
        self.notifications_tx.subscribe()
    }

    /// Run until cancellation.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            push = self.providers.any_enabled(),
            "Alert service started"
        );
        let mut sweep = tokio::time::interval(Duration::from_secs(ALERT_EXPIRY_SWEEP_SECS));
        let mut purge = tokio::time::interval(Duration::from_secs(TOKEN_PURGE_INTERVAL_SECS));
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Alert service shutting down");
                    break;
                }
                batch = self.actions_rx.recv() => {
                    match batch {
                        Some(batch) => self.process_alert_actions(batch).await,
                        None => break,
                    }
                }
                cmd = self.commands_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }
                invalid = self.dispatch_rx.recv() => {
                    if let Some(invalid) = invalid {
                        for client_id in invalid {
                            self.tokens.remove(&client_id);
                        }
                    }
                }
                _ = sweep.tick() => self.sweep_expired().await,
                _ = purge.tick() => {
                    self.tokens.purge_idle(TOKEN_MAX_IDLE_DAYS);
                }
            }
        }
    }

    /// Dispatch a batch of rule actions.
    pub async fn process_alert_actions(&mut self, batch: Vec<ActionRecord>) {
        for record in batch {
            match record.action {
                RuleAction::CreateAlert { data } => {
                    self.create_alert(data, Some(record.rule_id)).await;
                }
                RuleAction::ResolveAlerts { trigger, data } => {
                    self.resolve_alerts_by_trigger(&trigger, data).await;
                }
                RuleAction::Notification {
                    category,
                    severity,
                    message,
                } => {
                    debug!(category = %category, severity = %severity, "Informational notification");
                    let _ = self.notifications_tx.send(NotificationEvent {
                        category,
                        severity,
                        message,
                        timestamp: record.timestamp,
                    });
                }
                RuleAction::WeatherAlert {
                    severity,
                    code,
                    message,
                } => {
                    self.create_alert(
                        AlertSpec {
                            alert_type: Some("weather".to_string()),
                            category: Some("environment".to_string()),
                            level: Some(severity),
                            label: Some("Weather Alert".to_string()),
                            message: Some(message),
                            trigger: Some(format!("weather_{code}")),
                            ..Default::default()
                        },
                        Some(record.rule_id),
                    )
                    .await;
                }
                RuleAction::CrewAlert { message } => {
                    // No consumer on this appliance build yet.
                    info!(rule = %record.rule_id, message = %message, "Crew alert action received");
                }
                RuleAction::SetSyncProfile { config } => {
                    info!(rule = %record.rule_id, config = %config, "Sync profile action received");
                }
            }
        }
    }

    /// Materialize an alert from its spec, append to the active list, and
    /// fan out to push providers.
    pub async fn create_alert(&mut self, spec: AlertSpec, rule_id: Option<String>) -> Alert {
        let now = Utc::now();
        let auto_expire = spec.auto_expire.unwrap_or(false);
        let expires_in = spec.expires_in;
        let alert = Alert {
            id: Uuid::new_v4().to_string(),
            alert_type: spec.alert_type.unwrap_or_else(|| "system".to_string()),
            category: spec.category.unwrap_or_else(|| "general".to_string()),
            source: spec.source.unwrap_or_else(|| "rule-engine".to_string()),
            level: spec.level.unwrap_or(AlertLevel::Info),
            label: spec.label.unwrap_or_else(|| "Alert".to_string()),
            message: spec.message.unwrap_or_default(),
            timestamp: now,
            acknowledged: false,
            muted: false,
            muted_until: None,
            status: AlertStatus::Active,
            trigger: spec.trigger.unwrap_or_default(),
            rule_id,
            data: spec.data,
            actions: spec.actions,
            phone_notification: spec.phone_notification.unwrap_or(true),
            sticky: spec.sticky.unwrap_or(false),
            auto_resolvable: spec.auto_resolvable.unwrap_or(false),
            auto_expire,
            expires_in,
            expires_at: (auto_expire)
                .then(|| expires_in.map(|ms| now + chrono::Duration::milliseconds(ms)))
                .flatten(),
            resolved_at: None,
            resolution_data: None,
        };
        info!(
            id = %alert.id,
            trigger = %alert.trigger,
            level = %alert.level,
            "Alert created"
        );
        self.active.push(alert.clone());
        self.commit().await;

        if alert.phone_notification {
            self.spawn_dispatch(alert.clone());
        }
        alert
    }

    fn spawn_dispatch(&mut self, alert: Alert) {
        let tokens = self.tokens.snapshot();
        if tokens.is_empty() {
            return;
        }
        let active_clients = self.active_clients.clone();
        let providers = self.providers.clone();
        let results = self.dispatch_tx.clone();
        tokio::spawn(async move {
            let outcome =
                dispatch_alert(&alert, tokens, &active_clients, providers.as_ref()).await;
            if !outcome.invalid.is_empty() {
                let _ = results.send(outcome.invalid);
            }
        });
    }

    /// Resolve all active, auto-resolvable, unacknowledged alerts with
    /// this trigger. When at least one resolves, a single auto-expiring
    /// resolution notice is created.
    pub async fn resolve_alerts_by_trigger(&mut self, trigger: &str, resolution: Option<Value>) {
        let now = Utc::now();
        let mut resolved_count = 0usize;
        let mut kept = Vec::with_capacity(self.active.len());
        for mut alert in self.active.drain(..) {
            let matches = alert.trigger == trigger
                && alert.auto_resolvable
                && !alert.acknowledged
                && alert.status == AlertStatus::Active;
            if matches {
                alert.status = AlertStatus::Resolved;
                alert.resolved_at = Some(now);
                let mut data = resolution.clone().unwrap_or_else(|| json!({}));
                if !data.is_object() {
                    data = json!({ "resolution": data });
                }
                data["autoResolved"] = json!(true);
                alert.resolution_data = Some(data);
                info!(id = %alert.id, trigger = %trigger, "Alert auto-resolved");
                self.resolved.push(alert);
                resolved_count += 1;
            } else {
                kept.push(alert);
            }
        }
        self.active = kept;

        if resolved_count == 0 {
            debug!(trigger = %trigger, "No alerts to resolve");
            return;
        }
        self.commit().await;

        let message = resolution_message(trigger, resolution.as_ref());
        self.create_alert(
            AlertSpec {
                alert_type: Some("notification".to_string()),
                category: Some("resolution".to_string()),
                level: Some(AlertLevel::Info),
                label: Some("Alert Resolved".to_string()),
                message: Some(message),
                trigger: Some(format!("{trigger}_resolved")),
                auto_expire: Some(true),
                expires_in: Some(RESOLUTION_NOTICE_EXPIRES_MS),
                ..Default::default()
            },
            None,
        )
        .await;
    }

    async fn handle_command(&mut self, cmd: AlertCommand) {
        match cmd {
            AlertCommand::RegisterPushToken {
                client_id,
                platform,
                token,
                device_id,
                reply,
            } => {
                let result = match Platform::resolve(&platform, &token) {
                    Some(resolved) => {
                        self.tokens.register(&client_id, resolved, &token, device_id);
                        info!(client = %client_id, platform = ?resolved, "Push token registered");
                        self.send_test_notification(resolved, token);
                        Ok(())
                    }
                    None => Err(AlertServiceError::UnknownPlatform(platform)),
                };
                let _ = reply.send(result);
            }
            AlertCommand::UnregisterPushToken { client_id } => {
                if self.tokens.remove(&client_id) {
                    info!(client = %client_id, "Push token unregistered");
                }
            }
            AlertCommand::SetClientActive { client_id } => {
                self.tokens.touch(&client_id);
                self.active_clients.insert(client_id);
            }
            AlertCommand::SetClientInactive { client_id } => {
                self.active_clients.remove(&client_id);
            }
            AlertCommand::Acknowledge { id } => {
                if let Some(alert) = self.active.iter_mut().find(|a| a.id == id) {
                    alert.acknowledged = true;
                    info!(id = %id, "Alert acknowledged");
                    self.commit().await;
                }
            }
            AlertCommand::Mute { id, until } => {
                if let Some(alert) = self.active.iter_mut().find(|a| a.id == id) {
                    alert.muted = true;
                    alert.muted_until = until;
                    self.commit().await;
                }
            }
            AlertCommand::Unmute { id } => {
                if let Some(alert) = self.active.iter_mut().find(|a| a.id == id) {
                    alert.muted = false;
                    alert.muted_until = None;
                    self.commit().await;
                }
            }
            AlertCommand::Resolve { id, resolution } => {
                if let Some(pos) = self.active.iter().position(|a| a.id == id) {
                    let mut alert = self.active.remove(pos);
                    alert.status = AlertStatus::Resolved;
                    alert.resolved_at = Some(Utc::now());
                    alert.resolution_data = resolution;
                    info!(id = %id, "Alert resolved by command");
                    self.resolved.push(alert);
                    self.commit().await;
                }
            }
        }
    }

    fn send_test_notification(&self, platform: Platform, token: String) {
        let providers = self.providers.clone();
        tokio::spawn(async move {
            let Some(provider) = providers.resolve(platform).await else {
                debug!(platform = ?platform, "No provider for test notification");
                return;
            };
            let payload = super::providers::PushPayload {
                title: "Registration Verified".to_string(),
                body: "Push notifications are enabled for this vessel".to_string(),
                data: json!({}),
                sound: Some("default".to_string()),
                badge: None,
                priority: None,
            };
            let result = tokio::time::timeout(
                Duration::from_secs(PUSH_SEND_TIMEOUT_SECS),
                provider.send(&token, platform, &payload),
            )
            .await;
            match result {
                Ok(Ok(())) => debug!(provider = provider.name(), "Test notification sent"),
                Ok(Err(e)) => warn!(error = %e, "Test notification failed"),
                Err(_) => warn!("Test notification timed out"),
            }
        });
    }

    /// Remove expired auto-expire notices from the active list. They do
    /// not accumulate in `alerts.resolved`; their terminal status is
    /// visible in the removing patch.
    async fn sweep_expired(&mut self) {
        let now = Utc::now();
        let before = self.active.len();
        self.active.retain_mut(|alert| {
            let expired = alert.auto_expire
                && matches!(alert.expires_at, Some(at) if at <= now);
            if expired {
                alert.status = AlertStatus::Expired;
                debug!(id = %alert.id, trigger = %alert.trigger, "Alert expired");
            }
            !expired
        });
        if self.active.len() != before {
            self.commit().await;
        }
    }

    /// Write both sequences back through the patch API.
    async fn commit(&mut self) {
        if self.resolved.len() > MAX_RESOLVED_ALERTS {
            let excess = self.resolved.len() - MAX_RESOLVED_ALERTS;
            self.resolved.drain(0..excess);
        }
        let active = match serde_json::to_value(&self.active) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Failed to serialize active alerts");
                return;
            }
        };
        let resolved = match serde_json::to_value(&self.resolved) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Failed to serialize resolved alerts");
                return;
            }
        };
        let ops = vec![
            PatchOp::Replace {
                path: "/alerts/active".to_string(),
                value: active,
            },
            PatchOp::Replace {
                path: "/alerts/resolved".to_string(),
                value: resolved,
            },
        ];
        if let Err(e) = self.state.apply_patch(ops).await {
            warn!(error = %e, "Failed to commit alert state");
        }
    }

    #[cfg(test)]
    pub(crate) fn active_alerts(&self) -> &[Alert] {
        &self.active
    }

    #[cfg(test)]
    pub(crate) fn resolved_alerts(&self) -> &[Alert] {
        &self.resolved
    }
}

/// Human message for a resolution notice, templated on the trigger.
fn resolution_message(trigger: &str, resolution: Option<&Value>) -> String {
    let formatted_range = resolution
        .and_then(|d| d.get("formattedRange"))
        .and_then(Value::as_str);
    match trigger {
        "critical_range" => "Boat is back inside the critical range".to_string(),
        "anchor_dragging" => "Anchor is holding again".to_string(),
        "ais_proximity" => format!(
            "No vessels detected within warning radius of {}.",
            formatted_range.unwrap_or("the configured range")
        ),
        other => format!("{other} condition resolved"),
    }
}
