//! Push fan-out
//!
//! Runs outside the core writer and the alert service loop: the service
//! hands a snapshot of the alert, the token list, and the active-client
//! set to a spawned dispatch task, so a slow gateway can never stall
//! mutations. Clients with a live transport are skipped - they learn via
//! state replication.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use super::providers::{ProviderSet, PushPayload, PushProvider, PushSendError};
use super::tokens::{Platform, TokenRecord};
use crate::config::defaults::PUSH_SEND_TIMEOUT_SECS;
use crate::types::Alert;

/// Seam for provider lookup so dispatch is testable without gateways.
#[async_trait]
pub trait ProviderResolver: Send + Sync {
    async fn resolve(&self, platform: Platform) -> Option<Arc<dyn PushProvider>>;
}

#[async_trait]
impl ProviderResolver for ProviderSet {
    async fn resolve(&self, platform: Platform) -> Option<Arc<dyn PushProvider>> {
        self.for_platform(platform).await
    }
}

/// Result of one fan-out round.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    pub attempted: usize,
    pub sent: usize,
    /// Client ids whose tokens the gateway rejected; purge them.
    pub invalid: Vec<String>,
}

/// Normalize an alert into the provider payload.
pub fn payload_for(alert: &Alert) -> PushPayload {
    let mut data = alert.data.clone();
    if !data.is_object() {
        data = json!({});
    }
    data["alertId"] = json!(alert.id);
    data["alertType"] = json!(alert.alert_type);
    data["timestamp"] = json!(alert.timestamp.to_rfc3339());
    PushPayload {
        title: alert.label.clone(),
        body: alert.message.clone(),
        data,
        sound: Some("default".to_string()),
        badge: None,
        priority: Some("high".to_string()),
    }
}

/// Fan an alert out to every registered token except live clients.
///
/// Each send is bounded by the per-send timeout; a timed-out send is not
/// retried and does not purge the token.
pub async fn dispatch_alert(
    alert: &Alert,
    tokens: Vec<(String, TokenRecord)>,
    active_clients: &HashSet<String>,
    resolver: &dyn ProviderResolver,
) -> DispatchOutcome {
    let payload = payload_for(alert);
    let mut outcome = DispatchOutcome::default();

    let mut sends = Vec::new();
    for (client_id, record) in tokens {
        if active_clients.contains(&client_id) {
            debug!(client = %client_id, "Skipping push for live client");
            continue;
        }
        let Some(provider) = resolver.resolve(record.platform).await else {
            debug!(client = %client_id, platform = ?record.platform,
                   "No push provider configured for platform");
            continue;
        };
        outcome.attempted += 1;
        let payload = payload.clone();
        sends.push(async move {
            let result = tokio::time::timeout(
                Duration::from_secs(PUSH_SEND_TIMEOUT_SECS),
                provider.send(&record.token, record.platform, &payload),
            )
            .await
            .unwrap_or(Err(PushSendError::Timeout));
            (client_id, provider.name(), result)
        });
    }

    for (client_id, provider_name, result) in futures::future::join_all(sends).await {
        match result {
            Ok(()) => {
                outcome.sent += 1;
                debug!(client = %client_id, provider = provider_name, "Push delivered");
            }
            Err(PushSendError::InvalidToken) => {
                info!(client = %client_id, provider = provider_name,
                      "Token rejected by gateway - purging");
                outcome.invalid.push(client_id);
            }
            Err(e) => {
                warn!(client = %client_id, provider = provider_name, error = %e,
                      "Push send failed");
            }
        }
    }

    if outcome.attempted > 0 {
        info!(
            alert = %alert.id,
            attempted = outcome.attempted,
            sent = outcome.sent,
            invalid = outcome.invalid.len(),
            "Push dispatch complete"
        );
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::providers::mock::MockProvider;
    use crate::types::{AlertLevel, AlertStatus};
    use chrono::Utc;

    struct MockResolver {
        provider: Arc<MockProvider>,
        platforms: Vec<Platform>,
    }

    #[async_trait]
    impl ProviderResolver for MockResolver {
        async fn resolve(&self, platform: Platform) -> Option<Arc<dyn PushProvider>> {
            self.platforms
                .contains(&platform)
                .then(|| self.provider.clone() as Arc<dyn PushProvider>)
        }
    }

    fn alert() -> Alert {
        Alert {
            id: "a-1".to_string(),
            alert_type: "anchor".to_string(),
            category: "safety".to_string(),
            source: "rule-engine".to_string(),
            level: AlertLevel::Critical,
            label: "Anchor Alarm".to_string(),
            message: "Boat is 30 m out".to_string(),
            timestamp: Utc::now(),
            acknowledged: false,
            muted: false,
            muted_until: None,
            status: AlertStatus::Active,
            trigger: "critical_range".to_string(),
            rule_id: None,
            data: json!({"distance": 30.0}),
            actions: Vec::new(),
            phone_notification: true,
            sticky: false,
            auto_resolvable: true,
            auto_expire: false,
            expires_in: None,
            expires_at: None,
            resolved_at: None,
            resolution_data: None,
        }
    }

    fn record(platform: Platform, token: &str) -> TokenRecord {
        let now = Utc::now();
        TokenRecord {
            platform,
            token: token.to_string(),
            device_id: None,
            last_active: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_live_clients_are_skipped() {
        let provider = Arc::new(MockProvider::default());
        let resolver = MockResolver {
            provider: provider.clone(),
            platforms: vec![Platform::Ios],
        };
        let tokens = vec![
            ("c1".to_string(), record(Platform::Ios, "tok-live")),
            ("c2".to_string(), record(Platform::Ios, "tok-offline")),
        ];
        let active: HashSet<String> = ["c1".to_string()].into_iter().collect();

        let outcome = dispatch_alert(&alert(), tokens, &active, &resolver).await;
        assert_eq!(outcome.attempted, 1);
        assert_eq!(outcome.sent, 1);

        let sent = provider.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "tok-offline");
    }

    #[tokio::test]
    async fn test_invalid_token_reported_for_purge() {
        let provider = Arc::new(MockProvider::default());
        *provider.fail_with.lock().unwrap() = Some("invalid");
        let resolver = MockResolver {
            provider,
            platforms: vec![Platform::Android],
        };
        let tokens = vec![("c9".to_string(), record(Platform::Android, "dead"))];

        let outcome = dispatch_alert(&alert(), tokens, &HashSet::new(), &resolver).await;
        assert_eq!(outcome.sent, 0);
        assert_eq!(outcome.invalid, vec!["c9".to_string()]);
    }

    #[tokio::test]
    async fn test_unconfigured_platform_not_attempted() {
        let provider = Arc::new(MockProvider::default());
        let resolver = MockResolver {
            provider,
            platforms: vec![Platform::Ios],
        };
        let tokens = vec![("c3".to_string(), record(Platform::Expo, "expo-tok"))];

        let outcome = dispatch_alert(&alert(), tokens, &HashSet::new(), &resolver).await;
        assert_eq!(outcome.attempted, 0);
    }

    #[test]
    fn test_payload_includes_alert_identity() {
        let payload = payload_for(&alert());
        assert_eq!(payload.title, "Anchor Alarm");
        assert_eq!(payload.data["alertId"], json!("a-1"));
        assert_eq!(payload.data["alertType"], json!("anchor"));
        assert_eq!(payload.data["distance"], json!(30.0));
    }
}
