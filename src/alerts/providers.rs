//! Push providers
//!
//! One implementation of [`PushProvider`] per upstream gateway. All three
//! are thin reqwest clients; provider-specific error bodies are folded
//! into the shared [`PushSendError`] classification so dispatch can react
//! uniformly (purge invalid tokens, log the rest).

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tracing::warn;

use super::tokens::Platform;
use crate::config::defaults::{
    APNS_EXPIRY_SECS, APNS_TOKEN_REFRESH_SECS, FCM_ANDROID_CHANNEL, FCM_TTL_SECS,
};
use crate::config::{ApnsConfig, ExpoConfig, FcmConfig, PushConfig};

/// Normalized notification payload handed to every provider.
#[derive(Debug, Clone, Serialize)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    pub data: Value,
    pub sound: Option<String>,
    pub badge: Option<u32>,
    pub priority: Option<String>,
}

/// Classified provider failure.
#[derive(Debug, Error)]
pub enum PushSendError {
    /// The gateway told us the token is dead; purge it.
    #[error("invalid or unregistered token")]
    InvalidToken,

    #[error("send timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider misconfigured: {0}")]
    Configuration(String),
}

#[async_trait]
pub trait PushProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(
        &self,
        token: &str,
        platform: Platform,
        payload: &PushPayload,
    ) -> Result<(), PushSendError>;
}

// ============================================================================
// APNS
// ============================================================================

#[derive(Serialize)]
struct ApnsClaims {
    iss: String,
    iat: i64,
}

struct CachedJwt {
    token: String,
    issued_at: i64,
}

/// Token-based APNS over HTTP/2. The provider JWT is cached and re-signed
/// before Apple's one-hour validity lapses.
pub struct ApnsProvider {
    client: reqwest::Client,
    config: ApnsConfig,
    key: EncodingKey,
    jwt: Mutex<Option<CachedJwt>>,
}

impl ApnsProvider {
    /// Read and parse the .p8 signing key. Fails closed: a bad key file
    /// disables the provider rather than erroring every send.
    pub fn new(config: ApnsConfig) -> Result<Self, PushSendError> {
        let pem = std::fs::read(&config.key_file).map_err(|e| {
            PushSendError::Configuration(format!(
                "cannot read APNS key {}: {e}",
                config.key_file.display()
            ))
        })?;
        let key = EncodingKey::from_ec_pem(&pem)
            .map_err(|e| PushSendError::Configuration(format!("bad APNS key: {e}")))?;
        Ok(Self {
            client: reqwest::Client::new(),
            config,
            key,
            jwt: Mutex::new(None),
        })
    }

    fn host(&self) -> &'static str {
        if self.config.production {
            "https://api.push.apple.com"
        } else {
            "https://api.sandbox.push.apple.com"
        }
    }

    async fn provider_token(&self) -> Result<String, PushSendError> {
        let now = Utc::now().timestamp();
        let mut cached = self.jwt.lock().await;
        if let Some(jwt) = cached.as_ref() {
            if now - jwt.issued_at < APNS_TOKEN_REFRESH_SECS {
                return Ok(jwt.token.clone());
            }
        }
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.config.key_id.clone());
        let claims = ApnsClaims {
            iss: self.config.team_id.clone(),
            iat: now,
        };
        let token = jsonwebtoken::encode(&header, &claims, &self.key)
            .map_err(|e| PushSendError::Configuration(format!("APNS JWT signing: {e}")))?;
        *cached = Some(CachedJwt {
            token: token.clone(),
            issued_at: now,
        });
        Ok(token)
    }
}

#[async_trait]
impl PushProvider for ApnsProvider {
    fn name(&self) -> &'static str {
        "apns"
    }

    async fn send(
        &self,
        token: &str,
        _platform: Platform,
        payload: &PushPayload,
    ) -> Result<(), PushSendError> {
        let jwt = self.provider_token().await?;
        let mut aps = json!({
            "alert": { "title": payload.title, "body": payload.body },
            "sound": payload.sound.as_deref().unwrap_or("default"),
        });
        if let Some(badge) = payload.badge {
            aps["badge"] = json!(badge);
        }
        let body = json!({ "aps": aps, "data": payload.data });

        let response = self
            .client
            .post(format!("{}/3/device/{token}", self.host()))
            .bearer_auth(jwt)
            .header("apns-topic", &self.config.topic)
            .header("apns-priority", "10")
            .header(
                "apns-expiration",
                (Utc::now().timestamp() + APNS_EXPIRY_SECS).to_string(),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| PushSendError::Transport(e.to_string()))?;

        match response.status().as_u16() {
            200 => Ok(()),
            410 => Err(PushSendError::InvalidToken),
            400 => {
                let body: Value = response.json().await.unwrap_or_default();
                if body["reason"] == "BadDeviceToken" {
                    Err(PushSendError::InvalidToken)
                } else {
                    Err(PushSendError::Transport(format!("APNS 400: {body}")))
                }
            }
            status => Err(PushSendError::Transport(format!("APNS status {status}"))),
        }
    }
}

// ============================================================================
// FCM
// ============================================================================

/// FCM legacy HTTP gateway.
pub struct FcmProvider {
    client: reqwest::Client,
    config: FcmConfig,
}

impl FcmProvider {
    pub fn new(config: FcmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl PushProvider for FcmProvider {
    fn name(&self) -> &'static str {
        "fcm"
    }

    async fn send(
        &self,
        token: &str,
        platform: Platform,
        payload: &PushPayload,
    ) -> Result<(), PushSendError> {
        let mut body = json!({
            "to": token,
            "priority": payload.priority.as_deref().unwrap_or("high"),
            "time_to_live": FCM_TTL_SECS,
            "notification": {
                "title": payload.title,
                "body": payload.body,
                "sound": payload.sound.as_deref().unwrap_or("default"),
                "android_channel_id": FCM_ANDROID_CHANNEL,
            },
            "data": payload.data,
        });
        if platform == Platform::Ios {
            // iOS devices reached through FCM need the APNS envelope.
            body["content_available"] = json!(true);
            body["apns"] = json!({
                "headers": { "apns-priority": "10" },
                "payload": { "aps": { "sound": payload.sound.as_deref().unwrap_or("default") } },
            });
        }

        let response = self
            .client
            .post(&self.config.url)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("key={}", self.config.server_key),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| PushSendError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PushSendError::Transport(format!(
                "FCM status {}",
                response.status()
            )));
        }
        let result: Value = response
            .json()
            .await
            .map_err(|e| PushSendError::Transport(e.to_string()))?;
        match result["results"][0]["error"].as_str() {
            Some("NotRegistered" | "InvalidRegistration") => Err(PushSendError::InvalidToken),
            Some(other) => Err(PushSendError::Transport(format!("FCM error: {other}"))),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Expo
// ============================================================================

/// Expo push gateway for Expo-managed apps.
pub struct ExpoProvider {
    client: reqwest::Client,
    config: ExpoConfig,
}

impl ExpoProvider {
    pub fn new(config: ExpoConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl PushProvider for ExpoProvider {
    fn name(&self) -> &'static str {
        "expo"
    }

    async fn send(
        &self,
        token: &str,
        _platform: Platform,
        payload: &PushPayload,
    ) -> Result<(), PushSendError> {
        let body = json!([{
            "to": token,
            "title": payload.title,
            "body": payload.body,
            "data": payload.data,
            "sound": payload.sound.as_deref().unwrap_or("default"),
            "priority": payload.priority.as_deref().unwrap_or("high"),
        }]);

        let mut request = self.client.post(&self.config.url).json(&body);
        if let Some(token) = &self.config.access_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| PushSendError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(PushSendError::Transport(format!(
                "Expo status {}",
                response.status()
            )));
        }
        let result: Value = response
            .json()
            .await
            .map_err(|e| PushSendError::Transport(e.to_string()))?;
        match result["data"][0]["details"]["error"].as_str() {
            Some("DeviceNotRegistered") => Err(PushSendError::InvalidToken),
            Some(other) => Err(PushSendError::Transport(format!("Expo error: {other}"))),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Provider Set
// ============================================================================

/// The configured providers, with the platform routing table.
///
/// FCM and Expo clients are cheap and built eagerly; the APNS provider
/// reads and parses a signing key, so it is created lazily on first use
/// and reused for the process lifetime.
pub struct ProviderSet {
    apns_config: Option<ApnsConfig>,
    apns: OnceCell<Option<std::sync::Arc<ApnsProvider>>>,
    fcm: Option<std::sync::Arc<FcmProvider>>,
    expo: Option<std::sync::Arc<ExpoProvider>>,
}

impl ProviderSet {
    pub fn new(config: PushConfig) -> Self {
        Self {
            apns_config: config.apns,
            apns: OnceCell::new(),
            fcm: config.fcm.map(|c| std::sync::Arc::new(FcmProvider::new(c))),
            expo: config.expo.map(|c| std::sync::Arc::new(ExpoProvider::new(c))),
        }
    }

    async fn apns(&self) -> Option<std::sync::Arc<dyn PushProvider>> {
        let provider = self
            .apns
            .get_or_init(|| async {
                let config = self.apns_config.clone()?;
                match ApnsProvider::new(config) {
                    Ok(p) => Some(std::sync::Arc::new(p)),
                    Err(e) => {
                        warn!(error = %e, "APNS disabled");
                        None
                    }
                }
            })
            .await;
        provider
            .clone()
            .map(|p| p as std::sync::Arc<dyn PushProvider>)
    }

    /// Select the provider for a platform, applying the fallback table:
    /// iOS prefers APNS then FCM; Android prefers FCM then Expo;
    /// Expo-managed clients use Expo only.
    pub async fn for_platform(
        &self,
        platform: Platform,
    ) -> Option<std::sync::Arc<dyn PushProvider>> {
        match platform {
            Platform::Ios => match self.apns().await {
                Some(p) => Some(p),
                None => self
                    .fcm
                    .clone()
                    .map(|p| p as std::sync::Arc<dyn PushProvider>),
            },
            Platform::Android => match self.fcm.clone() {
                Some(p) => Some(p),
                None => self
                    .expo
                    .clone()
                    .map(|p| p as std::sync::Arc<dyn PushProvider>),
            },
            Platform::Expo => self
                .expo
                .clone()
                .map(|p| p as std::sync::Arc<dyn PushProvider>),
        }
    }

    pub fn any_enabled(&self) -> bool {
        self.apns_config.is_some() || self.fcm.is_some() || self.expo.is_some()
    }
}

impl std::fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSet")
            .field("apns", &self.apns_config.is_some())
            .field("fcm", &self.fcm.is_some())
            .field("expo", &self.expo.is_some())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> PushPayload {
        PushPayload {
            title: "Anchor Alarm".to_string(),
            body: "Boat is 30 m out".to_string(),
            data: json!({"alertId": "x"}),
            sound: None,
            badge: None,
            priority: None,
        }
    }

    #[tokio::test]
    async fn test_provider_selection_fallbacks() {
        // FCM only: iOS falls back to FCM, Android uses FCM, Expo has none.
        let set = ProviderSet::new(PushConfig {
            apns: None,
            fcm: Some(FcmConfig {
                server_key: "k".to_string(),
                url: "http://localhost/fcm".to_string(),
            }),
            expo: None,
        });
        assert_eq!(set.for_platform(Platform::Ios).await.unwrap().name(), "fcm");
        assert_eq!(
            set.for_platform(Platform::Android).await.unwrap().name(),
            "fcm"
        );
        assert!(set.for_platform(Platform::Expo).await.is_none());
    }

    #[tokio::test]
    async fn test_android_falls_back_to_expo() {
        let set = ProviderSet::new(PushConfig {
            apns: None,
            fcm: None,
            expo: Some(ExpoConfig {
                url: "http://localhost/expo".to_string(),
                access_token: None,
            }),
        });
        assert_eq!(
            set.for_platform(Platform::Android).await.unwrap().name(),
            "expo"
        );
    }

    #[tokio::test]
    async fn test_missing_apns_key_disables_provider() {
        let set = ProviderSet::new(PushConfig {
            apns: Some(ApnsConfig {
                key_id: "K".to_string(),
                team_id: "T".to_string(),
                key_file: "/nonexistent/key.p8".into(),
                topic: "com.example.app".to_string(),
                production: false,
            }),
            fcm: None,
            expo: None,
        });
        // APNS creation fails -> no provider for iOS (no FCM fallback).
        assert!(set.for_platform(Platform::Ios).await.is_none());
    }

    #[tokio::test]
    async fn test_mock_provider_records_payload() {
        let mock = mock::MockProvider::default();
        mock.send("tok", Platform::Ios, &payload()).await.unwrap();
        let sent = mock.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].2, "Anchor Alarm");
    }
}
