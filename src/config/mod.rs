//! Relay configuration
//!
//! Environment-driven: the appliance boots from systemd with a flat env
//! file, so there is no config document to parse. Push providers are
//! enabled by the presence of their credential variables; a provider with
//! missing credentials is disabled, never an error.

pub mod defaults;

use std::path::PathBuf;

/// APNS (Apple Push Notification service) credentials.
#[derive(Debug, Clone)]
pub struct ApnsConfig {
    pub key_id: String,
    pub team_id: String,
    /// Path to the ES256 signing key (.p8).
    pub key_file: PathBuf,
    /// App bundle id, sent as `apns-topic`.
    pub topic: String,
    /// Selects the production or sandbox gateway.
    pub production: bool,
}

/// FCM (Firebase Cloud Messaging) legacy-HTTP credentials.
#[derive(Debug, Clone)]
pub struct FcmConfig {
    pub server_key: String,
    pub url: String,
}

/// Expo push service settings.
#[derive(Debug, Clone)]
pub struct ExpoConfig {
    pub url: String,
    pub access_token: Option<String>,
}

/// Push provider configuration; `None` per provider means disabled.
#[derive(Debug, Clone, Default)]
pub struct PushConfig {
    pub apns: Option<ApnsConfig>,
    pub fcm: Option<FcmConfig>,
    pub expo: Option<ExpoConfig>,
}

impl PushConfig {
    /// Read provider credentials from the environment.
    ///
    /// A provider is enabled only when its required variables are all
    /// present; partially-configured providers log a warning and stay off.
    pub fn from_env() -> Self {
        let apns = match (
            std::env::var("APNS_KEY_ID"),
            std::env::var("APNS_TEAM_ID"),
            std::env::var("APNS_KEY_FILE"),
            std::env::var("APNS_TOPIC"),
        ) {
            (Ok(key_id), Ok(team_id), Ok(key_file), Ok(topic)) => Some(ApnsConfig {
                key_id,
                team_id,
                key_file: PathBuf::from(key_file),
                topic,
                production: std::env::var("NODE_ENV").as_deref() == Ok("production"),
            }),
            (Err(_), Err(_), Err(_), Err(_)) => None,
            _ => {
                tracing::warn!("APNS partially configured - provider disabled");
                None
            }
        };

        let fcm = match std::env::var("FCM_SERVER_KEY") {
            Ok(server_key) => Some(FcmConfig {
                server_key,
                url: std::env::var("FCM_URL")
                    .unwrap_or_else(|_| defaults::FCM_DEFAULT_URL.to_string()),
            }),
            Err(_) => None,
        };

        // Expo needs no credential for the public gateway, but we only
        // enable it when the operator opted in via either variable.
        let expo = match (
            std::env::var("EXPO_ACCESS_TOKEN"),
            std::env::var("EXPO_PUSH_URL"),
        ) {
            (Err(_), Err(_)) => None,
            (token, url) => Some(ExpoConfig {
                url: url.unwrap_or_else(|_| defaults::EXPO_DEFAULT_URL.to_string()),
                access_token: token.ok(),
            }),
        };

        Self { apns, fcm, expo }
    }

    pub fn any_enabled(&self) -> bool {
        self.apns.is_some() || self.fcm.is_some() || self.expo.is_some()
    }
}

/// Feed endpoints; absent means the feed task is not started.
#[derive(Debug, Clone, Default)]
pub struct FeedConfig {
    pub weather_url: Option<String>,
    pub tide_url: Option<String>,
}

impl FeedConfig {
    pub fn from_env() -> Self {
        Self {
            weather_url: std::env::var("WEATHER_FEED_URL").ok(),
            tide_url: std::env::var("TIDE_FEED_URL").ok(),
        }
    }
}
