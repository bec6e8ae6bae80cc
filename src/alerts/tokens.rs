//! Push token store
//!
//! In-memory map of client id -> token record, backed by a JSON file
//! (an array of `[clientId, record]` pairs). The file is loaded on first
//! use and rewritten atomically (write-temp + rename) on every mutation.
//! Save failures are logged and retried on the next mutation - a broken
//! SD card must never take down alerting.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Push platform a token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
    Expo,
}

impl Platform {
    /// Parse a registration platform string; Expo-managed tokens are
    /// detected from the token shape regardless of the declared platform.
    pub fn resolve(platform: &str, token: &str) -> Option<Self> {
        if token.starts_with("ExponentPushToken[") {
            return Some(Self::Expo);
        }
        match platform {
            "ios" => Some(Self::Ios),
            "android" => Some(Self::Android),
            "expo" => Some(Self::Expo),
            _ => None,
        }
    }
}

/// One registered client device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub platform: Platform,
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub last_active: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("token store io: {0}")]
    Io(#[from] std::io::Error),

    #[error("token store serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The persistent client -> token map. Owned by the alert service; all
/// access is serialized through it.
pub struct PushTokenStore {
    path: PathBuf,
    entries: HashMap<String, TokenRecord>,
    loaded: bool,
}

impl PushTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: HashMap::new(),
            loaded: false,
        }
    }

    fn ensure_loaded(&mut self) {
        if self.loaded {
            return;
        }
        self.loaded = true;
        match Self::read_file(&self.path) {
            Ok(Some(entries)) => {
                info!(count = entries.len(), path = %self.path.display(), "Push tokens loaded");
                self.entries = entries;
            }
            Ok(None) => {
                debug!(path = %self.path.display(), "No push token file yet");
            }
            Err(e) => {
                warn!(error = %e, "Failed to load push tokens - starting empty");
            }
        }
    }

    fn read_file(path: &Path) -> Result<Option<HashMap<String, TokenRecord>>, StoreError> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(path)?;
        let pairs: Vec<(String, TokenRecord)> = serde_json::from_slice(&bytes)?;
        Ok(Some(pairs.into_iter().collect()))
    }

    /// Atomic rewrite of the backing file. Errors are returned so the
    /// caller can log them; the in-memory map is already updated.
    fn save(&self) -> Result<(), StoreError> {
        let mut pairs: Vec<(&String, &TokenRecord)> = self.entries.iter().collect();
        // Stable file ordering keeps diffs readable when debugging.
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        let bytes = serde_json::to_vec_pretty(&pairs)?;

        let tmp = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn save_logged(&self) {
        if let Err(e) = self.save() {
            warn!(error = %e, path = %self.path.display(),
                  "Failed to save push tokens - will retry on next mutation");
        }
    }

    /// Store or overwrite a client's token. Returns the stored record.
    pub fn register(
        &mut self,
        client_id: &str,
        platform: Platform,
        token: &str,
        device_id: Option<String>,
    ) -> TokenRecord {
        self.ensure_loaded();
        let now = Utc::now();
        let created_at = self
            .entries
            .get(client_id)
            .map_or(now, |existing| existing.created_at);
        let record = TokenRecord {
            platform,
            token: token.to_string(),
            device_id,
            last_active: now,
            created_at,
            updated_at: now,
        };
        self.entries.insert(client_id.to_string(), record.clone());
        self.save_logged();
        record
    }

    /// Remove a client's token (unregistration or provider rejection).
    pub fn remove(&mut self, client_id: &str) -> bool {
        self.ensure_loaded();
        let removed = self.entries.remove(client_id).is_some();
        if removed {
            self.save_logged();
        }
        removed
    }

    /// Refresh a client's `lastActive` timestamp.
    pub fn touch(&mut self, client_id: &str) {
        self.ensure_loaded();
        if let Some(record) = self.entries.get_mut(client_id) {
            record.last_active = Utc::now();
            self.save_logged();
        }
    }

    pub fn get(&mut self, client_id: &str) -> Option<&TokenRecord> {
        self.ensure_loaded();
        self.entries.get(client_id)
    }

    /// Copy of all entries, for dispatch fan-out.
    pub fn snapshot(&mut self) -> Vec<(String, TokenRecord)> {
        self.ensure_loaded();
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&mut self) -> usize {
        self.ensure_loaded();
        self.entries.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    /// Drop tokens whose `lastActive` is older than `max_idle_days`.
    /// Returns the number removed.
    pub fn purge_idle(&mut self, max_idle_days: i64) -> usize {
        self.ensure_loaded();
        let cutoff = Utc::now() - Duration::days(max_idle_days);
        let before = self.entries.len();
        self.entries.retain(|client, record| {
            let keep = record.last_active >= cutoff;
            if !keep {
                debug!(client = %client, last_active = %record.last_active, "Purging idle push token");
            }
            keep
        });
        let purged = before - self.entries.len();
        if purged > 0 {
            info!(purged, "Purged idle push tokens");
            self.save_logged();
        }
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> PushTokenStore {
        PushTokenStore::new(dir.path().join("push-tokens.json"))
    }

    #[test]
    fn test_register_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.register("c1", Platform::Ios, "tok-1", Some("iphone-12".to_string()));
        store.register("c2", Platform::Android, "tok-2", None);
        assert_eq!(store.len(), 2);

        // A fresh store instance lazily loads the same file.
        let mut reloaded = store_in(&dir);
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get("c1").unwrap().token, "tok-1");
        assert_eq!(reloaded.get("c2").unwrap().platform, Platform::Android);
    }

    #[test]
    fn test_register_overwrites_but_keeps_created_at() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        let first = store.register("c1", Platform::Ios, "tok-1", None);
        let second = store.register("c1", Platform::Ios, "tok-2", None);
        assert_eq!(store.len(), 1);
        assert_eq!(second.token, "tok-2");
        assert_eq!(second.created_at, first.created_at);
    }

    #[test]
    fn test_purge_idle() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.register("fresh", Platform::Ios, "tok-1", None);
        store.register("stale", Platform::Android, "tok-2", None);
        // Backdate the stale record past the cutoff.
        store.entries.get_mut("stale").unwrap().last_active =
            Utc::now() - Duration::days(45);

        assert_eq!(store.purge_idle(30), 1);
        assert!(store.get("stale").is_none());
        assert!(store.get("fresh").is_some());
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        assert!(!store.remove("nobody"));
    }

    #[test]
    fn test_platform_resolve_detects_expo() {
        assert_eq!(
            Platform::resolve("ios", "ExponentPushToken[abc]"),
            Some(Platform::Expo)
        );
        assert_eq!(Platform::resolve("ios", "a1b2c3"), Some(Platform::Ios));
        assert_eq!(Platform::resolve("android", "a1b2c3"), Some(Platform::Android));
        assert_eq!(Platform::resolve("windows", "a1b2c3"), None);
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("push-tokens.json");
        std::fs::write(&path, b"not json").unwrap();
        let mut store = PushTokenStore::new(path);
        assert_eq!(store.len(), 0);
    }
}
