//! System-wide default constants.
//!
//! Centralises magic numbers so every timing window and bound has one home.
//! Grouped by subsystem for easy discovery.

// ============================================================================
// State Core
// ============================================================================

/// Bound of the mutation command channel. Producers block when the core
/// falls behind - this is the system's primary backpressure lever.
pub const MUTATION_CHANNEL_BOUND: usize = 1024;

/// Capacity of the replication broadcast channel (events, per subscriber).
pub const REPLICATION_CHANNEL_CAPACITY: usize = 256;

/// Interval between periodic full-state snapshots (seconds).
pub const FULL_STATE_INTERVAL_SECS: u64 = 300;

/// BLE batch debounce window for newly-discovered devices (ms).
pub const DISCOVERY_BATCH_WINDOW_MS: u64 = 1000;

/// BLE batch debounce window for updates to known devices (ms).
pub const UPDATE_BATCH_WINDOW_MS: u64 = 250;

/// Path token that is filtered out of every patch submission.
/// Legacy clients still emit altitude operations; the document no longer
/// carries the field.
pub const DISALLOWED_PATH_TOKEN: &str = "altitude";

// ============================================================================
// Rule Engine
// ============================================================================

/// Nominal debounce interval between rule evaluation fires (ms).
pub const RULE_DEBOUNCE_INTERVAL_MS: u64 = 1000;

/// Upper bound on evaluation latency under a continuous delta stream (ms).
pub const RULE_DEBOUNCE_MAX_WAIT_MS: u64 = 5000;

/// Soft cap on registered rules; exceeding logs a warning.
pub const MAX_RULES: usize = 20;

/// Soft cap on dependency paths per rule; exceeding logs a warning.
pub const MAX_RULE_DEPENDENCIES: usize = 5;

/// How long an anchor-range breach must hold before an alert fires (seconds).
pub const ANCHOR_ALARM_HOLD_SECS: i64 = 10;

/// Drift of the anchor itself that counts as dragging (meters).
pub const ANCHOR_DRAG_DRIFT_METERS: f64 = 5.0;

/// Mean Earth radius for Haversine distance (meters, WGS-84).
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

// ============================================================================
// Alert Service
// ============================================================================

/// Lifetime of auto-expiring resolution notices (ms).
pub const RESOLUTION_NOTICE_EXPIRES_MS: i64 = 60_000;

/// How often the expiry sweep runs (seconds).
pub const ALERT_EXPIRY_SWEEP_SECS: u64 = 5;

/// Resolved alerts kept in `alerts.resolved` before the oldest are trimmed.
pub const MAX_RESOLVED_ALERTS: usize = 100;

// ============================================================================
// Push Dispatch
// ============================================================================

/// Per-send timeout for any push provider call (seconds).
pub const PUSH_SEND_TIMEOUT_SECS: u64 = 5;

/// APNS notification expiry window (seconds).
pub const APNS_EXPIRY_SECS: i64 = 3600;

/// APNS provider-token refresh interval (seconds). Apple accepts tokens
/// 20-60 minutes old; refresh at 50 minutes.
pub const APNS_TOKEN_REFRESH_SECS: i64 = 3000;

/// FCM message time-to-live (seconds).
pub const FCM_TTL_SECS: u64 = 3600;

/// Android notification channel for alert pushes.
pub const FCM_ANDROID_CHANNEL: &str = "alerts_high_priority";

/// Default FCM legacy endpoint (override with FCM_URL).
pub const FCM_DEFAULT_URL: &str = "https://fcm.googleapis.com/fcm/send";

/// Default Expo push endpoint (override with EXPO_PUSH_URL).
pub const EXPO_DEFAULT_URL: &str = "https://exp.host/--/api/v2/push/send";

// ============================================================================
// Push Token Store
// ============================================================================

/// Tokens idle longer than this are purged (days).
pub const TOKEN_MAX_IDLE_DAYS: i64 = 30;

/// How often the token purge task runs (seconds). 21 600 = 6 hours.
pub const TOKEN_PURGE_INTERVAL_SECS: u64 = 21_600;

// ============================================================================
// BLE Scan Loop
// ============================================================================

/// Active scan phase length (seconds).
pub const SCAN_PHASE_SECS: u64 = 10;

/// Rest phase between scans (seconds).
pub const REST_PHASE_SECS: u64 = 5;

// ============================================================================
// Feeds
// ============================================================================

/// Default weather forecast poll interval (seconds). 1 800 = 30 minutes.
pub const WEATHER_POLL_INTERVAL_SECS: u64 = 1_800;

/// Default tide table poll interval (seconds). 21 600 = 6 hours.
pub const TIDE_POLL_INTERVAL_SECS: u64 = 21_600;

/// Random jitter added to each feed poll (seconds).
pub const FEED_POLL_JITTER_SECS: u64 = 60;

/// Maximum backoff multiplier exponent for failed feed polls.
/// `2^5 = 32x base delay`, capped by the poll interval itself.
pub const FEED_MAX_BACKOFF_EXPONENT: u32 = 5;
