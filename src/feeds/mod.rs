//! Weather and tide feed pollers
//!
//! External feeds are producers of wholesale sub-tree swaps: a poller
//! fetches a document from its provider and hands it to the state core's
//! typed setter. Each source runs on its own task with per-cycle jitter
//! (so a fleet of appliances never synchronizes against a provider) and
//! exponential backoff on failure.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::defaults::{
    FEED_MAX_BACKOFF_EXPONENT, FEED_POLL_JITTER_SECS, TIDE_POLL_INTERVAL_SECS,
    WEATHER_POLL_INTERVAL_SECS,
};
use crate::state::StateHandle;

/// Which document sub-tree a feed owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    /// Replaces `forecast`.
    Weather,
    /// Replaces `tides`.
    Tide,
}

/// A pollable external data source.
#[async_trait]
pub trait FeedSource: Send {
    fn name(&self) -> &str;

    fn kind(&self) -> FeedKind;

    /// Nominal poll interval; jitter is added per cycle.
    fn interval(&self) -> Duration;

    async fn fetch(&self) -> anyhow::Result<Value>;
}

/// Generic JSON-over-HTTP feed, configured from the environment.
pub struct HttpJsonFeed {
    name: String,
    kind: FeedKind,
    url: String,
    interval: Duration,
    client: reqwest::Client,
}

impl HttpJsonFeed {
    pub fn weather(url: String) -> Self {
        Self {
            name: "weather".to_string(),
            kind: FeedKind::Weather,
            url,
            interval: Duration::from_secs(WEATHER_POLL_INTERVAL_SECS),
            client: reqwest::Client::new(),
        }
    }

    pub fn tide(url: String) -> Self {
        Self {
            name: "tide".to_string(),
            kind: FeedKind::Tide,
            url,
            interval: Duration::from_secs(TIDE_POLL_INTERVAL_SECS),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl FeedSource for HttpJsonFeed {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> FeedKind {
        self.kind
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn fetch(&self) -> anyhow::Result<Value> {
        let response = self.client.get(&self.url).send().await?;
        let value = response.error_for_status()?.json().await?;
        Ok(value)
    }
}

/// Poll a feed until cancellation. Fetches once at startup, then on the
/// jittered interval; consecutive failures back off exponentially up to
/// `2^FEED_MAX_BACKOFF_EXPONENT` times the base interval.
pub async fn run_feed_poller(
    source: Box<dyn FeedSource>,
    state: StateHandle,
    cancel: CancellationToken,
) {
    info!(feed = source.name(), "Feed poller started");
    let mut failures: u32 = 0;
    loop {
        match source.fetch().await {
            Ok(value) => {
                failures = 0;
                let result = match source.kind() {
                    FeedKind::Weather => state.set_weather_data(value).await,
                    FeedKind::Tide => state.set_tide_data(value).await,
                };
                match result {
                    Ok(()) => debug!(feed = source.name(), "Feed data applied"),
                    Err(e) => {
                        warn!(feed = source.name(), error = %e, "State core gone - poller exiting");
                        return;
                    }
                }
            }
            Err(e) => {
                failures = (failures + 1).min(FEED_MAX_BACKOFF_EXPONENT);
                warn!(
                    feed = source.name(),
                    error = %e,
                    failures,
                    "Feed fetch failed - will retry with backoff"
                );
            }
        }

        let base = source.interval();
        let delay = if failures == 0 {
            base
        } else {
            // Backoff never exceeds the nominal interval itself.
            (Duration::from_secs(2u64.saturating_pow(failures)) * 30).min(base)
        };
        let jitter = Duration::from_secs(rand::thread_rng().gen_range(0..=FEED_POLL_JITTER_SECS));

        tokio::select! {
            () = cancel.cancelled() => {
                info!(feed = source.name(), "Feed poller stopped");
                return;
            }
            () = tokio::time::sleep(delay + jitter) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateCore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct ScriptedFeed {
        kind: FeedKind,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FeedSource for ScriptedFeed {
        fn name(&self) -> &str {
            "scripted"
        }
        fn kind(&self) -> FeedKind {
            self.kind
        }
        fn interval(&self) -> Duration {
            Duration::from_secs(3600)
        }
        async fn fetch(&self) -> anyhow::Result<Value> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"fetch": n, "windKts": 12}))
        }
    }

    #[tokio::test]
    async fn test_poller_applies_first_fetch_immediately() {
        let (core, handle, _delta_rx) = StateCore::new("boat-test".to_string());
        let cancel = CancellationToken::new();
        tokio::spawn(core.run(cancel.clone()));

        let calls = Arc::new(AtomicUsize::new(0));
        tokio::spawn(run_feed_poller(
            Box::new(ScriptedFeed {
                kind: FeedKind::Weather,
                calls: calls.clone(),
            }),
            handle.clone(),
            cancel.clone(),
        ));

        // First fetch lands without waiting for the interval.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let forecast = handle.get("/forecast").await.unwrap().unwrap();
        assert_eq!(forecast["windKts"], json!(12));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_tide_feed_lands_in_tides() {
        let (core, handle, _delta_rx) = StateCore::new("boat-test".to_string());
        let cancel = CancellationToken::new();
        tokio::spawn(core.run(cancel.clone()));

        tokio::spawn(run_feed_poller(
            Box::new(ScriptedFeed {
                kind: FeedKind::Tide,
                calls: Arc::new(AtomicUsize::new(0)),
            }),
            handle.clone(),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let tides = handle.get("/tides").await.unwrap().unwrap();
        assert!(tides.get("fetch").is_some());
        cancel.cancel();
    }
}
