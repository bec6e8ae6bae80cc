//! Pelorus relay server binary
//!
//! Wires the state core, rule engine, alert service, BLE scan loop, and
//! feed pollers together and supervises them until shutdown.
//!
//! # Usage
//!
//! ```bash
//! # Run with the default data directory
//! pelorus
//!
//! # Replay BLE advertisements from a capture
//! cat anchorage-capture.jsonl | pelorus --ble-stdin
//!
//! # Record every replication event
//! pelorus --record /var/log/pelorus/replication.jsonl
//! ```
//!
//! # Environment Variables
//!
//! - `BOAT_ID`: boat identifier (default: UUID file under the data dir)
//! - `APNS_KEY_ID`, `APNS_TEAM_ID`, `APNS_KEY_FILE`, `APNS_TOPIC`,
//!   `NODE_ENV`: enable the APNS push provider
//! - `FCM_SERVER_KEY`, `FCM_URL`: enable the FCM push provider
//! - `EXPO_ACCESS_TOKEN`, `EXPO_PUSH_URL`: enable the Expo push provider
//! - `WEATHER_FEED_URL`, `TIDE_FEED_URL`: enable the feed pollers
//! - `RUST_LOG`: logging filter (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pelorus::alerts::AlertService;
use pelorus::ble::{ParserRegistry, ScanLoop, StdinAdvertisementSource};
use pelorus::config::{FeedConfig, PushConfig};
use pelorus::feeds::{run_feed_poller, HttpJsonFeed};
use pelorus::rules::ais::{AisClearRule, AisProximityRule};
use pelorus::rules::anchor::{
    AnchorDraggingClearRule, AnchorDraggingRule, CriticalRangeClearRule, CriticalRangeRule,
};
use pelorus::state::default_document;
use pelorus::storage::{load_or_create_boat_id, Recorder};
use pelorus::{RuleEngine, StateCore};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "pelorus")]
#[command(about = "Onboard marine telemetry relay")]
#[command(version)]
struct CliArgs {
    /// Directory for persisted state (boat id, push tokens)
    #[arg(long, env = "PELORUS_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Record every replication event to a JSONL file
    #[arg(long, value_name = "PATH")]
    record: Option<PathBuf>,

    /// Read BLE advertisements as JSON lines from stdin (replay mode)
    #[arg(long)]
    ble_stdin: bool,

    /// Emit logs as JSON (for the journal shipper)
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Build the domain rule set.
fn register_rules(engine: &mut RuleEngine) {
    engine.register(Box::new(CriticalRangeRule::default()));
    engine.register(Box::new(CriticalRangeClearRule));
    engine.register(Box::new(AnchorDraggingRule::default()));
    engine.register(Box::new(AnchorDraggingClearRule));
    engine.register(Box::new(AisProximityRule));
    engine.register(Box::new(AisClearRule));
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(args.log_json);

    info!("Pelorus relay starting");

    let boat_id = load_or_create_boat_id(&args.data_dir.join("boat-id"))
        .context("resolving boat identity")?;

    // State core: the single writer everything else talks to.
    let (core, state_handle, delta_rx) = StateCore::new(boat_id.clone());

    // Rule engine, primed with the same boot document.
    let (mut engine, actions_rx) = RuleEngine::new(default_document());
    register_rules(&mut engine);

    // Alert service with push providers from the environment.
    let push_config = PushConfig::from_env();
    if !push_config.any_enabled() {
        info!("No push providers configured - in-band replication only");
    }
    let (alert_service, _alert_handle) = AlertService::new(
        state_handle.clone(),
        actions_rx,
        push_config,
        args.data_dir.join("push-tokens.json"),
    );

    let cancel = CancellationToken::new();
    let mut tasks: JoinSet<()> = JoinSet::new();

    if let Some(record_path) = &args.record {
        let recorder = Recorder::new(record_path);
        let events = state_handle.subscribe();
        tasks.spawn(recorder.run(events, cancel.clone()));
    }

    tasks.spawn(core.run(cancel.clone()));
    tasks.spawn(engine.run(delta_rx, cancel.clone()));
    tasks.spawn(alert_service.run(cancel.clone()));

    // Feed pollers, when the operator configured endpoints.
    let feeds = FeedConfig::from_env();
    if let Some(url) = feeds.weather_url {
        tasks.spawn(run_feed_poller(
            Box::new(HttpJsonFeed::weather(url)),
            state_handle.clone(),
            cancel.clone(),
        ));
    }
    if let Some(url) = feeds.tide_url {
        tasks.spawn(run_feed_poller(
            Box::new(HttpJsonFeed::tide(url)),
            state_handle.clone(),
            cancel.clone(),
        ));
    }

    if args.ble_stdin {
        let scan = ScanLoop::new(
            StdinAdvertisementSource::new(),
            ParserRegistry::with_defaults(),
            state_handle.clone(),
        );
        tasks.spawn(scan.run(cancel.clone()));
    }

    info!(boat_id = %boat_id, "Pelorus relay running");

    // Cooperative shutdown: first Ctrl-C cancels everything, tasks drain.
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Signal handler failed - shutting down");
            } else {
                info!("Shutdown signal received");
            }
        }
        Some(finished) = tasks.join_next() => {
            // A supervised task ended on its own (e.g. stdin replay EOF).
            if let Err(e) = finished {
                warn!(error = %e, "Task exited abnormally");
            } else {
                info!("Task finished - shutting down");
            }
        }
    }

    cancel.cancel();
    while let Some(finished) = tasks.join_next().await {
        if let Err(e) = finished {
            warn!(error = %e, "Task join error during shutdown");
        }
    }

    info!("Pelorus relay stopped");
    Ok(())
}
