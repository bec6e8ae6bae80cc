//! Boat identity
//!
//! The boat id stamps every replication event. Resolution order:
//! `BOAT_ID` environment variable, then a UUID file created on first run
//! (a 36-character string, nothing else).

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};
use uuid::Uuid;

/// Resolve the boat id, creating the identity file when needed.
pub fn load_or_create_boat_id(path: &Path) -> Result<String> {
    if let Ok(id) = std::env::var("BOAT_ID") {
        let id = id.trim().to_string();
        if !id.is_empty() {
            info!(boat_id = %id, "Boat id from environment");
            return Ok(id);
        }
    }

    if path.exists() {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading boat id file {}", path.display()))?;
        let id = raw.trim();
        if Uuid::parse_str(id).is_ok() {
            info!(boat_id = %id, "Boat id from file");
            return Ok(id.to_string());
        }
        warn!(path = %path.display(), "Boat id file is corrupt - regenerating");
    }

    let id = Uuid::new_v4().to_string();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating identity dir {}", parent.display()))?;
    }
    std::fs::write(path, &id)
        .with_context(|| format!("writing boat id file {}", path.display()))?;
    info!(boat_id = %id, path = %path.display(), "Boat id created");
    Ok(id)
}
