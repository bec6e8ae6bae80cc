//! Replication recording sink
//!
//! Optional newline-delimited JSON log of every emitted patch and full
//! snapshot: `{seq, timestamp, event, data}` per line. Subscribes to the
//! replication broadcast and runs entirely outside the writer task; write
//! failures are logged and the file is reopened on the next event, so a
//! full disk degrades recording, never replication.

use std::io::Write;
use std::path::PathBuf;

use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::state::ReplicationEvent;

/// Append-only JSONL recorder task.
pub struct Recorder {
    path: PathBuf,
    seq: u64,
    file: Option<std::fs::File>,
}

impl Recorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            seq: 0,
            file: None,
        }
    }

    /// Run until cancellation or the event stream closes.
    pub async fn run(
        mut self,
        mut events: broadcast::Receiver<ReplicationEvent>,
        cancel: CancellationToken,
    ) {
        info!(path = %self.path.display(), "Recorder started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => {
                    match event {
                        Ok(event) => self.record(&event),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Recorder lagged - events skipped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        info!(entries = self.seq, "Recorder stopped");
    }

    fn record(&mut self, event: &ReplicationEvent) {
        let data = match serde_json::to_value(event) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Unserializable replication event");
                return;
            }
        };
        let entry = json!({
            "seq": self.seq,
            "timestamp": chrono::Utc::now().timestamp_millis(),
            "event": event.name(),
            "data": data,
        });
        if let Err(e) = self.append(&entry) {
            warn!(error = %e, "Recording write failed - will reopen");
            self.file = None;
            return;
        }
        self.seq += 1;
    }

    fn append(&mut self, entry: &serde_json::Value) -> std::io::Result<()> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            self.file = Some(
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)?,
            );
            debug!(path = %self.path.display(), "Recording file opened");
        }
        // Checked above.
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        file.write_all(&line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{PatchOp, StateCore};
    use serde_json::{json, Value};
    use std::time::Duration;

    #[tokio::test]
    async fn test_records_full_update_then_patch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recording.jsonl");

        let (core, handle, _delta_rx) = StateCore::new("boat-rec".to_string());
        let cancel = CancellationToken::new();
        let recorder = Recorder::new(&path);
        let events = handle.subscribe();
        tokio::spawn(core.run(cancel.clone()));
        let recorder_task = tokio::spawn(recorder.run(events, cancel.clone()));

        handle
            .apply_patch(vec![PatchOp::Add {
                path: "/x".to_string(),
                value: json!(1),
            }])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let _ = recorder_task.await;

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = raw
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["seq"], json!(0));
        assert_eq!(lines[0]["event"], json!("state:full-update"));
        assert_eq!(lines[1]["seq"], json!(1));
        assert_eq!(lines[1]["event"], json!("state:patch"));
        assert_eq!(lines[1]["data"]["data"][0]["path"], json!("/x"));
    }
}
