//! State core regression tests
//!
//! Exercises the patch pipeline end to end over the public handle:
//! validation and filter behavior, replication event ordering, full-state
//! cadence, and the external-update preservation rules.

use serde_json::json;
use tokio::sync::broadcast::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use pelorus::state::{PatchOp, ReplicationEvent, StateCore, StateHandle};

fn spawn_core(doc: serde_json::Value) -> (StateHandle, CancellationToken) {
    let (core, handle, _delta_rx) = StateCore::with_document("boat-itest".to_string(), doc);
    let cancel = CancellationToken::new();
    tokio::spawn(core.run(cancel.clone()));
    (handle, cancel)
}

fn add(path: &str, value: serde_json::Value) -> PatchOp {
    PatchOp::Add {
        path: path.to_string(),
        value,
    }
}

fn replace(path: &str, value: serde_json::Value) -> PatchOp {
    PatchOp::Replace {
        path: path.to_string(),
        value,
    }
}

fn remove(path: &str) -> PatchOp {
    PatchOp::Remove {
        path: path.to_string(),
    }
}

/// Spec scenario: replace of a missing parent is dropped without
/// emission; a subsequent add materializes the chain and emits once.
#[tokio::test]
async fn replace_missing_parent_then_add() {
    let (handle, cancel) = spawn_core(json!({}));
    let mut events = handle.subscribe();

    handle
        .apply_patch(vec![replace("/a/b", json!(1))])
        .await
        .unwrap();
    assert_eq!(handle.snapshot().await.unwrap(), json!({}));
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

    handle.apply_patch(vec![add("/a/b", json!(1))]).await.unwrap();
    assert_eq!(handle.snapshot().await.unwrap(), json!({"a": {"b": 1}}));

    // Exactly one full-update (first apply) and one patch with that op.
    let ReplicationEvent::FullUpdate { data, .. } = events.try_recv().unwrap() else {
        panic!("expected full-update first");
    };
    assert_eq!(data, json!({}));
    let ReplicationEvent::Patch { data, .. } = events.try_recv().unwrap() else {
        panic!("expected patch second");
    };
    assert_eq!(data, vec![add("/a/b", json!(1))]);
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    cancel.cancel();
}

/// Every op is either applied and present in the emitted event, or
/// dropped and absent from both.
#[tokio::test]
async fn applied_and_emitted_agree() {
    let (handle, cancel) = spawn_core(json!({"keep": 1}));
    let mut events = handle.subscribe();

    handle
        .apply_patch(vec![
            replace("/keep", json!(2)),
            remove("/missing"),
            add("/navigation/altitude", json!(99.0)),
            add("/fresh", json!(3)),
        ])
        .await
        .unwrap();

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot, json!({"keep": 2, "fresh": 3}));

    // Skip the initial full-update, inspect the patch.
    loop {
        match events.try_recv().unwrap() {
            ReplicationEvent::Patch { data, .. } => {
                assert_eq!(data.len(), 2);
                assert_eq!(data[0].path(), "/keep");
                assert_eq!(data[1].path(), "/fresh");
                break;
            }
            ReplicationEvent::FullUpdate { .. } => continue,
        }
    }
    cancel.cancel();
}

/// Applying the same remove twice: the first succeeds, the second is
/// dropped by validation and the document is unchanged.
#[tokio::test]
async fn remove_idempotence() {
    let (handle, cancel) = spawn_core(json!({"a": {"b": 1}}));

    handle.apply_patch(vec![remove("/a/b")]).await.unwrap();
    let after_first = handle.snapshot().await.unwrap();
    assert_eq!(after_first, json!({"a": {}}));

    let mut events = handle.subscribe();
    handle.apply_patch(vec![remove("/a/b")]).await.unwrap();
    assert_eq!(handle.snapshot().await.unwrap(), after_first);
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    cancel.cancel();
}

/// A structurally invalid submission is rejected whole: the submitter
/// sees an error and nothing mutates or emits.
#[tokio::test]
async fn malformed_submission_rejected() {
    let (handle, cancel) = spawn_core(json!({"a": 1}));
    let mut events = handle.subscribe();

    let raw = json!([
        {"op": "replace", "path": "/a", "value": 2},
        {"op": "copy", "from": "/a", "path": "/b"}
    ]);
    assert!(handle.apply_patch_value(&raw).await.is_err());
    assert_eq!(handle.snapshot().await.unwrap(), json!({"a": 1}));
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    cancel.cancel();
}

/// Full snapshot followed by no mutations round-trips byte-equal after
/// canonical re-serialization.
#[tokio::test]
async fn snapshot_round_trip() {
    let (handle, cancel) = spawn_core(json!({}));
    handle
        .apply_patch(vec![add("/nav", json!({"speed": 6.2, "course": 184.0}))])
        .await
        .unwrap();

    let first = handle.snapshot().await.unwrap();
    let second = handle.snapshot().await.unwrap();
    let a = serde_json::to_vec(&first).unwrap();
    let b = serde_json::to_vec(&second).unwrap();
    assert_eq!(a, b);
    cancel.cancel();
}

/// Full-state cadence over paused time: first mutation emits a snapshot,
/// in-window mutations do not, and the 5-minute timer interleaves one.
#[tokio::test(start_paused = true)]
async fn full_state_cadence() {
    let (handle, cancel) = spawn_core(json!({}));
    let mut events = handle.subscribe();

    handle.apply_patch(vec![add("/x", json!(0))]).await.unwrap();
    assert!(matches!(
        events.try_recv().unwrap(),
        ReplicationEvent::FullUpdate { .. }
    ));
    assert!(matches!(
        events.try_recv().unwrap(),
        ReplicationEvent::Patch { .. }
    ));

    for i in 1..4 {
        handle
            .apply_patch(vec![replace("/x", json!(i))])
            .await
            .unwrap();
        assert!(matches!(
            events.try_recv().unwrap(),
            ReplicationEvent::Patch { .. }
        ));
    }

    tokio::time::sleep(std::time::Duration::from_secs(301)).await;
    handle
        .apply_patch(vec![replace("/x", json!(99))])
        .await
        .unwrap();
    assert!(matches!(
        events.try_recv().unwrap(),
        ReplicationEvent::FullUpdate { .. }
    ));
    assert!(matches!(
        events.try_recv().unwrap(),
        ReplicationEvent::Patch { .. }
    ));
    cancel.cancel();
}

/// External state swaps preserve the locally-authoritative sub-trees.
#[tokio::test]
async fn external_update_preserves_authority() {
    let (core, handle, _delta_rx) = StateCore::new("boat-itest".to_string());
    let cancel = CancellationToken::new();
    tokio::spawn(core.run(cancel.clone()));

    handle
        .update_anchor_state(json!({"anchorDeployed": true, "rode": 40}))
        .await
        .unwrap();
    handle.set_tide_data(json!({"nextHigh": "06:14"})).await.unwrap();
    handle
        .set_weather_data(json!({"windKts": 18}))
        .await
        .unwrap();

    handle
        .receive_external_state_update(json!({
            "navigation": {"position": {"latitude": 34.7, "longitude": -76.6}},
            "anchor": {"anchorDeployed": false},
            "tides": {},
            "forecast": {},
            "bluetooth": {"devices": {"spoofed": true}}
        }))
        .await
        .unwrap();

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot["anchor"]["anchorDeployed"], json!(true));
    assert_eq!(snapshot["anchor"]["rode"], json!(40));
    assert_eq!(snapshot["tides"]["nextHigh"], json!("06:14"));
    assert_eq!(snapshot["forecast"]["windKts"], json!(18));
    assert!(snapshot["bluetooth"]["devices"].get("spoofed").is_none());
    assert_eq!(snapshot["navigation"]["position"]["latitude"], json!(34.7));
    cancel.cancel();
}

/// The replication envelope matches the documented wire shape.
#[tokio::test]
async fn wire_envelope_shape() {
    let (handle, cancel) = spawn_core(json!({}));
    let mut events = handle.subscribe();
    handle.apply_patch(vec![add("/x", json!(1))]).await.unwrap();

    let full = serde_json::to_value(events.try_recv().unwrap()).unwrap();
    assert_eq!(full["type"], json!("state:full-update"));
    assert_eq!(full["boatId"], json!("boat-itest"));
    assert_eq!(full["role"], json!("boat-server"));
    assert!(full["timestamp"].is_i64());

    let patch = serde_json::to_value(events.try_recv().unwrap()).unwrap();
    assert_eq!(patch["type"], json!("state:patch"));
    assert_eq!(patch["data"][0]["op"], json!("add"));
    assert_eq!(patch["updateType"], json!(null));
    cancel.cancel();
}
