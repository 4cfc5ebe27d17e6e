//! Integration tests for backend rotation and rotation-state
//! persistence, exercised through the public API.

use std::collections::HashMap;
use std::sync::Arc;

use mend::backend::rotation::ClientFactory;
use mend::{
    BackendClient, BackendSpec, MockBackendClient, RotationManager, RotationStateStore,
};
use tempfile::TempDir;

fn spec(name: &str, retries: u32) -> BackendSpec {
    BackendSpec::named(name).with_retry_policy(retries, 0.0)
}

fn manager(
    clients: &[(&str, Arc<MockBackendClient>)],
    specs: Vec<BackendSpec>,
) -> RotationManager {
    let (default_name, default_client) = &clients[0];
    let mut factories: HashMap<String, ClientFactory> = HashMap::new();
    for (name, client) in &clients[1..] {
        let client = client.clone();
        factories.insert(
            name.to_string(),
            Box::new(move || Ok(client.clone() as Arc<dyn BackendClient>)),
        );
    }
    RotationManager::new(
        default_name,
        default_client.clone() as Arc<dyn BackendClient>,
        specs,
        factories,
    )
}

/// Backend A exhausts initial + 2 retries on usage limits, then B
/// serves the call, leaving the cursor on B.
#[tokio::test]
async fn rotation_retries_then_rotates() {
    let a = Arc::new(MockBackendClient::new().always_usage_limit("quota"));
    let b = Arc::new(MockBackendClient::new().with_response("answer"));
    let mut mgr = manager(
        &[("a", a.clone()), ("b", b.clone())],
        vec![spec("a", 2), spec("b", 0)],
    );

    assert_eq!(mgr.invoke("prompt").await.unwrap(), "answer");
    assert_eq!(a.call_count(), 3);
    assert_eq!(b.call_count(), 1);
    assert_eq!(mgr.active_backend(), "b");
}

/// Rotating `len(backends)` times returns the cursor to its start.
#[tokio::test]
async fn rotation_is_cyclic() {
    let a = Arc::new(MockBackendClient::new());
    let mut mgr = manager(
        &[("a", a)],
        vec![spec("a", 0), spec("b", 0), spec("c", 0), spec("d", 0)],
    );

    let start = mgr.active_backend().to_string();
    for _ in 0..4 {
        mgr.rotate_to_next("cycle test");
    }
    assert_eq!(mgr.active_backend(), start);
}

/// One successful invoke on an always-switch backend advances the
/// cursor even though the backend did not fail.
#[tokio::test]
async fn always_switch_rotates_after_success() {
    let a = Arc::new(MockBackendClient::new().with_response("done"));
    let b = Arc::new(MockBackendClient::new());
    let mut mgr = manager(
        &[("a", a.clone()), ("b", b)],
        vec![spec("a", 0).with_always_switch(true), spec("b", 0)],
    );

    assert_eq!(mgr.invoke("p").await.unwrap(), "done");
    assert_eq!(a.call_count(), 1);
    assert_eq!(mgr.active_backend(), "b");
}

/// Three identical test-fix prompts produce backend usage [A, A, B];
/// a changed prompt then resets the cursor to the default.
#[tokio::test]
async fn repeated_prompt_forces_rotation_then_reset_on_change() {
    let a = Arc::new(MockBackendClient::new().with_response("from a"));
    let b = Arc::new(MockBackendClient::new().with_response("from b"));
    let mut mgr = manager(
        &[("a", a.clone()), ("b", b.clone())],
        vec![spec("a", 0), spec("b", 0)],
    );

    mgr.run_test_fix_prompt("fix the suite").await.unwrap();
    mgr.run_test_fix_prompt("fix the suite").await.unwrap();
    mgr.run_test_fix_prompt("fix the suite").await.unwrap();
    assert_eq!(a.call_count(), 2);
    assert_eq!(b.call_count(), 1);
    assert_eq!(mgr.active_backend(), "b");

    mgr.run_test_fix_prompt("a different failure").await.unwrap();
    assert_eq!(mgr.active_backend(), "a");
    assert_eq!(a.call_count(), 3);
}

/// Rotation survives a "process restart": a second manager sharing the
/// state file sees the persisted selection and resets it once stale.
#[tokio::test]
async fn persisted_state_survives_restart_and_staleness_resets() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join(".mend").join("rotation_state.json");

    let a = Arc::new(MockBackendClient::new().always_usage_limit("quota"));
    let b = Arc::new(MockBackendClient::new().with_response("answer"));
    let mut first = manager(
        &[("a", a.clone()), ("b", b.clone())],
        vec![spec("a", 0), spec("b", 0)],
    )
    .with_state_store(RotationStateStore::new(&path));

    first.invoke("prompt").await.unwrap();
    assert_eq!(first.active_backend(), "b");

    // Restart: fresh manager, same file.
    let reloaded = RotationStateStore::new(&path).load().expect("state");
    assert_eq!(reloaded.current_backend, "b");

    // Backdate the switch, then a new manager treats it as stale.
    RotationStateStore::new(&path).save("b", 1_000.0);
    let a2 = Arc::new(MockBackendClient::new());
    let mut second = manager(&[("a", a2)], vec![spec("a", 0), spec("b", 0)])
        .with_state_store(RotationStateStore::new(&path));
    assert!(second.maybe_reset_stale(3600.0));
    assert_eq!(second.active_backend(), "a");
}

/// Loading state degrades to `None` for a missing file, a non-JSON
/// file, and a JSON object missing a required key.
#[test]
fn persistence_degrades_silently() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("state.json");

    assert!(RotationStateStore::new(&path).load().is_none());

    std::fs::write(&path, "definitely not json").unwrap();
    assert!(RotationStateStore::new(&path).load().is_none());

    std::fs::write(&path, r#"{"last_switch_timestamp": 12.0}"#).unwrap();
    assert!(RotationStateStore::new(&path).load().is_none());

    std::fs::write(
        &path,
        r#"{"current_backend": "b", "last_switch_timestamp": 12.0}"#,
    )
    .unwrap();
    assert!(RotationStateStore::new(&path).load().is_some());
}
