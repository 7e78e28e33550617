//! Lifecycle engine tests against the in-memory backend.
//!
//! These cover the retry contract the orchestrator relies on: repeated and
//! concurrent calls converge on one machine, and interrupted calls can be
//! resumed from the state blob they returned.

use std::sync::Arc;
use std::time::Duration;

use mcm_provider::engine::{Engine, EngineConfig};
use mcm_provider::memory::{MEMORY_CSI_DRIVER, MemoryBackend, MemoryOptions};
use mcm_provider::state::{self, StatePhase};
use mcm_provider::identity::IdentityTags;
use mcm_provider::types::{InstanceSpec, InstanceState, MachineRequest, Tags};
use mcm_provider::{CloudBackend, Code, volumes};
use serde_json::json;
use tokio::time::Instant;

fn config() -> EngineConfig {
    EngineConfig {
        poll_interval: Duration::from_millis(5),
        create_timeout: Duration::from_secs(5),
        delete_timeout: Duration::from_secs(5),
        shutdown_timeout: Duration::from_secs(5),
    }
}

fn setup(options: MemoryOptions) -> (Arc<MemoryBackend>, Engine) {
    let backend = Arc::new(MemoryBackend::new(options));
    let engine = Engine::new(backend.clone(), config());
    (backend, engine)
}

fn request(name: &str, class: &str, token: &str) -> MachineRequest {
    let spec = json!({
        "provider": "memory",
        "machineClass": class,
        "correlationToken": token,
        "image": "ubuntu-24.04",
        "tags": { "team": "infra" },
    });
    MachineRequest {
        name: name.into(),
        provider_spec: serde_json::to_vec(&spec).unwrap(),
        ..Default::default()
    }
}

fn with_state(mut req: MachineRequest, state: Vec<u8>) -> MachineRequest {
    req.last_known_state = Some(state);
    req
}

async fn live(backend: &MemoryBackend) -> usize {
    backend
        .instances()
        .await
        .into_iter()
        .filter(|i| i.state != InstanceState::Destroying)
        .count()
}

// =============================================================================
// Create
// =============================================================================

#[tokio::test]
async fn create_is_idempotent() {
    let (backend, engine) = setup(MemoryOptions::default());
    let req = request("node-a", "workers", "uid-a");

    let first = engine.create(&req, None).await.unwrap();
    let second = engine
        .create(&with_state(req.clone(), first.last_known_state.clone()), None)
        .await
        .unwrap();

    assert_eq!(first.provider_id, second.provider_id);
    assert_eq!(first.node_name, "node-a");
    assert_eq!(backend.creates().await, 1);
    assert_eq!(live(&backend).await, 1);

    let decoded = state::decode(Some(second.last_known_state.as_slice())).unwrap().unwrap();
    assert_eq!(decoded.phase, StatePhase::Running);
    assert_eq!(decoded.provider_id.as_deref(), Some(first.provider_id.to_string().as_str()));
}

#[tokio::test]
async fn create_with_lost_response_adopts_existing() {
    let (backend, engine) = setup(MemoryOptions::default());
    let req = request("node-a", "workers", "uid-a");

    let first = engine.create(&req, None).await.unwrap();
    // The orchestrator never saw the response and retries without state.
    let retry = engine.create(&req, None).await.unwrap();

    assert_eq!(first.provider_id, retry.provider_id);
    assert_eq!(backend.creates().await, 1);
}

#[tokio::test]
async fn reused_name_with_new_token_gets_new_machine() {
    let (backend, engine) = setup(MemoryOptions::default());

    let old = engine.create(&request("node-a", "workers", "uid-old"), None).await.unwrap();
    // Same name, new object: the stale blob points at the old machine.
    let new_req = with_state(request("node-a", "workers", "uid-new"), old.last_known_state.clone());
    let new = engine.create(&new_req, None).await.unwrap();

    assert_ne!(old.provider_id, new.provider_id);
    assert_eq!(live(&backend).await, 2);
}

#[tokio::test]
async fn concurrent_creates_converge_on_one_machine() {
    let (backend, engine) = setup(MemoryOptions {
        create_latency: Duration::from_millis(10),
        ..Default::default()
    });
    let engine = Arc::new(engine);
    let req = request("node-a", "workers", "uid-a");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            let req = req.clone();
            tokio::spawn(async move { engine.create(&req, None).await })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap().provider_id);
    }

    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(backend.creates().await, 1);
    assert_eq!(live(&backend).await, 1);
}

#[tokio::test]
async fn racy_creates_delete_their_duplicates() {
    let (backend, engine) = setup(MemoryOptions {
        create_if_absent: false,
        create_latency: Duration::from_millis(20),
        ..Default::default()
    });
    let engine = Arc::new(engine);
    let req = request("node-a", "workers", "uid-a");

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let engine = engine.clone();
            let req = req.clone();
            tokio::spawn(async move { engine.create(&req, None).await })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap().provider_id);
    }

    ids.dedup();
    assert_eq!(ids.len(), 1, "all creators must report the same machine");
    assert_eq!(live(&backend).await, 1);

    let status = engine.status(&req, None).await.unwrap();
    assert_eq!(status.provider_id, ids[0]);
}

#[tokio::test]
async fn racy_creates_with_unordered_ids_keep_the_oldest() {
    let (backend, engine) = setup(MemoryOptions {
        create_if_absent: false,
        create_latency: Duration::from_millis(20),
        descending_ids: true,
        ..Default::default()
    });
    let engine = Arc::new(engine);
    let req = request("node-a", "workers", "uid-a");

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let engine = engine.clone();
            let req = req.clone();
            tokio::spawn(async move { engine.create(&req, None).await })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap().provider_id);
    }

    ids.dedup();
    assert_eq!(ids.len(), 1, "all creators must report the same machine");
    assert_eq!(live(&backend).await, 1);

    // Later creates got smaller IDs, so the survivor is the first one made.
    let survivor = backend
        .instances()
        .await
        .into_iter()
        .find(|i| i.state != InstanceState::Destroying)
        .unwrap();
    assert_eq!(survivor.id, ids[0].instance);
    assert_eq!(survivor.id.0, "m-999998");
}

#[tokio::test]
async fn create_deadline_is_recoverable() {
    let (backend, engine) = setup(MemoryOptions::default());
    backend.hang_creates(true).await;
    let req = request("node-a", "workers", "uid-a");

    let deadline = Instant::now() + Duration::from_millis(60);
    let err = engine.create(&req, Some(deadline)).await.unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);

    let marker = state::decode(err.last_known_state()).unwrap().unwrap();
    assert_eq!(marker.phase, StatePhase::Creating);
    assert!(marker.provider_id.is_some());
    assert!(marker.started_at.is_some());

    backend.hang_creates(false).await;
    let retry = engine
        .create(&with_state(req, err.last_known_state().unwrap().to_vec()), None)
        .await
        .unwrap();

    assert_eq!(Some(retry.provider_id.to_string()), marker.provider_id);
    assert_eq!(backend.creates().await, 1);
}

#[tokio::test]
async fn create_deadline_retry_without_state_finds_machine() {
    let (backend, engine) = setup(MemoryOptions::default());
    backend.hang_creates(true).await;
    let req = request("node-a", "workers", "uid-a");

    let err = engine
        .create(&req, Some(Instant::now() + Duration::from_millis(30)))
        .await
        .unwrap_err();
    assert!(err.code().is_retryable());

    backend.hang_creates(false).await;
    engine.create(&req, None).await.unwrap();
    assert_eq!(backend.creates().await, 1);
}

#[tokio::test]
async fn create_while_terminating_is_retryable() {
    let (backend, engine) = setup(MemoryOptions {
        destroy_polls: 10_000,
        ..Default::default()
    });
    let req = request("node-a", "workers", "uid-a");
    engine.create(&req, None).await.unwrap();

    let err = engine
        .delete(&req, Some(Instant::now() + Duration::from_millis(30)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);
    let marker = state::decode(err.last_known_state()).unwrap().unwrap();
    assert_eq!(marker.phase, StatePhase::Deleting);

    let err = engine.create(&req, None).await.unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    assert_eq!(backend.creates().await, 1);
}

#[tokio::test]
async fn create_conflict_adopts_unlisted_machine() {
    let (backend, engine) = setup(MemoryOptions {
        listing_lag: 1,
        ..Default::default()
    });
    let req = request("node-a", "workers", "uid-a");

    // An earlier attempt created the machine but the listing lags behind.
    let spec = InstanceSpec {
        name: "node-a".into(),
        image: None,
        location: None,
        cpu_millicores: 1000,
        memory_mb: 2048,
        env: Default::default(),
        tags: IdentityTags::new("workers", "uid-a").apply(&Tags::new()),
    };
    let earlier = backend.create_instance(&spec).await.unwrap();

    let created = engine.create(&req, None).await.unwrap();
    assert_eq!(created.provider_id.instance, earlier.id);
    assert_eq!(backend.creates().await, 1);
}

// =============================================================================
// Delete
// =============================================================================

#[tokio::test]
async fn delete_of_never_created_machine_succeeds() {
    let (_backend, engine) = setup(MemoryOptions::default());

    let blob = engine.delete(&request("node-a", "workers", "uid-a"), None).await.unwrap();
    let state = state::decode(Some(blob.as_slice())).unwrap().unwrap();
    assert_eq!(state.phase, StatePhase::Absent);
}

#[tokio::test]
async fn delete_twice_leaves_nothing() {
    let (backend, engine) = setup(MemoryOptions::default());
    let req = request("node-a", "workers", "uid-a");
    let created = engine.create(&req, None).await.unwrap();

    let blob = engine
        .delete(&with_state(req.clone(), created.last_known_state), None)
        .await
        .unwrap();
    engine.delete(&with_state(req, blob), None).await.unwrap();

    assert!(backend.instances().await.is_empty());
}

#[tokio::test]
async fn delete_removes_duplicates_sharing_identity() {
    let (racy, engine) = setup(MemoryOptions {
        create_if_absent: false,
        ..Default::default()
    });
    let req = request("node-a", "workers", "uid-a");

    // Two machines with one identity, as left behind by an interrupted race.
    let spec = InstanceSpec {
        name: "node-a".into(),
        image: None,
        location: None,
        cpu_millicores: 1000,
        memory_mb: 1024,
        env: Default::default(),
        tags: IdentityTags::new("workers", "uid-a").apply(&Tags::new()),
    };
    racy.create_instance(&spec).await.unwrap();
    racy.create_instance(&spec).await.unwrap();

    engine.delete(&req, None).await.unwrap();
    assert!(racy.instances().await.is_empty());
}

// =============================================================================
// Status
// =============================================================================

#[tokio::test]
async fn status_of_missing_machine_is_not_found() {
    let (_backend, engine) = setup(MemoryOptions::default());
    let req = request("node-a", "workers", "uid-a");

    let err = engine.status(&req, None).await.unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    engine.create(&req, None).await.unwrap();
    let record = engine.status(&req, None).await.unwrap();
    assert_eq!(record.node_name, "node-a");
    assert_eq!(record.tags["team"], "infra");

    engine.delete(&req, None).await.unwrap();
    let err = engine.status(&req, None).await.unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn status_during_outage_is_unavailable_not_absent() {
    let (backend, engine) = setup(MemoryOptions::default());
    backend.inject_faults(1).await;

    let err = engine.status(&request("node-a", "workers", "uid-a"), None).await.unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
}

#[tokio::test]
async fn status_ignores_hint_for_evicted_machine() {
    let (backend, engine) = setup(MemoryOptions::default());
    let req = request("node-a", "workers", "uid-a");
    let created = engine.create(&req, None).await.unwrap();

    backend.evict(&created.provider_id.instance).await;
    let err = engine
        .status(&with_state(req, created.last_known_state), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn failed_lookups_hand_back_the_state() {
    let (backend, engine) = setup(MemoryOptions::default());
    let req = request("node-a", "workers", "uid-a");
    let created = engine.create(&req, None).await.unwrap();
    let req = with_state(req, created.last_known_state.clone());
    let sent = state::decode(Some(created.last_known_state.as_slice())).unwrap();

    backend.inject_faults(1).await;
    let err = engine.create(&req, None).await.unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    assert_eq!(state::decode(err.last_known_state()).unwrap(), sent);

    backend.inject_faults(1).await;
    let err = engine.delete(&req, None).await.unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    let kept = state::decode(err.last_known_state()).unwrap().unwrap();
    assert_eq!(kept.phase, StatePhase::Running);
    assert_eq!(kept.provider_id.as_deref(), Some(created.provider_id.to_string().as_str()));

    backend.inject_faults(1).await;
    let err = engine.shutdown(&req, None).await.unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    assert_eq!(state::decode(err.last_known_state()).unwrap(), sent);

    assert_eq!(live(&backend).await, 1);
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn shutdown_stops_and_is_idempotent() {
    let (backend, engine) = setup(MemoryOptions::default());
    let req = request("node-a", "workers", "uid-a");
    engine.create(&req, None).await.unwrap();

    let blob = engine.shutdown(&req, None).await.unwrap();
    assert_eq!(state::decode(Some(blob.as_slice())).unwrap().unwrap().phase, StatePhase::Stopped);
    assert_eq!(backend.instances().await[0].state, InstanceState::Stopped);

    let again = engine.shutdown(&with_state(req.clone(), blob), None).await.unwrap();
    assert_eq!(state::decode(Some(again.as_slice())).unwrap().unwrap().phase, StatePhase::Stopped);

    // A stopped machine still exists for create and delete.
    engine.create(&req, None).await.unwrap();
    assert_eq!(backend.creates().await, 1);
    engine.delete(&req, None).await.unwrap();
    assert!(backend.instances().await.is_empty());
}

#[tokio::test]
async fn shutdown_of_terminating_machine_is_a_no_op() {
    let (backend, engine) = setup(MemoryOptions {
        destroy_polls: 10_000,
        ..Default::default()
    });
    let req = request("node-a", "workers", "uid-a");
    engine.create(&req, None).await.unwrap();
    engine
        .delete(&req, Some(Instant::now() + Duration::from_millis(30)))
        .await
        .unwrap_err();

    let blob = engine.shutdown(&req, None).await.unwrap();
    let state = state::decode(Some(blob.as_slice())).unwrap().unwrap();
    assert_eq!(state.phase, StatePhase::Deleting);
    assert_eq!(backend.instances().await[0].state, InstanceState::Destroying);
}

#[tokio::test]
async fn shutdown_deadline_returns_stopping_marker() {
    let (_backend, engine) = setup(MemoryOptions {
        stop_polls: 10_000,
        ..Default::default()
    });
    let req = request("node-a", "workers", "uid-a");
    let created = engine.create(&req, None).await.unwrap();

    let err = engine
        .shutdown(&req, Some(Instant::now() + Duration::from_millis(30)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);

    let marker = state::decode(err.last_known_state()).unwrap().unwrap();
    assert_eq!(marker.phase, StatePhase::Stopping);
    assert_eq!(marker.provider_id.as_deref(), Some(created.provider_id.to_string().as_str()));
    assert!(marker.started_at.is_some());
}

#[tokio::test]
async fn shutdown_of_missing_machine_is_not_found() {
    let (_backend, engine) = setup(MemoryOptions::default());
    let err = engine
        .shutdown(&request("node-a", "workers", "uid-a"), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

// =============================================================================
// List
// =============================================================================

#[tokio::test]
async fn list_returns_machines_of_one_class() {
    let (_backend, engine) = setup(MemoryOptions::default());
    let a = engine.create(&request("node-a", "workers", "uid-a"), None).await.unwrap();
    let b = engine.create(&request("node-b", "workers", "uid-b"), None).await.unwrap();
    engine.create(&request("db-0", "databases", "uid-c"), None).await.unwrap();

    let class_spec = serde_json::to_vec(&json!({"provider": "memory", "machineClass": "workers"})).unwrap();
    let machines = engine.list(&class_spec, None).await.unwrap();

    assert_eq!(machines.len(), 2);
    assert_eq!(machines[&a.provider_id.to_string()], "node-a");
    assert_eq!(machines[&b.provider_id.to_string()], "node-b");
}

// =============================================================================
// Caller errors
// =============================================================================

#[tokio::test]
async fn caller_errors_are_classified() {
    let (_backend, engine) = setup(MemoryOptions::default());
    let good = request("node-a", "workers", "uid-a");

    let mut wrong_provider = good.clone();
    wrong_provider.provider_spec =
        serde_json::to_vec(&json!({"provider": "fly", "machineClass": "workers", "correlationToken": "t"})).unwrap();
    assert_eq!(engine.create(&wrong_provider, None).await.unwrap_err().code(), Code::InvalidArgument);

    let mut no_token = good.clone();
    no_token.provider_spec = serde_json::to_vec(&json!({"provider": "memory", "machineClass": "workers"})).unwrap();
    assert_eq!(engine.delete(&no_token, None).await.unwrap_err().code(), Code::InvalidArgument);

    let mut unnamed = good.clone();
    unnamed.name = " ".into();
    assert_eq!(engine.create(&unnamed, None).await.unwrap_err().code(), Code::InvalidArgument);

    let corrupt = with_state(good.clone(), b"\x00garbage".to_vec());
    assert_eq!(engine.create(&corrupt, None).await.unwrap_err().code(), Code::Internal);

    let future = with_state(good, br#"{"version":99,"anything":true}"#.to_vec());
    engine.create(&future, None).await.unwrap();
}

// =============================================================================
// Volumes
// =============================================================================

#[tokio::test]
async fn volume_ids_skip_unresolvable_and_keep_order() {
    let backend = Arc::new(MemoryBackend::default());
    let data = backend.add_volume("data").await;
    let logs = backend.add_volume("logs").await;
    let backends: Vec<Arc<dyn CloudBackend>> = vec![backend];

    let raw = serde_json::to_vec(&json!([
        {"csi": {"driver": MEMORY_CSI_DRIVER, "volumeHandle": "logs"}},
        {"csi": {"driver": MEMORY_CSI_DRIVER, "volumeHandle": "missing"}},
        {"csi": {"driver": MEMORY_CSI_DRIVER, "volumeHandle": data}},
    ]))
    .unwrap();

    let ids = volumes::extract_volume_ids(&backends, &raw).await.unwrap();
    assert_eq!(ids, vec![logs, data]);
}

#[tokio::test]
async fn volume_ids_reject_malformed_lists() {
    let backends: Vec<Arc<dyn CloudBackend>> = vec![Arc::new(MemoryBackend::default())];

    let err = volumes::extract_volume_ids(&backends, br#"[{"csi": {"driver": "x", "volumeH"#)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn volume_lookup_failures_are_skipped() {
    let backend = Arc::new(MemoryBackend::default());
    let data = backend.add_volume("data").await;
    backend.inject_faults(1).await;
    let backends: Vec<Arc<dyn CloudBackend>> = vec![backend];

    let raw = serde_json::to_vec(&json!([
        {"csi": {"driver": MEMORY_CSI_DRIVER, "volumeHandle": "data"}},
        {"csi": {"driver": MEMORY_CSI_DRIVER, "volumeHandle": "data"}},
    ]))
    .unwrap();

    let ids = volumes::extract_volume_ids(&backends, &raw).await.unwrap();
    assert_eq!(ids, vec![data]);
}
