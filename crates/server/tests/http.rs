// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Integration tests for the REST API.
//!
//! Uses `axum_test::TestServer` — no real TCP needed. Instance rows are
//! inserted through the registry directly where a live backend is not part
//! of the behavior under test.

use std::sync::Arc;

use axum_test::TestServer;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use flotilla::config::ServerConfig;
use flotilla::db::Db;
use flotilla::state::AppState;
use flotilla::transport::build_router;

fn test_state() -> Arc<AppState> {
    let db = Arc::new(Db::open_in_memory().expect("open in-memory db"));
    AppState::new(ServerConfig::default(), db, CancellationToken::new())
}

fn test_server(state: Arc<AppState>) -> TestServer {
    TestServer::new(build_router(state)).expect("failed to create test server")
}

// -- Health --------------------------------------------------------------------

#[tokio::test]
async fn health_is_ok_without_envelope() {
    let server = test_server(test_state());
    let resp = server.get("/api/health").await;
    resp.assert_status_ok();

    let body: Value = resp.json();
    assert_eq!(body["status"], "ok");
    assert!(body["timestamp"].is_i64());
}

// -- Instances -----------------------------------------------------------------

#[tokio::test]
async fn list_starts_empty() {
    let server = test_server(test_state());
    let body: Value = server.get("/api/instances").await.json();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn create_requires_name_and_working_dir() {
    let server = test_server(test_state());
    let resp = server.post("/api/instances").json(&json!({ "name": "", "workingDir": "~" })).await;
    resp.assert_status(axum::http::StatusCode::BAD_REQUEST);

    let body: Value = resp.json();
    assert_eq!(body["success"], false);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn create_rejects_unknown_machine() {
    let server = test_server(test_state());
    let resp = server
        .post("/api/instances")
        .json(&json!({
            "name": "a",
            "workingDir": "~",
            "machineBinding": { "type": "remote", "machineId": "ghost" },
        }))
        .await;
    resp.assert_status(axum::http::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn create_spawns_shell_and_delete_closes() {
    let state = test_state();
    let server = test_server(Arc::clone(&state));

    let resp = server
        .post("/api/instances")
        .json(&json!({ "name": "sandbox", "workingDir": "/tmp" }))
        .await;
    resp.assert_status(axum::http::StatusCode::CREATED);

    let body: Value = resp.json();
    assert_eq!(body["success"], true);
    let instance = &body["data"];
    assert_eq!(instance["status"], "idle");
    assert_eq!(instance["pinned"], false);
    let id = instance["id"].as_str().expect("instance id").to_owned();
    assert!(state.manager.has(&id).await);

    let list: Value = server.get("/api/instances").await.json();
    assert_eq!(list["data"].as_array().expect("array").len(), 1);

    let resp = server.delete(&format!("/api/instances/{id}")).await;
    resp.assert_status_ok();
    let list: Value = server.get("/api/instances").await.json();
    assert_eq!(list["data"], json!([]));

    // Row retained, stamped closed.
    let row: Value = server.get(&format!("/api/instances/{id}")).await.json();
    assert!(row["data"]["closedAt"].is_i64());
}

#[tokio::test]
async fn patch_renames_pins_and_routes_status_via_reconciler() {
    let state = test_state();
    state.db.insert_instance("i1", "alpha", "/srv/a", None).expect("insert");
    let server = test_server(state);

    let resp = server
        .patch("/api/instances/i1")
        .json(&json!({ "name": "bravo", "pinned": true, "status": "awaiting" }))
        .await;
    resp.assert_status_ok();

    let body: Value = resp.json();
    assert_eq!(body["data"]["name"], "bravo");
    assert_eq!(body["data"]["pinned"], true);
    assert_eq!(body["data"]["status"], "awaiting");

    let resp = server.patch("/api/instances/i1").json(&json!({ "status": "sideways" })).await;
    resp.assert_status(axum::http::StatusCode::BAD_REQUEST);

    let resp = server.patch("/api/instances/ghost").json(&json!({ "pinned": true })).await;
    resp.assert_status(axum::http::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn reorder_is_atomic_and_broadcast() {
    let state = test_state();
    for id in ["a", "b", "c"] {
        state.db.insert_instance(id, id, "/srv", None).expect("insert");
    }
    let mut bus_rx = state.bus.subscribe();
    let server = test_server(Arc::clone(&state));

    let resp =
        server.post("/api/instances/reorder").json(&json!({ "ids": ["c", "a", "b"] })).await;
    resp.assert_status_ok();

    let list: Value = server.get("/api/instances").await.json();
    let ids: Vec<&str> =
        list["data"].as_array().expect("array").iter().filter_map(|i| i["id"].as_str()).collect();
    assert_eq!(ids, ["c", "a", "b"]);

    match bus_rx.try_recv().expect("reorder event") {
        flotilla::bus::BusEvent::InstanceReordered { ordinals } => {
            assert_eq!(ordinals.len(), 3);
            assert_eq!(ordinals[0].id, "c");
            assert_eq!(ordinals[0].display_order, 0);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // Unknown id → 404, nothing rewritten.
    let resp =
        server.post("/api/instances/reorder").json(&json!({ "ids": ["b", "ghost"] })).await;
    resp.assert_status(axum::http::StatusCode::NOT_FOUND);
    let list: Value = server.get("/api/instances").await.json();
    let ids: Vec<&str> =
        list["data"].as_array().expect("array").iter().filter_map(|i| i["id"].as_str()).collect();
    assert_eq!(ids, ["c", "a", "b"]);
}

// -- Hooks ---------------------------------------------------------------------

#[tokio::test]
async fn hook_flow_drives_status() {
    let state = test_state();
    state.db.insert_instance("i1", "alpha", "/srv/a", None).expect("insert");
    let server = test_server(Arc::clone(&state));

    let resp = server
        .post("/api/hooks/status")
        .json(&json!({ "event": "working", "instanceId": "i1", "projectDir": "/srv/a" }))
        .await;
    resp.assert_status_ok();
    let body: Value = server.get("/api/instances/i1").await.json();
    assert_eq!(body["data"]["status"], "working");

    let resp =
        server.post("/api/hooks/stop").json(&json!({ "instanceId": "i1", "projectDir": "/srv/a" })).await;
    resp.assert_status_ok();
    let body: Value = server.get("/api/instances/i1").await.json();
    assert_eq!(body["data"]["status"], "idle");

    // The stop hook armed the grace window: pollers defer.
    assert!(state.window.should_defer_to_hook("i1"));
}

#[tokio::test]
async fn hook_with_unknown_instance_is_404() {
    let server = test_server(test_state());
    let resp = server
        .post("/api/hooks/status")
        .json(&json!({ "event": "working", "instanceId": "ghost" }))
        .await;
    resp.assert_status(axum::http::StatusCode::NOT_FOUND);

    let resp = server.post("/api/hooks/notification").json(&json!({ "instanceId": "ghost" })).await;
    resp.assert_status(axum::http::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unrecognized_hook_events_are_dropped() {
    let state = test_state();
    state.db.insert_instance("i1", "alpha", "/srv/a", None).expect("insert");
    let server = test_server(Arc::clone(&state));

    let resp = server
        .post("/api/hooks/status")
        .json(&json!({ "event": "celebrate", "instanceId": "i1" }))
        .await;
    resp.assert_status_ok();
    let body: Value = resp.json();
    assert_eq!(body["data"]["ignored"], true);

    let row: Value = server.get("/api/instances/i1").await.json();
    assert_eq!(row["data"]["status"], "idle");
}

#[tokio::test]
async fn reset_status_forces_idle() {
    let state = test_state();
    state.db.insert_instance("i1", "alpha", "/srv/a", None).expect("insert");
    let server = test_server(Arc::clone(&state));

    server
        .post("/api/hooks/status")
        .json(&json!({ "event": "working", "instanceId": "i1" }))
        .await
        .assert_status_ok();

    let resp = server.post("/api/instances/i1/reset-status").await;
    resp.assert_status_ok();
    let body: Value = resp.json();
    assert_eq!(body["data"]["status"], "idle");
}

// -- Ports ---------------------------------------------------------------------

#[tokio::test]
async fn ports_require_remote_binding() {
    let state = test_state();
    state.db.insert_instance("i1", "alpha", "/srv/a", None).expect("insert");
    let server = test_server(state);

    let resp =
        server.post("/api/instances/i1/ports").json(&json!({ "remotePort": 8080 })).await;
    resp.assert_status(axum::http::StatusCode::BAD_REQUEST);

    let resp = server.get("/api/instances/ghost/ports").await;
    resp.assert_status(axum::http::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn port_rows_survive_for_closed_listing() {
    let state = test_state();
    state.db.insert_instance("i1", "alpha", "/srv/a", None).expect("insert");
    state.db.insert_forward("f1", "i1", 8080, 40001).expect("insert forward");
    state.db.sweep_stale_forwards().expect("sweep");
    let server = test_server(state);

    let body: Value = server.get("/api/instances/i1/ports").await.json();
    let forwards = body["data"].as_array().expect("array");
    assert_eq!(forwards.len(), 1);
    assert_eq!(forwards[0]["status"], "closed");
}

// -- Machines ------------------------------------------------------------------

#[tokio::test]
async fn machine_lifecycle_and_conflict() {
    let state = test_state();
    let server = test_server(Arc::clone(&state));

    let resp = server
        .post("/api/machines")
        .json(&json!({ "host": "build-box", "username": "deploy", "forwardCredentials": true }))
        .await;
    resp.assert_status(axum::http::StatusCode::CREATED);
    let body: Value = resp.json();
    let machine_id = body["data"]["id"].as_str().expect("machine id").to_owned();
    assert_eq!(body["data"]["port"], 22);

    let list: Value = server.get("/api/machines").await.json();
    assert_eq!(list["data"].as_array().expect("array").len(), 1);

    state.db.insert_instance("i1", "alpha", "/srv/a", Some(&machine_id)).expect("insert");
    let resp = server.delete(&format!("/api/machines/{machine_id}")).await;
    resp.assert_status(axum::http::StatusCode::CONFLICT);

    state.db.close_instance("i1").expect("close");
    let resp = server.delete(&format!("/api/machines/{machine_id}")).await;
    resp.assert_status_ok();

    let resp = server.delete("/api/machines/ghost").await;
    resp.assert_status(axum::http::StatusCode::NOT_FOUND);
}
