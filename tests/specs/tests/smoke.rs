// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenarios over real HTTP and WebSocket: instance lifecycle,
//! terminal round trips, hook-priority arbitration, and restart recovery.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

use flotilla::db::Db;
use flotilla::status::{Status, StatusSource};
use flotilla_specs::TestDaemon;

const TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn ws_connect(daemon: &TestDaemon) -> anyhow::Result<WsStream> {
    let (socket, _) = tokio_tungstenite::connect_async(daemon.ws_url()).await?;
    Ok(socket)
}

async fn send_frame(socket: &mut WsStream, frame: Value) -> anyhow::Result<()> {
    socket.send(Message::Text(frame.to_string().into())).await?;
    Ok(())
}

/// Read frames until one matches the predicate, bounded by TIMEOUT.
async fn wait_for_frame(
    socket: &mut WsStream,
    mut pred: impl FnMut(&Value) -> bool,
) -> anyhow::Result<Value> {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let msg = tokio::time::timeout_at(deadline, socket.next())
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for frame"))?
            .ok_or_else(|| anyhow::anyhow!("socket closed"))??;
        if let Message::Text(text) = msg {
            let value: Value = serde_json::from_str(&text)?;
            if pred(&value) {
                return Ok(value);
            }
        }
    }
}

async fn create_instance(daemon: &TestDaemon, name: &str) -> anyhow::Result<String> {
    let client = reqwest::Client::new();
    let resp: Value = client
        .post(format!("{}/api/instances", daemon.base_url()))
        .json(&json!({ "name": name, "workingDir": "/tmp" }))
        .send()
        .await?
        .json()
        .await?;
    anyhow::ensure!(resp["success"] == true, "create failed: {resp}");
    Ok(resp["data"]["id"].as_str().unwrap_or_default().to_owned())
}

// -- S1: create → list ---------------------------------------------------------

#[tokio::test]
async fn create_returns_idle_and_lists_once() -> anyhow::Result<()> {
    let daemon = TestDaemon::start().await?;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/instances", daemon.base_url()))
        .json(&json!({ "name": "a", "workingDir": "~" }))
        .send()
        .await?;
    anyhow::ensure!(resp.status() == 201, "expected 201, got {}", resp.status());
    let body: Value = resp.json().await?;
    anyhow::ensure!(body["data"]["status"] == "idle");

    let list: Value =
        client.get(format!("{}/api/instances", daemon.base_url())).send().await?.json().await?;
    let items = list["data"].as_array().map(Vec::len).unwrap_or(0);
    anyhow::ensure!(items == 1, "expected one instance, got {items}");
    anyhow::ensure!(list["data"][0]["pinned"] == false);

    daemon.stop().await;
    Ok(())
}

// -- S2: attach, type, see output ----------------------------------------------

#[tokio::test]
async fn attached_client_sees_shell_output() -> anyhow::Result<()> {
    let daemon = TestDaemon::start().await?;
    let id = create_instance(&daemon, "echo-box").await?;

    let mut socket = ws_connect(&daemon).await?;
    send_frame(&mut socket, json!({ "type": "attach", "instanceId": id })).await?;

    // History snapshot always arrives first.
    let history = wait_for_frame(&mut socket, |f| f["type"] == "terminal:history").await?;
    anyhow::ensure!(history["id"] == id.as_str());

    send_frame(
        &mut socket,
        json!({ "type": "terminal:input", "id": id, "data": "echo flotilla-smoke\n" }),
    )
    .await?;

    // The echoed command and its output both arrive as terminal:data.
    let mut seen = Vec::new();
    wait_for_frame(&mut socket, |f| {
        if f["type"] == "terminal:data" && f["id"] == id.as_str() {
            if let Some(data) = f["data"].as_str() {
                if let Ok(bytes) = BASE64.decode(data) {
                    seen.extend_from_slice(&bytes);
                }
            }
        }
        String::from_utf8_lossy(&seen).contains("flotilla-smoke")
    })
    .await?;

    daemon.stop().await;
    Ok(())
}

// -- Scrollback replay on reattach ---------------------------------------------

#[tokio::test]
async fn reattach_replays_scrollback() -> anyhow::Result<()> {
    let daemon = TestDaemon::start().await?;
    let id = create_instance(&daemon, "replay-box").await?;

    {
        let mut socket = ws_connect(&daemon).await?;
        send_frame(&mut socket, json!({ "type": "attach", "instanceId": id })).await?;
        wait_for_frame(&mut socket, |f| f["type"] == "terminal:history").await?;
        send_frame(
            &mut socket,
            json!({ "type": "terminal:input", "id": id, "data": "echo replay-marker\n" }),
        )
        .await?;
        // Wait until the marker hit the scrollback, then drop the client.
        let mut seen = Vec::new();
        wait_for_frame(&mut socket, |f| {
            if f["type"] == "terminal:data" {
                if let Some(data) = f["data"].as_str() {
                    if let Ok(bytes) = BASE64.decode(data) {
                        seen.extend_from_slice(&bytes);
                    }
                }
            }
            String::from_utf8_lossy(&seen).contains("replay-marker")
        })
        .await?;
    }

    // A fresh client's history snapshot reconstructs the session.
    let mut socket = ws_connect(&daemon).await?;
    send_frame(&mut socket, json!({ "type": "attach", "instanceId": id })).await?;
    let history = wait_for_frame(&mut socket, |f| f["type"] == "terminal:history").await?;
    let bytes = BASE64.decode(history["data"].as_str().unwrap_or_default())?;
    anyhow::ensure!(
        String::from_utf8_lossy(&bytes).contains("replay-marker"),
        "history missing marker"
    );

    daemon.stop().await;
    Ok(())
}

// -- S3 + S4: hooks beat pollers -----------------------------------------------

#[tokio::test]
async fn hooks_drive_status_and_outrank_polls() -> anyhow::Result<()> {
    let daemon = TestDaemon::start().await?;
    // Registry row only: hook arbitration needs no live backend.
    daemon.state.db.insert_instance("i1", "alpha", "/srv/a", None)?;
    let client = reqwest::Client::new();

    let mut socket = ws_connect(&daemon).await?;
    // Prime the connection so the bus subscription is live.
    send_frame(&mut socket, json!({ "type": "ping" })).await?;
    wait_for_frame(&mut socket, |f| f["type"] == "pong").await?;

    let resp = client
        .post(format!("{}/api/hooks/status", daemon.base_url()))
        .json(&json!({ "event": "working", "instanceId": "i1", "projectDir": "/srv/a" }))
        .send()
        .await?;
    anyhow::ensure!(resp.status().is_success());

    let frame = wait_for_frame(&mut socket, |f| f["type"] == "status:changed").await?;
    anyhow::ensure!(frame["status"] == "working");

    let resp = client
        .post(format!("{}/api/hooks/stop", daemon.base_url()))
        .json(&json!({ "instanceId": "i1", "projectDir": "/srv/a" }))
        .send()
        .await?;
    anyhow::ensure!(resp.status().is_success());
    let frame = wait_for_frame(&mut socket, |f| f["type"] == "status:changed").await?;
    anyhow::ensure!(frame["status"] == "idle");

    // A poller sees a 5s-old session log and proposes `working` — the stop
    // hook recorded moments ago must win.
    let applied = daemon
        .state
        .reconciler
        .submit_poll("i1", Status::Working, StatusSource::LocalPoll)
        .await?;
    anyhow::ensure!(!applied, "poll observation should have been deferred");

    let row: Value = client
        .get(format!("{}/api/instances/i1", daemon.base_url()))
        .send()
        .await?
        .json()
        .await?;
    anyhow::ensure!(row["data"]["status"] == "idle");

    daemon.stop().await;
    Ok(())
}

// -- Attach to unknown id keeps the channel open -------------------------------

#[tokio::test]
async fn attach_unknown_id_errors_but_channel_survives() -> anyhow::Result<()> {
    let daemon = TestDaemon::start().await?;
    let mut socket = ws_connect(&daemon).await?;

    send_frame(&mut socket, json!({ "type": "attach", "instanceId": "ghost" })).await?;
    let frame = wait_for_frame(&mut socket, |f| f["type"] == "error").await?;
    anyhow::ensure!(frame["code"] == "not_found");

    // Channel still serves requests.
    send_frame(&mut socket, json!({ "type": "ping" })).await?;
    wait_for_frame(&mut socket, |f| f["type"] == "pong").await?;

    daemon.stop().await;
    Ok(())
}

// -- S6: port-forward rows sweep to closed across restarts ---------------------

#[tokio::test]
async fn forwards_read_closed_after_restart() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db_path = dir.path().join("state.db");

    {
        let db = Db::open(&db_path)?;
        db.insert_instance("i1", "alpha", "/srv/a", None)?;
        for n in 0..5u16 {
            db.insert_forward(&format!("f{n}"), "i1", 8080 + n, 40000 + n)?;
        }
    }

    // "Restart": a fresh process opens the same database and recovers.
    let daemon = TestDaemon::start_with_db(Arc::new(Db::open(&db_path)?)).await?;
    let client = reqwest::Client::new();
    let body: Value = client
        .get(format!("{}/api/instances/i1/ports", daemon.base_url()))
        .send()
        .await?
        .json()
        .await?;

    let forwards = body["data"].as_array().cloned().unwrap_or_default();
    anyhow::ensure!(forwards.len() == 5, "expected 5 forwards, got {}", forwards.len());
    for f in &forwards {
        anyhow::ensure!(f["status"] == "closed", "forward not swept: {f}");
    }

    daemon.stop().await;
    Ok(())
}
