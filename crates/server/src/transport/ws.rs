// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Streaming attach endpoint: one WebSocket per client, multiplexing any
//! number of attached instances.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;

use crate::bus::BusEvent;
use crate::state::AppState;
use crate::transport::ws_msg::{ClientMessage, ServerMessage};

/// Attached instances for one connection: id → next expected scrollback
/// offset. The offset starts at the history snapshot's high-water mark so
/// live `terminal:data` already covered by the snapshot is never re-sent.
type Attachments = HashMap<String, u64>;

/// `GET /ws` — upgrade to the attach protocol.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(state, socket))
}

/// Per-connection loop: fan in bus events, fan out client commands.
///
/// Backpressure contract: the bus receiver is bounded. If this client reads
/// slower than the fleet produces, the receiver lags and the client is
/// disconnected — a slow consumer never blocks publishers or its peers.
async fn handle_connection(state: Arc<AppState>, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut bus_rx = state.bus.subscribe();
    let mut attached: Attachments = HashMap::new();

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,

            event = bus_rx.recv() => match event {
                Ok(event) => {
                    if deliver_event(&mut ws_tx, &mut attached, event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "attach client too slow, disconnecting");
                    break;
                }
                Err(RecvError::Closed) => break,
            },

            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(_)) | None => break,
                };
                match msg {
                    Message::Text(text) => {
                        let client_msg: ClientMessage = match serde_json::from_str(&text) {
                            Ok(m) => m,
                            Err(_) => {
                                let err = ServerMessage::Error {
                                    code: "bad_request".to_owned(),
                                    message: "invalid message".to_owned(),
                                };
                                if send_json(&mut ws_tx, &err).await.is_err() {
                                    break;
                                }
                                continue;
                            }
                        };
                        if let Some(reply) =
                            handle_client_message(&state, client_msg, &mut attached).await
                        {
                            if send_json(&mut ws_tx, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }
}

/// Forward one bus event to this client, applying per-attachment filtering
/// and offset-based splicing of terminal bytes. `Err` means the socket died.
async fn deliver_event(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    attached: &mut Attachments,
    event: BusEvent,
) -> Result<(), ()> {
    match event {
        BusEvent::TerminalData { id, data, offset } => {
            let Some(expected) = attached.get_mut(&id) else {
                return Ok(());
            };
            match splice_terminal_data(expected, data, offset) {
                Some((data, offset)) => {
                    send_json(ws_tx, &BusEvent::TerminalData { id, data, offset }).await
                }
                None => Ok(()),
            }
        }
        BusEvent::TerminalExit { ref id, .. } => {
            if attached.contains_key(id) {
                send_json(ws_tx, &event).await
            } else {
                Ok(())
            }
        }
        // Fleet-level events reach every client.
        _ => send_json(ws_tx, &event).await,
    }
}

/// Splice a live terminal chunk against the client's expected offset.
///
/// Returns the bytes still owed to the client (with their true offset), or
/// `None` when the history snapshot already covered the whole chunk.
/// Advances `expected` past everything now delivered.
fn splice_terminal_data(expected: &mut u64, data: Bytes, offset: u64) -> Option<(Bytes, u64)> {
    let end = offset + data.len() as u64;
    if end <= *expected {
        return None;
    }
    let (data, offset) = if offset < *expected {
        (data.slice((*expected - offset) as usize..), *expected)
    } else {
        (data, offset)
    };
    *expected = end;
    Some((data, offset))
}

async fn handle_client_message(
    state: &Arc<AppState>,
    msg: ClientMessage,
    attached: &mut Attachments,
) -> Option<ServerMessage> {
    match msg {
        ClientMessage::Attach { instance_id } => {
            Some(handle_attach(state, instance_id, attached).await)
        }

        ClientMessage::Detach { id } => {
            attached.remove(&id);
            None
        }

        ClientMessage::Input { id, data } => {
            state.manager.write(&id, Bytes::from(data.into_bytes())).await;
            None
        }

        ClientMessage::Resize { id, cols, rows } => {
            if cols == 0 || rows == 0 {
                return Some(ServerMessage::Error {
                    code: "bad_request".to_owned(),
                    message: "cols and rows must be positive".to_owned(),
                });
            }
            state.manager.resize(&id, cols, rows).await;
            None
        }

        ClientMessage::Ping {} => Some(ServerMessage::Pong {}),
    }
}

/// Attach: validate, lazily respawn a backend-less open instance, reply with
/// the scrollback snapshot, then subscribe. Errors keep the channel open.
async fn handle_attach(
    state: &Arc<AppState>,
    instance_id: String,
    attached: &mut Attachments,
) -> ServerMessage {
    let instance = match state.db.get_instance(&instance_id) {
        Ok(Some(instance)) if !instance.is_closed() => instance,
        Ok(_) => {
            return ServerMessage::Error {
                code: "not_found".to_owned(),
                message: format!("unknown instance {instance_id}"),
            }
        }
        Err(e) => {
            return ServerMessage::Error { code: "database".to_owned(), message: e.to_string() }
        }
    };

    if let Err(e) = state.ensure_backend(&instance).await {
        tracing::error!(instance = %instance_id, err = %e, "respawn on attach failed");
        return ServerMessage::Error {
            code: "spawn_failed".to_owned(),
            message: format!("backend spawn failed: {e}"),
        };
    }

    let (history, next_offset) =
        state.manager.history(&instance_id).await.unwrap_or_default();
    attached.insert(instance_id.clone(), next_offset);
    ServerMessage::History { id: instance_id, data: BASE64.encode(history) }
}

async fn send_json<T: Serialize>(
    tx: &mut SplitSink<WebSocket, Message>,
    msg: &T,
) -> Result<(), ()> {
    let text = serde_json::to_string(msg).map_err(|_| ())?;
    tx.send(Message::Text(text.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_tests.rs"]
mod tests;
