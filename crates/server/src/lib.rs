// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Flotilla: multi-instance terminal orchestrator.
//!
//! One long-lived process owns a fleet of PTY sessions — local shells and
//! SSH-remote ones — plus their durable registry, status reconciliation,
//! reverse tunnels, and the WebSocket attach surface.

pub mod bus;
pub mod config;
pub mod db;
pub mod error;
pub mod manager;
pub mod paths;
pub mod registry;
pub mod ring;
pub mod state;
pub mod status;
pub mod term;
pub mod transport;
pub mod tunnel;

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::db::Db;
use crate::paths::expand_tilde;
use crate::state::AppState;
use crate::status::local_poll::spawn_local_poller;
use crate::status::remote_poll::spawn_remote_poller;
use crate::transport::build_router;

/// Run the orchestrator until shutdown.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let shutdown = CancellationToken::new();

    let db = if config.db_path == ":memory:" {
        Db::open_in_memory()?
    } else {
        Db::open(&expand_tilde(&config.db_path))?
    };
    let state = AppState::new(config, Arc::new(db), shutdown.clone());

    // Startup recovery: forward rows from the previous process are stale;
    // instance rows survive and their backends respawn lazily on attach.
    state.tunnels.recover()?;

    let local_poller = spawn_local_poller(Arc::clone(&state));
    let remote_poller = spawn_remote_poller(Arc::clone(&state));

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, shutting down");
                shutdown.cancel();
            }
        });
    }

    let router = build_router(Arc::clone(&state));
    let listener = TcpListener::bind(&addr).await.with_context(|| format!("bind {addr}"))?;
    tracing::info!("flotilla listening on {addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    // Ordered teardown: pollers, then tunnels, then terminals, then the
    // in-memory hook window. The bus and database close with the state drop.
    shutdown.cancel();
    let _ = local_poller.await;
    let _ = remote_poller.await;
    state.tunnels.close_all().await;
    state.manager.kill_all().await;
    state.window.drain();

    Ok(())
}
