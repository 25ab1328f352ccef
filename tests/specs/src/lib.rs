// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Harness for workspace-level end-to-end tests: an in-process flotilla
//! server on an ephemeral port, driven over real HTTP and WebSocket.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use flotilla::config::ServerConfig;
use flotilla::db::Db;
use flotilla::state::AppState;
use flotilla::transport::build_router;

/// A running orchestrator bound to an ephemeral port.
pub struct TestDaemon {
    pub state: Arc<AppState>,
    pub addr: SocketAddr,
    shutdown: CancellationToken,
}

impl TestDaemon {
    /// Start with a fresh in-memory database.
    pub async fn start() -> anyhow::Result<Self> {
        Self::start_with_db(Arc::new(Db::open_in_memory()?)).await
    }

    /// Start over an existing database (restart-recovery tests).
    pub async fn start_with_db(db: Arc<Db>) -> anyhow::Result<Self> {
        let shutdown = CancellationToken::new();
        let state = AppState::new(ServerConfig::default(), db, shutdown.clone());
        state.tunnels.recover()?;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let router = build_router(Arc::clone(&state));
        let serve_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(serve_shutdown.cancelled_owned())
                .await;
        });

        Ok(Self { state, addr, shutdown })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Graceful stop: kill backends, cancel the server task.
    pub async fn stop(&self) {
        self.state.manager.kill_all().await;
        self.shutdown.cancel();
    }
}
