// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport for the orchestrator.

pub mod http;
pub mod ws;
pub mod ws_msg;

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the axum `Router` with all public routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health
        .route("/api/health", get(http::health))
        // Instances
        .route("/api/instances", get(http::list_instances).post(http::create_instance))
        .route("/api/instances/reorder", post(http::reorder_instances))
        .route(
            "/api/instances/{id}",
            get(http::get_instance).patch(http::patch_instance).delete(http::delete_instance),
        )
        .route("/api/instances/{id}/reset-status", post(http::reset_status))
        .route("/api/instances/{id}/activity", get(http::instance_activity))
        // Hooks
        .route("/api/hooks/status", post(http::hooks_status))
        .route("/api/hooks/stop", post(http::hooks_stop))
        .route("/api/hooks/notification", post(http::hooks_notification))
        // Port forwards
        .route("/api/instances/{id}/ports", get(http::list_ports).post(http::create_port))
        .route("/api/instances/{id}/ports/{port_id}", delete(http::delete_port))
        // Machines
        .route("/api/machines", get(http::list_machines).post(http::create_machine))
        .route("/api/machines/{id}", delete(http::delete_machine))
        // Streaming attach
        .route("/ws", get(ws::ws_handler))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
