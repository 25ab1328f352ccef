// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! REST handlers for the public API.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::bus::BusEvent;
use crate::db::epoch_ms;
use crate::error::{ApiError, Envelope};
use crate::state::AppState;
use crate::status::reconcile::ReconcileError;
use crate::status::window::HookKind;
use crate::status::Status;

// -- Request/response types ----------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceRequest {
    pub name: String,
    pub working_dir: String,
    #[serde(default)]
    pub machine_binding: Option<MachineBinding>,
}

/// `{"type":"local"}` or `{"type":"remote","machineId":"..."}`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MachineBinding {
    Local,
    #[serde(rename_all = "camelCase")]
    Remote { machine_id: String },
}

#[derive(Debug, Deserialize)]
pub struct PatchInstanceRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub pinned: Option<bool>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReorderRequest {
    pub ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookStatusRequest {
    pub event: String,
    pub instance_id: String,
    #[serde(default)]
    pub project_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookSignalRequest {
    pub instance_id: String,
    #[serde(default)]
    pub project_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePortRequest {
    pub remote_port: u16,
    #[serde(default)]
    pub local_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMachineRequest {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub key_path: Option<String>,
    #[serde(default)]
    pub forward_credentials: bool,
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: i64,
}

// -- Helpers -------------------------------------------------------------------

fn ok<T: Serialize>(data: T) -> Response {
    Json(Envelope::success(data)).into_response()
}

fn created<T: Serialize>(data: T) -> Response {
    (StatusCode::CREATED, Json(Envelope::success(data))).into_response()
}

fn storage_error(e: rusqlite::Error) -> Response {
    let kind = ApiError::from(e);
    kind.to_http_response(kind.as_str()).into_response()
}

fn reconcile_error(e: ReconcileError) -> Response {
    match e {
        ReconcileError::NotFound => {
            ApiError::NotFound.to_http_response("instance not found").into_response()
        }
        ReconcileError::Storage(e) => storage_error(e),
    }
}

// -- Health --------------------------------------------------------------------

/// `GET /api/health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok".to_owned(), timestamp: epoch_ms() })
}

// -- Instances -----------------------------------------------------------------

/// `GET /api/instances`
pub async fn list_instances(State(s): State<Arc<AppState>>) -> Response {
    match s.db.list_instances() {
        Ok(list) => ok(list),
        Err(e) => storage_error(e),
    }
}

/// `POST /api/instances` — insert the row, then spawn the backend. A spawn
/// failure rolls the row back and surfaces as 500.
pub async fn create_instance(
    State(s): State<Arc<AppState>>,
    Json(req): Json<CreateInstanceRequest>,
) -> Response {
    if req.name.trim().is_empty() || req.working_dir.trim().is_empty() {
        return ApiError::BadRequest
            .to_http_response("name and workingDir are required")
            .into_response();
    }

    let machine_id = match &req.machine_binding {
        None | Some(MachineBinding::Local) => None,
        Some(MachineBinding::Remote { machine_id }) => {
            match s.db.get_machine(machine_id) {
                Ok(Some(_)) => Some(machine_id.clone()),
                Ok(None) => {
                    return ApiError::BadRequest
                        .to_http_response(format!("unknown machine {machine_id}"))
                        .into_response()
                }
                Err(e) => return storage_error(e),
            }
        }
    };

    let id = uuid::Uuid::new_v4().to_string();
    let instance = match s.db.insert_instance(&id, &req.name, &req.working_dir, machine_id.as_deref())
    {
        Ok(instance) => instance,
        Err(e) => return storage_error(e),
    };

    if let Err(e) = s.ensure_backend(&instance).await {
        tracing::error!(instance = %id, err = %e, "backend spawn failed, rolling back");
        if let Err(e) = s.db.delete_instance_row(&id) {
            tracing::error!(instance = %id, err = %e, "rollback of instance row failed");
        }
        return ApiError::SpawnFailed
            .to_http_response(format!("backend spawn failed: {e}"))
            .into_response();
    }

    let instance = match s.db.get_instance(&id) {
        Ok(Some(instance)) => instance,
        Ok(None) => {
            return ApiError::Internal.to_http_response("instance vanished").into_response()
        }
        Err(e) => return storage_error(e),
    };
    s.bus.publish(BusEvent::InstanceCreated { instance: instance.clone() });
    created(instance)
}

/// `GET /api/instances/{id}` — fetch, refreshing the observed cwd from the
/// live backend when one exists.
pub async fn get_instance(State(s): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let mut instance = match s.db.get_instance(&id) {
        Ok(Some(instance)) => instance,
        Ok(None) => return ApiError::NotFound.to_http_response("instance not found").into_response(),
        Err(e) => return storage_error(e),
    };

    if let Some(cwd) = s.manager.cwd(&id).await {
        let cwd = cwd.to_string_lossy().into_owned();
        if instance.last_cwd.as_deref() != Some(&cwd) {
            if let Err(e) = s.db.set_instance_last_cwd(&id, &cwd) {
                tracing::warn!(instance = %id, err = %e, "cwd refresh failed");
            } else {
                instance.last_cwd = Some(cwd);
            }
        }
    }
    ok(instance)
}

/// `PATCH /api/instances/{id}` — rename/pin directly; status goes through
/// the reconciler like every other transition.
pub async fn patch_instance(
    State(s): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<PatchInstanceRequest>,
) -> Response {
    match s.db.get_instance(&id) {
        Ok(Some(instance)) if !instance.is_closed() => {}
        Ok(_) => return ApiError::NotFound.to_http_response("instance not found").into_response(),
        Err(e) => return storage_error(e),
    }

    if let Some(ref name) = req.name {
        if name.trim().is_empty() {
            return ApiError::BadRequest.to_http_response("name must not be empty").into_response();
        }
        if let Err(e) = s.db.rename_instance(&id, name) {
            return storage_error(e);
        }
    }
    if let Some(pinned) = req.pinned {
        if let Err(e) = s.db.set_instance_pinned(&id, pinned) {
            return storage_error(e);
        }
    }
    if let Some(ref status) = req.status {
        let Some(status) = Status::parse(status) else {
            return ApiError::BadRequest
                .to_http_response(format!("unknown status {status:?}"))
                .into_response();
        };
        if let Err(e) = s.reconciler.force(&id, status).await {
            return reconcile_error(e);
        }
    }

    match s.db.get_instance(&id) {
        Ok(Some(instance)) => {
            s.bus.publish(BusEvent::InstanceUpdated { instance: instance.clone() });
            ok(instance)
        }
        Ok(None) => ApiError::NotFound.to_http_response("instance not found").into_response(),
        Err(e) => storage_error(e),
    }
}

/// `DELETE /api/instances/{id}` — kill the backend, close forwards, stamp
/// the row closed (retained for history).
pub async fn delete_instance(State(s): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match s.db.get_instance(&id) {
        Ok(Some(instance)) if !instance.is_closed() => {}
        Ok(_) => return ApiError::NotFound.to_http_response("instance not found").into_response(),
        Err(e) => return storage_error(e),
    }

    s.manager.kill(&id).await;
    if let Err(e) = s.tunnels.close_for_instance(&id).await {
        tracing::warn!(instance = %id, err = %e, "closing forwards on delete failed");
    }
    s.window.forget(&id);
    if let Err(e) = s.db.close_instance(&id) {
        return storage_error(e);
    }

    s.bus.publish(BusEvent::InstanceDeleted { id: id.clone() });
    ok(serde_json::json!({ "id": id, "closed": true }))
}

/// `POST /api/instances/{id}/reset-status` — force idle.
pub async fn reset_status(State(s): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match s.reconciler.force(&id, Status::Idle).await {
        Ok(_) => match s.db.get_instance(&id) {
            Ok(Some(instance)) => ok(instance),
            Ok(None) => ApiError::NotFound.to_http_response("instance not found").into_response(),
            Err(e) => storage_error(e),
        },
        Err(e) => reconcile_error(e),
    }
}

/// `POST /api/instances/reorder` — transactional ordinal rewrite, then a
/// dedicated event carrying the new ordinals.
pub async fn reorder_instances(
    State(s): State<Arc<AppState>>,
    Json(req): Json<ReorderRequest>,
) -> Response {
    if req.ids.is_empty() {
        return ApiError::BadRequest.to_http_response("ids must not be empty").into_response();
    }
    match s.db.reorder_instances(&req.ids) {
        Ok(ordinals) => {
            s.bus.publish(BusEvent::InstanceReordered { ordinals: ordinals.clone() });
            ok(ordinals)
        }
        Err(rusqlite::Error::QueryReturnedNoRows) => {
            ApiError::NotFound.to_http_response("unknown instance in ids").into_response()
        }
        Err(e) => storage_error(e),
    }
}

/// `GET /api/instances/{id}/activity`
pub async fn instance_activity(
    State(s): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match s.db.get_instance(&id) {
        Ok(Some(_)) => {}
        Ok(None) => return ApiError::NotFound.to_http_response("instance not found").into_response(),
        Err(e) => return storage_error(e),
    }
    match s.db.list_activity(&id, 50) {
        Ok(notes) => ok(notes),
        Err(e) => storage_error(e),
    }
}

// -- Hooks ---------------------------------------------------------------------

/// `POST /api/hooks/status` — authoritative `working` signal from the
/// managed CLI. Unrecognized events are accepted and dropped.
pub async fn hooks_status(
    State(s): State<Arc<AppState>>,
    Json(req): Json<HookStatusRequest>,
) -> Response {
    if req.event != "working" {
        return ok(serde_json::json!({ "ignored": true }));
    }
    match s.reconciler.hook_working(&req.instance_id).await {
        Ok(applied) => ok(serde_json::json!({ "applied": applied })),
        Err(e) => reconcile_error(e),
    }
}

/// `POST /api/hooks/stop`
pub async fn hooks_stop(
    State(s): State<Arc<AppState>>,
    Json(req): Json<HookSignalRequest>,
) -> Response {
    match s.reconciler.hook_idle(&req.instance_id, HookKind::Stop).await {
        Ok(applied) => ok(serde_json::json!({ "applied": applied })),
        Err(e) => reconcile_error(e),
    }
}

/// `POST /api/hooks/notification`
pub async fn hooks_notification(
    State(s): State<Arc<AppState>>,
    Json(req): Json<HookSignalRequest>,
) -> Response {
    match s.reconciler.hook_idle(&req.instance_id, HookKind::Notification).await {
        Ok(applied) => ok(serde_json::json!({ "applied": applied })),
        Err(e) => reconcile_error(e),
    }
}

// -- Port forwards -------------------------------------------------------------

/// `GET /api/instances/{id}/ports`
pub async fn list_ports(State(s): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match s.db.get_instance(&id) {
        Ok(Some(_)) => {}
        Ok(None) => return ApiError::NotFound.to_http_response("instance not found").into_response(),
        Err(e) => return storage_error(e),
    }
    match s.db.list_forwards(&id) {
        Ok(forwards) => ok(forwards),
        Err(e) => storage_error(e),
    }
}

/// `POST /api/instances/{id}/ports`
pub async fn create_port(
    State(s): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<CreatePortRequest>,
) -> Response {
    let instance = match s.db.get_instance(&id) {
        Ok(Some(instance)) if !instance.is_closed() => instance,
        Ok(_) => return ApiError::NotFound.to_http_response("instance not found").into_response(),
        Err(e) => return storage_error(e),
    };
    let Some(machine_id) = instance.machine_id else {
        return ApiError::BadRequest
            .to_http_response("port forwards require a remote-bound instance")
            .into_response();
    };
    let machine = match s.db.get_machine(&machine_id) {
        Ok(Some(machine)) => machine,
        Ok(None) => {
            return ApiError::Internal
                .to_http_response(format!("machine {machine_id} missing"))
                .into_response()
        }
        Err(e) => return storage_error(e),
    };

    match s.tunnels.create(&id, machine, req.remote_port, req.local_port).await {
        Ok(forward) => created(forward),
        Err(e) => {
            tracing::error!(instance = %id, err = %e, "port forward create failed");
            ApiError::Internal.to_http_response(format!("forward failed: {e}")).into_response()
        }
    }
}

/// `DELETE /api/instances/{id}/ports/{port_id}`
pub async fn delete_port(
    State(s): State<Arc<AppState>>,
    Path((id, port_id)): Path<(String, String)>,
) -> Response {
    match s.db.get_forward(&port_id) {
        Ok(Some(forward)) if forward.instance_id == id => {}
        Ok(_) => return ApiError::NotFound.to_http_response("port forward not found").into_response(),
        Err(e) => return storage_error(e),
    }
    match s.tunnels.close(&port_id).await {
        Ok(Some(forward)) => ok(forward),
        Ok(None) => ApiError::NotFound.to_http_response("port forward not found").into_response(),
        Err(e) => {
            tracing::error!(forward = %port_id, err = %e, "port forward close failed");
            ApiError::Internal.to_http_response(format!("close failed: {e}")).into_response()
        }
    }
}

// -- Machines ------------------------------------------------------------------

/// `GET /api/machines`
pub async fn list_machines(State(s): State<Arc<AppState>>) -> Response {
    match s.db.list_machines() {
        Ok(machines) => ok(machines),
        Err(e) => storage_error(e),
    }
}

/// `POST /api/machines`
pub async fn create_machine(
    State(s): State<Arc<AppState>>,
    Json(req): Json<CreateMachineRequest>,
) -> Response {
    if req.host.trim().is_empty() || req.username.trim().is_empty() {
        return ApiError::BadRequest
            .to_http_response("host and username are required")
            .into_response();
    }
    let id = uuid::Uuid::new_v4().to_string();
    match s.db.insert_machine(
        &id,
        &req.host,
        req.port,
        &req.username,
        req.key_path.as_deref(),
        req.forward_credentials,
    ) {
        Ok(machine) => created(machine),
        Err(e) => storage_error(e),
    }
}

/// `DELETE /api/machines/{id}` — 409 while open instances reference it.
pub async fn delete_machine(State(s): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match s.db.delete_machine(&id) {
        Ok(None) => ok(serde_json::json!({ "id": id, "deleted": true })),
        Ok(Some(open)) => ApiError::Conflict
            .to_http_response(format!("{open} open instance(s) still bound to machine"))
            .into_response(),
        Err(rusqlite::Error::QueryReturnedNoRows) => {
            ApiError::NotFound.to_http_response("machine not found").into_response()
        }
        Err(e) => storage_error(e),
    }
}
