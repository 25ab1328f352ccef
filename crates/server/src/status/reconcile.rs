// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The status reconciler: sole writer of `instances.status`.
//!
//! Three producers feed it — hook POSTs (authoritative), the local poller,
//! and the remote poller (both heuristic). Poll submissions are dropped
//! while the hook-priority window covers the instance; all accepted
//! candidates are serialized through one writer lock so two producers
//! racing on the same stale status can never interleave writes.

use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::bus::{Bus, BusEvent};
use crate::db::Db;
use crate::status::window::{HookKind, HookWindow};
use crate::status::{Status, StatusSource};

#[derive(Debug)]
pub enum ReconcileError {
    /// Unknown or closed instance.
    NotFound,
    Storage(rusqlite::Error),
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("instance not found"),
            Self::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for ReconcileError {}

impl From<rusqlite::Error> for ReconcileError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e)
    }
}

pub struct Reconciler {
    db: Arc<Db>,
    bus: Bus,
    window: Arc<HookWindow>,
    /// Serializes every status write. Transitions are quick row updates, so
    /// one writer lock covers all instances without contention concerns.
    write_lock: Mutex<()>,
}

impl Reconciler {
    pub fn new(db: Arc<Db>, bus: Bus, window: Arc<HookWindow>) -> Self {
        Self { db, bus, window, write_lock: Mutex::new(()) }
    }

    /// Authoritative `working` hook from the managed CLI.
    pub async fn hook_working(&self, instance_id: &str) -> Result<bool, ReconcileError> {
        self.db.touch_instance_activity(instance_id)?;
        self.apply(instance_id, Status::Working, StatusSource::Hook).await
    }

    /// Authoritative stop/notification hook: records the priority window
    /// entry, then transitions to idle.
    pub async fn hook_idle(
        &self,
        instance_id: &str,
        kind: HookKind,
    ) -> Result<bool, ReconcileError> {
        self.window.record(instance_id, kind);
        self.db.touch_instance_activity(instance_id)?;
        self.apply(instance_id, Status::Idle, StatusSource::Hook).await
    }

    /// Heuristic poller observation. Dropped while a fresh hook covers the
    /// instance.
    pub async fn submit_poll(
        &self,
        instance_id: &str,
        candidate: Status,
        source: StatusSource,
    ) -> Result<bool, ReconcileError> {
        if self.window.should_defer_to_hook(instance_id) {
            tracing::debug!(instance = %instance_id, "poll deferred to recent hook");
            return Ok(false);
        }
        self.apply(instance_id, candidate, source).await
    }

    /// Operator-driven transition (PATCH status, reset-status endpoint).
    pub async fn force(
        &self,
        instance_id: &str,
        status: Status,
    ) -> Result<bool, ReconcileError> {
        self.apply(instance_id, status, StatusSource::Api).await
    }

    /// Persist a transition if the candidate differs from the current value.
    async fn apply(
        &self,
        instance_id: &str,
        candidate: Status,
        source: StatusSource,
    ) -> Result<bool, ReconcileError> {
        let _guard = self.write_lock.lock().await;

        let instance = self
            .db
            .get_instance(instance_id)?
            .filter(|i| !i.is_closed())
            .ok_or(ReconcileError::NotFound)?;

        if instance.status == candidate {
            return Ok(false);
        }

        self.db.set_instance_status(instance_id, candidate)?;
        self.db.append_status_event(instance_id, candidate, source.as_str())?;

        match (instance.status, candidate) {
            (Status::Idle, Status::Working) => {
                self.db.append_activity(
                    instance_id,
                    "started",
                    &format!("{} started working", instance.name),
                )?;
            }
            (Status::Working, Status::Idle) => {
                self.db.append_activity(
                    instance_id,
                    "completed",
                    &format!("{} completed work", instance.name),
                )?;
            }
            _ => {}
        }

        self.bus.publish(BusEvent::StatusChanged {
            id: instance_id.to_owned(),
            status: candidate,
        });
        tracing::info!(
            instance = %instance_id,
            from = %instance.status,
            to = %candidate,
            source = source.as_str(),
            "status transition"
        );
        Ok(true)
    }
}

#[cfg(test)]
#[path = "reconcile_tests.rs"]
mod tests;
