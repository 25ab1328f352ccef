// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Local status poller: classifies open local instances by the age of their
//! newest session-log file.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::paths::session_log_dir;
use crate::state::AppState;
use crate::status::{Status, StatusSource};

/// Spawn the background poll loop. Per-instance errors are swallowed and
/// logged; a registry error skips the whole tick.
pub fn spawn_local_poller(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    let interval = state.config.local_poll_interval();
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }

            let instances = match state.db.open_instances_by_binding(false) {
                Ok(list) => list,
                Err(e) => {
                    tracing::warn!(err = %e, "local poll: registry read failed, skipping tick");
                    continue;
                }
            };

            for instance in &instances {
                let dir = session_log_dir(&state.log_root, &instance.working_dir);
                let candidate = observe_session_dir(&dir, state.config.idle_after());
                match state
                    .reconciler
                    .submit_poll(&instance.id, candidate, StatusSource::LocalPoll)
                    .await
                {
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(instance = %instance.id, err = %e, "local poll: submit failed");
                    }
                }
            }
        }
    })
}

/// Classify one instance by its session-log directory.
///
/// Missing directory or no files → idle; otherwise the newest file's mtime
/// age decides. Filesystem errors read as idle rather than mutating state
/// with a guess in the working direction.
pub fn observe_session_dir(dir: &Path, idle_after: Duration) -> Status {
    match newest_mtime(dir) {
        Ok(Some(mtime)) => {
            let age = SystemTime::now()
                .duration_since(mtime)
                .unwrap_or(Duration::ZERO);
            classify_age(age, idle_after)
        }
        Ok(None) => Status::Idle,
        Err(_) => Status::Idle,
    }
}

/// Age threshold is inclusive-above: exactly `idle_after` old reads idle.
pub fn classify_age(age: Duration, idle_after: Duration) -> Status {
    if age < idle_after {
        Status::Working
    } else {
        Status::Idle
    }
}

/// Most recent mtime of any regular file directly inside `dir`.
pub fn newest_mtime(dir: &Path) -> std::io::Result<Option<SystemTime>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut newest: Option<SystemTime> = None;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let meta = match entry.metadata() {
            Ok(m) if m.is_file() => m,
            _ => continue,
        };
        if let Ok(mtime) = meta.modified() {
            if newest.map_or(true, |current| mtime > current) {
                newest = Some(mtime);
            }
        }
    }
    Ok(newest)
}

#[cfg(test)]
#[path = "local_poll_tests.rs"]
mod tests;
