// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Terminal manager: the id → backend map and the per-instance output pump.
//!
//! The manager owns process liveness only; status belongs to the reconciler.
//! Every output byte is appended to the instance's scrollback and published
//! on the bus in source order (one pump per instance). SSH reconnect banners
//! arrive through the same stream as ordinary terminal bytes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::bus::{Bus, BusEvent};
use crate::config::ServerConfig;
use crate::ring::Scrollback;
use crate::term::{spawn_backend, Backend, SpawnSpec};

/// Live state for one spawned backend.
pub struct SessionHandle {
    input_tx: mpsc::Sender<Bytes>,
    resize_tx: mpsc::Sender<(u16, u16)>,
    cancel: CancellationToken,
    ring: Arc<Mutex<Scrollback>>,
    pid: Option<u32>,
    initial_dir: PathBuf,
}

/// Registry of live backends keyed by instance id.
pub struct TerminalManager {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    bus: Bus,
    scrollback_bytes: usize,
}

impl TerminalManager {
    pub fn new(bus: Bus, scrollback_bytes: usize) -> Self {
        Self { sessions: RwLock::new(HashMap::new()), bus, scrollback_bytes }
    }

    /// Spawn a backend for the instance. Fails if one is already alive.
    pub async fn spawn(
        self: &Arc<Self>,
        spec: SpawnSpec,
        config: &ServerConfig,
    ) -> anyhow::Result<()> {
        if self.has(&spec.instance_id).await {
            bail!("backend already exists for instance {}", spec.instance_id);
        }
        let cancel = CancellationToken::new();
        let backend = spawn_backend(&spec, config, cancel.clone())
            .await
            .with_context(|| format!("spawn backend for {}", spec.instance_id))?;
        let _ = backend.resize(spec.cols, spec.rows);
        let initial_dir = crate::paths::expand_tilde(&spec.working_dir);
        self.adopt(spec.instance_id, backend, initial_dir, cancel).await
    }

    /// Wire up a constructed backend: channels, run task, output pump.
    pub async fn adopt(
        self: &Arc<Self>,
        instance_id: String,
        mut backend: Box<dyn Backend>,
        initial_dir: PathBuf,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let (output_tx, mut output_rx) = mpsc::channel::<Bytes>(256);
        let (input_tx, input_rx) = mpsc::channel::<Bytes>(256);
        let (resize_tx, resize_rx) = mpsc::channel::<(u16, u16)>(4);

        let pid = backend.child_pid();
        let ring = Arc::new(Mutex::new(Scrollback::new(self.scrollback_bytes)));
        let handle = Arc::new(SessionHandle {
            input_tx,
            resize_tx,
            cancel,
            ring: Arc::clone(&ring),
            pid,
            initial_dir,
        });

        {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&instance_id) {
                handle.cancel.cancel();
                bail!("backend already exists for instance {instance_id}");
            }
            sessions.insert(instance_id.clone(), handle);
        }

        let run_handle =
            tokio::spawn(async move { backend.run(output_tx, input_rx, resize_rx).await });

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(data) = output_rx.recv().await {
                let offset = {
                    let mut ring = ring.lock();
                    ring.append(&data);
                    ring.total_written() - data.len() as u64
                };
                manager.bus.publish(BusEvent::TerminalData {
                    id: instance_id.clone(),
                    data,
                    offset,
                });
            }

            // Output channel closed: the backend finished.
            let code = match run_handle.await {
                Ok(Ok(status)) => status.unix_code(),
                Ok(Err(e)) => {
                    tracing::warn!(instance = %instance_id, err = %e, "backend run failed");
                    1
                }
                Err(e) => {
                    tracing::warn!(instance = %instance_id, err = %e, "backend task panicked");
                    1
                }
            };

            manager.sessions.write().await.remove(&instance_id);
            manager.bus.publish(BusEvent::TerminalExit { id: instance_id.clone(), code });
            tracing::info!(instance = %instance_id, code, "backend exited");
        });

        Ok(())
    }

    /// Write bytes to the instance's shell. No-op on unknown id.
    pub async fn write(&self, id: &str, data: Bytes) {
        if let Some(handle) = self.get(id).await {
            let _ = handle.input_tx.send(data).await;
        }
    }

    /// Resize the instance's grid. No-op on unknown id.
    pub async fn resize(&self, id: &str, cols: u16, rows: u16) {
        if let Some(handle) = self.get(id).await {
            let _ = handle.resize_tx.try_send((cols, rows));
        }
    }

    /// Kill the backend. Returns whether one existed. Scrollback is cleared
    /// here so a later respawn starts with a clean history.
    pub async fn kill(&self, id: &str) -> bool {
        match self.get(id).await {
            Some(handle) => {
                handle.ring.lock().clear();
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Kill everything and wait briefly for the pumps to drain.
    pub async fn kill_all(&self) {
        let handles: Vec<_> = self.sessions.read().await.values().cloned().collect();
        for handle in &handles {
            handle.cancel.cancel();
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while !self.sessions.read().await.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("backends still draining at shutdown deadline");
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub async fn has(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    pub async fn ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Scrollback snapshot for attach replay, with the offset one past the
    /// snapshot's last byte (where the live stream resumes).
    pub async fn history(&self, id: &str) -> Option<(Vec<u8>, u64)> {
        let handle = self.get(id).await?;
        let ring = handle.ring.lock();
        Some((ring.snapshot(), ring.total_written()))
    }

    pub async fn clear_history(&self, id: &str) -> bool {
        match self.get(id).await {
            Some(handle) => {
                handle.ring.lock().clear();
                true
            }
            None => false,
        }
    }

    pub async fn pid(&self, id: &str) -> Option<u32> {
        self.get(id).await?.pid
    }

    /// Best-effort cwd: live `/proc` probe for local children; otherwise
    /// the spawn directory (a remote `cd` cannot be observed).
    pub async fn cwd(&self, id: &str) -> Option<PathBuf> {
        let handle = self.get(id).await?;
        if let Some(pid) = handle.pid {
            #[cfg(target_os = "linux")]
            if let Ok(path) = std::fs::read_link(format!("/proc/{pid}/cwd")) {
                return Some(path);
            }
            let _ = pid;
        }
        Some(handle.initial_dir.clone())
    }

    async fn get(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(id).cloned()
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
