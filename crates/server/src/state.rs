// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use anyhow::Context;

use crate::bus::Bus;
use crate::config::ServerConfig;
use crate::db::Db;
use crate::manager::TerminalManager;
use crate::paths::expand_tilde;
use crate::registry::Instance;
use crate::status::reconcile::Reconciler;
use crate::status::window::HookWindow;
use crate::term::{SpawnSpec, SpawnTarget};
use crate::tunnel::TunnelSupervisor;

/// Process-wide singletons, constructed once at startup and shared with every
/// handler and background task.
pub struct AppState {
    pub config: ServerConfig,
    pub db: Arc<Db>,
    pub bus: Bus,
    pub manager: Arc<TerminalManager>,
    pub window: Arc<HookWindow>,
    pub reconciler: Reconciler,
    pub tunnels: TunnelSupervisor,
    pub shutdown: CancellationToken,
    /// Tilde-expanded session-log root used by the local poller.
    pub log_root: PathBuf,
}

impl AppState {
    pub fn new(config: ServerConfig, db: Arc<Db>, shutdown: CancellationToken) -> Arc<Self> {
        let bus = Bus::new(config.bus_capacity);
        let manager = Arc::new(TerminalManager::new(bus.clone(), config.scrollback_bytes));
        let window = Arc::new(HookWindow::new(config.hook_grace()));
        let reconciler = Reconciler::new(Arc::clone(&db), bus.clone(), Arc::clone(&window));
        let tunnels = TunnelSupervisor::new(Arc::clone(&db), bus.clone(), &config);
        let log_root = expand_tilde(&config.log_root);

        Arc::new(Self {
            config,
            db,
            bus,
            manager,
            window,
            reconciler,
            tunnels,
            shutdown,
            log_root,
        })
    }

    /// Make sure the instance has a live backend, spawning one when needed.
    ///
    /// Instance rows survive a restart but backends do not; attach (and
    /// create) call this so an open-but-backendless instance respawns on
    /// first use.
    pub async fn ensure_backend(&self, instance: &Instance) -> anyhow::Result<()> {
        if self.manager.has(&instance.id).await {
            return Ok(());
        }

        let target = match &instance.machine_id {
            None => SpawnTarget::Local,
            Some(machine_id) => {
                let machine = self
                    .db
                    .get_machine(machine_id)
                    .context("read machine row")?
                    .with_context(|| format!("machine {machine_id} missing"))?;
                SpawnTarget::Ssh(machine)
            }
        };
        let spec = SpawnSpec {
            instance_id: instance.id.clone(),
            working_dir: instance.working_dir.clone(),
            cols: self.config.default_cols,
            rows: self.config.default_rows,
            env: Vec::new(),
            target,
        };
        self.manager.spawn(spec, &self.config).await?;

        let pid = self.manager.pid(&instance.id).await.map(i64::from);
        self.db.set_instance_pid(&instance.id, pid).context("persist pid")?;
        Ok(())
    }
}
