// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Terminal backends: one local PTY variant, one SSH channel variant,
//! sharing a single object-safe contract. Shared concerns (scrollback,
//! fan-out) live in the terminal manager, not here.

pub mod local;
pub mod ssh;

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::registry::Machine;

/// How the child shell ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// Collapse to a single conventional exit code (128+signal when signaled).
    pub fn unix_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(sig)) => 128 + sig,
            (None, None) => 1,
        }
    }
}

/// Everything needed to spawn a backend for one instance.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub instance_id: String,
    pub working_dir: String,
    pub cols: u16,
    pub rows: u16,
    /// Extra environment overrides beyond the standard contract.
    pub env: Vec<(String, String)>,
    pub target: SpawnTarget,
}

/// Backend variant selector.
#[derive(Debug, Clone)]
pub enum SpawnTarget {
    Local,
    Ssh(Machine),
}

/// Terminal backend contract shared by both variants.
///
/// `run` pumps the shell until exit: bytes from the child arrive on
/// `output_tx` (stdout and stderr coalesced), writes arrive on `input_rx`,
/// grid changes on `resize_rx`. Object-safe for `Box<dyn Backend>`.
pub trait Backend: Send + 'static {
    fn run(
        &mut self,
        output_tx: mpsc::Sender<Bytes>,
        input_rx: mpsc::Receiver<Bytes>,
        resize_rx: mpsc::Receiver<(u16, u16)>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ExitStatus>> + Send + '_>>;

    /// Apply a grid size outside the run loop (initial sizing).
    fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()>;

    /// Local child PID, `None` for remote shells. The terminal manager
    /// derives cwd observations from this plus the spawn directory.
    fn child_pid(&self) -> Option<u32>;
}

/// Construct the backend named by the spec. SSH spawn is complete only once
/// the remote shell is set up (cd + optional credential export + settle).
pub async fn spawn_backend(
    spec: &SpawnSpec,
    config: &ServerConfig,
    cancel: CancellationToken,
) -> anyhow::Result<Box<dyn Backend>> {
    match &spec.target {
        SpawnTarget::Local => Ok(Box::new(local::LocalPty::spawn(spec, cancel)?)),
        SpawnTarget::Ssh(machine) => {
            let credential = resolve_credential(config, machine);
            let shell =
                ssh::SshShell::spawn(spec, machine.clone(), credential, config, cancel).await?;
            Ok(Box::new(shell))
        }
    }
}

/// Look up the credential to forward into a remote shell, if the machine
/// asks for one and this process can discover it.
fn resolve_credential(config: &ServerConfig, machine: &Machine) -> Option<(String, String)> {
    if !machine.forward_credentials {
        return None;
    }
    let name = config.credential_var.as_deref()?;
    let value = std::env::var(name).ok()?;
    Some((name.to_owned(), value))
}
