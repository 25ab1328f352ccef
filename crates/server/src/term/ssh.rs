// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! SSH backend: one client connection, one shell channel with a remote PTY,
//! and a bounded reconnect loop for passive disconnects.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use bytes::Bytes;
use russh::client::{self, Msg};
use russh::keys::{load_secret_key, PrivateKeyWithHashAlg};
use russh::{Channel, ChannelMsg, Disconnect};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Backend, ExitStatus, SpawnSpec};
use crate::config::ServerConfig;
use crate::paths::expand_tilde;
use crate::registry::Machine;

/// Default key names tried in order when the machine has no explicit key.
const DEFAULT_KEY_NAMES: &[&str] = &["id_ed25519", "id_ecdsa", "id_rsa"];

/// Delay between shell setup and declaring the spawn complete, giving the
/// remote login shell time to process the cd/export preamble.
const SETTLE: Duration = Duration::from_millis(300);

/// SSH backend owning one remote login shell.
pub struct SshShell {
    machine: Machine,
    working_dir: String,
    credential: Option<(String, String)>,
    cols: Arc<AtomicU16>,
    rows: Arc<AtomicU16>,
    cancel: CancellationToken,
    connect_timeout: Duration,
    max_reconnects: u32,
    base_delay: Duration,
    session: Option<SshSession>,
}

struct SshSession {
    handle: client::Handle<ShellHandler>,
    channel: Channel<Msg>,
}

/// Client-side handler. Host keys are accepted as configured machines are
/// operator-supplied; there is no fingerprint store to verify against.
pub(crate) struct ShellHandler;

impl client::Handler for ShellHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

impl SshShell {
    /// Connect, authenticate, and start the remote shell. Returns only once
    /// the shell preamble has been sent and the settle delay elapsed.
    pub async fn spawn(
        spec: &SpawnSpec,
        machine: Machine,
        credential: Option<(String, String)>,
        config: &ServerConfig,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let mut shell = Self {
            machine,
            working_dir: spec.working_dir.clone(),
            credential,
            cols: Arc::new(AtomicU16::new(spec.cols)),
            rows: Arc::new(AtomicU16::new(spec.rows)),
            cancel,
            connect_timeout: config.ssh_timeout(),
            max_reconnects: config.reconnect_attempts,
            base_delay: config.reconnect_base_delay(),
            session: None,
        };
        let session = shell.establish().await?;
        shell.session = Some(session);
        Ok(shell)
    }

    /// Connect + auth + shell channel + preamble. Used by both the initial
    /// spawn and every reconnect attempt.
    async fn establish(&self) -> anyhow::Result<SshSession> {
        let handle = connect(&self.machine, self.connect_timeout).await?;

        let mut channel =
            handle.channel_open_session().await.context("open session channel")?;
        let cols = self.cols.load(Ordering::Relaxed);
        let rows = self.rows.load(Ordering::Relaxed);
        channel
            .request_pty(false, "xterm-256color", u32::from(cols), u32::from(rows), 0, 0, &[])
            .await
            .context("request remote pty")?;
        channel.request_shell(false).await.context("request remote shell")?;

        // Credential export first (leading space keeps it out of history),
        // then cd into the working directory.
        if let Some((name, value)) = &self.credential {
            let line = format!(" export {}={}\n", name, shell_quote(value));
            channel.data(line.as_bytes()).await.context("send credential export")?;
        }
        let line = format!("{}\n", cd_command(&self.working_dir));
        channel.data(line.as_bytes()).await.context("send cd preamble")?;

        tokio::time::sleep(SETTLE).await;
        Ok(SshSession { handle, channel })
    }

    /// Bounded reconnect after a passive disconnect. Emits inline banners on
    /// the terminal stream; a kill racing any attempt wins immediately.
    async fn reconnect(&self, output_tx: &mpsc::Sender<Bytes>) -> Reconnect {
        for attempt in 1..=self.max_reconnects {
            let delay = self.base_delay * 2u32.saturating_pow(attempt - 1);
            let banner = format!(
                "\r\nConnection lost. Reconnecting in {}s (attempt {}/{})...\r\n",
                delay.as_secs(),
                attempt,
                self.max_reconnects
            );
            if output_tx.send(Bytes::from(banner.into_bytes())).await.is_err() {
                return Reconnect::Killed;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Reconnect::Killed,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.establish().await {
                Ok(session) => {
                    // A kill that raced the attempt wins: drop the fresh
                    // session and emit nothing further.
                    if self.cancel.is_cancelled() {
                        return Reconnect::Killed;
                    }
                    let _ = output_tx
                        .send(Bytes::from_static(b"Reconnected successfully.\r\n"))
                        .await;
                    return Reconnect::Restored(session);
                }
                Err(e) => {
                    tracing::warn!(
                        host = %self.machine.host,
                        attempt,
                        err = %e,
                        "ssh reconnect attempt failed"
                    );
                }
            }
            if self.cancel.is_cancelled() {
                return Reconnect::Killed;
            }
        }
        Reconnect::Exhausted
    }
}

enum Reconnect {
    Restored(SshSession),
    Exhausted,
    Killed,
}

enum PumpEnd {
    Killed,
    Exited(i32),
    Disconnected,
}

impl Backend for SshShell {
    fn run(
        &mut self,
        output_tx: mpsc::Sender<Bytes>,
        mut input_rx: mpsc::Receiver<Bytes>,
        mut resize_rx: mpsc::Receiver<(u16, u16)>,
    ) -> Pin<Box<dyn std::future::Future<Output = anyhow::Result<ExitStatus>> + Send + '_>> {
        Box::pin(async move {
            let mut session = self.session.take().context("ssh backend already ran")?;

            loop {
                let end = pump(
                    &mut session.channel,
                    &output_tx,
                    &mut input_rx,
                    &mut resize_rx,
                    &self.cancel,
                    &self.cols,
                    &self.rows,
                )
                .await;

                match end {
                    PumpEnd::Killed => {
                        let _ = session
                            .handle
                            .disconnect(Disconnect::ByApplication, "killed", "en")
                            .await;
                        return Ok(ExitStatus { code: None, signal: Some(15) });
                    }
                    PumpEnd::Exited(code) => {
                        let _ = session
                            .handle
                            .disconnect(Disconnect::ByApplication, "shell exited", "en")
                            .await;
                        return Ok(ExitStatus { code: Some(code), signal: None });
                    }
                    PumpEnd::Disconnected => match self.reconnect(&output_tx).await {
                        Reconnect::Restored(restored) => {
                            session = restored;
                        }
                        Reconnect::Killed => {
                            return Ok(ExitStatus { code: None, signal: Some(15) })
                        }
                        Reconnect::Exhausted => {
                            return Ok(ExitStatus { code: Some(1), signal: None })
                        }
                    },
                }
            }
        })
    }

    /// Record the grid for the next (re)connect; live channels are resized
    /// through the resize stream handled in `run`.
    fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        self.cols.store(cols, Ordering::Relaxed);
        self.rows.store(rows, Ordering::Relaxed);
        Ok(())
    }

    fn child_pid(&self) -> Option<u32> {
        None
    }
}

/// Pump one live channel until kill, clean exit, or transport loss.
async fn pump(
    channel: &mut Channel<Msg>,
    output_tx: &mpsc::Sender<Bytes>,
    input_rx: &mut mpsc::Receiver<Bytes>,
    resize_rx: &mut mpsc::Receiver<(u16, u16)>,
    cancel: &CancellationToken,
    cols: &AtomicU16,
    rows: &AtomicU16,
) -> PumpEnd {
    let mut exit_code: Option<i32> = None;
    let mut input_open = true;
    let mut resize_open = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return PumpEnd::Killed,

            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    if output_tx.send(Bytes::copy_from_slice(&data)).await.is_err() {
                        return PumpEnd::Killed;
                    }
                }
                // stderr coalesces into the same stream.
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    if output_tx.send(Bytes::copy_from_slice(&data)).await.is_err() {
                        return PumpEnd::Killed;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    exit_code = Some(exit_status as i32);
                }
                Some(ChannelMsg::Eof) => {}
                Some(ChannelMsg::Close) | None => {
                    return match exit_code {
                        Some(code) => PumpEnd::Exited(code),
                        None => PumpEnd::Disconnected,
                    };
                }
                Some(_) => {}
            },

            input = input_rx.recv(), if input_open => match input {
                Some(data) => {
                    if channel.data(&data[..]).await.is_err() {
                        return PumpEnd::Disconnected;
                    }
                }
                None => input_open = false,
            },

            resize = resize_rx.recv(), if resize_open => match resize {
                Some((c, r)) => {
                    cols.store(c, Ordering::Relaxed);
                    rows.store(r, Ordering::Relaxed);
                    let _ = channel
                        .window_change(u32::from(c), u32::from(r), 0, 0)
                        .await;
                }
                None => resize_open = false,
            },
        }
    }
}

/// Connect and authenticate with the machine's key material.
async fn connect(
    machine: &Machine,
    timeout: Duration,
) -> anyhow::Result<client::Handle<ShellHandler>> {
    connect_with(machine, timeout, ShellHandler).await
}

/// Connect/auth with a caller-supplied handler. Shared with the remote
/// poller and the tunnel supervisor, which need their own channel handling.
pub(crate) async fn connect_with<H>(
    machine: &Machine,
    timeout: Duration,
    handler: H,
) -> anyhow::Result<client::Handle<H>>
where
    H: client::Handler<Error = anyhow::Error>,
{
    let config = Arc::new(client::Config::default());
    let mut handle = tokio::time::timeout(
        timeout,
        client::connect(config, (machine.host.as_str(), machine.port), handler),
    )
    .await
    .map_err(|_| {
        anyhow::anyhow!("ssh connect timeout to {}@{}:{}", machine.username, machine.host, machine.port)
    })?
    .context("ssh connect failed")?;

    let key_path = select_key(machine.key_path.as_deref())?;
    let key = load_secret_key(&key_path, None)
        .with_context(|| format!("load ssh key {}", key_path.display()))?;
    let hash = handle.best_supported_rsa_hash().await?.flatten();
    let auth = handle
        .authenticate_publickey(
            &machine.username,
            PrivateKeyWithHashAlg::new(Arc::new(key), hash),
        )
        .await
        .context("ssh auth request failed")?;
    if !auth.success() {
        bail!("ssh auth rejected for {}@{}", machine.username, machine.host);
    }
    Ok(handle)
}

/// Pick the key file: explicit path when set, else the first readable
/// default key under `~/.ssh`.
pub fn select_key(explicit: Option<&str>) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        let path = expand_tilde(path);
        if std::fs::File::open(&path).is_err() {
            bail!("ssh key not readable: {}", path.display());
        }
        return Ok(path);
    }
    let ssh_dir = expand_tilde("~/.ssh");
    for name in DEFAULT_KEY_NAMES {
        let candidate = ssh_dir.join(name);
        if std::fs::File::open(&candidate).is_ok() {
            return Ok(candidate);
        }
    }
    bail!("no usable ssh key under {}", ssh_dir.display())
}

/// Build the `cd` preamble. A leading home-shorthand segment stays unquoted
/// so the remote shell expands it; everything else is quoted.
pub fn cd_command(dir: &str) -> String {
    if dir == "~" {
        return "cd ~".to_owned();
    }
    if let Some(rest) = dir.strip_prefix("~/") {
        return format!("cd ~/{}", shell_quote(rest));
    }
    format!("cd {}", shell_quote(dir))
}

/// Single-quote a string for POSIX shells unless it is plainly safe.
pub fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-'));
    if safe {
        s.to_owned()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

#[cfg(test)]
#[path = "ssh_tests.rs"]
mod tests;
