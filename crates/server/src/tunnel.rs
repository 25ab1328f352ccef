// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Reverse port-forward supervisor: SSH `tcpip-forward` tunnels from a
//! remote port to a local TCP target, with persisted lifecycle state and
//! exponential-backoff reconnect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use russh::client::{self, Msg};
use russh::{Channel, ChannelMsg};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::bus::{Bus, BusEvent};
use crate::config::ServerConfig;
use crate::db::Db;
use crate::registry::{ForwardStatus, Machine, PortForward};
use crate::term::ssh::connect_with;

/// Interval between keepalive probes on an established tunnel connection.
const KEEPALIVE_EVERY: Duration = Duration::from_secs(10);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);

struct TunnelHandle {
    cancel: CancellationToken,
    instance_id: String,
}

/// Owns every live tunnel task and the persisted `port_forwards` rows.
pub struct TunnelSupervisor {
    db: Arc<Db>,
    bus: Bus,
    ssh_timeout: Duration,
    max_attempts: u32,
    base_delay: Duration,
    active: RwLock<HashMap<String, TunnelHandle>>,
}

impl TunnelSupervisor {
    pub fn new(db: Arc<Db>, bus: Bus, config: &ServerConfig) -> Self {
        Self {
            db,
            bus,
            ssh_timeout: config.ssh_timeout(),
            max_attempts: config.reconnect_attempts,
            base_delay: config.reconnect_base_delay(),
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Startup recovery: no in-memory tunnel survived the restart, so every
    /// non-closed row is rewritten to `closed`.
    pub fn recover(&self) -> anyhow::Result<usize> {
        let swept = self.db.sweep_stale_forwards().context("sweep stale forwards")?;
        if swept > 0 {
            tracing::info!(swept, "closed stale port-forward rows from previous process");
        }
        Ok(swept)
    }

    /// Open a new reverse forward for the instance. Allocates a free local
    /// port when none is requested; fails without persisting anything if the
    /// initial forward cannot be established.
    pub async fn create(
        self: &Arc<Self>,
        instance_id: &str,
        machine: Machine,
        remote_port: u16,
        local_port: Option<u16>,
    ) -> anyhow::Result<PortForward> {
        let local_port = match local_port {
            Some(port) => port,
            None => alloc_local_port().await?,
        };

        let cancel = CancellationToken::new();
        let handle = establish(&machine, remote_port, local_port, self.ssh_timeout, &cancel)
            .await
            .context("open reverse forward")?;

        let id = uuid::Uuid::new_v4().to_string();
        let row = self
            .db
            .insert_forward(&id, instance_id, remote_port, local_port)
            .context("persist forward row")?;

        self.active.write().await.insert(
            id.clone(),
            TunnelHandle { cancel: cancel.clone(), instance_id: instance_id.to_owned() },
        );

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            supervisor.run(id, machine, remote_port, local_port, handle, cancel).await;
        });

        self.bus.publish(BusEvent::PortForwarded { forward: row.clone() });
        Ok(row)
    }

    /// Tear down a forward and mark its row closed. Returns the final row,
    /// or `None` for an unknown id.
    pub async fn close(&self, forward_id: &str) -> anyhow::Result<Option<PortForward>> {
        if let Some(handle) = self.active.write().await.remove(forward_id) {
            handle.cancel.cancel();
        }
        let current = match self.db.get_forward(forward_id).context("read forward row")? {
            Some(row) => row,
            None => return Ok(None),
        };
        let row = self
            .db
            .set_forward_state(forward_id, ForwardStatus::Closed, current.reconnect_attempts, None)
            .context("close forward row")?;
        if let Some(ref row) = row {
            self.bus.publish(BusEvent::PortClosed { forward: row.clone() });
        }
        Ok(row)
    }

    /// Close every live forward belonging to an instance (instance delete).
    pub async fn close_for_instance(&self, instance_id: &str) -> anyhow::Result<()> {
        let ids: Vec<String> = {
            let active = self.active.read().await;
            active
                .iter()
                .filter(|(_, h)| h.instance_id == instance_id)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in ids {
            self.close(&id).await?;
        }
        Ok(())
    }

    /// Shutdown: cancel every tunnel task and close the rows.
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.active.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.close(&id).await {
                tracing::warn!(forward = %id, err = %e, "close forward at shutdown failed");
            }
        }
    }

    /// Supervision loop for one tunnel: watch the live connection, reconnect
    /// with backoff on transport loss, give up after the attempt budget.
    async fn run(
        self: Arc<Self>,
        forward_id: String,
        machine: Machine,
        remote_port: u16,
        local_port: u16,
        mut handle: client::Handle<TunnelHandler>,
        cancel: CancellationToken,
    ) {
        'live: loop {
            match watch(&mut handle, &cancel).await {
                WatchEnd::Cancelled => break 'live,
                WatchEnd::Dead(mut last_error) => {
                    let mut attempts = 0u32;
                    loop {
                        attempts += 1;
                        if attempts > self.max_attempts {
                            tracing::warn!(
                                forward = %forward_id,
                                attempts = self.max_attempts,
                                "tunnel reconnect exhausted"
                            );
                            self.mark(
                                &forward_id,
                                ForwardStatus::Failed,
                                self.max_attempts,
                                Some(&last_error),
                                true,
                            );
                            self.active.write().await.remove(&forward_id);
                            return;
                        }

                        self.mark(
                            &forward_id,
                            ForwardStatus::Reconnecting,
                            attempts,
                            Some(&last_error),
                            false,
                        );
                        let delay = self.base_delay * 2u32.saturating_pow(attempts - 1);
                        tokio::select! {
                            _ = cancel.cancelled() => break 'live,
                            _ = tokio::time::sleep(delay) => {}
                        }

                        match establish(&machine, remote_port, local_port, self.ssh_timeout, &cancel)
                            .await
                        {
                            Ok(restored) => {
                                handle = restored;
                                self.mark(&forward_id, ForwardStatus::Active, 0, None, false);
                                if let Ok(Some(row)) = self.db.get_forward(&forward_id) {
                                    self.bus.publish(BusEvent::PortForwarded { forward: row });
                                }
                                continue 'live;
                            }
                            Err(e) => {
                                tracing::warn!(
                                    forward = %forward_id,
                                    attempt = attempts,
                                    err = %e,
                                    "tunnel reconnect attempt failed"
                                );
                                last_error = e.to_string();
                            }
                        }
                    }
                }
            }
        }
        // Cancelled: `close()` owns the row transition.
    }

    fn mark(
        &self,
        forward_id: &str,
        status: ForwardStatus,
        attempts: u32,
        last_error: Option<&str>,
        publish_closed: bool,
    ) {
        match self.db.set_forward_state(forward_id, status, attempts, last_error) {
            Ok(Some(row)) => {
                if publish_closed {
                    self.bus.publish(BusEvent::PortClosed { forward: row });
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(forward = %forward_id, err = %e, "forward state update failed");
            }
        }
    }
}

enum WatchEnd {
    Cancelled,
    Dead(String),
}

/// Watch a live connection with periodic keepalives until it dies or the
/// tunnel is cancelled.
async fn watch(handle: &mut client::Handle<TunnelHandler>, cancel: &CancellationToken) -> WatchEnd {
    let mut timer = tokio::time::interval(KEEPALIVE_EVERY);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    timer.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return WatchEnd::Cancelled,
            _ = timer.tick() => {
                match tokio::time::timeout(KEEPALIVE_TIMEOUT, handle.send_keepalive(true)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return WatchEnd::Dead(format!("keepalive failed: {e}")),
                    Err(_) => return WatchEnd::Dead("keepalive timed out".to_owned()),
                }
            }
        }
    }
}

/// Connect, authenticate, and request the remote forward.
async fn establish(
    machine: &Machine,
    remote_port: u16,
    local_port: u16,
    timeout: Duration,
    cancel: &CancellationToken,
) -> anyhow::Result<client::Handle<TunnelHandler>> {
    let handler = TunnelHandler { local_port, cancel: cancel.clone() };
    let mut handle = connect_with(machine, timeout, handler).await?;
    handle
        .tcpip_forward("127.0.0.1", u32::from(remote_port))
        .await
        .context("request tcpip-forward")?;
    Ok(handle)
}

/// Bind an ephemeral port to learn a free one, then release it.
async fn alloc_local_port() -> anyhow::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.context("probe free port")?;
    Ok(listener.local_addr().context("read probe addr")?.port())
}

/// Client handler that relays forwarded-tcpip channels to the local target.
struct TunnelHandler {
    local_port: u16,
    cancel: CancellationToken,
}

impl client::Handler for TunnelHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _connected_address: &str,
        _connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let local_port = self.local_port;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = relay(channel, local_port, cancel).await {
                tracing::debug!(local_port, err = %e, "forwarded connection ended with error");
            }
        });
        Ok(())
    }
}

/// Bidirectional relay between one forwarded SSH channel and the local TCP
/// target.
async fn relay(
    mut channel: Channel<Msg>,
    local_port: u16,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut stream = TcpStream::connect(("127.0.0.1", local_port))
        .await
        .with_context(|| format!("connect local target :{local_port}"))?;
    let (mut tcp_read, mut tcp_write) = stream.split();
    let mut buf = vec![0u8; 8192];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = channel.eof().await;
                break;
            }
            read = tcp_read.read(&mut buf) => match read {
                Ok(0) => {
                    let _ = channel.eof().await;
                    break;
                }
                Ok(n) => channel.data(&buf[..n]).await.context("write to channel")?,
                Err(e) => return Err(e).context("read local target"),
            },
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    tcp_write.write_all(&data).await.context("write local target")?;
                }
                Some(ChannelMsg::Eof) => {
                    let _ = tcp_write.shutdown().await;
                    break;
                }
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "tunnel_tests.rs"]
mod tests;
