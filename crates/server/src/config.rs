// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

/// Configuration for the flotilla orchestrator.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "flotilla", about = "Multi-instance terminal orchestrator")]
pub struct ServerConfig {
    /// Host to bind on.
    #[arg(long, default_value = "127.0.0.1", env = "FLOTILLA_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 9600, env = "FLOTILLA_PORT")]
    pub port: u16,

    /// Path to the SQLite database file.
    #[arg(long, default_value = "~/.flotilla/flotilla.db", env = "FLOTILLA_DB")]
    pub db_path: String,

    /// Root directory holding per-project session logs written by hook scripts.
    #[arg(long, default_value = "~/.flotilla/projects", env = "FLOTILLA_LOG_ROOT")]
    pub log_root: String,

    /// Scrollback cap per instance, in bytes.
    #[arg(long, default_value_t = 100_000, env = "FLOTILLA_SCROLLBACK_BYTES")]
    pub scrollback_bytes: usize,

    /// Local status poll interval in seconds.
    #[arg(long, default_value_t = 30, env = "FLOTILLA_LOCAL_POLL_SECS")]
    pub local_poll_secs: u64,

    /// Remote status poll interval in seconds.
    #[arg(long, default_value_t = 10, env = "FLOTILLA_REMOTE_POLL_SECS")]
    pub remote_poll_secs: u64,

    /// Session-log age (seconds) at or above which an instance polls as idle.
    #[arg(long, default_value_t = 60, env = "FLOTILLA_IDLE_AFTER_SECS")]
    pub idle_after_secs: u64,

    /// How long pollers defer to an authoritative hook, in milliseconds.
    #[arg(long, default_value_t = 10_000, env = "FLOTILLA_HOOK_GRACE_MS")]
    pub hook_grace_ms: u64,

    /// SSH connect ready-timeout in seconds.
    #[arg(long, default_value_t = 10, env = "FLOTILLA_SSH_TIMEOUT_SECS")]
    pub ssh_timeout_secs: u64,

    /// Max SSH/tunnel reconnect attempts before giving up.
    #[arg(long, default_value_t = 5, env = "FLOTILLA_RECONNECT_ATTEMPTS")]
    pub reconnect_attempts: u32,

    /// Base reconnect delay in seconds (doubled per attempt).
    #[arg(long, default_value_t = 1, env = "FLOTILLA_RECONNECT_BASE_SECS")]
    pub reconnect_base_secs: u64,

    /// Broadcast bus queue depth per subscriber.
    #[arg(long, default_value_t = 1024, env = "FLOTILLA_BUS_CAPACITY")]
    pub bus_capacity: usize,

    /// Default terminal grid for new instances.
    #[arg(long, default_value_t = 80, env = "FLOTILLA_DEFAULT_COLS")]
    pub default_cols: u16,

    #[arg(long, default_value_t = 24, env = "FLOTILLA_DEFAULT_ROWS")]
    pub default_rows: u16,

    /// Name of a credential environment variable to forward into remote
    /// shells (value read from this process's environment at spawn time).
    #[arg(long, env = "FLOTILLA_CREDENTIAL_VAR")]
    pub credential_var: Option<String>,
}

impl ServerConfig {
    pub fn local_poll_interval(&self) -> Duration {
        Duration::from_secs(self.local_poll_secs)
    }

    pub fn remote_poll_interval(&self) -> Duration {
        Duration::from_secs(self.remote_poll_secs)
    }

    pub fn idle_after(&self) -> Duration {
        Duration::from_secs(self.idle_after_secs)
    }

    pub fn hook_grace(&self) -> Duration {
        Duration::from_millis(self.hook_grace_ms)
    }

    pub fn ssh_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_timeout_secs)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_base_secs)
    }
}

/// Programmatic defaults, used by embedders and tests. Mirrors the clap
/// defaults except the port (0 = ephemeral) and database path (in-memory).
impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 0,
            db_path: ":memory:".to_owned(),
            log_root: "~/.flotilla/projects".to_owned(),
            scrollback_bytes: 100_000,
            local_poll_secs: 30,
            remote_poll_secs: 10,
            idle_after_secs: 60,
            hook_grace_ms: 10_000,
            ssh_timeout_secs: 10,
            reconnect_attempts: 5,
            reconnect_base_secs: 1,
            bus_capacity: 1024,
            default_cols: 80,
            default_rows: 24,
            credential_var: None,
        }
    }
}
