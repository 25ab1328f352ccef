// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Instance, machine, and port-forward records plus their query contracts.
//!
//! List ordering, display-order maintenance, and the stale-forward sweep all
//! live here; callers never write SQL of their own.

use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::db::{epoch_ms, Db};
use crate::status::Status;

/// A managed terminal session with durable identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub working_dir: String,
    /// `None` = local binding; `Some(machine)` = remote.
    pub machine_id: Option<String>,
    pub status: Status,
    pub pinned: bool,
    pub display_order: i64,
    pub pid: Option<i64>,
    pub last_cwd: Option<String>,
    pub last_activity_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub closed_at: Option<i64>,
}

impl Instance {
    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }

    pub fn is_remote(&self) -> bool {
        self.machine_id.is_some()
    }
}

/// A remote host reachable over SSH.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub key_path: Option<String>,
    pub forward_credentials: bool,
    pub status: String,
    pub last_connected_at: Option<i64>,
    pub created_at: i64,
}

/// Lifecycle of a reverse port-forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardStatus {
    Active,
    Reconnecting,
    Closed,
    Failed,
}

impl ForwardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "reconnecting" => Some(Self::Reconnecting),
            "closed" => Some(Self::Closed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A reverse port-forward (remote port → local port) owned by one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForward {
    pub id: String,
    pub instance_id: String,
    pub remote_port: u16,
    pub local_port: u16,
    pub status: ForwardStatus,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One `(id, display_order)` pair, broadcast after a bulk reorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ordinal {
    pub id: String,
    pub display_order: i64,
}

/// A `started`/`completed` note recorded on idle↔working transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityNote {
    pub id: i64,
    pub instance_id: String,
    pub kind: String,
    pub message: String,
    pub created_at: i64,
}

fn bad_enum(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unrecognized enum value {value:?}").into(),
    )
}

fn instance_from_row(row: &Row<'_>) -> rusqlite::Result<Instance> {
    let status: String = row.get(4)?;
    Ok(Instance {
        id: row.get(0)?,
        name: row.get(1)?,
        working_dir: row.get(2)?,
        machine_id: row.get(3)?,
        status: Status::parse(&status).ok_or_else(|| bad_enum(4, &status))?,
        pinned: row.get::<_, i64>(5)? != 0,
        display_order: row.get(6)?,
        pid: row.get(7)?,
        last_cwd: row.get(8)?,
        last_activity_at: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        closed_at: row.get(12)?,
    })
}

const INSTANCE_COLS: &str = "id, name, working_dir, machine_id, status, pinned, display_order, \
                             pid, last_cwd, last_activity_at, created_at, updated_at, closed_at";

fn machine_from_row(row: &Row<'_>) -> rusqlite::Result<Machine> {
    Ok(Machine {
        id: row.get(0)?,
        host: row.get(1)?,
        port: row.get::<_, i64>(2)? as u16,
        username: row.get(3)?,
        key_path: row.get(4)?,
        forward_credentials: row.get::<_, i64>(5)? != 0,
        status: row.get(6)?,
        last_connected_at: row.get(7)?,
        created_at: row.get(8)?,
    })
}

const MACHINE_COLS: &str = "id, host, port, username, key_path, forward_credentials, status, \
                            last_connected_at, created_at";

fn forward_from_row(row: &Row<'_>) -> rusqlite::Result<PortForward> {
    let status: String = row.get(4)?;
    Ok(PortForward {
        id: row.get(0)?,
        instance_id: row.get(1)?,
        remote_port: row.get::<_, i64>(2)? as u16,
        local_port: row.get::<_, i64>(3)? as u16,
        status: ForwardStatus::parse(&status).ok_or_else(|| bad_enum(4, &status))?,
        reconnect_attempts: row.get::<_, i64>(5)? as u32,
        last_error: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

const FORWARD_COLS: &str = "id, instance_id, remote_port, local_port, status, \
                            reconnect_attempts, last_error, created_at, updated_at";

impl Db {
    // -- Instances -------------------------------------------------------------

    /// Insert a new instance at the end of the display order.
    pub fn insert_instance(
        &self,
        id: &str,
        name: &str,
        working_dir: &str,
        machine_id: Option<&str>,
    ) -> rusqlite::Result<Instance> {
        let now = epoch_ms();
        self.with_tx(|tx| {
            let next_order: i64 = tx.query_row(
                "SELECT COALESCE(MAX(display_order) + 1, 0) FROM instances WHERE closed_at IS NULL",
                [],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO instances (id, name, working_dir, machine_id, status, pinned, \
                 display_order, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, 'idle', 0, ?5, ?6, ?6)",
                params![id, name, working_dir, machine_id, next_order, now],
            )?;
            tx.query_row(
                &format!("SELECT {INSTANCE_COLS} FROM instances WHERE id = ?1"),
                [id],
                instance_from_row,
            )
        })
    }

    pub fn get_instance(&self, id: &str) -> rusqlite::Result<Option<Instance>> {
        self.with(|conn| {
            conn.query_row(
                &format!("SELECT {INSTANCE_COLS} FROM instances WHERE id = ?1"),
                [id],
                instance_from_row,
            )
            .optional()
        })
    }

    /// Open instances ordered for display: pinned first, then display order,
    /// newest-created as the tiebreak.
    pub fn list_instances(&self) -> rusqlite::Result<Vec<Instance>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {INSTANCE_COLS} FROM instances WHERE closed_at IS NULL \
                 ORDER BY pinned DESC, display_order ASC, created_at DESC"
            ))?;
            let rows = stmt.query_map([], instance_from_row)?;
            rows.collect()
        })
    }

    /// Open instances with the given binding (`None` = local).
    pub fn open_instances_by_binding(&self, remote: bool) -> rusqlite::Result<Vec<Instance>> {
        let filter = if remote { "IS NOT NULL" } else { "IS NULL" };
        self.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {INSTANCE_COLS} FROM instances \
                 WHERE closed_at IS NULL AND machine_id {filter} \
                 ORDER BY created_at ASC"
            ))?;
            let rows = stmt.query_map([], instance_from_row)?;
            rows.collect()
        })
    }

    pub fn rename_instance(&self, id: &str, name: &str) -> rusqlite::Result<bool> {
        self.with(|conn| {
            let n = conn.execute(
                "UPDATE instances SET name = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, name, epoch_ms()],
            )?;
            Ok(n > 0)
        })
    }

    pub fn set_instance_pinned(&self, id: &str, pinned: bool) -> rusqlite::Result<bool> {
        self.with(|conn| {
            let n = conn.execute(
                "UPDATE instances SET pinned = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, pinned as i64, epoch_ms()],
            )?;
            Ok(n > 0)
        })
    }

    /// Persist a status transition. Only the reconciler calls this.
    pub fn set_instance_status(&self, id: &str, status: Status) -> rusqlite::Result<bool> {
        self.with(|conn| {
            let n = conn.execute(
                "UPDATE instances SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, status.as_str(), epoch_ms()],
            )?;
            Ok(n > 0)
        })
    }

    pub fn set_instance_pid(&self, id: &str, pid: Option<i64>) -> rusqlite::Result<()> {
        self.with(|conn| {
            conn.execute(
                "UPDATE instances SET pid = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, pid, epoch_ms()],
            )?;
            Ok(())
        })
    }

    pub fn set_instance_last_cwd(&self, id: &str, cwd: &str) -> rusqlite::Result<()> {
        self.with(|conn| {
            conn.execute(
                "UPDATE instances SET last_cwd = ?2 WHERE id = ?1",
                params![id, cwd],
            )?;
            Ok(())
        })
    }

    pub fn touch_instance_activity(&self, id: &str) -> rusqlite::Result<()> {
        self.with(|conn| {
            conn.execute(
                "UPDATE instances SET last_activity_at = ?2 WHERE id = ?1",
                params![id, epoch_ms()],
            )?;
            Ok(())
        })
    }

    /// Stamp the instance closed. The row is retained for history.
    pub fn close_instance(&self, id: &str) -> rusqlite::Result<bool> {
        self.with(|conn| {
            let n = conn.execute(
                "UPDATE instances SET closed_at = ?2, updated_at = ?2 WHERE id = ?1 \
                 AND closed_at IS NULL",
                params![id, epoch_ms()],
            )?;
            Ok(n > 0)
        })
    }

    /// Hard-delete an instance row. Only used to roll back a create whose
    /// backend spawn failed; normal teardown goes through [`close_instance`].
    ///
    /// [`close_instance`]: Db::close_instance
    pub fn delete_instance_row(&self, id: &str) -> rusqlite::Result<()> {
        self.with(|conn| {
            conn.execute("DELETE FROM instances WHERE id = ?1", [id])?;
            Ok(())
        })
    }

    /// Rewrite display ordinals in the given order. Atomic: an unknown id
    /// aborts the whole transaction and no ordinal changes.
    pub fn reorder_instances(&self, ids: &[String]) -> rusqlite::Result<Vec<Ordinal>> {
        let now = epoch_ms();
        self.with_tx(|tx| {
            let mut ordinals = Vec::with_capacity(ids.len());
            for (idx, id) in ids.iter().enumerate() {
                let n = tx.execute(
                    "UPDATE instances SET display_order = ?2, updated_at = ?3 \
                     WHERE id = ?1 AND closed_at IS NULL",
                    params![id, idx as i64, now],
                )?;
                if n == 0 {
                    return Err(rusqlite::Error::QueryReturnedNoRows);
                }
                ordinals.push(Ordinal { id: id.clone(), display_order: idx as i64 });
            }
            Ok(ordinals)
        })
    }

    // -- Machines --------------------------------------------------------------

    pub fn insert_machine(
        &self,
        id: &str,
        host: &str,
        port: u16,
        username: &str,
        key_path: Option<&str>,
        forward_credentials: bool,
    ) -> rusqlite::Result<Machine> {
        self.with(|conn| {
            conn.execute(
                "INSERT INTO remote_machines \
                 (id, host, port, username, key_path, forward_credentials, status, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'unknown', ?7)",
                params![id, host, port as i64, username, key_path, forward_credentials as i64, epoch_ms()],
            )?;
            conn.query_row(
                &format!("SELECT {MACHINE_COLS} FROM remote_machines WHERE id = ?1"),
                [id],
                machine_from_row,
            )
        })
    }

    pub fn get_machine(&self, id: &str) -> rusqlite::Result<Option<Machine>> {
        self.with(|conn| {
            conn.query_row(
                &format!("SELECT {MACHINE_COLS} FROM remote_machines WHERE id = ?1"),
                [id],
                machine_from_row,
            )
            .optional()
        })
    }

    pub fn list_machines(&self) -> rusqlite::Result<Vec<Machine>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MACHINE_COLS} FROM remote_machines ORDER BY created_at ASC"
            ))?;
            let rows = stmt.query_map([], machine_from_row)?;
            rows.collect()
        })
    }

    /// Delete a machine unless open instances still reference it.
    /// Returns `Ok(None)` on success, `Ok(Some(count))` when blocked.
    pub fn delete_machine(&self, id: &str) -> rusqlite::Result<Option<i64>> {
        self.with_tx(|tx| {
            let open: i64 = tx.query_row(
                "SELECT COUNT(*) FROM instances WHERE machine_id = ?1 AND closed_at IS NULL",
                [id],
                |row| row.get(0),
            )?;
            if open > 0 {
                return Ok(Some(open));
            }
            let n = tx.execute("DELETE FROM remote_machines WHERE id = ?1", [id])?;
            if n == 0 {
                return Err(rusqlite::Error::QueryReturnedNoRows);
            }
            Ok(None)
        })
    }

    pub fn set_machine_liveness(&self, id: &str, status: &str) -> rusqlite::Result<()> {
        self.with(|conn| {
            if status == "online" {
                conn.execute(
                    "UPDATE remote_machines SET status = ?2, last_connected_at = ?3 WHERE id = ?1",
                    params![id, status, epoch_ms()],
                )?;
            } else {
                conn.execute(
                    "UPDATE remote_machines SET status = ?2 WHERE id = ?1",
                    params![id, status],
                )?;
            }
            Ok(())
        })
    }

    // -- Port forwards ---------------------------------------------------------

    pub fn insert_forward(
        &self,
        id: &str,
        instance_id: &str,
        remote_port: u16,
        local_port: u16,
    ) -> rusqlite::Result<PortForward> {
        let now = epoch_ms();
        self.with(|conn| {
            conn.execute(
                "INSERT INTO port_forwards \
                 (id, instance_id, remote_port, local_port, status, reconnect_attempts, \
                  created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, 'active', 0, ?5, ?5)",
                params![id, instance_id, remote_port as i64, local_port as i64, now],
            )?;
            conn.query_row(
                &format!("SELECT {FORWARD_COLS} FROM port_forwards WHERE id = ?1"),
                [id],
                forward_from_row,
            )
        })
    }

    pub fn get_forward(&self, id: &str) -> rusqlite::Result<Option<PortForward>> {
        self.with(|conn| {
            conn.query_row(
                &format!("SELECT {FORWARD_COLS} FROM port_forwards WHERE id = ?1"),
                [id],
                forward_from_row,
            )
            .optional()
        })
    }

    pub fn list_forwards(&self, instance_id: &str) -> rusqlite::Result<Vec<PortForward>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {FORWARD_COLS} FROM port_forwards WHERE instance_id = ?1 \
                 ORDER BY created_at ASC"
            ))?;
            let rows = stmt.query_map([instance_id], forward_from_row)?;
            rows.collect()
        })
    }

    /// Update a forward's lifecycle state and bookkeeping in one statement.
    pub fn set_forward_state(
        &self,
        id: &str,
        status: ForwardStatus,
        reconnect_attempts: u32,
        last_error: Option<&str>,
    ) -> rusqlite::Result<Option<PortForward>> {
        self.with(|conn| {
            conn.execute(
                "UPDATE port_forwards SET status = ?2, reconnect_attempts = ?3, \
                 last_error = ?4, updated_at = ?5 WHERE id = ?1",
                params![id, status.as_str(), reconnect_attempts as i64, last_error, epoch_ms()],
            )?;
            conn.query_row(
                &format!("SELECT {FORWARD_COLS} FROM port_forwards WHERE id = ?1"),
                [id],
                forward_from_row,
            )
            .optional()
        })
    }

    /// Startup recovery: no in-memory forward survived the restart, so every
    /// non-closed row is stale. Returns the number of rows swept.
    pub fn sweep_stale_forwards(&self) -> rusqlite::Result<usize> {
        self.with(|conn| {
            conn.execute(
                "UPDATE port_forwards SET status = 'closed', updated_at = ?1 \
                 WHERE status != 'closed'",
                params![epoch_ms()],
            )
        })
    }

    // -- Status events and activity --------------------------------------------

    pub fn append_status_event(
        &self,
        instance_id: &str,
        status: Status,
        source: &str,
    ) -> rusqlite::Result<()> {
        self.with(|conn| {
            conn.execute(
                "INSERT INTO status_events (instance_id, status, source, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![instance_id, status.as_str(), source, epoch_ms()],
            )?;
            Ok(())
        })
    }

    pub fn append_activity(
        &self,
        instance_id: &str,
        kind: &str,
        message: &str,
    ) -> rusqlite::Result<()> {
        self.with(|conn| {
            conn.execute(
                "INSERT INTO activity_feed (instance_id, kind, message, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![instance_id, kind, message, epoch_ms()],
            )?;
            Ok(())
        })
    }

    pub fn list_activity(
        &self,
        instance_id: &str,
        limit: usize,
    ) -> rusqlite::Result<Vec<ActivityNote>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, instance_id, kind, message, created_at FROM activity_feed \
                 WHERE instance_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![instance_id, limit as i64], |row| {
                Ok(ActivityNote {
                    id: row.get(0)?,
                    instance_id: row.get(1)?,
                    kind: row.get(2)?,
                    message: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?;
            rows.collect()
        })
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
