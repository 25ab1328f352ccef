// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! SQLite storage: connection lifecycle, schema, and additive migrations.

use std::path::Path;

use anyhow::Context;
use parking_lot::Mutex;
use rusqlite::Connection;

/// Base schema. Columns added after the initial release are applied through
/// [`add_column_if_missing`] so existing databases upgrade in place.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS remote_machines (
    id                  TEXT PRIMARY KEY,
    host                TEXT NOT NULL,
    port                INTEGER NOT NULL DEFAULT 22,
    username            TEXT NOT NULL,
    key_path            TEXT,
    forward_credentials INTEGER NOT NULL DEFAULT 0,
    status              TEXT NOT NULL DEFAULT 'unknown',
    last_connected_at   INTEGER,
    created_at          INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS instances (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    working_dir   TEXT NOT NULL,
    machine_id    TEXT REFERENCES remote_machines(id) ON DELETE SET NULL,
    status        TEXT NOT NULL DEFAULT 'idle'
                  CHECK (status IN ('idle','working','awaiting','error')),
    pinned        INTEGER NOT NULL DEFAULT 0,
    display_order INTEGER NOT NULL DEFAULT 0,
    pid           INTEGER,
    created_at    INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL,
    closed_at     INTEGER
);

CREATE TABLE IF NOT EXISTS port_forwards (
    id                 TEXT PRIMARY KEY,
    instance_id        TEXT NOT NULL REFERENCES instances(id),
    remote_port        INTEGER NOT NULL,
    local_port         INTEGER NOT NULL,
    status             TEXT NOT NULL DEFAULT 'active'
                       CHECK (status IN ('active','reconnecting','closed','failed')),
    reconnect_attempts INTEGER NOT NULL DEFAULT 0,
    last_error         TEXT,
    created_at         INTEGER NOT NULL,
    updated_at         INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS status_events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    instance_id TEXT NOT NULL,
    status      TEXT NOT NULL,
    source      TEXT NOT NULL,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS activity_feed (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    instance_id TEXT NOT NULL,
    kind        TEXT NOT NULL,
    message     TEXT NOT NULL,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id          TEXT PRIMARY KEY,
    instance_id TEXT,
    title       TEXT,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS session_messages (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    role       TEXT NOT NULL,
    content    TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS settings (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS projects (
    id         TEXT PRIMARY KEY,
    name       TEXT NOT NULL,
    path       TEXT NOT NULL UNIQUE,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS project_instances (
    project_id  TEXT NOT NULL REFERENCES projects(id),
    instance_id TEXT NOT NULL REFERENCES instances(id),
    PRIMARY KEY (project_id, instance_id)
);

CREATE TABLE IF NOT EXISTS global_tasks (
    id         TEXT PRIMARY KEY,
    title      TEXT NOT NULL,
    done       INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
";

/// Handle to the single database connection.
///
/// Queries are short and local, so a mutex around one connection is the
/// whole pool. Multi-step mutations take the guard once and run inside a
/// transaction.
pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    /// Open (creating if needed) the database at `path` and migrate it.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create data dir {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open database {}", path.display()))?;
        Self::init(conn)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory().context("open in-memory database")?)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").context("enable foreign keys")?;
        conn.busy_timeout(std::time::Duration::from_secs(5)).context("set busy timeout")?;
        migrate(&conn).context("run migrations")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Run a read or single-statement write against the connection.
    pub fn with<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> rusqlite::Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run a multi-step mutation inside a transaction.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<T>,
    ) -> rusqlite::Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)?;

    // Additive column migrations, detected by table inspection.
    add_column_if_missing(conn, "instances", "last_cwd", "TEXT")?;
    add_column_if_missing(conn, "instances", "last_activity_at", "INTEGER")?;
    Ok(())
}

/// `ALTER TABLE ... ADD COLUMN` when `PRAGMA table_info` shows it missing.
fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    decl: &str,
) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(());
        }
    }
    conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))?;
    Ok(())
}

/// Current epoch millis.
pub fn epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
#[path = "db_tests.rs"]
mod tests;
