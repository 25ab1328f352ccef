// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn open_creates_schema() {
    let db = Db::open_in_memory().unwrap();
    let count: i64 = db
        .with(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'instances'",
                [],
                |row| row.get(0),
            )
        })
        .unwrap();
    assert_eq!(count, 1);
}

#[test]
fn migrations_are_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db");
    drop(Db::open(&path).unwrap());
    // Reopening runs the migration pass again over an existing schema.
    drop(Db::open(&path).unwrap());
}

#[test]
fn additive_column_migration_upgrades_old_schema() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db");
    {
        // Simulate a database from before `last_cwd` existed.
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE instances (
                id TEXT PRIMARY KEY, name TEXT NOT NULL, working_dir TEXT NOT NULL,
                machine_id TEXT, status TEXT NOT NULL DEFAULT 'idle',
                pinned INTEGER NOT NULL DEFAULT 0, display_order INTEGER NOT NULL DEFAULT 0,
                pid INTEGER, created_at INTEGER NOT NULL, updated_at INTEGER NOT NULL,
                closed_at INTEGER
            );",
        )
        .unwrap();
    }

    let db = Db::open(&path).unwrap();
    db.with(|conn| {
        conn.execute(
            "UPDATE instances SET last_cwd = '/tmp', last_activity_at = 1 WHERE 1 = 0",
            [],
        )
    })
    .unwrap();
}

#[test]
fn status_check_constraint_rejects_garbage() {
    let db = Db::open_in_memory().unwrap();
    let err = db.with(|conn| {
        conn.execute(
            "INSERT INTO instances (id, name, working_dir, status, created_at, updated_at) \
             VALUES ('x', 'x', '/tmp', 'bogus', 0, 0)",
            [],
        )
    });
    assert!(err.is_err());
}

#[test]
fn with_tx_rolls_back_on_error() {
    let db = Db::open_in_memory().unwrap();
    let result: rusqlite::Result<()> = db.with_tx(|tx| {
        tx.execute(
            "INSERT INTO instances (id, name, working_dir, created_at, updated_at) \
             VALUES ('a', 'a', '/tmp', 0, 0)",
            [],
        )?;
        Err(rusqlite::Error::QueryReturnedNoRows)
    });
    assert!(result.is_err());

    let count: i64 = db
        .with(|conn| conn.query_row("SELECT COUNT(*) FROM instances", [], |row| row.get(0)))
        .unwrap();
    assert_eq!(count, 0);
}
