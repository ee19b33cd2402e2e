//! Schema migrations.
//!
//! Each migration runs at most once; the applied versions are recorded in
//! `schema_version`, so opening an up-to-date database is a no-op.

use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use tracing::info;

use crate::Result;

const MIGRATIONS: &[&str] = &[
    // 1: core tables
    r"
    CREATE TABLE task (
        creation_order  INTEGER PRIMARY KEY AUTOINCREMENT,
        id              TEXT NOT NULL UNIQUE,
        kind            TEXT NOT NULL,
        title           TEXT NOT NULL,
        status          TEXT NOT NULL,
        agent_type      TEXT NOT NULL,
        worktree_path   TEXT,
        branch_name     TEXT,
        spawn_attempts  INTEGER NOT NULL DEFAULT 0,
        next_attempt_at TEXT,
        failure_reason  TEXT,
        created_at      TEXT NOT NULL,
        started_at      TEXT,
        completed_at    TEXT
    );
    CREATE INDEX idx_task_status ON task(status, creation_order);

    CREATE TABLE agent_instance (
        id             TEXT PRIMARY KEY,
        agent_type     TEXT NOT NULL,
        task_id        TEXT NOT NULL REFERENCES task(id),
        pid            INTEGER,
        status         TEXT NOT NULL,
        restart_count  INTEGER NOT NULL DEFAULT 0,
        spawned_at     TEXT NOT NULL,
        last_heartbeat TEXT,
        respawn_at     TEXT,
        exit_code      INTEGER
    );
    CREATE UNIQUE INDEX idx_agent_singleton ON agent_instance(agent_type)
        WHERE status IN ('spawned', 'running', 'stalled');
    CREATE INDEX idx_agent_task ON agent_instance(task_id);

    CREATE TABLE message (
        seq                 INTEGER PRIMARY KEY AUTOINCREMENT,
        id                  TEXT NOT NULL UNIQUE,
        sender              TEXT NOT NULL,
        recipient           TEXT NOT NULL,
        suggested_recipient TEXT,
        kind                TEXT NOT NULL,
        payload             TEXT NOT NULL,
        priority            INTEGER NOT NULL,
        status              TEXT NOT NULL,
        created_at          TEXT NOT NULL,
        started_at          TEXT,
        completed_at        TEXT,
        duration_ms         INTEGER,
        error               TEXT
    );
    CREATE INDEX idx_message_inbox ON message(recipient, status, seq);

    CREATE TABLE merge_queue (
        task_id        TEXT PRIMARY KEY REFERENCES task(id),
        state          TEXT NOT NULL,
        conflict_files TEXT NOT NULL DEFAULT '[]',
        merge_commit   TEXT,
        error          TEXT,
        updated_at     TEXT NOT NULL
    );
    CREATE INDEX idx_merge_state ON merge_queue(state);
    ",
    // 2: diagnostics
    r"
    CREATE TABLE crash_record (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        agent_instance_id TEXT NOT NULL,
        task_id           TEXT NOT NULL,
        error_type        TEXT NOT NULL,
        error_message     TEXT NOT NULL,
        stack_trace       TEXT,
        signature         TEXT NOT NULL,
        restart_count     INTEGER NOT NULL,
        respawned         INTEGER NOT NULL,
        bug_reported      INTEGER NOT NULL,
        created_at        TEXT NOT NULL
    );
    CREATE INDEX idx_crash_signature ON crash_record(signature);
    CREATE INDEX idx_crash_task ON crash_record(task_id);

    CREATE TABLE health_check (
        id                    INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp             TEXT NOT NULL,
        status                TEXT NOT NULL,
        active_agents         INTEGER NOT NULL,
        crashed_agents        INTEGER NOT NULL,
        last_tick_age_seconds INTEGER,
        actions_taken         TEXT NOT NULL
    );

    CREATE TRIGGER crash_record_append_only BEFORE UPDATE ON crash_record
    BEGIN
        SELECT RAISE(ABORT, 'crash_record is append-only');
    END;
    CREATE TRIGGER health_check_append_only BEFORE UPDATE ON health_check
    BEGIN
        SELECT RAISE(ABORT, 'health_check is append-only');
    END;
    ",
    // 3: escalation
    r"
    CREATE TABLE bug_record (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id           TEXT NOT NULL,
        agent_instance_id TEXT,
        error_type        TEXT NOT NULL,
        signature         TEXT NOT NULL,
        root_cause        TEXT NOT NULL,
        stack_trace       TEXT,
        assigned_agent    TEXT NOT NULL,
        created_at        TEXT NOT NULL
    );
    CREATE INDEX idx_bug_task ON bug_record(task_id);

    CREATE TABLE alert (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        level      TEXT NOT NULL,
        message    TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE orchestrator_tick (
        instance_id TEXT PRIMARY KEY,
        started_at  TEXT NOT NULL,
        last_tick   TEXT NOT NULL
    );
    ",
];

/// Latest schema version known to this build.
pub const SCHEMA_VERSION: u32 = MIGRATIONS.len() as u32;

/// Brings the database up to [`SCHEMA_VERSION`]. Returns the resulting version.
pub(super) fn migrate(conn: &mut Connection) -> Result<u32> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )?;

    let current: u32 = tx
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<u32>>(0)
        })
        .optional()?
        .flatten()
        .unwrap_or(0);

    for (idx, sql) in MIGRATIONS.iter().enumerate() {
        let version = idx as u32 + 1;
        if version <= current {
            continue;
        }
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![version, super::ts(chrono::Utc::now())],
        )?;
        info!(version, "applied schema migration");
    }

    tx.commit()?;
    Ok(SCHEMA_VERSION.max(current))
}
