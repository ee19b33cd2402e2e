//! `task` table access.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{col_opt_ts, col_parse, col_ts, ts};
use crate::core::{NewTask, Task, TaskId, TaskStatus};
use crate::{Error, Result};

const COLUMNS: &str = "creation_order, id, kind, title, status, agent_type, worktree_path, \
     branch_name, spawn_attempts, next_attempt_at, failure_reason, created_at, started_at, \
     completed_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        creation_order: row.get(0)?,
        id: col_parse(row, 1)?,
        kind: col_parse(row, 2)?,
        title: row.get(3)?,
        status: col_parse(row, 4)?,
        agent_type: col_parse(row, 5)?,
        worktree_path: row.get::<_, Option<String>>(6)?.map(PathBuf::from),
        branch_name: row.get(7)?,
        spawn_attempts: row.get(8)?,
        next_attempt_at: col_opt_ts(row, 9)?,
        failure_reason: row.get(10)?,
        created_at: col_ts(row, 11)?,
        started_at: col_opt_ts(row, 12)?,
        completed_at: col_opt_ts(row, 13)?,
    })
}

pub fn insert(conn: &Connection, new: &NewTask, now: DateTime<Utc>) -> Result<Task> {
    if new.title.trim().is_empty() {
        return Err(Error::Validation("task title must not be empty".to_string()));
    }
    conn.execute(
        "INSERT INTO task (id, kind, title, status, agent_type, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            new.id.to_string(),
            new.kind.as_str(),
            new.title,
            TaskStatus::Pending.as_str(),
            new.agent_type.as_str(),
            ts(now),
        ],
    )?;
    require(conn, new.id)
}

pub fn get(conn: &Connection, id: TaskId) -> Result<Option<Task>> {
    let sql = format!("SELECT {} FROM task WHERE id = ?1", COLUMNS);
    Ok(conn
        .query_row(&sql, params![id.to_string()], from_row)
        .optional()?)
}

pub fn require(conn: &Connection, id: TaskId) -> Result<Task> {
    get(conn, id)?.ok_or_else(|| Error::NotFound(format!("task {}", id)))
}

/// All tasks in creation order, optionally filtered by status.
pub fn list(conn: &Connection, status: Option<TaskStatus>) -> Result<Vec<Task>> {
    let sql = format!(
        "SELECT {} FROM task WHERE (?1 IS NULL OR status = ?1) ORDER BY creation_order",
        COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![status.map(|s| s.as_str())], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Pending tasks whose retry backoff (if any) has elapsed, oldest first.
pub fn ready(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<Task>> {
    let sql = format!(
        "SELECT {} FROM task
         WHERE status = 'pending' AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
         ORDER BY creation_order",
        COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![ts(now)], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Validated status change. Stamps `started_at` on the first move to
/// `running` and `completed_at` on `completed`.
pub fn set_status(
    conn: &Connection,
    id: TaskId,
    next: TaskStatus,
    now: DateTime<Utc>,
) -> Result<Task> {
    let task = require(conn, id)?;
    if !task.status.can_transition_to(next) {
        return Err(Error::transition(
            format!("task {}", id),
            task.status,
            next,
        ));
    }
    conn.execute(
        "UPDATE task SET status = ?2,
             started_at = CASE WHEN ?2 = 'running' AND started_at IS NULL THEN ?3 ELSE started_at END,
             completed_at = CASE WHEN ?2 = 'completed' THEN ?3 ELSE completed_at END
         WHERE id = ?1",
        params![id.to_string(), next.as_str(), ts(now)],
    )?;
    require(conn, id)
}

/// Terminal failure with a reason.
pub fn fail(conn: &Connection, id: TaskId, reason: &str, now: DateTime<Utc>) -> Result<Task> {
    set_status(conn, id, TaskStatus::Failed, now)?;
    conn.execute(
        "UPDATE task SET failure_reason = ?2 WHERE id = ?1",
        params![id.to_string(), reason],
    )?;
    require(conn, id)
}

/// Returns a task to `pending` after a transient spawn failure.
pub fn defer(
    conn: &Connection,
    id: TaskId,
    attempts: u32,
    next_attempt_at: DateTime<Utc>,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<Task> {
    let task = require(conn, id)?;
    if task.status != TaskStatus::Pending {
        set_status(conn, id, TaskStatus::Pending, now)?;
    }
    conn.execute(
        "UPDATE task SET spawn_attempts = ?2, next_attempt_at = ?3, failure_reason = ?4
         WHERE id = ?1",
        params![id.to_string(), attempts, ts(next_attempt_at), reason],
    )?;
    require(conn, id)
}

/// Clears retry bookkeeping once a spawn succeeds.
pub fn clear_retry(conn: &Connection, id: TaskId) -> Result<()> {
    conn.execute(
        "UPDATE task SET next_attempt_at = NULL, failure_reason = NULL WHERE id = ?1",
        params![id.to_string()],
    )?;
    Ok(())
}

pub fn set_worktree(
    conn: &Connection,
    id: TaskId,
    worktree: Option<&Path>,
    branch: Option<&str>,
) -> Result<()> {
    let changed = conn.execute(
        "UPDATE task SET worktree_path = ?2, branch_name = ?3 WHERE id = ?1",
        params![
            id.to_string(),
            worktree.map(|p| p.to_string_lossy().into_owned()),
            branch
        ],
    )?;
    if changed == 0 {
        return Err(Error::NotFound(format!("task {}", id)));
    }
    Ok(())
}

/// The earliest task that still holds its place in the merge order: not
/// terminal itself and without a terminal merge entry.
pub fn merge_head(conn: &Connection) -> Result<Option<Task>> {
    let sql = format!(
        "SELECT {} FROM task t
         WHERE t.status NOT IN ('merged', 'failed')
           AND NOT EXISTS (
               SELECT 1 FROM merge_queue m
               WHERE m.task_id = t.id AND m.state IN ('merged', 'conflict', 'failed'))
         ORDER BY t.creation_order
         LIMIT 1",
        prefixed("t")
    );
    Ok(conn.query_row(&sql, [], from_row).optional()?)
}

fn prefixed(alias: &str) -> String {
    COLUMNS
        .split(", ")
        .map(|c| format!("{}.{}", alias, c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn count_by_status(conn: &Connection) -> Result<Vec<(TaskStatus, u32)>> {
    let mut stmt =
        conn.prepare("SELECT status, COUNT(*) FROM task GROUP BY status ORDER BY status")?;
    let rows = stmt.query_map([], |row| Ok((col_parse(row, 0)?, row.get(1)?)))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
