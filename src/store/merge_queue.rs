//! `merge_queue` table access and the single-active-merge check-and-set.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{col_json, col_parse, col_ts, ts};
use crate::core::{MergeQueueEntry, MergeState, TaskId};
use crate::{Error, Result};

const COLUMNS: &str = "m.task_id, m.state, m.conflict_files, m.merge_commit, m.error, m.updated_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<MergeQueueEntry> {
    Ok(MergeQueueEntry {
        task_id: col_parse(row, 0)?,
        state: col_parse(row, 1)?,
        conflict_files: col_json(row, 2)?,
        merge_commit: row.get(3)?,
        error: row.get(4)?,
        updated_at: col_ts(row, 5)?,
    })
}

/// Queues a task in `awaiting_merge`. Re-enqueueing returns the existing entry.
pub fn enqueue(conn: &Connection, task_id: TaskId, now: DateTime<Utc>) -> Result<MergeQueueEntry> {
    conn.execute(
        "INSERT OR IGNORE INTO merge_queue (task_id, state, updated_at) VALUES (?1, ?2, ?3)",
        params![task_id.to_string(), MergeState::AwaitingMerge.as_str(), ts(now)],
    )?;
    require(conn, task_id)
}

pub fn get(conn: &Connection, task_id: TaskId) -> Result<Option<MergeQueueEntry>> {
    let sql = format!("SELECT {} FROM merge_queue m WHERE m.task_id = ?1", COLUMNS);
    Ok(conn
        .query_row(&sql, params![task_id.to_string()], from_row)
        .optional()?)
}

pub fn require(conn: &Connection, task_id: TaskId) -> Result<MergeQueueEntry> {
    get(conn, task_id)?.ok_or_else(|| Error::NotFound(format!("merge entry for task {}", task_id)))
}

/// Every entry, in the owning task's creation order.
pub fn list(conn: &Connection) -> Result<Vec<MergeQueueEntry>> {
    let sql = format!(
        "SELECT {} FROM merge_queue m JOIN task t ON t.id = m.task_id ORDER BY t.creation_order",
        COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// The entry holding the system-wide merge slot, if any.
pub fn active(conn: &Connection) -> Result<Option<MergeQueueEntry>> {
    let sql = format!(
        "SELECT {} FROM merge_queue m WHERE m.state IN ('dry_run', 'merging') LIMIT 1",
        COLUMNS
    );
    Ok(conn.query_row(&sql, [], from_row).optional()?)
}

/// Validated state change. Entering `dry_run` or `merging` claims the merge
/// slot and fails if another task holds it.
pub fn transition(
    conn: &Connection,
    task_id: TaskId,
    next: MergeState,
    now: DateTime<Utc>,
) -> Result<MergeQueueEntry> {
    let entry = require(conn, task_id)?;
    if !entry.state.can_transition_to(next) {
        return Err(Error::transition(
            format!("merge entry {}", task_id),
            entry.state,
            next,
        ));
    }
    if next.is_active() {
        if let Some(holder) = active(conn)? {
            if holder.task_id != task_id {
                return Err(Error::Validation(format!(
                    "merge slot held by task {} ({})",
                    holder.task_id, holder.state
                )));
            }
        }
    }
    conn.execute(
        "UPDATE merge_queue SET state = ?2, updated_at = ?3 WHERE task_id = ?1",
        params![task_id.to_string(), next.as_str(), ts(now)],
    )?;
    require(conn, task_id)
}

pub fn set_conflicts(conn: &Connection, task_id: TaskId, files: &[String]) -> Result<()> {
    conn.execute(
        "UPDATE merge_queue SET conflict_files = ?2 WHERE task_id = ?1",
        params![task_id.to_string(), serde_json::to_string(files)?],
    )?;
    Ok(())
}

pub fn set_result(
    conn: &Connection,
    task_id: TaskId,
    merge_commit: Option<&str>,
    error: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE merge_queue SET merge_commit = COALESCE(?2, merge_commit), error = ?3
         WHERE task_id = ?1",
        params![task_id.to_string(), merge_commit, error],
    )?;
    Ok(())
}

/// Active entries whose last change predates `cutoff`.
pub fn stale_active(conn: &Connection, cutoff: DateTime<Utc>) -> Result<Vec<MergeQueueEntry>> {
    let sql = format!(
        "SELECT {} FROM merge_queue m
         WHERE m.state IN ('dry_run', 'merging') AND m.updated_at < ?1",
        COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![ts(cutoff)], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
