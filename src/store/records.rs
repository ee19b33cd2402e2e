//! Append-only diagnostics: crash records, health checks, bug records, alerts,
//! and the control loop's tick marker.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{col_json, col_opt_parse, col_parse, col_ts, ts};
use crate::core::{Alert, AlertLevel, BugRecord, CrashRecord, HealthCheck, TaskId};
use crate::Result;

const CRASH_COLUMNS: &str = "id, agent_instance_id, task_id, error_type, error_message, \
     stack_trace, signature, restart_count, respawned, bug_reported, created_at";

fn crash_from_row(row: &Row<'_>) -> rusqlite::Result<CrashRecord> {
    Ok(CrashRecord {
        id: row.get(0)?,
        agent_instance_id: col_parse(row, 1)?,
        task_id: col_parse(row, 2)?,
        error_type: col_parse(row, 3)?,
        error_message: row.get(4)?,
        stack_trace: row.get(5)?,
        signature: row.get(6)?,
        restart_count: row.get(7)?,
        respawned: row.get(8)?,
        bug_reported: row.get(9)?,
        created_at: col_ts(row, 10)?,
    })
}

/// Appends a crash record; `record.id` is ignored and assigned by the store.
pub fn insert_crash(conn: &Connection, record: &CrashRecord) -> Result<CrashRecord> {
    conn.execute(
        "INSERT INTO crash_record (agent_instance_id, task_id, error_type, error_message,
             stack_trace, signature, restart_count, respawned, bug_reported, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            record.agent_instance_id.to_string(),
            record.task_id.to_string(),
            record.error_type.as_str(),
            record.error_message,
            record.stack_trace,
            record.signature,
            record.restart_count,
            record.respawned,
            record.bug_reported,
            ts(record.created_at),
        ],
    )?;
    Ok(CrashRecord {
        id: conn.last_insert_rowid(),
        ..record.clone()
    })
}

pub fn signature_seen(conn: &Connection, signature: &str) -> Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM crash_record WHERE signature = ?1 LIMIT 1",
            params![signature],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

pub fn crashes_for_task(conn: &Connection, task_id: TaskId) -> Result<Vec<CrashRecord>> {
    let sql = format!(
        "SELECT {} FROM crash_record WHERE task_id = ?1 ORDER BY id",
        CRASH_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![task_id.to_string()], crash_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Most recent crashes first.
pub fn recent_crashes(conn: &Connection, limit: usize) -> Result<Vec<CrashRecord>> {
    let sql = format!(
        "SELECT {} FROM crash_record ORDER BY id DESC LIMIT ?1",
        CRASH_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![limit as i64], crash_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn insert_health_check(conn: &Connection, check: &HealthCheck) -> Result<HealthCheck> {
    conn.execute(
        "INSERT INTO health_check (timestamp, status, active_agents, crashed_agents,
             last_tick_age_seconds, actions_taken)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            ts(check.timestamp),
            check.status.as_str(),
            check.active_agents,
            check.crashed_agents,
            check.last_tick_age_seconds,
            serde_json::to_string(&check.actions_taken)?,
        ],
    )?;
    Ok(HealthCheck {
        id: conn.last_insert_rowid(),
        ..check.clone()
    })
}

pub fn recent_health_checks(conn: &Connection, limit: usize) -> Result<Vec<HealthCheck>> {
    let mut stmt = conn.prepare(
        "SELECT id, timestamp, status, active_agents, crashed_agents, last_tick_age_seconds,
             actions_taken
         FROM health_check ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], |row| {
        Ok(HealthCheck {
            id: row.get(0)?,
            timestamp: col_ts(row, 1)?,
            status: col_parse(row, 2)?,
            active_agents: row.get(3)?,
            crashed_agents: row.get(4)?,
            last_tick_age_seconds: row.get(5)?,
            actions_taken: col_json(row, 6)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

const BUG_COLUMNS: &str = "id, task_id, agent_instance_id, error_type, signature, root_cause, \
     stack_trace, assigned_agent, created_at";

fn bug_from_row(row: &Row<'_>) -> rusqlite::Result<BugRecord> {
    Ok(BugRecord {
        id: row.get(0)?,
        task_id: col_parse(row, 1)?,
        agent_instance_id: col_opt_parse(row, 2)?,
        error_type: col_parse(row, 3)?,
        signature: row.get(4)?,
        root_cause: row.get(5)?,
        stack_trace: row.get(6)?,
        assigned_agent: col_parse(row, 7)?,
        created_at: col_ts(row, 8)?,
    })
}

pub fn insert_bug(conn: &Connection, bug: &BugRecord) -> Result<BugRecord> {
    conn.execute(
        "INSERT INTO bug_record (task_id, agent_instance_id, error_type, signature, root_cause,
             stack_trace, assigned_agent, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            bug.task_id.to_string(),
            bug.agent_instance_id.map(|id| id.to_string()),
            bug.error_type.as_str(),
            bug.signature,
            bug.root_cause,
            bug.stack_trace,
            bug.assigned_agent.as_str(),
            ts(bug.created_at),
        ],
    )?;
    Ok(BugRecord {
        id: conn.last_insert_rowid(),
        ..bug.clone()
    })
}

pub fn bugs_for_task(conn: &Connection, task_id: TaskId) -> Result<Vec<BugRecord>> {
    let sql = format!(
        "SELECT {} FROM bug_record WHERE task_id = ?1 ORDER BY id",
        BUG_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![task_id.to_string()], bug_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn recent_bugs(conn: &Connection, limit: usize) -> Result<Vec<BugRecord>> {
    let sql = format!("SELECT {} FROM bug_record ORDER BY id DESC LIMIT ?1", BUG_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![limit as i64], bug_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn insert_alert(
    conn: &Connection,
    level: AlertLevel,
    message: &str,
    now: DateTime<Utc>,
) -> Result<Alert> {
    conn.execute(
        "INSERT INTO alert (level, message, created_at) VALUES (?1, ?2, ?3)",
        params![level.as_str(), message, ts(now)],
    )?;
    Ok(Alert {
        id: conn.last_insert_rowid(),
        level,
        message: message.to_string(),
        created_at: now,
    })
}

pub fn recent_alerts(conn: &Connection, limit: usize) -> Result<Vec<Alert>> {
    let mut stmt =
        conn.prepare("SELECT id, level, message, created_at FROM alert ORDER BY id DESC LIMIT ?1")?;
    let rows = stmt.query_map(params![limit as i64], |row| {
        Ok(Alert {
            id: row.get(0)?,
            level: col_parse(row, 1)?,
            message: row.get(2)?,
            created_at: col_ts(row, 3)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Marks a control loop tick for `instance_id`.
pub fn record_tick(conn: &Connection, instance_id: &str, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO orchestrator_tick (instance_id, started_at, last_tick) VALUES (?1, ?2, ?2)
         ON CONFLICT(instance_id) DO UPDATE SET last_tick = excluded.last_tick",
        params![instance_id, ts(now)],
    )?;
    Ok(())
}

/// Most recent tick across all control loop instances.
pub fn last_tick(conn: &Connection) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> =
        conn.query_row("SELECT MAX(last_tick) FROM orchestrator_tick", [], |row| {
            row.get(0)
        })?;
    match raw {
        Some(raw) => Ok(Some(
            DateTime::parse_from_rfc3339(&raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| crate::Error::Validation(format!("bad tick timestamp: {}", e)))?,
        )),
        None => Ok(None),
    }
}
