//! `agent_instance` table access and the singleton check-and-set.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{col_opt_ts, col_parse, col_ts, is_constraint_violation, opt_ts, ts};
use crate::core::{AgentId, AgentInstance, AgentStatus, AgentType, TaskId};
use crate::{Error, Result};

const COLUMNS: &str = "id, agent_type, task_id, pid, status, restart_count, spawned_at, \
     last_heartbeat, respawn_at, exit_code";

const NON_TERMINAL: &str = "('spawned', 'running', 'stalled')";

fn from_row(row: &Row<'_>) -> rusqlite::Result<AgentInstance> {
    Ok(AgentInstance {
        id: col_parse(row, 0)?,
        agent_type: col_parse(row, 1)?,
        task_id: col_parse(row, 2)?,
        pid: row.get(3)?,
        status: col_parse(row, 4)?,
        restart_count: row.get(5)?,
        spawned_at: col_ts(row, 6)?,
        last_heartbeat: col_opt_ts(row, 7)?,
        respawn_at: col_opt_ts(row, 8)?,
        exit_code: row.get(9)?,
    })
}

fn query(conn: &Connection, filter: &str, args: impl rusqlite::Params) -> Result<Vec<AgentInstance>> {
    let sql = format!(
        "SELECT {} FROM agent_instance {} ORDER BY spawned_at, id",
        COLUMNS, filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(args, from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// The instance currently holding the singleton slot for `agent_type`.
pub fn active_for_type(conn: &Connection, agent_type: &AgentType) -> Result<Option<AgentInstance>> {
    let sql = format!(
        "SELECT {} FROM agent_instance WHERE agent_type = ?1 AND status IN {}",
        COLUMNS, NON_TERMINAL
    );
    Ok(conn
        .query_row(&sql, params![agent_type.as_str()], from_row)
        .optional()?)
}

/// Claims the singleton slot for `agent_type` with a fresh `spawned` instance.
///
/// Must run inside an immediate transaction; the partial unique index backs
/// the check if another writer slipped in regardless.
pub fn claim(
    conn: &Connection,
    agent_type: &AgentType,
    task_id: TaskId,
    now: DateTime<Utc>,
) -> Result<AgentInstance> {
    if let Some(existing) = active_for_type(conn, agent_type)? {
        return Err(Error::SingletonViolation {
            agent_type: agent_type.to_string(),
            agent_id: existing.id.to_string(),
        });
    }

    let id = AgentId::new();
    let inserted = conn.execute(
        "INSERT INTO agent_instance (id, agent_type, task_id, status, restart_count, spawned_at)
         VALUES (?1, ?2, ?3, 'spawned', 0, ?4)",
        params![id.to_string(), agent_type.as_str(), task_id.to_string(), ts(now)],
    );
    match inserted {
        Ok(_) => require(conn, id),
        Err(e) if is_constraint_violation(&e) => Err(Error::SingletonViolation {
            agent_type: agent_type.to_string(),
            agent_id: "unknown".to_string(),
        }),
        Err(e) => Err(e.into()),
    }
}

pub fn get(conn: &Connection, id: AgentId) -> Result<Option<AgentInstance>> {
    let sql = format!("SELECT {} FROM agent_instance WHERE id = ?1", COLUMNS);
    Ok(conn
        .query_row(&sql, params![id.to_string()], from_row)
        .optional()?)
}

pub fn require(conn: &Connection, id: AgentId) -> Result<AgentInstance> {
    get(conn, id)?.ok_or_else(|| Error::NotFound(format!("agent instance {}", id)))
}

pub fn list(conn: &Connection) -> Result<Vec<AgentInstance>> {
    query(conn, "", [])
}

/// Instances holding a singleton slot.
pub fn non_terminal(conn: &Connection) -> Result<Vec<AgentInstance>> {
    query(conn, &format!("WHERE status IN {}", NON_TERMINAL), [])
}

pub fn for_task(conn: &Connection, task_id: TaskId) -> Result<Vec<AgentInstance>> {
    query(conn, "WHERE task_id = ?1", params![task_id.to_string()])
}

/// Instances parked in respawn backoff whose relaunch time has come.
pub fn due_respawns(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<AgentInstance>> {
    query(
        conn,
        "WHERE status = 'spawned' AND pid IS NULL AND respawn_at IS NOT NULL AND respawn_at <= ?1",
        params![ts(now)],
    )
}

/// Validated status change; terminal statuses record the exit code.
pub fn set_status(
    conn: &Connection,
    id: AgentId,
    next: AgentStatus,
    exit_code: Option<i32>,
) -> Result<AgentInstance> {
    let instance = require(conn, id)?;
    if !instance.status.can_transition_to(next) {
        return Err(Error::transition(
            format!("agent {}", id),
            instance.status,
            next,
        ));
    }
    conn.execute(
        "UPDATE agent_instance SET status = ?2, exit_code = COALESCE(?3, exit_code),
             respawn_at = CASE WHEN ?2 IN ('crashed', 'completed') THEN NULL ELSE respawn_at END
         WHERE id = ?1",
        params![id.to_string(), next.as_str(), exit_code],
    )?;
    require(conn, id)
}

/// Records the pid of a freshly launched process.
pub fn set_launched(conn: &Connection, id: AgentId, pid: u32, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE agent_instance SET pid = ?2, spawned_at = ?3, respawn_at = NULL,
             last_heartbeat = NULL, exit_code = NULL
         WHERE id = ?1",
        params![id.to_string(), pid, ts(now)],
    )?;
    Ok(())
}

/// Startup acknowledgment: `spawned → running`.
pub fn acknowledge(conn: &Connection, id: AgentId, now: DateTime<Utc>) -> Result<AgentInstance> {
    set_status(conn, id, AgentStatus::Running, None)?;
    conn.execute(
        "UPDATE agent_instance SET last_heartbeat = ?2 WHERE id = ?1",
        params![id.to_string(), ts(now)],
    )?;
    require(conn, id)
}

/// Refreshes liveness. A heartbeat revives a stalled instance; a terminal one
/// cannot be revived.
pub fn heartbeat(conn: &Connection, id: AgentId, now: DateTime<Utc>) -> Result<AgentInstance> {
    let instance = require(conn, id)?;
    match instance.status {
        AgentStatus::Spawned | AgentStatus::Stalled => {
            set_status(conn, id, AgentStatus::Running, None)?;
        }
        AgentStatus::Running => {}
        status => {
            return Err(Error::transition(format!("agent {}", id), status, "heartbeat"));
        }
    }
    conn.execute(
        "UPDATE agent_instance SET last_heartbeat = ?2 WHERE id = ?1",
        params![id.to_string(), ts(now)],
    )?;
    require(conn, id)
}

/// Parks an instance in backoff: keeps its slot, drops its pid.
pub fn schedule_respawn(
    conn: &Connection,
    id: AgentId,
    restart_count: u32,
    respawn_at: DateTime<Utc>,
    exit_code: Option<i32>,
) -> Result<AgentInstance> {
    set_status(conn, id, AgentStatus::Spawned, exit_code)?;
    conn.execute(
        "UPDATE agent_instance SET pid = NULL, restart_count = ?2, respawn_at = ?3,
             last_heartbeat = NULL
         WHERE id = ?1",
        params![id.to_string(), restart_count, opt_ts(Some(respawn_at))],
    )?;
    require(conn, id)
}

pub fn set_restart_count(conn: &Connection, id: AgentId, restart_count: u32) -> Result<()> {
    conn.execute(
        "UPDATE agent_instance SET restart_count = ?2 WHERE id = ?1",
        params![id.to_string(), restart_count],
    )?;
    Ok(())
}

/// Number of instances per status.
pub fn count_by_status(conn: &Connection, status: AgentStatus) -> Result<u32> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM agent_instance WHERE status = ?1",
        params![status.as_str()],
        |row| row.get(0),
    )?)
}
