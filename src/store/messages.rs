//! `message` table access.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{col_json, col_opt_parse, col_opt_ts, col_parse, col_ts, ts};
use crate::core::{Message, MessageId, MessageStatus, NewMessage, Recipient};
use crate::{Error, Result};

const COLUMNS: &str = "id, seq, sender, recipient, suggested_recipient, kind, payload, priority, \
     status, created_at, started_at, completed_at, duration_ms, error";

fn from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: col_parse(row, 0)?,
        seq: row.get(1)?,
        sender: row.get(2)?,
        recipient: col_parse(row, 3)?,
        suggested_recipient: col_opt_parse(row, 4)?,
        kind: row.get(5)?,
        payload: col_json(row, 6)?,
        priority: row.get(7)?,
        status: col_parse(row, 8)?,
        created_at: col_ts(row, 9)?,
        started_at: col_opt_ts(row, 10)?,
        completed_at: col_opt_ts(row, 11)?,
        duration_ms: row.get::<_, Option<i64>>(12)?.map(|ms| ms.max(0) as u64),
        error: row.get(13)?,
    })
}

/// Appends a validated message in `pending`.
pub fn insert(conn: &Connection, new: &NewMessage, now: DateTime<Utc>) -> Result<Message> {
    new.validate()?;
    let id = MessageId::new();
    conn.execute(
        "INSERT INTO message (id, sender, recipient, suggested_recipient, kind, payload,
             priority, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8)",
        params![
            id.to_string(),
            new.sender,
            new.recipient.as_str(),
            new.suggested_recipient.as_ref().map(|a| a.as_str()),
            new.kind,
            serde_json::to_string(&new.payload)?,
            new.priority,
            ts(now),
        ],
    )?;
    require(conn, id)
}

pub fn get(conn: &Connection, id: MessageId) -> Result<Option<Message>> {
    let sql = format!("SELECT {} FROM message WHERE id = ?1", COLUMNS);
    Ok(conn
        .query_row(&sql, params![id.to_string()], from_row)
        .optional()?)
}

pub fn require(conn: &Connection, id: MessageId) -> Result<Message> {
    get(conn, id)?.ok_or_else(|| Error::NotFound(format!("message {}", id)))
}

/// Oldest-first pending messages for `recipient`, each moved to `started`.
///
/// Must run inside an immediate transaction so no other poller can claim the
/// same rows between the read and the update.
pub fn claim_pending(
    conn: &Connection,
    recipient: &Recipient,
    kind: Option<&str>,
    limit: usize,
    now: DateTime<Utc>,
) -> Result<Vec<Message>> {
    let sql = format!(
        "SELECT {} FROM message
         WHERE recipient = ?1 AND status = 'pending' AND (?2 IS NULL OR kind = ?2)
         ORDER BY seq
         LIMIT ?3",
        COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![recipient.as_str(), kind, limit as i64],
        from_row,
    )?;
    let mut messages = rows.collect::<rusqlite::Result<Vec<_>>>()?;

    let started = ts(now);
    for msg in &mut messages {
        conn.execute(
            "UPDATE message SET status = 'started', started_at = ?2 WHERE id = ?1",
            params![msg.id.to_string(), started],
        )?;
        msg.status = MessageStatus::Started;
        msg.started_at = Some(now);
    }
    Ok(messages)
}

/// Terminalizes a message. A message may be finalized exactly once.
pub fn finish(
    conn: &Connection,
    id: MessageId,
    status: MessageStatus,
    duration_ms: Option<u64>,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Message> {
    debug_assert!(status.is_terminal());
    let msg = require(conn, id)?;
    if msg.status.is_terminal() {
        return Err(Error::transition(format!("message {}", id), msg.status, status));
    }
    conn.execute(
        "UPDATE message SET status = ?2, completed_at = ?3, duration_ms = ?4, error = ?5
         WHERE id = ?1",
        params![
            id.to_string(),
            status.as_str(),
            ts(now),
            duration_ms.map(|ms| ms as i64),
            error
        ],
    )?;
    require(conn, id)
}

/// Fails a pending broker row without decoding it. The row may carry a
/// routing hint or payload that no longer parses.
pub fn fail_unroutable(
    conn: &Connection,
    id: MessageId,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let changed = conn.execute(
        "UPDATE message SET status = 'failed', completed_at = ?2, error = ?3
         WHERE id = ?1 AND status = 'pending'",
        params![id.to_string(), ts(now), reason],
    )?;
    if changed == 0 {
        return Err(Error::NotFound(format!("pending message {}", id)));
    }
    Ok(())
}

pub fn pending_count(conn: &Connection, recipient: &Recipient) -> Result<u32> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM message WHERE recipient = ?1 AND status = 'pending'",
        params![recipient.as_str()],
        |row| row.get(0),
    )?)
}

/// A broker-addressed row as stored, before its routing hint is trusted.
#[derive(Debug, Clone)]
pub struct BrokerRow {
    pub id: MessageId,
    pub suggested_recipient: Option<String>,
}

/// Oldest-first pending broker messages, reading the hint as raw text.
pub fn pending_broker(conn: &Connection, limit: usize) -> Result<Vec<BrokerRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, suggested_recipient FROM message
         WHERE recipient = 'broker' AND status = 'pending'
         ORDER BY seq
         LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], |row| {
        Ok(BrokerRow {
            id: col_parse(row, 0)?,
            suggested_recipient: row.get(1)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Raw payload and envelope fields of a message, for forwarding.
pub fn envelope(conn: &Connection, id: MessageId) -> Result<(String, String, String, u8)> {
    Ok(conn.query_row(
        "SELECT sender, kind, payload, priority FROM message WHERE id = ?1",
        params![id.to_string()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
    )?)
}

pub fn count_by_status(conn: &Connection, status: MessageStatus) -> Result<u32> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM message WHERE status = ?1",
        params![status.as_str()],
        |row| row.get(0),
    )?)
}
