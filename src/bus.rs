//! Durable message bus over the store.
//!
//! Delivery is at-least-once: `poll` claims messages by moving them to
//! `started`, and consumers finalize each with `mark_completed` or
//! `mark_failed`. Messages addressed to the broker are forwarded to their
//! suggested recipient by `route_broker_messages`.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::core::{
    AgentType, Message, MessageId, MessageStatus, NewMessage, Recipient,
};
use crate::store::messages::{self, BrokerRow};
use crate::store::Store;
use crate::{Error, Result};

/// Outcome of one broker routing pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RouteReport {
    pub routed: usize,
    pub failed: usize,
}

#[derive(Clone, Debug)]
pub struct MessageBus {
    store: Store,
}

impl MessageBus {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn send(&self, message: NewMessage) -> Result<Message> {
        let sent = self
            .store
            .with_tx(|tx| messages::insert(tx, &message, Utc::now()))?;
        debug!(
            id = %sent.id,
            seq = sent.seq,
            sender = %sent.sender,
            recipient = %sent.recipient,
            kind = %sent.kind,
            "message sent"
        );
        Ok(sent)
    }

    /// Claims up to `limit` pending messages for `recipient`, oldest first.
    pub fn poll(
        &self,
        recipient: &Recipient,
        kind: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let claimed = self
            .store
            .with_tx(|tx| messages::claim_pending(tx, recipient, kind, limit, Utc::now()))?;
        if !claimed.is_empty() {
            debug!(recipient = %recipient, count = claimed.len(), "messages claimed");
        }
        Ok(claimed)
    }

    pub fn mark_completed(&self, id: MessageId, duration_ms: u64) -> Result<Message> {
        self.store.with_tx(|tx| {
            messages::finish(
                tx,
                id,
                MessageStatus::Completed,
                Some(duration_ms),
                None,
                Utc::now(),
            )
        })
    }

    pub fn mark_failed(&self, id: MessageId, error: &str) -> Result<Message> {
        self.store.with_tx(|tx| {
            messages::finish(tx, id, MessageStatus::Failed, None, Some(error), Utc::now())
        })
    }

    pub fn get(&self, id: MessageId) -> Result<Message> {
        self.store.read(|conn| messages::require(conn, id))
    }

    pub fn pending_count(&self, recipient: &Recipient) -> Result<u32> {
        self.store.read(|conn| messages::pending_count(conn, recipient))
    }

    /// Forwards pending broker messages to their suggested recipients.
    ///
    /// Each forwarded message is re-sent as a fresh pending message with the
    /// same sender, kind, payload and priority; the broker copy completes.
    /// A message that cannot be forwarded (unknown hint, unreadable payload,
    /// envelope that fails validation) fails on its own and the rest of the
    /// batch still routes.
    pub fn route_broker_messages(&self, limit: usize) -> Result<RouteReport> {
        self.store.with_tx(|tx| {
            let now = Utc::now();
            let mut report = RouteReport::default();

            for row in messages::pending_broker(tx, limit)? {
                match forward(tx, &row, now) {
                    Ok(forwarded) => {
                        messages::finish(tx, row.id, MessageStatus::Completed, Some(0), None, now)?;
                        debug!(from = %row.id, to = %forwarded.id, agent = %forwarded.recipient, "broker routed message");
                        report.routed += 1;
                    }
                    Err(e) => {
                        let reason = format!("unroutable: {}", e);
                        messages::fail_unroutable(tx, row.id, &reason, now)?;
                        warn!(id = %row.id, error = %e, "broker could not route message");
                        report.failed += 1;
                    }
                }
            }
            Ok(report)
        })
    }
}

fn forward(tx: &Connection, row: &BrokerRow, now: DateTime<Utc>) -> Result<Message> {
    let agent = row
        .suggested_recipient
        .as_deref()
        .ok_or_else(|| Error::InvalidPayload("missing suggested recipient".into()))?
        .parse::<AgentType>()?;
    let (sender, kind, payload, priority) = messages::envelope(tx, row.id)?;
    let message = NewMessage::new(sender, Recipient::Agent(agent), &kind)
        .payload(serde_json::from_str(&payload)?)
        .priority(priority);
    messages::insert(tx, &message, now)
}
