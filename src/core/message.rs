//! Message envelopes exchanged over the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::agent::BROKER;
use super::AgentType;
use crate::Error;

/// Highest message priority.
pub const PRIORITY_HIGHEST: u8 = 1;
/// Lowest message priority.
pub const PRIORITY_LOWEST: u8 = 9;
pub const PRIORITY_DEFAULT: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Where a message is addressed: the broker, or a concrete agent type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Recipient {
    Broker,
    Agent(AgentType),
}

impl Recipient {
    pub fn as_str(&self) -> &str {
        match self {
            Recipient::Broker => BROKER,
            Recipient::Agent(agent) => agent.as_str(),
        }
    }
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Recipient {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.trim() == BROKER {
            Ok(Recipient::Broker)
        } else {
            Ok(Recipient::Agent(s.parse()?))
        }
    }
}

impl TryFrom<String> for Recipient {
    type Error = Error;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Recipient> for String {
    fn from(value: Recipient) -> Self {
        value.as_str().to_string()
    }
}

impl From<AgentType> for Recipient {
    fn from(value: AgentType) -> Self {
        Recipient::Agent(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Started,
    Completed,
    Failed,
}

string_enum!(MessageStatus {
    Pending => "pending",
    Started => "started",
    Completed => "completed",
    Failed => "failed",
});

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Completed | MessageStatus::Failed)
    }
}

/// A message as persisted by the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    /// Store-assigned, strictly increasing. Delivery order.
    pub seq: i64,
    pub sender: String,
    pub recipient: Recipient,
    pub suggested_recipient: Option<AgentType>,
    pub kind: String,
    pub payload: serde_json::Value,
    pub priority: u8,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

/// Input for `MessageBus::send`.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender: String,
    pub recipient: Recipient,
    pub suggested_recipient: Option<AgentType>,
    pub kind: String,
    pub payload: serde_json::Value,
    pub priority: u8,
}

impl NewMessage {
    pub fn new(sender: impl Into<String>, recipient: Recipient, kind: &str) -> Self {
        Self {
            sender: sender.into(),
            recipient,
            suggested_recipient: None,
            kind: kind.to_string(),
            payload: serde_json::Value::Object(Default::default()),
            priority: PRIORITY_DEFAULT,
        }
    }

    /// A broker-addressed message with its routing hint.
    pub fn via_broker(sender: impl Into<String>, suggested: AgentType, kind: &str) -> Self {
        Self::new(sender, Recipient::Broker, kind).suggest(suggested)
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn suggest(mut self, agent: AgentType) -> Self {
        self.suggested_recipient = Some(agent);
        self
    }

    /// Contract checks performed at send time.
    pub fn validate(&self) -> crate::Result<()> {
        if self.sender.trim().is_empty() {
            return Err(Error::InvalidPayload("sender must not be empty".to_string()));
        }
        if self.kind.trim().is_empty() {
            return Err(Error::InvalidPayload("kind must not be empty".to_string()));
        }
        if !(PRIORITY_HIGHEST..=PRIORITY_LOWEST).contains(&self.priority) {
            return Err(Error::InvalidPayload(format!(
                "priority {} outside {}..={}",
                self.priority, PRIORITY_HIGHEST, PRIORITY_LOWEST
            )));
        }
        if self.recipient == Recipient::Broker && self.suggested_recipient.is_none() {
            return Err(Error::InvalidPayload(
                "broker-routed message requires a suggested recipient".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_recipient_parse() {
        assert_eq!("broker".parse::<Recipient>().unwrap(), Recipient::Broker);
        assert_eq!(
            "worker".parse::<Recipient>().unwrap(),
            Recipient::Agent(AgentType::Worker)
        );
        assert!("NOT VALID".parse::<Recipient>().is_err());
        assert_eq!(Recipient::Broker.to_string(), "broker");
    }

    #[test]
    fn test_broker_message_requires_suggestion() {
        let msg = NewMessage::new("worker", Recipient::Broker, "review_request");
        assert!(matches!(msg.validate(), Err(Error::InvalidPayload(_))));

        let msg = NewMessage::via_broker("worker", AgentType::Reviewer, "review_request");
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn test_priority_bounds() {
        let base = NewMessage::new("a", Recipient::Agent(AgentType::Worker), "k");
        assert!(base.clone().priority(0).validate().is_err());
        assert!(base.clone().priority(1).validate().is_ok());
        assert!(base.clone().priority(9).validate().is_ok());
        assert!(base.priority(10).validate().is_err());
    }

    #[test]
    fn test_empty_sender_or_kind_rejected() {
        let msg = NewMessage::new(" ", Recipient::Agent(AgentType::Worker), "k");
        assert!(msg.validate().is_err());
        let msg = NewMessage::new("a", Recipient::Agent(AgentType::Worker), "");
        assert!(msg.validate().is_err());
    }

    #[test]
    fn test_builder_sets_payload() {
        let msg = NewMessage::new("a", AgentType::Spec.into(), "task_completed")
            .payload(json!({"task_id": "t1"}))
            .priority(2);
        assert_eq!(msg.payload["task_id"], "t1");
        assert_eq!(msg.priority, 2);
        assert_eq!(msg.recipient, Recipient::Agent(AgentType::Spec));
    }
}
