//! Agent identities and instances.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use uuid::Uuid;

use super::TaskId;
use crate::Error;

/// Names accepted for agent types outside the known set.
static AGENT_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_-]{0,63}$").expect("valid agent name regex"));

/// Reserved identity of the central message broker.
pub const BROKER: &str = "broker";

/// Unique identifier for an agent instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for AgentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Agent type: the unit of the singleton constraint and of message routing.
///
/// Known types are enum variants; anything else must be a lowercase
/// identifier and lands in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AgentType {
    Orchestrator,
    Worker,
    Priority,
    Spec,
    Refactor,
    BugFixer,
    Reviewer,
    Other(String),
}

impl AgentType {
    pub fn as_str(&self) -> &str {
        match self {
            AgentType::Orchestrator => "orchestrator",
            AgentType::Worker => "worker",
            AgentType::Priority => "priority",
            AgentType::Spec => "spec",
            AgentType::Refactor => "refactor",
            AgentType::BugFixer => "bug-fixer",
            AgentType::Reviewer => "reviewer",
            AgentType::Other(name) => name,
        }
    }

    /// Whether processes of this type are spawned by the lifecycle manager.
    pub fn is_spawnable(&self) -> bool {
        !matches!(self, AgentType::Orchestrator)
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentType {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let name = s.trim();
        Ok(match name {
            "orchestrator" => AgentType::Orchestrator,
            "worker" => AgentType::Worker,
            "priority" => AgentType::Priority,
            "spec" => AgentType::Spec,
            "refactor" => AgentType::Refactor,
            "bug-fixer" => AgentType::BugFixer,
            "reviewer" => AgentType::Reviewer,
            BROKER => {
                return Err(Error::InvalidPayload(format!(
                    "'{}' is reserved for the message broker",
                    BROKER
                )))
            }
            other if AGENT_NAME_RE.is_match(other) => AgentType::Other(other.to_string()),
            other => {
                return Err(Error::InvalidPayload(format!(
                    "invalid agent type '{}'",
                    other
                )))
            }
        })
    }
}

impl TryFrom<String> for AgentType {
    type Error = Error;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AgentType> for String {
    fn from(value: AgentType) -> Self {
        value.as_str().to_string()
    }
}

/// Status of an agent instance.
///
/// `spawned | running | stalled` are non-terminal and hold the singleton
/// slot for their agent type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Spawned,
    Running,
    Stalled,
    Crashed,
    Completed,
}

string_enum!(AgentStatus {
    Spawned => "spawned",
    Running => "running",
    Stalled => "stalled",
    Crashed => "crashed",
    Completed => "completed",
});

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStatus::Crashed | AgentStatus::Completed)
    }

    /// `* → spawned` re-arms an instance for a backoff respawn.
    pub fn can_transition_to(&self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        match (self, next) {
            (Crashed | Completed, _) => false,
            (_, Crashed | Completed | Spawned) => true,
            (Spawned | Stalled, Running) => true,
            (Running, Stalled) => true,
            _ => false,
        }
    }
}

/// A worker process as recorded in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInstance {
    pub id: AgentId,
    pub agent_type: AgentType,
    pub task_id: TaskId,
    /// None while the process is being (re)launched.
    pub pid: Option<u32>,
    pub status: AgentStatus,
    pub restart_count: u32,
    pub spawned_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Set while waiting out a respawn backoff.
    pub respawn_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
}

impl AgentInstance {
    /// Time since the last sign of life (heartbeat, or spawn if none yet).
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.last_heartbeat.unwrap_or(self.spawned_at))
    }

    pub fn awaiting_respawn(&self) -> bool {
        self.respawn_at.is_some() && self.pid.is_none()
    }
}
