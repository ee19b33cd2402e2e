//! Task data model.
//!
//! Tasks are the units of work handed to agents. Each task is bound to
//! exactly one agent type, gets its own worktree and branch, and carries a
//! store-assigned creation order that fixes its place in the merge queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use super::AgentType;

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// What kind of roadmap item produced the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Priority,
    Spec,
    Refactor,
}

string_enum!(TaskKind {
    Priority => "priority",
    Spec => "spec",
    Refactor => "refactor",
});

impl TaskKind {
    /// Agent type that handles this kind of task unless told otherwise.
    pub fn default_agent(&self) -> AgentType {
        match self {
            TaskKind::Priority => AgentType::Priority,
            TaskKind::Spec => AgentType::Spec,
            TaskKind::Refactor => AgentType::Refactor,
        }
    }
}

/// Task status in its lifecycle.
///
/// `pending → spawned → running → completed → merged | failed`. A spawn that
/// fails transiently returns the task to `pending`; a respawn after a crash
/// moves it back to `spawned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Spawned,
    Running,
    Completed,
    Merged,
    Failed,
}

string_enum!(TaskStatus {
    Pending => "pending",
    Spawned => "spawned",
    Running => "running",
    Completed => "completed",
    Merged => "merged",
    Failed => "failed",
});

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Merged | TaskStatus::Failed)
    }

    /// A worker is (or is about to be) attached to the task.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Spawned | TaskStatus::Running)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (_, Failed) => !self.is_terminal(),
            (Pending, Spawned) => true,
            (Spawned, Running | Pending | Completed | Spawned) => true,
            (Running, Completed | Spawned) => true,
            (Completed, Merged) => true,
            _ => false,
        }
    }
}

/// A task as persisted in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub title: String,
    pub status: TaskStatus,
    pub agent_type: AgentType,
    pub worktree_path: Option<PathBuf>,
    pub branch_name: Option<String>,
    /// Monotonic, assigned by the store. Merge ordering key.
    pub creation_order: i64,
    pub spawn_attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Eligible for a spawn attempt at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending
            && self.next_attempt_at.map(|at| at <= now).unwrap_or(true)
    }
}

/// Input for creating a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: TaskId,
    pub kind: TaskKind,
    pub title: String,
    pub agent_type: AgentType,
}

impl NewTask {
    pub fn new(kind: TaskKind, title: &str) -> Self {
        Self {
            id: TaskId::new(),
            kind,
            title: title.to_string(),
            agent_type: kind.default_agent(),
        }
    }

    pub fn with_agent(mut self, agent_type: AgentType) -> Self {
        self.agent_type = agent_type;
        self
    }
}
