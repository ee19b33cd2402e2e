//! Append-only diagnostic records: crashes, health checks, bugs, alerts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AgentId, AgentType, TaskId};

/// Classification of an agent failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    ImportError,
    Timeout,
    RuntimeError,
    StartupTimeout,
    HeartbeatTimeout,
    SpawnFailure,
    Unknown,
}

string_enum!(ErrorType {
    ImportError => "import_error",
    Timeout => "timeout",
    RuntimeError => "runtime_error",
    StartupTimeout => "startup_timeout",
    HeartbeatTimeout => "heartbeat_timeout",
    SpawnFailure => "spawn_failure",
    Unknown => "unknown",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashRecord {
    pub id: i64,
    pub agent_instance_id: AgentId,
    pub task_id: TaskId,
    pub error_type: ErrorType,
    pub error_message: String,
    pub stack_trace: Option<String>,
    /// Normalized error fingerprint; a new one triggers a bug report.
    pub signature: String,
    /// Restart count after this crash was counted.
    pub restart_count: u32,
    pub respawned: bool,
    pub bug_reported: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

string_enum!(HealthStatus {
    Healthy => "healthy",
    Degraded => "degraded",
    Critical => "critical",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub status: HealthStatus,
    pub active_agents: u32,
    pub crashed_agents: u32,
    /// None when the control loop has never ticked.
    pub last_tick_age_seconds: Option<i64>,
    pub actions_taken: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BugRecord {
    pub id: i64,
    pub task_id: TaskId,
    pub agent_instance_id: Option<AgentId>,
    pub error_type: ErrorType,
    pub signature: String,
    pub root_cause: String,
    pub stack_trace: Option<String>,
    pub assigned_agent: AgentType,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Warning,
    Critical,
}

string_enum!(AlertLevel {
    Warning => "warning",
    Critical => "critical",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub level: AlertLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}
