//! Failure escalation ladder.
//!
//! Level 1 respawns a crashed agent with exponential backoff. Level 2 files a
//! bug record for the remediation agent, either because the same task keeps
//! crashing or because the crash signature has never been seen before.
//! Level 3 is an orchestrator emergency and is driven by the health monitor.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::classifier::Classification;
use crate::core::{AgentId, AgentType, BugRecord, ErrorType, TaskId};

/// Longest backoff ever scheduled, whatever the restart count.
const MAX_BACKOFF: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EscalationLevel {
    Respawn = 1,
    Report = 2,
    Emergency = 3,
}

/// What to do about one crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashDecision {
    /// Restart count after counting this crash.
    pub restart_count: u32,
    pub respawn: bool,
    pub report: bool,
}

impl CrashDecision {
    pub fn decide(previous_restarts: u32, max_restarts: u32, new_signature: bool) -> Self {
        let restart_count = previous_restarts.saturating_add(1);
        let respawn = restart_count < max_restarts;
        Self {
            restart_count,
            respawn,
            report: !respawn || new_signature,
        }
    }

    pub fn level(&self) -> EscalationLevel {
        if self.report {
            EscalationLevel::Report
        } else {
            EscalationLevel::Respawn
        }
    }
}

/// `base * 2^(attempt - 1)`: 2s, 4s, 8s for the default base.
pub fn backoff(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(MAX_BACKOFF)
}

pub fn backoff_until(now: DateTime<Utc>, base: Duration, attempt: u32) -> DateTime<Utc> {
    let delay = chrono::Duration::from_std(backoff(base, attempt))
        .unwrap_or_else(|_| chrono::Duration::seconds(MAX_BACKOFF.as_secs() as i64));
    now + delay
}

/// Bug record for a classified crash, before the store assigns its id.
pub fn bug_report(
    task_id: TaskId,
    agent_id: Option<AgentId>,
    classification: &Classification,
    assigned_agent: &AgentType,
    now: DateTime<Utc>,
) -> BugRecord {
    BugRecord {
        id: 0,
        task_id,
        agent_instance_id: agent_id,
        error_type: classification.error_type,
        signature: classification.signature.clone(),
        root_cause: classification.message.clone(),
        stack_trace: classification.stack_trace.clone(),
        assigned_agent: assigned_agent.clone(),
        created_at: now,
    }
}

/// Bug record for a task that could not be spawned at all.
pub fn spawn_failure_report(
    task_id: TaskId,
    reason: &str,
    assigned_agent: &AgentType,
    now: DateTime<Utc>,
) -> BugRecord {
    let classification = Classification::observed(ErrorType::SpawnFailure, reason);
    bug_report(task_id, None, &classification, assigned_agent, now)
}
