//! Command surface exposed to workers and operators.
//!
//! Each command returns a JSON object with a `success` flag. Failures carry
//! the error message and its stable `code`.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

use crate::core::{AgentId, AgentStatus, AgentType, MergeStrategy, TaskId};
use crate::orchestration::{LifecycleManager, MergeCoordinator, MergeOutcome};
use crate::{Error, Result};

/// A worker that acknowledged startup.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSession {
    pub agent_id: AgentId,
    pub agent_type: AgentType,
    pub task_id: TaskId,
    pub pid: Option<u32>,
    pub status: AgentStatus,
    pub worktree: Option<PathBuf>,
}

/// Spawns a worker for `task_id` and waits for it to acknowledge startup.
///
/// With a merge coordinator the task's worktree is provisioned first and
/// becomes the worker's working directory.
pub async fn spawn_agent_session(
    lifecycle: &LifecycleManager,
    merges: Option<&MergeCoordinator>,
    agent_type: &AgentType,
    task_id: TaskId,
    timeout: Option<Duration>,
) -> Result<AgentSession> {
    let worktree = match merges {
        Some(merges) => Some(merges.prepare_worktree(task_id).await?),
        None => None,
    };
    let instance = lifecycle.try_spawn(agent_type, task_id).await?;
    let limit = timeout.unwrap_or(lifecycle.config().startup_timeout);
    let instance = lifecycle.await_startup(instance.id, limit).await?;
    info!(agent_id = %instance.id, agent = %agent_type, task = %task_id.short(), "agent session started");

    Ok(AgentSession {
        agent_id: instance.id,
        agent_type: instance.agent_type,
        task_id,
        pid: instance.pid,
        status: instance.status,
        worktree,
    })
}

/// Merges a completed task's branch into the integration branch.
pub async fn merge_completed_work(
    merges: &MergeCoordinator,
    task_id: TaskId,
    strategy: MergeStrategy,
    resolve_conflicts: Option<bool>,
) -> Result<MergeOutcome> {
    let resolve = resolve_conflicts.unwrap_or(merges.config().resolve_conflicts);
    merges.merge_with(task_id, strategy, resolve).await
}

/// Renders a command result as `{"success": true, ...fields}` or
/// `{"success": false, "error": ..., "code": ...}`.
pub fn to_response<T: Serialize>(result: Result<T>) -> Value {
    let value = result.and_then(|v| Ok(serde_json::to_value(v)?));
    match value {
        Ok(Value::Object(mut fields)) => {
            fields.insert("success".to_string(), Value::Bool(true));
            Value::Object(fields)
        }
        Ok(other) => json!({ "success": true, "result": other }),
        Err(e) => {
            let mut body = json!({
                "success": false,
                "error": e.to_string(),
                "code": e.code(),
            });
            if let Error::MergeConflict { files } = &e {
                body["conflict_files"] = json!(files);
            }
            body
        }
    }
}
