use std::path::Path;

use crate::config::Config;
use crate::core::{AgentId, AgentType, TaskId};

/// Worker command line built from the configured agent command.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    base_command: Vec<String>,
}

/// Parameters passed to a worker at launch.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub agent_id: AgentId,
    pub agent_type: AgentType,
    pub task_id: TaskId,
    pub orchestrator_id: String,
    pub timeout_seconds: u64,
    pub workdir: Option<std::path::PathBuf>,
}

impl AgentCommand {
    pub fn from_config(config: &Config) -> Self {
        Self::parse(config.effective_agent_command())
    }

    pub fn parse(command: &str) -> Self {
        Self {
            base_command: command.split_whitespace().map(String::from).collect(),
        }
    }

    pub fn binary(&self) -> &str {
        self.base_command
            .first()
            .map(|s| s.as_str())
            .unwrap_or("foreman-agent")
    }

    /// Full argv: the configured command followed by the launch parameters.
    pub fn argv(&self, spec: &LaunchSpec) -> Vec<String> {
        let mut cmd = self.base_command.clone();
        cmd.extend([
            "--agent-type".to_string(),
            spec.agent_type.to_string(),
            "--task-id".to_string(),
            spec.task_id.to_string(),
            "--orchestrator-id".to_string(),
            spec.orchestrator_id.clone(),
            "--timeout-seconds".to_string(),
            spec.timeout_seconds.to_string(),
        ]);
        cmd
    }

    /// Environment handed to the worker so it can reach the shared store.
    pub fn env(&self, spec: &LaunchSpec, db_path: Option<&Path>) -> Vec<(String, String)> {
        let mut env = vec![
            ("FOREMAN_AGENT_ID".to_string(), spec.agent_id.to_string()),
            ("FOREMAN_AGENT_TYPE".to_string(), spec.agent_type.to_string()),
            ("FOREMAN_TASK_ID".to_string(), spec.task_id.to_string()),
        ];
        if let Some(path) = db_path {
            env.push(("FOREMAN_DB".to_string(), path.display().to_string()));
        }
        env
    }

    pub fn is_available(&self) -> bool {
        which::which(self.binary()).is_ok()
    }
}

impl Default for AgentCommand {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}
