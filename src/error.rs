use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("Git command failed: {0}")]
    GitCommand(String),

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Agent type {agent_type} already has an active instance ({agent_id})")]
    SingletonViolation {
        agent_type: String,
        agent_id: String,
    },

    #[error("Insufficient resources: {0}")]
    ResourceExhaustion(String),

    #[error("Failed to launch agent process: {0}")]
    SpawnFailed(String),

    #[error("Agent {agent_id} did not acknowledge startup within {timeout:?}")]
    StartupTimeout {
        agent_id: String,
        timeout: std::time::Duration,
    },

    #[error("Task {task_id} is not completed (status: {status})")]
    TaskNotCompleted { task_id: String, status: String },

    #[error("Merge conflict in {} file(s): {}", files.len(), files.join(", "))]
    MergeConflict { files: Vec<String> },

    #[error("Branch not found: {0}")]
    BranchNotFound(String),

    #[error("Working directory has uncommitted changes: {0}")]
    DirtyWorkingDirectory(String),

    #[error("Task {0} is already merged")]
    AlreadyMerged(String),

    #[error("Invalid transition for {entity} from {from} to {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

impl Error {
    /// Stable machine-readable code, used in JSON command results.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) => "Io",
            Error::Git(_) | Error::GitCommand(_) => "Git",
            Error::Store(_) => "Store",
            Error::Json(_) => "Json",
            Error::TomlParse(_) | Error::TomlSerialize(_) => "Config",
            Error::NoHomeDir => "NoHomeDir",
            Error::Validation(_) => "Validation",
            Error::NotFound(_) => "NotFound",
            Error::Timeout(_) => "Timeout",
            Error::TaskJoin(_) => "TaskJoin",
            Error::SingletonViolation { .. } => "SingletonViolation",
            Error::ResourceExhaustion(_) => "ResourceExhaustion",
            Error::SpawnFailed(_) => "SpawnFailed",
            Error::StartupTimeout { .. } => "StartupTimeout",
            Error::TaskNotCompleted { .. } => "TaskNotCompleted",
            Error::MergeConflict { .. } => "MergeConflict",
            Error::BranchNotFound(_) => "BranchNotFound",
            Error::DirtyWorkingDirectory(_) => "DirtyWorkingDirectory",
            Error::AlreadyMerged(_) => "AlreadyMerged",
            Error::InvalidTransition { .. } => "InvalidTransition",
            Error::InvalidPayload(_) => "InvalidPayload",
        }
    }

    /// Conditions that are retried locally with backoff before giving up.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ResourceExhaustion(_) | Error::SpawnFailed(_) | Error::Timeout(_)
        )
    }

    pub(crate) fn transition(
        entity: impl std::fmt::Display,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        Error::InvalidTransition {
            entity: entity.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", Error::NoHomeDir), "No home directory");
        assert_eq!(
            format!(
                "{}",
                Error::MergeConflict {
                    files: vec!["a.txt".to_string(), "b.txt".to_string()]
                }
            ),
            "Merge conflict in 2 file(s): a.txt, b.txt"
        );
        assert_eq!(
            Error::transition("message m1", "completed", "failed").to_string(),
            "Invalid transition for message m1 from completed to failed"
        );
    }

    #[test]
    fn test_error_codes_match_taxonomy() {
        let singleton = Error::SingletonViolation {
            agent_type: "worker".to_string(),
            agent_id: "a".to_string(),
        };
        assert_eq!(singleton.code(), "SingletonViolation");
        assert_eq!(Error::AlreadyMerged("t".into()).code(), "AlreadyMerged");
        assert_eq!(Error::InvalidPayload("x".into()).code(), "InvalidPayload");
        assert_eq!(
            Error::DirtyWorkingDirectory("repo".into()).code(),
            "DirtyWorkingDirectory"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::ResourceExhaustion("cpu".into()).is_transient());
        assert!(Error::SpawnFailed("enoent".into()).is_transient());
        assert!(Error::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!Error::MergeConflict { files: vec![] }.is_transient());
        assert!(!Error::SingletonViolation {
            agent_type: "w".into(),
            agent_id: "a".into()
        }
        .is_transient());
    }
}
