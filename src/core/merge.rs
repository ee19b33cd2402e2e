//! Merge queue types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TaskId;

/// Integration state of one task's branch.
///
/// `awaiting_merge → dry_run → merging → merged | conflict | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeState {
    AwaitingMerge,
    DryRun,
    Merging,
    Merged,
    Conflict,
    Failed,
}

string_enum!(MergeState {
    AwaitingMerge => "awaiting_merge",
    DryRun => "dry_run",
    Merging => "merging",
    Merged => "merged",
    Conflict => "conflict",
    Failed => "failed",
});

impl MergeState {
    /// Holds the system-wide merge slot.
    pub fn is_active(&self) -> bool {
        matches!(self, MergeState::DryRun | MergeState::Merging)
    }

    /// Releases the head of the queue to the next task.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MergeState::Merged | MergeState::Conflict | MergeState::Failed
        )
    }

    pub fn can_transition_to(&self, next: MergeState) -> bool {
        use MergeState::*;
        matches!(
            (self, next),
            (AwaitingMerge, DryRun)
                | (Conflict, DryRun)
                | (DryRun, Merging)
                | (DryRun, Conflict)
                | (DryRun, Failed)
                | (DryRun, AwaitingMerge)
                | (Merging, Merged)
                | (Merging, Conflict)
                | (Merging, Failed)
                | (AwaitingMerge, Failed)
        )
    }
}

/// How to integrate a task branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Default three-way merge.
    #[default]
    Recursive,
    /// Conflicting hunks resolve to the integration branch side.
    Ours,
    /// Conflicting hunks resolve to the task branch side.
    Theirs,
    /// Any conflict stops the merge for manual intervention.
    Abort,
}

string_enum!(MergeStrategy {
    Recursive => "recursive",
    Ours => "ours",
    Theirs => "theirs",
    Abort => "abort",
});

impl MergeStrategy {
    /// `-X` option passed to `git merge`, if any.
    pub fn strategy_option(&self) -> Option<&'static str> {
        match self {
            MergeStrategy::Ours => Some("ours"),
            MergeStrategy::Theirs => Some("theirs"),
            MergeStrategy::Recursive | MergeStrategy::Abort => None,
        }
    }

    /// Whether a dry-run conflict stops the merge before touching the branch.
    pub fn stops_on_conflict(&self, resolve_conflicts: bool) -> bool {
        match self {
            MergeStrategy::Abort => true,
            MergeStrategy::Recursive => !resolve_conflicts,
            MergeStrategy::Ours | MergeStrategy::Theirs => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeQueueEntry {
    pub task_id: TaskId,
    pub state: MergeState,
    pub conflict_files: Vec<String>,
    pub merge_commit: Option<String>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}
