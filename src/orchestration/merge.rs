//! Serialized integration of completed task branches.
//!
//! Completed tasks wait in the merge queue and integrate one at a time in
//! creation order. Each merge is previewed in memory first; the integration
//! branch only moves when the real merge succeeds.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::lifecycle::LifecycleManager;
use crate::config::Config;
use crate::core::{MergeQueueEntry, MergeState, MergeStrategy, Task, TaskId, TaskStatus};
use crate::git::{task_branch, GitOps};
use crate::store::{merge_queue, tasks, Store};
use crate::util::blocking;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct MergeConfig {
    pub integration_branch: String,
    pub worktrees_dir: PathBuf,
    /// Let the recursive strategy attempt a merge despite dry-run conflicts.
    pub resolve_conflicts: bool,
    /// Strategy used by [`MergeCoordinator::advance`].
    pub default_strategy: MergeStrategy,
}

impl MergeConfig {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            integration_branch: config.integration_branch.clone(),
            worktrees_dir: config.worktrees_dir()?,
            resolve_conflicts: config.resolve_conflicts,
            default_strategy: MergeStrategy::Recursive,
        })
    }
}

/// Where a merge attempt ended up.
#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    pub task_id: TaskId,
    pub state: MergeState,
    pub strategy: MergeStrategy,
    pub merge_commit: Option<String>,
    pub conflict_files: Vec<String>,
    pub error: Option<String>,
}

impl MergeOutcome {
    fn from_entry(entry: &MergeQueueEntry, strategy: MergeStrategy) -> Self {
        Self {
            task_id: entry.task_id,
            state: entry.state,
            strategy,
            merge_commit: entry.merge_commit.clone(),
            conflict_files: entry.conflict_files.clone(),
            error: entry.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub removed_worktree: bool,
    pub deleted_branch: bool,
}

impl CleanupReport {
    pub fn is_noop(&self) -> bool {
        !self.removed_worktree && !self.deleted_branch
    }
}

#[derive(Clone)]
pub struct MergeCoordinator {
    store: Store,
    git: Arc<GitOps>,
    lifecycle: Option<LifecycleManager>,
    config: MergeConfig,
}

impl MergeCoordinator {
    pub fn new(store: Store, git: GitOps, config: MergeConfig) -> Self {
        Self {
            store,
            git: Arc::new(git),
            lifecycle: None,
            config,
        }
    }

    /// Releases task agents once their work is merged.
    pub fn with_lifecycle(mut self, lifecycle: LifecycleManager) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    pub async fn enqueue(&self, task_id: TaskId) -> Result<MergeQueueEntry> {
        let now = Utc::now();
        self.store.transact(move |tx| {
            let task = tasks::require(tx, task_id)?;
            match task.status {
                TaskStatus::Completed => merge_queue::enqueue(tx, task_id, now),
                TaskStatus::Merged => Err(Error::AlreadyMerged(task_id.to_string())),
                status => Err(Error::TaskNotCompleted {
                    task_id: task_id.to_string(),
                    status: status.to_string(),
                }),
            }
        })
        .await
    }

    /// Creates the task's branch off the integration branch and checks it out
    /// in a dedicated worktree. Safe to call again.
    pub async fn prepare_worktree(&self, task_id: TaskId) -> Result<PathBuf> {
        let task = self.task(task_id).await?;
        let branch = self.branch_for(&task);
        let path = task
            .worktree_path
            .clone()
            .unwrap_or_else(|| self.config.worktrees_dir.join(task_id.to_string()));

        let git = Arc::clone(&self.git);
        let integration = self.config.integration_branch.clone();
        let (b, p) = (branch.clone(), path.clone());
        blocking(move || {
            git.ensure_branch(&integration)?;
            git.prepare_worktree(&b, &integration, &p)
        })
        .await?;

        let (b, p) = (branch.clone(), path.clone());
        self.store
            .transact(move |tx| tasks::set_worktree(tx, task_id, Some(&p), Some(&b)))
            .await?;
        debug!(task = %task_id.short(), path = %path.display(), "worktree ready");
        Ok(path)
    }

    /// Files that would conflict if the task merged now. Changes nothing.
    pub async fn dry_run(&self, task_id: TaskId) -> Result<Vec<String>> {
        let task = self.task(task_id).await?;
        self.simulate(&self.branch_for(&task)).await
    }

    /// Merges a completed task into the integration branch.
    ///
    /// A fresh entry must be at the head of the merge order; a `conflict`
    /// entry may be retried with another strategy while no other merge is
    /// active. Conflicts leave the entry in `conflict` and return
    /// [`Error::MergeConflict`] with the integration branch untouched.
    pub async fn merge(&self, task_id: TaskId, strategy: MergeStrategy) -> Result<MergeOutcome> {
        self.merge_with(task_id, strategy, self.config.resolve_conflicts)
            .await
    }

    /// [`merge`](Self::merge) with an explicit conflict resolution setting.
    pub async fn merge_with(
        &self,
        task_id: TaskId,
        strategy: MergeStrategy,
        resolve_conflicts: bool,
    ) -> Result<MergeOutcome> {
        let task = self.claim_precheck(task_id).await?;
        let branch = self.branch_for(&task);

        let exists = {
            let branch = branch.clone();
            self.git_call(move |git: &GitOps| git.branch_exists(&branch))
                .await?
        };
        if !exists {
            let err = Error::BranchNotFound(branch);
            self.fail_awaiting(task_id, &err).await?;
            return Err(err);
        }
        self.ensure_clean(&task).await?;

        let now = Utc::now();
        self.store
            .transact(move |tx| merge_queue::transition(tx, task_id, MergeState::DryRun, now))
            .await?;
        info!(task = %task_id.short(), %strategy, "merge started");

        let conflicts = match self.simulate(&branch).await {
            Ok(files) => files,
            Err(e) => {
                self.finish_failed(task_id, &e).await?;
                return Err(e);
            }
        };
        if !conflicts.is_empty() && strategy.stops_on_conflict(resolve_conflicts) {
            self.finish_conflict(task_id, conflicts.clone()).await?;
            return Err(Error::MergeConflict { files: conflicts });
        }

        self.store
            .transact(move |tx| {
                merge_queue::transition(tx, task_id, MergeState::Merging, Utc::now())
            })
            .await?;
        let message = format!("Merge task {}: {}", task_id.short(), task.title);
        let merged = self
            .git
            .merge_branch(
                &self.config.integration_branch,
                &branch,
                strategy.strategy_option(),
                &message,
            )
            .await;

        let commit = match merged {
            Ok(commit) => commit,
            Err(Error::MergeConflict { files }) => {
                self.finish_conflict(task_id, files.clone()).await?;
                return Err(Error::MergeConflict { files });
            }
            Err(e) => {
                self.finish_failed(task_id, &e).await?;
                return Err(e);
            }
        };

        let sha = commit.clone();
        let entry = self
            .store
            .transact(move |tx| {
                let now = Utc::now();
                merge_queue::set_result(tx, task_id, Some(&sha), None)?;
                let entry = merge_queue::transition(tx, task_id, MergeState::Merged, now)?;
                tasks::set_status(tx, task_id, TaskStatus::Merged, now)?;
                Ok(entry)
            })
            .await?;
        info!(task = %task_id.short(), commit = %commit, "task merged");

        if let Some(lifecycle) = &self.lifecycle {
            if let Err(e) = lifecycle.release_task(task_id).await {
                warn!(task = %task_id.short(), error = %e, "releasing agents failed");
            }
        }
        if let Err(e) = self.cleanup(task_id).await {
            warn!(task = %task_id.short(), error = %e, "cleanup after merge failed");
        }
        Ok(MergeOutcome::from_entry(&entry, strategy))
    }

    /// One queue step: merges the head of the merge order if it is ready.
    /// Returns None when nothing was attempted.
    pub async fn advance(&self) -> Result<Option<MergeOutcome>> {
        if self.store.query(merge_queue::active).await?.is_some() {
            return Ok(None);
        }
        let Some(head) = self.store.query(tasks::merge_head).await? else {
            return Ok(None);
        };
        if head.status != TaskStatus::Completed {
            return Ok(None);
        }
        let head_id = head.id;
        let entry = self
            .store
            .query(move |conn| merge_queue::get(conn, head_id))
            .await?;
        if matches!(&entry, Some(e) if e.state != MergeState::AwaitingMerge) {
            return Ok(None);
        }

        let strategy = self.config.default_strategy;
        match self.merge(head.id, strategy).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(Error::DirtyWorkingDirectory(path)) => {
                warn!(task = %head.id.short(), path = %path, "merge waits for a clean working tree");
                Ok(None)
            }
            Err(e) => {
                let entry = self.entry(head.id).await?;
                if entry.state.is_terminal() {
                    debug!(task = %head.id.short(), state = %entry.state, error = %e, "merge settled");
                    Ok(Some(MergeOutcome::from_entry(&entry, strategy)))
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Removes the worktree and branch of a merged task. Cleaning a task that
    /// is already clean does nothing.
    pub async fn cleanup(&self, task_id: TaskId) -> Result<CleanupReport> {
        let task = self.task(task_id).await?;
        if task.status != TaskStatus::Merged {
            return Err(Error::transition(
                format!("task {}", task_id),
                task.status,
                "cleanup",
            ));
        }

        let worktree = task.worktree_path.clone();
        let branch = task.branch_name.clone();
        let report = self
            .git_call(move |git| {
                let mut report = CleanupReport::default();
                if let Some(path) = &worktree {
                    report.removed_worktree = path.exists();
                    git.remove_worktree(path)?;
                }
                if let Some(branch) = &branch {
                    report.deleted_branch = git.branch_exists(branch)?;
                    git.delete_branch(branch)?;
                }
                Ok(report)
            })
            .await?;

        if task.worktree_path.is_some() || task.branch_name.is_some() {
            self.store
                .transact(move |tx| tasks::set_worktree(tx, task_id, None, None))
                .await?;
        }
        if !report.is_noop() {
            info!(task = %task_id.short(), ?report, "task cleaned up");
        }
        Ok(report)
    }

    /// Active merges that have not moved for longer than `threshold`.
    pub async fn stale_active_merges(
        &self,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<MergeQueueEntry>> {
        let threshold = chrono::Duration::from_std(threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(900));
        let cutoff = now - threshold;
        self.store
            .query(move |conn| merge_queue::stale_active(conn, cutoff))
            .await
    }

    /// Fails an active merge, freeing the merge slot.
    pub async fn fail_merge(&self, task_id: TaskId, reason: &str) -> Result<MergeQueueEntry> {
        let reason = reason.to_string();
        self.store
            .transact(move |tx| {
                merge_queue::set_result(tx, task_id, None, Some(&reason))?;
                merge_queue::transition(tx, task_id, MergeState::Failed, Utc::now())
            })
            .await
    }

    async fn task(&self, task_id: TaskId) -> Result<Task> {
        self.store
            .query(move |conn| tasks::require(conn, task_id))
            .await
    }

    async fn entry(&self, task_id: TaskId) -> Result<MergeQueueEntry> {
        self.store
            .query(move |conn| merge_queue::require(conn, task_id))
            .await
    }

    /// Validates the task and its entry before any git work. Returns the task.
    async fn claim_precheck(&self, task_id: TaskId) -> Result<Task> {
        let now = Utc::now();
        self.store.transact(move |tx| {
            let task = tasks::require(tx, task_id)?;
            match task.status {
                TaskStatus::Completed => {}
                TaskStatus::Merged => return Err(Error::AlreadyMerged(task_id.to_string())),
                status => {
                    return Err(Error::TaskNotCompleted {
                        task_id: task_id.to_string(),
                        status: status.to_string(),
                    })
                }
            }

            let entry = merge_queue::enqueue(tx, task_id, now)?;
            match entry.state {
                MergeState::AwaitingMerge => {
                    if let Some(head) = tasks::merge_head(tx)? {
                        if head.id != task_id {
                            return Err(Error::Validation(format!(
                                "task {} merges after task {} ({})",
                                task_id, head.id, head.status
                            )));
                        }
                    }
                }
                MergeState::Conflict => {}
                MergeState::Merged => return Err(Error::AlreadyMerged(task_id.to_string())),
                MergeState::DryRun | MergeState::Merging => {
                    return Err(Error::Validation(format!(
                        "merge of task {} already in progress",
                        task_id
                    )))
                }
                MergeState::Failed => {
                    return Err(Error::transition(
                        format!("merge entry {}", task_id),
                        entry.state,
                        MergeState::DryRun,
                    ))
                }
            }
            Ok(task)
        })
        .await
    }

    async fn ensure_clean(&self, task: &Task) -> Result<()> {
        let worktree = task.worktree_path.clone();
        self.git_call(move |git| {
            if let Some(path) = worktree.filter(|p| p.exists()) {
                if git.is_dirty(&path)? {
                    return Err(Error::DirtyWorkingDirectory(path.display().to_string()));
                }
            }
            let root = git.repo_path().to_path_buf();
            if git.is_dirty(&root)? {
                return Err(Error::DirtyWorkingDirectory(root.display().to_string()));
            }
            Ok(())
        })
        .await
    }

    async fn simulate(&self, branch: &str) -> Result<Vec<String>> {
        let integration = self.config.integration_branch.clone();
        let branch = branch.to_string();
        self.git_call(move |git| git.dry_run_merge(&integration, &branch))
            .await
    }

    async fn finish_conflict(&self, task_id: TaskId, files: Vec<String>) -> Result<()> {
        let summary = format!("conflicts in {} file(s)", files.len());
        let recorded = files.clone();
        self.store
            .transact(move |tx| {
                merge_queue::set_conflicts(tx, task_id, &recorded)?;
                merge_queue::set_result(tx, task_id, None, Some(&summary))?;
                merge_queue::transition(tx, task_id, MergeState::Conflict, Utc::now())
            })
            .await?;
        warn!(task = %task_id.short(), files = ?files, "merge conflict");
        Ok(())
    }

    async fn finish_failed(&self, task_id: TaskId, err: &Error) -> Result<()> {
        self.fail_merge(task_id, &err.to_string()).await?;
        warn!(task = %task_id.short(), error = %err, "merge failed");
        Ok(())
    }

    /// A missing branch can never merge; take the entry out of line.
    async fn fail_awaiting(&self, task_id: TaskId, err: &Error) -> Result<()> {
        let entry = self.entry(task_id).await?;
        if entry.state == MergeState::AwaitingMerge {
            self.finish_failed(task_id, err).await?;
        }
        Ok(())
    }

    fn branch_for(&self, task: &Task) -> String {
        task.branch_name
            .clone()
            .unwrap_or_else(|| task_branch(&self.config.integration_branch, &task.id.to_string()))
    }

    async fn git_call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&GitOps) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let git = Arc::clone(&self.git);
        blocking(move || f(&git)).await
    }
}
