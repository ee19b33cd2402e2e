use std::path::{Path, PathBuf};
use std::time::Duration;

use git2::{BranchType, Commit, ErrorCode, Repository, StatusOptions};
use tracing::{debug, warn};

use crate::util::run_command;
use crate::{Error, Result};

const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(120);
const FALLBACK_NAME: &str = "foreman";
const FALLBACK_EMAIL: &str = "foreman@localhost";

/// Branch naming used for task worktrees.
pub fn task_branch(integration: &str, task_id: &str) -> String {
    format!("{}-implementation_task-{}", integration, task_id)
}

pub struct GitOps {
    repo_path: PathBuf,
    timeout: Duration,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        debug!(path = %repo_path.display(), "GitOps::new");
        let repo = Repository::discover(repo_path)?;
        let root = repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| repo_path.to_path_buf());
        Ok(Self {
            repo_path: root,
            timeout: DEFAULT_GIT_TIMEOUT,
        })
    }

    /// Bound applied to every `git` subprocess.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let result = repo.find_branch(branch, BranchType::Local);
        match result {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Creates `branch` at the current HEAD unless it already exists.
    pub fn ensure_branch(&self, branch: &str) -> Result<()> {
        let repo = self.repo()?;
        if self.branch_exists(branch)? {
            return Ok(());
        }
        let head = repo.head()?.peel_to_commit()?;
        repo.branch(branch, &head, false)?;
        debug!(branch, commit = %head.id(), "branch created from HEAD");
        Ok(())
    }

    /// Full commit id at the tip of a local branch.
    pub fn branch_tip(&self, branch: &str) -> Result<String> {
        let repo = self.repo()?;
        let commit = branch_commit(&repo, branch)?;
        Ok(commit.id().to_string())
    }

    /// Creates `branch` from the tip of `base` (if missing) and checks it out
    /// in a worktree at `worktree_path`. Existing worktrees are left alone.
    pub fn prepare_worktree(&self, branch: &str, base: &str, worktree_path: &Path) -> Result<()> {
        debug!(
            branch,
            base,
            path = %worktree_path.display(),
            "GitOps::prepare_worktree"
        );
        if worktree_path.join(".git").exists() {
            debug!("worktree already present");
            return Ok(());
        }

        let repo = self.repo()?;
        let reference = match repo.find_branch(branch, BranchType::Local) {
            Ok(existing) => existing.into_reference(),
            Err(e) if e.code() == ErrorCode::NotFound => {
                let base_commit = branch_commit(&repo, base)?;
                repo.branch(branch, &base_commit, false)?.into_reference()
            }
            Err(e) => return Err(e.into()),
        };

        let name = worktree_name(worktree_path, branch);
        // A leftover admin entry from a removed directory blocks re-adding.
        if let Ok(stale) = repo.find_worktree(&name) {
            if stale.validate().is_err() {
                debug!(name = %name, "pruning stale worktree entry");
                let _ = stale.prune(Some(
                    git2::WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true),
                ));
            }
        }

        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        repo.worktree(&name, worktree_path, Some(&opts))?;
        debug!(name = %name, "worktree created");
        Ok(())
    }

    /// Removes a worktree, its directory and its admin entry. Removing a
    /// worktree that no longer exists succeeds.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        debug!(path = %worktree_path.display(), "GitOps::remove_worktree");
        let repo = self.repo()?;
        let worktrees = repo.worktrees()?;

        let folder_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(String::from);
        let known = worktrees
            .iter()
            .flatten()
            .find(|name| {
                repo.find_worktree(name)
                    .map(|wt| wt.path() == worktree_path)
                    .unwrap_or(false)
                    || folder_name.as_deref() == Some(*name)
            })
            .map(String::from);

        if let Some(name) = &known {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                if let Err(e) = worktree.prune(Some(
                    git2::WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                )) {
                    warn!(name = %name, error = %e, "worktree prune failed");
                }
            }
            // Git treats the branch as checked out while this exists.
            let admin_dir = repo.path().join("worktrees").join(name);
            if admin_dir.exists() {
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }
        Ok(())
    }

    /// Deletes a local branch. A missing branch is not an error.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "GitOps::delete_branch");
        let repo = self.repo()?;
        match repo.find_branch(branch, BranchType::Local) {
            Ok(mut branch_ref) => {
                branch_ref.delete()?;
                debug!(branch, "branch deleted");
            }
            Err(e) if e.code() == ErrorCode::NotFound => {
                debug!(branch, "branch already gone");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Uncommitted changes to tracked files. Untracked and ignored files do
    /// not count.
    pub fn is_dirty(&self, path: &Path) -> Result<bool> {
        let repo = Repository::open(path)?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(false).include_ignored(false);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(!statuses.is_empty())
    }

    /// Simulates merging `source` into `target` in memory and returns the
    /// conflicting paths. Neither branch, the index nor any worktree is
    /// touched.
    pub fn dry_run_merge(&self, target: &str, source: &str) -> Result<Vec<String>> {
        let repo = self.repo()?;
        let ours = branch_commit(&repo, target)?;
        let theirs = branch_commit(&repo, source)?;
        let index = repo.merge_commits(&ours, &theirs, None)?;
        if !index.has_conflicts() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for conflict in index.conflicts()? {
            let conflict = conflict?;
            let entry = conflict.our.or(conflict.their).or(conflict.ancestor);
            if let Some(entry) = entry {
                files.push(String::from_utf8_lossy(&entry.path).into_owned());
            }
        }
        files.sort();
        files.dedup();
        debug!(target, source, conflicts = files.len(), "dry-run merge");
        Ok(files)
    }

    /// Merges `source` into `target` with a merge commit, in the main
    /// checkout. On failure the merge is aborted, leaving `target` as it was.
    /// Returns the new tip of `target`.
    pub async fn merge_branch(
        &self,
        target: &str,
        source: &str,
        strategy_option: Option<&str>,
        message: &str,
    ) -> Result<String> {
        debug!(target, source, ?strategy_option, "GitOps::merge_branch");
        branch_commit(&self.repo()?, source)?;
        self.git(&["checkout", "--quiet", target]).await?;

        let mut args = vec!["merge", "--no-ff", "--no-edit", "-m", message];
        if let Some(option) = strategy_option {
            args.push("-X");
            args.push(option);
        }
        args.push(source);

        match self.git(&args).await {
            Ok(_) => self.branch_tip(target),
            Err(e) => {
                let files = self.unmerged_files().await.unwrap_or_default();
                if let Err(abort) = self.git(&["merge", "--abort"]).await {
                    warn!(target, source, error = %abort, "merge --abort failed");
                }
                if files.is_empty() {
                    Err(e)
                } else {
                    Err(Error::MergeConflict { files })
                }
            }
        }
    }

    async fn unmerged_files(&self) -> Result<Vec<String>> {
        let out = self
            .git(&["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// `-c user.*` overrides for repositories without a configured identity.
    fn identity_args(&self) -> Vec<String> {
        let configured = self
            .repo()
            .and_then(|repo| Ok(repo.config()?))
            .map(|config| {
                config.get_string("user.name").is_ok() && config.get_string("user.email").is_ok()
            })
            .unwrap_or(false);
        if configured {
            return Vec::new();
        }
        vec![
            "-c".to_string(),
            format!("user.name={}", FALLBACK_NAME),
            "-c".to_string(),
            format!("user.email={}", FALLBACK_EMAIL),
        ]
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        let identity = self.identity_args();
        let mut full: Vec<&str> = identity.iter().map(String::as_str).collect();
        full.extend_from_slice(args);

        let out = run_command("git", &full, &self.repo_path, self.timeout).await?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let stdout = String::from_utf8_lossy(&out.stdout);
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            Err(Error::GitCommand(format!("git {}: {}", args.join(" "), detail)))
        }
    }
}

fn branch_commit<'r>(repo: &'r Repository, branch: &str) -> Result<Commit<'r>> {
    match repo.find_branch(branch, BranchType::Local) {
        Ok(b) => Ok(b.get().peel_to_commit()?),
        Err(e) if e.code() == ErrorCode::NotFound => Err(Error::BranchNotFound(branch.to_string())),
        Err(e) => Err(e.into()),
    }
}

/// Worktree admin name: the folder name, since branches may contain slashes.
fn worktree_name(worktree_path: &Path, branch: &str) -> String {
    worktree_path
        .file_name()
        .and_then(|n| n.to_str())
        .map(String::from)
        .unwrap_or_else(|| branch.replace('/', "-"))
}
