//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - A scripted process launcher standing in for real workers
//! - Wiring a store, lifecycle manager and merge coordinator together

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::watch;

use foreman::agent::LaunchSpec;
use foreman::core::{AgentType, MergeStrategy, NewTask, Task, TaskKind};
use foreman::git::GitOps;
use foreman::orchestration::{LifecycleConfig, LifecycleManager, MergeConfig, MergeCoordinator};
use foreman::process::{ExitReport, ProcessHandle, ProcessLauncher, SpawnAck};
use foreman::resources::{ResourceProbe, ResourceSnapshot};
use foreman::store::{tasks, Store};
use foreman::{Error, Result};

pub const INTEGRATION: &str = "integration";

/// Stderr of a worker that dies on a missing module.
pub const IMPORT_ERROR_STDERR: &str = "Traceback (most recent call last):\n  File \"/work/agent.py\", line 3, in <module>\n    import foo\nModuleNotFoundError: No module named 'foo'\n";

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    /// Keeps the directory alive for the duration of the test.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
}

impl TestRepo {
    /// Create a new test repository with an initial commit and an
    /// `integration` branch checked out.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();

        git(&path, &["init", "--quiet"]);
        git(&path, &["config", "user.email", "test@test.com"]);
        git(&path, &["config", "user.name", "Test User"]);
        std::fs::write(path.join("README.md"), "# Test Repository\n")
            .expect("Failed to write README");
        git(&path, &["add", "."]);
        git(&path, &["commit", "--quiet", "-m", "Initial commit"]);
        git(&path, &["checkout", "--quiet", "-b", INTEGRATION]);

        Self { temp_dir, path }
    }

    /// Commits `content` to `filename` on the checked-out branch.
    pub fn commit_file(&self, filename: &str, content: &str, message: &str) -> String {
        commit_in(&self.path, filename, content, message)
    }

    pub fn tip(&self, branch: &str) -> String {
        git(&self.path, &["rev-parse", branch])
    }

    pub fn branch_exists(&self, name: &str) -> bool {
        !git(&self.path, &["branch", "--list", name]).is_empty()
    }

    /// Contents of `filename` at the tip of `branch`.
    pub fn show(&self, branch: &str, filename: &str) -> String {
        git(&self.path, &["show", &format!("{}:{}", branch, filename)])
    }

    pub fn git_ops(&self) -> Result<GitOps> {
        GitOps::new(&self.path)
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs git in `dir` and returns trimmed stdout. Panics on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Writes and commits a file inside a task worktree, as a worker would.
pub fn commit_in(worktree: &Path, filename: &str, content: &str, message: &str) -> String {
    let file_path = worktree.join(filename);
    if let Some(parent) = file_path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent dir");
    }
    std::fs::write(&file_path, content).expect("Failed to write file");
    git(worktree, &["add", filename]);
    git(
        worktree,
        &[
            "-c",
            "user.name=Worker",
            "-c",
            "user.email=worker@test.com",
            "commit",
            "--quiet",
            "-m",
            message,
        ],
    );
    git(worktree, &["rev-parse", "HEAD"])
}

/// How a fake worker behaves once launched.
#[derive(Debug, Clone)]
pub enum Script {
    /// Acknowledges startup and runs until killed.
    Hang,
    /// Acknowledges startup, then exits.
    Exit { code: i32, stderr: String },
    /// Runs but never acknowledges startup.
    NoAck,
}

impl Script {
    pub fn import_error() -> Self {
        Script::Exit {
            code: 1,
            stderr: IMPORT_ERROR_STDERR.to_string(),
        }
    }
}

/// A process that only exists in memory.
pub struct FakeProcess {
    pid: u32,
    acks: bool,
    exit: watch::Sender<Option<ExitReport>>,
}

impl FakeProcess {
    fn new(pid: u32, script: Script) -> Self {
        let initial = match &script {
            Script::Exit { code, stderr } => Some(ExitReport {
                code: Some(*code),
                stderr_tail: stderr.clone(),
            }),
            Script::Hang | Script::NoAck => None,
        };
        let acks = !matches!(script, Script::NoAck);
        let (exit, _) = watch::channel(initial);
        Self { pid, acks, exit }
    }
}

#[async_trait]
impl ProcessHandle for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }

    async fn acknowledgment(&self) -> Result<SpawnAck> {
        if !self.acks {
            std::future::pending::<()>().await;
        }
        Ok(SpawnAck {
            success: true,
            agent_id: None,
            pid: Some(self.pid),
            started_at: Some(Utc::now()),
            error: None,
        })
    }

    async fn wait(&self) -> Result<ExitReport> {
        let mut rx = self.exit.subscribe();
        let report = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::SpawnFailed("process handle dropped".to_string()))?;
        Ok(report.clone().unwrap_or(ExitReport {
            code: None,
            stderr_tail: String::new(),
        }))
    }

    async fn kill(&self) -> Result<()> {
        self.exit.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(ExitReport {
                    code: None,
                    stderr_tail: String::new(),
                });
                true
            } else {
                false
            }
        });
        Ok(())
    }
}

/// Launches [`FakeProcess`]es following a queue of scripts. When the queue
/// runs dry the default script is used.
pub struct FakeLauncher {
    next_pid: AtomicU32,
    default: Script,
    queue: Mutex<VecDeque<Script>>,
    launched: Mutex<Vec<LaunchSpec>>,
    fail_launch: bool,
}

impl FakeLauncher {
    pub fn new(default: Script) -> Self {
        Self {
            next_pid: AtomicU32::new(3_000_000),
            default,
            queue: Mutex::new(VecDeque::new()),
            launched: Mutex::new(Vec::new()),
            fail_launch: false,
        }
    }

    /// A launcher whose every launch fails.
    pub fn failing() -> Self {
        Self {
            fail_launch: true,
            ..Self::new(Script::Hang)
        }
    }

    pub fn then(self, script: Script) -> Self {
        self.queue.lock().unwrap().push_back(script);
        self
    }

    pub fn launched(&self) -> Vec<LaunchSpec> {
        self.launched.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn ProcessHandle>> {
        if self.fail_launch {
            return Err(Error::SpawnFailed("agent binary not found".to_string()));
        }
        self.launched.lock().unwrap().push(spec.clone());
        let script = self
            .queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeProcess::new(pid, script)))
    }

    fn pid_alive(&self, _pid: u32) -> bool {
        false
    }

    fn kill_pid(&self, _pid: u32) {}
}

/// A host that always has headroom.
pub struct IdleHost;

impl ResourceProbe for IdleHost {
    fn snapshot(&self) -> Result<ResourceSnapshot> {
        Ok(ResourceSnapshot::default())
    }
}

/// Lifecycle settings tuned for fast tests.
pub fn fast_lifecycle_config() -> LifecycleConfig {
    LifecycleConfig {
        orchestrator_id: "test-orchestrator".to_string(),
        startup_timeout: Duration::from_secs(2),
        backoff_base: Duration::from_millis(10),
        ..LifecycleConfig::default()
    }
}

/// A store, a lifecycle manager over a [`FakeLauncher`] and, when a repo
/// is given, a merge coordinator.
pub struct Harness {
    pub store: Store,
    pub launcher: Arc<FakeLauncher>,
    pub lifecycle: LifecycleManager,
    pub merges: Option<MergeCoordinator>,
    pub worktrees: TempDir,
}

impl Harness {
    pub fn new(launcher: FakeLauncher) -> Self {
        let store = Store::open_in_memory().expect("Failed to open store");
        let launcher = Arc::new(launcher);
        let lifecycle = LifecycleManager::new(
            store.clone(),
            Arc::clone(&launcher) as Arc<dyn ProcessLauncher>,
            fast_lifecycle_config(),
        )
        .with_probe(Arc::new(IdleHost));
        Self {
            store,
            launcher,
            lifecycle,
            merges: None,
            worktrees: TempDir::new().expect("Failed to create worktree dir"),
        }
    }

    pub fn with_repo(mut self, repo: &TestRepo) -> Self {
        let config = MergeConfig {
            integration_branch: INTEGRATION.to_string(),
            worktrees_dir: self.worktrees.path().to_path_buf(),
            resolve_conflicts: false,
            default_strategy: MergeStrategy::Recursive,
        };
        let git = repo.git_ops().expect("Failed to open repo");
        self.merges = Some(
            MergeCoordinator::new(self.store.clone(), git, config)
                .with_lifecycle(self.lifecycle.clone()),
        );
        self
    }

    pub fn merges(&self) -> &MergeCoordinator {
        self.merges.as_ref().expect("harness has no repository")
    }

    pub fn add_task(&self, kind: TaskKind, title: &str) -> Task {
        self.store
            .with_tx(|tx| tasks::insert(tx, &NewTask::new(kind, title), Utc::now()))
            .expect("Failed to insert task")
    }

    pub fn add_task_for(&self, agent: AgentType, title: &str) -> Task {
        self.store
            .with_tx(|tx| {
                tasks::insert(
                    tx,
                    &NewTask::new(TaskKind::Spec, title).with_agent(agent),
                    Utc::now(),
                )
            })
            .expect("Failed to insert task")
    }

    pub fn task(&self, task: &Task) -> Task {
        self.store
            .read(|c| tasks::require(c, task.id))
            .expect("Failed to read task")
    }
}

/// Polls `condition` every 10ms until it holds or `limit` passes.
pub async fn eventually<F>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
