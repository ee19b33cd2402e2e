//! Worker process supervision boundary.
//!
//! The lifecycle manager only talks to [`ProcessLauncher`] and
//! [`ProcessHandle`]; [`CommandLauncher`] is the real implementation on top
//! of `tokio::process`.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::agent::{AgentCommand, LaunchSpec};
use crate::{Error, Result};

/// Lines of stderr kept for crash classification.
pub const STDERR_TAIL_LINES: usize = 200;

/// Startup acknowledgment printed by a worker on its first stdout line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnAck {
    pub success: bool,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SpawnAck {
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim()).map_err(|e| {
            Error::SpawnFailed(format!("malformed startup acknowledgment: {}", e))
        })
    }
}

/// How a worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    /// None when terminated by a signal.
    pub code: Option<i32>,
    pub stderr_tail: String,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[async_trait]
pub trait ProcessHandle: Send + Sync {
    fn pid(&self) -> u32;

    fn is_alive(&self) -> bool;

    /// Resolves with the worker's startup acknowledgment. Callers bound it
    /// with the startup timeout.
    async fn acknowledgment(&self) -> Result<SpawnAck>;

    /// Resolves once the process exits.
    async fn wait(&self) -> Result<ExitReport>;

    async fn kill(&self) -> Result<()>;
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn ProcessHandle>>;

    /// Liveness of a pid recorded by any process, including other replicas.
    fn pid_alive(&self, pid: u32) -> bool;

    /// Best-effort termination of a pid (and its process group).
    fn kill_pid(&self, pid: u32);
}

/// Launches the configured agent command as a child process in its own
/// process group.
pub struct CommandLauncher {
    command: AgentCommand,
    db_path: Option<PathBuf>,
}

impl CommandLauncher {
    pub fn new(command: AgentCommand, db_path: Option<PathBuf>) -> Self {
        Self { command, db_path }
    }
}

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn ProcessHandle>> {
        let argv = self.command.argv(spec);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::SpawnFailed("empty agent command".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(self.command.env(spec, self.db_path.as_deref()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        if let Some(dir) = &spec.workdir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd
            .spawn()
            .map_err(|e| Error::SpawnFailed(format!("{}: {}", program, e)))?;
        let pid = child
            .id()
            .ok_or_else(|| Error::SpawnFailed(format!("{} exited immediately", program)))?;
        debug!(pid, agent = %spec.agent_type, task = %spec.task_id.short(), "worker launched");

        Ok(Arc::new(ChildProcess::start(pid, child)))
    }

    fn pid_alive(&self, pid: u32) -> bool {
        pid_alive(pid)
    }

    fn kill_pid(&self, pid: u32) {
        kill_group(pid);
    }
}

/// A launched child with background readers on its stdout and stderr.
pub struct ChildProcess {
    pid: u32,
    child: tokio::sync::Mutex<Option<Child>>,
    ack: tokio::sync::Mutex<Option<oneshot::Receiver<Result<SpawnAck>>>>,
    stderr: Arc<Mutex<VecDeque<String>>>,
    exited: AtomicBool,
}

impl ChildProcess {
    fn start(pid: u32, mut child: Child) -> Self {
        let (ack_tx, ack_rx) = oneshot::channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                let first = match lines.next_line().await {
                    Ok(Some(line)) => SpawnAck::parse(&line),
                    Ok(None) => Err(Error::SpawnFailed(
                        "worker closed stdout before acknowledging".to_string(),
                    )),
                    Err(e) => Err(Error::Io(e)),
                };
                let _ = ack_tx.send(first);
                // Keep draining so the worker never blocks on a full pipe.
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(pid, "worker stdout: {}", line);
                }
            });
        }

        let stderr = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        if let Some(err) = child.stderr.take() {
            let tail = Arc::clone(&stderr);
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut tail = tail.lock().unwrap_or_else(|p| p.into_inner());
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            });
        }

        Self {
            pid,
            child: tokio::sync::Mutex::new(Some(child)),
            ack: tokio::sync::Mutex::new(Some(ack_rx)),
            stderr,
            exited: AtomicBool::new(false),
        }
    }

    fn stderr_tail(&self) -> String {
        let tail = self.stderr.lock().unwrap_or_else(|p| p.into_inner());
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

#[async_trait]
impl ProcessHandle for ChildProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&self) -> bool {
        !self.exited.load(Ordering::SeqCst) && pid_alive(self.pid)
    }

    async fn acknowledgment(&self) -> Result<SpawnAck> {
        let rx = self
            .ack
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Validation("acknowledgment already consumed".to_string()))?;
        rx.await
            .map_err(|_| Error::SpawnFailed("acknowledgment reader dropped".to_string()))?
    }

    async fn wait(&self) -> Result<ExitReport> {
        let mut guard = self.child.lock().await;
        let child = guard
            .as_mut()
            .ok_or_else(|| Error::Validation("process already reaped".to_string()))?;
        let status = child.wait().await?;
        self.exited.store(true, Ordering::SeqCst);
        guard.take();
        drop(guard);

        // Give the stderr reader a moment to flush the final lines.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        Ok(ExitReport {
            code: status.code(),
            stderr_tail: self.stderr_tail(),
        })
    }

    async fn kill(&self) -> Result<()> {
        if self.exited.load(Ordering::SeqCst) {
            return Ok(());
        }
        kill_group(self.pid);
        Ok(())
    }
}

#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // SAFETY: signal 0 only checks that the pid exists.
    let rc = unsafe { libc::kill(pid as i32, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    true
}

/// SIGKILL to the worker's process group, falling back to the pid alone.
#[cfg(unix)]
fn kill_group(pid: u32) {
    if pid == 0 || pid > i32::MAX as u32 {
        return;
    }
    // SAFETY: plain signal delivery; failures are reported via errno.
    let rc = unsafe { libc::killpg(pid as i32, libc::SIGKILL) };
    if rc != 0 {
        let rc = unsafe { libc::kill(pid as i32, libc::SIGKILL) };
        if rc != 0 {
            warn!(pid, error = %std::io::Error::last_os_error(), "failed to kill worker");
        }
    }
}

#[cfg(not(unix))]
fn kill_group(pid: u32) {
    warn!(pid, "killing workers is unsupported on this platform");
}
