//! Agent lifecycle management.
//!
//! Enforces one live instance per agent type, launches workers through a
//! [`ProcessLauncher`], supervises each launched process from a detached
//! task, and turns exits, stalls and vanished processes into crash records,
//! respawns and bug reports. Every decision is committed to the store before
//! any process is touched.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::json;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::escalation::{self, CrashDecision};
use crate::agent::LaunchSpec;
use crate::classifier::{Classification, ErrorClassifier, PatternClassifier};
use crate::config::Config;
use crate::core::message::PRIORITY_HIGHEST;
use crate::core::{
    AgentId, AgentInstance, AgentStatus, AgentType, BugRecord, CrashRecord, ErrorType,
    NewMessage, Recipient, Task, TaskId, TaskStatus,
};
use crate::process::{ExitReport, ProcessHandle, ProcessLauncher};
use crate::resources::{ResourceLimits, ResourceProbe, SystemProbe};
use crate::store::{agents, merge_queue, messages, records, tasks, Store};
use crate::{Error, Result};

const STARTUP_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Sender identity for orchestrator-originated messages and `--orchestrator-id`.
    pub orchestrator_id: String,
    pub startup_timeout: Duration,
    /// Upper bound on a worker's total run time.
    pub agent_timeout: Duration,
    pub stall_threshold: Duration,
    pub max_restarts: u32,
    pub backoff_base: Duration,
    pub max_spawn_attempts: u32,
    pub remediation_agent: AgentType,
    pub limits: ResourceLimits,
}

impl LifecycleConfig {
    pub fn from_config(config: &Config, orchestrator_id: &str) -> Self {
        Self {
            orchestrator_id: orchestrator_id.to_string(),
            startup_timeout: config.startup_timeout(),
            agent_timeout: config.agent_timeout(),
            stall_threshold: config.stall_threshold(),
            max_restarts: config.max_restarts,
            backoff_base: Duration::from_secs(config.backoff_base_secs),
            max_spawn_attempts: config.max_spawn_attempts.max(1),
            remediation_agent: config.remediation_agent(),
            limits: ResourceLimits::from_config(config),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self::from_config(&Config::default(), "orchestrator")
    }
}

/// Result of handling one crash.
#[derive(Debug, Clone)]
pub struct CrashOutcome {
    pub agent_id: AgentId,
    pub task_id: TaskId,
    /// Pid of the crashed process, if one was running.
    pub pid: Option<u32>,
    pub crash: CrashRecord,
    /// Scheduled relaunch time; None when the instance was retired.
    pub respawn_at: Option<DateTime<Utc>>,
    pub bug: Option<BugRecord>,
}

impl CrashOutcome {
    pub fn escalated(&self) -> bool {
        self.respawn_at.is_none()
    }
}

#[derive(Debug, Default, Clone)]
pub struct StallReport {
    pub stalled: Vec<AgentId>,
    pub crashed: Vec<CrashOutcome>,
}

/// Cheap to clone; clones share process handles.
#[derive(Clone)]
pub struct LifecycleManager {
    store: Store,
    launcher: Arc<dyn ProcessLauncher>,
    classifier: Arc<dyn ErrorClassifier>,
    probe: Arc<dyn ResourceProbe>,
    config: Arc<LifecycleConfig>,
    handles: Arc<Mutex<HashMap<AgentId, Arc<dyn ProcessHandle>>>>,
}

impl LifecycleManager {
    pub fn new(store: Store, launcher: Arc<dyn ProcessLauncher>, config: LifecycleConfig) -> Self {
        Self {
            store,
            launcher,
            classifier: Arc::new(PatternClassifier),
            probe: Arc::new(SystemProbe),
            config: Arc::new(config),
            handles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn classifier(&self) -> &dyn ErrorClassifier {
        self.classifier.as_ref()
    }

    pub fn launcher(&self) -> &dyn ProcessLauncher {
        self.launcher.as_ref()
    }

    /// Claims the agent type's singleton slot for `task_id` and launches a
    /// worker. The returned instance is `spawned`; the supervisor moves it to
    /// `running` once the worker acknowledges startup.
    pub async fn try_spawn(&self, agent_type: &AgentType, task_id: TaskId) -> Result<AgentInstance> {
        if !agent_type.is_spawnable() {
            return Err(Error::Validation(format!(
                "agent type '{}' cannot be spawned",
                agent_type
            )));
        }
        let holder = {
            let agent_type = agent_type.clone();
            self.store
                .query(move |conn| agents::active_for_type(conn, &agent_type))
                .await?
        };
        if let Some(existing) = holder {
            debug!(agent = %agent_type, holder = %existing.id, "singleton slot taken");
            return Err(Error::SingletonViolation {
                agent_type: agent_type.to_string(),
                agent_id: existing.id.to_string(),
            });
        }

        if let Err(e) = self
            .probe
            .snapshot()
            .and_then(|snapshot| self.config.limits.check(snapshot))
        {
            warn!(agent = %agent_type, task = %task_id.short(), error = %e, "spawn refused");
            self.record_spawn_failure(task_id, &e, Utc::now()).await?;
            return Err(e);
        }

        let now = Utc::now();
        let requested = agent_type.clone();
        let (instance, task) = self
            .store
            .transact(move |tx| {
                let task = tasks::require(tx, task_id)?;
                if task.agent_type != requested {
                    return Err(Error::Validation(format!(
                        "task {} is assigned to '{}', not '{}'",
                        task_id, task.agent_type, requested
                    )));
                }
                if task.status != TaskStatus::Pending {
                    return Err(Error::transition(
                        format!("task {}", task_id),
                        task.status,
                        TaskStatus::Spawned,
                    ));
                }
                let instance = agents::claim(tx, &requested, task_id, now)?;
                let task = tasks::set_status(tx, task_id, TaskStatus::Spawned, now)?;
                Ok((instance, task))
            })
            .await?;
        info!(
            agent = %agent_type,
            agent_id = %instance.id,
            task = %task_id.short(),
            "spawning agent"
        );

        match self.launch(&instance, &task).await {
            Ok(launched) => Ok(launched),
            Err(e) => {
                warn!(agent_id = %instance.id, error = %e, "launch failed");
                let agent_id = instance.id;
                self.store
                    .transact(move |tx| {
                        agents::set_status(tx, agent_id, AgentStatus::Crashed, None)?;
                        Ok(())
                    })
                    .await?;
                self.record_spawn_failure(task_id, &e, Utc::now()).await?;
                Err(e)
            }
        }
    }

    /// Waits until the instance acknowledges startup (or finishes), fails,
    /// or `limit` passes.
    pub async fn await_startup(&self, agent_id: AgentId, limit: Duration) -> Result<AgentInstance> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let instance = self
                .store
                .query(move |conn| agents::require(conn, agent_id))
                .await?;
            match instance.status {
                AgentStatus::Running | AgentStatus::Completed => return Ok(instance),
                AgentStatus::Crashed => {
                    return Err(Error::SpawnFailed(format!(
                        "agent {} crashed during startup",
                        agent_id
                    )))
                }
                _ if instance.awaiting_respawn() => {
                    return Err(Error::SpawnFailed(format!(
                        "agent {} crashed during startup; respawn scheduled",
                        agent_id
                    )))
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::StartupTimeout {
                    agent_id: agent_id.to_string(),
                    timeout: limit,
                });
            }
            tokio::time::sleep(STARTUP_POLL).await;
        }
    }

    /// Refreshes the instance's heartbeat; a stalled instance recovers.
    pub fn record_heartbeat(&self, agent_id: AgentId) -> Result<AgentInstance> {
        self.record_heartbeat_at(agent_id, Utc::now())
    }

    pub fn record_heartbeat_at(&self, agent_id: AgentId, now: DateTime<Utc>) -> Result<AgentInstance> {
        self.store.with_tx(|tx| {
            let current = agents::require(tx, agent_id)?;
            if current.awaiting_respawn() {
                return Err(Error::transition(
                    format!("agent {}", agent_id),
                    "awaiting respawn",
                    "heartbeat",
                ));
            }
            let instance = agents::heartbeat(tx, agent_id, now)?;
            let task = tasks::require(tx, instance.task_id)?;
            if task.status == TaskStatus::Spawned {
                tasks::set_status(tx, task.id, TaskStatus::Running, now)?;
            }
            Ok(instance)
        })
    }

    /// Marks the task completed and queues it for merge. Idempotent: an
    /// already completed task is simply (re)queued.
    pub fn complete_task(&self, task_id: TaskId) -> Result<Task> {
        let now = Utc::now();
        self.store.with_tx(|tx| complete_task_in(tx, task_id, now))
    }

    /// Fails the task on a worker's report and retires its agents.
    pub async fn fail_task(&self, task_id: TaskId, reason: &str) -> Result<Task> {
        let owned = reason.to_string();
        let task = self
            .store
            .transact(move |tx| tasks::fail(tx, task_id, &owned, Utc::now()))
            .await?;
        warn!(task = %task_id.short(), reason, "task failed");
        self.release_task(task_id).await?;
        Ok(task)
    }

    /// Records a crash and applies the escalation ladder: respawn with
    /// backoff below the restart cap, otherwise retire the instance, fail the
    /// task and file a bug report. New error signatures are always reported.
    pub async fn handle_crash(
        &self,
        agent_id: AgentId,
        classification: Classification,
        exit_code: Option<i32>,
    ) -> Result<CrashOutcome> {
        self.handle_crash_at(agent_id, classification, exit_code, Utc::now())
            .await
    }

    pub async fn handle_crash_at(
        &self,
        agent_id: AgentId,
        classification: Classification,
        exit_code: Option<i32>,
        now: DateTime<Utc>,
    ) -> Result<CrashOutcome> {
        self.crash(agent_id, None, classification, exit_code, now)
            .await?
            .ok_or_else(|| Error::NotFound(format!("agent instance {}", agent_id)))
    }

    /// Running instances with an old heartbeat become `stalled`; stalled ones
    /// that stay silent for a further threshold are killed and crashed.
    pub async fn check_stalls(&self, now: DateTime<Utc>) -> Result<StallReport> {
        let threshold = chrono::Duration::from_std(self.config.stall_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut report = StallReport::default();

        for instance in self.store.query(agents::non_terminal).await? {
            if instance.pid.is_none() {
                continue;
            }
            let age = instance.heartbeat_age(now);
            match instance.status {
                AgentStatus::Running if age > threshold => {
                    let agent_id = instance.id;
                    let marked = self
                        .store
                        .transact(move |tx| {
                            // Another sweep or the supervisor may have moved it since the snapshot.
                            let current = agents::require(tx, agent_id)?;
                            if current.status != AgentStatus::Running
                                || current.heartbeat_age(now) <= threshold
                            {
                                return Ok(false);
                            }
                            agents::set_status(tx, agent_id, AgentStatus::Stalled, None)?;
                            Ok(true)
                        })
                        .await?;
                    if !marked {
                        continue;
                    }
                    warn!(
                        agent_id = %instance.id,
                        agent = %instance.agent_type,
                        silent_secs = age.num_seconds(),
                        "agent stalled"
                    );
                    report.stalled.push(instance.id);
                }
                AgentStatus::Stalled if age > threshold * 2 => {
                    let classification = Classification::observed(
                        ErrorType::HeartbeatTimeout,
                        &format!("no heartbeat for {}s", age.num_seconds()),
                    );
                    if let Some(outcome) = self
                        .crash(instance.id, instance.pid, classification, None, now)
                        .await?
                    {
                        report.crashed.push(outcome);
                    }
                }
                _ => {}
            }
        }
        Ok(report)
    }

    /// Relaunches instances whose respawn backoff has elapsed.
    pub async fn process_due_respawns(&self, now: DateTime<Utc>) -> Result<Vec<AgentId>> {
        let mut relaunched = Vec::new();
        for instance in self
            .store
            .query(move |conn| agents::due_respawns(conn, now))
            .await?
        {
            let task_id = instance.task_id;
            let task = self
                .store
                .query(move |conn| tasks::require(conn, task_id))
                .await?;
            if !task.status.is_active() {
                debug!(agent_id = %instance.id, status = %task.status, "task no longer active; retiring");
                let agent_id = instance.id;
                self.store
                    .transact(move |tx| {
                        agents::set_status(tx, agent_id, AgentStatus::Crashed, None)
                    })
                    .await?;
                continue;
            }

            info!(
                agent_id = %instance.id,
                agent = %instance.agent_type,
                restart = instance.restart_count,
                "respawning agent"
            );
            match self.launch(&instance, &task).await {
                Ok(_) => relaunched.push(instance.id),
                Err(e) => {
                    warn!(agent_id = %instance.id, error = %e, "respawn launch failed");
                    let classification =
                        Classification::observed(ErrorType::SpawnFailure, &e.to_string());
                    self.crash(instance.id, None, classification, None, now)
                        .await?;
                }
            }
        }
        Ok(relaunched)
    }

    /// Retires every live instance bound to a task, killing its process.
    pub async fn release_task(&self, task_id: TaskId) -> Result<Vec<AgentId>> {
        let live: Vec<AgentInstance> = self
            .store
            .query(move |conn| agents::for_task(conn, task_id))
            .await?
            .into_iter()
            .filter(|i| !i.status.is_terminal())
            .collect();

        let mut released = Vec::with_capacity(live.len());
        for instance in live {
            let agent_id = instance.id;
            self.store
                .transact(move |tx| {
                    agents::set_status(tx, agent_id, AgentStatus::Completed, None)
                })
                .await?;
            self.terminate(instance.id, instance.pid).await;
            debug!(agent_id = %instance.id, task = %task_id.short(), "agent released");
            released.push(instance.id);
        }
        Ok(released)
    }

    /// A non-terminal instance whose process is gone without anyone having
    /// observed its exit.
    pub async fn reap_zombie(&self, agent_id: AgentId, pid: u32, now: DateTime<Utc>) -> Result<Option<CrashOutcome>> {
        let classification = Classification::observed(
            ErrorType::Unknown,
            &format!("process {} is no longer running", pid),
        );
        self.crash(agent_id, Some(pid), classification, None, now)
            .await
    }

    /// Whether this manager holds a live handle for the instance.
    pub fn is_supervised(&self, agent_id: AgentId) -> bool {
        self.handles
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(&agent_id)
    }

    pub fn pid_alive(&self, pid: u32) -> bool {
        self.launcher.pid_alive(pid)
    }

    async fn launch(&self, instance: &AgentInstance, task: &Task) -> Result<AgentInstance> {
        let spec = LaunchSpec {
            agent_id: instance.id,
            agent_type: instance.agent_type.clone(),
            task_id: instance.task_id,
            orchestrator_id: self.config.orchestrator_id.clone(),
            timeout_seconds: self.config.agent_timeout.as_secs(),
            workdir: task.worktree_path.clone(),
        };
        let handle = self.launcher.launch(&spec).await?;
        let pid = handle.pid();

        let (agent_id, task_id) = (instance.id, task.id);
        let launched = self
            .store
            .transact(move |tx| {
                agents::set_launched(tx, agent_id, pid, Utc::now())?;
                tasks::clear_retry(tx, task_id)?;
                agents::require(tx, agent_id)
            })
            .await;
        let launched = match launched {
            Ok(launched) => launched,
            Err(e) => {
                let _ = handle.kill().await;
                return Err(e);
            }
        };

        self.track(agent_id, Arc::clone(&handle));
        let manager = self.clone();
        tokio::spawn(async move {
            manager.supervise(agent_id, handle).await;
        });
        Ok(launched)
    }

    async fn supervise(self, agent_id: AgentId, handle: Arc<dyn ProcessHandle>) {
        let pid = handle.pid();
        if let Err(e) = self.supervise_process(agent_id, &handle).await {
            error!(agent_id = %agent_id, pid, error = %e, "supervision failed");
        }
        self.forget(agent_id, pid);
    }

    async fn supervise_process(&self, agent_id: AgentId, handle: &Arc<dyn ProcessHandle>) -> Result<()> {
        let pid = handle.pid();
        let startup = self.config.startup_timeout;

        match timeout(startup, handle.acknowledgment()).await {
            Ok(Ok(ack)) if ack.success => self.on_acknowledged(agent_id, pid).await?,
            Ok(Ok(ack)) => {
                let reason = ack
                    .error
                    .unwrap_or_else(|| "worker reported startup failure".to_string());
                handle.kill().await?;
                let report = handle.wait().await?;
                let mut classification = self.classifier.classify(report.code, &report.stderr_tail);
                if classification.error_type == ErrorType::Unknown {
                    classification = Classification::observed(ErrorType::SpawnFailure, &reason);
                }
                self.crash(agent_id, Some(pid), classification, report.code, Utc::now())
                    .await?;
                return Ok(());
            }
            Ok(Err(e)) => {
                debug!(agent_id = %agent_id, error = %e, "no acknowledgment, waiting for exit");
                match timeout(startup, handle.wait()).await {
                    Ok(report) => return self.on_exit(agent_id, pid, report?).await,
                    Err(_) => {
                        handle.kill().await?;
                        let report = handle.wait().await?;
                        let classification =
                            Classification::observed(ErrorType::SpawnFailure, &e.to_string());
                        self.crash(agent_id, Some(pid), classification, report.code, Utc::now())
                            .await?;
                        return Ok(());
                    }
                }
            }
            Err(_) => {
                warn!(agent_id = %agent_id, pid, "startup acknowledgment timed out");
                handle.kill().await?;
                let report = handle.wait().await?;
                let classification = Classification::observed(
                    ErrorType::StartupTimeout,
                    &format!("no startup acknowledgment within {}s", startup.as_secs()),
                );
                self.crash(agent_id, Some(pid), classification, report.code, Utc::now())
                    .await?;
                return Ok(());
            }
        }

        let report = match timeout(self.config.agent_timeout, handle.wait()).await {
            Ok(report) => report?,
            Err(_) => {
                warn!(agent_id = %agent_id, pid, "agent exceeded its run time");
                handle.kill().await?;
                let report = handle.wait().await?;
                let classification = Classification::observed(
                    ErrorType::Timeout,
                    &format!("exceeded run time of {}s", self.config.agent_timeout.as_secs()),
                );
                self.crash(agent_id, Some(pid), classification, report.code, Utc::now())
                    .await?;
                return Ok(());
            }
        };
        self.on_exit(agent_id, pid, report).await
    }

    async fn on_acknowledged(&self, agent_id: AgentId, pid: u32) -> Result<()> {
        let now = Utc::now();
        self.store
            .transact(move |tx| {
                let instance = agents::require(tx, agent_id)?;
                if instance.pid != Some(pid) || instance.status != AgentStatus::Spawned {
                    return Ok(());
                }
                agents::acknowledge(tx, agent_id, now)?;
                let task = tasks::require(tx, instance.task_id)?;
                if task.status == TaskStatus::Spawned {
                    tasks::set_status(tx, task.id, TaskStatus::Running, now)?;
                }
                Ok(())
            })
            .await?;
        info!(agent_id = %agent_id, pid, "agent running");
        Ok(())
    }

    async fn on_exit(&self, agent_id: AgentId, pid: u32, report: ExitReport) -> Result<()> {
        if !report.success() {
            let classification = self.classifier.classify(report.code, &report.stderr_tail);
            self.crash(agent_id, Some(pid), classification, report.code, Utc::now())
                .await?;
            return Ok(());
        }

        let now = Utc::now();
        let completed = self
            .store
            .transact(move |tx| {
                let instance = agents::require(tx, agent_id)?;
                if instance.pid != Some(pid) || instance.status.is_terminal() {
                    return Ok(false);
                }
                agents::set_status(tx, agent_id, AgentStatus::Completed, Some(0))?;
                complete_task_in(tx, instance.task_id, now)?;
                Ok(true)
            })
            .await?;
        if completed {
            info!(agent_id = %agent_id, pid, "agent completed");
        } else {
            debug!(agent_id = %agent_id, pid, "exit of superseded process ignored");
        }
        Ok(())
    }

    /// Shared crash path. With `expected_pid`, the crash is ignored unless
    /// that pid is still the instance's current process.
    async fn crash(
        &self,
        agent_id: AgentId,
        expected_pid: Option<u32>,
        classification: Classification,
        exit_code: Option<i32>,
        now: DateTime<Utc>,
    ) -> Result<Option<CrashOutcome>> {
        let error_type = classification.error_type;
        let manager = self.clone();
        let outcome = self
            .store
            .transact(move |tx| {
                manager.crash_in(tx, agent_id, expected_pid, &classification, exit_code, now)
            })
            .await?;
        let Some(outcome) = outcome else {
            debug!(agent_id = %agent_id, ?expected_pid, "crash of superseded process ignored");
            return Ok(None);
        };

        self.terminate(agent_id, outcome.pid).await;

        match (&outcome.respawn_at, &outcome.bug) {
            (Some(at), None) => info!(
                agent_id = %agent_id,
                error_type = %error_type,
                restart = outcome.crash.restart_count,
                respawn_at = %at,
                "agent crashed; respawn scheduled"
            ),
            (Some(at), Some(bug)) => warn!(
                agent_id = %agent_id,
                error_type = %error_type,
                restart = outcome.crash.restart_count,
                respawn_at = %at,
                bug = bug.id,
                signature = %bug.signature,
                "agent crashed with new error signature; bug reported"
            ),
            (None, _) => error!(
                agent_id = %agent_id,
                task = %outcome.task_id.short(),
                error_type = %error_type,
                restart = outcome.crash.restart_count,
                "agent retired after crash; bug reported"
            ),
        }
        Ok(Some(outcome))
    }

    fn crash_in(
        &self,
        tx: &Connection,
        agent_id: AgentId,
        expected_pid: Option<u32>,
        classification: &Classification,
        exit_code: Option<i32>,
        now: DateTime<Utc>,
    ) -> Result<Option<CrashOutcome>> {
        let instance = agents::require(tx, agent_id)?;
        if let Some(pid) = expected_pid {
            if instance.pid != Some(pid) || instance.status.is_terminal() {
                return Ok(None);
            }
        }
        if instance.status.is_terminal() {
            return Err(Error::transition(
                format!("agent {}", agent_id),
                instance.status,
                AgentStatus::Crashed,
            ));
        }

        let task = tasks::require(tx, instance.task_id)?;
        let new_signature = !records::signature_seen(tx, &classification.signature)?;
        let mut decision =
            CrashDecision::decide(instance.restart_count, self.config.max_restarts, new_signature);
        if !task.status.is_active() {
            decision.respawn = false;
            decision.report = new_signature;
        }

        let crash = records::insert_crash(
            tx,
            &CrashRecord {
                id: 0,
                agent_instance_id: agent_id,
                task_id: task.id,
                error_type: classification.error_type,
                error_message: classification.message.clone(),
                stack_trace: classification.stack_trace.clone(),
                signature: classification.signature.clone(),
                restart_count: decision.restart_count,
                respawned: decision.respawn,
                bug_reported: decision.report,
                created_at: now,
            },
        )?;

        let respawn_at = if decision.respawn {
            let at = escalation::backoff_until(now, self.config.backoff_base, decision.restart_count);
            agents::schedule_respawn(tx, agent_id, decision.restart_count, at, exit_code)?;
            if task.status == TaskStatus::Running {
                tasks::set_status(tx, task.id, TaskStatus::Spawned, now)?;
            }
            Some(at)
        } else {
            agents::set_restart_count(tx, agent_id, decision.restart_count)?;
            agents::set_status(tx, agent_id, AgentStatus::Crashed, exit_code)?;
            if task.status.is_active() {
                let reason = format!(
                    "agent crashed {} time(s): {}",
                    decision.restart_count, classification.message
                );
                tasks::fail(tx, task.id, &reason, now)?;
            }
            None
        };

        let bug = if decision.report {
            let bug = records::insert_bug(
                tx,
                &escalation::bug_report(
                    task.id,
                    Some(agent_id),
                    classification,
                    &self.config.remediation_agent,
                    now,
                ),
            )?;
            messages::insert(tx, &self.bug_message(&bug), now)?;
            Some(bug)
        } else {
            None
        };

        Ok(Some(CrashOutcome {
            agent_id,
            task_id: task.id,
            pid: instance.pid,
            crash,
            respawn_at,
            bug,
        }))
    }

    /// Counts a transient spawn failure against the task: backoff below the
    /// attempt cap, otherwise fail the task and file a bug.
    pub async fn record_spawn_failure(&self, task_id: TaskId, err: &Error, now: DateTime<Utc>) -> Result<()> {
        let reason = err.to_string();
        let manager = self.clone();
        let owned = reason.clone();
        let failed = self
            .store
            .transact(move |tx| manager.spawn_failure_in(tx, task_id, &owned, now))
            .await?;
        if failed {
            error!(task = %task_id.short(), error = %reason, "spawn attempts exhausted; task failed");
        }
        Ok(())
    }

    fn spawn_failure_in(
        &self,
        tx: &Connection,
        task_id: TaskId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let task = tasks::require(tx, task_id)?;
        if task.status.is_terminal() {
            return Ok(false);
        }
        let attempts = task.spawn_attempts + 1;
        if attempts >= self.config.max_spawn_attempts {
            tasks::fail(
                tx,
                task_id,
                &format!("spawn failed {} time(s): {}", attempts, reason),
                now,
            )?;
            let bug = records::insert_bug(
                tx,
                &escalation::spawn_failure_report(
                    task_id,
                    reason,
                    &self.config.remediation_agent,
                    now,
                ),
            )?;
            messages::insert(tx, &self.bug_message(&bug), now)?;
            Ok(true)
        } else {
            let next = escalation::backoff_until(now, self.config.backoff_base, attempts);
            tasks::defer(tx, task_id, attempts, next, reason, now)?;
            Ok(false)
        }
    }

    fn bug_message(&self, bug: &BugRecord) -> NewMessage {
        NewMessage::new(
            self.config.orchestrator_id.clone(),
            Recipient::Agent(bug.assigned_agent.clone()),
            "bug_report",
        )
        .payload(json!({
            "bug_id": bug.id,
            "task_id": bug.task_id,
            "agent_instance_id": bug.agent_instance_id,
            "error_type": bug.error_type,
            "signature": bug.signature,
            "root_cause": bug.root_cause,
            "stack_trace": bug.stack_trace,
        }))
        .priority(PRIORITY_HIGHEST)
    }

    /// Kills the instance's process if it is still running.
    async fn terminate(&self, agent_id: AgentId, pid: Option<u32>) {
        let handle = self
            .handles
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&agent_id)
            .cloned();
        match (handle, pid) {
            (Some(handle), _) if handle.is_alive() => {
                if let Err(e) = handle.kill().await {
                    warn!(agent_id = %agent_id, error = %e, "kill failed");
                }
            }
            (None, Some(pid)) if self.launcher.pid_alive(pid) => self.launcher.kill_pid(pid),
            _ => {}
        }
    }

    fn track(&self, agent_id: AgentId, handle: Arc<dyn ProcessHandle>) {
        self.handles
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(agent_id, handle);
    }

    /// Drops the handle unless it has already been replaced by a relaunch.
    fn forget(&self, agent_id: AgentId, pid: u32) {
        let mut handles = self.handles.lock().unwrap_or_else(|p| p.into_inner());
        if handles.get(&agent_id).map(|h| h.pid()) == Some(pid) {
            handles.remove(&agent_id);
        }
    }
}

fn complete_task_in(tx: &Connection, task_id: TaskId, now: DateTime<Utc>) -> Result<Task> {
    let task = tasks::require(tx, task_id)?;
    let task = match task.status {
        TaskStatus::Spawned | TaskStatus::Running => {
            tasks::set_status(tx, task_id, TaskStatus::Completed, now)?
        }
        TaskStatus::Completed => task,
        status => {
            return Err(Error::transition(
                format!("task {}", task_id),
                status,
                TaskStatus::Completed,
            ))
        }
    };
    merge_queue::enqueue(tx, task_id, now)?;
    Ok(task)
}
