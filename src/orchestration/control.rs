//! The orchestrator control loop.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::lifecycle::LifecycleManager;
use super::merge::{MergeCoordinator, MergeOutcome};
use crate::bus::MessageBus;
use crate::config::Config;
use crate::core::{AgentId, AgentType, Message, Recipient, TaskId};
use crate::store::{records, tasks, Store};
use crate::util::blocking;
use crate::{Error, Result};

/// Messages handled per tick, for broker routing and the inbox alike.
const BATCH: usize = 100;

#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Identifies this loop in the tick table.
    pub instance_id: String,
    pub tick_interval: Duration,
}

impl ControlConfig {
    pub fn from_config(config: &Config, instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            tick_interval: config.tick_interval(),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub routed: usize,
    pub unroutable: usize,
    pub inbox_handled: usize,
    pub inbox_failed: usize,
    pub respawned: Vec<AgentId>,
    pub stalled: Vec<AgentId>,
    pub crashed: Vec<AgentId>,
    pub spawned: Vec<(TaskId, AgentId)>,
    pub merge: Option<MergeOutcome>,
}

pub struct ControlLoop {
    store: Store,
    bus: MessageBus,
    lifecycle: LifecycleManager,
    merges: Option<MergeCoordinator>,
    config: ControlConfig,
}

impl ControlLoop {
    pub fn new(store: Store, lifecycle: LifecycleManager, config: ControlConfig) -> Self {
        Self {
            bus: MessageBus::new(store.clone()),
            store,
            lifecycle,
            merges: None,
            config,
        }
    }

    /// Provision worktrees and drive the merge queue.
    pub fn with_merges(mut self, merges: MergeCoordinator) -> Self {
        self.merges = Some(merges);
        self
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub async fn tick(&self) -> Result<TickReport> {
        let now = Utc::now();
        let mut report = TickReport::default();

        let instance_id = self.config.instance_id.clone();
        self.store
            .transact(move |tx| records::record_tick(tx, &instance_id, now))
            .await?;

        let routed = self
            .bus_call(|bus| bus.route_broker_messages(BATCH))
            .await?;
        report.routed = routed.routed;
        report.unroutable = routed.failed;

        self.drain_inbox(&mut report).await?;

        report.respawned = self.lifecycle.process_due_respawns(now).await?;

        let stalls = self.lifecycle.check_stalls(now).await?;
        report.stalled = stalls.stalled;
        report.crashed = stalls.crashed.iter().map(|c| c.agent_id).collect();

        self.spawn_ready(now, &mut report).await?;

        if let Some(merges) = &self.merges {
            match merges.advance().await {
                Ok(outcome) => report.merge = outcome,
                Err(e) => warn!(error = %e, "merge queue step failed"),
            }
        }

        debug!(?report, "tick");
        Ok(report)
    }

    /// Ticks every `tick_interval` until `cancel` fires. Tick errors are
    /// logged and the loop carries on.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            instance = %self.config.instance_id,
            interval = ?self.config.tick_interval,
            "control loop started"
        );
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(instance = %self.config.instance_id, "control loop stopped");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, code = e.code(), "tick failed");
                    }
                }
            }
        }
    }

    async fn drain_inbox(&self, report: &mut TickReport) -> Result<()> {
        let inbox = Recipient::Agent(AgentType::Orchestrator);
        let claimed = self
            .bus_call(move |bus| bus.poll(&inbox, None, BATCH))
            .await?;
        for message in claimed {
            let started = Instant::now();
            let id = message.id;
            match self.handle_message(&message).await {
                Ok(()) => {
                    let elapsed = started.elapsed().as_millis() as u64;
                    self.bus_call(move |bus| bus.mark_completed(id, elapsed))
                        .await?;
                    report.inbox_handled += 1;
                }
                Err(e) => {
                    warn!(id = %id, kind = %message.kind, error = %e, "inbox message failed");
                    let reason = e.to_string();
                    self.bus_call(move |bus| bus.mark_failed(id, &reason))
                        .await?;
                    report.inbox_failed += 1;
                }
            }
        }
        Ok(())
    }

    async fn handle_message(&self, message: &Message) -> Result<()> {
        match message.kind.as_str() {
            "task_completed" => {
                let task_id: TaskId = payload_field(message, "task_id")?;
                let lifecycle = self.lifecycle.clone();
                blocking(move || lifecycle.complete_task(task_id)).await?;
                info!(task = %task_id.short(), sender = %message.sender, "task reported complete");
            }
            "task_failed" => {
                let task_id: TaskId = payload_field(message, "task_id")?;
                let reason = message
                    .payload
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .unwrap_or("reported failed by worker");
                self.lifecycle.fail_task(task_id, reason).await?;
            }
            "heartbeat" => {
                let agent_id: AgentId = payload_field(message, "agent_id")?;
                let lifecycle = self.lifecycle.clone();
                blocking(move || lifecycle.record_heartbeat(agent_id)).await?;
            }
            other => {
                return Err(Error::InvalidPayload(format!(
                    "orchestrator does not handle '{}' messages",
                    other
                )))
            }
        }
        Ok(())
    }

    /// Starts at most one task per agent type, oldest first.
    async fn spawn_ready(&self, now: DateTime<Utc>, report: &mut TickReport) -> Result<()> {
        let mut attempted: HashSet<AgentType> = HashSet::new();
        for task in self.store.query(move |conn| tasks::ready(conn, now)).await? {
            if !attempted.insert(task.agent_type.clone()) {
                continue;
            }

            if let Some(merges) = &self.merges {
                if let Err(e) = merges.prepare_worktree(task.id).await {
                    warn!(task = %task.id.short(), error = %e, "worktree provisioning failed");
                    self.lifecycle
                        .record_spawn_failure(task.id, &e, Utc::now())
                        .await?;
                    continue;
                }
            }

            match self.lifecycle.try_spawn(&task.agent_type, task.id).await {
                Ok(instance) => report.spawned.push((task.id, instance.id)),
                Err(Error::SingletonViolation { agent_id, .. }) => {
                    debug!(task = %task.id.short(), agent = %task.agent_type, holder = %agent_id, "agent type busy");
                }
                Err(e) => {
                    debug!(task = %task.id.short(), error = %e, code = e.code(), "spawn deferred");
                }
            }
        }
        Ok(())
    }

    async fn bus_call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&MessageBus) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let bus = self.bus.clone();
        blocking(move || f(&bus)).await
    }
}

fn payload_field<T: FromStr>(message: &Message, field: &str) -> Result<T> {
    message
        .payload
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::InvalidPayload(format!("'{}' missing from {}", field, message.kind)))?
        .parse()
        .map_err(|_| Error::InvalidPayload(format!("'{}' is not a valid id", field)))
}
