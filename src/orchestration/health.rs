//! Health monitoring.
//!
//! The `HealthMonitor` sweeps on its own interval, independent of the control
//! loop cadence. Each sweep:
//! - reaps zombies: live instances whose process is gone unobserved
//! - checks heartbeat age, stalling or crashing silent agents
//! - checks the age of the control loop's last tick, requesting a restart once
//!   per freeze episode and raising a critical alert if the restart does not
//!   clear the freeze within one further interval
//! - fails merges stuck in an active state
//!
//! Every sweep is recorded as a [`HealthCheck`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::lifecycle::{CrashOutcome, LifecycleManager};
use super::merge::MergeCoordinator;
use crate::config::Config;
use crate::core::{AgentId, AgentStatus, AlertLevel, HealthCheck, HealthStatus, TaskId};
use crate::store::{agents, records, Store};
use crate::Result;

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// Control loop silence after which it counts as frozen.
    pub freeze_threshold: Duration,
    pub merge_stale_threshold: Duration,
}

impl HealthConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.health_interval(),
            freeze_threshold: config.freeze_threshold(),
            merge_stale_threshold: config.merge_stale_threshold(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Asks the runtime to restart the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartRequest {
    pub last_tick_age_secs: i64,
    pub requested_at: DateTime<Utc>,
}

/// Events emitted during a sweep.
#[derive(Debug, Clone)]
pub enum HealthEvent {
    ZombieReaped { agent_id: AgentId, pid: u32 },
    AgentStalled { agent_id: AgentId },
    AgentCrashed(CrashOutcome),
    LoopFrozen { last_tick_age_secs: i64 },
    RestartRequested(RestartRequest),
    CriticalAlert { message: String },
    MergeFailed { task_id: TaskId },
    Checked(HealthCheck),
}

/// In-memory state of the current control-loop freeze.
#[derive(Debug, Default)]
struct FreezeEpisode {
    restart_requested_at: Option<DateTime<Utc>>,
    alerted: bool,
}

pub struct HealthMonitor {
    store: Store,
    lifecycle: LifecycleManager,
    merges: Option<MergeCoordinator>,
    config: HealthConfig,
    restart_tx: Option<mpsc::Sender<RestartRequest>>,
    event_tx: Option<mpsc::UnboundedSender<HealthEvent>>,
    episode: FreezeEpisode,
}

impl HealthMonitor {
    pub fn new(store: Store, lifecycle: LifecycleManager, config: HealthConfig) -> Self {
        Self {
            store,
            lifecycle,
            merges: None,
            config,
            restart_tx: None,
            event_tx: None,
            episode: FreezeEpisode::default(),
        }
    }

    pub fn with_merges(mut self, merges: MergeCoordinator) -> Self {
        self.merges = Some(merges);
        self
    }

    pub fn with_restart_channel(mut self, tx: mpsc::Sender<RestartRequest>) -> Self {
        self.restart_tx = Some(tx);
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<HealthEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Runs one sweep and records it.
    pub async fn check(&mut self, now: DateTime<Utc>) -> Result<HealthCheck> {
        let mut actions = Vec::new();
        let mut degraded = false;

        for instance in self.store.query(agents::non_terminal).await? {
            let Some(pid) = instance.pid else { continue };
            // The supervisor observes the exit of processes it owns.
            if self.lifecycle.is_supervised(instance.id) || self.lifecycle.pid_alive(pid) {
                continue;
            }
            if let Some(outcome) = self.lifecycle.reap_zombie(instance.id, pid, now).await? {
                actions.push(format!("reaped zombie agent {} (pid {})", instance.id.short(), pid));
                degraded = true;
                self.emit(HealthEvent::ZombieReaped {
                    agent_id: instance.id,
                    pid,
                });
                self.emit(HealthEvent::AgentCrashed(outcome));
            }
        }

        let stalls = self.lifecycle.check_stalls(now).await?;
        for agent_id in stalls.stalled {
            actions.push(format!("marked agent {} stalled", agent_id.short()));
            degraded = true;
            self.emit(HealthEvent::AgentStalled { agent_id });
        }
        for outcome in stalls.crashed {
            actions.push(format!(
                "crashed silent agent {} ({})",
                outcome.agent_id.short(),
                if outcome.escalated() { "retired" } else { "respawn scheduled" }
            ));
            degraded = true;
            self.emit(HealthEvent::AgentCrashed(outcome));
        }

        let last_tick = self.store.query(records::last_tick).await?;
        let last_tick_age = last_tick.map(|t| now.signed_duration_since(t).num_seconds());
        let frozen = self.check_freeze(now, last_tick_age, &mut actions).await?;

        if let Some(merges) = &self.merges {
            let stale = merges
                .stale_active_merges(self.config.merge_stale_threshold, now)
                .await?;
            for entry in stale {
                let reason = format!("merge stuck in {} since {}", entry.state, entry.updated_at);
                merges.fail_merge(entry.task_id, &reason).await?;
                actions.push(format!("failed stale merge of task {}", entry.task_id.short()));
                degraded = true;
                self.emit(HealthEvent::MergeFailed {
                    task_id: entry.task_id,
                });
            }
        }

        let status = if frozen {
            HealthStatus::Critical
        } else if degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        let check = self
            .store
            .transact(move |tx| {
                let active_agents = agents::non_terminal(tx)?.len() as u32;
                let crashed_agents = agents::count_by_status(tx, AgentStatus::Crashed)?;
                records::insert_health_check(
                    tx,
                    &HealthCheck {
                        id: 0,
                        timestamp: now,
                        status,
                        active_agents,
                        crashed_agents,
                        last_tick_age_seconds: last_tick_age,
                        actions_taken: actions,
                    },
                )
            })
            .await?;

        match check.status {
            HealthStatus::Healthy => debug!(active = check.active_agents, "health: healthy"),
            HealthStatus::Degraded => warn!(
                active = check.active_agents,
                crashed = check.crashed_agents,
                actions = ?check.actions_taken,
                "health: degraded"
            ),
            HealthStatus::Critical => error!(
                last_tick_age = ?check.last_tick_age_seconds,
                actions = ?check.actions_taken,
                "health: critical"
            ),
        }
        self.emit(HealthEvent::Checked(check.clone()));
        Ok(check)
    }

    /// Level 3: one restart per freeze episode, then one critical alert if
    /// the loop is still frozen an interval later. Returns whether frozen.
    async fn check_freeze(
        &mut self,
        now: DateTime<Utc>,
        last_tick_age: Option<i64>,
        actions: &mut Vec<String>,
    ) -> Result<bool> {
        let threshold = self.config.freeze_threshold.as_secs() as i64;
        let age = match last_tick_age {
            Some(age) if age > threshold => age,
            _ => {
                if self.episode.restart_requested_at.is_some() {
                    info!("control loop freeze cleared");
                }
                self.episode = FreezeEpisode::default();
                return Ok(false);
            }
        };
        self.emit(HealthEvent::LoopFrozen {
            last_tick_age_secs: age,
        });

        match self.episode.restart_requested_at {
            None => {
                let request = RestartRequest {
                    last_tick_age_secs: age,
                    requested_at: now,
                };
                self.episode.restart_requested_at = Some(now);
                error!(last_tick_age = age, "control loop frozen; requesting restart");
                if let Some(tx) = &self.restart_tx {
                    if let Err(e) = tx.try_send(request) {
                        warn!(error = %e, "restart request not delivered");
                    }
                }
                actions.push(format!("requested orchestrator restart (last tick {}s ago)", age));
                self.emit(HealthEvent::RestartRequested(request));
            }
            Some(requested_at) if !self.episode.alerted => {
                let waited = now.signed_duration_since(requested_at).num_seconds();
                if waited >= self.config.interval.as_secs() as i64 {
                    let message = format!(
                        "control loop still frozen {}s after restart (last tick {}s ago)",
                        waited, age
                    );
                    let text = message.clone();
                    self.store
                        .transact(move |tx| {
                            records::insert_alert(tx, AlertLevel::Critical, &text, now)
                        })
                        .await?;
                    self.episode.alerted = true;
                    error!(%message, "critical alert raised");
                    actions.push("raised critical alert".to_string());
                    self.emit(HealthEvent::CriticalAlert { message });
                }
            }
            Some(_) => {}
        }
        Ok(true)
    }

    fn emit(&self, event: HealthEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Sweeps every `interval` until `cancel` fires.
    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        debug!(interval = ?self.config.interval, "HealthMonitor::spawn");
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("HealthMonitor cancelled");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = self.check(Utc::now()).await {
                            error!(error = %e, "health sweep failed");
                        }
                    }
                }
            }
        })
    }
}
