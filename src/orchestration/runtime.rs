//! Orchestrator runtime: the control loop and the health monitor as two
//! independent periodic tasks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::control::{ControlConfig, ControlLoop};
use super::health::{HealthConfig, HealthEvent, HealthMonitor};
use super::lifecycle::{LifecycleConfig, LifecycleManager};
use super::merge::{MergeConfig, MergeCoordinator};
use crate::agent::AgentCommand;
use crate::config::Config;
use crate::git::GitOps;
use crate::process::CommandLauncher;
use crate::store::Store;
use crate::Result;

/// Time a cancelled control loop gets to finish its tick before it is aborted.
const RESTART_GRACE: Duration = Duration::from_secs(5);

/// Handle to a running periodic task, used for shutdown.
pub struct ActorHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl ActorHandle {
    pub fn new(cancel: CancellationToken, join: JoinHandle<()>) -> Self {
        Self { cancel, join }
    }

    /// Signal the task to shut down gracefully.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Cancels and waits up to `grace`, then aborts.
    pub async fn stop(mut self, grace: Duration) {
        self.shutdown();
        if tokio::time::timeout(grace, &mut self.join).await.is_err() {
            warn!(?grace, "task ignored cancellation; aborting");
            self.join.abort();
        }
    }
}

pub struct Orchestrator {
    store: Store,
    lifecycle: LifecycleManager,
    merges: Option<MergeCoordinator>,
    control: ControlConfig,
    health: HealthConfig,
    restart_grace: Duration,
    events: Option<mpsc::UnboundedSender<HealthEvent>>,
}

impl Orchestrator {
    pub fn new(
        store: Store,
        lifecycle: LifecycleManager,
        control: ControlConfig,
        health: HealthConfig,
    ) -> Self {
        Self {
            store,
            lifecycle,
            merges: None,
            control,
            health,
            restart_grace: RESTART_GRACE,
            events: None,
        }
    }

    /// Wires the full stack from configuration: store, agent launcher and
    /// the git repository.
    pub fn from_config(config: &Config, instance_id: &str) -> Result<Self> {
        let db_path = config.db_path()?;
        let store = Store::open(&db_path)?;
        let launcher = CommandLauncher::new(AgentCommand::from_config(config), Some(db_path));
        let lifecycle = LifecycleManager::new(
            store.clone(),
            Arc::new(launcher),
            LifecycleConfig::from_config(config, instance_id),
        );
        let git = GitOps::new(&config.repo_path()?)?.with_timeout(config.git_timeout());
        let merges = MergeCoordinator::new(store.clone(), git, MergeConfig::from_config(config)?)
            .with_lifecycle(lifecycle.clone());

        Ok(Self::new(
            store,
            lifecycle,
            ControlConfig::from_config(config, instance_id),
            HealthConfig::from_config(config),
        )
        .with_merges(merges))
    }

    pub fn with_merges(mut self, merges: MergeCoordinator) -> Self {
        self.merges = Some(merges);
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<HealthEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn with_restart_grace(mut self, grace: Duration) -> Self {
        self.restart_grace = grace;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn merges(&self) -> Option<&MergeCoordinator> {
        self.merges.as_ref()
    }

    /// Runs until `cancel` fires, restarting the control loop whenever the
    /// health monitor asks for it.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let (restart_tx, mut restart_rx) = mpsc::channel(4);

        let mut monitor = HealthMonitor::new(self.store.clone(), self.lifecycle.clone(), self.health.clone())
            .with_restart_channel(restart_tx);
        if let Some(merges) = &self.merges {
            monitor = monitor.with_merges(merges.clone());
        }
        if let Some(events) = &self.events {
            monitor = monitor.with_events(events.clone());
        }
        let health_cancel = cancel.child_token();
        let health = ActorHandle::new(health_cancel.clone(), monitor.spawn(health_cancel));

        let mut control = self.spawn_control(&cancel);
        let mut restarts = 0u32;
        info!(instance = %self.control.instance_id, "orchestrator running");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(request) = restart_rx.recv() => {
                    restarts += 1;
                    warn!(
                        last_tick_age = request.last_tick_age_secs,
                        restarts,
                        "restarting control loop"
                    );
                    control.stop(self.restart_grace).await;
                    control = self.spawn_control(&cancel);
                }
            }
        }

        futures::future::join(
            control.stop(self.restart_grace),
            health.stop(self.restart_grace),
        )
        .await;
        info!(restarts, "orchestrator stopped");
        Ok(())
    }

    fn spawn_control(&self, parent: &CancellationToken) -> ActorHandle {
        let mut control = ControlLoop::new(self.store.clone(), self.lifecycle.clone(), self.control.clone());
        if let Some(merges) = &self.merges {
            control = control.with_merges(merges.clone());
        }
        let token = parent.child_token();
        let run_token = token.clone();
        debug!("spawning control loop");
        let join = tokio::spawn(async move {
            control.run(run_token).await;
        });
        ActorHandle::new(token, join)
    }
}
