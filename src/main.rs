use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use foreman::agent::AgentCommand;
use foreman::bus::MessageBus;
use foreman::commands::{self, to_response};
use foreman::config::Config;
use foreman::core::{
    AgentId, AgentType, MergeStrategy, MessageId, NewMessage, NewTask, Recipient, TaskId,
    TaskKind,
};
use foreman::log::LogTarget;
use foreman::orchestration::{
    HealthConfig, HealthMonitor, LifecycleConfig, LifecycleManager, MergeOutcome, Orchestrator,
};
use foreman::process::CommandLauncher;
use foreman::store::{agents, merge_queue, records, tasks, Store};
use foreman::{Error, Result};

const DEFAULT_INSTANCE: &str = "orchestrator";

/// Foreman - multi-agent task orchestrator
#[derive(Parser, Debug)]
#[command(name = "foreman")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    FOREMAN_DEBUG=1     Enable debug logging (alternative to --debug)\n    FOREMAN_DB          Store location\n    RESOLVE_CONFLICTS   Let recursive merges proceed past dry-run conflicts")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (default: ~/.foreman/foreman.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the control loop and health monitor until interrupted
    Run {
        #[arg(long, default_value = DEFAULT_INSTANCE)]
        instance_id: String,
    },

    /// Queue a new task
    AddTask {
        /// priority, spec or refactor
        #[arg(long)]
        kind: TaskKind,

        title: String,

        /// Override the agent type derived from the task kind
        #[arg(long)]
        agent: Option<AgentType>,
    },

    /// Spawn a worker for a task and wait for its startup acknowledgment
    SpawnAgentSession {
        #[arg(long)]
        agent_type: AgentType,

        #[arg(long)]
        task_id: TaskId,

        /// Startup acknowledgment timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Merge a completed task into the integration branch
    MergeCompletedWork {
        #[arg(long)]
        task_id: TaskId,

        /// recursive, ours, theirs or abort
        #[arg(long, default_value = "recursive")]
        strategy: MergeStrategy,

        #[arg(long)]
        resolve_conflicts: Option<bool>,
    },

    /// Record a heartbeat for an agent instance
    Heartbeat {
        #[arg(long)]
        agent_id: AgentId,
    },

    /// Send a message on the bus
    Send {
        #[arg(long)]
        from: String,

        /// Agent type, or "broker" to route by --suggest
        #[arg(long)]
        to: Recipient,

        #[arg(long)]
        kind: String,

        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,

        /// 1 (highest) to 9 (lowest)
        #[arg(long, default_value_t = 5)]
        priority: u8,

        #[arg(long)]
        suggest: Option<AgentType>,
    },

    /// Claim pending messages for a recipient, oldest first
    Poll {
        recipient: Recipient,

        #[arg(long)]
        kind: Option<String>,

        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Finalize a claimed message
    Finish {
        id: MessageId,

        /// Mark the message failed with this error
        #[arg(long)]
        error: Option<String>,

        #[arg(long, default_value_t = 0)]
        duration_ms: u64,
    },

    /// Show tasks, agents, the merge queue and the last tick
    Status,

    /// Show recent health checks, alerts and bug reports
    Health {
        /// Run a health sweep now
        #[arg(long)]
        check: bool,

        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

fn main() {
    let cli = Cli::parse();

    let target = match (&cli.command, Config::log_path()) {
        (Command::Run { .. }, Ok(path)) => LogTarget::File(path),
        _ => LogTarget::Stderr,
    };
    foreman::log::init_with_debug(cli.debug, target);

    let response = match load_config(cli.config.as_deref()) {
        Ok(config) => execute(cli.command, &config),
        Err(e) => Some(to_response::<()>(Err(e))),
    };
    if let Some(body) = response {
        println!(
            "{}",
            serde_json::to_string_pretty(&body).unwrap_or_else(|_| body.to_string())
        );
        if body["success"] == false {
            std::process::exit(1);
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => {
            let mut config = Config::load_from(path)?;
            config.apply_env(|key| std::env::var(key).ok());
            Ok(config)
        }
        None => Config::load(),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

/// Runs a command; `run` prints nothing, everything else returns its JSON.
fn execute(command: Command, config: &Config) -> Option<Value> {
    match command {
        Command::Run { instance_id } => match run_orchestrator(config, &instance_id) {
            Ok(()) => None,
            Err(e) => Some(to_response::<()>(Err(e))),
        },
        Command::AddTask { kind, title, agent } => Some(to_response(add_task(config, kind, &title, agent))),
        Command::SpawnAgentSession {
            agent_type,
            task_id,
            timeout,
        } => Some(to_response(spawn_session(config, agent_type, task_id, timeout))),
        Command::MergeCompletedWork {
            task_id,
            strategy,
            resolve_conflicts,
        } => Some(to_response(merge_work(config, task_id, strategy, resolve_conflicts))),
        Command::Heartbeat { agent_id } => Some(to_response(heartbeat(config, agent_id))),
        Command::Send {
            from,
            to,
            kind,
            payload,
            priority,
            suggest,
        } => Some(to_response(send(config, from, to, &kind, &payload, priority, suggest))),
        Command::Poll {
            recipient,
            kind,
            limit,
        } => Some(to_response(poll(config, &recipient, kind.as_deref(), limit))),
        Command::Finish {
            id,
            error,
            duration_ms,
        } => Some(to_response(finish(config, id, error.as_deref(), duration_ms))),
        Command::Status => Some(to_response(status(config))),
        Command::Health { check, limit } => Some(to_response(health(config, check, limit))),
    }
}

fn open_store(config: &Config) -> Result<Store> {
    config.ensure_dirs()?;
    Store::open(&config.db_path()?)
}

fn run_orchestrator(config: &Config, instance_id: &str) -> Result<()> {
    config.ensure_dirs()?;
    info!(instance = instance_id, "foreman starting");
    runtime()?.block_on(async {
        let orchestrator = Orchestrator::from_config(config, instance_id)?;
        let cancel = CancellationToken::new();
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("interrupt received, shutting down");
                    interrupt.cancel();
                }
                Err(e) => warn!(error = %e, "cannot listen for interrupts"),
            }
        });
        orchestrator.run(cancel).await
    })
}

fn add_task(config: &Config, kind: TaskKind, title: &str, agent: Option<AgentType>) -> Result<Value> {
    let store = open_store(config)?;
    let mut new = NewTask::new(kind, title);
    if let Some(agent) = agent {
        if !agent.is_spawnable() {
            return Err(Error::Validation(format!("agent type '{}' cannot take tasks", agent)));
        }
        new = new.with_agent(agent);
    }
    let task = store.with_tx(|tx| tasks::insert(tx, &new, Utc::now()))?;
    Ok(json!({ "task": task }))
}

fn spawn_session(
    config: &Config,
    agent_type: AgentType,
    task_id: TaskId,
    timeout: Option<u64>,
) -> Result<commands::AgentSession> {
    config.ensure_dirs()?;
    runtime()?.block_on(async {
        let orchestrator = Orchestrator::from_config(config, DEFAULT_INSTANCE)?;
        commands::spawn_agent_session(
            orchestrator.lifecycle(),
            orchestrator.merges(),
            &agent_type,
            task_id,
            timeout.map(Duration::from_secs),
        )
        .await
    })
}

fn merge_work(
    config: &Config,
    task_id: TaskId,
    strategy: MergeStrategy,
    resolve_conflicts: Option<bool>,
) -> Result<MergeOutcome> {
    config.ensure_dirs()?;
    runtime()?.block_on(async {
        let orchestrator = Orchestrator::from_config(config, DEFAULT_INSTANCE)?;
        let merges = orchestrator
            .merges()
            .ok_or_else(|| Error::Validation("no repository configured".to_string()))?;
        commands::merge_completed_work(merges, task_id, strategy, resolve_conflicts).await
    })
}

fn heartbeat(config: &Config, agent_id: AgentId) -> Result<Value> {
    let store = open_store(config)?;
    let launcher = CommandLauncher::new(AgentCommand::from_config(config), store.path().map(Path::to_path_buf));
    let lifecycle = LifecycleManager::new(
        store,
        Arc::new(launcher),
        LifecycleConfig::from_config(config, DEFAULT_INSTANCE),
    );
    let instance = lifecycle.record_heartbeat(agent_id)?;
    Ok(json!({ "agent": instance }))
}

fn send(
    config: &Config,
    from: String,
    to: Recipient,
    kind: &str,
    payload: &str,
    priority: u8,
    suggest: Option<AgentType>,
) -> Result<Value> {
    let payload: Value = serde_json::from_str(payload)
        .map_err(|e| Error::InvalidPayload(format!("payload is not JSON: {}", e)))?;
    let mut message = NewMessage::new(from, to, kind).payload(payload).priority(priority);
    if let Some(agent) = suggest {
        message = message.suggest(agent);
    }
    let sent = MessageBus::new(open_store(config)?).send(message)?;
    Ok(json!({ "message": sent }))
}

fn poll(config: &Config, recipient: &Recipient, kind: Option<&str>, limit: usize) -> Result<Value> {
    let messages = MessageBus::new(open_store(config)?).poll(recipient, kind, limit)?;
    Ok(json!({ "messages": messages }))
}

fn finish(config: &Config, id: MessageId, error: Option<&str>, duration_ms: u64) -> Result<Value> {
    let bus = MessageBus::new(open_store(config)?);
    let message = match error {
        Some(error) => bus.mark_failed(id, error)?,
        None => bus.mark_completed(id, duration_ms)?,
    };
    Ok(json!({ "message": message }))
}

fn status(config: &Config) -> Result<Value> {
    let store = open_store(config)?;
    store.read(|conn| {
        let counts: serde_json::Map<String, Value> = tasks::count_by_status(conn)?
            .into_iter()
            .map(|(status, n)| (status.to_string(), json!(n)))
            .collect();
        Ok(json!({
            "tasks": counts,
            "agents": agents::non_terminal(conn)?,
            "merge_queue": merge_queue::list(conn)?,
            "last_tick": records::last_tick(conn)?,
        }))
    })
}

fn health(config: &Config, check: bool, limit: usize) -> Result<Value> {
    let latest = if check {
        config.ensure_dirs()?;
        let sweep = runtime()?.block_on(async {
            let orchestrator = Orchestrator::from_config(config, DEFAULT_INSTANCE)?;
            let mut monitor = HealthMonitor::new(
                orchestrator.store().clone(),
                orchestrator.lifecycle().clone(),
                HealthConfig::from_config(config),
            );
            if let Some(merges) = orchestrator.merges() {
                monitor = monitor.with_merges(merges.clone());
            }
            monitor.check(Utc::now()).await
        })?;
        Some(sweep)
    } else {
        None
    };

    let store = open_store(config)?;
    store.read(|conn| {
        Ok(json!({
            "check": latest,
            "recent_checks": records::recent_health_checks(conn, limit)?,
            "alerts": records::recent_alerts(conn, limit)?,
            "bugs": records::recent_bugs(conn, limit)?,
        }))
    })
}
