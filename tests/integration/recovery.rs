//! Crash escalation and health monitor recovery tests.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_test::assert_ok;

use foreman::core::{
    AgentInstance, AgentStatus, AgentType, AlertLevel, ErrorType, HealthStatus, MergeState,
    Recipient, TaskKind, TaskStatus,
};
use foreman::orchestration::{HealthConfig, HealthEvent, HealthMonitor};
use foreman::store::{agents, merge_queue, messages, records, tasks};

use crate::fixtures::{eventually, FakeLauncher, Harness, Script, TestRepo};

const WAIT: Duration = Duration::from_secs(5);

fn instance(h: &Harness, id: foreman::core::AgentId) -> AgentInstance {
    h.store.read(|c| agents::require(c, id)).unwrap()
}

fn monitor(h: &Harness) -> HealthMonitor {
    HealthMonitor::new(h.store.clone(), h.lifecycle.clone(), HealthConfig::default())
}

/// Test: Crash escalation ladder
/// Given a worker that dies on the same import error every launch
/// When it has crashed three times
/// Then the instance is retired, the task fails and a bug report with the
/// stack trace reaches the remediation agent
#[tokio::test]
async fn test_repeated_import_error_escalates_to_bug_report() {
    let h = Harness::new(FakeLauncher::new(Script::import_error()));
    let task = h.add_task(TaskKind::Spec, "add parser");
    let spawned = assert_ok!(h.lifecycle.try_spawn(&AgentType::Spec, task.id).await);

    for restart in 1..=2u32 {
        let store = h.store.clone();
        let id = spawned.id;
        assert!(
            eventually(WAIT, || {
                store
                    .read(|c| agents::require(c, id))
                    .map(|i| i.awaiting_respawn() && i.restart_count == restart)
                    .unwrap_or(false)
            })
            .await,
            "crash {} should schedule a respawn",
            restart
        );
        assert_eq!(h.task(&task).status, TaskStatus::Spawned);

        let later = Utc::now() + chrono::Duration::hours(1);
        let relaunched = assert_ok!(h.lifecycle.process_due_respawns(later).await);
        assert_eq!(relaunched, vec![spawned.id]);
    }

    let store = h.store.clone();
    let id = spawned.id;
    assert!(
        eventually(WAIT, || {
            store
                .read(|c| agents::require(c, id))
                .map(|i| i.status == AgentStatus::Crashed)
                .unwrap_or(false)
        })
        .await,
        "third crash should retire the instance"
    );

    let retired = instance(&h, spawned.id);
    assert_eq!(retired.restart_count, 3);
    assert_eq!(retired.exit_code, Some(1));
    assert_eq!(h.task(&task).status, TaskStatus::Failed);
    assert_eq!(h.launcher.launched().len(), 3);

    let crashes = assert_ok!(h.store.read(|c| records::crashes_for_task(c, task.id)));
    assert_eq!(crashes.len(), 3);
    assert!(crashes.iter().all(|c| c.error_type == ErrorType::ImportError));
    assert_eq!(
        crashes.iter().map(|c| c.respawned).collect::<Vec<_>>(),
        vec![true, true, false]
    );

    // First sighting of the signature and the final escalation are both reported.
    let bugs = assert_ok!(h.store.read(|c| records::bugs_for_task(c, task.id)));
    assert_eq!(bugs.len(), 2);
    let escalation = bugs.last().unwrap();
    assert_eq!(escalation.error_type, ErrorType::ImportError);
    assert_eq!(escalation.assigned_agent, AgentType::BugFixer);
    let trace = escalation.stack_trace.as_deref().unwrap_or_default();
    assert!(trace.starts_with("Traceback"));
    assert!(trace.contains("No module named 'foo'"));

    let inbox = Recipient::Agent(AgentType::BugFixer);
    assert_eq!(assert_ok!(h.store.read(|c| messages::pending_count(c, &inbox))), 2);
}

/// Test: Silent startup
/// Given a worker that never acknowledges startup
/// When the startup timeout passes
/// Then the process is killed and the crash is recorded as a startup timeout
#[tokio::test]
async fn test_missing_acknowledgment_is_startup_timeout() {
    let h = Harness::new(FakeLauncher::new(Script::NoAck));
    let task = h.add_task(TaskKind::Spec, "add parser");
    let spawned = assert_ok!(h.lifecycle.try_spawn(&AgentType::Spec, task.id).await);
    assert_eq!(spawned.status, AgentStatus::Spawned);

    let store = h.store.clone();
    let id = spawned.id;
    assert!(
        eventually(WAIT, || {
            store
                .read(|c| agents::require(c, id))
                .map(|i| i.awaiting_respawn())
                .unwrap_or(false)
        })
        .await,
        "silent worker should be crashed after the startup timeout"
    );

    let crashes = assert_ok!(h.store.read(|c| records::crashes_for_task(c, task.id)));
    assert_eq!(crashes.len(), 1);
    assert_eq!(crashes[0].error_type, ErrorType::StartupTimeout);
    assert!(crashes[0].respawned);
    assert_eq!(instance(&h, spawned.id).restart_count, 1);
    assert_eq!(h.task(&task).status, TaskStatus::Spawned);
}

/// Test: Crash after the task was released
/// Given a worker whose task was failed by its own report
/// When its process dies afterwards
/// Then the exit is ignored
#[tokio::test]
async fn test_exit_after_release_is_ignored() {
    let h = Harness::new(FakeLauncher::new(Script::Hang));
    let task = h.add_task(TaskKind::Spec, "add parser");
    let spawned = assert_ok!(h.lifecycle.try_spawn(&AgentType::Spec, task.id).await);

    assert_ok!(h.lifecycle.fail_task(task.id, "gave up").await);
    let lifecycle = h.lifecycle.clone();
    assert!(eventually(WAIT, || !lifecycle.is_supervised(spawned.id)).await);

    assert_eq!(instance(&h, spawned.id).status, AgentStatus::Completed);
    assert!(assert_ok!(h.store.read(|c| records::crashes_for_task(c, task.id))).is_empty());
}

/// Test: Zombie reaping
/// Given a running instance whose process vanished unobserved
/// When the health monitor sweeps
/// Then the crash is recorded and a respawn is scheduled
#[tokio::test]
async fn test_sweep_reaps_vanished_process() {
    let h = Harness::new(FakeLauncher::new(Script::Hang));
    let task = h.add_task(TaskKind::Spec, "add parser");
    let now = Utc::now();
    let orphan = h
        .store
        .with_tx(|tx| {
            let inst = agents::claim(tx, &AgentType::Spec, task.id, now)?;
            tasks::set_status(tx, task.id, TaskStatus::Spawned, now)?;
            agents::set_launched(tx, inst.id, 4_100_000, now)?;
            agents::acknowledge(tx, inst.id, now)?;
            tasks::set_status(tx, task.id, TaskStatus::Running, now)?;
            agents::require(tx, inst.id)
        })
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut monitor = monitor(&h).with_events(tx);
    let check = assert_ok!(monitor.check(Utc::now()).await);
    assert_eq!(check.status, HealthStatus::Degraded);
    assert_eq!(check.actions_taken.len(), 1);

    let mut reaped = false;
    while let Ok(event) = rx.try_recv() {
        if let HealthEvent::ZombieReaped { agent_id, pid } = event {
            assert_eq!((agent_id, pid), (orphan.id, 4_100_000));
            reaped = true;
        }
    }
    assert!(reaped);

    let parked = instance(&h, orphan.id);
    assert!(parked.awaiting_respawn());
    assert_eq!(parked.restart_count, 1);
    assert_eq!(h.task(&task).status, TaskStatus::Spawned);

    let check = assert_ok!(monitor.check(Utc::now()).await);
    assert_eq!(check.status, HealthStatus::Healthy);
}

/// Test: Frozen control loop
/// Given a control loop that stopped ticking
/// When the monitor keeps sweeping
/// Then it requests exactly one restart, then raises one critical alert
#[tokio::test]
async fn test_frozen_loop_restarts_once_then_alerts() {
    let h = Harness::new(FakeLauncher::new(Script::Hang));
    let start = Utc::now();
    h.store
        .with_tx(|tx| records::record_tick(tx, "stuck", start - chrono::Duration::seconds(400)))
        .unwrap();

    let (restart_tx, mut restart_rx) = mpsc::channel(4);
    let mut monitor = monitor(&h).with_restart_channel(restart_tx);

    let first = assert_ok!(monitor.check(start).await);
    assert_eq!(first.status, HealthStatus::Critical);
    assert_eq!(first.last_tick_age_seconds, Some(400));
    let request = restart_rx.try_recv().expect("restart requested");
    assert_eq!(request.last_tick_age_secs, 400);

    for offset in [10, 31, 60, 120] {
        let check = assert_ok!(monitor.check(start + chrono::Duration::seconds(offset)).await);
        assert_eq!(check.status, HealthStatus::Critical);
    }
    assert!(restart_rx.try_recv().is_err(), "one restart per freeze");

    let alerts = assert_ok!(h.store.read(|c| records::recent_alerts(c, 10)));
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].level, AlertLevel::Critical);

    // Ticks resume; a later freeze is a new episode.
    let resumed = start + chrono::Duration::seconds(130);
    h.store
        .with_tx(|tx| records::record_tick(tx, "stuck", resumed))
        .unwrap();
    let healthy = assert_ok!(monitor.check(resumed).await);
    assert_eq!(healthy.status, HealthStatus::Healthy);

    let frozen_again = resumed + chrono::Duration::seconds(400);
    assert_ok!(monitor.check(frozen_again).await);
    assert!(restart_rx.try_recv().is_ok());
}

/// Test: Stuck merge
/// Given a merge that has sat in dry-run past the stale threshold
/// When the monitor sweeps
/// Then the merge is failed and the merge slot is free again
#[tokio::test]
async fn test_sweep_fails_stale_merge() {
    let repo = TestRepo::new();
    let h = Harness::new(FakeLauncher::new(Script::Hang)).with_repo(&repo);
    let task = h.add_task(TaskKind::Spec, "docs");
    let long_ago = Utc::now() - chrono::Duration::hours(2);
    h.store
        .with_tx(|tx| {
            tasks::set_status(tx, task.id, TaskStatus::Spawned, long_ago)?;
            tasks::set_status(tx, task.id, TaskStatus::Running, long_ago)?;
            tasks::set_status(tx, task.id, TaskStatus::Completed, long_ago)?;
            merge_queue::enqueue(tx, task.id, long_ago)?;
            merge_queue::transition(tx, task.id, MergeState::DryRun, long_ago)
        })
        .unwrap();

    let mut monitor = monitor(&h).with_merges(h.merges().clone());
    let check = assert_ok!(monitor.check(Utc::now()).await);
    assert_eq!(check.status, HealthStatus::Degraded);

    let entry = assert_ok!(h.store.read(|c| merge_queue::require(c, task.id)));
    assert_eq!(entry.state, MergeState::Failed);
    assert!(entry.error.is_some_and(|e| e.contains("dry_run")));
    assert!(assert_ok!(h.store.read(merge_queue::active)).is_none());
}

/// Test: Recovery after one crash
/// Given a worker that crashes on its first launch only
/// When the respawn comes due
/// Then the relaunched worker runs and keeps its instance and restart count
#[tokio::test]
async fn test_respawned_worker_recovers() {
    let h = Harness::new(FakeLauncher::new(Script::Hang).then(Script::import_error()));
    let task = h.add_task(TaskKind::Spec, "add parser");
    let spawned = assert_ok!(h.lifecycle.try_spawn(&AgentType::Spec, task.id).await);

    let store = h.store.clone();
    let id = spawned.id;
    assert!(
        eventually(WAIT, || {
            store
                .read(|c| agents::require(c, id))
                .map(|i| i.awaiting_respawn())
                .unwrap_or(false)
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(
        assert_ok!(h.lifecycle.process_due_respawns(Utc::now()).await),
        vec![spawned.id]
    );

    let store = h.store.clone();
    assert!(
        eventually(WAIT, || {
            store
                .read(|c| agents::require(c, id))
                .map(|i| i.status == AgentStatus::Running)
                .unwrap_or(false)
        })
        .await
    );
    let running = assert_ok!(h.lifecycle.record_heartbeat(spawned.id));
    assert_eq!(running.restart_count, 1);
    assert_eq!(h.task(&task).status, TaskStatus::Running);
}

/// Test: Launch failures
/// Given an agent binary that cannot be started
/// When the control loop keeps retrying
/// Then the task backs off twice and fails on the third attempt with a bug
#[tokio::test]
async fn test_launch_failures_fail_task_after_three_attempts() {
    let h = Harness::new(FakeLauncher::failing());
    let control = foreman::orchestration::ControlLoop::new(
        h.store.clone(),
        h.lifecycle.clone(),
        foreman::orchestration::ControlConfig {
            instance_id: "retry".to_string(),
            tick_interval: Duration::from_millis(50),
        },
    );
    let task = h.add_task(TaskKind::Spec, "add parser");

    for attempt in 1..=2u32 {
        let report = assert_ok!(control.tick().await);
        assert!(report.spawned.is_empty());
        let deferred = h.task(&task);
        assert_eq!(deferred.status, TaskStatus::Pending);
        assert_eq!(deferred.spawn_attempts, attempt);
        assert!(deferred.next_attempt_at.is_some());
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_ok!(control.tick().await);

    assert_eq!(h.task(&task).status, TaskStatus::Failed);
    let bugs = assert_ok!(h.store.read(|c| records::bugs_for_task(c, task.id)));
    assert_eq!(bugs.len(), 1);
    assert_eq!(bugs[0].error_type, ErrorType::SpawnFailure);
    assert!(assert_ok!(h.store.read(agents::non_terminal)).is_empty());
}
