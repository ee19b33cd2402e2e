//! Parallel execution tests.
//!
//! Different agent types run side by side; a type never has more than one
//! live instance, however many of its tasks are ready.

use std::time::Duration;

use tokio_test::{assert_err, assert_ok};

use foreman::core::{AgentStatus, AgentType, TaskKind, TaskStatus};
use foreman::orchestration::{ControlConfig, ControlLoop};
use foreman::store::agents;
use foreman::Error;

use crate::fixtures::{eventually, FakeLauncher, Harness, Script};

fn control_loop(h: &Harness) -> ControlLoop {
    ControlLoop::new(
        h.store.clone(),
        h.lifecycle.clone(),
        ControlConfig {
            instance_id: "parallel".to_string(),
            tick_interval: Duration::from_millis(50),
        },
    )
}

fn live_instances(h: &Harness, agent_type: &AgentType) -> usize {
    h.store
        .read(agents::non_terminal)
        .unwrap()
        .iter()
        .filter(|i| &i.agent_type == agent_type)
        .count()
}

/// Test: Singleton per agent type
/// Given a live worker agent
/// When a second worker task asks for an agent
/// Then the request fails and the second task stays pending
#[tokio::test]
async fn test_second_spawn_of_same_type_is_rejected() {
    let h = Harness::new(FakeLauncher::new(Script::Hang));
    let first = h.add_task_for(AgentType::Worker, "parser");
    let second = h.add_task_for(AgentType::Worker, "printer");

    let holder = assert_ok!(h.lifecycle.try_spawn(&AgentType::Worker, first.id).await);
    let err = assert_err!(h.lifecycle.try_spawn(&AgentType::Worker, second.id).await);
    match err {
        Error::SingletonViolation { agent_type, agent_id } => {
            assert_eq!(agent_type, "worker");
            assert_eq!(agent_id, holder.id.to_string());
        }
        other => panic!("expected singleton violation, got {:?}", other),
    }

    assert_eq!(h.task(&second).status, TaskStatus::Pending);
    assert_eq!(h.task(&second).spawn_attempts, 0);
    assert_eq!(live_instances(&h, &AgentType::Worker), 1);
    assert_eq!(h.launcher.launched().len(), 1);
}

/// Test: Slot freed on release
/// Given a spec agent whose task has failed
/// When the next spec task is spawned
/// Then it gets a fresh instance
#[tokio::test]
async fn test_slot_is_reusable_after_release() {
    let h = Harness::new(FakeLauncher::new(Script::Hang));
    let first = h.add_task(TaskKind::Spec, "parser");
    let second = h.add_task(TaskKind::Spec, "printer");

    let holder = assert_ok!(h.lifecycle.try_spawn(&AgentType::Spec, first.id).await);
    assert_ok!(h.lifecycle.fail_task(first.id, "abandoned").await);

    let next = assert_ok!(h.lifecycle.try_spawn(&AgentType::Spec, second.id).await);
    assert_ne!(next.id, holder.id);
    let retired = assert_ok!(h.store.read(|c| agents::require(c, holder.id)));
    assert_eq!(retired.status, AgentStatus::Completed);
    assert_eq!(h.task(&first).status, TaskStatus::Failed);
}

/// Test: One spawn per type per tick
/// Given ready tasks for two agent types, two of them for the same type
/// When the control loop ticks
/// Then one agent of each type is running and the extra task waits
#[tokio::test]
async fn test_tick_spawns_one_agent_per_type() {
    let h = Harness::new(FakeLauncher::new(Script::Hang));
    let control = control_loop(&h);
    let spec_a = h.add_task(TaskKind::Spec, "spec a");
    let spec_b = h.add_task(TaskKind::Spec, "spec b");
    let review = h.add_task_for(AgentType::Reviewer, "review a");

    let report = assert_ok!(control.tick().await);
    let spawned: Vec<_> = report.spawned.iter().map(|(task, _)| *task).collect();
    assert_eq!(spawned, vec![spec_a.id, review.id]);

    let store = h.store.clone();
    assert!(
        eventually(Duration::from_secs(5), || {
            store
                .read(agents::non_terminal)
                .map(|all| all.iter().all(|i| i.status == AgentStatus::Running))
                .unwrap_or(false)
        })
        .await
    );

    let report = assert_ok!(control.tick().await);
    assert!(report.spawned.is_empty(), "spec slot is still held");
    assert_eq!(h.task(&spec_b).status, TaskStatus::Pending);
    assert_eq!(live_instances(&h, &AgentType::Spec), 1);
    assert_eq!(live_instances(&h, &AgentType::Reviewer), 1);
}

/// Test: Concurrent spawn requests
/// Given many tasks for one agent type
/// When spawns race from separate tasks
/// Then exactly one succeeds
#[tokio::test]
async fn test_concurrent_spawns_admit_one() {
    let h = Harness::new(FakeLauncher::new(Script::Hang));
    let tasks: Vec<_> = (0..8)
        .map(|n| h.add_task(TaskKind::Refactor, &format!("refactor {}", n)))
        .collect();

    let mut joins = Vec::new();
    for task in &tasks {
        let lifecycle = h.lifecycle.clone();
        let task_id = task.id;
        joins.push(tokio::spawn(async move {
            lifecycle.try_spawn(&AgentType::Refactor, task_id).await
        }));
    }

    let mut admitted = 0;
    for join in joins {
        match join.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(Error::SingletonViolation { .. }) => {}
            Err(other) => panic!("unexpected error {:?}", other),
        }
    }
    assert_eq!(admitted, 1);
    assert_eq!(live_instances(&h, &AgentType::Refactor), 1);
}
