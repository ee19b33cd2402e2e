//! End-to-end workflow tests.
//!
//! A task goes from the queue through a spawned worker, a completion
//! report on the bus and the merge queue into the integration branch.

use std::collections::HashSet;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

use foreman::bus::MessageBus;
use foreman::commands;
use foreman::core::{
    AgentStatus, AgentType, MergeState, MessageStatus, NewMessage, Recipient, TaskKind,
    TaskStatus,
};
use foreman::orchestration::{ControlConfig, ControlLoop};
use foreman::store::{agents, merge_queue, Store};
use foreman::Error;

use crate::fixtures::{commit_in, eventually, FakeLauncher, Harness, Script, TestRepo, INTEGRATION};

const WAIT: Duration = Duration::from_secs(5);

fn control_loop(h: &Harness) -> ControlLoop {
    ControlLoop::new(
        h.store.clone(),
        h.lifecycle.clone(),
        ControlConfig {
            instance_id: "e2e".to_string(),
            tick_interval: Duration::from_millis(50),
        },
    )
    .with_merges(h.merges().clone())
}

/// Test: Queue to merge
/// Given a pending task and a worker that commits in its worktree
/// When the worker reports completion on the bus
/// Then the next tick merges the branch and cleans up after it
#[tokio::test]
async fn test_task_flows_from_queue_to_integration_branch() {
    let repo = TestRepo::new();
    let h = Harness::new(FakeLauncher::new(Script::Hang)).with_repo(&repo);
    let control = control_loop(&h);
    let task = h.add_task(TaskKind::Spec, "add lexer");

    let report = assert_ok!(control.tick().await);
    assert_eq!(report.spawned.len(), 1);
    let (_, agent_id) = report.spawned[0];

    let store = h.store.clone();
    assert!(
        eventually(WAIT, || {
            store
                .read(|c| agents::require(c, agent_id))
                .map(|i| i.status == AgentStatus::Running)
                .unwrap_or(false)
        })
        .await,
        "worker should acknowledge startup"
    );
    assert_eq!(h.task(&task).status, TaskStatus::Running);

    let launched = h.launcher.launched();
    let worktree = launched[0].workdir.clone().expect("worker runs in its worktree");
    commit_in(&worktree, "src/lexer.rs", "pub fn lex() {}\n", "Add lexer");

    let bus = MessageBus::new(h.store.clone());
    assert_ok!(bus.send(
        NewMessage::new("spec", Recipient::Agent(AgentType::Orchestrator), "task_completed")
            .payload(json!({ "task_id": task.id.to_string() }))
    ));

    let report = assert_ok!(control.tick().await);
    assert_eq!(report.inbox_handled, 1);
    let merged = report.merge.expect("head of the queue should merge");
    assert_eq!(merged.state, MergeState::Merged);

    assert_eq!(h.task(&task).status, TaskStatus::Merged);
    assert_eq!(repo.show(INTEGRATION, "src/lexer.rs"), "pub fn lex() {}");
    assert!(!worktree.exists(), "worktree removed after merge");
    assert!(h.task(&task).branch_name.is_none());

    let instance = assert_ok!(h.store.read(|c| agents::require(c, agent_id)));
    assert_eq!(instance.status, AgentStatus::Completed);
}

/// Test: Worker exit as completion
/// Given a worker that exits 0
/// When the supervisor observes the exit
/// Then the task is completed and queued for merge
#[tokio::test]
async fn test_clean_exit_completes_task() {
    let h = Harness::new(FakeLauncher::new(Script::Exit {
        code: 0,
        stderr: String::new(),
    }));
    let task = h.add_task(TaskKind::Refactor, "inline helpers");

    let instance = assert_ok!(h.lifecycle.try_spawn(&AgentType::Refactor, task.id).await);
    let store = h.store.clone();
    assert!(
        eventually(WAIT, || {
            store
                .read(|c| agents::require(c, instance.id))
                .map(|i| i.status == AgentStatus::Completed)
                .unwrap_or(false)
        })
        .await
    );

    assert_eq!(h.task(&task).status, TaskStatus::Completed);
    let entry = assert_ok!(h.store.read(|c| merge_queue::require(c, task.id)));
    assert_eq!(entry.state, MergeState::AwaitingMerge);
}

/// Test: Agent session command
/// Given a worker that acknowledges
/// When a session is requested through the command surface
/// Then the session reports a running instance in a provisioned worktree
#[tokio::test]
async fn test_spawn_agent_session_waits_for_acknowledgment() {
    let repo = TestRepo::new();
    let h = Harness::new(FakeLauncher::new(Script::Hang)).with_repo(&repo);
    let task = h.add_task(TaskKind::Priority, "triage backlog");

    let session = assert_ok!(
        commands::spawn_agent_session(
            &h.lifecycle,
            h.merges.as_ref(),
            &AgentType::Priority,
            task.id,
            Some(WAIT),
        )
        .await
    );
    assert_eq!(session.status, AgentStatus::Running);
    assert!(session.worktree.as_ref().is_some_and(|p| p.exists()));
    assert_eq!(h.launcher.launched()[0].workdir, session.worktree);

    let body = commands::to_response(Ok(session));
    assert_eq!(body["success"], true);
    assert_eq!(body["status"], "running");
}

/// Test: Broker routing
/// Given a message addressed to the broker with a suggested recipient
/// When the control loop ticks
/// Then the recipient can claim it and finalize it
#[tokio::test]
async fn test_broker_message_reaches_suggested_recipient() {
    let h = Harness::new(FakeLauncher::new(Script::Hang));
    let control = ControlLoop::new(h.store.clone(), h.lifecycle.clone(), ControlConfig {
        instance_id: "e2e".to_string(),
        tick_interval: Duration::from_millis(50),
    });
    let bus = MessageBus::new(h.store.clone());

    assert_ok!(bus.send(
        NewMessage::new("spec", Recipient::Broker, "review_request")
            .payload(json!({ "file": "src/lexer.rs" }))
            .priority(2)
            .suggest(AgentType::Reviewer)
    ));
    let report = assert_ok!(control.tick().await);
    assert_eq!(report.routed, 1);

    let reviewer = Recipient::Agent(AgentType::Reviewer);
    let claimed = assert_ok!(bus.poll(&reviewer, Some("review_request"), 10));
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].sender, "spec");
    assert_eq!(claimed[0].priority, 2);
    assert_eq!(claimed[0].payload["file"], "src/lexer.rs");
    assert_eq!(claimed[0].status, MessageStatus::Started);

    let done = assert_ok!(bus.mark_completed(claimed[0].id, 12));
    assert_eq!(done.status, MessageStatus::Completed);
    assert_err!(bus.mark_completed(claimed[0].id, 12));
    assert!(assert_ok!(bus.poll(&reviewer, None, 10)).is_empty());
}

/// Test: Unroutable broker message
/// Given a broker message without a suggested recipient
/// When it is sent
/// Then it is rejected before reaching the store
#[tokio::test]
async fn test_broker_message_without_hint_is_rejected() {
    let h = Harness::new(FakeLauncher::new(Script::Hang));
    let bus = MessageBus::new(h.store.clone());
    let err = assert_err!(bus.send(NewMessage::new("spec", Recipient::Broker, "review_request")));
    assert!(matches!(err, Error::InvalidPayload(_)));
}

/// Test: Pollers on separate connections
/// Given two processes' worth of store handles on one database file
/// When both drain the same recipient concurrently
/// Then every message is claimed exactly once
#[tokio::test]
async fn test_concurrent_pollers_claim_each_message_once() {
    let dir = assert_ok!(TempDir::new());
    let path = dir.path().join("foreman.db");
    let first = MessageBus::new(assert_ok!(Store::open(&path)));
    let second = MessageBus::new(assert_ok!(Store::open(&path)));

    let total = 60;
    for n in 0..total {
        assert_ok!(first.send(
            NewMessage::new("spec", Recipient::Agent(AgentType::Worker), "job")
                .payload(json!({ "n": n }))
        ));
    }

    let drain = |bus: MessageBus| {
        tokio::task::spawn_blocking(move || {
            let worker = Recipient::Agent(AgentType::Worker);
            let mut claimed = Vec::new();
            loop {
                let batch = bus.poll(&worker, None, 4).expect("poll failed");
                if batch.is_empty() {
                    return claimed;
                }
                claimed.extend(batch.into_iter().map(|m| m.id));
            }
        })
    };
    let (a, b) = tokio::join!(drain(first.clone()), drain(second));
    let (a, b) = (assert_ok!(a), assert_ok!(b));

    assert_eq!(a.len() + b.len(), total);
    let unique: HashSet<_> = a.iter().chain(b.iter()).collect();
    assert_eq!(unique.len(), total);
    assert_eq!(assert_ok!(first.pending_count(&Recipient::Agent(AgentType::Worker))), 0);
}
