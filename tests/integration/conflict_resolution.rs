//! Merge queue and conflict handling tests.

use chrono::Utc;
use tokio_test::{assert_err, assert_ok};

use foreman::core::{MergeState, MergeStrategy, Task, TaskKind, TaskStatus};
use foreman::store::{merge_queue, tasks};
use foreman::Error;

use crate::fixtures::{commit_in, git, FakeLauncher, Harness, Script, TestRepo, INTEGRATION};

/// Provisions the task's worktree, commits one file in it and reports the
/// task completed.
async fn finish_work(h: &Harness, task: &Task, filename: &str, content: &str) {
    let worktree = assert_ok!(h.merges().prepare_worktree(task.id).await);
    commit_in(&worktree, filename, content, &format!("Work on {}", task.title));
    complete(h, task);
}

fn complete(h: &Harness, task: &Task) {
    h.store
        .with_tx(|tx| {
            let now = Utc::now();
            tasks::set_status(tx, task.id, TaskStatus::Spawned, now)?;
            tasks::set_status(tx, task.id, TaskStatus::Running, now)
        })
        .unwrap();
    assert_ok!(h.lifecycle.complete_task(task.id));
}

fn entry_state(h: &Harness, task: &Task) -> MergeState {
    h.store
        .read(|c| merge_queue::require(c, task.id))
        .unwrap()
        .state
}

/// Test: Creation-order merging
/// Given three tasks where the last one finishes first
/// When the queue advances
/// Then it waits for the earlier tasks and merges in creation order
#[tokio::test]
async fn test_merges_follow_creation_order() {
    let repo = TestRepo::new();
    let h = Harness::new(FakeLauncher::new(Script::Hang)).with_repo(&repo);
    let t1 = h.add_task(TaskKind::Spec, "first");
    let t2 = h.add_task(TaskKind::Spec, "second");
    let t3 = h.add_task(TaskKind::Spec, "third");

    finish_work(&h, &t3, "c.txt", "c\n").await;
    let err = assert_err!(h.merges().merge(t3.id, MergeStrategy::Recursive).await);
    assert!(matches!(err, Error::Validation(_)));
    assert!(assert_ok!(h.merges().advance().await).is_none());
    assert_eq!(entry_state(&h, &t3), MergeState::AwaitingMerge);

    let t1_worktree = assert_ok!(h.merges().prepare_worktree(t1.id).await);
    commit_in(&t1_worktree, "a.txt", "a\n", "Work on first");
    complete(&h, &t1);
    let outcome = assert_ok!(h.merges().advance().await).expect("first is at the head");
    assert_eq!(outcome.task_id, t1.id);
    assert!(assert_ok!(h.merges().advance().await).is_none(), "second is not done");

    let t2_worktree = assert_ok!(h.merges().prepare_worktree(t2.id).await);
    commit_in(&t2_worktree, "b.txt", "b\n", "Work on second");
    complete(&h, &t2);
    let second = assert_ok!(h.merges().advance().await).expect("second is at the head");
    let third = assert_ok!(h.merges().advance().await).expect("third follows");
    assert_eq!((second.task_id, third.task_id), (t2.id, t3.id));

    for task in [&t1, &t2, &t3] {
        assert_eq!(h.task(task).status, TaskStatus::Merged);
        assert_eq!(entry_state(&h, task), MergeState::Merged);
    }
    let subjects = git(&repo.path, &["log", "--first-parent", "--format=%s", INTEGRATION]);
    let merges: Vec<&str> = subjects.lines().filter(|s| s.starts_with("Merge task")).collect();
    assert_eq!(merges.len(), 3);
    assert!(merges[0].ends_with("third"));
    assert!(merges[1].ends_with("second"));
    assert!(merges[2].ends_with("first"));
}

/// Test: Abort on conflict
/// Given a task branch and an integration commit touching the same line
/// When the task is merged with the abort strategy
/// Then the merge stops with the conflicting files and the branch is untouched
#[tokio::test]
async fn test_conflict_aborts_without_touching_integration() {
    let repo = TestRepo::new();
    let h = Harness::new(FakeLauncher::new(Script::Hang)).with_repo(&repo);
    let task = h.add_task(TaskKind::Refactor, "rename title");

    finish_work(&h, &task, "README.md", "# Worker Title\n").await;
    repo.commit_file("README.md", "# Integration Title\n", "Retitle");
    let before = repo.tip(INTEGRATION);

    assert_eq!(
        assert_ok!(h.merges().dry_run(task.id).await),
        vec!["README.md".to_string()]
    );
    let err = assert_err!(h.merges().merge(task.id, MergeStrategy::Abort).await);
    match err {
        Error::MergeConflict { files } => assert_eq!(files, vec!["README.md".to_string()]),
        other => panic!("expected conflict, got {:?}", other),
    }

    assert_eq!(repo.tip(INTEGRATION), before);
    assert_eq!(repo.show(INTEGRATION, "README.md"), "# Integration Title");
    assert_eq!(git(&repo.path, &["status", "--porcelain", "--untracked-files=no"]), "");

    let entry = assert_ok!(h.store.read(|c| merge_queue::require(c, task.id)));
    assert_eq!(entry.state, MergeState::Conflict);
    assert_eq!(entry.conflict_files, vec!["README.md".to_string()]);
    assert_eq!(h.task(&task).status, TaskStatus::Completed);
    assert!(h.task(&task).worktree_path.is_some_and(|p| p.exists()));
}

/// Test: Conflict retry
/// Given a task left in conflict
/// When it is merged again preferring the task side
/// Then the task's version lands on the integration branch
#[tokio::test]
async fn test_conflict_retry_with_theirs() {
    let repo = TestRepo::new();
    let h = Harness::new(FakeLauncher::new(Script::Hang)).with_repo(&repo);
    let task = h.add_task(TaskKind::Refactor, "rename title");

    finish_work(&h, &task, "README.md", "# Worker Title\n").await;
    repo.commit_file("README.md", "# Integration Title\n", "Retitle");
    assert_err!(h.merges().merge(task.id, MergeStrategy::Recursive).await);
    assert_eq!(entry_state(&h, &task), MergeState::Conflict);

    let outcome = assert_ok!(h.merges().merge(task.id, MergeStrategy::Theirs).await);
    assert_eq!(outcome.state, MergeState::Merged);
    assert_eq!(outcome.strategy, MergeStrategy::Theirs);
    assert_eq!(outcome.merge_commit.as_deref(), Some(repo.tip(INTEGRATION).as_str()));
    assert_eq!(repo.show(INTEGRATION, "README.md"), "# Worker Title");

    let err = assert_err!(h.merges().merge(task.id, MergeStrategy::Theirs).await);
    assert!(matches!(err, Error::AlreadyMerged(_)));
}

/// Test: Idempotent cleanup
/// Given a merged task
/// When cleanup runs again
/// Then it reports nothing left to remove
#[tokio::test]
async fn test_cleanup_is_idempotent() {
    let repo = TestRepo::new();
    let h = Harness::new(FakeLauncher::new(Script::Hang)).with_repo(&repo);
    let task = h.add_task(TaskKind::Spec, "docs");
    finish_work(&h, &task, "docs/guide.md", "guide\n").await;

    let worktree = h.task(&task).worktree_path.expect("worktree recorded");
    let branch = h.task(&task).branch_name.expect("branch recorded");
    assert_ok!(h.merges().merge(task.id, MergeStrategy::Recursive).await);

    assert!(!worktree.exists());
    assert!(!repo.branch_exists(&branch));
    let again = assert_ok!(h.merges().cleanup(task.id).await);
    assert!(again.is_noop());
    let third = assert_ok!(h.merges().cleanup(task.id).await);
    assert!(third.is_noop());
}

/// Test: Dirty worktree
/// Given a completed task with uncommitted changes in its worktree
/// When the merge is attempted
/// Then it is refused and the entry stays in line
#[tokio::test]
async fn test_dirty_worktree_blocks_merge() {
    let repo = TestRepo::new();
    let h = Harness::new(FakeLauncher::new(Script::Hang)).with_repo(&repo);
    let task = h.add_task(TaskKind::Spec, "docs");
    finish_work(&h, &task, "notes.md", "v1\n").await;

    let worktree = h.task(&task).worktree_path.expect("worktree recorded");
    std::fs::write(worktree.join("notes.md"), "v2, unsaved\n").unwrap();

    let err = assert_err!(h.merges().merge(task.id, MergeStrategy::Recursive).await);
    assert!(matches!(err, Error::DirtyWorkingDirectory(_)));
    assert_eq!(entry_state(&h, &task), MergeState::AwaitingMerge);
    assert!(assert_ok!(h.merges().advance().await).is_none());
}
