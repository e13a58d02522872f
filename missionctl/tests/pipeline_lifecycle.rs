//! Heartbeat-level lifecycle tests.
//!
//! These drive whole pipelines through `WorkerHeartbeat::wake`, the same entry
//! point the scheduler fires, and check task state, ownership and the
//! deliverables left in the system of record after every wake-up.

use std::sync::Arc;

use missionctl::core::types::ActivityKind;
use missionctl::heartbeat::{WakeUp, WorkerHeartbeat};
use missionctl::io::guards::draft_path;
use missionctl::io::store::TaskStore;
use missionctl::step::ExecuteOutcome;
use missionctl::test_support::{Harness, SAMPLE_WORKFLOWS, ScriptedWorker};

const REPO: &str = "acme/app";

fn heartbeat(harness: &Harness, id: &str, worker: Arc<ScriptedWorker>) -> WorkerHeartbeat {
    WorkerHeartbeat::new(harness.runner.clone(), harness.handle(id, worker))
}

/// Build task from assignment to DONE.
///
/// 1. dev wakes: ASSIGNED → IN_PROGRESS (promotion) → REVIEW, PR verified.
/// 2. dev wakes again: nothing left in its own pipeline.
/// 3. qa (lead of the verify pipeline) wakes: REVIEW → DONE via `has_task_pr`.
/// 4. qa wakes again: idle.
#[tokio::test]
async fn build_task_reaches_done_through_delegated_verification() {
    let harness = Harness::new(SAMPLE_WORKFLOWS);
    let dev_worker = Arc::new(ScriptedWorker::replying("Opened the PR."));
    let dev = heartbeat(&harness, "dev", dev_worker.clone());
    let qa_worker = Arc::new(ScriptedWorker::replying("unused"));
    let qa = heartbeat(&harness, "qa", qa_worker.clone());

    let task = harness.submit("build", "ASSIGNED", "dev", REPO).await;
    harness
        .sor
        .add_pull(REPO, &dev.handle().branch_for(&task.id));

    let report = dev.wake().await.expect("dev wake");
    assert_eq!(
        report.executed,
        vec![(
            task.id.clone(),
            ExecuteOutcome::Advanced {
                from: "IN_PROGRESS".to_string(),
                to: "REVIEW".to_string(),
                revision: false
            }
        )]
    );
    assert_eq!(harness.status(&task.id).await, "REVIEW");

    assert!(dev.wake().await.expect("dev idle wake").is_idle());
    assert_eq!(dev_worker.calls(), 1);

    let report = qa.wake().await.expect("qa wake");
    assert_eq!(report.executed.len(), 1);
    assert_eq!(harness.status(&task.id).await, "DONE");
    assert_eq!(qa_worker.calls(), 0);
    // Verification does not take the task away from its builder.
    assert_eq!(harness.assignees(&task.id).await, vec!["dev".to_string()]);

    assert!(qa.wake().await.expect("qa idle wake").is_idle());

    let kinds = harness.activity_kinds(&task.id).await;
    assert_eq!(
        kinds,
        vec![
            ActivityKind::Promoted,
            ActivityKind::Transition,
            ActivityKind::Transition
        ]
    );
    let beats = harness.store.heartbeats().await.expect("heartbeats");
    let workers: Vec<&str> = beats.iter().map(|b| b.worker.as_str()).collect();
    assert!(workers.contains(&"dev") && workers.contains(&"qa"));
}

/// A build whose worker never opens a PR bounces back to ASSIGNED and is
/// retried on the next wake-up; the retry succeeds once the PR exists.
#[tokio::test]
async fn failed_build_is_retried_on_the_next_wake() {
    let harness = Harness::new(SAMPLE_WORKFLOWS);
    let dev = heartbeat(
        &harness,
        "dev",
        Arc::new(ScriptedWorker::replying("Pushed, PR next time.")),
    );
    let task = harness.submit("build", "ASSIGNED", "dev", REPO).await;

    let first = dev.wake().await.expect("first wake");
    assert!(matches!(
        first.executed[0].1,
        ExecuteOutcome::Failed { to: Some(ref to), .. } if to == "ASSIGNED"
    ));
    assert_eq!(harness.status(&task.id).await, "ASSIGNED");

    harness
        .sor
        .add_pull(REPO, &dev.handle().branch_for(&task.id));
    let second = dev.wake().await.expect("second wake");
    assert!(matches!(second.executed[0].1, ExecuteOutcome::Advanced { .. }));
    assert_eq!(harness.status(&task.id).await, "REVIEW");
    assert!(
        harness
            .activity_kinds(&task.id)
            .await
            .contains(&ActivityKind::Failure)
    );
}

/// Content task through research, draft, one revision round and approval.
/// Every hand-off is decided by the files the previous stage committed.
#[tokio::test]
async fn content_task_survives_a_revision_round() {
    let harness = Harness::new(SAMPLE_WORKFLOWS);
    let scout = heartbeat(
        &harness,
        "scout",
        Arc::new(ScriptedWorker::replying("Three sources agree.")),
    );
    let quill = heartbeat(
        &harness,
        "quill",
        Arc::new(ScriptedWorker::replying("Second draft").then_reply("First draft")),
    );
    // The editor's standing prompt consumes one reply on every wake-up.
    let editor_worker = Arc::new(
        ScriptedWorker::replying("unused")
            .then_reply("summary")
            .then_reply("[REVISION] tighten the intro")
            .then_reply("summary")
            .then_reply("[APPROVED]\nFinal article"),
    );
    let editor = heartbeat(&harness, "editor", editor_worker.clone());

    let task = harness.submit("content", "ASSIGNED", "scout", REPO).await;
    let short = task.id.short();

    scout.wake().await.expect("scout wake");
    assert_eq!(harness.status(&task.id).await, "DRAFT");
    assert_eq!(harness.assignees(&task.id).await, vec!["quill".to_string()]);

    quill.wake().await.expect("quill wake");
    assert_eq!(harness.status(&task.id).await, "REVIEW");
    assert_eq!(harness.assignees(&task.id).await, vec!["editor".to_string()]);
    assert_eq!(
        harness.sor.file(REPO, &draft_path(&short)).as_deref(),
        Some("First draft")
    );

    let report = editor.wake().await.expect("editor wake");
    assert!(matches!(
        report.executed[0].1,
        ExecuteOutcome::Advanced { revision: true, .. }
    ));
    assert_eq!(harness.status(&task.id).await, "DRAFT");
    assert_eq!(harness.assignees(&task.id).await, vec!["quill".to_string()]);

    quill.wake().await.expect("quill rewrite");
    assert_eq!(harness.status(&task.id).await, "REVIEW");

    editor.wake().await.expect("editor approval");
    assert_eq!(harness.status(&task.id).await, "DONE");
    assert_eq!(
        harness.sor.file(REPO, &draft_path(&short)).as_deref(),
        Some("Final article")
    );
    let prompts = editor_worker.prompts();
    assert_eq!(prompts.len(), 4);
    assert!(prompts[0].starts_with("Summarise yesterday"));
    assert!(
        !harness
            .activity_kinds(&task.id)
            .await
            .contains(&ActivityKind::Failure)
    );
}

/// Without a credential the PR check fails open, but the content guards fail
/// closed: builds still flow while research cannot leave RESEARCH.
#[tokio::test]
async fn missing_credential_is_asymmetric() {
    let harness = Harness::without_credential(SAMPLE_WORKFLOWS);
    let dev = heartbeat(&harness, "dev", Arc::new(ScriptedWorker::replying("done")));
    let scout = heartbeat(&harness, "scout", Arc::new(ScriptedWorker::replying("notes")));
    let build = harness.submit("build", "ASSIGNED", "dev", REPO).await;
    let article = harness.submit("content", "ASSIGNED", "scout", REPO).await;

    dev.wake().await.expect("dev wake");
    scout.wake().await.expect("scout wake");

    assert_eq!(harness.status(&build.id).await, "REVIEW");
    assert_eq!(harness.status(&article.id).await, "RESEARCH");
    assert_eq!(harness.assignees(&article.id).await, vec!["scout".to_string()]);
}
