//! Admission, cancellation and lookup behavior of the task manager.

mod common;

use std::time::Duration;

use common::{harness, Scripted};
use marionette::domain::models::{RunConfig, RunRequest, Stage, TaskStatus};
use marionette::domain::ports::ToolName;
use marionette::CoreError;
use uuid::Uuid;

fn request(instruction: &str) -> RunRequest {
    RunRequest {
        instruction: instruction.to_string(),
        config: Some(RunConfig {
            max_steps: 10,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Script a task whose planner stalls for a long time.
fn stall_planner(h: &common::TestHarness, count: usize) {
    for _ in 0..count {
        h.invoker.push(
            ToolName::SubtaskPlanner,
            Scripted::slow("1. Stuck: never returns", Duration::from_secs(60)),
        );
    }
}

/// Script a task that completes after one `done()`.
fn quick_task(h: &common::TestHarness) {
    h.invoker.push_text(ToolName::SubtaskPlanner, "1. Quick: finish fast");
    h.invoker.push_text(ToolName::ActionGenerator, "done()");
}

async fn wait_for_terminal(h: &common::TestHarness, task_id: Uuid) -> TaskStatus {
    for _ in 0..300 {
        let task = h.manager.query(task_id).await.unwrap();
        if task.status.is_terminal() {
            return task.status;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("task {task_id} never reached a terminal state");
}

#[tokio::test]
async fn test_admission_rejects_above_bound() {
    let h = harness(2).await;
    stall_planner(&h, 2);

    let first = h.manager.submit(request("task one")).await.unwrap();
    let second = h.manager.submit(request("task two")).await.unwrap();
    assert_eq!(h.manager.active_count(), 2);

    // The third request sees a full pool.
    let third = h.manager.submit(request("task three")).await;
    assert!(matches!(third, Err(CoreError::Unavailable(_))));

    assert!(h.manager.cancel(first).await.unwrap());
    assert!(h.manager.cancel(second).await.unwrap());
    assert_eq!(wait_for_terminal(&h, first).await, TaskStatus::Cancelled);
    assert_eq!(wait_for_terminal(&h, second).await, TaskStatus::Cancelled);
}

#[tokio::test]
async fn test_admission_frees_slots_after_terminal() {
    let h = harness(1).await;
    stall_planner(&h, 1);

    let first = h.manager.submit(request("blocker")).await.unwrap();
    assert!(matches!(
        h.manager.submit(request("rejected")).await,
        Err(CoreError::Unavailable(_))
    ));

    h.manager.cancel(first).await.unwrap();
    wait_for_terminal(&h, first).await;

    quick_task(&h);
    let second = h.manager.submit(request("admitted after release")).await;
    assert!(second.is_ok());
    wait_for_terminal(&h, second.unwrap()).await;
}

#[tokio::test]
async fn test_cancel_is_idempotent_while_running() {
    let h = harness(1).await;
    stall_planner(&h, 1);
    let task_id = h.manager.submit(request("cancel me")).await.unwrap();

    assert!(h.manager.cancel(task_id).await.unwrap());
    assert!(h.manager.cancel(task_id).await.unwrap() || {
        // The terminal write may have landed between the two calls.
        h.manager.query(task_id).await.unwrap().status == TaskStatus::Cancelled
    });
    assert_eq!(wait_for_terminal(&h, task_id).await, TaskStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_after_terminal_returns_false() {
    let h = harness(1).await;
    quick_task(&h);
    let task_id = h.manager.submit(request("done already")).await.unwrap();
    wait_for_terminal(&h, task_id).await;

    assert!(!h.manager.cancel(task_id).await.unwrap());
    assert!(!h.manager.cancel(task_id).await.unwrap());
}

#[tokio::test]
async fn test_cancel_unknown_task_is_not_found() {
    let h = harness(1).await;
    assert!(matches!(
        h.manager.cancel(Uuid::new_v4()).await,
        Err(CoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_validation_rejections() {
    let h = harness(1).await;

    assert!(matches!(
        h.manager.submit(RunRequest::new("")).await,
        Err(CoreError::Validation(_))
    ));

    let mut zero_steps = request("ok instruction");
    zero_steps.config.as_mut().unwrap().max_steps = 0;
    assert!(matches!(
        h.manager.submit(zero_steps).await,
        Err(CoreError::Validation(_))
    ));

    let mut dangling = request("continue something");
    dangling.continue_context = true;
    dangling.previous_task_id = Some(Uuid::new_v4());
    assert!(matches!(
        h.manager.submit(dangling).await,
        Err(CoreError::Validation(_))
    ));
}

#[tokio::test]
async fn test_continue_context_inherits_conversation() {
    let h = harness(1).await;
    quick_task(&h);
    let first = h.manager.submit(request("first task")).await.unwrap();
    wait_for_terminal(&h, first).await;
    let first_record = h.manager.query(first).await.unwrap();
    assert!(!first_record.conversation.is_empty());

    quick_task(&h);
    let mut follow_up = request("follow up task");
    follow_up.continue_context = true;
    follow_up.previous_task_id = Some(first);
    let second = h.manager.submit(follow_up).await.unwrap();
    wait_for_terminal(&h, second).await;

    let second_record = h.manager.query(second).await.unwrap();
    // The follow-up started from the prior context and appended to it.
    assert!(second_record.conversation.len() > first_record.conversation.len());
}

#[tokio::test]
async fn test_subscribe_lifecycle() {
    let h = harness(1).await;

    assert!(matches!(
        h.manager.subscribe(Uuid::new_v4()).await,
        Err(CoreError::NotFound(_))
    ));

    quick_task(&h);
    let task_id = h.manager.submit(request("stream me")).await.unwrap();
    wait_for_terminal(&h, task_id).await;

    // Within the linger window: replayed history then EOF.
    let mut late = h.manager.subscribe(task_id).await.unwrap();
    let mut replayed = Vec::new();
    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = late.next().await {
            replayed.push(event.stage);
        }
    })
    .await;
    assert!(drained.is_ok(), "late subscriber never saw EOF");
    assert_eq!(replayed.first(), Some(&Stage::Starting));
    assert_eq!(replayed.last(), Some(&Stage::Finished));

    // After the linger window the bus is gone.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(matches!(
        h.manager.subscribe(task_id).await,
        Err(CoreError::AlreadyTerminal(_))
    ));
}

#[tokio::test]
async fn test_list_is_reverse_chronological() {
    let h = harness(3).await;
    let mut ids = Vec::new();
    for i in 0..3 {
        quick_task(&h);
        let id = h
            .manager
            .submit(request(&format!("listed task {i}")))
            .await
            .unwrap();
        wait_for_terminal(&h, id).await;
        ids.push(id);
    }

    let (tasks, total) = h.manager.list(2, 0).await.unwrap();
    assert_eq!(total, 3);
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].id, ids[2]);
    assert_eq!(tasks[1].id, ids[1]);

    let (rest, _) = h.manager.list(2, 2).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].id, ids[0]);
}

#[tokio::test]
async fn test_query_unknown_task() {
    let h = harness(1).await;
    assert!(matches!(
        h.manager.query(Uuid::new_v4()).await,
        Err(CoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_agent_info_reports_capacity() {
    let h = harness(3).await;
    let info = h.manager.agent_info();
    assert_eq!(info.max_concurrent, 3);
    assert!(!info.version.is_empty());
}

#[tokio::test]
async fn test_sandbox_creation_via_provider() {
    let h = harness(1).await;
    let handle = h
        .manager
        .create_sandbox(marionette::domain::models::SandboxSpec {
            shape: Some("large".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(handle.sandbox_id, "sbx-created");
    assert_eq!(handle.shape, "large");
}

#[tokio::test]
async fn test_metrics_reflect_task_lifecycle() {
    let h = harness(1).await;
    quick_task(&h);
    let task_id = h.manager.submit(request("measured task")).await.unwrap();
    wait_for_terminal(&h, task_id).await;

    let metrics = h.manager.metrics();
    assert_eq!(metrics.created_total.get("pending"), 1);
    assert_eq!(metrics.created_total.get("completed"), 1);
    assert!(metrics.tokens_consumed_total.get("input") > 0);
    // The dispatcher finished, so the gauge is back to zero.
    assert_eq!(metrics.active_tasks.get(), 0);
    assert_eq!(metrics.task_steps.count(), 1);
}
