//! HTTP surface tests: a real listener, real requests, scripted internals.

mod common;

use std::time::Duration;

use common::harness;
use marionette::adapters::http::router;
use marionette::domain::ports::ToolName;

async fn spawn_server(h: &common::TestHarness) -> String {
    let app = router(h.manager.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

fn quick_task(h: &common::TestHarness) {
    h.invoker.push_text(ToolName::SubtaskPlanner, "1. Quick: finish fast");
    h.invoker.push_text(ToolName::ActionGenerator, "done()");
}

async fn wait_for_status(client: &reqwest::Client, base: &str, task_id: &str, want: &str) {
    for _ in 0..100 {
        let body: serde_json::Value = client
            .get(format!("{base}/api/tasks/{task_id}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if body["status"] == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("task never reached status {want}");
}

#[tokio::test]
async fn test_agent_info_endpoint() {
    let h = harness(2).await;
    let base = spawn_server(&h).await;
    let body: serde_json::Value = reqwest::get(format!("{base}/api/agent/info"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["max_concurrent"], 2);
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_async_submit_and_query() {
    let h = harness(2).await;
    quick_task(&h);
    let base = spawn_server(&h).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/api/tasks"))
        .json(&serde_json::json!({"instruction": "open calculator"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "pending");
    let task_id = body["task_id"].as_str().unwrap().to_string();

    wait_for_status(&client, &base, &task_id, "completed").await;

    let record: serde_json::Value = client
        .get(format!("{base}/api/tasks/{task_id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(record["instruction"], "open calculator");
    assert_eq!(record["plan"]["completed"][0]["name"], "Quick");
}

#[tokio::test]
async fn test_error_translation() {
    let h = harness(1).await;
    let base = spawn_server(&h).await;
    let client = reqwest::Client::new();

    // Validation -> 400
    let response = client
        .post(format!("{base}/api/tasks"))
        .json(&serde_json::json!({"instruction": ""}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // NotFound -> 404
    let response = client
        .get(format!(
            "{base}/api/tasks/00000000-0000-0000-0000-000000000000"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    // Admission full -> 503
    h.invoker.push(
        ToolName::SubtaskPlanner,
        common::Scripted::slow("1. Stuck: stalls", Duration::from_secs(60)),
    );
    let first: serde_json::Value = client
        .post(format!("{base}/api/tasks"))
        .json(&serde_json::json!({"instruction": "blocker"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let response = client
        .post(format!("{base}/api/tasks"))
        .json(&serde_json::json!({"instruction": "rejected"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);

    // Cleanup: cancel the blocker.
    let task_id = first["task_id"].as_str().unwrap();
    let response = client
        .post(format!("{base}/api/tasks/{task_id}/cancel"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);
}

#[tokio::test]
async fn test_cancel_terminal_task_reports_false() {
    let h = harness(1).await;
    quick_task(&h);
    let base = spawn_server(&h).await;
    let client = reqwest::Client::new();

    let body: serde_json::Value = client
        .post(format!("{base}/api/tasks"))
        .json(&serde_json::json!({"instruction": "fast"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let task_id = body["task_id"].as_str().unwrap().to_string();
    wait_for_status(&client, &base, &task_id, "completed").await;

    let body: serde_json::Value = client
        .post(format!("{base}/api/tasks/{task_id}/cancel"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_list_endpoint_pages() {
    let h = harness(2).await;
    let base = spawn_server(&h).await;
    let client = reqwest::Client::new();

    for i in 0..3 {
        quick_task(&h);
        let body: serde_json::Value = client
            .post(format!("{base}/api/tasks"))
            .json(&serde_json::json!({"instruction": format!("task {i}")}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let task_id = body["task_id"].as_str().unwrap().to_string();
        wait_for_status(&client, &base, &task_id, "completed").await;
    }

    let body: serde_json::Value = client
        .get(format!("{base}/api/tasks?limit=2&offset=0"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["total"], 3);
    assert_eq!(body["limit"], 2);
    assert_eq!(body["tasks"].as_array().unwrap().len(), 2);
    assert_eq!(body["tasks"][0]["instruction"], "task 2");
}

#[tokio::test]
async fn test_sandbox_endpoint() {
    let h = harness(1).await;
    let base = spawn_server(&h).await;
    let client = reqwest::Client::new();

    let body: serde_json::Value = client
        .post(format!("{base}/api/sandboxes"))
        .json(&serde_json::json!({"name": "demo", "shape": "small"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["sandbox_id"], "sbx-created");
    assert_eq!(body["shape"], "small");
}

#[tokio::test]
async fn test_metrics_endpoint_snapshot() {
    let h = harness(1).await;
    let base = spawn_server(&h).await;

    let body: serde_json::Value = reqwest::get(format!("{base}/api/metrics"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["enabled"], true);
    assert!(body["counters"]["requests_total"].is_object());
}
