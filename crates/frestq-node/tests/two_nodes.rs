// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Real-HTTP exchanges between two nodes in one process, on ephemeral
//! ports: task hand-off, the update flow back to the sender, and the
//! ingress status surface (200/400/404).

use std::{net::TcpListener, sync::Arc, time::Duration};

use async_trait::async_trait;
use frestq_config::FrestqConfig;
use frestq_engine::{Engine, TaskContext, TaskHandler, SimpleTaskSpec};
use frestq_node::FrestqApp;
use frestq_store::TaskStatus;
use serde_json::{json, Value};
use uuid::Uuid;

struct HelloHandler;

#[async_trait]
impl TaskHandler for HelloHandler {
    async fn execute(&self, task: &mut TaskContext) -> anyhow::Result<Option<Value>> {
        let name = task
            .input_data()
            .and_then(|d| d.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("world")
            .to_string();
        Ok(Some(json!(format!("hi {name}"))))
    }
}

/// Bind an ephemeral port, build a node whose root URL points at it, and
/// serve it in the background.  Returns the engine and the root URL.
async fn spawn_node(
    dir: &tempfile::TempDir,
    name: &str,
    register: impl FnOnce(&mut FrestqApp),
) -> (Arc<Engine>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let root_url = format!("http://{addr}/api/queues");

    let mut config = FrestqConfig::default();
    config.root_url = root_url.clone();
    config.bind = addr.to_string();
    config.database = dir.path().join(format!("{name}.sqlite"));

    let mut app = FrestqApp::new(config);
    register(&mut app);
    let node = app.build().await.unwrap();
    let engine = node.engine();
    tokio::spawn(async move {
        node.serve_on(listener).await.unwrap();
    });
    (engine, root_url)
}

async fn wait_finished(engine: &Arc<Engine>, id: Uuid) -> frestq_store::TaskRow {
    for _ in 0..400 {
        if let Some(task) = engine.store().try_task(id).unwrap() {
            if task.status == TaskStatus::Finished {
                return task;
            }
            assert_ne!(task.status, TaskStatus::Error, "task {id} errored");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("task {id} never finished");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn task_crosses_nodes_and_update_returns() {
    let dir = tempfile::tempdir().unwrap();
    let (engine_a, _url_a) = spawn_node(&dir, "a", |_| {}).await;
    let (engine_b, url_b) = spawn_node(&dir, "b", |app| {
        app.register_task_handler("testing.hello", "hello", Arc::new(HelloHandler))
            .unwrap();
    })
    .await;

    let id = engine_a
        .create_and_send(
            SimpleTaskSpec::new(&url_b, "testing.hello", "hello").data(json!({"name": "x"})),
        )
        .await
        .unwrap();

    let task_on_a = wait_finished(&engine_a, id).await;
    assert_eq!(task_on_a.output_data, Some(json!("hi x")));

    // the receiver persisted the task under the same id and finished it
    let task_on_b = wait_finished(&engine_b, id).await;
    assert_eq!(task_on_b.sender_url, task_on_a.sender_url);
    assert!(task_on_b.is_received);

    // accepted exchange: a message row exists on both peers with equal id
    let sent: Vec<_> = engine_a
        .store()
        .recent_messages(10, &[])
        .unwrap()
        .into_iter()
        .filter(|m| m.action == "testing.hello")
        .collect();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].output_status, Some(200));
    let received = engine_b.store().message(sent[0].id).unwrap();
    assert!(received.is_received);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ingress_status_surface() {
    let dir = tempfile::tempdir().unwrap();
    let (_engine, url) = spawn_node(&dir, "s", |app| {
        app.register_task_handler("testing.hello", "hello", Arc::new(HelloHandler))
            .unwrap();
    })
    .await;
    let client = reqwest::Client::new();

    // malformed json → 400
    let resp = client
        .post(format!("{url}/hello/"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    // missing required fields → 400
    let resp = client
        .post(format!("{url}/hello/"))
        .json(&json!({"action": "testing.hello"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    // unknown action → 404
    let resp = client
        .post(format!("{url}/hello/"))
        .json(&json!({
            "message_id": Uuid::new_v4(),
            "action": "nobody.home",
            "sender_url": "http://127.0.0.1:1/api/queues",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);

    // well-formed task message → 200 with empty body
    let resp = client
        .post(format!("{url}/hello/"))
        .json(&json!({
            "message_id": Uuid::new_v4(),
            "action": "testing.hello",
            "sender_url": "http://127.0.0.1:1/api/queues",
            "data": {"name": "wire"},
            "task_id": Uuid::new_v4(),
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert!(resp.bytes().await.unwrap().is_empty());
}
