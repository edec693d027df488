// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! End-to-end engine scenarios over the loopback transport: whole task
//! trees, cross-"node" exchanges between two engines in one process, the
//! reservation barrier, and the error policy.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use frestq_engine::{
    actions, Engine, EngineSettings, Envelope, ExternalTaskSpec, HandlerRegistry,
    LoopbackTransport, ParallelTaskSpec, SequentialTaskSpec, SimpleTaskSpec,
    SynchronizedTaskSpec, TaskContext, TaskHandler, INTERNAL_QUEUE,
};
use frestq_store::{Store, TaskRow, TaskStatus};
use serde_json::{json, Value};
use uuid::Uuid;

const URL_A: &str = "http://127.0.0.1:5000/api/queues";
const URL_B: &str = "http://127.0.0.1:5001/api/queues";

fn new_engine(
    root_url: &str,
    transport: &Arc<LoopbackTransport>,
    registry: HandlerRegistry,
    reservation_timeout: Duration,
    max_threads: &[(&str, usize)],
) -> Arc<Engine> {
    let settings = EngineSettings {
        root_url: root_url.to_string(),
        ssl_cert_string: String::new(),
        allow_only_ssl_connections: false,
        reservation_timeout,
        queue_max_threads: max_threads
            .iter()
            .map(|(q, n)| (q.to_string(), *n))
            .collect(),
    };
    let store = Store::open_in_memory().unwrap();
    let engine = Engine::new(
        settings,
        store,
        registry,
        transport.clone() as Arc<dyn frestq_engine::Transport>,
        None,
    )
    .unwrap();
    transport.attach(&engine);
    engine.start_pools();
    engine
}

async fn wait_for_status(engine: &Arc<Engine>, id: Uuid, status: TaskStatus) -> TaskRow {
    for _ in 0..400 {
        if let Some(task) = engine.store().try_task(id).unwrap() {
            if task.status == status {
                return task;
            }
            assert!(
                !(task.status.is_terminal() && task.status != status),
                "task {id} ended in {} while waiting for {}",
                task.status,
                status
            );
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("task {id} never reached {status}");
}

// ── Handlers used across scenarios ────────────────────────────────────────────

/// Returns `"hi <name>"`.
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

/// Records the labels it ran, in order.
struct RecordingHandler {
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl TaskHandler for RecordingHandler {
    async fn execute(&self, task: &mut TaskContext) -> anyhow::Result<Option<Value>> {
        let label = task
            .input_data()
            .and_then(|d| d.get("label"))
            .and_then(Value::as_str)
            .unwrap_or("?")
            .to_string();
        self.seen.lock().unwrap().push(label.clone());
        Ok(Some(json!(label)))
    }
}

struct FailingHandler;

#[async_trait]
impl TaskHandler for FailingHandler {
    async fn execute(&self, _task: &mut TaskContext) -> anyhow::Result<Option<Value>> {
        anyhow::bail!("handler exploded")
    }
}

/// Decomposes into a parallel pair of `testing.bye` tasks, one per node.
struct FanOutHandler;

#[async_trait]
impl TaskHandler for FanOutHandler {
    async fn execute(&self, task: &mut TaskContext) -> anyhow::Result<Option<Value>> {
        task.add(
            ParallelTaskSpec::new().add(
                SimpleTaskSpec::new(URL_B, "testing.bye", "bye").data(json!({"who": "b"})),
            )
            .add(SimpleTaskSpec::new(URL_A, "testing.bye", "bye").data(json!({"who": "a"}))),
        )?;
        Ok(Some(json!("fanned out")))
    }
}

struct ByeHandler;

#[async_trait]
impl TaskHandler for ByeHandler {
    async fn execute(&self, task: &mut TaskContext) -> anyhow::Result<Option<Value>> {
        let who = task
            .input_data()
            .and_then(|d| d.get("who"))
            .and_then(Value::as_str)
            .unwrap_or("?")
            .to_string();
        Ok(Some(json!(format!("bye {who}"))))
    }
}

/// Synchronized-subtask handler: reserves a port from its node's range,
/// optionally stalling the first reservation to force a director retry.
struct PortHandler {
    base_port: u16,
    stall_first: Option<Duration>,
    stalled_once: AtomicBool,
}

impl PortHandler {
    fn new(base_port: u16) -> Self {
        Self {
            base_port,
            stall_first: None,
            stalled_once: AtomicBool::new(false),
        }
    }

    fn stalling(base_port: u16, delay: Duration) -> Self {
        Self {
            base_port,
            stall_first: Some(delay),
            stalled_once: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl TaskHandler for PortHandler {
    async fn execute(&self, task: &mut TaskContext) -> anyhow::Result<Option<Value>> {
        let port = task
            .reservation_data()
            .and_then(|r| r.get("port"))
            .cloned()
            .unwrap_or(Value::Null);
        Ok(Some(json!({"used_port": port})))
    }

    async fn reserve(&self, _task: &mut TaskContext) -> anyhow::Result<Option<Value>> {
        if let Some(delay) = self.stall_first {
            if !self.stalled_once.swap(true, Ordering::SeqCst) {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(Some(json!({"port": self.base_port})))
    }
}

// ── Scenario: local simple task ───────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn local_simple_task_finishes_with_output() {
    let transport = LoopbackTransport::new();
    let mut registry = HandlerRegistry::new();
    registry
        .register_task("hello", "q", Arc::new(HelloHandler))
        .unwrap();
    let engine = new_engine(URL_A, &transport, registry, Duration::from_secs(60), &[]);

    let id = engine
        .create_and_send(SimpleTaskSpec::new(URL_A, "hello", "q").data(json!({"name": "x"})))
        .await
        .unwrap();

    let task = wait_for_status(&engine, id, TaskStatus::Finished).await;
    assert_eq!(task.output_data, Some(json!("hi x")));
    assert!(task.is_local);

    let messages = engine.store().recent_messages(20, &[]).unwrap();
    let hello: Vec<_> = messages.iter().filter(|m| m.action == "hello").collect();
    assert_eq!(hello.len(), 1, "exactly one task message expected");
    // local tasks never update their sender
    assert!(!messages.iter().any(|m| m.action == actions::UPDATE_TASK));
}

// ── Scenario: two nodes, decomposed work ──────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remote_task_decomposes_and_updates_sender() {
    let transport = LoopbackTransport::new();

    let mut reg_a = HandlerRegistry::new();
    reg_a
        .register_task("testing.bye", "bye", Arc::new(ByeHandler))
        .unwrap();
    let engine_a = new_engine(URL_A, &transport, reg_a, Duration::from_secs(60), &[]);

    let mut reg_b = HandlerRegistry::new();
    reg_b
        .register_task("testing.hello_tree", "h", Arc::new(FanOutHandler))
        .unwrap();
    reg_b
        .register_task("testing.bye", "bye", Arc::new(ByeHandler))
        .unwrap();
    let engine_b = new_engine(URL_B, &transport, reg_b, Duration::from_secs(60), &[]);

    let id = engine_a
        .create_and_send(SimpleTaskSpec::new(URL_B, "testing.hello_tree", "h"))
        .await
        .unwrap();

    // A's view finishes only after B's whole subtree (including the bye
    // task that came back to A) is done
    let task_on_a = wait_for_status(&engine_a, id, TaskStatus::Finished).await;
    assert_eq!(task_on_a.output_data, Some(json!("fanned out")));

    let task_on_b = engine_b.store().task(id).unwrap();
    assert_eq!(task_on_b.status, TaskStatus::Finished);
    let children = engine_b.store().children_ordered(id).unwrap();
    assert_eq!(children.len(), 1, "the parallel composite");
    let grandchildren = engine_b.store().children_ordered(children[0].id).unwrap();
    assert_eq!(grandchildren.len(), 2);
    assert!(grandchildren.iter().all(|t| t.status == TaskStatus::Finished));

    // exactly one update reached A for the root task
    let updates: Vec<_> = engine_a
        .store()
        .recent_messages(50, &[])
        .unwrap()
        .into_iter()
        .filter(|m| m.action == actions::UPDATE_TASK && m.is_received && m.task_id == Some(id))
        .collect();
    assert_eq!(updates.len(), 1);
}

// ── Scenario: sequential ordering ─────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sequential_children_run_in_order() {
    let transport = LoopbackTransport::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut registry = HandlerRegistry::new();
    registry
        .register_task("step", "q", Arc::new(RecordingHandler { seen: seen.clone() }))
        .unwrap();
    let engine = new_engine(URL_A, &transport, registry, Duration::from_secs(60), &[]);

    let spec = SequentialTaskSpec::new()
        .add(SimpleTaskSpec::new(URL_A, "step", "q").data(json!({"label": "s1"})))
        .add(SimpleTaskSpec::new(URL_A, "step", "q").data(json!({"label": "s2"})))
        .add(SimpleTaskSpec::new(URL_A, "step", "q").data(json!({"label": "s3"})));
    let id = engine.create_and_send(spec).await.unwrap();

    wait_for_status(&engine, id, TaskStatus::Finished).await;
    assert_eq!(*seen.lock().unwrap(), vec!["s1", "s2", "s3"]);

    let children = engine.store().children_ordered(id).unwrap();
    assert_eq!(
        children.iter().map(|c| c.order).collect::<Vec<_>>(),
        vec![Some(0), Some(1), Some(2)]
    );
}

// ── Scenario: error propagation ───────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_child_errors_the_sequential_parent() {
    let transport = LoopbackTransport::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut registry = HandlerRegistry::new();
    registry
        .register_task("step", "q", Arc::new(RecordingHandler { seen: seen.clone() }))
        .unwrap();
    registry
        .register_task("boom", "q", Arc::new(FailingHandler))
        .unwrap();
    let engine = new_engine(URL_A, &transport, registry, Duration::from_secs(60), &[]);

    let spec = SequentialTaskSpec::new()
        .add(SimpleTaskSpec::new(URL_A, "step", "q").data(json!({"label": "c1"})))
        .add(SimpleTaskSpec::new(URL_A, "boom", "q"));
    let id = engine.create_and_send(spec).await.unwrap();

    wait_for_status(&engine, id, TaskStatus::Error).await;
    let children = engine.store().children_ordered(id).unwrap();
    assert_eq!(children[0].status, TaskStatus::Finished);
    assert_eq!(children[1].status, TaskStatus::Error);
    assert_eq!(*seen.lock().unwrap(), vec!["c1"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remote_handler_error_reaches_the_sender() {
    let transport = LoopbackTransport::new();
    let engine_a = new_engine(
        URL_A,
        &transport,
        HandlerRegistry::new(),
        Duration::from_secs(60),
        &[],
    );
    let mut reg_b = HandlerRegistry::new();
    reg_b
        .register_task("boom", "q", Arc::new(FailingHandler))
        .unwrap();
    let engine_b = new_engine(URL_B, &transport, reg_b, Duration::from_secs(60), &[]);

    let id = engine_a
        .create_and_send(SimpleTaskSpec::new(URL_B, "boom", "q"))
        .await
        .unwrap();

    wait_for_status(&engine_a, id, TaskStatus::Error).await;
    assert_eq!(engine_b.store().task(id).unwrap().status, TaskStatus::Error);
}

// ── Scenario: parallel containers ─────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_finishes_when_all_children_do() {
    let transport = LoopbackTransport::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut registry = HandlerRegistry::new();
    registry
        .register_task("step", "q", Arc::new(RecordingHandler { seen: seen.clone() }))
        .unwrap();
    let engine = new_engine(
        URL_A,
        &transport,
        registry,
        Duration::from_secs(60),
        &[("q", 4)],
    );

    let spec = ParallelTaskSpec::new()
        .add(SimpleTaskSpec::new(URL_A, "step", "q").data(json!({"label": "p1"})))
        .add(SimpleTaskSpec::new(URL_A, "step", "q").data(json!({"label": "p2"})))
        .add(SimpleTaskSpec::new(URL_A, "step", "q").data(json!({"label": "p3"})));
    let id = engine.create_and_send(spec).await.unwrap();

    wait_for_status(&engine, id, TaskStatus::Finished).await;
    let mut labels = seen.lock().unwrap().clone();
    labels.sort();
    assert_eq!(labels, vec!["p1", "p2", "p3"]);
}

// ── Scenario: external task ───────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn external_task_waits_for_operator_and_parent_advances() {
    let transport = LoopbackTransport::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut registry = HandlerRegistry::new();
    registry
        .register_task("step", "q", Arc::new(RecordingHandler { seen: seen.clone() }))
        .unwrap();
    let engine = new_engine(URL_A, &transport, registry, Duration::from_secs(60), &[]);

    let spec = SequentialTaskSpec::new()
        .add(ExternalTaskSpec::new().label("operator-gate"))
        .add(SimpleTaskSpec::new(URL_A, "step", "q").data(json!({"label": "after"})));
    let id = engine.create_and_send(spec).await.unwrap();

    let children = engine.store().children_ordered(id).unwrap();
    let external = children[0].id;
    wait_for_status(&engine, external, TaskStatus::Executing).await;
    assert!(seen.lock().unwrap().is_empty(), "next child must wait");

    engine
        .finish_external(external, Some(json!({"decision": "approve"})))
        .await
        .unwrap();

    wait_for_status(&engine, id, TaskStatus::Finished).await;
    let external = engine.store().task(external).unwrap();
    assert_eq!(external.output_data, Some(json!({"decision": "approve"})));
    assert_eq!(*seen.lock().unwrap(), vec!["after"]);
}

// ── Scenario: synchronized reservation, happy path ────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn synchronized_children_reserve_then_all_finish() {
    let transport = LoopbackTransport::new();

    let mut reg_a = HandlerRegistry::new();
    reg_a
        .register_task("testing.gbye", "g", Arc::new(PortHandler::new(6100)))
        .unwrap();
    let engine_a = new_engine(
        URL_A,
        &transport,
        reg_a,
        Duration::from_secs(60),
        &[("g", 3)],
    );

    let mut reg_b = HandlerRegistry::new();
    reg_b
        .register_task("testing.gbye", "g", Arc::new(PortHandler::new(6000)))
        .unwrap();
    let engine_b = new_engine(
        URL_B,
        &transport,
        reg_b,
        Duration::from_secs(60),
        &[("g", 3)],
    );

    let spec = SynchronizedTaskSpec::new()
        .add(SimpleTaskSpec::new(URL_B, "testing.gbye", "g"))
        .add(SimpleTaskSpec::new(URL_B, "testing.gbye", "g"))
        .add(SimpleTaskSpec::new(URL_A, "testing.gbye", "g"));
    let id = engine_b.create_and_send(spec).await.unwrap();

    wait_for_status(&engine_b, id, TaskStatus::Finished).await;
    let children = engine_b.store().children_ordered(id).unwrap();
    assert_eq!(children.len(), 3);
    assert!(children.iter().all(|c| c.status == TaskStatus::Finished));
    // the director recorded every child's reservation payload
    for child in &children {
        let port = child
            .reservation_data
            .as_ref()
            .and_then(|r| r.get("port"))
            .and_then(Value::as_i64)
            .unwrap();
        assert!((6000..6200).contains(&port));
    }

    // one confirmation exchange per child reached the director
    let confirms = engine_b
        .store()
        .recent_messages(100, &[])
        .unwrap()
        .into_iter()
        .filter(|m| m.action == actions::CONFIRM_TASK_RESERVATION)
        .count();
    assert_eq!(confirms, 3);

    let _ = engine_a;
}

// ── Scenario: synchronized reservation, timeout and retry ─────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn synchronized_retries_after_reservation_timeout() {
    let transport = LoopbackTransport::new();
    let timeout = Duration::from_millis(800);

    let mut reg_a = HandlerRegistry::new();
    reg_a
        .register_task(
            "testing.gbye",
            "g",
            Arc::new(PortHandler::stalling(6100, Duration::from_millis(2000))),
        )
        .unwrap();
    let engine_a = new_engine(URL_A, &transport, reg_a, timeout, &[("g", 3)]);

    let mut reg_b = HandlerRegistry::new();
    reg_b
        .register_task("testing.gbye", "g", Arc::new(PortHandler::new(6000)))
        .unwrap();
    let engine_b = new_engine(URL_B, &transport, reg_b, timeout, &[("g", 3)]);

    let spec = SynchronizedTaskSpec::new()
        .add(SimpleTaskSpec::new(URL_B, "testing.gbye", "g"))
        .add(SimpleTaskSpec::new(URL_A, "testing.gbye", "g"));
    let id = engine_b.create_and_send(spec).await.unwrap();

    wait_for_status(&engine_b, id, TaskStatus::Finished).await;

    // the lapsed round forces at least one extra synchronize send
    let syncs = engine_b
        .store()
        .recent_messages(200, &[])
        .unwrap()
        .into_iter()
        .filter(|m| m.action == actions::SYNCHRONIZE_TASK && !m.is_received)
        .count();
    assert!(syncs >= 3, "expected a resent synchronize, saw {syncs}");

    let _ = engine_a;
}

// ── Update policy ─────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn finished_task_ignores_updates_unless_they_carry_error() {
    let transport = LoopbackTransport::new();
    let mut registry = HandlerRegistry::new();
    registry
        .register_task("hello", "q", Arc::new(HelloHandler))
        .unwrap();
    let engine = new_engine(URL_A, &transport, registry, Duration::from_secs(60), &[]);

    let id = engine
        .create_and_send(SimpleTaskSpec::new(URL_A, "hello", "q").data(json!({"name": "x"})))
        .await
        .unwrap();
    wait_for_status(&engine, id, TaskStatus::Finished).await;

    let push_update = |input: Value| {
        let engine = engine.clone();
        async move {
            let env = Envelope {
                message_id: Uuid::new_v4(),
                action: actions::UPDATE_TASK.to_string(),
                sender_url: URL_B.to_string(),
                data: Some(input),
                task_id: Some(id),
                pingback_date: None,
                expiration_date: None,
                info: None,
            };
            engine
                .receive_envelope(INTERNAL_QUEUE, env, None)
                .await
                .unwrap();
        }
    };

    // a late non-error update is dropped
    push_update(json!({"status": "executing", "output_data": "late"})).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let task = engine.store().task(id).unwrap();
    assert_eq!(task.status, TaskStatus::Finished);
    assert_eq!(task.output_data, Some(json!("hi x")));

    // an unknown field rejects the whole update
    push_update(json!({"status": "error", "output_async_data": 1})).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(engine.store().task(id).unwrap().status, TaskStatus::Finished);

    // the error truth is preferred over finished
    push_update(json!({"status": "error"})).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(engine.store().task(id).unwrap().status, TaskStatus::Error);
}

// ── Ingress surface ───────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_action_is_a_routing_error() {
    let transport = LoopbackTransport::new();
    let engine = new_engine(
        URL_A,
        &transport,
        HandlerRegistry::new(),
        Duration::from_secs(60),
        &[],
    );

    let env = Envelope {
        message_id: Uuid::new_v4(),
        action: "nobody.home".to_string(),
        sender_url: URL_B.to_string(),
        data: None,
        task_id: None,
        pingback_date: None,
        expiration_date: None,
        info: None,
    };
    let err = engine.receive_envelope("q", env, None).await.unwrap_err();
    assert!(matches!(err, frestq_engine::EngineError::Routing { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn local_message_must_already_exist() {
    let transport = LoopbackTransport::new();
    let engine = new_engine(
        URL_A,
        &transport,
        HandlerRegistry::new(),
        Duration::from_secs(60),
        &[],
    );

    let env = Envelope {
        message_id: Uuid::new_v4(),
        action: actions::UPDATE_TASK.to_string(),
        sender_url: URL_A.to_string(), // claims to be local
        data: None,
        task_id: None,
        pingback_date: None,
        expiration_date: None,
        info: None,
    };
    let err = engine
        .receive_envelope(INTERNAL_QUEUE, env, None)
        .await
        .unwrap_err();
    assert!(matches!(err, frestq_engine::EngineError::Validation(_)));
}
