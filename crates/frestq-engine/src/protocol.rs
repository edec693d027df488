// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The internal protocol: the actions on `internal.frestq` that implement
//! cross-node updates, the two-phase synchronized start, and external-task
//! completion.
//!
//! # Reservation protocol
//!
//! ```text
//! director                                receiver
//!    │ synchronize_task ────────────────────▶ create task in `syncing`
//!    │                                        run reserve(), → `reserved`
//!    │ ◀──────────────── confirm_task_reservation (reservation payload)
//!    │ all children reserved?
//!    │ pre_execute() hook
//!    │ execute_synchronized ────────────────▶ `reserved → confirmed`,
//!    │                                        wakes the parked job,
//!    │                                        handler runs
//!    │ ◀──────────────────────── update_task (finished / error)
//! ```
//!
//! A receiver that reserved parks on a process-wide notifier until its task
//! becomes `confirmed` (execute) or `created` (timeout).  Wakeups are
//! broadcast; every waiter re-reads its own task from the store and parks
//! again if nothing changed, so spurious wakeups are harmless.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use frestq_store::{MessageRow, TaskKind, TaskRow, TaskStatus};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    context::TaskContext,
    engine::Engine,
    envelope::{actions, OutboundMessage, INTERNAL_QUEUE},
    registry::{HandlerRegistry, MessageHandler},
    tasks, wiredate, EngineError,
};

/// Wire the protocol actions into a registry.  Called once during node
/// assembly, before the registry freezes.
pub(crate) fn register_internal(registry: &mut HandlerRegistry) -> Result<(), EngineError> {
    registry.register_internal_message(actions::UPDATE_TASK, Arc::new(UpdateTaskAction))?;
    registry.register_internal_message(actions::SYNCHRONIZE_TASK, Arc::new(SynchronizeTaskAction))?;
    registry.register_internal_message(
        actions::CONFIRM_TASK_RESERVATION,
        Arc::new(ConfirmTaskReservationAction),
    )?;
    registry.register_internal_message(
        actions::EXECUTE_SYNCHRONIZED,
        Arc::new(ExecuteSynchronizedAction),
    )?;
    registry.register_internal_message(
        actions::FINISH_EXTERNAL_TASK,
        Arc::new(FinishExternalTaskAction),
    )?;
    registry.register_internal_message(actions::VIRTUAL_EMPTY_TASK, Arc::new(VirtualEmptyTaskAction))?;
    Ok(())
}

fn required_task_id(msg: &MessageRow) -> Result<Uuid, EngineError> {
    msg.task_id
        .ok_or_else(|| EngineError::Validation(format!("message {} carries no task_id", msg.id)))
}

fn input_object(msg: &MessageRow) -> Result<&serde_json::Map<String, Value>, EngineError> {
    msg.input_data
        .as_ref()
        .and_then(Value::as_object)
        .ok_or_else(|| EngineError::Validation(format!("message {} data must be an object", msg.id)))
}

// ── frestq.update_task ────────────────────────────────────────────────────────

struct UpdateTaskAction;

#[async_trait]
impl MessageHandler for UpdateTaskAction {
    async fn handle(&self, engine: Arc<Engine>, msg: MessageRow) -> anyhow::Result<()> {
        update_task(engine, msg).await?;
        Ok(())
    }
}

/// Apply a downstream task's `{output_data, status}` to the local row, then
/// advance the tree.  An update for an already-finished task is dropped
/// unless it carries `error` — the engine prefers the error truth.
async fn update_task(engine: Arc<Engine>, msg: MessageRow) -> Result<(), EngineError> {
    let task_id = required_task_id(&msg)?;
    let task = engine.store().task(task_id)?;
    let input = input_object(&msg)?;

    // the update payload is exactly {output_data, status}; anything else is
    // a protocol drift we refuse to propagate
    for key in input.keys() {
        if key != "output_data" && key != "status" {
            return Err(EngineError::Validation(format!(
                "unknown update field '{key}' for task {task_id}"
            )));
        }
    }

    let new_status = input
        .get("status")
        .and_then(Value::as_str)
        .map(TaskStatus::parse)
        .transpose()?;

    if task.status == TaskStatus::Finished && new_status != Some(TaskStatus::Error) {
        warn!(task = %task_id, "dropping update for finished task");
        return Ok(());
    }

    // the sender must present the certificate captured when this task was
    // first sent to it
    engine.verify_counterpart(
        msg.sender_ssl_cert.as_deref(),
        task.receiver_ssl_cert.as_deref(),
        "task update",
    )?;

    debug!(task = %task_id, status = ?new_status, "applying task update");
    if let Some(output) = input.get("output_data") {
        engine.store().set_task_output(task_id, output)?;
    }
    if let Some(status) = new_status {
        engine.store().update_task_status(task_id, status)?;
    }

    tasks::execute_task(engine, task_id).await
}

// ── frestq.synchronize_task ───────────────────────────────────────────────────

struct SynchronizeTaskAction;

#[async_trait]
impl MessageHandler for SynchronizeTaskAction {
    async fn handle(&self, engine: Arc<Engine>, msg: MessageRow) -> anyhow::Result<()> {
        synchronize_task(engine, msg).await?;
        Ok(())
    }
}

/// Receiver side of phase one: create (or refresh) the task in `syncing`
/// and schedule its reservation on the task's own queue.
async fn synchronize_task(engine: Arc<Engine>, msg: MessageRow) -> Result<(), EngineError> {
    let task_id = required_task_id(&msg)?;
    let input = input_object(&msg)?;
    let is_local = msg.sender_url == engine.root_url();
    debug!(task = %task_id, "synchronizing task");

    let queue_name = match engine.store().try_task(task_id)? {
        Some(task) => {
            if task.status != TaskStatus::Created {
                warn!(task = %task_id, status = %task.status, "ignoring synchronize for busy task");
                return Ok(());
            }
            if is_local && task.task_type == TaskKind::Simple {
                engine.store().set_task_type(task_id, TaskKind::Sequential)?;
            }
            engine.store().update_task_status(task_id, TaskStatus::Syncing)?;
            task.queue_name
        }
        None => {
            let action = input
                .get("action")
                .and_then(Value::as_str)
                .ok_or_else(|| EngineError::Validation("synchronize without action".into()))?
                .to_string();
            let queue_name = input
                .get("queue_name")
                .and_then(Value::as_str)
                .ok_or_else(|| EngineError::Validation("synchronize without queue_name".into()))?
                .to_string();
            let now = Utc::now();
            engine.store().insert_task(&TaskRow {
                id: task_id,
                task_type: TaskKind::Sequential,
                action,
                queue_name: queue_name.clone(),
                label: None,
                status: TaskStatus::Syncing,
                sender_url: msg.sender_url.clone(),
                receiver_url: engine.root_url().to_string(),
                sender_ssl_cert: msg.sender_ssl_cert.clone(),
                receiver_ssl_cert: None,
                is_received: msg.is_received,
                is_local,
                parent_id: None,
                order: None,
                input_data: input.get("input_data").cloned(),
                output_data: None,
                reservation_data: None,
                task_metadata: None,
                created_date: now,
                last_modified_date: now,
                pingback_date: opt_wire_date(input.get("pingback_date")),
                expiration_date: opt_wire_date(input.get("expiration_date")),
                info_text: None,
            })?;
            queue_name
        }
    };

    let e = engine.clone();
    engine.submit_now(&queue_name, "reserve_task", async move {
        reserve_task(e, task_id).await
    });
    Ok(())
}

fn opt_wire_date(v: Option<&Value>) -> Option<chrono::DateTime<Utc>> {
    v.and_then(Value::as_str).and_then(wiredate::try_decode)
}

// ── Receiver reservation ──────────────────────────────────────────────────────

/// Run the reservation on the receiver: call the handler's `reserve`, reply
/// with the confirmation, then park until the director confirms or the
/// timeout puts the task back to `created`.
async fn reserve_task(engine: Arc<Engine>, task_id: Uuid) -> Result<(), EngineError> {
    let Some(task) = engine.store().try_task(task_id)? else {
        return Ok(());
    };
    if task.status != TaskStatus::Syncing {
        // timed out or superseded before the job ran
        return Ok(());
    }

    if let Some(handler) = engine.registry().task_handler(&task.action, &task.queue_name) {
        let mut ctx = TaskContext::new(engine.clone(), task.clone());
        if let Some(data) = handler
            .reserve(&mut ctx)
            .await
            .map_err(|e| EngineError::Handler(format!("{e:#}")))?
        {
            engine.store().set_task_reservation(task_id, Some(&data))?;
        }
    }

    engine.store().update_task_status(task_id, TaskStatus::Reserved)?;
    ack_reservation(&engine, task_id).await?;

    let e = engine.clone();
    engine.submit_at(
        INTERNAL_QUEUE,
        "cancel_reserved_subtask",
        Utc::now() + engine.reservation_timeout(),
        async move { cancel_reserved_subtask(e, task_id).await },
    );

    // park until confirmed or cancelled; broadcast wakeups force a re-read
    loop {
        let notified = engine.reserve_signal().notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        match engine.store().task(task_id)?.status {
            TaskStatus::Reserved => notified.await,
            TaskStatus::Created => {
                debug!(task = %task_id, "reservation timed out");
                return Ok(());
            }
            TaskStatus::Confirmed => break,
            other => {
                warn!(task = %task_id, status = %other, "reservation wait ended unexpectedly");
                return Ok(());
            }
        }
    }

    debug!(task = %task_id, "reservation confirmed, executing");
    engine.store().update_task_status(task_id, TaskStatus::Executing)?;
    tasks::run_handler_and_advance(engine, task_id).await
}

/// Reply to the director that this child is reserved, carrying the
/// reservation payload and when it expires here.
async fn ack_reservation(engine: &Arc<Engine>, task_id: Uuid) -> Result<(), EngineError> {
    let task = engine.store().task(task_id)?;
    if task.status != TaskStatus::Reserved {
        return Ok(());
    }
    let expires = Utc::now() + engine.reservation_timeout();

    tasks::send_message(
        engine,
        OutboundMessage {
            action: actions::CONFIRM_TASK_RESERVATION.to_string(),
            queue_name: INTERNAL_QUEUE.to_string(),
            receiver_url: task.sender_url.clone(),
            receiver_ssl_cert: task.sender_ssl_cert.clone(),
            input_data: Some(serde_json::json!({
                "reservation_data": task.reservation_data,
                "reservation_expiration_date": wiredate::encode(&expires),
            })),
            task_id: Some(task.id),
            ..Default::default()
        },
        None,
    )
    .await
}

/// Receiver-side reservation timeout: undo the reservation, return the task
/// to `created` and wake the parked job so it exits.
async fn cancel_reserved_subtask(engine: Arc<Engine>, task_id: Uuid) -> Result<(), EngineError> {
    let Some(task) = engine.store().try_task(task_id)? else {
        return Ok(());
    };

    if let Some(handler) = engine.registry().task_handler(&task.action, &task.queue_name) {
        let mut ctx = TaskContext::new(engine.clone(), task.clone());
        if let Err(e) = handler.cancel_reservation(&mut ctx).await {
            warn!(task = %task_id, "cancel_reservation hook failed: {e:#}");
        }
    }

    if !matches!(task.status, TaskStatus::Syncing | TaskStatus::Reserved) {
        return Ok(());
    }
    debug!(task = %task_id, "cancelling reservation");
    engine.store().update_task_status(task_id, TaskStatus::Created)?;
    engine.reserve_signal().notify_waiters();
    Ok(())
}

// ── frestq.confirm_task_reservation ───────────────────────────────────────────

struct ConfirmTaskReservationAction;

#[async_trait]
impl MessageHandler for ConfirmTaskReservationAction {
    async fn handle(&self, engine: Arc<Engine>, msg: MessageRow) -> anyhow::Result<()> {
        confirm_task_reservation(engine, msg).await?;
        Ok(())
    }
}

/// Director side: record a child's reservation, schedule its expiry, and
/// once every child is reserved run `pre_execute` and start them all.
async fn confirm_task_reservation(engine: Arc<Engine>, msg: MessageRow) -> Result<(), EngineError> {
    let task_id = required_task_id(&msg)?;
    let input = input_object(&msg)?;

    let Some(task) = engine.store().try_task(task_id)? else {
        return Ok(());
    };
    let Some(parent_id) = task.parent_id else {
        return Ok(());
    };
    let parent = engine.store().task(parent_id)?;

    // a local child may already be reserved on our own row
    if !matches!(
        task.status,
        TaskStatus::Created | TaskStatus::Syncing | TaskStatus::Reserved
    ) || parent.status != TaskStatus::Executing
    {
        warn!(task = %task_id, status = %task.status, "ignoring stray reservation confirmation");
        return Ok(());
    }

    engine.store().update_task_status(task_id, TaskStatus::Reserved)?;
    let reservation = input.get("reservation_data").filter(|v| !v.is_null());
    engine.store().set_task_reservation(task_id, reservation)?;
    debug!(task = %task_id, "reservation confirmed by receiver");

    let expires = input
        .get("reservation_expiration_date")
        .and_then(Value::as_str)
        .and_then(wiredate::try_decode)
        .unwrap_or_else(|| Utc::now() + engine.reservation_timeout());
    let e = engine.clone();
    engine.submit_at(
        INTERNAL_QUEUE,
        "director_cancel_reserved_subtask",
        expires,
        async move { director_cancel_reserved_subtask(e, task_id).await },
    );

    let handler = engine.registry().task_handler(&parent.action, &parent.queue_name);
    if let Some(handler) = &handler {
        let child = engine.store().task(task_id)?;
        let mut ctx = TaskContext::new(engine.clone(), parent.clone());
        handler
            .new_reservation(&mut ctx, &child)
            .await
            .map_err(|e| EngineError::Handler(format!("{e:#}")))?;
    }

    // children still unreserved get (another) synchronize; the start waits
    let children = engine.store().children_ordered(parent_id)?;
    let unreserved: Vec<&TaskRow> = children
        .iter()
        .filter(|c| c.status == TaskStatus::Created)
        .collect();
    if !unreserved.is_empty() {
        for child in unreserved {
            let e = engine.clone();
            let id = child.id;
            engine.submit_now(INTERNAL_QUEUE, "send_synchronization_message", async move {
                tasks::send_synchronization_message(e, id).await
            });
        }
        return Ok(());
    }
    if !children.iter().all(|c| c.status == TaskStatus::Reserved) {
        return Ok(());
    }

    // phase two: every child is reserved
    if let Some(handler) = &handler {
        let mut ctx = TaskContext::new(engine.clone(), parent.clone());
        handler
            .pre_execute(&mut ctx)
            .await
            .map_err(|e| EngineError::Handler(format!("{e:#}")))?;
    }
    debug!(parent = %parent_id, "all children reserved, starting synchronized execution");
    for child in &children {
        let e = engine.clone();
        let id = child.id;
        engine.submit_now(INTERNAL_QUEUE, "director_synchronized_subtask_start", async move {
            director_synchronized_subtask_start(e, id).await
        });
    }
    Ok(())
}

/// Director-side reservation expiry.  When the whole round has lapsed (all
/// children back to `created`) the director retries the synchronization —
/// no confirmation will arrive to trigger it otherwise.
async fn director_cancel_reserved_subtask(
    engine: Arc<Engine>,
    task_id: Uuid,
) -> Result<(), EngineError> {
    let Some(task) = engine.store().try_task(task_id)? else {
        return Ok(());
    };
    let Some(parent_id) = task.parent_id else {
        return Ok(());
    };
    let parent = engine.store().task(parent_id)?;

    if let Some(handler) = engine.registry().task_handler(&parent.action, &parent.queue_name) {
        let mut ctx = TaskContext::new(engine.clone(), parent.clone());
        if let Err(e) = handler.cancelled_reservation(&mut ctx, &task).await {
            warn!(task = %task_id, "cancelled_reservation hook failed: {e:#}");
        }
    }

    if task.status != TaskStatus::Reserved {
        return Ok(());
    }
    debug!(task = %task_id, "director expiring reservation");
    engine.store().update_task_status(task_id, TaskStatus::Created)?;

    let children = engine.store().children_ordered(parent_id)?;
    if !children.iter().all(|c| c.status == TaskStatus::Created) {
        return Ok(());
    }
    for child in &children {
        let e = engine.clone();
        let id = child.id;
        engine.submit_now(INTERNAL_QUEUE, "send_synchronization_message", async move {
            tasks::send_synchronization_message(e, id).await
        });
    }
    Ok(())
}

/// Tell one reserved child's receiver to go.
async fn director_synchronized_subtask_start(
    engine: Arc<Engine>,
    task_id: Uuid,
) -> Result<(), EngineError> {
    let task = engine.store().task(task_id)?;
    if task.status != TaskStatus::Reserved {
        warn!(task = %task_id, status = %task.status, "not starting unreserved child");
        return Ok(());
    }

    tasks::send_message(
        &engine,
        OutboundMessage {
            action: actions::EXECUTE_SYNCHRONIZED.to_string(),
            queue_name: INTERNAL_QUEUE.to_string(),
            receiver_url: task.receiver_url.clone(),
            receiver_ssl_cert: task.receiver_ssl_cert.clone(),
            input_data: Some(serde_json::json!({
                "action": task.action,
                "queue_name": task.queue_name,
                "input_data": task.input_data,
            })),
            task_id: Some(task.id),
            ..Default::default()
        },
        None,
    )
    .await
}

// ── frestq.execute_synchronized ───────────────────────────────────────────────

struct ExecuteSynchronizedAction;

#[async_trait]
impl MessageHandler for ExecuteSynchronizedAction {
    async fn handle(&self, engine: Arc<Engine>, msg: MessageRow) -> anyhow::Result<()> {
        execute_synchronized(engine, msg).await?;
        Ok(())
    }
}

/// Receiver side of phase two: `reserved → confirmed`, take the (possibly
/// rewritten) input, wake the parked reservation job.
async fn execute_synchronized(engine: Arc<Engine>, msg: MessageRow) -> Result<(), EngineError> {
    let task_id = required_task_id(&msg)?;
    let input = input_object(&msg)?;

    let task = engine.store().task(task_id)?;
    if task.status != TaskStatus::Reserved {
        warn!(task = %task_id, status = %task.status, "ignoring execute for unreserved task");
        return Ok(());
    }

    if let Some(new_input) = input.get("input_data") {
        engine.store().set_task_input(task_id, new_input)?;
    }
    engine.store().update_task_status(task_id, TaskStatus::Confirmed)?;
    engine.reserve_signal().notify_waiters();
    Ok(())
}

// ── frestq.finish_external_task ───────────────────────────────────────────────

struct FinishExternalTaskAction;

#[async_trait]
impl MessageHandler for FinishExternalTaskAction {
    async fn handle(&self, engine: Arc<Engine>, msg: MessageRow) -> anyhow::Result<()> {
        finish_external_task(engine, msg).await?;
        Ok(())
    }
}

/// Apply the out-of-band completion to an external task and advance its
/// parent.
async fn finish_external_task(engine: Arc<Engine>, msg: MessageRow) -> Result<(), EngineError> {
    let task_id = required_task_id(&msg)?;
    let task = engine.store().task(task_id)?;

    if task.task_type != TaskKind::External {
        return Err(EngineError::Validation(format!(
            "task {task_id} is not external"
        )));
    }
    if task.status.is_terminal() {
        warn!(task = %task_id, "external task already terminal");
        return Ok(());
    }

    debug!(task = %task_id, "finishing external task");
    if let Some(data) = &msg.input_data {
        engine.store().set_task_output(task_id, data)?;
    }
    engine.store().update_task_status(task_id, TaskStatus::Finished)?;

    let task = engine.store().task(task_id)?;
    tasks::execute_parent(&engine, &task).await
}

// ── frestq.virtual_empty_task ─────────────────────────────────────────────────

/// Placeholder action of virtual composites; nothing to run.
struct VirtualEmptyTaskAction;

#[async_trait]
impl MessageHandler for VirtualEmptyTaskAction {
    async fn handle(&self, _engine: Arc<Engine>, msg: MessageRow) -> anyhow::Result<()> {
        debug!(message = %msg.id, "virtual empty task message, nothing to do");
        Ok(())
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{engine::EngineSettings, transport::LoopbackTransport};
    use frestq_store::Store;
    use std::time::Duration;

    const ROOT: &str = "http://127.0.0.1:5000/api/queues";

    fn test_engine(timeout: Duration) -> Arc<Engine> {
        let transport = LoopbackTransport::new();
        let settings = EngineSettings {
            root_url: ROOT.to_string(),
            ssl_cert_string: String::new(),
            allow_only_ssl_connections: false,
            reservation_timeout: timeout,
            queue_max_threads: Default::default(),
        };
        let engine = Engine::new(
            settings,
            Store::open_in_memory().unwrap(),
            HandlerRegistry::new(),
            transport.clone(),
            None,
        )
        .unwrap();
        transport.attach(&engine);
        engine.start_pools();
        engine
    }

    fn syncing_task(engine: &Arc<Engine>) -> Uuid {
        let now = Utc::now();
        let id = Uuid::new_v4();
        engine
            .store()
            .insert_task(&TaskRow {
                id,
                task_type: TaskKind::Sequential,
                action: "testing.sync_leaf".into(),
                queue_name: "g".into(),
                label: None,
                status: TaskStatus::Syncing,
                sender_url: ROOT.into(),
                receiver_url: ROOT.into(),
                sender_ssl_cert: None,
                receiver_ssl_cert: None,
                is_received: true,
                is_local: true,
                parent_id: None,
                order: None,
                input_data: None,
                output_data: None,
                reservation_data: None,
                task_metadata: None,
                created_date: now,
                last_modified_date: now,
                pingback_date: None,
                expiration_date: None,
                info_text: None,
            })
            .unwrap();
        id
    }

    async fn wait_status(engine: &Arc<Engine>, id: Uuid, status: TaskStatus) {
        for _ in 0..200 {
            if engine.store().task(id).unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("task never reached {status}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reservation_wait_times_out_back_to_created() {
        let engine = test_engine(Duration::from_millis(400));
        let id = syncing_task(&engine);

        let waiter = tokio::spawn(reserve_task(engine.clone(), id));
        wait_status(&engine, id, TaskStatus::Reserved).await;
        // the scheduled cancel fires after the timeout and wakes the waiter
        wait_status(&engine, id, TaskStatus::Created).await;

        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter must exit after cancellation")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn confirmation_wakes_the_parked_reservation() {
        let engine = test_engine(Duration::from_secs(10));
        let id = syncing_task(&engine);

        let waiter = tokio::spawn(reserve_task(engine.clone(), id));
        wait_status(&engine, id, TaskStatus::Reserved).await;

        engine
            .store()
            .update_task_status(id, TaskStatus::Confirmed)
            .unwrap();
        engine.reserve_signal().notify_waiters();

        // the waiter resumes, executes (no handler, no children) and finishes
        wait_status(&engine, id, TaskStatus::Finished).await;
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter must exit after confirmation")
            .unwrap()
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn spurious_wakeups_do_not_release_the_reservation() {
        let engine = test_engine(Duration::from_secs(10));
        let id = syncing_task(&engine);

        let waiter = tokio::spawn(reserve_task(engine.clone(), id));
        wait_status(&engine, id, TaskStatus::Reserved).await;

        // broadcast with no state change: every waiter re-reads and re-parks
        for _ in 0..5 {
            engine.reserve_signal().notify_waiters();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(
            engine.store().task(id).unwrap().status,
            TaskStatus::Reserved
        );
        assert!(!waiter.is_finished());

        engine
            .store()
            .update_task_status(id, TaskStatus::Confirmed)
            .unwrap();
        engine.reserve_signal().notify_waiters();
        wait_status(&engine, id, TaskStatus::Finished).await;
    }
}
