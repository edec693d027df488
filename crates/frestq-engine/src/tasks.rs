// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The task state machine.
//!
//! `execute_task` advances one task by matching on its kind; it is called
//! after creation, after a handler ran, and after every incoming update.
//! It must therefore detect for itself what is left to do — calling it
//! twice is always safe.
//!
//! Every transition is committed to the store before any message that
//! announces it leaves the node.

use std::sync::Arc;

use async_recursion::async_recursion;
use frestq_store::{MessageRow, TaskKind, TaskRow, TaskStatus};
use serde_json::json;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::{
    context::TaskContext,
    engine::Engine,
    envelope::{actions, Envelope, OutboundMessage, INTERNAL_QUEUE},
    error::ErrorDisposition,
    EngineError,
};

/// Advance a task.  Safe to call at any point of the lifecycle.
#[async_recursion]
pub async fn execute_task(engine: Arc<Engine>, task_id: Uuid) -> Result<(), EngineError> {
    let task = engine.store().task(task_id)?;
    match task.task_type {
        TaskKind::Simple => execute_simple(&engine, task).await,
        TaskKind::Sequential => execute_sequential(&engine, task).await,
        TaskKind::Parallel => execute_parallel(&engine, task).await,
        TaskKind::Synchronized => execute_synchronized(&engine, task).await,
        TaskKind::External => execute_external(&engine, task).await,
    }
}

/// Advance the parent composite, if any.
pub(crate) async fn execute_parent(
    engine: &Arc<Engine>,
    task: &TaskRow,
) -> Result<(), EngineError> {
    match task.parent_id {
        Some(parent) => execute_task(engine.clone(), parent).await,
        None => Ok(()),
    }
}

// ── Simple ────────────────────────────────────────────────────────────────────

async fn execute_simple(engine: &Arc<Engine>, task: TaskRow) -> Result<(), EngineError> {
    match task.status {
        TaskStatus::Created => {
            debug!(task = %task.id, receiver = %task.receiver_url, "sending task");
            engine.store().update_task_status(task.id, TaskStatus::Sent)?;
            send_message(
                engine,
                OutboundMessage {
                    action: task.action.clone(),
                    queue_name: task.queue_name.clone(),
                    receiver_url: task.receiver_url.clone(),
                    receiver_ssl_cert: task.receiver_ssl_cert.clone(),
                    input_data: task.input_data.clone(),
                    task_id: Some(task.id),
                    pingback_date: task.pingback_date,
                    expiration_date: task.expiration_date,
                    info: task.info_text.clone(),
                },
                Some(task.id),
            )
            .await
        }
        TaskStatus::Finished | TaskStatus::Error => execute_parent(engine, &task).await,
        _ => Ok(()),
    }
}

// ── Sequential ────────────────────────────────────────────────────────────────

async fn execute_sequential(engine: &Arc<Engine>, mut task: TaskRow) -> Result<(), EngineError> {
    if matches!(task.status, TaskStatus::Created | TaskStatus::Sent) {
        engine
            .store()
            .update_task_status(task.id, TaskStatus::Executing)?;
        task.status = TaskStatus::Executing;
    }
    if task.status.is_terminal() {
        return Ok(());
    }

    let Some(next) = engine.store().next_pending_child(task.id)? else {
        // nothing left: finish, tell the sender, advance the parent
        engine
            .store()
            .update_task_status(task.id, TaskStatus::Finished)?;
        if !task.is_local {
            let e = engine.clone();
            let id = task.id;
            engine.submit_now(&task.queue_name, "send_task_update", async move {
                send_task_update(e, id).await
            });
        }
        return execute_parent(engine, &task).await;
    };

    if next.status == TaskStatus::Error {
        return fail_composite(engine, task, vec![next.id], true).await;
    }

    if matches!(
        next.status,
        TaskStatus::Sent
            | TaskStatus::Executing
            | TaskStatus::Syncing
            | TaskStatus::Reserved
            | TaskStatus::Confirmed
    ) {
        // in flight; the terminal update will bring us back here
        return Ok(());
    }

    execute_task(engine.clone(), next.id).await
}

/// Shared failure path of the composites: synthesize the subtask-failed
/// error, offer it to the composite's error callback, and propagate unless
/// suppressed.
async fn fail_composite(
    engine: &Arc<Engine>,
    task: TaskRow,
    failed: Vec<Uuid>,
    offer_to_handler: bool,
) -> Result<(), EngineError> {
    let err = EngineError::SubtasksFailed {
        task: task.id,
        failed,
    };
    warn!(task = %task.id, "{err}");

    let mut propagate = true;
    if offer_to_handler {
        if let Some(handler) = engine.registry().task_handler(&task.action, &task.queue_name) {
            let mut ctx = TaskContext::new(engine.clone(), task.clone());
            if handler.handle_error(&mut ctx, &err).await == ErrorDisposition::Suppress {
                propagate = false;
            }
        }
    }

    let status = if propagate {
        TaskStatus::Error
    } else {
        TaskStatus::Finished
    };
    engine.store().update_task_status(task.id, status)?;

    if !task.is_local {
        let e = engine.clone();
        let id = task.id;
        engine.submit_now(INTERNAL_QUEUE, "send_task_update", async move {
            send_task_update(e, id).await
        });
    }
    execute_parent(engine, &task).await
}

// ── Parallel ──────────────────────────────────────────────────────────────────

async fn execute_parallel(engine: &Arc<Engine>, task: TaskRow) -> Result<(), EngineError> {
    if task.status == TaskStatus::Error {
        return Ok(());
    }

    let errored = engine.store().errored_children(task.id)?;
    if !errored.is_empty() {
        // no handler can stop a container failure
        let failed = errored.iter().map(|t| t.id).collect();
        return fail_composite(engine, task, failed, false).await;
    }

    let unfinished = engine.store().unfinished_children(task.id)?;

    if matches!(task.status, TaskStatus::Created | TaskStatus::Sent) && unfinished > 0 {
        engine
            .store()
            .update_task_status(task.id, TaskStatus::Executing)?;
        for child in engine.store().children_ordered(task.id)? {
            let e = engine.clone();
            let id = child.id;
            engine.submit_now(&child.queue_name, "execute_task", async move {
                execute_task(e, id).await
            });
        }
        return Ok(());
    }

    if unfinished == 0 {
        engine
            .store()
            .update_task_status(task.id, TaskStatus::Finished)?;
        return execute_parent(engine, &task).await;
    }
    Ok(())
}

// ── Synchronized ──────────────────────────────────────────────────────────────

async fn execute_synchronized(engine: &Arc<Engine>, task: TaskRow) -> Result<(), EngineError> {
    if task.status == TaskStatus::Error {
        return Ok(());
    }

    let errored = engine.store().errored_children(task.id)?;
    if !errored.is_empty() {
        let failed = errored.iter().map(|t| t.id).collect();
        return fail_composite(engine, task, failed, false).await;
    }

    if matches!(task.status, TaskStatus::Created | TaskStatus::Sent) {
        // phase one: ask every child's receiver for a reservation
        engine
            .store()
            .update_task_status(task.id, TaskStatus::Executing)?;
        for child in engine.store().children_ordered(task.id)? {
            let e = engine.clone();
            let id = child.id;
            engine.submit_now(INTERNAL_QUEUE, "send_synchronization_message", async move {
                send_synchronization_message(e, id).await
            });
        }
        return Ok(());
    }

    if engine.store().unfinished_children(task.id)? == 0 {
        engine
            .store()
            .update_task_status(task.id, TaskStatus::Finished)?;
        return execute_parent(engine, &task).await;
    }
    Ok(())
}

// ── External ──────────────────────────────────────────────────────────────────

async fn execute_external(engine: &Arc<Engine>, task: TaskRow) -> Result<(), EngineError> {
    match task.status {
        TaskStatus::Created | TaskStatus::Sent => {
            // parked until frestq.finish_external_task arrives
            engine
                .store()
                .update_task_status(task.id, TaskStatus::Executing)?;
            Ok(())
        }
        TaskStatus::Finished => execute_parent(engine, &task).await,
        _ => Ok(()),
    }
}

// ── Receiver-side intake ──────────────────────────────────────────────────────

/// Handle an incoming *task* message: build or match the task row, run the
/// handler, and advance the workflow.
///
/// The receiver deliberately treats an incoming `simple` task as
/// `sequential` so the handler may attach subtasks transparently to the
/// sender.
pub(crate) async fn post_task(engine: Arc<Engine>, msg: MessageRow) -> Result<(), EngineError> {
    let is_local = msg.sender_url == engine.root_url();

    let task_id = match msg.task_id {
        Some(id) => id,
        None => {
            let id = Uuid::new_v4();
            engine.store().set_message_task_id(msg.id, id)?;
            id
        }
    };
    debug!(task = %task_id, action = %msg.action, "incoming task");

    match engine.store().try_task(task_id)? {
        Some(existing) => {
            // a local task created as simple becomes the receiver-side
            // sequential view of itself
            if existing.task_type == TaskKind::Simple {
                engine.store().set_task_type(task_id, TaskKind::Sequential)?;
            }
            engine
                .store()
                .update_task_status(task_id, TaskStatus::Executing)?;
        }
        None => {
            let now = chrono::Utc::now();
            engine.store().insert_task(&TaskRow {
                id: task_id,
                task_type: TaskKind::Sequential,
                action: msg.action.clone(),
                queue_name: msg.queue_name.clone(),
                label: None,
                status: TaskStatus::Executing,
                sender_url: msg.sender_url.clone(),
                receiver_url: engine.root_url().to_string(),
                sender_ssl_cert: msg.sender_ssl_cert.clone(),
                receiver_ssl_cert: None,
                is_received: msg.is_received,
                is_local,
                parent_id: None,
                order: None,
                input_data: msg.input_data.clone(),
                output_data: None,
                reservation_data: None,
                task_metadata: None,
                created_date: now,
                last_modified_date: now,
                pingback_date: msg.pingback_date,
                expiration_date: msg.expiration_date,
                info_text: msg.info_text.clone(),
            })?;
        }
    }

    run_handler_and_advance(engine, task_id).await
}

/// Run the task's action handler (if any) and advance: copy output, apply
/// the error policy, update a non-local sender on failure, then `execute`.
pub(crate) async fn run_handler_and_advance(
    engine: Arc<Engine>,
    task_id: Uuid,
) -> Result<(), EngineError> {
    let task = engine.store().task(task_id)?;
    let is_local = task.is_local;
    let mut propagate = false;

    if let Some(handler) = engine.registry().task_handler(&task.action, &task.queue_name) {
        let mut ctx = TaskContext::new(engine.clone(), task);
        match handler.execute(&mut ctx).await {
            Ok(Some(output)) => engine.store().set_task_output(task_id, &output)?,
            Ok(None) => {}
            Err(handler_err) => {
                error!(task = %task_id, "task handler failed: {handler_err:#}");
                propagate = true;
                let err = EngineError::Handler(format!("{handler_err:#}"));
                if handler.handle_error(&mut ctx, &err).await == ErrorDisposition::Suppress {
                    propagate = false;
                }
            }
        }
        if ctx.auto_finish() && !propagate {
            engine
                .store()
                .update_task_status(task_id, TaskStatus::Finished)?;
        }
    }

    if propagate {
        engine.store().update_task_status(task_id, TaskStatus::Error)?;
        if !is_local {
            let e = engine.clone();
            engine.submit_now(INTERNAL_QUEUE, "send_task_update", async move {
                send_task_update(e, task_id).await
            });
        }
        let task = engine.store().task(task_id)?;
        execute_parent(&engine, &task).await
    } else {
        execute_task(engine.clone(), task_id).await
    }
}

// ── Updates to the sender ─────────────────────────────────────────────────────

/// Report this task's `{output_data, status}` back to its originator, then
/// advance the local parent if any.
pub(crate) async fn send_task_update(
    engine: Arc<Engine>,
    task_id: Uuid,
) -> Result<(), EngineError> {
    let task = engine.store().task(task_id)?;
    debug!(task = %task_id, status = %task.status, "sending update to {}", task.sender_url);

    send_message(
        &engine,
        OutboundMessage {
            action: actions::UPDATE_TASK.to_string(),
            queue_name: INTERNAL_QUEUE.to_string(),
            receiver_url: task.sender_url.clone(),
            receiver_ssl_cert: task.sender_ssl_cert.clone(),
            input_data: Some(json!({
                "output_data": task.output_data,
                "status": task.status.as_str(),
            })),
            task_id: Some(task.id),
            ..Default::default()
        },
        None,
    )
    .await?;
    engine.store().touch_task(task_id)?;

    execute_parent(&engine, &task).await
}

// ── Synchronization kick-off ──────────────────────────────────────────────────

/// Phase one of a synchronized start: carry the child's whole definition to
/// its receiver so it can be created there in `syncing`.
pub(crate) async fn send_synchronization_message(
    engine: Arc<Engine>,
    task_id: Uuid,
) -> Result<(), EngineError> {
    let task = engine.store().task(task_id)?;
    debug!(task = %task_id, receiver = %task.receiver_url, "sending synchronization message");

    send_message(
        &engine,
        OutboundMessage {
            action: actions::SYNCHRONIZE_TASK.to_string(),
            queue_name: INTERNAL_QUEUE.to_string(),
            receiver_url: task.receiver_url.clone(),
            receiver_ssl_cert: task.receiver_ssl_cert.clone(),
            input_data: Some(json!({
                "task_id": task.id,
                "action": task.action,
                "queue_name": task.queue_name,
                "input_data": task.input_data,
                "pingback_date": task.pingback_date.as_ref().map(crate::wiredate::encode),
                "expiration_date": task.expiration_date.as_ref().map(crate::wiredate::encode),
            })),
            task_id: Some(task.id),
            ..Default::default()
        },
        None,
    )
    .await?;
    engine.store().touch_task(task_id)?;
    Ok(())
}

// ── The one way out of the node ───────────────────────────────────────────────

/// Persist a message row, POST the envelope, record the outcome.
///
/// The row is committed before the POST so the exchange is on record even
/// if the send fails; the observed HTTP status is written back afterwards
/// and failures are not retried here.  When the TLS session yields the
/// peer's certificate it is recorded on the message and, if
/// `pin_cert_to_task` names a task, on that task row.
pub(crate) async fn send_message(
    engine: &Arc<Engine>,
    out: OutboundMessage,
    pin_cert_to_task: Option<Uuid>,
) -> Result<(), EngineError> {
    let msg_id = Uuid::new_v4();
    let local_cert = match engine.local_cert() {
        "" => None,
        cert => Some(cert.to_string()),
    };

    engine.store().insert_message(&MessageRow {
        id: msg_id,
        action: out.action.clone(),
        queue_name: out.queue_name.clone(),
        sender_url: engine.root_url().to_string(),
        receiver_url: out.receiver_url.clone(),
        is_received: false,
        sender_ssl_cert: local_cert,
        receiver_ssl_cert: out.receiver_ssl_cert.clone(),
        input_data: out.input_data.clone(),
        output_status: None,
        task_id: out.task_id,
        created_date: chrono::Utc::now(),
        pingback_date: out.pingback_date,
        expiration_date: out.expiration_date,
        info_text: out.info.clone(),
    })?;

    let envelope = Envelope {
        message_id: msg_id,
        action: out.action.clone(),
        sender_url: engine.root_url().to_string(),
        data: out.input_data,
        task_id: out.task_id,
        pingback_date: out.pingback_date,
        expiration_date: out.expiration_date,
        info: out.info,
    };
    let body = serde_json::to_string(&envelope)?;
    let url = format!("{}/{}/", out.receiver_url, out.queue_name);
    debug!(message = %msg_id, action = %out.action, "POST {url}");

    match engine.transport().post(&url, body).await {
        Ok(outcome) => {
            engine.store().set_message_output_status(msg_id, outcome.status)?;
            if let Some(pem) = outcome.peer_cert_pem {
                engine.store().set_message_receiver_cert(msg_id, &pem)?;
                if let Some(task_id) = pin_cert_to_task {
                    engine.store().set_task_receiver_cert(task_id, &pem)?;
                }
            }
            if !(200..300).contains(&outcome.status) {
                warn!(message = %msg_id, status = outcome.status, "peer rejected message");
            }
            Ok(())
        }
        Err(e) => {
            // no retry; the message row stays with no output_status
            error!(message = %msg_id, url = %url, "send failed: {e}");
            Err(e)
        }
    }
}

// ── Engine conveniences ───────────────────────────────────────────────────────

impl Engine {
    /// Persist a task tree and start it.
    pub async fn create_and_send(
        self: &Arc<Self>,
        spec: impl Into<crate::builders::TaskSpec>,
    ) -> Result<Uuid, EngineError> {
        let id = self.create_task(spec)?;
        execute_task(self.clone(), id).await?;
        Ok(id)
    }

    /// Post the out-of-band completion of an external task to its owner.
    pub async fn finish_external(
        self: &Arc<Self>,
        task_id: Uuid,
        data: Option<serde_json::Value>,
    ) -> Result<(), EngineError> {
        let task = self.store().task(task_id)?;
        if task.task_type != TaskKind::External {
            return Err(EngineError::Validation(format!(
                "task {task_id} is not external"
            )));
        }
        send_message(
            self,
            OutboundMessage {
                action: actions::FINISH_EXTERNAL_TASK.to_string(),
                queue_name: INTERNAL_QUEUE.to_string(),
                receiver_url: task.receiver_url.clone(),
                input_data: data,
                task_id: Some(task.id),
                ..Default::default()
            },
            None,
        )
        .await
    }
}
