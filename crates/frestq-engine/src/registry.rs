// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The process-wide action registry.
//!
//! Applications register handlers against `(action, queue)` pairs before the
//! node starts serving; the registry is immutable afterwards.  Two handler
//! kinds exist: *message* handlers run directly against the stored message,
//! *task* handlers participate in the task lifecycle (state machine,
//! updates, reservation).  Registering any task handler reserves that
//! queue's worker pool.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use frestq_store::{MessageRow, TaskRow};
use serde_json::Value;

use crate::{
    context::TaskContext, envelope::INTERNAL_QUEUE, engine::Engine, error::ErrorDisposition,
    EngineError,
};

/// Handler for a plain message action: invoked with the persisted message,
/// no task lifecycle involved.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, engine: Arc<Engine>, msg: MessageRow) -> anyhow::Result<()>;
}

/// Handler participating in the task lifecycle.
///
/// Only `execute` is required.  The reservation hooks (`reserve`,
/// `cancel_reservation`) matter for handlers run as children of a
/// synchronized task; the director hooks (`new_reservation`, `pre_execute`,
/// `cancelled_reservation`) matter for handlers attached to the
/// synchronized composite itself.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run the action.  A returned value becomes the task's `output_data`.
    async fn execute(&self, task: &mut TaskContext) -> anyhow::Result<Option<Value>>;

    /// Called when `execute` failed or a subtask errored.  Returning
    /// [`ErrorDisposition::Suppress`] finishes the task normally instead of
    /// propagating the failure upward.
    async fn handle_error(
        &self,
        _task: &mut TaskContext,
        _error: &EngineError,
    ) -> ErrorDisposition {
        ErrorDisposition::Propagate
    }

    /// Phase-one commitment before a synchronized start.  The returned value
    /// is stored as the task's `reservation_data` and carried back to the
    /// director.
    async fn reserve(&self, _task: &mut TaskContext) -> anyhow::Result<Option<Value>> {
        Ok(None)
    }

    /// Undo `reserve` after a timeout.
    async fn cancel_reservation(&self, _task: &mut TaskContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Director: a child's reservation arrived.
    async fn new_reservation(
        &self,
        _task: &mut TaskContext,
        _child: &TaskRow,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Director: a child's reservation timed out.
    async fn cancelled_reservation(
        &self,
        _task: &mut TaskContext,
        _child: &TaskRow,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Director: all children reserved, about to start them.  May rewrite the
    /// children's `input_data` (e.g. to distribute the collected
    /// reservations).
    async fn pre_execute(&self, _task: &mut TaskContext) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub enum HandlerKind {
    Message(Arc<dyn MessageHandler>),
    Task(Arc<dyn TaskHandler>),
}

#[derive(Clone)]
pub struct HandlerEntry {
    pub kind: HandlerKind,
    /// Protocol-owned action, registered by the engine itself.
    pub is_internal: bool,
}

/// `(action, queue) → handler`, plus the set of queues that need pools.
pub struct HandlerRegistry {
    entries: HashMap<(String, String), HandlerEntry>,
    queues: BTreeSet<String>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        let mut queues = BTreeSet::new();
        queues.insert(INTERNAL_QUEUE.to_string());
        Self {
            entries: HashMap::new(),
            queues,
        }
    }

    pub fn register_message(
        &mut self,
        action: &str,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), EngineError> {
        self.insert(action, queue, HandlerKind::Message(handler), false)
    }

    pub fn register_task(
        &mut self,
        action: &str,
        queue: &str,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), EngineError> {
        self.queues.insert(queue.to_string());
        self.insert(action, queue, HandlerKind::Task(handler), false)
    }

    pub(crate) fn register_internal_message(
        &mut self,
        action: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), EngineError> {
        self.insert(action, INTERNAL_QUEUE, HandlerKind::Message(handler), true)
    }

    fn insert(
        &mut self,
        action: &str,
        queue: &str,
        kind: HandlerKind,
        is_internal: bool,
    ) -> Result<(), EngineError> {
        let key = (action.to_string(), queue.to_string());
        if self.entries.contains_key(&key) {
            return Err(EngineError::DuplicateHandler {
                action: action.to_string(),
                queue: queue.to_string(),
            });
        }
        self.entries.insert(key, HandlerEntry { kind, is_internal });
        Ok(())
    }

    pub fn lookup(&self, action: &str, queue: &str) -> Option<HandlerEntry> {
        self.entries
            .get(&(action.to_string(), queue.to_string()))
            .cloned()
    }

    /// The task handler for `(action, queue)`, if one is registered.
    pub fn task_handler(&self, action: &str, queue: &str) -> Option<Arc<dyn TaskHandler>> {
        match self.lookup(action, queue)?.kind {
            HandlerKind::Task(h) => Some(h),
            HandlerKind::Message(_) => None,
        }
    }

    /// Queue names needing a worker pool (every task handler's queue plus
    /// the internal queue).
    pub fn queue_names(&self) -> impl Iterator<Item = &str> {
        self.queues.iter().map(String::as_str)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTask;

    #[async_trait]
    impl TaskHandler for EchoTask {
        async fn execute(&self, _task: &mut TaskContext) -> anyhow::Result<Option<Value>> {
            Ok(Some(json!("echo")))
        }
    }

    struct NopMessage;

    #[async_trait]
    impl MessageHandler for NopMessage {
        async fn handle(&self, _engine: Arc<Engine>, _msg: MessageRow) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn register_and_lookup_task_handler() {
        let mut reg = HandlerRegistry::new();
        reg.register_task("testing.echo", "q", Arc::new(EchoTask)).unwrap();
        assert!(reg.task_handler("testing.echo", "q").is_some());
        assert!(reg.task_handler("testing.echo", "other").is_none());
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut reg = HandlerRegistry::new();
        reg.register_task("a", "q", Arc::new(EchoTask)).unwrap();
        assert!(matches!(
            reg.register_task("a", "q", Arc::new(EchoTask)),
            Err(EngineError::DuplicateHandler { .. })
        ));
    }

    #[test]
    fn same_action_on_two_queues_is_fine() {
        let mut reg = HandlerRegistry::new();
        reg.register_task("a", "q1", Arc::new(EchoTask)).unwrap();
        reg.register_task("a", "q2", Arc::new(EchoTask)).unwrap();
        assert!(reg.lookup("a", "q1").is_some());
        assert!(reg.lookup("a", "q2").is_some());
    }

    #[test]
    fn task_registration_reserves_queue_pool() {
        let mut reg = HandlerRegistry::new();
        reg.register_task("a", "vote_count", Arc::new(EchoTask)).unwrap();
        let queues: Vec<_> = reg.queue_names().collect();
        assert!(queues.contains(&"vote_count"));
        assert!(queues.contains(&INTERNAL_QUEUE));
    }

    #[test]
    fn message_registration_does_not_reserve_pool() {
        let mut reg = HandlerRegistry::new();
        reg.register_message("m", "mqueue", Arc::new(NopMessage)).unwrap();
        let queues: Vec<_> = reg.queue_names().collect();
        assert!(!queues.contains(&"mqueue"));
    }

    #[test]
    fn message_handler_is_not_a_task_handler() {
        let mut reg = HandlerRegistry::new();
        reg.register_message("m", "q", Arc::new(NopMessage)).unwrap();
        assert!(reg.task_handler("m", "q").is_none());
        assert!(reg.lookup("m", "q").is_some());
    }
}
