// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Task builders.
//!
//! A [`TaskSpec`] describes a task tree before it exists in the store.
//! Composites collect children with `add`; [`Engine::create_task`] persists
//! the whole tree and [`Engine::create_and_send`] additionally starts it.
//!
//! The variants are a tagged enum on purpose: execution behavior lives in
//! free functions that match on the tag (see `tasks.rs`), not in an
//! inheritance hierarchy.

use chrono::{DateTime, Utc};
use frestq_store::{TaskKind, TaskRow, TaskStatus};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    engine::Engine,
    envelope::{actions, INTERNAL_QUEUE},
    EngineError,
};

/// A task tree waiting to be created.
#[derive(Debug, Clone)]
pub enum TaskSpec {
    Simple(SimpleTaskSpec),
    Sequential(SequentialTaskSpec),
    Parallel(ParallelTaskSpec),
    Synchronized(SynchronizedTaskSpec),
    External(ExternalTaskSpec),
}

/// Leaf task executed by an action handler on a receiver's queue.  The
/// receiver may be this node itself (a *local* task).
#[derive(Debug, Clone)]
pub struct SimpleTaskSpec {
    pub receiver_url: String,
    pub action: String,
    pub queue: String,
    pub data: Option<Value>,
    pub label: Option<String>,
    pub info: Option<String>,
    pub pingback_date: Option<DateTime<Utc>>,
    pub expiration_date: Option<DateTime<Utc>>,
    pub receiver_ssl_cert: Option<String>,
}

impl SimpleTaskSpec {
    pub fn new(
        receiver_url: impl Into<String>,
        action: impl Into<String>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            receiver_url: receiver_url.into(),
            action: action.into(),
            queue: queue.into(),
            data: None,
            label: None,
            info: None,
            pingback_date: None,
            expiration_date: None,
            receiver_ssl_cert: None,
        }
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn info(mut self, info: impl Into<String>) -> Self {
        self.info = Some(info.into());
        self
    }

    pub fn pingback_date(mut self, when: DateTime<Utc>) -> Self {
        self.pingback_date = Some(when);
        self
    }

    pub fn expiration_date(mut self, when: DateTime<Utc>) -> Self {
        self.expiration_date = Some(when);
        self
    }

    /// Pin the receiver's certificate up front instead of trusting first
    /// contact.
    pub fn receiver_ssl_cert(mut self, pem: impl Into<String>) -> Self {
        self.receiver_ssl_cert = Some(pem.into());
        self
    }
}

/// Virtual container running its children one after another in `order`.
#[derive(Debug, Clone, Default)]
pub struct SequentialTaskSpec {
    pub label: Option<String>,
    pub subtasks: Vec<TaskSpec>,
}

impl SequentialTaskSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn add(mut self, subtask: impl Into<TaskSpec>) -> Self {
        self.subtasks.push(subtask.into());
        self
    }
}

/// Virtual container starting all children at once.
#[derive(Debug, Clone, Default)]
pub struct ParallelTaskSpec {
    pub label: Option<String>,
    pub subtasks: Vec<TaskSpec>,
}

impl ParallelTaskSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn add(mut self, subtask: impl Into<TaskSpec>) -> Self {
        self.subtasks.push(subtask.into());
        self
    }
}

/// Virtual container that reserves every child across its receivers before
/// starting any of them (two-phase barrier).
#[derive(Debug, Clone, Default)]
pub struct SynchronizedTaskSpec {
    pub label: Option<String>,
    /// Action of a registered director-side handler (`new_reservation`,
    /// `pre_execute` hooks).  Virtual no-op when unset.
    pub handler_action: Option<String>,
    pub subtasks: Vec<TaskSpec>,
}

impl SynchronizedTaskSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn handler(mut self, action: impl Into<String>) -> Self {
        self.handler_action = Some(action.into());
        self
    }

    pub fn add(mut self, subtask: impl Into<TaskSpec>) -> Self {
        self.subtasks.push(subtask.into());
        self
    }
}

/// A task completed by an out-of-band decision (an operator, another
/// system) via `frestq.finish_external_task` rather than by code.
#[derive(Debug, Clone, Default)]
pub struct ExternalTaskSpec {
    pub data: Option<Value>,
    pub label: Option<String>,
    pub expiration_date: Option<DateTime<Utc>>,
}

impl ExternalTaskSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn expiration_date(mut self, when: DateTime<Utc>) -> Self {
        self.expiration_date = Some(when);
        self
    }
}

impl From<SimpleTaskSpec> for TaskSpec {
    fn from(s: SimpleTaskSpec) -> Self {
        TaskSpec::Simple(s)
    }
}
impl From<SequentialTaskSpec> for TaskSpec {
    fn from(s: SequentialTaskSpec) -> Self {
        TaskSpec::Sequential(s)
    }
}
impl From<ParallelTaskSpec> for TaskSpec {
    fn from(s: ParallelTaskSpec) -> Self {
        TaskSpec::Parallel(s)
    }
}
impl From<SynchronizedTaskSpec> for TaskSpec {
    fn from(s: SynchronizedTaskSpec) -> Self {
        TaskSpec::Synchronized(s)
    }
}
impl From<ExternalTaskSpec> for TaskSpec {
    fn from(s: ExternalTaskSpec) -> Self {
        TaskSpec::External(s)
    }
}

// ── Creation ──────────────────────────────────────────────────────────────────

impl Engine {
    /// Persist a task tree.  Children of a sequential task get contiguous
    /// `order` values from 0; other composites carry the insertion index.
    pub fn create_task(&self, spec: impl Into<TaskSpec>) -> Result<Uuid, EngineError> {
        self.create_tree(spec.into(), None)
    }

    pub(crate) fn create_subtask(
        &self,
        parent: &TaskRow,
        spec: TaskSpec,
    ) -> Result<Uuid, EngineError> {
        let order = self.store().count_children(parent.id)?;
        self.create_tree(spec, Some((parent.id, order)))
    }

    fn create_tree(
        &self,
        spec: TaskSpec,
        parent: Option<(Uuid, i64)>,
    ) -> Result<Uuid, EngineError> {
        let (row, children) = self.spec_row(spec, parent);
        let id = row.id;
        tracing::debug!(task = %id, kind = %row.task_type, action = %row.action, "creating task");
        self.store().insert_task(&row)?;
        for (index, child) in children.into_iter().enumerate() {
            self.create_tree(child, Some((id, index as i64)))?;
        }
        Ok(id)
    }

    fn spec_row(&self, spec: TaskSpec, parent: Option<(Uuid, i64)>) -> (TaskRow, Vec<TaskSpec>) {
        let now = Utc::now();
        let root_url = self.root_url().to_string();
        let local_cert = match self.local_cert() {
            "" => None,
            cert => Some(cert.to_string()),
        };
        let (parent_id, order) = match parent {
            Some((p, o)) => (Some(p), Some(o)),
            None => (None, None),
        };

        let base = TaskRow {
            id: Uuid::new_v4(),
            task_type: TaskKind::Sequential, // overwritten below
            action: actions::VIRTUAL_EMPTY_TASK.to_string(),
            queue_name: INTERNAL_QUEUE.to_string(),
            label: None,
            status: TaskStatus::Created,
            sender_url: root_url.clone(),
            receiver_url: root_url.clone(),
            sender_ssl_cert: local_cert,
            receiver_ssl_cert: None,
            is_received: false,
            is_local: true,
            parent_id,
            order,
            input_data: None,
            output_data: None,
            reservation_data: None,
            task_metadata: None,
            created_date: now,
            last_modified_date: now,
            pingback_date: None,
            expiration_date: None,
            info_text: None,
        };

        match spec {
            TaskSpec::Simple(s) => {
                let is_local = s.receiver_url == root_url;
                (
                    TaskRow {
                        task_type: TaskKind::Simple,
                        action: s.action,
                        queue_name: s.queue,
                        label: s.label,
                        receiver_url: s.receiver_url,
                        receiver_ssl_cert: s.receiver_ssl_cert,
                        is_local,
                        input_data: s.data,
                        pingback_date: s.pingback_date,
                        expiration_date: s.expiration_date,
                        info_text: s.info,
                        ..base
                    },
                    Vec::new(),
                )
            }
            TaskSpec::Sequential(s) => (
                TaskRow {
                    task_type: TaskKind::Sequential,
                    label: s.label,
                    input_data: Some(Value::Object(Default::default())),
                    ..base
                },
                s.subtasks,
            ),
            TaskSpec::Parallel(s) => (
                TaskRow {
                    task_type: TaskKind::Parallel,
                    label: s.label,
                    input_data: Some(Value::Object(Default::default())),
                    ..base
                },
                s.subtasks,
            ),
            TaskSpec::Synchronized(s) => (
                TaskRow {
                    task_type: TaskKind::Synchronized,
                    action: s
                        .handler_action
                        .unwrap_or_else(|| actions::VIRTUAL_EMPTY_TASK.to_string()),
                    label: s.label,
                    input_data: Some(Value::Object(Default::default())),
                    ..base
                },
                s.subtasks,
            ),
            TaskSpec::External(s) => (
                TaskRow {
                    task_type: TaskKind::External,
                    label: s.label,
                    input_data: s.data,
                    expiration_date: s.expiration_date,
                    ..base
                },
                Vec::new(),
            ),
        }
    }
}
