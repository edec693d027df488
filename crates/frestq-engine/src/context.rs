// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The view of a task handed to action handlers.
//!
//! Wraps a snapshot of the task row plus the engine handle.  Navigation
//! (children, siblings, parent) is always a fresh store query; the snapshot
//! itself only changes through the setters or [`TaskContext::refresh`].

use std::sync::Arc;

use frestq_store::TaskRow;
use serde_json::Value;
use uuid::Uuid;

use crate::{builders::TaskSpec, engine::Engine, EngineError};

pub struct TaskContext {
    engine: Arc<Engine>,
    row: TaskRow,
    auto_finish: bool,
}

impl TaskContext {
    pub(crate) fn new(engine: Arc<Engine>, row: TaskRow) -> Self {
        Self {
            engine,
            row,
            auto_finish: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.row.id
    }

    /// The task row snapshot.
    pub fn task(&self) -> &TaskRow {
        &self.row
    }

    pub fn input_data(&self) -> Option<&Value> {
        self.row.input_data.as_ref()
    }

    pub fn reservation_data(&self) -> Option<&Value> {
        self.row.reservation_data.as_ref()
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Re-read the snapshot from the store.
    pub fn refresh(&mut self) -> Result<(), EngineError> {
        self.row = self.engine.store().task(self.row.id)?;
        Ok(())
    }

    // ── Composition ───────────────────────────────────────────────────────────

    /// Attach a subtask under this task, ordered after all existing children.
    /// This is how a handler decomposes its work transparently to the sender.
    pub fn add(&self, spec: impl Into<TaskSpec>) -> Result<Uuid, EngineError> {
        self.engine.create_subtask(&self.row, spec.into())
    }

    // ── Navigation ────────────────────────────────────────────────────────────

    pub fn children(&self) -> Result<Vec<TaskRow>, EngineError> {
        Ok(self.engine.store().children_ordered(self.row.id)?)
    }

    pub fn child(&self, label: &str) -> Result<Option<TaskRow>, EngineError> {
        Ok(self.engine.store().child_by_label(self.row.id, label)?)
    }

    pub fn parent(&self) -> Result<Option<TaskRow>, EngineError> {
        match self.row.parent_id {
            Some(parent) => Ok(Some(self.engine.store().task(parent)?)),
            None => Ok(None),
        }
    }

    pub fn siblings(&self) -> Result<Vec<TaskRow>, EngineError> {
        Ok(self.engine.store().siblings(&self.row)?)
    }

    pub fn sibling(&self, label: &str) -> Result<Option<TaskRow>, EngineError> {
        Ok(self.engine.store().sibling_by_label(&self.row, label)?)
    }

    pub fn prev(&self) -> Result<Option<TaskRow>, EngineError> {
        Ok(self.engine.store().prev_sibling(&self.row)?)
    }

    pub fn next(&self) -> Result<Option<TaskRow>, EngineError> {
        Ok(self.engine.store().next_sibling(&self.row)?)
    }

    // ── Setters ───────────────────────────────────────────────────────────────

    /// Persist `output_data` immediately.  Returning the value from
    /// `execute` does the same thing; this exists for handlers that need
    /// the output visible before they return.
    pub fn set_output_data(&mut self, value: Value) -> Result<(), EngineError> {
        self.engine.store().set_task_output(self.row.id, &value)?;
        self.row.output_data = Some(value);
        Ok(())
    }

    pub fn set_reservation_data(&mut self, value: Value) -> Result<(), EngineError> {
        self.engine
            .store()
            .set_task_reservation(self.row.id, Some(&value))?;
        self.row.reservation_data = Some(value);
        Ok(())
    }

    /// Rewrite a child's `input_data`.  Meant for `pre_execute`, which may
    /// distribute collected reservation data to the children before a
    /// synchronized start.
    pub fn set_child_input_data(&self, child: Uuid, value: Value) -> Result<(), EngineError> {
        self.engine.store().set_task_input(child, &value)?;
        Ok(())
    }

    /// Ask the engine to mark this task finished as soon as the handler
    /// returns, instead of waiting for subtask bookkeeping.
    pub fn set_auto_finish(&mut self, on: bool) {
        self.auto_finish = on;
    }

    pub(crate) fn auto_finish(&self) -> bool {
        self.auto_finish
    }
}
