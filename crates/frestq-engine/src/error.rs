// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use frestq_store::StoreError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid message: {0}")]
    Validation(String),

    #[error("no handler for action {action} in queue {queue}")]
    Routing { action: String, queue: String },

    #[error("security error: {0}")]
    Security(String),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("subtasks of {task} failed: {failed:?}")]
    SubtasksFailed { task: Uuid, failed: Vec<Uuid> },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("duplicate handler for action {action} in queue {queue}")]
    DuplicateHandler { action: String, queue: String },
}

/// What a task handler's error callback decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Default: the task becomes `error` and the failure climbs the tree.
    Propagate,
    /// The task finishes normally and the parent advances.
    Suppress,
}
