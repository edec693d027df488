// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Typed rows for the two tables of the store.
//!
//! A [`TaskRow`] is one node of a workflow tree; a [`MessageRow`] is the
//! immutable log record of one RPC exchange.  Tree navigation always goes
//! through store queries — rows never hold references to each other.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::StoreError;

/// Lifecycle state of a task.
///
/// `created → (sent | syncing) → (reserved → confirmed)? → executing →
/// (finished | error)`.  `finished` is terminal except that a late `error`
/// update may supersede it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Created,
    Sent,
    Syncing,
    Reserved,
    Confirmed,
    Executing,
    Finished,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Sent => "sent",
            TaskStatus::Syncing => "syncing",
            TaskStatus::Reserved => "reserved",
            TaskStatus::Confirmed => "confirmed",
            TaskStatus::Executing => "executing",
            TaskStatus::Finished => "finished",
            TaskStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        Ok(match s {
            "created" => TaskStatus::Created,
            "sent" => TaskStatus::Sent,
            "syncing" => TaskStatus::Syncing,
            "reserved" => TaskStatus::Reserved,
            "confirmed" => TaskStatus::Confirmed,
            "executing" => TaskStatus::Executing,
            "finished" => TaskStatus::Finished,
            "error" => TaskStatus::Error,
            other => {
                return Err(StoreError::Invalid {
                    what: "task status",
                    value: other.to_string(),
                })
            }
        })
    }

    /// Terminal states: nothing further happens to the task itself.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Finished | TaskStatus::Error)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The five task variants.  Composites (`sequential`, `parallel`,
/// `synchronized`) are virtual: they exist only to structure subtasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Simple,
    Sequential,
    Parallel,
    Synchronized,
    External,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Simple => "simple",
            TaskKind::Sequential => "sequential",
            TaskKind::Parallel => "parallel",
            TaskKind::Synchronized => "synchronized",
            TaskKind::External => "external",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        Ok(match s {
            "simple" => TaskKind::Simple,
            "sequential" => TaskKind::Sequential,
            "parallel" => TaskKind::Parallel,
            "synchronized" => TaskKind::Synchronized,
            "external" => TaskKind::External,
            other => {
                return Err(StoreError::Invalid {
                    what: "task type",
                    value: other.to_string(),
                })
            }
        })
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node of a workflow tree.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRow {
    pub id: Uuid,
    pub task_type: TaskKind,
    pub action: String,
    pub queue_name: String,
    pub label: Option<String>,
    pub status: TaskStatus,
    pub sender_url: String,
    pub receiver_url: String,
    pub sender_ssl_cert: Option<String>,
    pub receiver_ssl_cert: Option<String>,
    pub is_received: bool,
    pub is_local: bool,
    pub parent_id: Option<Uuid>,
    /// Sibling sequence under the parent.  Total and contiguous from 0 for
    /// sequential children; carried but unused for the other composites.
    pub order: Option<i64>,
    pub input_data: Option<Value>,
    pub output_data: Option<Value>,
    pub reservation_data: Option<Value>,
    pub task_metadata: Option<Value>,
    pub created_date: DateTime<Utc>,
    pub last_modified_date: DateTime<Utc>,
    pub pingback_date: Option<DateTime<Utc>>,
    pub expiration_date: Option<DateTime<Utc>>,
    pub info_text: Option<String>,
}

/// Immutable log of one RPC exchange.  Never mutated after the send attempt
/// completes; a failed send leaves `output_status` unset.
#[derive(Debug, Clone, Serialize)]
pub struct MessageRow {
    pub id: Uuid,
    pub action: String,
    pub queue_name: String,
    pub sender_url: String,
    pub receiver_url: String,
    pub is_received: bool,
    pub sender_ssl_cert: Option<String>,
    pub receiver_ssl_cert: Option<String>,
    pub input_data: Option<Value>,
    /// HTTP status observed by the sender; 200 on the receiver side.
    pub output_status: Option<u16>,
    pub task_id: Option<Uuid>,
    pub created_date: DateTime<Utc>,
    pub pingback_date: Option<DateTime<Utc>>,
    pub expiration_date: Option<DateTime<Utc>>,
    pub info_text: Option<String>,
}
