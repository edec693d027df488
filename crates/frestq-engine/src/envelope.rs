// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The RESTQP wire envelope and the internal action names.
//!
//! Every peer exchange is a `POST {receiver_url}/{queue_name}/` whose JSON
//! body is an [`Envelope`].  Successful receipt is HTTP 200 with an empty
//! body; validation failures are 400 and unknown action/queue is 404 — the
//! core emits no other status codes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::wiredate;

/// Queue carrying the protocol's own actions.
pub const INTERNAL_QUEUE: &str = "internal.frestq";

/// Internal action names registered on [`INTERNAL_QUEUE`].
pub mod actions {
    /// Receiver applies an update from a downstream task.
    pub const UPDATE_TASK: &str = "frestq.update_task";
    /// Receiver enters `syncing` and schedules its reservation.
    pub const SYNCHRONIZE_TASK: &str = "frestq.synchronize_task";
    /// Director records a reservation and starts children when all reserved.
    pub const CONFIRM_TASK_RESERVATION: &str = "frestq.confirm_task_reservation";
    /// Receiver transitions `reserved → confirmed`, waking the waiting job.
    pub const EXECUTE_SYNCHRONIZED: &str = "frestq.execute_synchronized";
    /// Applies out-of-band completion data to an external task.
    pub const FINISH_EXTERNAL_TASK: &str = "frestq.finish_external_task";
    /// No-op placeholder action of virtual composite tasks.
    pub const VIRTUAL_EMPTY_TASK: &str = "frestq.virtual_empty_task";
}

/// JSON body of one RESTQP message.
///
/// The receiver's URL and the target queue are carried in the request path,
/// not the body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: Uuid,
    pub action: String,
    pub sender_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "wiredate::option")]
    pub pingback_date: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "wiredate::option")]
    pub expiration_date: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

/// Everything `send_message` needs to persist and post one message.
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub action: String,
    pub queue_name: String,
    pub receiver_url: String,
    pub receiver_ssl_cert: Option<String>,
    pub input_data: Option<Value>,
    pub task_id: Option<Uuid>,
    pub pingback_date: Option<DateTime<Utc>>,
    pub expiration_date: Option<DateTime<Utc>>,
    pub info: Option<String>,
}

// ── Unit tests ────────────────────────────────────────────────────────────────
