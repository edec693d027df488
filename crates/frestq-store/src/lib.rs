// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! SQLite persistence for frestq.
//!
//! Two tables: `task` (workflow tree nodes) and `message` (the immutable
//! RPC exchange log).  Every mutation is an individually committed
//! statement, so a state transition is durable the moment the call
//! returns — and therefore always before any outbound message that
//! announces it.
//!
//! The [`Store`] handle is cheap to clone and safe to share; a mutex
//! serializes statements on the single connection.  All tree navigation
//! (children, siblings, parent) is done by query, never by long-lived
//! in-memory pointers.

mod model;

use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub use model::{MessageRow, TaskKind, TaskRow, TaskStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json column error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid {what}: {value}")]
    Invalid { what: &'static str, value: String },
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS task (
    id                 TEXT PRIMARY KEY,
    task_type          TEXT NOT NULL,
    action             TEXT NOT NULL,
    queue_name         TEXT NOT NULL,
    label              TEXT,
    status             TEXT NOT NULL,
    sender_url         TEXT NOT NULL,
    receiver_url       TEXT NOT NULL,
    sender_ssl_cert    TEXT,
    receiver_ssl_cert  TEXT,
    is_received        INTEGER NOT NULL DEFAULT 0,
    is_local           INTEGER NOT NULL DEFAULT 0,
    parent_id          TEXT REFERENCES task(id),
    "order"            INTEGER,
    input_data         TEXT,
    output_data        TEXT,
    reservation_data   TEXT,
    task_metadata      TEXT,
    created_date       TEXT NOT NULL,
    last_modified_date TEXT NOT NULL,
    pingback_date      TEXT,
    expiration_date    TEXT,
    info_text          TEXT
);
CREATE INDEX IF NOT EXISTS task_parent_idx ON task(parent_id);

CREATE TABLE IF NOT EXISTS message (
    id                 TEXT PRIMARY KEY,
    action             TEXT NOT NULL,
    queue_name         TEXT NOT NULL,
    sender_url         TEXT NOT NULL,
    receiver_url       TEXT NOT NULL,
    is_received        INTEGER NOT NULL DEFAULT 0,
    sender_ssl_cert    TEXT,
    receiver_ssl_cert  TEXT,
    input_data         TEXT,
    output_status      INTEGER,
    task_id            TEXT,
    created_date       TEXT NOT NULL,
    pingback_date      TEXT,
    expiration_date    TEXT,
    info_text          TEXT
);
CREATE INDEX IF NOT EXISTS message_task_idx ON message(task_id);
"#;

const TASK_COLS: &str = r#"id, task_type, action, queue_name, label, status,
    sender_url, receiver_url, sender_ssl_cert, receiver_ssl_cert,
    is_received, is_local, parent_id, "order", input_data, output_data,
    reservation_data, task_metadata, created_date, last_modified_date,
    pingback_date, expiration_date, info_text"#;

const MESSAGE_COLS: &str = "id, action, queue_name, sender_url, receiver_url, \
    is_received, sender_ssl_cert, receiver_ssl_cert, input_data, \
    output_status, task_id, created_date, pingback_date, expiration_date, \
    info_text";

/// Columns the CLI may filter on.  Anything else is rejected instead of
/// being interpolated into SQL.
const TASK_FILTER_COLS: &[&str] = &[
    "action",
    "queue_name",
    "status",
    "task_type",
    "sender_url",
    "receiver_url",
    "label",
];
const MESSAGE_FILTER_COLS: &[&str] =
    &["action", "queue_name", "sender_url", "receiver_url"];

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store mutex poisoned")
    }

    // ── Task writes ───────────────────────────────────────────────────────────

    pub fn insert_task(&self, t: &TaskRow) -> Result<(), StoreError> {
        self.conn().execute(
            r#"INSERT INTO task (id, task_type, action, queue_name, label, status,
                sender_url, receiver_url, sender_ssl_cert, receiver_ssl_cert,
                is_received, is_local, parent_id, "order", input_data, output_data,
                reservation_data, task_metadata, created_date, last_modified_date,
                pingback_date, expiration_date, info_text)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)"#,
            params![
                t.id.to_string(),
                t.task_type.as_str(),
                t.action,
                t.queue_name,
                t.label,
                t.status.as_str(),
                t.sender_url,
                t.receiver_url,
                t.sender_ssl_cert,
                t.receiver_ssl_cert,
                t.is_received,
                t.is_local,
                t.parent_id.map(|p| p.to_string()),
                t.order,
                json_to_sql(t.input_data.as_ref())?,
                json_to_sql(t.output_data.as_ref())?,
                json_to_sql(t.reservation_data.as_ref())?,
                json_to_sql(t.task_metadata.as_ref())?,
                dt_to_sql(&t.created_date),
                dt_to_sql(&t.last_modified_date),
                t.pingback_date.as_ref().map(dt_to_sql),
                t.expiration_date.as_ref().map(dt_to_sql),
                t.info_text,
            ],
        )?;
        Ok(())
    }

    /// Set the status and bump `last_modified_date`.
    pub fn update_task_status(&self, id: Uuid, status: TaskStatus) -> Result<(), StoreError> {
        let n = self.conn().execute(
            "UPDATE task SET status = ?1, last_modified_date = ?2 WHERE id = ?3",
            params![status.as_str(), dt_to_sql(&Utc::now()), id.to_string()],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound {
                kind: "task",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    pub fn set_task_type(&self, id: Uuid, kind: TaskKind) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE task SET task_type = ?1, last_modified_date = ?2 WHERE id = ?3",
            params![kind.as_str(), dt_to_sql(&Utc::now()), id.to_string()],
        )?;
        Ok(())
    }

    pub fn set_task_output(&self, id: Uuid, output: &Value) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE task SET output_data = ?1, last_modified_date = ?2 WHERE id = ?3",
            params![
                serde_json::to_string(output)?,
                dt_to_sql(&Utc::now()),
                id.to_string()
            ],
        )?;
        Ok(())
    }

    pub fn set_task_input(&self, id: Uuid, input: &Value) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE task SET input_data = ?1, last_modified_date = ?2 WHERE id = ?3",
            params![
                serde_json::to_string(input)?,
                dt_to_sql(&Utc::now()),
                id.to_string()
            ],
        )?;
        Ok(())
    }

    pub fn set_task_reservation(
        &self,
        id: Uuid,
        data: Option<&Value>,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE task SET reservation_data = ?1, last_modified_date = ?2 WHERE id = ?3",
            params![json_to_sql(data)?, dt_to_sql(&Utc::now()), id.to_string()],
        )?;
        Ok(())
    }

    pub fn set_task_receiver_cert(&self, id: Uuid, pem: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE task SET receiver_ssl_cert = ?1 WHERE id = ?2",
            params![pem, id.to_string()],
        )?;
        Ok(())
    }

    pub fn touch_task(&self, id: Uuid) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE task SET last_modified_date = ?1 WHERE id = ?2",
            params![dt_to_sql(&Utc::now()), id.to_string()],
        )?;
        Ok(())
    }

    // ── Task reads ────────────────────────────────────────────────────────────

    pub fn try_task(&self, id: Uuid) -> Result<Option<TaskRow>, StoreError> {
        let sql = format!("SELECT {TASK_COLS} FROM task WHERE id = ?1");
        let raw = self
            .conn()
            .query_row(&sql, params![id.to_string()], read_task)
            .optional()?;
        raw.map(TaskRow::try_from).transpose()
    }

    pub fn task(&self, id: Uuid) -> Result<TaskRow, StoreError> {
        self.try_task(id)?.ok_or(StoreError::NotFound {
            kind: "task",
            id: id.to_string(),
        })
    }

    /// First task whose id starts with `prefix` (CLI convenience).
    pub fn task_by_prefix(&self, prefix: &str) -> Result<Option<TaskRow>, StoreError> {
        let sql = format!(
            "SELECT {TASK_COLS} FROM task WHERE id LIKE ?1 ORDER BY created_date LIMIT 1"
        );
        let raw = self
            .conn()
            .query_row(&sql, params![format!("{prefix}%")], read_task)
            .optional()?;
        raw.map(TaskRow::try_from).transpose()
    }

    /// Children of `parent` in ascending `"order"`.
    pub fn children_ordered(&self, parent: Uuid) -> Result<Vec<TaskRow>, StoreError> {
        let sql = format!(
            r#"SELECT {TASK_COLS} FROM task WHERE parent_id = ?1 ORDER BY "order""#
        );
        self.query_tasks(&sql, params![parent.to_string()])
    }

    /// The lowest-ordered child that is not yet finished, if any.
    pub fn next_pending_child(&self, parent: Uuid) -> Result<Option<TaskRow>, StoreError> {
        let sql = format!(
            r#"SELECT {TASK_COLS} FROM task
               WHERE parent_id = ?1 AND status != 'finished'
               ORDER BY "order" LIMIT 1"#
        );
        let raw = self
            .conn()
            .query_row(&sql, params![parent.to_string()], read_task)
            .optional()?;
        raw.map(TaskRow::try_from).transpose()
    }

    pub fn unfinished_children(&self, parent: Uuid) -> Result<i64, StoreError> {
        let n = self.conn().query_row(
            "SELECT COUNT(*) FROM task WHERE parent_id = ?1 AND status != 'finished'",
            params![parent.to_string()],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    pub fn errored_children(&self, parent: Uuid) -> Result<Vec<TaskRow>, StoreError> {
        let sql = format!(
            r#"SELECT {TASK_COLS} FROM task
               WHERE parent_id = ?1 AND status = 'error' ORDER BY "order""#
        );
        self.query_tasks(&sql, params![parent.to_string()])
    }

    pub fn count_children(&self, parent: Uuid) -> Result<i64, StoreError> {
        let n = self.conn().query_row(
            "SELECT COUNT(*) FROM task WHERE parent_id = ?1",
            params![parent.to_string()],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    pub fn child_by_label(
        &self,
        parent: Uuid,
        label: &str,
    ) -> Result<Option<TaskRow>, StoreError> {
        let sql = format!(
            "SELECT {TASK_COLS} FROM task WHERE parent_id = ?1 AND label = ?2 LIMIT 1"
        );
        let raw = self
            .conn()
            .query_row(&sql, params![parent.to_string(), label], read_task)
            .optional()?;
        raw.map(TaskRow::try_from).transpose()
    }

    pub fn sibling_by_label(
        &self,
        task: &TaskRow,
        label: &str,
    ) -> Result<Option<TaskRow>, StoreError> {
        let Some(parent) = task.parent_id else {
            return Ok(None);
        };
        let sql = format!(
            "SELECT {TASK_COLS} FROM task \
             WHERE parent_id = ?1 AND id != ?2 AND label = ?3 LIMIT 1"
        );
        let raw = self
            .conn()
            .query_row(
                &sql,
                params![parent.to_string(), task.id.to_string(), label],
                read_task,
            )
            .optional()?;
        raw.map(TaskRow::try_from).transpose()
    }

    pub fn prev_sibling(&self, task: &TaskRow) -> Result<Option<TaskRow>, StoreError> {
        let (Some(parent), Some(order)) = (task.parent_id, task.order) else {
            return Ok(None);
        };
        if order == 0 {
            return Ok(None);
        }
        self.sibling_at(parent, order - 1)
    }

    pub fn next_sibling(&self, task: &TaskRow) -> Result<Option<TaskRow>, StoreError> {
        let (Some(parent), Some(order)) = (task.parent_id, task.order) else {
            return Ok(None);
        };
        self.sibling_at(parent, order + 1)
    }

    fn sibling_at(&self, parent: Uuid, order: i64) -> Result<Option<TaskRow>, StoreError> {
        let sql = format!(
            r#"SELECT {TASK_COLS} FROM task WHERE parent_id = ?1 AND "order" = ?2 LIMIT 1"#
        );
        let raw = self
            .conn()
            .query_row(&sql, params![parent.to_string(), order], read_task)
            .optional()?;
        raw.map(TaskRow::try_from).transpose()
    }

    pub fn siblings(&self, task: &TaskRow) -> Result<Vec<TaskRow>, StoreError> {
        let Some(parent) = task.parent_id else {
            return Ok(Vec::new());
        };
        let sql = format!(
            r#"SELECT {TASK_COLS} FROM task
               WHERE parent_id = ?1 AND id != ?2 ORDER BY "order""#
        );
        self.query_tasks(&sql, params![parent.to_string(), task.id.to_string()])
    }

    /// Most recent tasks first, optionally filtered by `column=value` pairs.
    pub fn recent_tasks(
        &self,
        limit: usize,
        filters: &[(String, String)],
    ) -> Result<Vec<TaskRow>, StoreError> {
        let (where_clause, args) = build_filters(filters, TASK_FILTER_COLS)?;
        let sql = format!(
            "SELECT {TASK_COLS} FROM task {where_clause} \
             ORDER BY created_date DESC LIMIT {limit}"
        );
        self.query_tasks(&sql, rusqlite::params_from_iter(args.iter()))
    }

    fn query_tasks<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<TaskRow>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, read_task)?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(TaskRow::try_from(raw?)?);
        }
        Ok(out)
    }

    // ── Message writes ────────────────────────────────────────────────────────

    pub fn insert_message(&self, m: &MessageRow) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO message (id, action, queue_name, sender_url, receiver_url, \
                is_received, sender_ssl_cert, receiver_ssl_cert, input_data, \
                output_status, task_id, created_date, pingback_date, \
                expiration_date, info_text)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                m.id.to_string(),
                m.action,
                m.queue_name,
                m.sender_url,
                m.receiver_url,
                m.is_received,
                m.sender_ssl_cert,
                m.receiver_ssl_cert,
                json_to_sql(m.input_data.as_ref())?,
                m.output_status,
                m.task_id.map(|t| t.to_string()),
                dt_to_sql(&m.created_date),
                m.pingback_date.as_ref().map(dt_to_sql),
                m.expiration_date.as_ref().map(dt_to_sql),
                m.info_text,
            ],
        )?;
        Ok(())
    }

    pub fn set_message_output_status(&self, id: Uuid, status: u16) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE message SET output_status = ?1 WHERE id = ?2",
            params![status, id.to_string()],
        )?;
        Ok(())
    }

    pub fn set_message_receiver_cert(&self, id: Uuid, pem: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE message SET receiver_ssl_cert = ?1 WHERE id = ?2",
            params![pem, id.to_string()],
        )?;
        Ok(())
    }

    pub fn set_message_task_id(&self, id: Uuid, task_id: Uuid) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE message SET task_id = ?1 WHERE id = ?2",
            params![task_id.to_string(), id.to_string()],
        )?;
        Ok(())
    }

    // ── Message reads ─────────────────────────────────────────────────────────

    pub fn try_message(&self, id: Uuid) -> Result<Option<MessageRow>, StoreError> {
        let sql = format!("SELECT {MESSAGE_COLS} FROM message WHERE id = ?1");
        let raw = self
            .conn()
            .query_row(&sql, params![id.to_string()], read_message)
            .optional()?;
        raw.map(MessageRow::try_from).transpose()
    }

    pub fn message(&self, id: Uuid) -> Result<MessageRow, StoreError> {
        self.try_message(id)?.ok_or(StoreError::NotFound {
            kind: "message",
            id: id.to_string(),
        })
    }

    pub fn message_by_prefix(&self, prefix: &str) -> Result<Option<MessageRow>, StoreError> {
        let sql = format!(
            "SELECT {MESSAGE_COLS} FROM message WHERE id LIKE ?1 \
             ORDER BY created_date LIMIT 1"
        );
        let raw = self
            .conn()
            .query_row(&sql, params![format!("{prefix}%")], read_message)
            .optional()?;
        raw.map(MessageRow::try_from).transpose()
    }

    pub fn recent_messages(
        &self,
        limit: usize,
        filters: &[(String, String)],
    ) -> Result<Vec<MessageRow>, StoreError> {
        let (where_clause, args) = build_filters(filters, MESSAGE_FILTER_COLS)?;
        let sql = format!(
            "SELECT {MESSAGE_COLS} FROM message {where_clause} \
             ORDER BY created_date DESC LIMIT {limit}"
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), read_message)?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(MessageRow::try_from(raw?)?);
        }
        Ok(out)
    }
}

// ── Filters ───────────────────────────────────────────────────────────────────

fn build_filters(
    filters: &[(String, String)],
    allowed: &[&str],
) -> Result<(String, Vec<String>), StoreError> {
    if filters.is_empty() {
        return Ok((String::new(), Vec::new()));
    }
    let mut clauses = Vec::new();
    let mut args = Vec::new();
    for (key, value) in filters {
        if !allowed.contains(&key.as_str()) {
            return Err(StoreError::Invalid {
                what: "filter column",
                value: key.clone(),
            });
        }
        clauses.push(format!("{key} = ?"));
        args.push(value.clone());
    }
    Ok((format!("WHERE {}", clauses.join(" AND ")), args))
}

// ── Row mapping ───────────────────────────────────────────────────────────────

struct RawTask {
    id: String,
    task_type: String,
    action: String,
    queue_name: String,
    label: Option<String>,
    status: String,
    sender_url: String,
    receiver_url: String,
    sender_ssl_cert: Option<String>,
    receiver_ssl_cert: Option<String>,
    is_received: bool,
    is_local: bool,
    parent_id: Option<String>,
    order: Option<i64>,
    input_data: Option<String>,
    output_data: Option<String>,
    reservation_data: Option<String>,
    task_metadata: Option<String>,
    created_date: String,
    last_modified_date: String,
    pingback_date: Option<String>,
    expiration_date: Option<String>,
    info_text: Option<String>,
}

fn read_task(row: &Row<'_>) -> rusqlite::Result<RawTask> {
    Ok(RawTask {
        id: row.get(0)?,
        task_type: row.get(1)?,
        action: row.get(2)?,
        queue_name: row.get(3)?,
        label: row.get(4)?,
        status: row.get(5)?,
        sender_url: row.get(6)?,
        receiver_url: row.get(7)?,
        sender_ssl_cert: row.get(8)?,
        receiver_ssl_cert: row.get(9)?,
        is_received: row.get(10)?,
        is_local: row.get(11)?,
        parent_id: row.get(12)?,
        order: row.get(13)?,
        input_data: row.get(14)?,
        output_data: row.get(15)?,
        reservation_data: row.get(16)?,
        task_metadata: row.get(17)?,
        created_date: row.get(18)?,
        last_modified_date: row.get(19)?,
        pingback_date: row.get(20)?,
        expiration_date: row.get(21)?,
        info_text: row.get(22)?,
    })
}

impl TryFrom<RawTask> for TaskRow {
    type Error = StoreError;

    fn try_from(r: RawTask) -> Result<Self, StoreError> {
        Ok(TaskRow {
            id: uuid_from_sql(&r.id)?,
            task_type: TaskKind::parse(&r.task_type)?,
            action: r.action,
            queue_name: r.queue_name,
            label: r.label,
            status: TaskStatus::parse(&r.status)?,
            sender_url: r.sender_url,
            receiver_url: r.receiver_url,
            sender_ssl_cert: r.sender_ssl_cert,
            receiver_ssl_cert: r.receiver_ssl_cert,
            is_received: r.is_received,
            is_local: r.is_local,
            parent_id: r.parent_id.as_deref().map(uuid_from_sql).transpose()?,
            order: r.order,
            input_data: json_from_sql(r.input_data)?,
            output_data: json_from_sql(r.output_data)?,
            reservation_data: json_from_sql(r.reservation_data)?,
            task_metadata: json_from_sql(r.task_metadata)?,
            created_date: dt_from_sql(&r.created_date)?,
            last_modified_date: dt_from_sql(&r.last_modified_date)?,
            pingback_date: r.pingback_date.as_deref().map(dt_from_sql).transpose()?,
            expiration_date: r.expiration_date.as_deref().map(dt_from_sql).transpose()?,
            info_text: r.info_text,
        })
    }
}

struct RawMessage {
    id: String,
    action: String,
    queue_name: String,
    sender_url: String,
    receiver_url: String,
    is_received: bool,
    sender_ssl_cert: Option<String>,
    receiver_ssl_cert: Option<String>,
    input_data: Option<String>,
    output_status: Option<u16>,
    task_id: Option<String>,
    created_date: String,
    pingback_date: Option<String>,
    expiration_date: Option<String>,
    info_text: Option<String>,
}

fn read_message(row: &Row<'_>) -> rusqlite::Result<RawMessage> {
    Ok(RawMessage {
        id: row.get(0)?,
        action: row.get(1)?,
        queue_name: row.get(2)?,
        sender_url: row.get(3)?,
        receiver_url: row.get(4)?,
        is_received: row.get(5)?,
        sender_ssl_cert: row.get(6)?,
        receiver_ssl_cert: row.get(7)?,
        input_data: row.get(8)?,
        output_status: row.get(9)?,
        task_id: row.get(10)?,
        created_date: row.get(11)?,
        pingback_date: row.get(12)?,
        expiration_date: row.get(13)?,
        info_text: row.get(14)?,
    })
}

impl TryFrom<RawMessage> for MessageRow {
    type Error = StoreError;

    fn try_from(r: RawMessage) -> Result<Self, StoreError> {
        Ok(MessageRow {
            id: uuid_from_sql(&r.id)?,
            action: r.action,
            queue_name: r.queue_name,
            sender_url: r.sender_url,
            receiver_url: r.receiver_url,
            is_received: r.is_received,
            sender_ssl_cert: r.sender_ssl_cert,
            receiver_ssl_cert: r.receiver_ssl_cert,
            input_data: json_from_sql(r.input_data)?,
            output_status: r.output_status,
            task_id: r.task_id.as_deref().map(uuid_from_sql).transpose()?,
            created_date: dt_from_sql(&r.created_date)?,
            pingback_date: r.pingback_date.as_deref().map(dt_from_sql).transpose()?,
            expiration_date: r.expiration_date.as_deref().map(dt_from_sql).transpose()?,
            info_text: r.info_text,
        })
    }
}

// ── Column codecs ─────────────────────────────────────────────────────────────

fn dt_to_sql(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn dt_from_sql(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| StoreError::Invalid {
            what: "datetime column",
            value: s.to_string(),
        })
}

fn uuid_from_sql(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|_| StoreError::Invalid {
        what: "uuid column",
        value: s.to_string(),
    })
}

fn json_to_sql(v: Option<&Value>) -> Result<Option<String>, StoreError> {
    v.map(|v| serde_json::to_string(v).map_err(StoreError::from))
        .transpose()
}

fn json_from_sql(s: Option<String>) -> Result<Option<Value>, StoreError> {
    s.map(|s| serde_json::from_str(&s).map_err(StoreError::from))
        .transpose()
}

// ── Unit tests ────────────────────────────────────────────────────────────────
