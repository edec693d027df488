// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The single ingress endpoint: `POST {root path}/{queue_name}/`.
//!
//! This is a thin HTTP shim over `Engine::receive_envelope`.  Its only own
//! responsibilities are JSON parsing (400 on failure), peer-certificate
//! header extraction, and mapping engine errors to the protocol's status
//! surface: 200 accepted, 400 invalid, 404 unknown action/queue.  Nothing
//! else is ever emitted.
//!
//! The peer certificate header is how a terminating proxy forwards the
//! client certificate; nginx replaces its newlines with tabs so it fits in
//! a header value, and those tabs are stripped here.  A PEM never contains
//! tabs, so the strip is safe for direct senders too.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use frestq_engine::{Engine, EngineError, Envelope};
use serde_json::json;
use tracing::warn;
use tower_http::limit::RequestBodyLimitLayer;

/// Maximum envelope size.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

#[derive(Clone)]
pub(crate) struct IngressState {
    pub engine: Arc<Engine>,
    pub peer_cert_header: String,
}

/// Build the ingress router.  `base_path` is the path portion of the
/// node's root URL, e.g. `/api/queues`.
pub(crate) fn router(engine: Arc<Engine>, base_path: &str, peer_cert_header: String) -> Router {
    let route = format!("{base_path}/:queue_name/");
    Router::new()
        .route(&route, post(post_message))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(IngressState {
            engine,
            peer_cert_header,
        })
}

async fn post_message(
    State(state): State<IngressState>,
    Path(queue_name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let envelope: Envelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => return reject(StatusCode::BAD_REQUEST, format!("invalid message: {e}")),
    };

    let peer_cert = headers
        .get(state.peer_cert_header.as_str())
        .and_then(|value| value.to_str().ok())
        .map(|pem| pem.replace('\t', ""));

    match state.engine.receive_envelope(&queue_name, envelope, peer_cert).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(EngineError::Routing { action, queue }) => reject(
            StatusCode::NOT_FOUND,
            format!("no handler for action {action} in queue {queue}"),
        ),
        Err(e @ EngineError::Security(_)) => {
            warn!("rejected message: {e}");
            reject(StatusCode::BAD_REQUEST, e.to_string())
        }
        Err(e) => reject(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

fn reject(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "message": message }))).into_response()
}
