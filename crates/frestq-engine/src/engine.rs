// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Engine assembly and the transport-independent receive path.
//!
//! The [`Engine`] is the explicit context threaded through everything:
//! settings, store, the frozen handler registry, the per-queue pools, the
//! outbound transport and the reservation notifier.  There are no ambient
//! globals; handlers get the engine through their task context.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use frestq_store::{MessageRow, Store};
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    certs,
    envelope::Envelope,
    pool::{ActivityLog, PoolSet},
    protocol,
    registry::{HandlerKind, HandlerRegistry},
    tasks,
    transport::Transport,
    EngineError,
};

/// The engine's view of the node configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Canonical receiver URL of this node; local/remote discrimination.
    pub root_url: String,
    /// This node's PEM identity; empty when TLS is off, which softens every
    /// peer-certificate check.
    pub ssl_cert_string: String,
    /// Require a non-empty peer certificate on every cross-node message.
    pub allow_only_ssl_connections: bool,
    /// Default reservation expiry.
    pub reservation_timeout: Duration,
    /// Per-queue concurrency caps, applied at pool start.
    pub queue_max_threads: HashMap<String, usize>,
}

pub struct Engine {
    settings: EngineSettings,
    store: Store,
    registry: HandlerRegistry,
    pools: PoolSet,
    transport: Arc<dyn Transport>,
    reserve_signal: Notify,
}

impl Engine {
    /// Assemble an engine.  The internal protocol actions are registered
    /// here; the registry is immutable afterwards.
    pub fn new(
        settings: EngineSettings,
        store: Store,
        mut registry: HandlerRegistry,
        transport: Arc<dyn Transport>,
        activity: Option<ActivityLog>,
    ) -> Result<Arc<Self>, EngineError> {
        protocol::register_internal(&mut registry)?;

        let pools = PoolSet::new(activity);
        for queue in registry.queue_names() {
            pools.reserve(queue);
        }

        Ok(Arc::new(Self {
            settings,
            store,
            registry,
            pools,
            transport,
            reserve_signal: Notify::new(),
        }))
    }

    /// Open the pools for dispatch.  Called once configuration is complete,
    /// right before the ingress starts accepting.
    pub fn start_pools(&self) {
        info!(root_url = %self.settings.root_url, "starting queue pools");
        self.pools.start_all(&self.settings.queue_max_threads);
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn root_url(&self) -> &str {
        &self.settings.root_url
    }

    /// This node's PEM identity ("" when TLS is off).
    pub fn local_cert(&self) -> &str {
        &self.settings.ssl_cert_string
    }

    pub(crate) fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn reserve_signal(&self) -> &Notify {
        &self.reserve_signal
    }

    pub(crate) fn reservation_timeout(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.settings.reservation_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(60))
    }

    /// Whether peer-certificate checks are live.  With no local identity
    /// and no strict flag everything softens to no-ops.
    fn cert_checks_enabled(&self) -> bool {
        !self.settings.ssl_cert_string.is_empty() || self.settings.allow_only_ssl_connections
    }

    /// Constant-time comparison of a presented certificate against the
    /// stored counterpart.  Any mismatch aborts the operation with no state
    /// change.
    pub(crate) fn verify_counterpart(
        &self,
        presented: Option<&str>,
        stored: Option<&str>,
        what: &str,
    ) -> Result<(), EngineError> {
        if !self.cert_checks_enabled() {
            return Ok(());
        }
        if certs::certs_differ(presented, stored) {
            return Err(EngineError::Security(format!(
                "peer certificate mismatch on {what}"
            )));
        }
        Ok(())
    }

    pub(crate) fn submit_now<F>(&self, queue: &str, func: &'static str, fut: F)
    where
        F: std::future::Future<Output = Result<(), EngineError>> + Send + 'static,
    {
        self.pools.submit_now(queue, func, fut);
    }

    pub(crate) fn submit_at<F>(
        &self,
        queue: &str,
        func: &'static str,
        when: DateTime<Utc>,
        fut: F,
    ) where
        F: std::future::Future<Output = Result<(), EngineError>> + Send + 'static,
    {
        self.pools.submit_at(queue, func, when, fut);
    }

    // ── Ingress core ──────────────────────────────────────────────────────────

    /// Accept one envelope addressed to `queue_name`.
    ///
    /// This is the whole ingress contract minus HTTP: envelope validation,
    /// the local-message certificate check, message persistence, handler
    /// lookup and pool submission.  The axum handler and the loopback
    /// transport both call it; errors map to the 400/404 surface there.
    /// `peer_cert` is the already tab-stripped PEM presented by the peer,
    /// if any.
    pub async fn receive_envelope(
        self: &Arc<Self>,
        queue_name: &str,
        envelope: Envelope,
        peer_cert: Option<String>,
    ) -> Result<(), EngineError> {
        debug!(message = %envelope.message_id, action = %envelope.action, queue = %queue_name, "message received");

        let msg = if envelope.sender_url == self.settings.root_url {
            // local message: it must already exist, written by send_message,
            // and the presented certificate must be our own
            self.verify_counterpart(
                peer_cert.as_deref(),
                match self.local_cert() {
                    "" => None,
                    cert => Some(cert),
                },
                "local message",
            )?;
            self.store
                .try_message(envelope.message_id)?
                .ok_or_else(|| {
                    EngineError::Validation(format!(
                        "unknown local message {}",
                        envelope.message_id
                    ))
                })?
        } else {
            if self.settings.allow_only_ssl_connections
                && peer_cert.as_deref().unwrap_or("").is_empty()
            {
                return Err(EngineError::Security(
                    "cross-node message without peer certificate".into(),
                ));
            }
            let row = MessageRow {
                id: envelope.message_id,
                action: envelope.action.clone(),
                queue_name: queue_name.to_string(),
                sender_url: envelope.sender_url.clone(),
                receiver_url: self.settings.root_url.clone(),
                is_received: true,
                sender_ssl_cert: peer_cert.filter(|c| !c.is_empty()),
                receiver_ssl_cert: None,
                input_data: envelope.data.clone(),
                output_status: Some(200),
                task_id: envelope.task_id,
                created_date: Utc::now(),
                pingback_date: envelope.pingback_date,
                expiration_date: envelope.expiration_date,
                info_text: envelope.info.clone(),
            };
            self.store.insert_message(&row)?;
            row
        };

        if self.registry.lookup(&msg.action, queue_name).is_none() {
            return Err(EngineError::Routing {
                action: msg.action.clone(),
                queue: queue_name.to_string(),
            });
        }

        let engine = self.clone();
        let msg_id = msg.id;
        let queue = queue_name.to_string();
        self.submit_now(queue_name, "deliver_message", async move {
            deliver(engine, msg_id, queue).await
        });
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("root_url", &self.settings.root_url)
            .finish_non_exhaustive()
    }
}

/// Pool-side delivery: re-load the message under a fresh view and dispatch
/// on the handler kind.
async fn deliver(engine: Arc<Engine>, msg_id: Uuid, queue: String) -> Result<(), EngineError> {
    let msg = engine.store.message(msg_id)?;
    let entry = engine
        .registry
        .lookup(&msg.action, &queue)
        .ok_or_else(|| EngineError::Routing {
            action: msg.action.clone(),
            queue: queue.clone(),
        })?;

    match entry.kind {
        HandlerKind::Message(handler) => handler
            .handle(engine.clone(), msg)
            .await
            .map_err(|e| EngineError::Handler(format!("{e:#}"))),
        HandlerKind::Task(_) => tasks::post_task(engine.clone(), msg).await,
    }
}
