// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Node assembly — wires all subsystems and serves.
//!
//! # Startup sequence
//!
//! [`FrestqApp::build`] performs these steps in order:
//!
//! 1. Load the TLS identity PEM into memory (empty when TLS is off).
//! 2. Open the SQLite store and apply the schema.
//! 3. Build the outbound transport (client certificate attached when
//!    configured).
//! 4. Assemble the engine: internal protocol actions join the registered
//!    application handlers, pools are reserved per queue.
//! 5. Mount the ingress router under the root URL's path.
//!
//! Serving ([`Node::serve`]) then starts the pools and binds the listener,
//! with TLS when an identity is configured.  [`Node::serve_on`] accepts a
//! pre-bound listener so tests and demos can use ephemeral ports.

use std::sync::Arc;

use axum::Router;
use frestq_config::FrestqConfig;
use frestq_engine::{
    ActivityLog, Engine, EngineSettings, HandlerRegistry, HttpTransport, MessageHandler,
    TaskHandler, Transport,
};
use frestq_store::Store;
use tracing::info;

use crate::{error::NodeError, ingress, tls};

/// A frestq node under construction: configuration plus the application's
/// action handlers.
pub struct FrestqApp {
    config: FrestqConfig,
    registry: HandlerRegistry,
}

impl FrestqApp {
    pub fn new(config: FrestqConfig) -> Self {
        Self {
            config,
            registry: HandlerRegistry::new(),
        }
    }

    /// Register a task action handler on `(action, queue)`, reserving the
    /// queue's worker pool.
    pub fn register_task_handler(
        &mut self,
        action: &str,
        queue: &str,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<&mut Self, NodeError> {
        self.registry.register_task(action, queue, handler)?;
        Ok(self)
    }

    /// Register a plain message action handler.
    pub fn register_message_handler(
        &mut self,
        action: &str,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<&mut Self, NodeError> {
        self.registry.register_message(action, queue, handler)?;
        Ok(self)
    }

    /// Assemble the node.  After this the registry is frozen.
    pub async fn build(self) -> Result<Node, NodeError> {
        let config = self.config;

        let ssl_cert_string = config
            .load_cert_string()
            .map_err(|e| NodeError::Config(format!("{e:#}")))?;

        let store = Store::open(&config.database)?;

        let transport: Arc<dyn Transport> = if config.tls_enabled() {
            let cert_path = config.ssl.cert_path.as_ref().expect("tls_enabled checked");
            let key_path = config.ssl.key_path.as_ref().expect("tls_enabled checked");
            tls::validate_cert_file(cert_path)?;
            let cert = std::fs::read(cert_path)?;
            let key = std::fs::read(key_path)?;
            Arc::new(HttpTransport::with_identity(&cert, &key)?)
        } else {
            Arc::new(HttpTransport::new()?)
        };

        let activity = match &config.activity_log {
            Some(path) => Some(ActivityLog::open(path)?),
            None => None,
        };

        let settings = EngineSettings {
            root_url: config.root_url.clone(),
            ssl_cert_string,
            allow_only_ssl_connections: config.ssl.allow_only_ssl_connections,
            reservation_timeout: config.reservation_timeout(),
            queue_max_threads: config
                .queues
                .iter()
                .filter_map(|(name, opts)| opts.max_threads.map(|n| (name.clone(), n)))
                .collect(),
        };

        let engine = Engine::new(settings, store, self.registry, transport, activity)?;
        let router = ingress::router(
            engine.clone(),
            config.root_url_path(),
            config.ssl.peer_cert_header.clone(),
        );

        Ok(Node {
            engine,
            router,
            config,
        })
    }
}

/// An assembled node, ready to serve.
pub struct Node {
    engine: Arc<Engine>,
    router: Router,
    config: FrestqConfig,
}

impl Node {
    /// The engine handle, for creating tasks and inspecting the store.
    pub fn engine(&self) -> Arc<Engine> {
        self.engine.clone()
    }

    /// Start the pools and serve on the configured bind address, with TLS
    /// when an identity is configured.  Blocks until shutdown.
    pub async fn serve(self) -> Result<(), NodeError> {
        let addr: std::net::SocketAddr = self
            .config
            .bind
            .parse()
            .map_err(|e| NodeError::Config(format!("invalid bind address: {e}")))?;

        self.engine.start_pools();
        info!(%addr, root_url = %self.config.root_url, "frestq node serving");

        if self.config.tls_enabled() {
            let cert = self.config.ssl.cert_path.as_ref().expect("tls_enabled checked");
            let key = self.config.ssl.key_path.as_ref().expect("tls_enabled checked");
            let rustls = tls::rustls_config(cert, key).await?;
            axum_server::bind_rustls(addr, rustls)
                .serve(self.router.into_make_service())
                .await?;
        } else {
            axum_server::bind(addr)
                .serve(self.router.into_make_service())
                .await?;
        }
        Ok(())
    }

    /// Start the pools and serve plain HTTP on an already-bound listener.
    pub async fn serve_on(self, listener: std::net::TcpListener) -> Result<(), NodeError> {
        // the async acceptor requires a non-blocking socket
        listener.set_nonblocking(true)?;
        self.engine.start_pools();
        info!(addr = ?listener.local_addr().ok(), "frestq node serving on existing listener");
        axum_server::from_tcp(listener)
            .serve(self.router.into_make_service())
            .await?;
        Ok(())
    }
}
