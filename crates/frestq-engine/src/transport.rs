// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Outbound HTTP transport.
//!
//! One trait seam so the engine can be exercised without sockets: the real
//! [`HttpTransport`] posts envelopes with reqwest, [`LoopbackTransport`]
//! short-circuits into the local engine's receive path.
//!
//! Peer identity is pinned-certificate comparison against the certificate
//! captured at first contact, not CA validation, so the client accepts
//! self-signed server certificates and records what the peer presented.

use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;

use crate::{certs, engine::Engine, envelope::Envelope, EngineError};

/// Result of one outbound POST.
#[derive(Debug, Clone)]
pub struct PostOutcome {
    pub status: u16,
    /// PEM of the certificate the peer presented on the TLS session, when
    /// TLS was used.
    pub peer_cert_pem: Option<String>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, url: &str, body: String) -> Result<PostOutcome, EngineError>;
}

// ── reqwest transport ─────────────────────────────────────────────────────────

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Plain HTTP client, no TLS identity.
    pub fn new() -> Result<Self, EngineError> {
        Self::build(None)
    }

    /// Client presenting `cert_pem`/`key_pem` on outbound TLS handshakes.
    pub fn with_identity(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, EngineError> {
        let mut bundle = cert_pem.to_vec();
        bundle.extend_from_slice(key_pem);
        Self::build(Some(bundle))
    }

    fn build(identity_pem: Option<Vec<u8>>) -> Result<Self, EngineError> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .tls_info(true)
            // identity is checked by pinned-certificate comparison after the
            // exchange, not by CA chain
            .danger_accept_invalid_certs(true);
        if let Some(pem) = identity_pem {
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| EngineError::Transport(format!("loading client identity: {e}")))?;
            builder = builder.identity(identity);
        }
        let client = builder
            .build()
            .map_err(|e| EngineError::Transport(format!("building http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, url: &str, body: String) -> Result<PostOutcome, EngineError> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        let peer_cert_pem = response
            .extensions()
            .get::<reqwest::tls::TlsInfo>()
            .and_then(|info| info.peer_certificate())
            .map(certs::der_to_pem);

        Ok(PostOutcome {
            status: response.status().as_u16(),
            peer_cert_pem,
        })
    }
}

// ── Loopback transport ────────────────────────────────────────────────────────

/// Routes every POST straight into an attached engine's receive path,
/// matched by root-URL prefix.  Several engines may attach, which makes
/// whole multi-node exchanges runnable inside one process.  For tests and
/// demos; carries no TLS identity.
pub struct LoopbackTransport {
    engines: Mutex<Vec<Weak<Engine>>>,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            engines: Mutex::new(Vec::new()),
        })
    }

    /// Register an engine as a reachable peer.  Needed after construction
    /// because each engine owns (a handle to) the transport.
    pub fn attach(&self, engine: &Arc<Engine>) {
        self.engines
            .lock()
            .expect("loopback lock")
            .push(Arc::downgrade(engine));
    }

    fn engine_for(&self, url: &str) -> Option<Arc<Engine>> {
        self.engines
            .lock()
            .expect("loopback lock")
            .iter()
            .filter_map(Weak::upgrade)
            .find(|engine| url.starts_with(engine.root_url()))
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn post(&self, url: &str, body: String) -> Result<PostOutcome, EngineError> {
        let engine = self
            .engine_for(url)
            .ok_or_else(|| EngineError::Transport(format!("no loopback peer serves {url}")))?;

        let queue = url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();

        let envelope: Envelope = match serde_json::from_str(&body) {
            Ok(env) => env,
            Err(_) => {
                return Ok(PostOutcome {
                    status: 400,
                    peer_cert_pem: None,
                })
            }
        };

        let status = match engine.receive_envelope(&queue, envelope, None).await {
            Ok(()) => 200,
            Err(EngineError::Routing { .. }) => 404,
            Err(_) => 400,
        };
        Ok(PostOutcome {
            status,
            peer_cert_pem: None,
        })
    }
}
