// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::{collections::HashMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

fn default_root_url() -> String {
    "http://127.0.0.1:5000/api/queues".to_string()
}
fn default_bind() -> String {
    "127.0.0.1:5000".to_string()
}
fn default_database() -> PathBuf {
    PathBuf::from("frestq.sqlite")
}
fn default_reservation_timeout() -> u64 {
    60
}
fn default_peer_cert_header() -> String {
    "X-Sender-SSL-Certificate".to_string()
}

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrestqConfig {
    /// Canonical receiver URL of this node, **including** the queue path
    /// prefix, e.g. `http://127.0.0.1:5000/api/queues`.  Messages whose
    /// `sender_url` equals this value are treated as local.
    #[serde(default = "default_root_url")]
    pub root_url: String,

    /// `host:port` the ingress listens on.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Path of the SQLite database holding the `task` and `message` tables.
    #[serde(default = "default_database")]
    pub database: PathBuf,

    #[serde(default)]
    pub ssl: SslConfig,

    /// Per-queue worker pool options, keyed by queue name.
    #[serde(default)]
    pub queues: HashMap<String, QueueOptions>,

    /// How long a reservation (the phase-one commitment of a synchronized
    /// start) may be held before it is cancelled.  Seconds.
    #[serde(default = "default_reservation_timeout")]
    pub reservation_timeout_secs: u64,

    /// Scheduler activity log (one JSON object per line).  Disabled when
    /// unset.  Purely advisory; nothing reads it back except the CLI.
    pub activity_log: Option<PathBuf>,
}

impl Default for FrestqConfig {
    fn default() -> Self {
        Self {
            root_url: default_root_url(),
            bind: default_bind(),
            database: default_database(),
            ssl: SslConfig::default(),
            queues: HashMap::new(),
            reservation_timeout_secs: default_reservation_timeout(),
            activity_log: None,
        }
    }
}

/// TLS identity and peer-certificate policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SslConfig {
    /// PEM certificate presented on outbound requests and compared against
    /// by peers.  TLS is disabled when unset, and every peer-certificate
    /// check softens to a no-op.
    pub cert_path: Option<PathBuf>,

    /// PEM private key matching `cert_path`.
    pub key_path: Option<PathBuf>,

    /// When true, every cross-node message must carry a non-empty peer
    /// certificate or it is rejected.
    #[serde(default)]
    pub allow_only_ssl_connections: bool,

    /// Request header the terminating proxy uses to forward the client
    /// certificate.  Embedded tab characters are stripped before parsing
    /// (nginx inserts them so the PEM fits in a header value).
    #[serde(default = "default_peer_cert_header")]
    pub peer_cert_header: String,
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            cert_path: None,
            key_path: None,
            allow_only_ssl_connections: false,
            peer_cert_header: default_peer_cert_header(),
        }
    }
}

/// Worker pool options for a single queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Concurrency cap for this queue's pool.  Falls back to the engine
    /// default when unset.
    pub max_threads: Option<usize>,
}

impl FrestqConfig {
    /// Whether a TLS identity is configured.
    pub fn tls_enabled(&self) -> bool {
        self.ssl.cert_path.is_some() && self.ssl.key_path.is_some()
    }

    /// Read the configured certificate into the in-memory PEM string used
    /// as this node's identity.  Empty when TLS is off.
    pub fn load_cert_string(&self) -> anyhow::Result<String> {
        match &self.ssl.cert_path {
            Some(path) => {
                use anyhow::Context;
                std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))
            }
            None => {
                tracing::warn!("no TLS certificate configured for this node");
                Ok(String::new())
            }
        }
    }

    pub fn reservation_timeout(&self) -> Duration {
        Duration::from_secs(self.reservation_timeout_secs)
    }

    /// Path portion of `root_url`, e.g. `/api/queues`.  This is where the
    /// ingress router is mounted.
    pub fn root_url_path(&self) -> &str {
        let rest = match self.root_url.find("://") {
            Some(i) => &self.root_url[i + 3..],
            None => self.root_url.as_str(),
        };
        match rest.find('/') {
            Some(i) => &rest[i..],
            None => "",
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
