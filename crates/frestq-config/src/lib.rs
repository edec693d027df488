// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Node configuration loaded from YAML.
//!
//! Configuration is YAML (never TOML).  Layers are **deep-merged** — you can
//! override only the fields you care about in each file.
//!
//! Search order (later overrides earlier):
//! 1. `/etc/frestq/config.yaml`
//! 2. `~/.config/frestq/config.yaml`
//! 3. `.frestq/config.yaml` (workspace-local)
//! 4. Path given to [`load`] explicitly.
//!
//! # Example full config
//! ```yaml
//! root_url: "https://127.0.0.1:5000/api/queues"
//! bind: "127.0.0.1:5000"
//! database: "frestq.sqlite"
//!
//! ssl:
//!   cert_path: "/etc/frestq/node-cert.pem"
//!   key_path: "/etc/frestq/node-key.pem"
//!   allow_only_ssl_connections: true
//!
//! queues:
//!   vote_count:
//!     max_threads: 3
//!
//! reservation_timeout_secs: 60
//! activity_log: "activity.json.log"
//! ```

mod loader;
mod schema;

pub use loader::load;
pub use schema::{FrestqConfig, QueueOptions, SslConfig};
