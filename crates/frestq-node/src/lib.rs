// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The HTTP face of a frestq node.
//!
//! Hosts the engine behind the single RESTQP ingress endpoint
//! (`POST {root path}/{queue_name}/`) and assembles configuration, store,
//! transport and handlers into a servable [`Node`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use frestq_node::FrestqApp;
//!
//! # struct MyHandler;
//! # #[async_trait::async_trait]
//! # impl frestq_engine::TaskHandler for MyHandler {
//! #     async fn execute(&self, _t: &mut frestq_engine::TaskContext)
//! #         -> anyhow::Result<Option<serde_json::Value>> { Ok(None) }
//! # }
//! # async fn run() -> Result<(), frestq_node::NodeError> {
//! let config = frestq_config::load(None).expect("config");
//! let mut app = FrestqApp::new(config);
//! app.register_task_handler("testing.hello_world", "hello_world", Arc::new(MyHandler))?;
//! app.build().await?.serve().await
//! # }
//! ```

mod app;
mod error;
mod ingress;
mod tls;

pub use app::{FrestqApp, Node};
pub use error::NodeError;
