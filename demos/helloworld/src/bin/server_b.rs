// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Hello-world receiver node.  Run this first, then `server_a`.

use std::sync::Arc;

use async_trait::async_trait;
use frestq_config::FrestqConfig;
use frestq_engine::{TaskContext, TaskHandler};
use frestq_node::FrestqApp;
use serde_json::{json, Value};

struct HelloWorldHandler;

#[async_trait]
impl TaskHandler for HelloWorldHandler {
    async fn execute(&self, task: &mut TaskContext) -> anyhow::Result<Option<Value>> {
        let username = task
            .input_data()
            .and_then(|d| d.get("username"))
            .and_then(Value::as_str)
            .unwrap_or("stranger")
            .to_string();
        tracing::info!("saying hello to {username}");
        Ok(Some(json!(format!("hello {username}!"))))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let mut config = FrestqConfig::default();
    config.root_url = "http://127.0.0.1:5001/api/queues".into();
    config.bind = "127.0.0.1:5001".into();
    config.database = "db_b.sqlite".into();

    let mut app = FrestqApp::new(config);
    app.register_task_handler("testing.hello_world", "hello_world", Arc::new(HelloWorldHandler))?;
    app.build().await?.serve().await?;
    Ok(())
}
