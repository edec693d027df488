// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Hello-world sender node.  Posts a task to `server_b` and waits for the
//! update to come back.

use std::time::Duration;

use frestq_config::FrestqConfig;
use frestq_engine::SimpleTaskSpec;
use frestq_node::FrestqApp;
use frestq_store::TaskStatus;
use serde_json::json;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let mut config = FrestqConfig::default();
    config.root_url = "http://127.0.0.1:5000/api/queues".into();
    config.bind = "127.0.0.1:5000".into();
    config.database = "db_a.sqlite".into();

    let node = FrestqApp::new(config).build().await?;
    let engine = node.engine();
    tokio::spawn(node.serve());

    let username = std::env::args().nth(1).unwrap_or_else(|| "world".into());
    let id = engine
        .create_and_send(
            SimpleTaskSpec::new(
                "http://127.0.0.1:5001/api/queues",
                "testing.hello_world",
                "hello_world",
            )
            .data(json!({ "username": username })),
        )
        .await?;
    tracing::info!("sent task {id}");

    loop {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let task = engine.store().task(id)?;
        match task.status {
            TaskStatus::Finished => {
                println!("{}", task.output_data.unwrap_or_default());
                return Ok(());
            }
            TaskStatus::Error => anyhow::bail!("task failed"),
            _ => {}
        }
    }
}
