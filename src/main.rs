// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use cli::{parse_filters, Cli, Commands};
use frestq_config::FrestqConfig;
use frestq_engine::{actions, Envelope, INTERNAL_QUEUE};
use frestq_node::FrestqApp;
use frestq_store::{MessageRow, Store, TaskKind, TaskRow};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = frestq_config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => FrestqApp::new(config)
            .build()
            .await?
            .serve()
            .await
            .map_err(Into::into),
        Commands::Initdb => {
            Store::open(&config.database)?;
            println!("created database {}", config.database.display());
            Ok(())
        }
        Commands::Tasks { limit, filters } => list_tasks(&config, limit, &filters),
        Commands::Messages { limit, filters } => list_messages(&config, limit, &filters),
        Commands::Show { id } => show_task(&config, &id),
        Commands::ShowMessage { id } => show_message(&config, &id),
        Commands::Tree { id, with_parents } => task_tree(&config, &id, with_parents),
        Commands::Finish { id, data } => finish_task(&config, &id, &data).await,
        Commands::Activity => show_activity(&config),
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

// ── Listings ──────────────────────────────────────────────────────────────────

fn list_tasks(config: &FrestqConfig, limit: usize, filters: &[String]) -> anyhow::Result<()> {
    let store = Store::open(&config.database)?;
    let tasks = store.recent_tasks(limit, &parse_filters(filters)?)?;

    println!(
        "{:<10} {:<26} {:<26} {:<16} {:<12} {:<10} {}",
        "id", "sender_url", "action", "queue", "type", "status", "created"
    );
    for task in tasks {
        println!(
            "{:<10} {:<26} {:<26} {:<16} {:<12} {:<10} {}",
            short(&task.id),
            trunc(&task.sender_url, 26),
            trunc(&task.action, 26),
            trunc(&task.queue_name, 16),
            task.task_type,
            task.status,
            task.created_date.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

fn list_messages(config: &FrestqConfig, limit: usize, filters: &[String]) -> anyhow::Result<()> {
    let store = Store::open(&config.database)?;
    let messages = store.recent_messages(limit, &parse_filters(filters)?)?;

    println!(
        "{:<10} {:<26} {:<30} {:<16} {:<6} {}",
        "id", "sender_url", "action", "queue", "status", "created"
    );
    for msg in messages {
        println!(
            "{:<10} {:<26} {:<30} {:<16} {:<6} {}",
            short(&msg.id),
            trunc(&msg.sender_url, 26),
            trunc(&msg.action, 30),
            trunc(&msg.queue_name, 16),
            msg.output_status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".into()),
            msg.created_date.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

// ── Single task views ─────────────────────────────────────────────────────────

fn show_task(config: &FrestqConfig, prefix: &str) -> anyhow::Result<()> {
    let store = Store::open(&config.database)?;
    let task = store
        .task_by_prefix(prefix)?
        .with_context(|| format!("task {prefix} not found"))?;
    println!("{}", serde_json::to_string_pretty(&task)?);
    Ok(())
}

fn show_message(config: &FrestqConfig, prefix: &str) -> anyhow::Result<()> {
    let store = Store::open(&config.database)?;
    let msg = store
        .message_by_prefix(prefix)?
        .with_context(|| format!("message {prefix} not found"))?;
    println!("{}", serde_json::to_string_pretty(&msg)?);
    Ok(())
}

fn task_tree(config: &FrestqConfig, prefix: &str, with_parents: bool) -> anyhow::Result<()> {
    let store = Store::open(&config.database)?;
    let mut task = store
        .task_by_prefix(prefix)?
        .with_context(|| format!("task {prefix} not found"))?;
    let base = task.id;

    if with_parents {
        while let Some(parent_id) = task.parent_id {
            task = store.task(parent_id)?;
        }
    }

    print_subtree(&store, &task, base, 0)
}

fn print_subtree(store: &Store, task: &TaskRow, base: Uuid, level: usize) -> anyhow::Result<()> {
    let indent = match level {
        0 => " *".to_string(),
        1 => "   |-".to_string(),
        n => format!("   {}|-", "|  ".repeat(n - 1)),
    };
    let mut extra = vec![short(&task.id), task.status.to_string()];
    if task.id == base {
        extra.push("root".into());
    }
    println!(
        "{indent} {}.{} - {} ({})",
        task.action,
        task.queue_name,
        task.task_type,
        extra.join(", ")
    );

    for child in store.children_ordered(task.id)? {
        print_subtree(store, &child, base, level + 1)?;
    }
    Ok(())
}

// ── External task completion ──────────────────────────────────────────────────

async fn finish_task(config: &FrestqConfig, prefix: &str, data: &str) -> anyhow::Result<()> {
    let store = Store::open(&config.database)?;
    let task = store
        .task_by_prefix(prefix)?
        .with_context(|| format!("task {prefix} not found"))?;
    if task.task_type != TaskKind::External {
        anyhow::bail!("task {} is not external", short(&task.id));
    }
    let payload: Value = serde_json::from_str(data).context("parsing the finish payload")?;

    // write the message row first: the ingress resolves local messages by id
    let msg_id = Uuid::new_v4();
    let cert = config.load_cert_string()?;
    store.insert_message(&MessageRow {
        id: msg_id,
        action: actions::FINISH_EXTERNAL_TASK.into(),
        queue_name: INTERNAL_QUEUE.into(),
        sender_url: config.root_url.clone(),
        receiver_url: task.receiver_url.clone(),
        is_received: false,
        sender_ssl_cert: if cert.is_empty() { None } else { Some(cert) },
        receiver_ssl_cert: None,
        input_data: Some(payload.clone()),
        output_status: None,
        task_id: Some(task.id),
        created_date: chrono::Utc::now(),
        pingback_date: None,
        expiration_date: None,
        info_text: None,
    })?;

    let envelope = Envelope {
        message_id: msg_id,
        action: actions::FINISH_EXTERNAL_TASK.into(),
        sender_url: config.root_url.clone(),
        data: Some(payload),
        task_id: Some(task.id),
        pingback_date: None,
        expiration_date: None,
        info: None,
    };
    let url = format!("{}/{}/", task.receiver_url, INTERNAL_QUEUE);

    let response = reqwest::Client::new()
        .post(&url)
        .header("content-type", "application/json")
        .body(serde_json::to_string(&envelope)?)
        .send()
        .await
        .with_context(|| format!("posting to {url} (is the node running?)"))?;
    store.set_message_output_status(msg_id, response.status().as_u16())?;

    if response.status().is_success() {
        println!("finished task {}", short(&task.id));
        Ok(())
    } else {
        anyhow::bail!("node rejected the finish: HTTP {}", response.status())
    }
}

// ── Activity log summary ──────────────────────────────────────────────────────

#[derive(Default)]
struct PoolStats {
    max: Option<u64>,
    launched: u64,
    executed: u64,
    errors: u64,
    missed: u64,
}

fn show_activity(config: &FrestqConfig) -> anyhow::Result<()> {
    let path = config
        .activity_log
        .as_ref()
        .context("no activity_log configured")?;
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;

    let mut start_date = None;
    let mut pools: std::collections::BTreeMap<String, PoolStats> = Default::default();

    for line in text.lines() {
        let Ok(entry) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let activity = &entry["activity"];
        let queue = activity["queue"].as_str().unwrap_or_default().to_string();
        match activity["action"].as_str().unwrap_or_default() {
            "START" => {
                start_date = entry["time"].as_str().map(String::from);
                pools.clear();
            }
            "CREATE_QUEUE" => {
                pools.entry(queue).or_default();
            }
            "SET_QUEUE_MAX" => {
                pools.entry(queue).or_default().max = activity["max"].as_u64();
            }
            "EVENT_JOB_LAUNCHING" => pools.entry(queue).or_default().launched += 1,
            "EVENT_JOB_EXECUTED" => pools.entry(queue).or_default().executed += 1,
            "EVENT_JOB_ERROR" => pools.entry(queue).or_default().errors += 1,
            "EVENT_JOB_MISSED" => pools.entry(queue).or_default().missed += 1,
            _ => {}
        }
    }

    if let Some(start) = start_date {
        println!("last start: {start}");
    }
    println!(
        "{:<24} {:<5} {:<9} {:<9} {:<7} {:<7} {}",
        "queue", "max", "launched", "executed", "errors", "missed", "executing"
    );
    for (queue, stats) in pools {
        println!(
            "{:<24} {:<5} {:<9} {:<9} {:<7} {:<7} {}",
            trunc(&queue, 24),
            stats.max.map(|m| m.to_string()).unwrap_or_else(|| "-".into()),
            stats.launched,
            stats.executed,
            stats.errors,
            stats.missed,
            stats.launched.saturating_sub(stats.executed + stats.errors),
        );
    }
    Ok(())
}

// ── Formatting helpers ────────────────────────────────────────────────────────

fn short(id: &Uuid) -> String {
    id.to_string()[..8].to_string()
}

fn trunc(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}
