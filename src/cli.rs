// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Federated REST task queue node and inspection tool.
#[derive(Parser, Debug)]
#[command(name = "frestq", version, about)]
pub struct Cli {
    /// Path to the node config file (YAML).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging to stderr (or set RUST_LOG).
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a bare node: the ingress endpoint plus the internal protocol
    /// actions, no application handlers.
    ///
    /// Useful for director-only nodes; applications embed the node
    /// themselves and register their own handlers.
    Serve,

    /// Create the database schema and exit.
    Initdb,

    /// List the most recent tasks.
    Tasks {
        /// Limit number of results.
        #[arg(long, short = 'n', default_value_t = 20)]
        limit: usize,
        /// Filter rows, e.g. --filter status=finished --filter queue_name=q.
        #[arg(long = "filter")]
        filters: Vec<String>,
    },

    /// List the most recent messages.
    Messages {
        /// Limit number of results.
        #[arg(long, short = 'n', default_value_t = 20)]
        limit: usize,
        /// Filter rows, e.g. --filter action=frestq.update_task.
        #[arg(long = "filter")]
        filters: Vec<String>,
    },

    /// Print one task in detail, found by id prefix.
    Show {
        /// Task id or unique prefix.
        id: String,
    },

    /// Print one message in detail, found by id prefix.
    ShowMessage {
        /// Message id or unique prefix.
        id: String,
    },

    /// Print the subtree of related tasks, found by id prefix.
    Tree {
        /// Task id or unique prefix.
        id: String,
        /// Climb to the root of the tree before printing.
        #[arg(long)]
        with_parents: bool,
    },

    /// Finish an external task with a JSON payload.
    ///
    /// Posts `frestq.finish_external_task` through the node's own ingress,
    /// so the node must be running.
    Finish {
        /// Task id or unique prefix.
        id: String,
        /// Completion payload, JSON.
        data: String,
    },

    /// Summarize the scheduler activity log.
    Activity,
}

/// Split `key=value` filter arguments.
pub fn parse_filters(raw: &[String]) -> anyhow::Result<Vec<(String, String)>> {
    raw.iter()
        .map(|f| {
            f.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| anyhow::anyhow!("filter must be key=value, got '{f}'"))
        })
        .collect()
}
