// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// kiln — orchestration core for an AI-assisted web-app builder.
///
/// Drives external AI coding CLIs (claude, cursor, codex, gemini, qwen) as
/// supervised subprocesses, persists their event streams as per-project
/// transcripts, and fans events out to WebSocket subscribers.
#[derive(Parser, Debug)]
#[command(name = "kiln", version, about)]
pub struct Cli {
    /// Path to an explicit config file (merged over the discovered layers).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr at debug level (or set KILN_LOG for fine control).
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the gateway: WebSocket hub + availability endpoint.
    Serve {
        /// Bind address, e.g. 127.0.0.1:8790.  Overrides the config file.
        #[arg(long)]
        bind: Option<String>,
        /// Directory for per-project JSONL transcripts.  Without it,
        /// transcripts live in memory and are lost on restart.
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// YAML manifest of known projects (id, workspace, preferences).
        #[arg(long)]
        projects_file: Option<PathBuf>,
        /// Directory of role markdown files used as system prompts.
        #[arg(long)]
        prompts_dir: Option<PathBuf>,
    },

    /// Probe which agent CLIs are installed and print the result.
    Agents {
        /// Emit JSON instead of the table.
        #[arg(long)]
        json: bool,
    },

    /// Print the merged configuration and exit.
    ShowConfig,
}
