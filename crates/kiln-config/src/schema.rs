// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

use kiln_protocol::AgentKind;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Check cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.core;
        if !(60..=3600).contains(&c.default_run_deadline_seconds) {
            return Err(ConfigError::OutOfRange {
                field: "core.default_run_deadline_seconds",
                value: c.default_run_deadline_seconds,
                range: "60..=3600",
            });
        }
        if c.default_stall_seconds == 0 {
            return Err(ConfigError::OutOfRange {
                field: "core.default_stall_seconds",
                value: 0,
                range: "1..",
            });
        }
        if c.subscriber_queue_capacity == 0 {
            return Err(ConfigError::OutOfRange {
                field: "core.subscriber_queue_capacity",
                value: 0,
                range: "1..",
            });
        }
        if c.cancel_grace_seconds == 0 {
            return Err(ConfigError::OutOfRange {
                field: "core.cancel_grace_seconds",
                value: 0,
                range: "1..",
            });
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} = {value} outside {range}")]
    OutOfRange {
        field: &'static str,
        value: u64,
        range: &'static str,
    },
}

/// Process-scoped tunables of the orchestration core.
///
/// Every knob the orchestrator, adapters, and hub consult lives here; no
/// other part of the core reads the environment or hard-codes an interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Default total run wall time in seconds; a submit may override it
    /// within 60..=3600.
    #[serde(default = "default_run_deadline")]
    pub default_run_deadline_seconds: u64,
    /// Max silence between adapter events before the run times out.
    #[serde(default = "default_stall")]
    pub default_stall_seconds: u64,
    /// Events buffered per subscriber before it is disconnected as a slow
    /// consumer.
    #[serde(default = "default_queue_capacity")]
    pub subscriber_queue_capacity: usize,
    /// Teardown delay after the last subscriber leaves and the queue empties.
    #[serde(default = "default_linger")]
    pub idle_orchestrator_linger_seconds: u64,
    /// Cache duration for adapter availability probes.
    #[serde(default = "default_availability_cache")]
    pub availability_cache_seconds: u64,
    /// Events replayed on subscribe when no `subscribe_from_seq` is given.
    #[serde(default = "default_history_replay")]
    pub history_replay_default: usize,
    /// Adapter used by the one-shot fallback policy.
    #[serde(default = "default_fallback_agent")]
    pub fallback_agent: AgentKind,
    /// Soft-interrupt → hard-kill window on cancellation.
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_seconds: u64,
}

fn default_run_deadline() -> u64 {
    600
}
fn default_stall() -> u64 {
    90
}
fn default_queue_capacity() -> usize {
    512
}
fn default_linger() -> u64 {
    30
}
fn default_availability_cache() -> u64 {
    60
}
fn default_history_replay() -> usize {
    200
}
fn default_fallback_agent() -> AgentKind {
    AgentKind::Claude
}
fn default_cancel_grace() -> u64 {
    2
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            default_run_deadline_seconds: default_run_deadline(),
            default_stall_seconds: default_stall(),
            subscriber_queue_capacity: default_queue_capacity(),
            idle_orchestrator_linger_seconds: default_linger(),
            availability_cache_seconds: default_availability_cache(),
            history_replay_default: default_history_replay(),
            fallback_agent: default_fallback_agent(),
            cancel_grace_seconds: default_cancel_grace(),
        }
    }
}

/// `kiln serve` process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the WebSocket/HTTP gateway.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Directory holding per-project transcript files (JSONL store).
    /// `None` keeps transcripts in memory only.
    #[serde(default)]
    pub data_dir: Option<String>,
    /// YAML manifest of known projects (id, workspace, preferred agent/model).
    #[serde(default)]
    pub projects_file: Option<String>,
    /// Directory holding role markdown consumed as system prompts.
    #[serde(default)]
    pub prompts_dir: Option<String>,
}

fn default_bind() -> String {
    "127.0.0.1:8790".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            data_dir: None,
            projects_file: None,
            prompts_dir: None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
