// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Adapter for the Codex CLI.
//!
//! Spawns `codex exec --json` and parses its thread/turn/item event stream.
//! Resume goes through `codex exec resume <thread-id>`; the instruction is
//! passed on stdin because argv length is capped well below the 64 KiB
//! instruction bound.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

use kiln_protocol::{AgentKind, CanonicalEvent, ErrorKind, Phase};

use crate::adapter::{write_if_changed, Adapter, Availability, EventStream, RunRequest};
use crate::claude::prepend_model_fallback;
use crate::models;
use crate::process::{drive, probe_version, CliInvocation, Parsed, RecordParser};

const PROGRAM: &str = "codex";

/// Workspace instructions file the CLI reads on startup.
const RULES_FILE: &str = "AGENTS.md";

const ENV_PASSTHROUGH: &[&str] = &["OPENAI_API_KEY", "CODEX_HOME"];

pub struct CodexAdapter;

#[async_trait]
impl Adapter for CodexAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::Codex
    }

    async fn available(&self) -> Availability {
        probe_version(PROGRAM).await
    }

    async fn initialize(&self, workspace: &Path, system_prompt: &str) -> anyhow::Result<()> {
        write_if_changed(&workspace.join(RULES_FILE), system_prompt)
    }

    fn run(&self, req: RunRequest) -> EventStream {
        let (native_model, fell_back) = models::resolve_or_default(self.kind(), req.model.as_deref());

        let mut args = vec!["exec".to_string()];
        if let Some(session) = &req.prior_session_id {
            args.push("resume".to_string());
            args.push(session.clone());
        }
        args.extend([
            "--json".to_string(),
            "--skip-git-repo-check".to_string(),
            "--sandbox".to_string(),
            "workspace-write".to_string(),
            "--model".to_string(),
            native_model.to_string(),
            "-".to_string(),
        ]);

        let inv = CliInvocation {
            program: PROGRAM.to_string(),
            args,
            workspace: req.workspace.clone(),
            env_passthrough: ENV_PASSTHROUGH,
            stdin_payload: Some(req.instruction_with_images()),
            cancel: req.cancel.clone(),
            cancel_grace: req.cancel_grace,
        };

        let stream = drive(inv, CodexParser::default());
        prepend_model_fallback(stream, fell_back, req.model.as_deref())
    }
}

// ── Native exec --json dialect ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ThreadEvent {
    #[serde(rename = "thread.started")]
    ThreadStarted { thread_id: String },
    #[serde(rename = "turn.started")]
    TurnStarted,
    #[serde(rename = "item.started")]
    ItemStarted { item: Item },
    #[serde(rename = "item.completed")]
    ItemCompleted { item: Item },
    #[serde(rename = "turn.completed")]
    TurnCompleted,
    #[serde(rename = "turn.failed")]
    TurnFailed {
        #[serde(default)]
        error: Option<ThreadError>,
    },
    #[serde(rename = "error")]
    Error { message: String },
}

#[derive(Debug, Deserialize)]
struct ThreadError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "item_type", rename_all = "snake_case")]
enum Item {
    AgentMessage {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        text: String,
    },
    Reasoning {
        #[serde(default)]
        id: Option<String>,
    },
    CommandExecution {
        id: String,
        command: String,
        #[serde(default)]
        aggregated_output: Option<String>,
        #[serde(default)]
        exit_code: Option<i32>,
    },
    FileChange {
        id: String,
        #[serde(default)]
        changes: serde_json::Value,
        #[serde(default)]
        status: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

fn classify_error(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("rate limit") || lower.contains("429") {
        ErrorKind::RateLimited
    } else if lower.contains("no thread") || lower.contains("session not found") {
        ErrorKind::SessionStale
    } else if lower.contains("login") || lower.contains("api key") || lower.contains("unauthorized")
    {
        ErrorKind::AuthMissing
    } else {
        ErrorKind::Internal
    }
}

#[derive(Default)]
struct CodexParser {
    session_announced: bool,
}

impl RecordParser for CodexParser {
    fn parse_record(&mut self, record: &str) -> Parsed {
        let event: ThreadEvent = match serde_json::from_str(record) {
            Ok(event) => event,
            Err(_) => return Parsed::Incomplete,
        };

        let mut out = Vec::new();
        match event {
            ThreadEvent::ThreadStarted { thread_id } => {
                if !self.session_announced {
                    self.session_announced = true;
                    out.push(CanonicalEvent::SessionInfo {
                        native_session_id: thread_id,
                    });
                }
            }
            ThreadEvent::TurnStarted => {}
            ThreadEvent::ItemStarted { item } => match item {
                Item::CommandExecution { id, command, .. } => out.push(CanonicalEvent::ToolCall {
                    call_id: id,
                    tool: "shell".to_string(),
                    arguments: serde_json::json!({ "command": command }),
                }),
                Item::FileChange { id, changes, .. } => out.push(CanonicalEvent::ToolCall {
                    call_id: id,
                    tool: "apply_patch".to_string(),
                    arguments: changes,
                }),
                // Text items only matter once completed.
                _ => {}
            },
            ThreadEvent::ItemCompleted { item } => match item {
                Item::AgentMessage { text, .. } => out.push(CanonicalEvent::AssistantText {
                    text,
                    is_final: false,
                }),
                Item::CommandExecution {
                    id,
                    aggregated_output,
                    exit_code,
                    ..
                } => {
                    let ok = exit_code.unwrap_or(0) == 0;
                    let output = aggregated_output.unwrap_or_default();
                    out.push(CanonicalEvent::ToolResult {
                        call_id: id,
                        ok,
                        output: ok.then(|| output.clone()),
                        error: (!ok).then_some(output),
                    });
                }
                Item::FileChange { id, status, .. } => {
                    let ok = status.as_deref() != Some("failed");
                    out.push(CanonicalEvent::ToolResult {
                        call_id: id,
                        ok,
                        output: ok.then(|| "applied".to_string()),
                        error: (!ok).then(|| "patch failed".to_string()),
                    });
                }
                Item::Reasoning { .. } | Item::Unknown => {}
            },
            ThreadEvent::TurnCompleted => {
                out.push(CanonicalEvent::AssistantText {
                    text: String::new(),
                    is_final: true,
                });
                out.push(CanonicalEvent::status(Phase::Complete));
            }
            ThreadEvent::TurnFailed { error } => {
                let message = error.map(|e| e.message).unwrap_or_default();
                let kind = classify_error(&message);
                out.push(CanonicalEvent::error(kind, message));
                out.push(CanonicalEvent::status(Phase::Failed { kind }));
            }
            ThreadEvent::Error { message } => {
                let kind = classify_error(&message);
                out.push(CanonicalEvent::error(kind, message));
            }
        }
        Parsed::Events(out)
    }

    fn classify_failure(&self, garbage: &str, stderr_tail: &str) -> Option<ErrorKind> {
        let combined = format!("{garbage}\n{stderr_tail}").to_lowercase();
        if combined.contains("codex login") || combined.contains("not logged in") {
            Some(ErrorKind::AuthMissing)
        } else {
            None
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
