// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Adapter for the Claude Code CLI.
//!
//! Spawns `claude -p --output-format stream-json` and parses its NDJSON
//! output.  Instead of reimplementing an agent loop we lean on the CLI for
//! the system prompt, context management, and tool execution; this adapter
//! only supervises and translates.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

use kiln_protocol::{AgentKind, CanonicalEvent, ErrorKind, Phase};

use crate::adapter::{write_if_changed, Adapter, Availability, EventStream, RunRequest};
use crate::models;
use crate::process::{drive, probe_version, CliInvocation, Parsed, RecordParser};

const PROGRAM: &str = "claude";

/// Workspace instructions file the CLI reads on startup.
const RULES_FILE: &str = "CLAUDE.md";

const ENV_PASSTHROUGH: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "CLAUDE_CODE_OAUTH_TOKEN",
    "XDG_CONFIG_HOME",
];

pub struct ClaudeAdapter;

#[async_trait]
impl Adapter for ClaudeAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::Claude
    }

    async fn available(&self) -> Availability {
        probe_version(PROGRAM).await
    }

    async fn initialize(&self, workspace: &Path, system_prompt: &str) -> anyhow::Result<()> {
        write_if_changed(&workspace.join(RULES_FILE), system_prompt)
    }

    fn run(&self, req: RunRequest) -> EventStream {
        let (native_model, fell_back) = models::resolve_or_default(self.kind(), req.model.as_deref());

        let mut args = vec![
            "-p".to_string(),
            req.instruction_with_images(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--dangerously-skip-permissions".to_string(),
            "--model".to_string(),
            native_model.to_string(),
        ];
        if let Some(session) = &req.prior_session_id {
            args.push("--resume".to_string());
            args.push(session.clone());
        }

        let inv = CliInvocation {
            program: PROGRAM.to_string(),
            args,
            workspace: req.workspace.clone(),
            env_passthrough: ENV_PASSTHROUGH,
            stdin_payload: None,
            cancel: req.cancel.clone(),
            cancel_grace: req.cancel_grace,
        };

        let stream = drive(inv, ClaudeParser::default());
        prepend_model_fallback(stream, fell_back, req.model.as_deref())
    }
}

/// Prepend the informational model-fallback warning when the requested
/// canonical name was unknown.
pub(crate) fn prepend_model_fallback(
    stream: EventStream,
    fell_back: bool,
    requested: Option<&str>,
) -> EventStream {
    use futures::StreamExt;
    if !fell_back {
        return stream;
    }
    let warning = CanonicalEvent::error(
        ErrorKind::ModelFallback,
        format!(
            "unknown model {:?}, using the agent default",
            requested.unwrap_or("")
        ),
    );
    Box::pin(futures::stream::iter([warning]).chain(stream))
}

// ── Native stream-json dialect ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CliMessage {
    /// Session initialization (`subtype: "init"`).
    System {
        #[serde(default)]
        session_id: Option<String>,
    },
    /// A full assistant turn chunk with content blocks.
    Assistant { message: CliInner },
    /// Tool results are echoed back as user messages.
    User { message: CliInner },
    /// Query completion.
    Result {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        is_error: bool,
    },
}

#[derive(Debug, Deserialize)]
struct CliInner {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        #[allow(dead_code)]
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: serde_json::Value,
        #[serde(default)]
        is_error: Option<bool>,
    },
    #[serde(other)]
    Unknown,
}

/// Flatten a tool-result content value (string, or array of text blocks).
fn content_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Classify a result-record error message into the taxonomy.
fn classify_result_error(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("no conversation found")
        || (lower.contains("session") && lower.contains("not found"))
    {
        ErrorKind::SessionStale
    } else if lower.contains("rate limit") || lower.contains("overloaded") {
        ErrorKind::RateLimited
    } else if lower.contains("login") || lower.contains("authenticat") || lower.contains("api key")
    {
        ErrorKind::AuthMissing
    } else {
        ErrorKind::Internal
    }
}

#[derive(Default)]
struct ClaudeParser {
    session_announced: bool,
}

impl ClaudeParser {
    fn announce_session(&mut self, session_id: Option<String>, out: &mut Vec<CanonicalEvent>) {
        if self.session_announced {
            return;
        }
        if let Some(id) = session_id {
            self.session_announced = true;
            out.push(CanonicalEvent::SessionInfo {
                native_session_id: id,
            });
        }
    }
}

impl RecordParser for ClaudeParser {
    fn parse_record(&mut self, record: &str) -> Parsed {
        let msg: CliMessage = match serde_json::from_str(record) {
            Ok(msg) => msg,
            Err(_) => return Parsed::Incomplete,
        };

        let mut out = Vec::new();
        match msg {
            CliMessage::System { session_id } => {
                self.announce_session(session_id, &mut out);
            }
            CliMessage::Assistant { message } | CliMessage::User { message } => {
                for block in message.content {
                    match block {
                        ContentBlock::Text { text } => out.push(CanonicalEvent::AssistantText {
                            text,
                            is_final: false,
                        }),
                        ContentBlock::ToolUse { id, name, input } => {
                            out.push(CanonicalEvent::ToolCall {
                                call_id: id,
                                tool: name,
                                arguments: input,
                            })
                        }
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } => {
                            let is_error = is_error.unwrap_or(false);
                            let text = content_text(&content);
                            out.push(CanonicalEvent::ToolResult {
                                call_id: tool_use_id,
                                ok: !is_error,
                                output: (!is_error).then(|| text.clone()),
                                error: is_error.then_some(text),
                            })
                        }
                        ContentBlock::Thinking { .. } | ContentBlock::Unknown => {}
                    }
                }
            }
            CliMessage::Result {
                subtype,
                result,
                session_id,
                is_error,
            } => {
                self.announce_session(session_id, &mut out);
                let text = result.unwrap_or_default();
                if is_error || subtype.as_deref().map(|s| s.starts_with("error")).unwrap_or(false) {
                    let kind = classify_result_error(&text);
                    out.push(CanonicalEvent::error(kind, text));
                    out.push(CanonicalEvent::status(Phase::Failed { kind }));
                } else {
                    out.push(CanonicalEvent::AssistantText {
                        text,
                        is_final: true,
                    });
                    out.push(CanonicalEvent::status(Phase::Complete));
                }
            }
        }
        Parsed::Events(out)
    }

    fn classify_failure(&self, garbage: &str, stderr_tail: &str) -> Option<ErrorKind> {
        let combined = format!("{garbage}\n{stderr_tail}").to_lowercase();
        if combined.contains("/login") || combined.contains("not logged in") {
            Some(ErrorKind::AuthMissing)
        } else if combined.contains("rate limit") {
            Some(ErrorKind::RateLimited)
        } else {
            None
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
