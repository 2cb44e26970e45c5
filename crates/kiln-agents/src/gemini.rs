// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Adapter for the Gemini CLI.
//!
//! Spawns `gemini --output-format stream-json` with the instruction on
//! stdin.  The qwen adapter shares this dialect ([`GeminiStreamParser`]) —
//! the qwen CLI is a fork of gemini's and emits the same record shapes.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

use kiln_protocol::{AgentKind, CanonicalEvent, ErrorKind, Phase};

use crate::adapter::{write_if_changed, Adapter, Availability, EventStream, RunRequest};
use crate::claude::prepend_model_fallback;
use crate::models;
use crate::process::{drive, probe_version, CliInvocation, Parsed, RecordParser};

const PROGRAM: &str = "gemini";

/// Workspace instructions file the CLI reads on startup.
const RULES_FILE: &str = "GEMINI.md";

const ENV_PASSTHROUGH: &[&str] = &["GEMINI_API_KEY", "GOOGLE_API_KEY", "GOOGLE_CLOUD_PROJECT"];

pub struct GeminiAdapter;

#[async_trait]
impl Adapter for GeminiAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::Gemini
    }

    async fn available(&self) -> Availability {
        probe_version(PROGRAM).await
    }

    async fn initialize(&self, workspace: &Path, system_prompt: &str) -> anyhow::Result<()> {
        write_if_changed(&workspace.join(RULES_FILE), system_prompt)
    }

    fn run(&self, req: RunRequest) -> EventStream {
        let (native_model, fell_back) = models::resolve_or_default(self.kind(), req.model.as_deref());
        let inv = stream_json_invocation(PROGRAM, ENV_PASSTHROUGH, native_model, &req);
        let stream = drive(inv, GeminiStreamParser::default());
        prepend_model_fallback(stream, fell_back, req.model.as_deref())
    }
}

/// Build the shared gemini-style invocation (also used by qwen).
pub(crate) fn stream_json_invocation(
    program: &str,
    env_passthrough: &'static [&'static str],
    native_model: &str,
    req: &RunRequest,
) -> CliInvocation {
    let mut args = vec![
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--yolo".to_string(),
        "--model".to_string(),
        native_model.to_string(),
    ];
    if let Some(session) = &req.prior_session_id {
        args.push("--resume".to_string());
        args.push(session.clone());
    }
    CliInvocation {
        program: program.to_string(),
        args,
        workspace: req.workspace.clone(),
        env_passthrough,
        stdin_payload: Some(req.instruction_with_images()),
        cancel: req.cancel.clone(),
        cancel_grace: req.cancel_grace,
    }
}

// ── Native stream-json dialect (gemini + qwen) ────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum GeminiEvent {
    Init {
        #[serde(default)]
        session_id: Option<String>,
    },
    Content {
        #[serde(default)]
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        #[serde(default)]
        args: serde_json::Value,
    },
    ToolResult {
        id: String,
        #[serde(default)]
        output: Option<String>,
        #[serde(default)]
        status: Option<String>,
    },
    Done,
    Error {
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        message: String,
    },
}

fn classify_error(code: Option<&str>, message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    match code {
        Some("rate_limited") | Some("resource_exhausted") => ErrorKind::RateLimited,
        Some("session_not_found") => ErrorKind::SessionStale,
        Some("unauthenticated") => ErrorKind::AuthMissing,
        _ if lower.contains("quota") || lower.contains("rate limit") => ErrorKind::RateLimited,
        _ if lower.contains("session") && lower.contains("not found") => ErrorKind::SessionStale,
        _ if lower.contains("login") || lower.contains("credential") => ErrorKind::AuthMissing,
        _ => ErrorKind::Internal,
    }
}

/// Parser for the gemini/qwen stream-json record stream.
#[derive(Default)]
pub(crate) struct GeminiStreamParser {
    session_announced: bool,
}

impl RecordParser for GeminiStreamParser {
    fn parse_record(&mut self, record: &str) -> Parsed {
        let event: GeminiEvent = match serde_json::from_str(record) {
            Ok(event) => event,
            Err(_) => return Parsed::Incomplete,
        };

        let mut out = Vec::new();
        match event {
            GeminiEvent::Init { session_id } => {
                if let (false, Some(id)) = (self.session_announced, session_id) {
                    self.session_announced = true;
                    out.push(CanonicalEvent::SessionInfo {
                        native_session_id: id,
                    });
                }
            }
            GeminiEvent::Content { text } => out.push(CanonicalEvent::AssistantText {
                text,
                is_final: false,
            }),
            GeminiEvent::ToolCall { id, name, args } => out.push(CanonicalEvent::ToolCall {
                call_id: id,
                tool: name,
                arguments: args,
            }),
            GeminiEvent::ToolResult { id, output, status } => {
                let ok = status.as_deref() != Some("error");
                let text = output.unwrap_or_default();
                out.push(CanonicalEvent::ToolResult {
                    call_id: id,
                    ok,
                    output: ok.then(|| text.clone()),
                    error: (!ok).then_some(text),
                });
            }
            GeminiEvent::Done => {
                out.push(CanonicalEvent::AssistantText {
                    text: String::new(),
                    is_final: true,
                });
                out.push(CanonicalEvent::status(Phase::Complete));
            }
            GeminiEvent::Error { code, message } => {
                let kind = classify_error(code.as_deref(), &message);
                out.push(CanonicalEvent::error(kind, message));
                if kind == ErrorKind::SessionStale || kind == ErrorKind::AuthMissing {
                    // These end the run; the CLI exits right after.
                    out.push(CanonicalEvent::status(Phase::Failed { kind }));
                }
            }
        }
        Parsed::Events(out)
    }

    fn classify_failure(&self, garbage: &str, stderr_tail: &str) -> Option<ErrorKind> {
        let combined = format!("{garbage}\n{stderr_tail}").to_lowercase();
        if combined.contains("credential") || combined.contains("login") {
            Some(ErrorKind::AuthMissing)
        } else if combined.contains("quota") {
            Some(ErrorKind::RateLimited)
        } else {
            None
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
