// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Adapter for the Cursor CLI (`cursor-agent`).
//!
//! Speaks a stream-json dialect close to Claude Code's, with flat
//! `tool_call` records carrying a `status` field instead of content blocks.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

use kiln_protocol::{AgentKind, CanonicalEvent, ErrorKind, Phase};

use crate::adapter::{write_if_changed, Adapter, Availability, EventStream, RunRequest};
use crate::claude::prepend_model_fallback;
use crate::models;
use crate::process::{drive, probe_version, CliInvocation, Parsed, RecordParser};

const PROGRAM: &str = "cursor-agent";

/// Rules file inside the workspace; cursor reads `.cursor/rules/*.mdc`.
const RULES_FILE: &str = ".cursor/rules/kiln.mdc";

const ENV_PASSTHROUGH: &[&str] = &["CURSOR_API_KEY"];

pub struct CursorAdapter;

#[async_trait]
impl Adapter for CursorAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::Cursor
    }

    async fn available(&self) -> Availability {
        probe_version(PROGRAM).await
    }

    async fn initialize(&self, workspace: &Path, system_prompt: &str) -> anyhow::Result<()> {
        // .mdc rules carry a frontmatter header telling cursor to always
        // apply them.
        let content = format!("---\nalwaysApply: true\n---\n\n{system_prompt}");
        write_if_changed(&workspace.join(RULES_FILE), &content)
    }

    fn run(&self, req: RunRequest) -> EventStream {
        let (native_model, fell_back) = models::resolve_or_default(self.kind(), req.model.as_deref());

        let mut args = vec![
            "-p".to_string(),
            req.instruction_with_images(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--force".to_string(),
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

        let stream = drive(inv, CursorParser::default());
        prepend_model_fallback(stream, fell_back, req.model.as_deref())
    }
}

// ── Native stream-json dialect ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CursorMessage {
    System {
        #[serde(default)]
        session_id: Option<String>,
    },
    Assistant {
        message: CursorInner,
    },
    ToolCall {
        call_id: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        args: serde_json::Value,
        status: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: Option<bool>,
    },
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
    },
}

#[derive(Debug, Deserialize)]
struct CursorInner {
    #[serde(default)]
    content: Vec<TextBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TextBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Unknown,
}

fn classify_error(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("rate limit") {
        ErrorKind::RateLimited
    } else if lower.contains("chat not found") || lower.contains("resume") {
        ErrorKind::SessionStale
    } else if lower.contains("login") || lower.contains("unauthorized") {
        ErrorKind::AuthMissing
    } else {
        ErrorKind::Internal
    }
}

#[derive(Default)]
struct CursorParser {
    session_announced: bool,
}

impl RecordParser for CursorParser {
    fn parse_record(&mut self, record: &str) -> Parsed {
        let msg: CursorMessage = match serde_json::from_str(record) {
            Ok(msg) => msg,
            Err(_) => return Parsed::Incomplete,
        };

        let mut out = Vec::new();
        match msg {
            CursorMessage::System { session_id } => {
                if let (false, Some(id)) = (self.session_announced, session_id) {
                    self.session_announced = true;
                    out.push(CanonicalEvent::SessionInfo {
                        native_session_id: id,
                    });
                }
            }
            CursorMessage::Assistant { message } => {
                for block in message.content {
                    if let TextBlock::Text { text } = block {
                        out.push(CanonicalEvent::AssistantText {
                            text,
                            is_final: false,
                        });
                    }
                }
            }
            CursorMessage::ToolCall {
                call_id,
                name,
                args,
                status,
                result,
                is_error,
            } => match status.as_str() {
                "started" => out.push(CanonicalEvent::ToolCall {
                    call_id,
                    tool: name,
                    arguments: args,
                }),
                "completed" => {
                    let is_error = is_error.unwrap_or(false);
                    let text = result.unwrap_or_default();
                    out.push(CanonicalEvent::ToolResult {
                        call_id,
                        ok: !is_error,
                        output: (!is_error).then(|| text.clone()),
                        error: is_error.then_some(text),
                    });
                }
                // In-progress updates carry no new information.
                _ => {}
            },
            CursorMessage::Result { result, is_error } => {
                let text = result.unwrap_or_default();
                if is_error {
                    let kind = classify_error(&text);
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
        if combined.contains("cursor-agent login") || combined.contains("not authenticated") {
            Some(ErrorKind::AuthMissing)
        } else {
            None
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(parser: &mut CursorParser, record: &str) -> Vec<CanonicalEvent> {
        match parser.parse_record(record) {
            Parsed::Events(events) => events,
            Parsed::Incomplete => panic!("expected a complete record: {record}"),
        }
    }

    #[test]
    fn tool_call_lifecycle_maps_by_status() {
        let mut p = CursorParser::default();
        let started = parse(
            &mut p,
            r#"{"type":"tool_call","call_id":"t1","name":"edit_file","args":{"path":"app/page.tsx"},"status":"started"}"#,
        );
        assert!(matches!(&started[0], CanonicalEvent::ToolCall { tool, .. } if tool == "edit_file"));

        let progress = parse(
            &mut p,
            r#"{"type":"tool_call","call_id":"t1","status":"running"}"#,
        );
        assert!(progress.is_empty());

        let completed = parse(
            &mut p,
            r#"{"type":"tool_call","call_id":"t1","status":"completed","result":"edited"}"#,
        );
        assert_eq!(
            completed,
            vec![CanonicalEvent::ToolResult {
                call_id: "t1".into(),
                ok: true,
                output: Some("edited".into()),
                error: None
            }]
        );
    }

    #[test]
    fn result_success_terminates_with_complete() {
        let mut p = CursorParser::default();
        let events = parse(&mut p, r#"{"type":"result","result":"All done"}"#);
        assert_eq!(events[1], CanonicalEvent::status(Phase::Complete));
    }

    #[test]
    fn result_error_classifies_stale_resume() {
        let mut p = CursorParser::default();
        let events = parse(
            &mut p,
            r#"{"type":"result","result":"chat not found: c-123","is_error":true}"#,
        );
        assert!(matches!(
            events[0],
            CanonicalEvent::Error { kind: ErrorKind::SessionStale, .. }
        ));
    }

    #[test]
    fn session_announced_only_once() {
        let mut p = CursorParser::default();
        let first = parse(&mut p, r#"{"type":"system","session_id":"c-1"}"#);
        assert_eq!(first.len(), 1);
        let second = parse(&mut p, r#"{"type":"system","session_id":"c-1"}"#);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn initialize_writes_mdc_with_frontmatter() {
        let dir = tempfile::tempdir().unwrap();
        CursorAdapter.initialize(dir.path(), "# role").await.unwrap();
        let content = std::fs::read_to_string(dir.path().join(RULES_FILE)).unwrap();
        assert!(content.starts_with("---\nalwaysApply: true"));
        assert!(content.contains("# role"));
    }
}
