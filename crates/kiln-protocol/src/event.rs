// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The canonical event schema.
//!
//! Adapters translate their CLI's native stream into [`CanonicalEvent`]s;
//! everything downstream — persistence, broadcast, the WebSocket wire — sees
//! only this shape.  The orchestrator wraps each event in an [`EventRecord`]
//! that stamps the project-scoped sequence number and the request id.

use serde::{Deserialize, Serialize};

use crate::agent::AgentKind;

// ── Error taxonomy ────────────────────────────────────────────────────────────

/// Classified failure causes carried by `CanonicalEvent::Error` and
/// `Phase::Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Adapter binary missing from PATH.
    CliNotInstalled,
    /// OS-level spawn error (permissions, exec format, resource limits).
    SpawnFailed,
    /// The CLI requires an interactive login before it can run headless.
    AuthMissing,
    /// Subprocess exited non-zero before emitting a single parseable event.
    CrashedBeforeFirstEvent,
    /// The prior native session id was rejected (expired or unknown).
    SessionStale,
    /// Provider rate limit reported by the CLI.
    RateLimited,
    /// Unknown canonical model name; the adapter default was used instead.
    /// Informational — the run continues.
    ModelFallback,
    /// Stall window or run deadline exceeded.
    Timeout,
    /// User or shutdown cancellation.
    Cancelled,
    /// Sustained unparseable subprocess output.
    Protocol,
    /// Core-side bug: assertion failure, unexpected state, persistence error.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::CliNotInstalled => "cli_not_installed",
            ErrorKind::SpawnFailed => "spawn_failed",
            ErrorKind::AuthMissing => "auth_missing",
            ErrorKind::CrashedBeforeFirstEvent => "crashed_before_first_event",
            ErrorKind::SessionStale => "session_stale",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ModelFallback => "model_fallback",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Internal => "internal",
        }
    }

    /// Whether a client may retry the same request and expect a different
    /// outcome.  `session_stale` additionally gets one automatic in-run retry
    /// from the orchestrator (with the session cleared).
    pub fn retryable(&self) -> bool {
        matches!(self, ErrorKind::SessionStale | ErrorKind::RateLimited)
    }

    /// Whether a run that failed with this kind qualifies for the one-shot
    /// automatic retry on the fallback agent.  Only adapter-level
    /// unavailability qualifies — mid-stream failures, timeouts, and
    /// cancellations never do.
    pub fn fallback_eligible(&self) -> bool {
        matches!(
            self,
            ErrorKind::CliNotInstalled
                | ErrorKind::SpawnFailed
                | ErrorKind::AuthMissing
                | ErrorKind::CrashedBeforeFirstEvent
                | ErrorKind::Protocol
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Run lifecycle ─────────────────────────────────────────────────────────────

/// Lifecycle phase carried by `CanonicalEvent::Status`.
///
/// Exactly one `Start` opens a run and exactly one terminal phase
/// (`Complete` | `Cancelled` | `Failed`) closes it.  `Fellback` is emitted
/// between a failed run and the retried run's `Start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    Start { agent: AgentKind },
    Complete,
    Cancelled,
    Failed { kind: ErrorKind },
    Fellback { from: AgentKind, to: AgentKind },
}

impl Phase {
    /// Terminal phases end a run; no further events may follow them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete | Phase::Cancelled | Phase::Failed { .. })
    }
}

// ── Canonical events ──────────────────────────────────────────────────────────

/// The uniform event schema the core emits, regardless of which CLI produced
/// the underlying output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanonicalEvent {
    /// Streaming natural-language reply fragment; `final` marks end-of-turn.
    AssistantText {
        text: String,
        #[serde(rename = "final")]
        is_final: bool,
    },
    /// The agent invoked a tool (file edit, shell command, search).
    ToolCall {
        call_id: String,
        tool: String,
        arguments: serde_json::Value,
    },
    /// Result matching a prior `ToolCall` with the same `call_id`.
    ToolResult {
        call_id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Emitted at most once per run when the CLI reveals its session id.
    SessionInfo { native_session_id: String },
    /// Run lifecycle marker.
    Status {
        #[serde(flatten)]
        phase: Phase,
    },
    /// A classified error.  Non-terminal by itself; a terminal `Status`
    /// always follows before the stream ends.
    Error {
        kind: ErrorKind,
        message: String,
        retryable: bool,
    },
}

impl CanonicalEvent {
    /// The wire/storage discriminant (`assistant_text`, `tool_call`, ...).
    pub fn kind_str(&self) -> &'static str {
        match self {
            CanonicalEvent::AssistantText { .. } => "assistant_text",
            CanonicalEvent::ToolCall { .. } => "tool_call",
            CanonicalEvent::ToolResult { .. } => "tool_result",
            CanonicalEvent::SessionInfo { .. } => "session_info",
            CanonicalEvent::Status { .. } => "status",
            CanonicalEvent::Error { .. } => "error",
        }
    }

    /// Shorthand for a status event.
    pub fn status(phase: Phase) -> Self {
        CanonicalEvent::Status { phase }
    }

    /// Shorthand for an error event with retryability derived from the kind.
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        CanonicalEvent::Error {
            kind,
            message: message.into(),
            retryable: kind.retryable(),
        }
    }

    /// True when this is a terminal `Status`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CanonicalEvent::Status { phase } if phase.is_terminal())
    }
}

// ── Stamped record ────────────────────────────────────────────────────────────

/// A canonical event stamped with its project-scoped sequence number and the
/// request id of the run that produced it.  `seq` is assigned by the
/// single-writer orchestrator before the event is either persisted or
/// broadcast, so all consumers observe the same total order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub seq: u64,
    pub request_id: String,
    pub event: CanonicalEvent,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
