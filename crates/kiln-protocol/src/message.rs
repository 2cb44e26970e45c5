// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The append-only persisted message row.
//!
//! The Message Store keeps one row per canonical event (and one per submitted
//! instruction) keyed by `(project_id, seq)`.  Rows are created on emission
//! and never mutated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{event::EventRecord, CanonicalEvent, ProjectId};

/// Who produced a persisted row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// One append-only transcript row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub project_id: ProjectId,
    /// Unique and strictly increasing within `project_id`.
    pub seq: u64,
    pub request_id: String,
    pub role: Role,
    /// Discriminant of `body` (`assistant_text`, `tool_call`, ...,
    /// or `instruction` for the user's submitted text).
    pub kind: String,
    /// Full serialized event body, including its `type` tag.
    pub body: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    /// Row for a stamped canonical event.
    pub fn from_record(project_id: ProjectId, record: &EventRecord) -> Self {
        let role = match record.event {
            CanonicalEvent::ToolCall { .. } | CanonicalEvent::ToolResult { .. } => Role::Tool,
            _ => Role::Assistant,
        };
        Self {
            project_id,
            seq: record.seq,
            request_id: record.request_id.clone(),
            role,
            kind: record.event.kind_str().to_string(),
            body: serde_json::to_value(&record.event).unwrap_or(serde_json::Value::Null),
            created_at: Utc::now(),
        }
    }

    /// Row for the user's submitted instruction.
    pub fn instruction(
        project_id: ProjectId,
        seq: u64,
        request_id: String,
        instruction: &str,
        agent: crate::AgentKind,
        model: Option<&str>,
    ) -> Self {
        Self {
            project_id,
            seq,
            request_id,
            role: Role::User,
            kind: "instruction".to_string(),
            body: serde_json::json!({ "text": instruction, "agent": agent, "model": model }),
            created_at: Utc::now(),
        }
    }

    /// Decode the body back into a canonical event.  Returns `None` for
    /// non-event rows (user instructions) and undecodable bodies.
    pub fn canonical_event(&self) -> Option<CanonicalEvent> {
        serde_json::from_value(self.body.clone()).ok()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AgentKind, ErrorKind, Phase};

    fn record(seq: u64, event: CanonicalEvent) -> EventRecord {
        EventRecord {
            seq,
            request_id: "1-abc".into(),
            event,
        }
    }

    #[test]
    fn tool_events_get_tool_role() {
        let project = ProjectId::new_v4();
        let row = StoredMessage::from_record(
            project,
            &record(
                1,
                CanonicalEvent::ToolCall {
                    call_id: "t1".into(),
                    tool: "shell".into(),
                    arguments: serde_json::json!({}),
                },
            ),
        );
        assert_eq!(row.role, Role::Tool);
        assert_eq!(row.kind, "tool_call");
    }

    #[test]
    fn status_events_get_assistant_role() {
        let row = StoredMessage::from_record(
            ProjectId::new_v4(),
            &record(1, CanonicalEvent::status(Phase::Complete)),
        );
        assert_eq!(row.role, Role::Assistant);
        assert_eq!(row.kind, "status");
    }

    #[test]
    fn canonical_event_round_trips_through_body() {
        let ev = CanonicalEvent::error(ErrorKind::RateLimited, "429 from provider");
        let row = StoredMessage::from_record(ProjectId::new_v4(), &record(7, ev.clone()));
        assert_eq!(row.canonical_event(), Some(ev));
    }

    #[test]
    fn instruction_row_is_user_role_and_not_an_event() {
        let row = StoredMessage::instruction(
            ProjectId::new_v4(),
            1,
            "1-abc".into(),
            "add a dark-mode toggle",
            AgentKind::Claude,
            None,
        );
        assert_eq!(row.role, Role::User);
        assert_eq!(row.kind, "instruction");
        assert_eq!(row.canonical_event(), None);
    }
}
