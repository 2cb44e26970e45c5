// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! WebSocket frame envelope.
//!
//! Text frames carry JSON except the literal `"ping"` / `"pong"` keepalives.
//! Every JSON frame is an envelope:
//!
//! ```text
//! { "type": <string>, "data": <object>, "request_id"?: <string>, "seq"?: <int> }
//! ```
//!
//! Inbound types: `submit`, `cancel`, `subscribe_from_seq`.  Outbound types
//! mirror the canonical event variants (`assistant_text`, `tool_call`,
//! `tool_result`, `session_info`, `status`, `error`) plus `instruction` rows
//! replayed from history.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    event::EventRecord,
    message::StoredMessage,
    AgentKind,
};

// ── Close codes ───────────────────────────────────────────────────────────────

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_SLOW_CONSUMER: u16 = 4001;
pub const CLOSE_UNAUTHORIZED: u16 = 4002;
pub const CLOSE_PROJECT_UNKNOWN: u16 = 4003;

// ── Submit bounds ─────────────────────────────────────────────────────────────

/// Upper bound on instruction length, in bytes.
pub const MAX_INSTRUCTION_BYTES: usize = 64 * 1024;
pub const MIN_DEADLINE_SECS: u64 = 60;
pub const MAX_DEADLINE_SECS: u64 = 3600;

// ── Envelope ──────────────────────────────────────────────────────────────────

/// The generic JSON envelope for both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl Frame {
    /// Outbound frame for a live event record.  The event's `type` tag moves
    /// into the envelope; the remaining fields become `data`.
    pub fn from_record(record: &EventRecord) -> Self {
        let mut data = serde_json::to_value(&record.event).unwrap_or(serde_json::Value::Null);
        if let Some(obj) = data.as_object_mut() {
            obj.remove("type");
        }
        Self {
            kind: record.event.kind_str().to_string(),
            data,
            request_id: Some(record.request_id.clone()),
            seq: Some(record.seq),
        }
    }

    /// Outbound frame for a replayed transcript row.
    pub fn from_stored(row: &StoredMessage) -> Self {
        let mut data = row.body.clone();
        if let Some(obj) = data.as_object_mut() {
            obj.remove("type");
        }
        Self {
            kind: row.kind.clone(),
            data,
            request_id: Some(row.request_id.clone()),
            seq: Some(row.seq),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

// ── Inbound commands ──────────────────────────────────────────────────────────

/// One image already written into the project workspace by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub path: PathBuf,
    pub name: String,
}

/// Payload of an inbound `submit` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitPayload {
    pub instruction: String,
    pub agent: AgentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub images: Vec<ImageAttachment>,
    #[serde(default)]
    pub is_initial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_seconds: Option<u64>,
}

impl SubmitPayload {
    /// Validate field bounds and workspace containment of image paths.
    pub fn validate(&self, workspace: &Path) -> Result<(), FrameError> {
        if self.instruction.is_empty() {
            return Err(FrameError::EmptyInstruction);
        }
        if self.instruction.len() > MAX_INSTRUCTION_BYTES {
            return Err(FrameError::InstructionTooLarge(self.instruction.len()));
        }
        if let Some(secs) = self.deadline_seconds {
            if !(MIN_DEADLINE_SECS..=MAX_DEADLINE_SECS).contains(&secs) {
                return Err(FrameError::DeadlineOutOfRange(secs));
            }
        }
        for image in &self.images {
            if !image.path.starts_with(workspace) {
                return Err(FrameError::ImageOutsideWorkspace(image.path.clone()));
            }
        }
        Ok(())
    }
}

/// Parsed inbound client frame.
#[derive(Debug, Clone)]
pub enum ClientCommand {
    Submit(SubmitPayload),
    Cancel { request_id: String },
    SubscribeFromSeq { seq: u64 },
}

impl ClientCommand {
    /// Parse a JSON text frame into a command.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let frame: Frame = serde_json::from_str(text)?;
        match frame.kind.as_str() {
            "submit" => Ok(ClientCommand::Submit(serde_json::from_value(frame.data)?)),
            "cancel" => {
                #[derive(Deserialize)]
                struct Cancel {
                    request_id: String,
                }
                let c: Cancel = serde_json::from_value(frame.data)?;
                Ok(ClientCommand::Cancel {
                    request_id: c.request_id,
                })
            }
            "subscribe_from_seq" => {
                // Accept the seq either in the envelope or in the data object.
                if let Some(seq) = frame.seq {
                    return Ok(ClientCommand::SubscribeFromSeq { seq });
                }
                #[derive(Deserialize)]
                struct FromSeq {
                    seq: u64,
                }
                let s: FromSeq = serde_json::from_value(frame.data)?;
                Ok(ClientCommand::SubscribeFromSeq { seq: s.seq })
            }
            other => Err(FrameError::UnknownType(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown frame type: {0}")]
    UnknownType(String),
    #[error("instruction must not be empty")]
    EmptyInstruction,
    #[error("instruction too large: {0} bytes (max {MAX_INSTRUCTION_BYTES})")]
    InstructionTooLarge(usize),
    #[error("deadline_seconds {0} outside {MIN_DEADLINE_SECS}..={MAX_DEADLINE_SECS}")]
    DeadlineOutOfRange(u64),
    #[error("image path {0} is outside the project workspace")]
    ImageOutsideWorkspace(PathBuf),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
