// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared protocol types for the kiln orchestration core.
//!
//! Everything that crosses a boundary lives here: the canonical event schema
//! emitted by adapters, the error taxonomy, the persisted message row, and
//! the WebSocket frame envelope.  Downstream crates (adapters, orchestrator,
//! gateway) depend on this crate and nothing else in the workspace.

pub mod agent;
pub mod event;
pub mod frame;
pub mod message;

pub use agent::{AgentKind, UnknownAgent};
pub use event::{CanonicalEvent, ErrorKind, EventRecord, Phase};
pub use frame::{
    ClientCommand, Frame, FrameError, ImageAttachment, SubmitPayload, CLOSE_NORMAL,
    CLOSE_PROJECT_UNKNOWN, CLOSE_SLOW_CONSUMER, CLOSE_UNAUTHORIZED, MAX_DEADLINE_SECS,
    MAX_INSTRUCTION_BYTES, MIN_DEADLINE_SECS,
};
pub use message::{Role, StoredMessage};

/// Projects are identified by UUID throughout the core.
pub type ProjectId = uuid::Uuid;
