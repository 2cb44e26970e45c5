// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use kiln_protocol::{AgentKind, ImageAttachment, SubmitPayload};

/// One instruction accepted into a project's queue.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub instruction: String,
    pub agent: AgentKind,
    /// Canonical model name; `None` resolves through the session's last
    /// model, then the adapter default.
    pub model: Option<String>,
    /// Images the caller already wrote into the workspace.
    pub images: Vec<ImageAttachment>,
    /// First instruction after scaffolding; adapters receive it unchanged,
    /// the flag only affects UI presentation.
    pub is_initial: bool,
    /// Per-request run deadline override in seconds (validated 60..=3600 at
    /// the hub); `None` uses the configured default.
    pub deadline_seconds: Option<u64>,
}

impl From<SubmitPayload> for SubmitRequest {
    fn from(p: SubmitPayload) -> Self {
        Self {
            instruction: p.instruction,
            agent: p.agent,
            model: p.model,
            images: p.images,
            is_initial: p.is_initial,
            deadline_seconds: p.deadline_seconds,
        }
    }
}

/// Generates `<monotonic-counter>-<process-random-suffix>` request ids.
///
/// The counter orders requests within one orchestrator; the suffix keeps ids
/// from colliding across process restarts.
#[derive(Debug)]
pub struct RequestIdGen {
    counter: u64,
    suffix: String,
}

impl RequestIdGen {
    pub fn new() -> Self {
        use rand::Rng;
        let suffix: String = rand::thread_rng()
            .sample_iter(rand::distributions::Alphanumeric)
            .take(6)
            .map(char::from)
            .collect();
        Self {
            counter: 0,
            suffix: suffix.to_lowercase(),
        }
    }

    pub fn next(&mut self) -> String {
        self.counter += 1;
        format!("{}-{}", self.counter, self.suffix)
    }
}

impl Default for RequestIdGen {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
