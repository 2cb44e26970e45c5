// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Adapter for the Qwen Code CLI.
//!
//! The qwen CLI is a fork of the gemini CLI and emits the same stream-json
//! records, so this adapter reuses [`GeminiStreamParser`] and only supplies
//! its own binary name, rules file, environment set, and model table rows.

use std::path::Path;

use async_trait::async_trait;

use kiln_protocol::AgentKind;

use crate::adapter::{write_if_changed, Adapter, Availability, EventStream, RunRequest};
use crate::claude::prepend_model_fallback;
use crate::gemini::{stream_json_invocation, GeminiStreamParser};
use crate::models;
use crate::process::{drive, probe_version};

const PROGRAM: &str = "qwen";

/// Workspace instructions file the CLI reads on startup.
const RULES_FILE: &str = "QWEN.md";

const ENV_PASSTHROUGH: &[&str] = &["DASHSCOPE_API_KEY", "OPENAI_API_KEY", "OPENAI_BASE_URL"];

pub struct QwenAdapter;

#[async_trait]
impl Adapter for QwenAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::Qwen
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

// ─── Unit tests ──────────────────────────────────────────────────────────────
