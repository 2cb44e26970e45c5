// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Canonical model table.
//!
//! This module is the single source of truth mapping the canonical model
//! names the UI shows to the flag value each CLI natively accepts.  It does
//! **not** contain adapter construction logic — that lives in
//! [`crate::registry`].

use kiln_protocol::AgentKind;

/// One (agent, canonical name) → native flag value mapping.
#[derive(Debug, Clone, Copy)]
pub struct ModelMapping {
    pub kind: AgentKind,
    /// Canonical name as shown to users and carried in submit payloads.
    pub canonical: &'static str,
    /// Value passed to the CLI's model flag.
    pub native: &'static str,
}

/// Complete model table.  Unknown canonical names fall back to the agent's
/// default (the first entry for its kind).
pub static MODELS: &[ModelMapping] = &[
    // ── claude ────────────────────────────────────────────────────────────────
    ModelMapping {
        kind: AgentKind::Claude,
        canonical: "claude-sonnet-4.5",
        native: "claude-sonnet-4-5",
    },
    ModelMapping {
        kind: AgentKind::Claude,
        canonical: "claude-opus-4.1",
        native: "claude-opus-4-1",
    },
    ModelMapping {
        kind: AgentKind::Claude,
        canonical: "claude-haiku-4.5",
        native: "claude-haiku-4-5",
    },
    // ── cursor ────────────────────────────────────────────────────────────────
    ModelMapping {
        kind: AgentKind::Cursor,
        canonical: "auto",
        native: "auto",
    },
    ModelMapping {
        kind: AgentKind::Cursor,
        canonical: "gpt-5",
        native: "gpt-5",
    },
    ModelMapping {
        kind: AgentKind::Cursor,
        canonical: "claude-sonnet-4.5",
        native: "sonnet-4.5",
    },
    // ── codex ─────────────────────────────────────────────────────────────────
    ModelMapping {
        kind: AgentKind::Codex,
        canonical: "gpt-5-codex",
        native: "gpt-5-codex",
    },
    ModelMapping {
        kind: AgentKind::Codex,
        canonical: "gpt-5",
        native: "gpt-5",
    },
    ModelMapping {
        kind: AgentKind::Codex,
        canonical: "o4-mini",
        native: "o4-mini",
    },
    // ── gemini ────────────────────────────────────────────────────────────────
    ModelMapping {
        kind: AgentKind::Gemini,
        canonical: "gemini-2.5-pro",
        native: "gemini-2.5-pro",
    },
    ModelMapping {
        kind: AgentKind::Gemini,
        canonical: "gemini-2.5-flash",
        native: "gemini-2.5-flash",
    },
    // ── qwen ──────────────────────────────────────────────────────────────────
    ModelMapping {
        kind: AgentKind::Qwen,
        canonical: "qwen3-coder",
        native: "qwen3-coder-plus",
    },
    ModelMapping {
        kind: AgentKind::Qwen,
        canonical: "qwen3-coder-flash",
        native: "qwen3-coder-flash",
    },
];

/// Native flag value for a canonical name, if the mapping exists.
pub fn resolve(kind: AgentKind, canonical: &str) -> Option<&'static str> {
    MODELS
        .iter()
        .find(|m| m.kind == kind && m.canonical == canonical)
        .map(|m| m.native)
}

/// The agent's default native model (first table entry for its kind).
pub fn default_model(kind: AgentKind) -> &'static str {
    MODELS
        .iter()
        .find(|m| m.kind == kind)
        .map(|m| m.native)
        .unwrap_or("")
}

/// Resolve a requested canonical name to the native flag, falling back to
/// the default.  The bool is `true` when a fallback happened.
pub fn resolve_or_default(kind: AgentKind, canonical: Option<&str>) -> (&'static str, bool) {
    match canonical {
        None => (default_model(kind), false),
        Some(name) => match resolve(kind, name) {
            Some(native) => (native, false),
            None => (default_model(kind), true),
        },
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
