// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

/// The closed set of external AI coding CLIs the core knows how to drive.
///
/// Each adapter in `kiln-agents` declares which kind it implements; the
/// registry is a plain lookup table keyed by this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Cursor,
    Codex,
    Gemini,
    Qwen,
}

impl AgentKind {
    /// All supported kinds, in display order.
    pub const ALL: [AgentKind; 5] = [
        AgentKind::Claude,
        AgentKind::Cursor,
        AgentKind::Codex,
        AgentKind::Gemini,
        AgentKind::Qwen,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Cursor => "cursor",
            AgentKind::Codex => "codex",
            AgentKind::Gemini => "gemini",
            AgentKind::Qwen => "qwen",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown agent kind: {0:?} (expected one of claude|cursor|codex|gemini|qwen)")]
pub struct UnknownAgent(pub String);

impl std::str::FromStr for AgentKind {
    type Err = UnknownAgent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(AgentKind::Claude),
            "cursor" => Ok(AgentKind::Cursor),
            "codex" => Ok(AgentKind::Codex),
            "gemini" => Ok(AgentKind::Gemini),
            "qwen" => Ok(AgentKind::Qwen),
            other => Err(UnknownAgent(other.to_string())),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_wire_form() {
        assert_eq!(AgentKind::Claude.to_string(), "claude");
        assert_eq!(AgentKind::Qwen.to_string(), "qwen");
    }

    #[test]
    fn from_str_round_trips_all_kinds() {
        for kind in AgentKind::ALL {
            let parsed: AgentKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn from_str_rejects_unknown() {
        assert!("copilot".parse::<AgentKind>().is_err());
    }

    #[test]
    fn serde_uses_lowercase() {
        let json = serde_json::to_string(&AgentKind::Gemini).unwrap();
        assert_eq!(json, "\"gemini\"");
        let back: AgentKind = serde_json::from_str("\"cursor\"").unwrap();
        assert_eq!(back, AgentKind::Cursor);
    }
}
