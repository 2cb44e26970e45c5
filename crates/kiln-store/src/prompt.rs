// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! System-prompt loader.
//!
//! Role prompts are plain markdown files in a prompts directory
//! (`<role>.md`).  The core does not parse the content; it hands it to the
//! adapter's `initialize` step verbatim.

use std::path::PathBuf;

use tracing::debug;

/// Built-in prompt used when no role file is present.
const DEFAULT_PROMPT: &str = "\
# Role

You are the coding agent of an AI-assisted web-app builder.  You work inside
a Next.js project workspace.  Apply the user's instruction with minimal,
focused edits; keep the dev server runnable after every change; never touch
files outside the workspace.
";

/// The default role when the caller does not name one.
pub const DEFAULT_ROLE: &str = "builder";

#[derive(Debug, Clone, Default)]
pub struct SystemPromptLoader {
    dir: Option<PathBuf>,
}

impl SystemPromptLoader {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    /// Read `<role>.md` from the prompts directory; fall back to the built-in
    /// prompt when the directory or file is absent.
    pub fn load(&self, role: &str) -> String {
        if let Some(dir) = &self.dir {
            let path = dir.join(format!("{role}.md"));
            match std::fs::read_to_string(&path) {
                Ok(text) => return text,
                Err(e) => {
                    debug!(path = %path.display(), "role prompt not readable ({e}), using built-in");
                }
            }
        }
        DEFAULT_PROMPT.to_string()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
