// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use kiln_protocol::{AgentKind, CanonicalEvent, ImageAttachment};

/// Lazy, finite, single-consumer sequence of canonical events for one run.
pub type EventStream = Pin<Box<dyn Stream<Item = CanonicalEvent> + Send>>;

/// Result of a non-blocking install probe.
#[derive(Debug, Clone, Serialize)]
pub struct Availability {
    pub installed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Availability {
    pub fn installed(version: impl Into<String>) -> Self {
        Self {
            installed: true,
            version: Some(version.into()),
            error: None,
        }
    }

    pub fn missing(error: impl Into<String>) -> Self {
        Self {
            installed: false,
            version: None,
            error: Some(error.into()),
        }
    }
}

/// Everything an adapter needs to execute one instruction.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Project workspace; becomes the subprocess working directory.
    pub workspace: PathBuf,
    pub instruction: String,
    /// Canonical model name; `None` uses the adapter default.
    pub model: Option<String>,
    /// Native session id from a previous successful run, for resume.
    pub prior_session_id: Option<String>,
    /// Images already written into the workspace by the caller.
    pub images: Vec<ImageAttachment>,
    /// Fires when the run must stop; the adapter soft-interrupts, waits
    /// `cancel_grace`, then force-terminates.
    pub cancel: CancellationToken,
    pub cancel_grace: Duration,
}

impl RunRequest {
    /// The instruction with attached image paths appended, in the form the
    /// CLIs understand (they read the files themselves).
    pub fn instruction_with_images(&self) -> String {
        if self.images.is_empty() {
            return self.instruction.clone();
        }
        let mut text = self.instruction.clone();
        text.push_str("\n\nAttached images:\n");
        for image in &self.images {
            text.push_str(&format!("- {} ({})\n", image.path.display(), image.name));
        }
        text
    }
}

/// Driver for one external AI CLI.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn kind(&self) -> AgentKind;

    /// Non-blocking install probe (version flag; missing binary or non-zero
    /// exit means not installed).  Results are cached by the registry.
    async fn available(&self) -> Availability;

    /// One-time workspace setup: seed the agent-specific instructions file
    /// with the system prompt.  Idempotent — repeated calls with identical
    /// content leave the workspace byte-identical.
    async fn initialize(&self, workspace: &Path, system_prompt: &str) -> anyhow::Result<()>;

    /// Launch the subprocess and translate its output into canonical events
    /// until termination.  The stream always ends with exactly one terminal
    /// `Status`.
    fn run(&self, req: RunRequest) -> EventStream;
}

/// Write `content` to `path` only when it differs, creating parent
/// directories as needed.  This is what makes `initialize` idempotent.
pub(crate) fn write_if_changed(path: &Path, content: &str) -> anyhow::Result<()> {
    if let Ok(existing) = std::fs::read_to_string(path) {
        if existing == content {
            return Ok(());
        }
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_if_changed_creates_and_skips_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/rules.md");
        write_if_changed(&path, "v1").unwrap();
        let mtime1 = std::fs::metadata(&path).unwrap().modified().unwrap();
        // Second call with identical content must not rewrite the file.
        std::thread::sleep(std::time::Duration::from_millis(20));
        write_if_changed(&path, "v1").unwrap();
        let mtime2 = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(mtime1, mtime2);
        // Changed content does rewrite.
        write_if_changed(&path, "v2").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "v2");
    }

    #[test]
    fn instruction_with_images_appends_paths() {
        let req = RunRequest {
            workspace: PathBuf::from("/ws"),
            instruction: "style the header".into(),
            model: None,
            prior_session_id: None,
            images: vec![ImageAttachment {
                path: PathBuf::from("/ws/uploads/mock.png"),
                name: "mock.png".into(),
            }],
            cancel: CancellationToken::new(),
            cancel_grace: Duration::from_secs(2),
        };
        let text = req.instruction_with_images();
        assert!(text.starts_with("style the header"));
        assert!(text.contains("/ws/uploads/mock.png"));
    }

    #[test]
    fn instruction_without_images_is_unchanged() {
        let req = RunRequest {
            workspace: PathBuf::from("/ws"),
            instruction: "add tests".into(),
            model: None,
            prior_session_id: None,
            images: Vec::new(),
            cancel: CancellationToken::new(),
            cancel_grace: Duration::from_secs(2),
        };
        assert_eq!(req.instruction_with_images(), "add tests");
    }
}
