// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Scripted adapter for tests (no subprocess, no network).
//!
//! Orchestrator and gateway tests drive deterministic runs by queueing
//! scripts: each `run()` pops the next script and plays it back.  With no
//! script queued, a minimal successful run is played.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use kiln_protocol::{AgentKind, CanonicalEvent, Phase};

use crate::adapter::{Adapter, Availability, EventStream, RunRequest};

/// One step of a scripted run.
#[derive(Debug, Clone)]
pub enum MockStep {
    /// Emit this event.
    Event(CanonicalEvent),
    /// Sleep, aborting into `Status{cancelled}` if the run is cancelled.
    Delay(Duration),
    /// Park until the run is cancelled.
    AwaitCancel,
}

/// What a run was asked to do; recorded for assertions.
#[derive(Debug, Clone)]
pub struct SeenRun {
    pub instruction: String,
    pub model: Option<String>,
    pub prior_session_id: Option<String>,
}

pub struct MockAdapter {
    kind: AgentKind,
    installed: bool,
    scripts: Mutex<VecDeque<Vec<MockStep>>>,
    seen: Mutex<Vec<SeenRun>>,
    probes: AtomicUsize,
}

impl MockAdapter {
    pub fn new(kind: AgentKind) -> Self {
        Self {
            kind,
            installed: true,
            scripts: Mutex::new(VecDeque::new()),
            seen: Mutex::new(Vec::new()),
            probes: AtomicUsize::new(0),
        }
    }

    /// A mock whose binary is "missing" — `available()` reports not
    /// installed and any run fails before spawning.
    pub fn uninstalled(kind: AgentKind) -> Self {
        Self {
            installed: false,
            ..Self::new(kind)
        }
    }

    /// Queue the script for the next `run()`.
    pub fn push_script(&self, steps: Vec<MockStep>) {
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(steps);
    }

    /// Runs observed so far.
    pub fn seen(&self) -> Vec<SeenRun> {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of `available()` probes that reached the adapter (bypassing
    /// the registry cache).
    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    fn next_script(&self) -> Vec<MockStep> {
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| {
                vec![
                    MockStep::Event(CanonicalEvent::SessionInfo {
                        native_session_id: "mock-session".into(),
                    }),
                    MockStep::Event(CanonicalEvent::AssistantText {
                        text: "ok".into(),
                        is_final: true,
                    }),
                    MockStep::Event(CanonicalEvent::status(Phase::Complete)),
                ]
            })
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    async fn available(&self) -> Availability {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.installed {
            Availability::installed("mock 0.0.0")
        } else {
            Availability::missing("mock binary not installed")
        }
    }

    async fn initialize(&self, _workspace: &Path, _system_prompt: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn run(&self, req: RunRequest) -> EventStream {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SeenRun {
                instruction: req.instruction.clone(),
                model: req.model.clone(),
                prior_session_id: req.prior_session_id.clone(),
            });

        let script = self.next_script();
        let cancel = req.cancel.clone();

        Box::pin(async_stream::stream! {
            let mut terminal_sent = false;
            for step in script {
                match step {
                    MockStep::Event(event) => {
                        if terminal_sent {
                            continue;
                        }
                        if event.is_terminal() {
                            terminal_sent = true;
                        }
                        yield event;
                    }
                    MockStep::Delay(duration) => {
                        tokio::select! {
                            _ = tokio::time::sleep(duration) => {}
                            _ = cancel.cancelled() => {
                                yield CanonicalEvent::status(Phase::Cancelled);
                                return;
                            }
                        }
                    }
                    MockStep::AwaitCancel => {
                        cancel.cancelled().await;
                        yield CanonicalEvent::status(Phase::Cancelled);
                        return;
                    }
                }
            }
            if !terminal_sent {
                yield CanonicalEvent::status(Phase::Complete);
            }
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_util::sync::CancellationToken;

    fn request(cancel: CancellationToken) -> RunRequest {
        RunRequest {
            workspace: std::env::temp_dir(),
            instruction: "test".into(),
            model: None,
            prior_session_id: None,
            images: Vec::new(),
            cancel,
            cancel_grace: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn default_script_is_a_complete_run() {
        let adapter = MockAdapter::new(AgentKind::Claude);
        let events: Vec<_> = adapter.run(request(CancellationToken::new())).collect().await;
        assert_eq!(events.last(), Some(&CanonicalEvent::status(Phase::Complete)));
        assert_eq!(adapter.seen().len(), 1);
    }

    #[tokio::test]
    async fn scripts_play_in_fifo_order() {
        let adapter = MockAdapter::new(AgentKind::Claude);
        adapter.push_script(vec![MockStep::Event(CanonicalEvent::AssistantText {
            text: "first".into(),
            is_final: true,
        })]);
        adapter.push_script(vec![MockStep::Event(CanonicalEvent::AssistantText {
            text: "second".into(),
            is_final: true,
        })]);
        let a: Vec<_> = adapter.run(request(CancellationToken::new())).collect().await;
        let b: Vec<_> = adapter.run(request(CancellationToken::new())).collect().await;
        assert!(matches!(&a[0], CanonicalEvent::AssistantText { text, .. } if text == "first"));
        assert!(matches!(&b[0], CanonicalEvent::AssistantText { text, .. } if text == "second"));
    }

    #[tokio::test]
    async fn missing_terminal_is_synthesized() {
        let adapter = MockAdapter::new(AgentKind::Claude);
        adapter.push_script(vec![MockStep::Event(CanonicalEvent::AssistantText {
            text: "only".into(),
            is_final: false,
        })]);
        let events: Vec<_> = adapter.run(request(CancellationToken::new())).collect().await;
        assert_eq!(events.last(), Some(&CanonicalEvent::status(Phase::Complete)));
    }

    #[tokio::test]
    async fn await_cancel_parks_until_cancelled() {
        let adapter = MockAdapter::new(AgentKind::Claude);
        adapter.push_script(vec![MockStep::AwaitCancel]);
        let cancel = CancellationToken::new();
        let mut stream = adapter.run(request(cancel.clone()));

        cancel.cancel();
        let events: Vec<_> = stream.by_ref().collect().await;
        assert_eq!(events, vec![CanonicalEvent::status(Phase::Cancelled)]);
    }

    #[tokio::test]
    async fn uninstalled_mock_reports_missing() {
        let adapter = MockAdapter::uninstalled(AgentKind::Qwen);
        let availability = adapter.available().await;
        assert!(!availability.installed);
    }
}
