// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-project orchestrator.
//!
//! # Design
//!
//! ```text
//!   WS handler ──┐
//!                ├──► mpsc::Sender<Command> ──► Orchestrator (one task
//!   WS handler ──┘                              per project)
//!                                                 │ owns the subprocess run
//!                                                 │ assigns seq, persists,
//!                                                 │ then broadcasts
//!   WS handler ◄──┐                               │
//!                 ├── broadcast::Receiver<StoredMessage> ◄──┘
//!   WS handler ◄──┘
//! ```
//!
//! The orchestrator is a single task: commands and adapter events are
//! multiplexed through one `select!` loop, so per-project state needs no
//! locking.  At most one adapter subprocess runs at a time; further submits
//! queue FIFO.  Every canonical event is stamped with the next project
//! sequence number, persisted to the Message Store, and only then broadcast
//! — anything a subscriber sees is already durable.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kiln_agents::{Adapter, AdapterRegistry, RunRequest};
use kiln_config::CoreConfig;
use kiln_protocol::{
    CanonicalEvent, ErrorKind, EventRecord, Phase, ProjectId, StoredMessage,
};
use kiln_store::{prompt::DEFAULT_ROLE, MessageStore, Project, StoreError, SystemPromptLoader};

use crate::request::{RequestIdGen, SubmitRequest};
use crate::session::SessionStore;

// ── Public handle ─────────────────────────────────────────────────────────────

/// Outcome of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
}

enum Command {
    Submit {
        request: SubmitRequest,
        reply: oneshot::Sender<String>,
    },
    Cancel {
        request_id: String,
        reply: oneshot::Sender<CancelOutcome>,
    },
    Shutdown,
}

/// Cheap-to-clone handle to a running [`Orchestrator`] task.
#[derive(Clone)]
pub struct OrchestratorHandle {
    cmd_tx: mpsc::Sender<Command>,
    event_tx: broadcast::Sender<StoredMessage>,
}

impl OrchestratorHandle {
    /// Queue an instruction; returns its request id.
    pub async fn submit(&self, request: SubmitRequest) -> anyhow::Result<String> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Submit { request, reply })
            .await
            .map_err(|_| anyhow::anyhow!("orchestrator has shut down"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("orchestrator dropped the submit"))
    }

    /// Best-effort cancel of a queued or running request.
    pub async fn cancel(&self, request_id: &str) -> anyhow::Result<CancelOutcome> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Cancel {
                request_id: request_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| anyhow::anyhow!("orchestrator has shut down"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("orchestrator dropped the cancel"))
    }

    /// Subscribe to the live fan-out.  Rows arrive exactly as persisted,
    /// so replay and live delivery share one shape.
    pub fn subscribe(&self) -> broadcast::Receiver<StoredMessage> {
        self.event_tx.subscribe()
    }

    /// Cancel the in-flight run, drain the queue as cancelled, stop the task.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }

    /// True once the orchestrator task has exited.
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    /// Subscribers currently attached to the fan-out.
    pub fn subscriber_count(&self) -> usize {
        self.event_tx.receiver_count()
    }
}

// ── Orchestrator ──────────────────────────────────────────────────────────────

struct Queued {
    id: String,
    request: SubmitRequest,
    /// Request id of the originating run when this entry is the one-shot
    /// fallback retry.
    fallback_of: Option<String>,
}

#[derive(Default)]
struct RunStats {
    saw_assistant: bool,
    new_session: Option<String>,
}

enum RunPass {
    /// The run ended; its terminal phase was forwarded.
    Done(Phase, RunStats),
    /// The prior session id was rejected; retry once without resume.  No
    /// terminal status has been forwarded.
    StaleRetry,
}

pub struct Orchestrator {
    project: Project,
    registry: Arc<AdapterRegistry>,
    store: Arc<dyn MessageStore>,
    sessions: Arc<SessionStore>,
    prompts: Arc<SystemPromptLoader>,
    config: CoreConfig,
    cmd_rx: mpsc::Receiver<Command>,
    event_tx: broadcast::Sender<StoredMessage>,
    queue: VecDeque<Queued>,
    ids: RequestIdGen,
    /// Project sequence counter; the last value stamped on an event.
    seq: u64,
    initialized: HashSet<kiln_protocol::AgentKind>,
    retired_tx: Option<mpsc::Sender<ProjectId>>,
    shutting_down: bool,
}

impl Orchestrator {
    /// Spawn the orchestrator task and return its handle.
    ///
    /// `retired_tx` (when given) receives the project id after the task
    /// winds down, so the supervisor can drop its map entry.
    pub fn spawn(
        project: Project,
        registry: Arc<AdapterRegistry>,
        store: Arc<dyn MessageStore>,
        sessions: Arc<SessionStore>,
        prompts: Arc<SystemPromptLoader>,
        config: CoreConfig,
        retired_tx: Option<mpsc::Sender<ProjectId>>,
    ) -> OrchestratorHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, _) = broadcast::channel(config.subscriber_queue_capacity.max(1));
        let handle = OrchestratorHandle {
            cmd_tx,
            event_tx: event_tx.clone(),
        };
        let orchestrator = Self {
            project,
            registry,
            store,
            sessions,
            prompts,
            config,
            cmd_rx,
            event_tx,
            queue: VecDeque::new(),
            ids: RequestIdGen::new(),
            seq: 0,
            initialized: HashSet::new(),
            retired_tx,
            shutting_down: false,
        };
        tokio::spawn(orchestrator.run());
        handle
    }

    async fn run(mut self) {
        info!(project = %self.project.id, "orchestrator started");
        if let Err(e) = self.hydrate().await {
            warn!(project = %self.project.id, "hydrating from message store: {e}");
        }

        loop {
            if self.shutting_down {
                break;
            }
            if let Some(next) = self.queue.pop_front() {
                self.execute(next).await;
                continue;
            }

            let linger =
                tokio::time::sleep(Duration::from_secs(self.config.idle_orchestrator_linger_seconds));
            tokio::pin!(linger);
            let retire = tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        self.handle_command(cmd).await;
                        false
                    }
                    None => true,
                },
                _ = &mut linger => {
                    self.event_tx.receiver_count() == 0 && self.queue.is_empty()
                }
            };
            if retire {
                break;
            }
        }

        // Shutdown path: every still-queued request gets its terminal status.
        while let Some(q) = self.queue.pop_front() {
            self.emit_best_effort(&q.id, CanonicalEvent::status(Phase::Cancelled))
                .await;
        }
        if let Some(tx) = &self.retired_tx {
            let _ = tx.send(self.project.id).await;
        }
        info!(project = %self.project.id, "orchestrator stopped");
    }

    /// Restore the sequence counter and session state from the transcript.
    async fn hydrate(&mut self) -> Result<(), StoreError> {
        self.seq = self.store.max_seq(self.project.id).await?;
        if !self.sessions.is_hydrated(self.project.id) {
            let rows = self.store.since_seq(self.project.id, 0).await?;
            self.sessions.hydrate(self.project.id, &rows);
        }
        Ok(())
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Submit { request, reply } => {
                let id = self.enqueue(request).await;
                let _ = reply.send(id);
            }
            Command::Cancel { request_id, reply } => {
                let outcome = self.cancel_queued(&request_id).await;
                let _ = reply.send(outcome);
            }
            Command::Shutdown => {
                self.shutting_down = true;
            }
        }
    }

    /// Assign a request id, persist the instruction row, queue the request.
    async fn enqueue(&mut self, request: SubmitRequest) -> String {
        let id = self.ids.next();
        self.seq += 1;
        let row = StoredMessage::instruction(
            self.project.id,
            self.seq,
            id.clone(),
            &request.instruction,
            request.agent,
            request.model.as_deref(),
        );
        if let Err(e) = self.store.append(row.clone()).await {
            warn!(project = %self.project.id, "persisting instruction: {e}");
        }
        let _ = self.event_tx.send(row);
        debug!(project = %self.project.id, request = %id, agent = %request.agent, "queued");
        self.queue.push_back(Queued {
            id: id.clone(),
            request,
            fallback_of: None,
        });
        id
    }

    /// Discard a queued request.  The caller observing `Cancelled` still
    /// gets a terminal status for it.
    async fn cancel_queued(&mut self, request_id: &str) -> CancelOutcome {
        if let Some(pos) = self.queue.iter().position(|q| q.id == request_id) {
            if let Some(q) = self.queue.remove(pos) {
                let _ = self
                    .emit(&q.id, CanonicalEvent::status(Phase::Cancelled))
                    .await;
            }
            CancelOutcome::Cancelled
        } else {
            CancelOutcome::NotFound
        }
    }

    // ── One run ───────────────────────────────────────────────────────────────

    async fn execute(&mut self, queued: Queued) {
        let agent = queued.request.agent;
        info!(project = %self.project.id, request = %queued.id, %agent, "run starting");

        if self
            .emit(&queued.id, CanonicalEvent::status(Phase::Start { agent }))
            .await
            .is_err()
        {
            // The transcript is the source of truth; without it the run
            // must not start.
            self.emit_best_effort(
                &queued.id,
                CanonicalEvent::error(ErrorKind::Internal, "transcript persistence failed"),
            )
            .await;
            self.emit_best_effort(
                &queued.id,
                CanonicalEvent::status(Phase::Failed {
                    kind: ErrorKind::Internal,
                }),
            )
            .await;
            return;
        }

        // Short-circuit before any spawn when the binary is missing.
        let availability = self.registry.availability(agent).await;
        if !availability.installed {
            let message = availability
                .error
                .unwrap_or_else(|| format!("{agent} is not installed"));
            let _ = self
                .emit(&queued.id, CanonicalEvent::error(ErrorKind::CliNotInstalled, message))
                .await;
            let _ = self
                .emit(
                    &queued.id,
                    CanonicalEvent::status(Phase::Failed {
                        kind: ErrorKind::CliNotInstalled,
                    }),
                )
                .await;
            self.maybe_fallback(&queued, ErrorKind::CliNotInstalled).await;
            return;
        }
        let Some(adapter) = self.registry.get(agent) else {
            let _ = self
                .emit(
                    &queued.id,
                    CanonicalEvent::error(
                        ErrorKind::Internal,
                        format!("no adapter registered for {agent}"),
                    ),
                )
                .await;
            let _ = self
                .emit(
                    &queued.id,
                    CanonicalEvent::status(Phase::Failed {
                        kind: ErrorKind::Internal,
                    }),
                )
                .await;
            return;
        };

        // One-time workspace setup per (project, agent).
        if !self.initialized.contains(&agent) {
            let prompt = self.prompts.load(DEFAULT_ROLE);
            match adapter.initialize(&self.project.workspace, &prompt).await {
                Ok(()) => {
                    self.initialized.insert(agent);
                }
                Err(e) => warn!(project = %self.project.id, %agent, "adapter initialize: {e}"),
            }
        }

        // Model precedence: request > session.last_model > adapter default.
        let session = self.sessions.get(self.project.id, agent);
        let model = queued.request.model.clone().or(session.last_model.clone());
        let prior = session.native_session_id.clone();

        let first = self
            .drive_run(&queued, adapter.clone(), model.clone(), prior)
            .await;
        let (phase, stats) = match first {
            RunPass::StaleRetry => {
                info!(request = %queued.id, "prior session rejected, retrying without resume");
                match self.drive_run(&queued, adapter, model.clone(), None).await {
                    RunPass::Done(phase, stats) => (phase, stats),
                    // Unreachable: retry runs with no prior session.
                    RunPass::StaleRetry => (
                        Phase::Failed {
                            kind: ErrorKind::SessionStale,
                        },
                        RunStats::default(),
                    ),
                }
            }
            RunPass::Done(phase, stats) => (phase, stats),
        };

        if phase == Phase::Complete {
            let mut session = self.sessions.get(self.project.id, agent);
            if stats.saw_assistant {
                if let Some(id) = stats.new_session {
                    session.native_session_id = Some(id);
                }
            }
            if let Some(model) = model {
                session.last_model = Some(model);
            }
            session.seq = self.seq;
            self.sessions.set(self.project.id, agent, session);
        }

        if let Phase::Failed { kind } = phase {
            self.maybe_fallback(&queued, kind).await;
        }
        info!(project = %self.project.id, request = %queued.id, ?phase, "run ended");
    }

    /// Drive one adapter stream to its terminal status, multiplexing
    /// commands and the stall/deadline timers.
    async fn drive_run(
        &mut self,
        queued: &Queued,
        adapter: Arc<dyn Adapter>,
        model: Option<String>,
        prior: Option<String>,
    ) -> RunPass {
        let cancel = CancellationToken::new();
        let resume_attempted = prior.is_some();
        let deadline_secs = queued
            .request
            .deadline_seconds
            .unwrap_or(self.config.default_run_deadline_seconds);
        let stall_dur = Duration::from_secs(self.config.default_stall_seconds);

        let mut stream = adapter.run(RunRequest {
            workspace: self.project.workspace.clone(),
            instruction: queued.request.instruction.clone(),
            model,
            prior_session_id: prior,
            images: queued.request.images.clone(),
            cancel: cancel.clone(),
            cancel_grace: Duration::from_secs(self.config.cancel_grace_seconds),
        });

        let deadline = tokio::time::sleep(Duration::from_secs(deadline_secs));
        tokio::pin!(deadline);
        let stall = tokio::time::sleep(stall_dur);
        tokio::pin!(stall);

        let mut stats = RunStats::default();
        let mut open_calls: Vec<String> = Vec::new();
        let mut user_cancelled = false;
        let mut timed_out = false;
        let mut persist_broken = false;

        let adapter_phase: Option<Phase> = loop {
            tokio::select! {
                event = stream.next() => {
                    let Some(event) = event else { break None };
                    stall.as_mut().reset(tokio::time::Instant::now() + stall_dur);
                    match &event {
                        CanonicalEvent::AssistantText { .. } => stats.saw_assistant = true,
                        CanonicalEvent::SessionInfo { native_session_id } => {
                            stats.new_session = Some(native_session_id.clone());
                        }
                        CanonicalEvent::ToolCall { call_id, .. } => {
                            open_calls.push(call_id.clone());
                        }
                        CanonicalEvent::ToolResult { call_id, .. } => {
                            open_calls.retain(|c| c != call_id);
                        }
                        _ => {}
                    }
                    if let CanonicalEvent::Status { phase } = &event {
                        if phase.is_terminal() {
                            break Some(*phase);
                        }
                    }
                    if self.emit(&queued.id, event).await.is_err() {
                        persist_broken = true;
                        cancel.cancel();
                    }
                }
                _ = &mut deadline, if !timed_out && !user_cancelled && !persist_broken => {
                    warn!(request = %queued.id, "run deadline exceeded");
                    timed_out = true;
                    cancel.cancel();
                }
                _ = &mut stall, if !timed_out && !user_cancelled && !persist_broken => {
                    warn!(request = %queued.id, "stall window exceeded");
                    timed_out = true;
                    cancel.cancel();
                }
                // Once shutdown has been seen the closed channel would be
                // ready on every poll; stop draining it and let the run
                // wind down through the cancel token.
                cmd = self.cmd_rx.recv(), if !self.shutting_down => match cmd {
                    Some(Command::Submit { request, reply }) => {
                        let id = self.enqueue(request).await;
                        let _ = reply.send(id);
                    }
                    Some(Command::Cancel { request_id, reply }) => {
                        if request_id == queued.id {
                            user_cancelled = true;
                            cancel.cancel();
                            let _ = reply.send(CancelOutcome::Cancelled);
                        } else {
                            let outcome = self.cancel_queued(&request_id).await;
                            let _ = reply.send(outcome);
                        }
                    }
                    Some(Command::Shutdown) | None => {
                        self.shutting_down = true;
                        user_cancelled = true;
                        cancel.cancel();
                    }
                },
            }
        };

        if persist_broken {
            self.synthesize_interrupted(&queued.id, &open_calls).await;
            self.emit_best_effort(
                &queued.id,
                CanonicalEvent::error(ErrorKind::Internal, "transcript persistence failed"),
            )
            .await;
            self.emit_best_effort(
                &queued.id,
                CanonicalEvent::status(Phase::Failed {
                    kind: ErrorKind::Internal,
                }),
            )
            .await;
            return RunPass::Done(
                Phase::Failed {
                    kind: ErrorKind::Internal,
                },
                stats,
            );
        }
        if timed_out {
            self.synthesize_interrupted(&queued.id, &open_calls).await;
            let _ = self
                .emit(
                    &queued.id,
                    CanonicalEvent::error(
                        ErrorKind::Timeout,
                        "no progress within the stall window or run deadline",
                    ),
                )
                .await;
            let _ = self
                .emit(
                    &queued.id,
                    CanonicalEvent::status(Phase::Failed {
                        kind: ErrorKind::Timeout,
                    }),
                )
                .await;
            return RunPass::Done(
                Phase::Failed {
                    kind: ErrorKind::Timeout,
                },
                stats,
            );
        }
        if user_cancelled {
            self.synthesize_interrupted(&queued.id, &open_calls).await;
            let _ = self
                .emit(&queued.id, CanonicalEvent::status(Phase::Cancelled))
                .await;
            return RunPass::Done(Phase::Cancelled, stats);
        }

        match adapter_phase {
            Some(Phase::Failed {
                kind: ErrorKind::SessionStale,
            }) if resume_attempted => RunPass::StaleRetry,
            Some(phase) => {
                self.synthesize_interrupted(&queued.id, &open_calls).await;
                let _ = self.emit(&queued.id, CanonicalEvent::status(phase)).await;
                RunPass::Done(phase, stats)
            }
            None => {
                self.synthesize_interrupted(&queued.id, &open_calls).await;
                let _ = self
                    .emit(
                        &queued.id,
                        CanonicalEvent::error(
                            ErrorKind::Internal,
                            "adapter stream ended without a terminal status",
                        ),
                    )
                    .await;
                let _ = self
                    .emit(
                        &queued.id,
                        CanonicalEvent::status(Phase::Failed {
                            kind: ErrorKind::Internal,
                        }),
                    )
                    .await;
                RunPass::Done(
                    Phase::Failed {
                        kind: ErrorKind::Internal,
                    },
                    stats,
                )
            }
        }
    }

    /// Tool calls without a result at terminal time get a synthesized
    /// failed result so every call is paired.  Emission is best-effort:
    /// the pairing must reach subscribers even when the store is failing.
    async fn synthesize_interrupted(&mut self, request_id: &str, open_calls: &[String]) {
        for call_id in open_calls {
            self.emit_best_effort(
                request_id,
                CanonicalEvent::ToolResult {
                    call_id: call_id.clone(),
                    ok: false,
                    output: None,
                    error: Some("interrupted".to_string()),
                },
            )
            .await;
        }
    }

    /// One-shot retry on the fallback agent after adapter-level failure.
    async fn maybe_fallback(&mut self, queued: &Queued, kind: ErrorKind) {
        let fallback = self.config.fallback_agent;
        if !kind.fallback_eligible()
            || queued.request.agent == fallback
            || queued.fallback_of.is_some()
            || self.shutting_down
        {
            return;
        }
        let retry_id = self.ids.next();
        let _ = self
            .emit(
                &retry_id,
                CanonicalEvent::status(Phase::Fellback {
                    from: queued.request.agent,
                    to: fallback,
                }),
            )
            .await;
        let mut request = queued.request.clone();
        request.agent = fallback;
        // Model names are agent-specific; the fallback run uses its default.
        request.model = None;
        info!(
            project = %self.project.id,
            from = %queued.request.agent,
            to = %fallback,
            original = %queued.id,
            retry = %retry_id,
            "falling back"
        );
        self.queue.push_front(Queued {
            id: retry_id,
            request,
            fallback_of: Some(queued.id.clone()),
        });
    }

    // ── Emission ──────────────────────────────────────────────────────────────

    /// Stamp the next sequence number, persist, then broadcast.  The order
    /// matters: anything a subscriber sees must already be durable.
    async fn emit(&mut self, request_id: &str, event: CanonicalEvent) -> Result<(), StoreError> {
        self.seq += 1;
        let record = EventRecord {
            seq: self.seq,
            request_id: request_id.to_string(),
            event,
        };
        let row = StoredMessage::from_record(self.project.id, &record);
        self.store.append(row.clone()).await?;
        let _ = self.event_tx.send(row);
        Ok(())
    }

    /// Like [`emit`], but broadcasts even when persistence fails — used on
    /// the persistence-failure path so subscribers still see a terminal.
    async fn emit_best_effort(&mut self, request_id: &str, event: CanonicalEvent) {
        self.seq += 1;
        let record = EventRecord {
            seq: self.seq,
            request_id: request_id.to_string(),
            event,
        };
        let row = StoredMessage::from_record(self.project.id, &record);
        if let Err(e) = self.store.append(row.clone()).await {
            warn!(project = %self.project.id, "append after persistence failure: {e}");
        }
        let _ = self.event_tx.send(row);
    }
}
