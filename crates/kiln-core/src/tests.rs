// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Orchestrator scenario tests against scripted mock adapters.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use kiln_agents::{AdapterRegistry, MockAdapter, MockStep};
use kiln_config::CoreConfig;
use kiln_protocol::{AgentKind, CanonicalEvent, ErrorKind, Phase, ProjectId, StoredMessage};
use kiln_store::{MemoryMessageStore, MessageStore, Project, SystemPromptLoader};

use crate::orchestrator::{CancelOutcome, Orchestrator, OrchestratorHandle};
use crate::request::SubmitRequest;
use crate::session::{project_sessions, Session, SessionStore};

struct World {
    project: ProjectId,
    handle: OrchestratorHandle,
    store: Arc<MemoryMessageStore>,
    sessions: Arc<SessionStore>,
    _workspace: tempfile::TempDir,
}

fn submit(agent: AgentKind, model: Option<&str>) -> SubmitRequest {
    SubmitRequest {
        instruction: "add hello page".into(),
        agent,
        model: model.map(str::to_string),
        images: Vec::new(),
        is_initial: false,
        deadline_seconds: None,
    }
}

fn build_world(adapters: Vec<Arc<MockAdapter>>, config: CoreConfig) -> World {
    let workspace = tempfile::tempdir().expect("tempdir");
    let project_id = ProjectId::new_v4();
    let project = Project {
        id: project_id,
        workspace: workspace.path().to_path_buf(),
        preferred_agent: AgentKind::Claude,
        preferred_model: None,
    };
    let registry = Arc::new(AdapterRegistry::with_adapters(
        adapters
            .into_iter()
            .map(|a| a as Arc<dyn kiln_agents::Adapter>)
            .collect(),
        Duration::from_secs(60),
    ));
    let store = Arc::new(MemoryMessageStore::new());
    let sessions = Arc::new(SessionStore::new());
    let handle = Orchestrator::spawn(
        project,
        registry,
        store.clone(),
        sessions.clone(),
        Arc::new(SystemPromptLoader::new(None)),
        config,
        None,
    );
    World {
        project: project_id,
        handle,
        store,
        sessions,
        _workspace: workspace,
    }
}

async fn next_row(rx: &mut broadcast::Receiver<StoredMessage>) -> StoredMessage {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("no event within 10s")
        .expect("event channel closed")
}

fn ev(row: &StoredMessage) -> CanonicalEvent {
    row.canonical_event()
        .unwrap_or_else(|| panic!("not an event row: {row:?}"))
}

fn is_terminal(row: &StoredMessage) -> bool {
    row.canonical_event().map(|e| e.is_terminal()).unwrap_or(false)
}

/// Collect rows until a terminal status for `request_id` arrives.
async fn collect_run(
    rx: &mut broadcast::Receiver<StoredMessage>,
    request_id: &str,
) -> Vec<StoredMessage> {
    let mut rows = Vec::new();
    loop {
        let row = next_row(rx).await;
        let done = row.request_id == request_id && is_terminal(&row);
        rows.push(row);
        if done {
            return rows;
        }
    }
}

fn s1_script() -> Vec<MockStep> {
    vec![
        MockStep::Event(CanonicalEvent::SessionInfo {
            native_session_id: "sess-A".into(),
        }),
        MockStep::Event(CanonicalEvent::AssistantText {
            text: "Creating page.".into(),
            is_final: false,
        }),
        MockStep::Event(CanonicalEvent::ToolCall {
            call_id: "t1".into(),
            tool: "write_file".into(),
            arguments: serde_json::json!({"path": "app/page.tsx"}),
        }),
        MockStep::Event(CanonicalEvent::ToolResult {
            call_id: "t1".into(),
            ok: true,
            output: Some("written".into()),
            error: None,
        }),
        MockStep::Event(CanonicalEvent::AssistantText {
            text: "Done.".into(),
            is_final: true,
        }),
        MockStep::Event(CanonicalEvent::status(Phase::Complete)),
    ]
}

// ── S1: happy path ────────────────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_persists_events_and_commits_session() {
    let mock = Arc::new(MockAdapter::new(AgentKind::Claude));
    mock.push_script(s1_script());
    let world = build_world(vec![mock], CoreConfig::default());

    let mut rx = world.handle.subscribe();
    let id = world
        .handle
        .submit(submit(AgentKind::Claude, Some("claude-sonnet-4.5")))
        .await
        .unwrap();

    let rows = collect_run(&mut rx, &id).await;
    // instruction row + start + 6 scripted events, all with the request id.
    assert_eq!(rows.len(), 8);
    assert!(rows.iter().all(|r| r.request_id == id));
    assert_eq!(rows[0].kind, "instruction");
    assert_eq!(
        ev(&rows[1]),
        CanonicalEvent::status(Phase::Start {
            agent: AgentKind::Claude
        })
    );
    assert_eq!(ev(&rows[7]), CanonicalEvent::status(Phase::Complete));

    // seq strictly increasing on the wire...
    let seqs: Vec<u64> = rows.iter().map(|r| r.seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]), "seqs not increasing: {seqs:?}");

    // ...and the persisted transcript matches what was broadcast.
    let stored = world.store.since_seq(world.project, 0).await.unwrap();
    assert_eq!(stored, rows);

    let session = world.sessions.get(world.project, AgentKind::Claude);
    assert_eq!(session.native_session_id.as_deref(), Some("sess-A"));
    assert_eq!(session.last_model.as_deref(), Some("claude-sonnet-4.5"));
}

// ── Round-trip: projection rebuilds live session state ────────────────────────

#[tokio::test]
async fn replaying_transcript_reconstructs_session_state() {
    let mock = Arc::new(MockAdapter::new(AgentKind::Claude));
    mock.push_script(s1_script());
    let world = build_world(vec![mock], CoreConfig::default());

    let mut rx = world.handle.subscribe();
    let id = world
        .handle
        .submit(submit(AgentKind::Claude, Some("claude-sonnet-4.5")))
        .await
        .unwrap();
    collect_run(&mut rx, &id).await;

    let rows = world.store.since_seq(world.project, 0).await.unwrap();
    let projected = project_sessions(&rows);
    let live = world.sessions.get(world.project, AgentKind::Claude);
    assert_eq!(projected[&AgentKind::Claude], live);
}

// ── S2: cancellation mid-tool-call ────────────────────────────────────────────

#[tokio::test]
async fn cancel_synthesizes_interrupted_tool_result() {
    let mock = Arc::new(MockAdapter::new(AgentKind::Claude));
    mock.push_script(vec![
        MockStep::Event(CanonicalEvent::SessionInfo {
            native_session_id: "sess-A".into(),
        }),
        MockStep::Event(CanonicalEvent::ToolCall {
            call_id: "t1".into(),
            tool: "write_file".into(),
            arguments: serde_json::json!({}),
        }),
        MockStep::AwaitCancel,
    ]);
    let world = build_world(vec![mock], CoreConfig::default());

    let mut rx = world.handle.subscribe();
    let id = world.handle.submit(submit(AgentKind::Claude, None)).await.unwrap();

    // Wait until the tool call is on the wire, then cancel.
    loop {
        let row = next_row(&mut rx).await;
        if matches!(row.canonical_event(), Some(CanonicalEvent::ToolCall { .. })) {
            break;
        }
    }
    assert_eq!(
        world.handle.cancel(&id).await.unwrap(),
        CancelOutcome::Cancelled
    );

    let trailing = collect_run(&mut rx, &id).await;
    let n = trailing.len();
    assert!(n >= 2, "expected synthesized result + terminal, got {trailing:?}");
    assert_eq!(
        ev(&trailing[n - 2]),
        CanonicalEvent::ToolResult {
            call_id: "t1".into(),
            ok: false,
            output: None,
            error: Some("interrupted".into()),
        }
    );
    assert_eq!(ev(&trailing[n - 1]), CanonicalEvent::status(Phase::Cancelled));

    // Partial runs never advance the session.
    assert_eq!(
        world.sessions.get(world.project, AgentKind::Claude),
        Session::default()
    );
}

// ── Persistence failure mid-run ───────────────────────────────────────────────

/// Message Store that rejects appends of one row kind; everything else
/// passes through.  Simulates a transactional write failure mid-run.
struct FlakyStore {
    inner: MemoryMessageStore,
    fail_kind: &'static str,
}

#[async_trait::async_trait]
impl MessageStore for FlakyStore {
    async fn append(&self, row: StoredMessage) -> Result<(), kiln_store::StoreError> {
        if row.kind == self.fail_kind {
            return Err(kiln_store::StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "simulated write failure",
            )));
        }
        self.inner.append(row).await
    }

    async fn since_seq(
        &self,
        project: ProjectId,
        after_seq: u64,
    ) -> Result<Vec<StoredMessage>, kiln_store::StoreError> {
        self.inner.since_seq(project, after_seq).await
    }

    async fn tail(
        &self,
        project: ProjectId,
        n: usize,
    ) -> Result<Vec<StoredMessage>, kiln_store::StoreError> {
        self.inner.tail(project, n).await
    }

    async fn max_seq(&self, project: ProjectId) -> Result<u64, kiln_store::StoreError> {
        self.inner.max_seq(project).await
    }
}

#[tokio::test]
async fn persistence_failure_still_pairs_open_tool_calls() {
    // The store accepts the tool call but rejects the following assistant
    // text, so the run aborts as internal while `t1` is still unmatched.
    let mock = Arc::new(MockAdapter::new(AgentKind::Claude));
    mock.push_script(vec![
        MockStep::Event(CanonicalEvent::ToolCall {
            call_id: "t1".into(),
            tool: "write_file".into(),
            arguments: serde_json::json!({}),
        }),
        MockStep::Event(CanonicalEvent::AssistantText {
            text: "partial".into(),
            is_final: false,
        }),
        MockStep::AwaitCancel,
    ]);
    let workspace = tempfile::tempdir().unwrap();
    let project_id = ProjectId::new_v4();
    let sessions = Arc::new(SessionStore::new());
    let handle = Orchestrator::spawn(
        Project {
            id: project_id,
            workspace: workspace.path().to_path_buf(),
            preferred_agent: AgentKind::Claude,
            preferred_model: None,
        },
        Arc::new(AdapterRegistry::with_adapters(
            vec![mock as Arc<dyn kiln_agents::Adapter>],
            Duration::from_secs(60),
        )),
        Arc::new(FlakyStore {
            inner: MemoryMessageStore::new(),
            fail_kind: "assistant_text",
        }),
        sessions.clone(),
        Arc::new(SystemPromptLoader::new(None)),
        CoreConfig::default(),
        None,
    );

    let mut rx = handle.subscribe();
    let id = handle.submit(submit(AgentKind::Claude, None)).await.unwrap();
    let rows = collect_run(&mut rx, &id).await;
    let n = rows.len();

    // The open tool call is paired before the internal failure terminates
    // the run; the rejected assistant text never reaches subscribers.
    assert_eq!(
        ev(&rows[n - 3]),
        CanonicalEvent::ToolResult {
            call_id: "t1".into(),
            ok: false,
            output: None,
            error: Some("interrupted".into()),
        }
    );
    assert!(matches!(
        ev(&rows[n - 2]),
        CanonicalEvent::Error { kind: ErrorKind::Internal, .. }
    ));
    assert_eq!(
        ev(&rows[n - 1]),
        CanonicalEvent::status(Phase::Failed {
            kind: ErrorKind::Internal
        })
    );
    assert!(rows.iter().all(|r| r.kind != "assistant_text"));
    assert_eq!(sessions.get(project_id, AgentKind::Claude), Session::default());
}

// ── S3: fallback to claude ────────────────────────────────────────────────────

#[tokio::test]
async fn missing_binary_falls_back_to_claude_once() {
    let qwen = Arc::new(MockAdapter::uninstalled(AgentKind::Qwen));
    let claude = Arc::new(MockAdapter::new(AgentKind::Claude));
    claude.push_script(s1_script());
    let world = build_world(vec![qwen, claude.clone()], CoreConfig::default());

    let mut rx = world.handle.subscribe();
    let id = world.handle.submit(submit(AgentKind::Qwen, None)).await.unwrap();

    // Original request: instruction, start, cli_not_installed error, failed.
    let original = collect_run(&mut rx, &id).await;
    assert_eq!(original.len(), 4);
    assert_eq!(
        ev(&original[1]),
        CanonicalEvent::status(Phase::Start {
            agent: AgentKind::Qwen
        })
    );
    assert!(matches!(
        ev(&original[2]),
        CanonicalEvent::Error { kind: ErrorKind::CliNotInstalled, .. }
    ));
    assert_eq!(
        ev(&original[3]),
        CanonicalEvent::status(Phase::Failed {
            kind: ErrorKind::CliNotInstalled
        })
    );

    // Fallback banner precedes the retried run's start, under a fresh id.
    let banner = next_row(&mut rx).await;
    assert_ne!(banner.request_id, id);
    assert_eq!(
        ev(&banner),
        CanonicalEvent::status(Phase::Fellback {
            from: AgentKind::Qwen,
            to: AgentKind::Claude
        })
    );
    let retry = collect_run(&mut rx, &banner.request_id).await;
    assert_eq!(
        ev(&retry[0]),
        CanonicalEvent::status(Phase::Start {
            agent: AgentKind::Claude
        })
    );
    assert_eq!(
        ev(retry.last().unwrap()),
        CanonicalEvent::status(Phase::Complete)
    );
    assert_eq!(claude.seen().len(), 1);

    // Exactly one terminal per request id.
    let rows = world.store.since_seq(world.project, 0).await.unwrap();
    for rid in [&id, &banner.request_id] {
        let terminals = rows
            .iter()
            .filter(|r| &r.request_id == rid)
            .filter(|r| is_terminal(r))
            .count();
        assert_eq!(terminals, 1, "request {rid} must have exactly one terminal");
    }
}

#[tokio::test]
async fn fallback_agent_missing_too_fails_without_spawning() {
    let qwen = Arc::new(MockAdapter::uninstalled(AgentKind::Qwen));
    let claude = Arc::new(MockAdapter::uninstalled(AgentKind::Claude));
    let world = build_world(vec![qwen.clone(), claude.clone()], CoreConfig::default());

    let mut rx = world.handle.subscribe();
    let id = world.handle.submit(submit(AgentKind::Qwen, None)).await.unwrap();

    let original = collect_run(&mut rx, &id).await;
    assert_eq!(
        ev(original.last().unwrap()),
        CanonicalEvent::status(Phase::Failed {
            kind: ErrorKind::CliNotInstalled
        })
    );
    // The fallback run fails the same way and does not fall back again.
    let banner = next_row(&mut rx).await;
    let retry = collect_run(&mut rx, &banner.request_id).await;
    assert_eq!(
        ev(retry.last().unwrap()),
        CanonicalEvent::status(Phase::Failed {
            kind: ErrorKind::CliNotInstalled
        })
    );
    assert!(
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .is_err(),
        "no second fallback may be scheduled"
    );
    // No subprocess ran anywhere.
    assert!(qwen.seen().is_empty());
    assert!(claude.seen().is_empty());
}

#[tokio::test]
async fn uninstalled_fallback_agent_itself_does_not_fall_back() {
    let claude = Arc::new(MockAdapter::uninstalled(AgentKind::Claude));
    let world = build_world(vec![claude], CoreConfig::default());

    let mut rx = world.handle.subscribe();
    let id = world.handle.submit(submit(AgentKind::Claude, None)).await.unwrap();
    let rows = collect_run(&mut rx, &id).await;
    assert_eq!(
        ev(rows.last().unwrap()),
        CanonicalEvent::status(Phase::Failed {
            kind: ErrorKind::CliNotInstalled
        })
    );
    assert!(
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .is_err(),
        "the fallback agent never retries onto itself"
    );
}

// ── S4: stall timeout ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn stalled_run_times_out_and_fails() {
    let mock = Arc::new(MockAdapter::new(AgentKind::Claude));
    mock.push_script(vec![MockStep::Delay(Duration::from_secs(3600))]);
    let config = CoreConfig {
        default_stall_seconds: 2,
        ..CoreConfig::default()
    };
    let world = build_world(vec![mock], config);

    let mut rx = world.handle.subscribe();
    let id = world.handle.submit(submit(AgentKind::Claude, None)).await.unwrap();

    let rows = collect_run(&mut rx, &id).await;
    let n = rows.len();
    assert!(matches!(
        ev(&rows[n - 2]),
        CanonicalEvent::Error { kind: ErrorKind::Timeout, .. }
    ));
    assert_eq!(
        ev(&rows[n - 1]),
        CanonicalEvent::status(Phase::Failed {
            kind: ErrorKind::Timeout
        })
    );
    // Timeouts never fall back: nothing further arrives for this project.
    assert!(
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err()
    );
}

// ── S5: stale session retried once without resume ─────────────────────────────

#[tokio::test]
async fn stale_session_retries_once_without_resume() {
    let mock = Arc::new(MockAdapter::new(AgentKind::Claude));
    mock.push_script(vec![
        MockStep::Event(CanonicalEvent::error(
            ErrorKind::SessionStale,
            "session sess-old rejected",
        )),
        MockStep::Event(CanonicalEvent::status(Phase::Failed {
            kind: ErrorKind::SessionStale,
        })),
    ]);
    // Second attempt succeeds with the default script.
    let world = build_world(vec![mock.clone()], CoreConfig::default());
    world.sessions.set(
        world.project,
        AgentKind::Claude,
        Session {
            native_session_id: Some("sess-old".into()),
            last_model: None,
            seq: 0,
        },
    );

    let mut rx = world.handle.subscribe();
    let id = world.handle.submit(submit(AgentKind::Claude, None)).await.unwrap();
    let rows = collect_run(&mut rx, &id).await;

    // One start, the stale error, then the successful second attempt.
    let starts = rows
        .iter()
        .filter_map(|r| r.canonical_event())
        .filter(|e| matches!(e, CanonicalEvent::Status { phase: Phase::Start { .. } }))
        .count();
    assert_eq!(starts, 1);
    assert!(rows
        .iter()
        .filter_map(|r| r.canonical_event())
        .any(|e| matches!(e, CanonicalEvent::Error { kind: ErrorKind::SessionStale, .. })));
    assert_eq!(
        ev(rows.last().unwrap()),
        CanonicalEvent::status(Phase::Complete)
    );

    let seen = mock.seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].prior_session_id.as_deref(), Some("sess-old"));
    assert_eq!(seen[1].prior_session_id, None);

    // The successful retry commits the new session id.
    assert_eq!(
        world
            .sessions
            .get(world.project, AgentKind::Claude)
            .native_session_id
            .as_deref(),
        Some("mock-session")
    );
}

// ── Queue serialization ───────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_submits_run_one_at_a_time_in_order() {
    let mock = Arc::new(MockAdapter::new(AgentKind::Claude));
    mock.push_script(vec![
        MockStep::Event(CanonicalEvent::AssistantText {
            text: "first".into(),
            is_final: true,
        }),
        MockStep::Delay(Duration::from_millis(50)),
        MockStep::Event(CanonicalEvent::status(Phase::Complete)),
    ]);
    mock.push_script(vec![
        MockStep::Event(CanonicalEvent::AssistantText {
            text: "second".into(),
            is_final: true,
        }),
        MockStep::Event(CanonicalEvent::status(Phase::Complete)),
    ]);
    let world = build_world(vec![mock], CoreConfig::default());

    let mut rx = world.handle.subscribe();
    let a = world.handle.submit(submit(AgentKind::Claude, None)).await.unwrap();
    let b = world.handle.submit(submit(AgentKind::Claude, None)).await.unwrap();
    assert_ne!(a, b);

    let first = collect_run(&mut rx, &a).await;
    let second = collect_run(&mut rx, &b).await;
    // The second run's start comes only after the first run's terminal.
    assert_eq!(
        ev(&second[0]),
        CanonicalEvent::status(Phase::Start {
            agent: AgentKind::Claude
        })
    );
    assert!(first.last().unwrap().seq < second[0].seq);
}

// ── Cancelling a queued request ───────────────────────────────────────────────

#[tokio::test]
async fn cancel_of_queued_request_discards_it() {
    let mock = Arc::new(MockAdapter::new(AgentKind::Claude));
    mock.push_script(vec![MockStep::AwaitCancel]);
    let world = build_world(vec![mock.clone()], CoreConfig::default());

    let mut rx = world.handle.subscribe();
    let running = world.handle.submit(submit(AgentKind::Claude, None)).await.unwrap();
    let queued = world.handle.submit(submit(AgentKind::Claude, None)).await.unwrap();

    // Cancel the queued one first: it must terminate without ever starting.
    assert_eq!(
        world.handle.cancel(&queued).await.unwrap(),
        CancelOutcome::Cancelled
    );
    let rows = collect_run(&mut rx, &queued).await;
    assert_eq!(ev(rows.last().unwrap()), CanonicalEvent::status(Phase::Cancelled));
    let queued_starts = rows
        .iter()
        .filter(|r| r.request_id == queued)
        .filter_map(|r| r.canonical_event())
        .filter(|e| matches!(e, CanonicalEvent::Status { phase: Phase::Start { .. } }))
        .count();
    assert_eq!(queued_starts, 0, "a discarded request must never start");

    // Then the running one.
    assert_eq!(
        world.handle.cancel(&running).await.unwrap(),
        CancelOutcome::Cancelled
    );
    collect_run(&mut rx, &running).await;
    // Only one run ever reached the adapter.
    assert_eq!(mock.seen().len(), 1);
}

#[tokio::test]
async fn cancel_unknown_request_reports_not_found() {
    let mock = Arc::new(MockAdapter::new(AgentKind::Claude));
    let world = build_world(vec![mock], CoreConfig::default());
    assert_eq!(
        world.handle.cancel("999-zzzz").await.unwrap(),
        CancelOutcome::NotFound
    );
}

// ── Idle teardown ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn idle_orchestrator_retires_after_linger() {
    let mock = Arc::new(MockAdapter::new(AgentKind::Claude));
    let config = CoreConfig {
        idle_orchestrator_linger_seconds: 0,
        ..CoreConfig::default()
    };
    let world = build_world(vec![mock], config);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(world.handle.is_closed());
}

#[tokio::test]
async fn orchestrator_stays_alive_while_subscribed() {
    let mock = Arc::new(MockAdapter::new(AgentKind::Claude));
    let config = CoreConfig {
        idle_orchestrator_linger_seconds: 0,
        ..CoreConfig::default()
    };
    let world = build_world(vec![mock], config);
    let _rx = world.handle.subscribe();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!world.handle.is_closed());
}

// ── Model fallback to session's last model ────────────────────────────────────

#[tokio::test]
async fn omitted_model_uses_sessions_last_model() {
    let mock = Arc::new(MockAdapter::new(AgentKind::Claude));
    let world = build_world(vec![mock.clone()], CoreConfig::default());
    world.sessions.set(
        world.project,
        AgentKind::Claude,
        Session {
            native_session_id: None,
            last_model: Some("claude-opus-4.1".into()),
            seq: 0,
        },
    );

    let mut rx = world.handle.subscribe();
    let id = world.handle.submit(submit(AgentKind::Claude, None)).await.unwrap();
    collect_run(&mut rx, &id).await;

    let seen = mock.seen();
    assert_eq!(seen[0].model.as_deref(), Some("claude-opus-4.1"));
}
