// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per (project, agent) conversation state.
//!
//! A [`Session`] carries what the next run needs to resume the CLI's
//! conversation context: the native session id, the last model used, and the
//! sequence counter mirror.  State is derived entirely from the persisted
//! transcript — [`project_sessions`] is the pure fold used both for lazy
//! hydration and by the round-trip tests.

use std::collections::HashMap;

use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};

use kiln_protocol::{AgentKind, CanonicalEvent, Phase, ProjectId, StoredMessage};

/// Resumable conversation state for one (project, agent) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Opaque id the CLI supplied; replayed on the next run to resume.
    /// Advances only after a run that completed with at least one assistant
    /// event — partial runs never move it.
    pub native_session_id: Option<String>,
    /// Canonical name of the last model used, consulted when a submit omits
    /// the model.
    pub last_model: Option<String>,
    /// Project sequence counter at the last committed run.
    pub seq: u64,
}

// ── Projection ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct RunFold {
    agent: Option<AgentKind>,
    model: Option<String>,
    pending_session: Option<String>,
    saw_assistant: bool,
}

/// Rebuild all sessions of a project by folding its persisted transcript.
///
/// Replaying the full event stream through this function reconstructs the
/// exact session state the live orchestrator arrived at.
pub fn project_sessions(rows: &[StoredMessage]) -> HashMap<AgentKind, Session> {
    let mut sessions: HashMap<AgentKind, Session> = HashMap::new();
    let mut runs: HashMap<String, RunFold> = HashMap::new();

    for row in rows {
        if row.kind == "instruction" {
            let fold = runs.entry(row.request_id.clone()).or_default();
            fold.agent = row
                .body
                .get("agent")
                .and_then(|v| serde_json::from_value(v.clone()).ok());
            fold.model = row
                .body
                .get("model")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            continue;
        }
        let Some(event) = row.canonical_event() else {
            continue;
        };
        let fold = runs.entry(row.request_id.clone()).or_default();
        match event {
            CanonicalEvent::Status {
                phase: Phase::Start { agent },
            } => fold.agent = Some(agent),
            CanonicalEvent::SessionInfo { native_session_id } => {
                fold.pending_session = Some(native_session_id)
            }
            CanonicalEvent::AssistantText { .. } => fold.saw_assistant = true,
            CanonicalEvent::Status {
                phase: Phase::Complete,
            } => {
                let Some(agent) = fold.agent else { continue };
                let session = sessions.entry(agent).or_default();
                if fold.saw_assistant {
                    if let Some(id) = fold.pending_session.take() {
                        session.native_session_id = Some(id);
                    }
                }
                if let Some(model) = fold.model.clone() {
                    session.last_model = Some(model);
                }
                session.seq = row.seq;
            }
            _ => {}
        }
    }
    sessions
}

// ── Store ─────────────────────────────────────────────────────────────────────

/// Process-wide session table.
///
/// Each key is mutated only by the owning project's orchestrator task;
/// readers take copies, never references.
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<(ProjectId, AgentKind), Session>,
    hydrated: DashSet<ProjectId>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy-on-read lookup; an absent entry reads as the default session.
    pub fn get(&self, project: ProjectId, agent: AgentKind) -> Session {
        self.sessions
            .get(&(project, agent))
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn set(&self, project: ProjectId, agent: AgentKind, session: Session) {
        self.sessions.insert((project, agent), session);
    }

    /// Consistent copy of all sessions (for the availability UI).
    pub fn snapshot(&self) -> HashMap<(ProjectId, AgentKind), Session> {
        self.sessions
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    pub fn is_hydrated(&self, project: ProjectId) -> bool {
        self.hydrated.contains(&project)
    }

    /// Populate a project's sessions from its persisted transcript.  A no-op
    /// when the project was already hydrated.
    pub fn hydrate(&self, project: ProjectId, rows: &[StoredMessage]) {
        if !self.hydrated.insert(project) {
            return;
        }
        for (agent, session) in project_sessions(rows) {
            self.sessions.insert((project, agent), session);
        }
    }

    /// Remove all sessions of a deleted project.
    pub fn remove_project(&self, project: ProjectId) {
        self.sessions.retain(|(p, _), _| *p != project);
        self.hydrated.remove(&project);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
