// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Project → orchestrator map.
//!
//! Orchestrators are created on demand (first subscriber or first submit)
//! and retire themselves after the idle linger; the supervisor's reaper
//! task drops retired handles so the next caller gets a fresh one.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use kiln_agents::AdapterRegistry;
use kiln_config::CoreConfig;
use kiln_protocol::ProjectId;
use kiln_store::{MessageStore, ProjectStore, SystemPromptLoader};

use crate::orchestrator::{Orchestrator, OrchestratorHandle};
use crate::session::SessionStore;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("unknown project: {0}")]
    UnknownProject(ProjectId),
    #[error("project store: {0}")]
    Store(#[from] kiln_store::StoreError),
}

pub struct Supervisor {
    projects: Arc<dyn ProjectStore>,
    registry: Arc<AdapterRegistry>,
    store: Arc<dyn MessageStore>,
    sessions: Arc<SessionStore>,
    prompts: Arc<SystemPromptLoader>,
    config: CoreConfig,
    handles: Arc<DashMap<ProjectId, OrchestratorHandle>>,
    retired_tx: mpsc::Sender<ProjectId>,
}

impl Supervisor {
    pub fn new(
        projects: Arc<dyn ProjectStore>,
        registry: Arc<AdapterRegistry>,
        store: Arc<dyn MessageStore>,
        sessions: Arc<SessionStore>,
        prompts: Arc<SystemPromptLoader>,
        config: CoreConfig,
    ) -> Self {
        let handles: Arc<DashMap<ProjectId, OrchestratorHandle>> = Arc::new(DashMap::new());
        let (retired_tx, mut retired_rx) = mpsc::channel::<ProjectId>(64);

        // Reaper: drop map entries for orchestrators that wound down.  A
        // fresh handle may have replaced the retired one in the meantime;
        // only closed handles are removed.
        let reap_handles = handles.clone();
        tokio::spawn(async move {
            while let Some(project) = retired_rx.recv().await {
                let closed = reap_handles
                    .get(&project)
                    .map(|h| h.is_closed())
                    .unwrap_or(false);
                if closed {
                    reap_handles.remove(&project);
                    debug!(%project, "orchestrator reaped");
                }
            }
        });

        Self {
            projects,
            registry,
            store,
            sessions,
            prompts,
            config,
            handles,
            retired_tx,
        }
    }

    /// Locate or create the orchestrator for a project.
    pub async fn orchestrator(
        &self,
        project_id: ProjectId,
    ) -> Result<OrchestratorHandle, SupervisorError> {
        if let Some(handle) = self.handles.get(&project_id) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
        }

        let project = self
            .projects
            .get(project_id)
            .await?
            .ok_or(SupervisorError::UnknownProject(project_id))?;

        // The entry lock makes concurrent create calls converge on one task.
        let entry = self
            .handles
            .entry(project_id)
            .and_modify(|handle| {
                if handle.is_closed() {
                    *handle = Orchestrator::spawn(
                        project.clone(),
                        self.registry.clone(),
                        self.store.clone(),
                        self.sessions.clone(),
                        self.prompts.clone(),
                        self.config.clone(),
                        Some(self.retired_tx.clone()),
                    );
                }
            })
            .or_insert_with(|| {
                Orchestrator::spawn(
                    project.clone(),
                    self.registry.clone(),
                    self.store.clone(),
                    self.sessions.clone(),
                    self.prompts.clone(),
                    self.config.clone(),
                    Some(self.retired_tx.clone()),
                )
            });
        Ok(entry.clone())
    }

    /// Active (non-retired) orchestrator count.
    pub fn active_count(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_closed()).count()
    }

    /// Shut down every orchestrator (process exit).
    pub async fn shutdown_all(&self) {
        for entry in self.handles.iter() {
            entry.value().shutdown().await;
        }
    }
}
