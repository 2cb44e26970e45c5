// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use kiln_protocol::{AgentKind, ProjectId};

use crate::StoreError;

/// A project as the core sees it: read-only metadata owned by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    /// Absolute, writable workspace directory.  The core passes this path to
    /// the adapter subprocess and otherwise does not touch it.
    pub workspace: PathBuf,
    pub preferred_agent: AgentKind,
    #[serde(default)]
    pub preferred_model: Option<String>,
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn get(&self, id: ProjectId) -> Result<Option<Project>, StoreError>;
}

/// In-memory project table; populated from a YAML manifest at startup or
/// programmatically in tests.
#[derive(Default)]
pub struct MemoryProjectStore {
    projects: DashMap<ProjectId, Project>,
}

impl MemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, project: Project) {
        self.projects.insert(project.id, project);
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }

    /// Load a `projects.yaml` manifest: a list of [`Project`] entries.
    pub fn load_manifest(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading project manifest {}", path.display()))?;
        let projects: Vec<Project> = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing project manifest {}", path.display()))?;
        let store = Self::new();
        for p in projects {
            store.insert(p);
        }
        Ok(store)
    }
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn get(&self, id: ProjectId) -> Result<Option<Project>, StoreError> {
        Ok(self.projects.get(&id).map(|p| p.clone()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn project(id: ProjectId) -> Project {
        Project {
            id,
            workspace: PathBuf::from("/tmp/ws"),
            preferred_agent: AgentKind::Claude,
            preferred_model: None,
        }
    }

    #[tokio::test]
    async fn get_returns_inserted_project() {
        let store = MemoryProjectStore::new();
        let id = ProjectId::new_v4();
        store.insert(project(id));
        let got = store.get(id).await.unwrap().unwrap();
        assert_eq!(got.id, id);
        assert_eq!(got.preferred_agent, AgentKind::Claude);
    }

    #[tokio::test]
    async fn get_unknown_project_returns_none() {
        let store = MemoryProjectStore::new();
        assert!(store.get(ProjectId::new_v4()).await.unwrap().is_none());
    }

    #[test]
    fn manifest_round_trip() {
        use std::io::Write;
        let id = ProjectId::new_v4();
        let yaml = format!(
            "- id: {id}\n  workspace: /srv/projects/demo\n  preferred_agent: gemini\n  preferred_model: gemini-2.5-pro\n"
        );
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        let store = MemoryProjectStore::load_manifest(f.path()).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn manifest_with_bad_yaml_errors() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"not: [valid").unwrap();
        assert!(MemoryProjectStore::load_manifest(f.path()).is_err());
    }
}
