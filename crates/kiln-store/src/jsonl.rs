// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! JSONL Message Store backend.
//!
//! One append-only file per project under the data directory, named
//! `<project-id>.jsonl`; each line is one serialized [`StoredMessage`].
//! Corrupt lines (torn writes, manual edits) are skipped with a warning on
//! read — the transcript must survive a bad row.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::warn;

use kiln_protocol::{ProjectId, StoredMessage};

use crate::{MessageStore, StoreError};

pub struct JsonlMessageStore {
    dir: PathBuf,
}

impl JsonlMessageStore {
    /// Open (creating the directory if needed).
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, project: ProjectId) -> PathBuf {
        self.dir.join(format!("{project}.jsonl"))
    }

    fn read_all(&self, project: ProjectId) -> Result<Vec<StoredMessage>, StoreError> {
        let path = self.path_for(project);
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&path)?;
        Ok(parse_lines(&text, &path))
    }
}

fn parse_lines(text: &str, path: &Path) -> Vec<StoredMessage> {
    let mut rows = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<StoredMessage>(line) {
            Ok(row) => rows.push(row),
            Err(e) => {
                warn!(path = %path.display(), line = lineno + 1, "skipping corrupt transcript row: {e}");
            }
        }
    }
    rows
}

#[async_trait]
impl MessageStore for JsonlMessageStore {
    async fn append(&self, row: StoredMessage) -> Result<(), StoreError> {
        let line = serde_json::to_string(&row)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(row.project_id))?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    async fn since_seq(
        &self,
        project: ProjectId,
        after_seq: u64,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let mut rows = self.read_all(project)?;
        rows.retain(|r| r.seq > after_seq);
        Ok(rows)
    }

    async fn tail(&self, project: ProjectId, n: usize) -> Result<Vec<StoredMessage>, StoreError> {
        let rows = self.read_all(project)?;
        let start = rows.len().saturating_sub(n);
        Ok(rows[start..].to_vec())
    }

    async fn max_seq(&self, project: ProjectId) -> Result<u64, StoreError> {
        Ok(self
            .read_all(project)?
            .last()
            .map(|r| r.seq)
            .unwrap_or(0))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
