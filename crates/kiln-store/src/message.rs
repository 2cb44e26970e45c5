// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The append-only Message Store boundary.
//!
//! The core only ever appends; rows are never mutated and are removed only
//! with the owning project.  Ordering is by `seq`, which the orchestrator
//! assigns before calling [`MessageStore::append`].

use async_trait::async_trait;
use dashmap::DashMap;

use kiln_protocol::{ProjectId, StoredMessage};

use crate::StoreError;

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append one row.  Rows arrive in strictly increasing `seq` order per
    /// project (single-writer orchestrator).
    async fn append(&self, row: StoredMessage) -> Result<(), StoreError>;

    /// All rows with `seq > after_seq`, in seq order.  `after_seq = 0`
    /// returns the full transcript.
    async fn since_seq(
        &self,
        project: ProjectId,
        after_seq: u64,
    ) -> Result<Vec<StoredMessage>, StoreError>;

    /// The most recent `n` rows, in seq order.
    async fn tail(&self, project: ProjectId, n: usize) -> Result<Vec<StoredMessage>, StoreError>;

    /// Highest persisted `seq` for the project (0 when empty).
    async fn max_seq(&self, project: ProjectId) -> Result<u64, StoreError>;
}

/// In-memory Message Store for tests and ephemeral deploys.
#[derive(Default)]
pub struct MemoryMessageStore {
    rows: DashMap<ProjectId, Vec<StoredMessage>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(&self, row: StoredMessage) -> Result<(), StoreError> {
        self.rows.entry(row.project_id).or_default().push(row);
        Ok(())
    }

    async fn since_seq(
        &self,
        project: ProjectId,
        after_seq: u64,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self
            .rows
            .get(&project)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.seq > after_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn tail(&self, project: ProjectId, n: usize) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self
            .rows
            .get(&project)
            .map(|rows| {
                let start = rows.len().saturating_sub(n);
                rows[start..].to_vec()
            })
            .unwrap_or_default())
    }

    async fn max_seq(&self, project: ProjectId) -> Result<u64, StoreError> {
        Ok(self
            .rows
            .get(&project)
            .and_then(|rows| rows.last().map(|r| r.seq))
            .unwrap_or(0))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
