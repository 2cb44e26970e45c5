// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Adapter registry.
//!
//! A process-wide immutable table, populated once at startup with one
//! adapter per [`AgentKind`].  Availability probes fork a subprocess, so the
//! registry caches results for a short interval — the homepage status grid
//! polls this and must not cause a fork storm.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::join_all;

use kiln_protocol::AgentKind;

use crate::adapter::{Adapter, Availability};
use crate::{claude::ClaudeAdapter, codex::CodexAdapter, cursor::CursorAdapter,
    gemini::GeminiAdapter, models, qwen::QwenAdapter};

struct CachedProbe {
    at: Instant,
    availability: Availability,
}

pub struct AdapterRegistry {
    adapters: HashMap<AgentKind, Arc<dyn Adapter>>,
    cache: DashMap<AgentKind, CachedProbe>,
    cache_ttl: Duration,
}

impl AdapterRegistry {
    /// The production registry: one adapter per supported agent.
    pub fn standard(cache_ttl: Duration) -> Self {
        Self::with_adapters(
            vec![
                Arc::new(ClaudeAdapter),
                Arc::new(CursorAdapter),
                Arc::new(CodexAdapter),
                Arc::new(GeminiAdapter),
                Arc::new(QwenAdapter),
            ],
            cache_ttl,
        )
    }

    /// Registry over an explicit adapter set (tests use mocks here).
    pub fn with_adapters(adapters: Vec<Arc<dyn Adapter>>, cache_ttl: Duration) -> Self {
        Self {
            adapters: adapters.into_iter().map(|a| (a.kind(), a)).collect(),
            cache: DashMap::new(),
            cache_ttl,
        }
    }

    pub fn get(&self, kind: AgentKind) -> Option<Arc<dyn Adapter>> {
        self.adapters.get(&kind).cloned()
    }

    /// Registered kinds in declaration order of [`AgentKind::ALL`].
    pub fn list(&self) -> Vec<AgentKind> {
        AgentKind::ALL
            .into_iter()
            .filter(|kind| self.adapters.contains_key(kind))
            .collect()
    }

    /// Cached availability probe for one agent.
    pub async fn availability(&self, kind: AgentKind) -> Availability {
        if let Some(cached) = self.cache.get(&kind) {
            if cached.at.elapsed() < self.cache_ttl {
                return cached.availability.clone();
            }
        }
        let availability = match self.get(kind) {
            Some(adapter) => adapter.available().await,
            None => Availability::missing(format!("no adapter registered for {kind}")),
        };
        self.cache.insert(
            kind,
            CachedProbe {
                at: Instant::now(),
                availability: availability.clone(),
            },
        );
        availability
    }

    /// Probe every registered agent concurrently, sharing the cache.
    pub async fn availability_snapshot(&self) -> HashMap<AgentKind, Availability> {
        let probes = self
            .list()
            .into_iter()
            .map(|kind| async move { (kind, self.availability(kind).await) });
        join_all(probes).await.into_iter().collect()
    }

    /// Native model flag for a canonical name (None when unmapped).
    pub fn resolve_model(&self, kind: AgentKind, canonical: &str) -> Option<&'static str> {
        models::resolve(kind, canonical)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
