// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use tracing::info;

use kiln_agents::AdapterRegistry;
use kiln_config::Config;
use kiln_core::Supervisor;
use kiln_store::{MessageStore, ProjectStore};

/// Shared state for every gateway handler.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub projects: Arc<dyn ProjectStore>,
    pub store: Arc<dyn MessageStore>,
    pub registry: Arc<AdapterRegistry>,
    pub config: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/api/agents", get(agents))
        .route("/ws/:project_id", get(crate::ws::ws_handler))
        .with_state(state)
}

/// Availability snapshot for the status grid.  Probes are cached inside the
/// registry, so polling this endpoint is cheap.
async fn agents(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.registry.availability_snapshot().await;
    let mut map = serde_json::Map::new();
    for (kind, availability) in snapshot {
        map.insert(
            kind.to_string(),
            serde_json::to_value(&availability).unwrap_or(serde_json::Value::Null),
        );
    }
    Json(serde_json::Value::Object(map))
}

/// Bind and run the gateway until the process is stopped.
pub async fn serve(state: AppState, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(%bind, "gateway listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
