// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use kiln_agents::AdapterRegistry;
use kiln_core::{SessionStore, Supervisor};
use kiln_gateway::AppState;
use kiln_store::{
    JsonlMessageStore, MemoryMessageStore, MemoryProjectStore, MessageStore, SystemPromptLoader,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match &cli.command {
        Commands::Serve {
            bind,
            data_dir,
            projects_file,
            prompts_dir,
        } => {
            let mut config = kiln_config::load(cli.config.as_deref())?;
            if let Some(bind) = bind {
                config.server.bind = bind.clone();
            }
            if let Some(dir) = data_dir {
                config.server.data_dir = Some(dir.display().to_string());
            }
            if let Some(file) = projects_file {
                config.server.projects_file = Some(file.display().to_string());
            }
            if let Some(dir) = prompts_dir {
                config.server.prompts_dir = Some(dir.display().to_string());
            }
            serve(config).await
        }
        Commands::Agents { json } => {
            let config = kiln_config::load(cli.config.as_deref())?;
            let registry =
                AdapterRegistry::standard(Duration::from_secs(config.core.availability_cache_seconds));
            let snapshot = registry.availability_snapshot().await;
            if *json {
                let mut map = serde_json::Map::new();
                for (kind, availability) in snapshot {
                    map.insert(kind.to_string(), serde_json::to_value(&availability)?);
                }
                println!("{}", serde_json::to_string_pretty(&serde_json::Value::Object(map))?);
            } else {
                for kind in kiln_protocol::AgentKind::ALL {
                    let Some(availability) = snapshot.get(&kind) else {
                        continue;
                    };
                    if availability.installed {
                        println!(
                            "{:<8} installed  {}",
                            kind.as_str(),
                            availability.version.as_deref().unwrap_or("")
                        );
                    } else {
                        println!(
                            "{:<8} missing    {}",
                            kind.as_str(),
                            availability.error.as_deref().unwrap_or("")
                        );
                    }
                }
            }
            Ok(())
        }
        Commands::ShowConfig => {
            let config = kiln_config::load(cli.config.as_deref())?;
            println!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}

async fn serve(config: kiln_config::Config) -> anyhow::Result<()> {
    let config = Arc::new(config);

    let projects = Arc::new(match &config.server.projects_file {
        Some(path) => MemoryProjectStore::load_manifest(std::path::Path::new(path))
            .with_context(|| format!("loading project manifest {path}"))?,
        None => {
            warn!("no projects_file configured; starting with an empty project table");
            MemoryProjectStore::new()
        }
    });
    info!(projects = projects.len(), "project table loaded");

    let store: Arc<dyn MessageStore> = match &config.server.data_dir {
        Some(dir) => Arc::new(
            JsonlMessageStore::open(dir.clone())
                .with_context(|| format!("opening transcript store in {dir}"))?,
        ),
        None => {
            warn!("no data_dir configured; transcripts are in-memory only");
            Arc::new(MemoryMessageStore::new())
        }
    };

    let registry = Arc::new(AdapterRegistry::standard(Duration::from_secs(
        config.core.availability_cache_seconds,
    )));
    let prompts = Arc::new(SystemPromptLoader::new(
        config.server.prompts_dir.clone().map(Into::into),
    ));
    let supervisor = Arc::new(Supervisor::new(
        projects.clone(),
        registry.clone(),
        store.clone(),
        Arc::new(SessionStore::new()),
        prompts,
        config.core.clone(),
    ));

    let state = AppState {
        supervisor: supervisor.clone(),
        projects,
        store,
        registry,
        config: config.clone(),
    };

    let bind = config.server.bind.clone();
    tokio::select! {
        result = kiln_gateway::serve(state, &bind) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            supervisor.shutdown_all().await;
        }
    }
    Ok(())
}

/// Tracing goes to stderr; `KILN_LOG` takes precedence, `--verbose` bumps
/// the default from info to debug.
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("KILN_LOG")
        .unwrap_or_else(|_| EnvFilter::new(format!("kiln={default},kiln_core={default},kiln_agents={default},kiln_gateway={default},kiln_store={default}")));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
