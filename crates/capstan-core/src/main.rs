// Copyright (C) 2026 Capstan Contributors
// SPDX-License-Identifier: Apache-2.0
//! Standalone entry point for the orchestration core.
//!
//! Connects to the configured database, runs migrations and keeps the
//! wait watcher running until the process is interrupted. The HTTP front
//! end embeds [`capstan_core::runtime::OrchestratorRuntime`] directly
//! instead of using this binary.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use capstan_core::config::Config;
use capstan_core::manager::ProcessManager;
use capstan_core::queue::{PostgresQueueStore, QueueStore, SqliteQueueStore};
use capstan_core::runtime::OrchestratorRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().context("failed to load configuration")?;

    let store: Arc<dyn QueueStore> = if config.database_url.starts_with("sqlite:") {
        let path = config.database_url.trim_start_matches("sqlite:");
        Arc::new(
            SqliteQueueStore::from_path(path)
                .await
                .context("failed to open SQLite store")?,
        )
    } else {
        Arc::new(
            PostgresQueueStore::connect(&config.database_url)
                .await
                .context("failed to connect to PostgreSQL")?,
        )
    };

    let manager = ProcessManager::builder()
        .store(store)
        .fork_pool_size(config.fork_pool_size)
        .sync_poll_delay(config.sync_poll_delay)
        .build()
        .context("failed to build process manager")?;

    let runtime = OrchestratorRuntime::builder()
        .manager(manager)
        .wait_poll_interval(config.wait_poll_interval)
        .build()?
        .start();

    info!("capstan-core started, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    runtime.shutdown().await
}
