// Copyright (C) 2026 Capstan Contributors
// SPDX-License-Identifier: Apache-2.0
//! Embeddable runtime for the orchestration core.
//!
//! [`OrchestratorRuntime`] wires the process manager and the background
//! wait watcher into an existing tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use capstan_core::manager::ProcessManager;
//! use capstan_core::queue::SqliteQueueStore;
//! use capstan_core::runtime::OrchestratorRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteQueueStore::from_path(".data/capstan.db").await?);
//!     let manager = ProcessManager::builder().store(store).build()?;
//!
//!     let runtime = OrchestratorRuntime::builder()
//!         .manager(manager)
//!         .build()?
//!         .start();
//!
//!     // ... serve requests ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::{DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_DELAY};
use crate::manager::ProcessManager;
use crate::waits::ProcessWaitWatcher;

/// Builder for an [`OrchestratorRuntime`].
pub struct OrchestratorRuntimeBuilder {
    manager: Option<Arc<ProcessManager>>,
    wait_poll_interval: Duration,
}

impl Default for OrchestratorRuntimeBuilder {
    fn default() -> Self {
        Self {
            manager: None,
            wait_poll_interval: Duration::from_secs(5),
        }
    }
}

impl OrchestratorRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the process manager (required).
    pub fn manager(mut self, manager: Arc<ProcessManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Set how often the wait watcher re-evaluates open conditions.
    ///
    /// Default: 5 seconds.
    pub fn wait_poll_interval(mut self, interval: Duration) -> Self {
        self.wait_poll_interval = interval;
        self
    }

    /// Build the runtime configuration.
    pub fn build(self) -> Result<OrchestratorRuntimeConfig> {
        let manager = self
            .manager
            .ok_or_else(|| anyhow::anyhow!("manager is required"))?;

        Ok(OrchestratorRuntimeConfig {
            manager,
            wait_poll_interval: self.wait_poll_interval,
        })
    }
}

/// Configuration for an [`OrchestratorRuntime`].
pub struct OrchestratorRuntimeConfig {
    manager: Arc<ProcessManager>,
    wait_poll_interval: Duration,
}

impl std::fmt::Debug for OrchestratorRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorRuntimeConfig")
            .field("wait_poll_interval", &self.wait_poll_interval)
            .finish_non_exhaustive()
    }
}

impl OrchestratorRuntimeConfig {
    /// Start the runtime, spawning the wait watcher task.
    pub fn start(self) -> OrchestratorRuntime {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let watcher = Arc::new(ProcessWaitWatcher::new(
            self.manager.queue().clone(),
            self.manager.clone(),
            self.wait_poll_interval,
            DEFAULT_RETRY_ATTEMPTS,
            DEFAULT_RETRY_DELAY,
        ));
        let watcher_handle = watcher.spawn(shutdown_rx);

        info!(
            poll_interval_secs = self.wait_poll_interval.as_secs(),
            "orchestrator runtime started"
        );

        OrchestratorRuntime {
            manager: self.manager,
            watcher_handle,
            shutdown_tx,
        }
    }
}

/// A running orchestration core that can be embedded in an application.
pub struct OrchestratorRuntime {
    manager: Arc<ProcessManager>,
    watcher_handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl OrchestratorRuntime {
    /// Create a new builder.
    pub fn builder() -> OrchestratorRuntimeBuilder {
        OrchestratorRuntimeBuilder::new()
    }

    /// The process manager.
    pub fn manager(&self) -> &Arc<ProcessManager> {
        &self.manager
    }

    /// Whether the watcher task is still running.
    pub fn is_running(&self) -> bool {
        !self.watcher_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    pub async fn shutdown(self) -> Result<()> {
        info!("orchestrator runtime shutting down...");

        let _ = self.shutdown_tx.send(true);

        match self.watcher_handle.await {
            Ok(()) => {
                info!("orchestrator runtime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("wait watcher task panicked: {}", e);
                Err(anyhow::anyhow!("wait watcher task panicked: {}", e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::SqliteQueueStore;

    async fn manager() -> Arc<ProcessManager> {
        let store = Arc::new(SqliteQueueStore::in_memory().await.unwrap());
        ProcessManager::builder().store(store).build().unwrap()
    }

    #[test]
    fn builder_requires_manager() {
        let result = OrchestratorRuntimeBuilder::new().build();
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("manager is required")
        );
    }

    #[tokio::test]
    async fn start_and_shutdown() {
        let runtime = OrchestratorRuntime::builder()
            .manager(manager().await)
            .wait_poll_interval(Duration::from_millis(50))
            .build()
            .unwrap()
            .start();

        assert!(runtime.is_running());
        runtime.shutdown().await.unwrap();
    }
}
