// Copyright (C) 2026 Capstan Contributors
// SPDX-License-Identifier: Apache-2.0
//! Boundary contracts to external collaborators.
//!
//! The core consumes these interfaces; their implementations (git
//! fetching, runner transport) live outside this crate.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::Result;
use crate::process::{ProcessKey, RepositoryInfo};

/// What to fetch: a registered repository or an explicit URL.
#[derive(Debug, Clone)]
pub struct RepositoryRequest {
    /// The owning project.
    pub project_id: Option<Uuid>,
    /// The registered repository id.
    pub repository_id: Option<Uuid>,
    /// Explicit repository URL, when not registered.
    pub url: Option<String>,
    /// Branch, tag or commit to resolve.
    pub reference: Option<String>,
}

/// A resolved filesystem snapshot of a repository.
#[derive(Debug, Clone)]
pub struct RepositorySnapshot {
    /// Where the snapshot was staged.
    pub path: PathBuf,
    /// Provenance recorded on the queue entry.
    pub info: RepositoryInfo,
}

/// Resolves repositories into filesystem snapshots.
///
/// Implementations serialize concurrent fetches of the same repository
/// internally; callers see one `fetch` call at a time per repo key.
#[async_trait]
pub trait RepositoryResolver: Send + Sync {
    /// Fetch a snapshot for the given request.
    async fn fetch(&self, request: &RepositoryRequest) -> Result<RepositorySnapshot>;
}

/// A fully resolved execution unit handed to the external runner.
#[derive(Debug, Clone)]
pub struct ExecutionUnit {
    /// The process being dispatched.
    pub process_key: ProcessKey,
    /// Workspace directory, when a repository or archive was staged.
    pub workspace: Option<PathBuf>,
    /// The merged configuration.
    pub configuration: Map<String, Value>,
    /// The workflow entry point.
    pub entry_point: Option<String>,
}

/// Hands resolved execution units to the external runner.
///
/// The pipeline's job ends at "dispatched"; completion is reported back
/// asynchronously through queue status transitions.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Dispatch the unit. Must not block on execution.
    async fn dispatch(&self, unit: ExecutionUnit) -> Result<()>;
}

/// A dispatcher that drops units on the floor; useful when the runner
/// polls the queue directly, and in tests.
pub struct NoopDispatcher;

#[async_trait]
impl Dispatcher for NoopDispatcher {
    async fn dispatch(&self, _unit: ExecutionUnit) -> Result<()> {
        Ok(())
    }
}

/// A resolver for deployments that never reference repositories; any
/// fetch attempt fails.
pub struct NoRepositories;

#[async_trait]
impl RepositoryResolver for NoRepositories {
    async fn fetch(&self, _request: &RepositoryRequest) -> Result<RepositorySnapshot> {
        Err(crate::error::OrchestratorError::RepositoryError {
            details: "no repository resolver configured".to_string(),
        })
    }
}
