// Copyright (C) 2026 Capstan Contributors
// SPDX-License-Identifier: Apache-2.0
//! The payload: an immutable-per-step carrier of process launch state.
//!
//! Every processor that changes the payload returns a new value; the old
//! one is discarded. This gives each pipeline step a clean before/after
//! and makes a pipeline safe to replay up to the point of external side
//! effects.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::policy::PolicyDocument;
use crate::process::{ProcessKey, ProcessKind, RepositoryInfo};

/// Carrier of typed headers, configuration and staged attachments for one
/// pipeline invocation.
///
/// Transient: one payload per pipeline run, never shared across
/// invocations. The durable projection of its identity fields is the
/// queue entry.
#[derive(Debug, Clone)]
pub struct Payload {
    /// The process identity this payload belongs to.
    pub process_key: ProcessKey,
    /// The parent process, for forks and handler processes.
    pub parent_instance_id: Option<Uuid>,
    /// The owning organization.
    pub organization_id: Option<Uuid>,
    /// The owning project.
    pub project_id: Option<Uuid>,
    /// The source repository, if started from a registered repo.
    pub repository_id: Option<Uuid>,
    /// The kind of process being launched.
    pub kind: ProcessKind,
    /// Who started the process.
    pub initiator: Option<String>,
    /// The workflow entry point.
    pub entry_point: Option<String>,
    /// Merged, layered process arguments.
    pub configuration: Map<String, Value>,
    /// Arbitrary header bag, typed by key.
    pub headers: BTreeMap<String, Value>,
    /// Staged files not yet part of a workspace, keyed by name.
    pub attachments: BTreeMap<String, PathBuf>,
    /// Total size of the raw request body, if known.
    pub raw_payload_size: Option<u64>,
    /// Configuration profiles active for this run.
    pub active_profiles: Vec<String>,
    /// Expressions whose values are collected as process output.
    pub out_expressions: BTreeSet<String>,
    /// Free-form process tags.
    pub tags: BTreeSet<String>,
    /// Mutual-exclusion group, if any.
    pub exclusive_group: Option<String>,
    /// Policy document resolved for this submission.
    pub policy: Option<Arc<PolicyDocument>>,
    /// Repository provenance, once resolved.
    pub repository: Option<RepositoryInfo>,
    /// The resume event that triggered this invocation, for resumes.
    pub resume_event: Option<String>,
}

impl Payload {
    /// A fresh payload for the given process.
    pub fn new(process_key: ProcessKey) -> Self {
        Self {
            process_key,
            parent_instance_id: None,
            organization_id: None,
            project_id: None,
            repository_id: None,
            kind: ProcessKind::default(),
            initiator: None,
            entry_point: None,
            configuration: Map::new(),
            headers: BTreeMap::new(),
            attachments: BTreeMap::new(),
            raw_payload_size: None,
            active_profiles: Vec::new(),
            out_expressions: BTreeSet::new(),
            tags: BTreeSet::new(),
            exclusive_group: None,
            policy: None,
            repository: None,
            resume_event: None,
        }
    }

    /// Return a copy with the given header set.
    pub fn with_header(mut self, key: impl Into<String>, value: Value) -> Self {
        self.headers.insert(key.into(), value);
        self
    }

    /// Look up a header by key.
    pub fn header(&self, key: &str) -> Option<&Value> {
        self.headers.get(key)
    }

    /// Return a copy with the configuration replaced.
    pub fn with_configuration(mut self, configuration: Map<String, Value>) -> Self {
        self.configuration = configuration;
        self
    }

    /// Return a copy with `overlay` deep-merged over the current
    /// configuration. Later layers win.
    pub fn merge_configuration(mut self, overlay: &Map<String, Value>) -> Self {
        self.configuration = deep_merge(&self.configuration, overlay);
        self
    }

    /// Return a copy with an attachment staged under the given name.
    pub fn with_attachment(mut self, name: impl Into<String>, path: PathBuf) -> Self {
        self.attachments.insert(name.into(), path);
        self
    }

    /// Return a copy with the attachment removed.
    pub fn without_attachment(mut self, name: &str) -> Self {
        self.attachments.remove(name);
        self
    }

    /// Return a copy with the resolved policy attached.
    pub fn with_policy(mut self, policy: Arc<PolicyDocument>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Return a copy with the repository provenance attached.
    pub fn with_repository(mut self, repository: RepositoryInfo) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Return a copy with the exclusive group set.
    pub fn with_exclusive_group(mut self, group: impl Into<String>) -> Self {
        self.exclusive_group = Some(group.into());
        self
    }

    /// Return a copy with the active profiles replaced.
    pub fn with_active_profiles(mut self, profiles: Vec<String>) -> Self {
        self.active_profiles = profiles;
        self
    }

    /// Return a copy with the out expressions replaced.
    pub fn with_out_expressions(mut self, exprs: BTreeSet<String>) -> Self {
        self.out_expressions = exprs;
        self
    }
}

/// Deep-merge `overlay` over `base`: objects merge recursively, any other
/// value in the overlay replaces the base value.
pub fn deep_merge(base: &Map<String, Value>, overlay: &Map<String, Value>) -> Map<String, Value> {
    let mut out = base.clone();
    for (k, v) in overlay {
        match (out.get(k), v) {
            (Some(Value::Object(b)), Value::Object(o)) => {
                out.insert(k.clone(), Value::Object(deep_merge(b, o)));
            }
            _ => {
                out.insert(k.clone(), v.clone());
            }
        }
    }
    out
}
