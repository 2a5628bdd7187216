// Copyright (C) 2026 Capstan Contributors
// SPDX-License-Identifier: Apache-2.0
//! Bounded fan-out for forking child processes.
//!
//! One fork request may name several groups, each with an instance count.
//! Submissions run on a single bounded worker pool owned by the
//! coordinator; the pool is created once and shared across requests, so a
//! fork-many request cannot create unbounded concurrency.
//!
//! Semantics are "wait for all, fail if any failed": the coordinator
//! always collects every submission result before reporting, so the
//! caller learns every successfully assigned process key even when some
//! submissions fail.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};
use crate::process::ProcessKey;

/// One named fork group.
#[derive(Debug, Clone)]
pub struct ForkGroup {
    /// The child entry point.
    pub entry_point: String,
    /// Number of child instances to start.
    pub instances: u32,
    /// Configuration overlay merged over the parent's configuration.
    pub configuration: Map<String, Value>,
    /// Output expressions collected from each child.
    pub out_expressions: Vec<String>,
}

/// A fork request: one or more groups plus completion semantics.
#[derive(Debug, Clone)]
pub struct ForkRequest {
    /// The groups to start.
    pub groups: Vec<ForkGroup>,
    /// Wait for the children to finish.
    pub sync: bool,
    /// When synchronous, suspend instead of blocking.
    pub suspend: bool,
    /// Downgrade child failures from fault to warning.
    pub ignore_failures: bool,
}

/// Submits a single forked child; implemented by the process manager.
#[async_trait]
pub trait ForkSubmitter: Send + Sync {
    /// Run the fork pipeline for one child and return its assigned key.
    async fn submit(&self, parent: ProcessKey, group: ForkGroup, index: u32) -> Result<ProcessKey>;
}

/// Dispatches child submissions onto a bounded worker pool.
pub struct ForkCoordinator {
    permits: Arc<Semaphore>,
}

impl ForkCoordinator {
    /// Create a coordinator with the given worker pool size.
    pub fn new(pool_size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(pool_size.max(1))),
        }
    }

    /// Submit every child of the request and wait for all submissions.
    ///
    /// Returns the children's keys in submission order. If any submission
    /// failed, an aggregate error is returned instead, built after every
    /// submission has settled.
    pub async fn submit_all(
        &self,
        submitter: Arc<dyn ForkSubmitter>,
        parent: ProcessKey,
        groups: &[ForkGroup],
    ) -> Result<Vec<ProcessKey>> {
        let mut set: JoinSet<(usize, Result<ProcessKey>)> = JoinSet::new();
        let mut position = 0usize;

        for group in groups {
            for index in 0..group.instances {
                let permits = self.permits.clone();
                let submitter = submitter.clone();
                let group = group.clone();
                let slot = position;
                position += 1;

                set.spawn(async move {
                    let _permit = match permits.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(e) => {
                            return (
                                slot,
                                Err(OrchestratorError::DatabaseError {
                                    operation: "fork-pool".to_string(),
                                    details: format!("worker pool closed: {}", e),
                                }),
                            );
                        }
                    };
                    let result = submitter.submit(parent, group, index).await;
                    (slot, result)
                });
            }
        }

        debug!(parent = %parent, children = position, "fork submissions dispatched");

        let mut keys: Vec<Option<ProcessKey>> = vec![None; position];
        let mut errors = Vec::new();

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((slot, Ok(key))) => keys[slot] = Some(key),
                Ok((slot, Err(e))) => {
                    errors.push(format!("submission {}: {}", slot, e));
                }
                Err(e) => {
                    errors.push(format!("submission task failed: {}", e));
                }
            }
        }

        if !errors.is_empty() {
            errors.sort();
            return Err(OrchestratorError::ForkFailed { errors });
        }

        let keys: Vec<ProcessKey> = keys.into_iter().flatten().collect();
        info!(parent = %parent, children = keys.len(), "fork submissions complete");
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingSubmitter {
        in_flight: AtomicUsize,
        max_observed: AtomicUsize,
        fail_index: Option<u32>,
    }

    impl CountingSubmitter {
        fn new(fail_index: Option<u32>) -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                max_observed: AtomicUsize::new(0),
                fail_index,
            }
        }
    }

    #[async_trait]
    impl ForkSubmitter for CountingSubmitter {
        async fn submit(
            &self,
            _parent: ProcessKey,
            _group: ForkGroup,
            index: u32,
        ) -> Result<ProcessKey> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_observed.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if Some(index) == self.fail_index {
                return Err(OrchestratorError::TooManyRequests {
                    message: "queue full".to_string(),
                });
            }
            Ok(ProcessKey::generate())
        }
    }

    fn group(instances: u32) -> ForkGroup {
        ForkGroup {
            entry_point: "child".to_string(),
            instances,
            configuration: Map::new(),
            out_expressions: Vec::new(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pool_bounds_concurrency() {
        let coordinator = ForkCoordinator::new(2);
        let submitter = Arc::new(CountingSubmitter::new(None));

        let keys = coordinator
            .submit_all(submitter.clone(), ProcessKey::generate(), &[group(8)])
            .await
            .unwrap();

        assert_eq!(keys.len(), 8);
        assert!(submitter.max_observed.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn all_submissions_collected_before_failure_surfaces() {
        let coordinator = ForkCoordinator::new(4);
        let submitter = Arc::new(CountingSubmitter::new(Some(2)));

        let err = coordinator
            .submit_all(submitter, ProcessKey::generate(), &[group(5)])
            .await
            .unwrap_err();

        match err {
            OrchestratorError::ForkFailed { errors } => {
                assert_eq!(errors.len(), 1);
                assert!(errors[0].contains("queue full"));
            }
            other => panic!("expected ForkFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn multiple_groups_flattened_in_order() {
        let coordinator = ForkCoordinator::new(4);
        let submitter = Arc::new(CountingSubmitter::new(None));

        let keys = coordinator
            .submit_all(
                submitter,
                ProcessKey::generate(),
                &[group(2), group(3)],
            )
            .await
            .unwrap();

        assert_eq!(keys.len(), 5);
    }

    #[tokio::test]
    async fn zero_instances_yields_no_children() {
        let coordinator = ForkCoordinator::new(4);
        let submitter = Arc::new(CountingSubmitter::new(None));

        let keys = coordinator
            .submit_all(submitter, ProcessKey::generate(), &[group(0)])
            .await
            .unwrap();
        assert!(keys.is_empty());
    }
}
