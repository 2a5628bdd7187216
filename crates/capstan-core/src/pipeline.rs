// Copyright (C) 2026 Capstan Contributors
// SPDX-License-Identifier: Apache-2.0
//! Chain-of-responsibility pipelines.
//!
//! A pipeline is an ordered list of single-responsibility processors.
//! Each processor receives the remaining chain and the payload, and
//! decides whether to continue (`chain.process(payload)`), short-circuit
//! (return without calling the chain), or fault (return an error).
//!
//! A [`Pipeline`] wraps the chain with a fault handler invoked on any
//! error before it is rethrown. This is the pipeline's only structured
//! cleanup mechanism: lock-acquiring processors must be idempotent to
//! re-entry and must not leak a lock when a later processor faults.
//!
//! Pipelines are built once at startup and looked up by name in a
//! [`PipelineRegistry`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::error::{OrchestratorError, Result};
use crate::payload::Payload;

/// A single pipeline step.
///
/// Processors are stateless with respect to any one invocation: all
/// per-call state lives in the payload, which makes a pipeline trivially
/// replayable for testing.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Process the payload, optionally delegating to the rest of the chain.
    async fn process(&self, chain: Chain, payload: Payload) -> Result<Payload>;
}

/// The remaining processors of a pipeline invocation.
#[derive(Clone)]
pub struct Chain {
    processors: Arc<Vec<Arc<dyn Processor>>>,
    next: usize,
}

impl Chain {
    /// A chain over the full processor list.
    pub fn new(processors: Arc<Vec<Arc<dyn Processor>>>) -> Self {
        Self {
            processors,
            next: 0,
        }
    }

    /// Invoke the next processor, or return the payload unchanged when the
    /// chain is exhausted.
    pub async fn process(&self, payload: Payload) -> Result<Payload> {
        match self.processors.get(self.next) {
            None => Ok(payload),
            Some(processor) => {
                let rest = Chain {
                    processors: self.processors.clone(),
                    next: self.next + 1,
                };
                processor.process(rest, payload).await
            }
        }
    }
}

/// Invoked when any processor in the pipeline faults.
#[async_trait]
pub trait FaultHandler: Send + Sync {
    /// Perform cleanup for a faulted pipeline run.
    async fn on_fault(&self, payload: &Payload, error: &OrchestratorError);
}

/// A fault handler that does nothing.
pub struct NoopFaultHandler;

#[async_trait]
impl FaultHandler for NoopFaultHandler {
    async fn on_fault(&self, _payload: &Payload, _error: &OrchestratorError) {}
}

/// A named, replayable composition of processors with structured fault
/// cleanup.
pub struct Pipeline {
    name: &'static str,
    processors: Arc<Vec<Arc<dyn Processor>>>,
    fault_handler: Arc<dyn FaultHandler>,
}

impl Pipeline {
    /// Build a pipeline from an ordered processor list.
    pub fn new(
        name: &'static str,
        processors: Vec<Arc<dyn Processor>>,
        fault_handler: Arc<dyn FaultHandler>,
    ) -> Self {
        Self {
            name,
            processors: Arc::new(processors),
            fault_handler,
        }
    }

    /// The pipeline's registry name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run the payload through the chain. On fault, the fault handler runs
    /// before the error is returned; nothing below the pipeline boundary
    /// swallows a fault silently.
    pub async fn process(&self, payload: Payload) -> Result<Payload> {
        debug!(pipeline = self.name, instance_id = %payload.process_key, "pipeline started");

        // The fault handler needs the payload as it entered the pipeline.
        let entry_snapshot = payload.clone();

        match Chain::new(self.processors.clone()).process(payload).await {
            Ok(payload) => Ok(payload),
            Err(e) => {
                error!(
                    pipeline = self.name,
                    instance_id = %entry_snapshot.process_key,
                    error = %e,
                    "pipeline faulted"
                );
                self.fault_handler.on_fault(&entry_snapshot, &e).await;
                Err(e)
            }
        }
    }
}

/// Static registry of pipelines, keyed by name and built once at startup.
#[derive(Default)]
pub struct PipelineRegistry {
    pipelines: HashMap<&'static str, Arc<Pipeline>>,
}

impl PipelineRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pipeline under its name.
    pub fn register(mut self, pipeline: Pipeline) -> Self {
        self.pipelines.insert(pipeline.name(), Arc::new(pipeline));
        self
    }

    /// Look up a pipeline by name.
    pub fn get(&self, name: &str) -> Option<Arc<Pipeline>> {
        self.pipelines.get(name).cloned()
    }

    /// Look up a pipeline, failing when it is not registered.
    pub fn expect(&self, name: &str) -> Result<Arc<Pipeline>> {
        self.get(name)
            .ok_or_else(|| OrchestratorError::ValidationError {
                field: "pipeline".to_string(),
                message: format!("unknown pipeline: {}", name),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessKey;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Tag(&'static str);

    #[async_trait]
    impl Processor for Tag {
        async fn process(&self, chain: Chain, payload: Payload) -> Result<Payload> {
            let payload = payload.with_header(self.0, json!(true));
            chain.process(payload).await
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Processor for ShortCircuit {
        async fn process(&self, _chain: Chain, payload: Payload) -> Result<Payload> {
            Ok(payload)
        }
    }

    struct Fault;

    #[async_trait]
    impl Processor for Fault {
        async fn process(&self, _chain: Chain, _payload: Payload) -> Result<Payload> {
            Err(OrchestratorError::ValidationError {
                field: "x".into(),
                message: "bad".into(),
            })
        }
    }

    struct RecordingFaultHandler {
        calls: AtomicUsize,
        last_code: Mutex<Option<&'static str>>,
    }

    impl RecordingFaultHandler {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                last_code: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl FaultHandler for RecordingFaultHandler {
        async fn on_fault(&self, _payload: &Payload, error: &OrchestratorError) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_code.lock().unwrap() = Some(error.error_code());
        }
    }

    #[tokio::test]
    async fn processors_run_in_order() {
        let pipeline = Pipeline::new(
            "test",
            vec![Arc::new(Tag("first")), Arc::new(Tag("second"))],
            Arc::new(NoopFaultHandler),
        );

        let out = pipeline
            .process(Payload::new(ProcessKey::generate()))
            .await
            .unwrap();

        assert_eq!(out.header("first"), Some(&json!(true)));
        assert_eq!(out.header("second"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn short_circuit_skips_rest_of_chain() {
        let pipeline = Pipeline::new(
            "test",
            vec![
                Arc::new(Tag("before")),
                Arc::new(ShortCircuit),
                Arc::new(Tag("after")),
            ],
            Arc::new(NoopFaultHandler),
        );

        let out = pipeline
            .process(Payload::new(ProcessKey::generate()))
            .await
            .unwrap();

        assert_eq!(out.header("before"), Some(&json!(true)));
        assert!(out.header("after").is_none());
    }

    #[tokio::test]
    async fn fault_invokes_handler_exactly_once() {
        let handler = Arc::new(RecordingFaultHandler::new());
        let pipeline = Pipeline::new(
            "test",
            vec![Arc::new(Tag("before")), Arc::new(Fault)],
            handler.clone(),
        );

        let err = pipeline
            .process(Payload::new(ProcessKey::generate()))
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), "VALIDATION_ERROR");
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *handler.last_code.lock().unwrap(),
            Some("VALIDATION_ERROR")
        );
    }

    #[tokio::test]
    async fn empty_chain_returns_payload() {
        let pipeline = Pipeline::new("empty", vec![], Arc::new(NoopFaultHandler));
        let key = ProcessKey::generate();
        let out = pipeline.process(Payload::new(key)).await.unwrap();
        assert_eq!(out.process_key, key);
    }

    #[tokio::test]
    async fn registry_lookup() {
        let registry = PipelineRegistry::new()
            .register(Pipeline::new("a", vec![], Arc::new(NoopFaultHandler)))
            .register(Pipeline::new("b", vec![], Arc::new(NoopFaultHandler)));

        assert!(registry.get("a").is_some());
        assert!(registry.get("b").is_some());
        assert!(registry.get("c").is_none());
    }
}
