//! Input validation: malformed submissions fault before any durable work.

use async_trait::async_trait;

use crate::error::{OrchestratorError, Result};
use crate::payload::Payload;
use crate::pipeline::{Chain, Processor};

/// Rejects malformed payloads before the queue row is created.
pub struct ValidationProcessor;

#[async_trait]
impl Processor for ValidationProcessor {
    async fn process(&self, chain: Chain, payload: Payload) -> Result<Payload> {
        if let Some(entry_point) = &payload.entry_point
            && entry_point.trim().is_empty()
        {
            return Err(OrchestratorError::ValidationError {
                field: "entryPoint".to_string(),
                message: "must not be blank".to_string(),
            });
        }

        if let Some(group) = &payload.exclusive_group
            && group.trim().is_empty()
        {
            return Err(OrchestratorError::ValidationError {
                field: "exclusiveGroup".to_string(),
                message: "must not be blank".to_string(),
            });
        }

        if payload.project_id.is_some() && payload.organization_id.is_none() {
            return Err(OrchestratorError::ValidationError {
                field: "organizationId".to_string(),
                message: "required when a project is specified".to_string(),
            });
        }

        if payload.attachments.keys().any(|name| name.is_empty()) {
            return Err(OrchestratorError::ValidationError {
                field: "attachments".to_string(),
                message: "attachment names must not be empty".to_string(),
            });
        }

        chain.process(payload).await
    }
}

/// Rejects resume requests without a resume event.
pub struct ResumeValidationProcessor;

#[async_trait]
impl Processor for ResumeValidationProcessor {
    async fn process(&self, chain: Chain, payload: Payload) -> Result<Payload> {
        match &payload.resume_event {
            Some(event) if !event.trim().is_empty() => chain.process(payload).await,
            _ => Err(OrchestratorError::ValidationError {
                field: "resumeEvent".to_string(),
                message: "required to resume a suspended process".to_string(),
            }),
        }
    }
}
