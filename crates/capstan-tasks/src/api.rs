//! The process API boundary the task surface calls.
//!
//! A transport (HTTP client, in-process handle) implements [`ProcessApi`];
//! the task surface only depends on this trait, and wraps every call in
//! bounded retry.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

use crate::error::{Result, TaskError};

/// Statuses that count as terminal on the wire.
pub const FINAL_STATUSES: [&str; 4] = ["FINISHED", "FAILED", "CANCELLED", "TIMED_OUT"];

/// Statuses that count as failed on the wire.
pub const FAILED_STATUSES: [&str; 3] = ["FAILED", "CANCELLED", "TIMED_OUT"];

/// A process entry as reported by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessEntry {
    /// The process instance id.
    pub instance_id: Uuid,
    /// Current status string.
    pub status: String,
    /// The recorded error payload, if the process failed.
    #[serde(default)]
    pub error: Option<Value>,
}

impl ProcessEntry {
    /// Whether the process reached a terminal status.
    pub fn is_final(&self) -> bool {
        FINAL_STATUSES.contains(&self.status.as_str())
    }

    /// Whether the process finished in a failed state.
    pub fn is_failed(&self) -> bool {
        FAILED_STATUSES.contains(&self.status.as_str())
    }
}

/// Response to a start or fork request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartProcessResponse {
    /// The assigned process instance id.
    pub instance_id: Uuid,
}

/// The server operations the task surface depends on.
#[async_trait]
pub trait ProcessApi: Send + Sync {
    /// Start a new process from a JSON-shaped input map.
    async fn start(&self, input: Map<String, Value>) -> Result<StartProcessResponse>;

    /// Fork a child of the given parent process.
    async fn fork(&self, parent: Uuid, request: Map<String, Value>) -> Result<StartProcessResponse>;

    /// Kill a process.
    async fn kill(&self, instance_id: Uuid) -> Result<()>;

    /// Fetch a process entry.
    async fn entry(&self, instance_id: Uuid) -> Result<ProcessEntry>;

    /// Persist a wait condition for a process.
    async fn set_wait_condition(&self, instance_id: Uuid, condition: Value) -> Result<()>;

    /// Fetch a terminal process' collected output variables.
    async fn out_variables(&self, instance_id: Uuid) -> Result<Map<String, Value>>;
}

/// Retry an API call a fixed number of times with a fixed delay.
pub async fn with_retry<T, F, Fut>(attempts: u32, delay: Duration, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                attempt += 1;
                warn!(error = %e, attempt, "api call failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_from_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry(3, Duration::from_millis(10), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(TaskError::Api {
                        operation: "entry".into(),
                        details: "connection reset".into(),
                    })
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<i32> = with_retry(3, Duration::from_millis(10), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(TaskError::Api {
                    operation: "entry".into(),
                    details: "down".into(),
                })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_surface_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<i32> = with_retry(3, Duration::from_millis(10), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TaskError::InvalidParams("bad".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn entry_status_classification() {
        let mut entry = ProcessEntry {
            instance_id: Uuid::new_v4(),
            status: "RUNNING".to_string(),
            error: None,
        };
        assert!(!entry.is_final());
        assert!(!entry.is_failed());

        entry.status = "FINISHED".to_string();
        assert!(entry.is_final());
        assert!(!entry.is_failed());

        entry.status = "TIMED_OUT".to_string();
        assert!(entry.is_final());
        assert!(entry.is_failed());
    }
}
