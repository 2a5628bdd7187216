//! End-to-end tests for the new-process pipeline.

mod common;

use serde_json::{Map, Value, json};
use uuid::Uuid;

use capstan_core::manager::ProcessRequest;
use capstan_core::policy::{LimitScope, PolicyDocument, QueueLimitRule, QueueProcessRule};
use capstan_core::process::ProcessStatus;

use common::TestContext;

fn obj(v: Value) -> Map<String, Value> {
    match v {
        Value::Object(m) => m,
        other => panic!("expected object, got {:?}", other),
    }
}

fn basic_request() -> ProcessRequest {
    let org = Uuid::new_v4();
    let project = Uuid::new_v4();
    ProcessRequest {
        organization_id: Some(org),
        project_id: Some(project),
        entry_point: Some("main".to_string()),
        initiator: Some("tester".to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn start_enqueues_the_process() {
    let ctx = TestContext::new().await;

    let outcome = ctx.manager.start(basic_request()).await.unwrap();
    assert_eq!(outcome.status, ProcessStatus::Enqueued);

    let entry = ctx
        .queue
        .expect_entry(outcome.key.instance_id)
        .await
        .unwrap();
    assert_eq!(entry.status, ProcessStatus::Enqueued);
    assert_eq!(entry.initiator.as_deref(), Some("tester"));
}

#[tokio::test]
async fn status_history_records_new_then_enqueued() {
    let ctx = TestContext::new().await;

    let outcome = ctx.manager.start(basic_request()).await.unwrap();
    let history = ctx
        .queue
        .status_history(outcome.key.instance_id)
        .await
        .unwrap();

    let statuses: Vec<_> = history.iter().map(|h| h.status).collect();
    assert_eq!(statuses, vec![ProcessStatus::New, ProcessStatus::Enqueued]);
}

#[tokio::test]
async fn validation_fault_before_any_queue_row() {
    let ctx = TestContext::new().await;

    let mut request = basic_request();
    request.entry_point = Some("   ".to_string());

    let err = ctx.manager.start(request).await.unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");
}

#[tokio::test]
async fn admission_fault_leaves_process_failed_not_enqueued() {
    let policy = PolicyDocument {
        queue_process: Some(QueueProcessRule {
            limits: vec![QueueLimitRule {
                scope: LimitScope::Process,
                statuses: ProcessStatus::NON_TERMINAL.to_vec(),
                max: 1,
                msg: None,
                warn_only: false,
            }],
        }),
        ..Default::default()
    };
    let ctx = TestContext::with_policy(Some(policy)).await;

    let first = ctx.manager.start(basic_request()).await.unwrap();
    assert_eq!(first.status, ProcessStatus::Enqueued);

    let err = ctx.manager.start(basic_request()).await.unwrap_err();
    assert_eq!(err.error_code(), "TOO_MANY_REQUESTS");

    // The rejected submission is FAILED with the fault recorded, never
    // ENQUEUED.
    let counts = ctx
        .queue
        .status_counts(capstan_core::queue::CountScope::All)
        .await
        .unwrap();
    assert_eq!(counts.get("ENQUEUED"), Some(&1i64));
    assert_eq!(counts.get("FAILED"), Some(&1i64));
}

#[tokio::test]
async fn merged_configuration_layers_visible_in_payload() {
    let ctx = TestContext::new().await;

    let mut request = basic_request();
    request.headers.insert(
        "defaults".to_string(),
        json!({"arguments": {"region": "us", "retries": 3}}),
    );
    request.configuration = obj(json!({"arguments": {"region": "eu"}, "out": ["result"]}));

    let outcome = ctx.manager.start(request).await.unwrap();
    assert_eq!(outcome.status, ProcessStatus::Enqueued);
}

#[tokio::test]
async fn kill_cancels_enqueued_process() {
    let ctx = TestContext::new().await;

    let outcome = ctx.manager.start(basic_request()).await.unwrap();
    ctx.manager.kill(outcome.key.instance_id).await.unwrap();

    assert_eq!(
        ctx.queue
            .expect_status(outcome.key.instance_id)
            .await
            .unwrap(),
        ProcessStatus::Cancelled
    );

    // Kill is idempotent on terminal processes.
    ctx.manager.kill(outcome.key.instance_id).await.unwrap();
}

#[tokio::test]
async fn concurrent_cas_has_exactly_one_winner() {
    let ctx = TestContext::new().await;
    let outcome = ctx.manager.start(basic_request()).await.unwrap();
    let id = outcome.key.instance_id;

    let store_a = ctx.store.clone();
    let store_b = ctx.store.clone();
    let a = tokio::spawn(async move {
        capstan_core::queue::QueueStore::update_expected_status(
            store_a.as_ref(),
            id,
            ProcessStatus::Enqueued,
            ProcessStatus::Starting,
        )
        .await
        .unwrap()
    });
    let b = tokio::spawn(async move {
        capstan_core::queue::QueueStore::update_expected_status(
            store_b.as_ref(),
            id,
            ProcessStatus::Enqueued,
            ProcessStatus::Starting,
        )
        .await
        .unwrap()
    });

    let (ra, rb) = (a.await.unwrap(), b.await.unwrap());
    assert!(ra ^ rb, "exactly one CAS must win, got {} and {}", ra, rb);
    assert_eq!(
        ctx.queue.expect_status(id).await.unwrap(),
        ProcessStatus::Starting
    );

    // The winner's transition appears exactly once in the history.
    let history = ctx.queue.status_history(id).await.unwrap();
    let starting = history
        .iter()
        .filter(|h| h.status == ProcessStatus::Starting)
        .count();
    assert_eq!(starting, 1);
}
