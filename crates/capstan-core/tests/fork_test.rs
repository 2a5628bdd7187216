//! Fork coordination and fork-depth policy, end to end.

mod common;

use serde_json::Map;
use uuid::Uuid;

use capstan_core::error::OrchestratorError;
use capstan_core::fork::{ForkGroup, ForkRequest};
use capstan_core::manager::{ForkOutcome, ProcessRequest};
use capstan_core::policy::{ForkDepthRule, PolicyDocument};
use capstan_core::process::ProcessStatus;
use capstan_core::queue::QueueStore as _;

use common::TestContext;

fn group(instances: u32) -> ForkGroup {
    ForkGroup {
        entry_point: "child".to_string(),
        instances,
        configuration: Map::new(),
        out_expressions: Vec::new(),
    }
}

fn async_fork(instances: u32) -> ForkRequest {
    ForkRequest {
        groups: vec![group(instances)],
        sync: false,
        suspend: false,
        ignore_failures: false,
    }
}

async fn start_root(ctx: &TestContext) -> Uuid {
    let outcome = ctx
        .manager
        .start(ProcessRequest {
            organization_id: Some(Uuid::new_v4()),
            project_id: Some(Uuid::new_v4()),
            entry_point: Some("main".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    outcome.key.instance_id
}

#[tokio::test]
async fn fork_creates_linked_children() {
    let ctx = TestContext::new().await;
    let root = start_root(&ctx).await;

    let outcome = ctx.manager.fork(root, async_fork(3)).await.unwrap();
    let ForkOutcome::Submitted { keys } = outcome else {
        panic!("expected Submitted");
    };
    assert_eq!(keys.len(), 3);

    for key in keys {
        let entry = ctx.queue.expect_entry(key.instance_id).await.unwrap();
        assert_eq!(entry.parent_instance_id, Some(root));
        assert_eq!(entry.status, ProcessStatus::Enqueued);
        assert_eq!(
            ctx.queue.ancestor_depth(key.instance_id).await.unwrap(),
            1
        );
    }
}

#[tokio::test]
async fn fork_depth_at_limit_passes_over_limit_faults() {
    let policy = PolicyDocument {
        fork_depth: Some(ForkDepthRule {
            max_depth: 2,
            msg: None,
        }),
        ..Default::default()
    };
    let ctx = TestContext::with_policy(Some(policy)).await;

    let root = start_root(&ctx).await;

    // Depth 1 and 2 succeed.
    let ForkOutcome::Submitted { keys } = ctx.manager.fork(root, async_fork(1)).await.unwrap()
    else {
        panic!("expected Submitted");
    };
    let depth1 = keys[0].instance_id;

    let ForkOutcome::Submitted { keys } = ctx.manager.fork(depth1, async_fork(1)).await.unwrap()
    else {
        panic!("expected Submitted");
    };
    let depth2 = keys[0].instance_id;

    // The third fork exceeds the configured maximum.
    let err = ctx.manager.fork(depth2, async_fork(1)).await.unwrap_err();
    let OrchestratorError::ForkFailed { errors } = err else {
        panic!("expected ForkFailed");
    };
    assert_eq!(errors.len(), 1);
    assert!(
        errors[0].contains("Maximum number of forks exceeded: current 3, limit 2"),
        "unexpected message: {}",
        errors[0]
    );
}

#[tokio::test]
async fn partial_submission_failure_reports_survivors() {
    let policy = PolicyDocument {
        fork_depth: Some(ForkDepthRule {
            max_depth: 0,
            msg: None,
        }),
        ..Default::default()
    };
    let ctx = TestContext::with_policy(Some(policy)).await;
    let root = start_root(&ctx).await;

    // Every child violates the depth limit; the aggregate names each
    // failed submission.
    let err = ctx.manager.fork(root, async_fork(3)).await.unwrap_err();
    let OrchestratorError::ForkFailed { errors } = err else {
        panic!("expected ForkFailed");
    };
    assert_eq!(errors.len(), 3);
}

#[tokio::test]
async fn sync_suspend_fork_persists_wait_condition() {
    let ctx = TestContext::new().await;
    let root = start_root(&ctx).await;
    ctx.queue
        .update_status(root, ProcessStatus::Running)
        .await
        .unwrap();

    let request = ForkRequest {
        groups: vec![group(2)],
        sync: true,
        suspend: true,
        ignore_failures: false,
    };
    let outcome = ctx.manager.fork(root, request).await.unwrap();

    let ForkOutcome::Suspended { keys, resume_event } = outcome else {
        panic!("expected Suspended");
    };
    assert_eq!(keys.len(), 2);
    assert!(!resume_event.is_empty());

    assert_eq!(
        ctx.queue.expect_status(root).await.unwrap(),
        ProcessStatus::Suspended
    );

    let conditions = ctx.store.list_wait_conditions().await.unwrap();
    assert_eq!(conditions.len(), 1);
    assert_eq!(conditions[0].0, root);
    assert_eq!(conditions[0].1["resumeEvent"], resume_event);
}

#[tokio::test]
async fn sync_blocking_fork_collects_outcomes() {
    let ctx = TestContext::new().await;
    let root = start_root(&ctx).await;

    let manager = ctx.manager.clone();
    let forker = tokio::spawn(async move {
        manager
            .fork(
                root,
                ForkRequest {
                    groups: vec![group(2)],
                    sync: true,
                    suspend: false,
                    ignore_failures: false,
                },
            )
            .await
    });

    // Finish the children once both submissions landed; the fork is
    // blocked polling for their terminal statuses.
    loop {
        let children = ctx.queue.children_of(root).await.unwrap();
        if children.len() == 2
            && children.iter().all(|c| c.status == ProcessStatus::Enqueued)
        {
            for child in &children {
                ctx.queue
                    .update_status(child.instance_id, ProcessStatus::Finished)
                    .await
                    .unwrap();
            }
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let outcome = forker.await.unwrap().unwrap();
    let ForkOutcome::Completed { keys, outcomes } = outcome else {
        panic!("expected Completed");
    };
    assert_eq!(keys.len(), 2);
    assert!(outcomes.iter().all(|o| o.status == ProcessStatus::Finished));
}

#[tokio::test]
async fn sync_blocking_fork_with_failed_child_faults() {
    let ctx = TestContext::new().await;
    let root = start_root(&ctx).await;

    let manager = ctx.manager.clone();
    let forker = tokio::spawn(async move {
        manager
            .fork(
                root,
                ForkRequest {
                    groups: vec![group(2)],
                    sync: true,
                    suspend: false,
                    ignore_failures: false,
                },
            )
            .await
    });

    loop {
        let children = ctx.queue.children_of(root).await.unwrap();
        if children.len() == 2
            && children.iter().all(|c| c.status == ProcessStatus::Enqueued)
        {
            ctx.queue
                .mark_failed(children[0].instance_id, "step exploded")
                .await
                .unwrap();
            ctx.queue
                .update_status(children[1].instance_id, ProcessStatus::Finished)
                .await
                .unwrap();
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let err = forker.await.unwrap().unwrap_err();
    let OrchestratorError::ChildFailures { failures } = err else {
        panic!("expected ChildFailures");
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].error.as_deref(), Some("step exploded"));
}
