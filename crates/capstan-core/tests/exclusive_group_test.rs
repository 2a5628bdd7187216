//! Exclusive-group mutual exclusion, end to end.

mod common;

use uuid::Uuid;

use capstan_core::manager::ProcessRequest;
use capstan_core::process::ProcessStatus;

use common::TestContext;

fn grouped_request(org: Uuid, project: Uuid, group: &str) -> ProcessRequest {
    ProcessRequest {
        organization_id: Some(org),
        project_id: Some(project),
        entry_point: Some("main".to_string()),
        exclusive_group: Some(group.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn second_submission_is_cancelled_then_group_frees_up() {
    let ctx = TestContext::new().await;
    let org = Uuid::new_v4();
    let project = Uuid::new_v4();

    // P wins the group.
    let p = ctx
        .manager
        .start(grouped_request(org, project, "g1"))
        .await
        .unwrap();
    assert_eq!(p.status, ProcessStatus::Enqueued);

    // Q loses while P is non-terminal: cancelled cleanly, not a fault.
    let q = ctx
        .manager
        .start(grouped_request(org, project, "g1"))
        .await
        .unwrap();
    assert_eq!(q.status, ProcessStatus::Cancelled);

    // After P finishes, R proceeds normally.
    ctx.queue
        .update_status(p.key.instance_id, ProcessStatus::Finished)
        .await
        .unwrap();

    let r = ctx
        .manager
        .start(grouped_request(org, project, "g1"))
        .await
        .unwrap();
    assert_eq!(r.status, ProcessStatus::Enqueued);
}

#[tokio::test]
async fn different_projects_do_not_conflict() {
    let ctx = TestContext::new().await;
    let org = Uuid::new_v4();

    let a = ctx
        .manager
        .start(grouped_request(org, Uuid::new_v4(), "g1"))
        .await
        .unwrap();
    let b = ctx
        .manager
        .start(grouped_request(org, Uuid::new_v4(), "g1"))
        .await
        .unwrap();

    assert_eq!(a.status, ProcessStatus::Enqueued);
    assert_eq!(b.status, ProcessStatus::Enqueued);
}

#[tokio::test]
async fn no_group_never_conflicts() {
    let ctx = TestContext::new().await;
    let org = Uuid::new_v4();
    let project = Uuid::new_v4();

    for _ in 0..3 {
        let outcome = ctx
            .manager
            .start(ProcessRequest {
                organization_id: Some(org),
                project_id: Some(project),
                entry_point: Some("main".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(outcome.status, ProcessStatus::Enqueued);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn n_concurrent_submissions_exactly_one_survives() {
    let ctx = TestContext::new().await;
    let org = Uuid::new_v4();
    let project = Uuid::new_v4();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let manager = ctx.manager.clone();
        let request = grouped_request(org, project, "contended");
        handles.push(tokio::spawn(async move { manager.start(request).await }));
    }

    let mut enqueued = 0;
    let mut cancelled = 0;
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        match outcome.status {
            ProcessStatus::Enqueued => enqueued += 1,
            ProcessStatus::Cancelled => cancelled += 1,
            other => panic!("unexpected status {}", other),
        }
    }

    assert_eq!(enqueued, 1, "exactly one submission must win the group");
    assert_eq!(cancelled, 7);
}
