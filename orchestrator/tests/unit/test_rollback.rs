//! Rollback engine against the in-memory host

use api_models::models::DeployRequest;

use shipwright::deploy::executor::PipelineOutcome;
use shipwright::deploy::fsm::DeploymentStatus;
use shipwright::errors::{OrchestratorError, RollbackError};

use crate::harness::Harness;

struct Fixture {
    h: Harness,
    first: PipelineOutcome,
    second: PipelineOutcome,
}

async fn two_releases() -> Fixture {
    let h = Harness::new().await;
    let project = h.project("demo").await;
    let v1 = h.package(project, "app-1.0.0.jar", b"v1").await;
    let v2 = h.package(project, "app-1.0.1.jar", b"v2").await;
    let target = h.target("host-a").await;

    let deploy = |package_id| DeployRequest {
        system_id: Some(7),
        project_id: project,
        package_id,
        target_id: target,
    };
    let first = h.executor.deploy(&deploy(v1)).await.unwrap();
    let second = h.executor.deploy(&deploy(v2)).await.unwrap();
    assert!(first.is_success() && second.is_success());
    Fixture { h, first, second }
}

#[tokio::test]
async fn test_rollback_restores_previous_release() {
    let Fixture { h, first, second } = two_releases().await;
    let original_before = h.store.get_deployment(second.deployment_id).await.unwrap().unwrap();

    let outcome = h.executor.rollback(second.deployment_id).await.unwrap();
    let pipeline = &outcome.pipeline;

    assert!(pipeline.error.is_none(), "{:?}", pipeline.error);
    assert_eq!(pipeline.status, DeploymentStatus::Success);
    assert_eq!(outcome.original_deployment_id, second.deployment_id);
    assert_eq!(Some(outcome.previous_release_path.clone()), first.release_path);
    assert_eq!(
        pipeline.steps.iter().map(|s| s.key.as_str()).collect::<Vec<_>>(),
        vec!["validate", "connect", "verify_release", "stop", "symlink", "start", "verify"]
    );

    // new row, original untouched
    assert_ne!(pipeline.deployment_id, second.deployment_id);
    let record = h.store.get_deployment(pipeline.deployment_id).await.unwrap().unwrap();
    assert_eq!(record.kind, "rollback");
    assert_eq!(record.rollback_of, Some(second.deployment_id));
    assert_eq!(record.system_id, Some(7));
    assert_eq!(record.release_path, first.release_path);
    let original_after = h.store.get_deployment(second.deployment_id).await.unwrap().unwrap();
    assert_eq!(original_before, original_after);

    // current switched back and the old version runs again
    assert_eq!(h.fake.read_link("/srv/apps/demo/current"), first.release_path);
    let second_pid = original_after.pid.unwrap() as u32;
    assert!(!h.fake.is_running(second_pid));
    let pid = record.pid.unwrap() as u32;
    let process = h.fake.processes().into_iter().find(|p| p.pid == pid).unwrap();
    assert!(process.cmdline.contains("app-1.0.0.jar"));
    assert_eq!(Some(process.cwd), first.release_path);
    assert_eq!(h.fake.open_sessions(), 0);
}

#[tokio::test]
async fn test_rollback_of_rollback_goes_forward_again() {
    let Fixture { h, second, .. } = two_releases().await;
    let back = h.executor.rollback(second.deployment_id).await.unwrap();
    assert!(back.pipeline.is_success());

    let again = h.executor.rollback(back.pipeline.deployment_id).await.unwrap();
    assert!(again.pipeline.is_success(), "{:?}", again.pipeline.error);
    assert_eq!(Some(again.previous_release_path), second.release_path);
    assert_eq!(h.fake.read_link("/srv/apps/demo/current"), second.release_path);
}

#[tokio::test]
async fn test_single_success_has_no_previous_release() {
    let h = Harness::new().await;
    let project = h.project("demo").await;
    let package = h.package(project, "app.jar", b"v1").await;
    let target = h.target("host-a").await;
    let only = h
        .executor
        .deploy(&DeployRequest {
            system_id: None,
            project_id: project,
            package_id: package,
            target_id: target,
        })
        .await
        .unwrap();

    let err = h.executor.rollback(only.deployment_id).await.unwrap_err();

    assert!(matches!(
        err,
        OrchestratorError::Rollback(RollbackError::NoPreviousRelease(_))
    ));
    assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
    let record = h.store.get_deployment(only.deployment_id).await.unwrap().unwrap();
    assert_eq!(record.status, "success");
    assert_eq!(h.store.history(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_pruned_release_is_reported_missing() {
    let Fixture { h, first, second } = two_releases().await;
    h.fake.remove(first.release_path.as_deref().unwrap());

    let outcome = h.executor.rollback(second.deployment_id).await.unwrap();
    let pipeline = outcome.pipeline;

    assert_eq!(pipeline.status, DeploymentStatus::Failed);
    assert_eq!(pipeline.steps.last().unwrap().key, "verify_release");
    let err = pipeline.error.unwrap();
    assert_eq!(err.code(), "release_missing");
    assert_eq!(err.status_code(), axum::http::StatusCode::CONFLICT);

    // nothing changed on the host or in the original record
    assert_eq!(h.fake.read_link("/srv/apps/demo/current"), second.release_path);
    let original = h.store.get_deployment(second.deployment_id).await.unwrap().unwrap();
    assert_eq!(original.status, "success");
    let record = h.store.get_deployment(pipeline.deployment_id).await.unwrap().unwrap();
    assert_eq!(record.status, "failed");
    assert!(record.release_path.is_none());
}

#[tokio::test]
async fn test_failed_deployment_is_not_rollbackable() {
    let Fixture { h, second, .. } = two_releases().await;
    h.fake.set_unreachable("host-a");
    let base = h.store.get_deployment(second.deployment_id).await.unwrap().unwrap();
    let failed = h
        .executor
        .deploy(&DeployRequest {
            system_id: None,
            project_id: base.project_id,
            package_id: base.package_id,
            target_id: base.target_id,
        })
        .await
        .unwrap();
    assert_eq!(failed.status, DeploymentStatus::Failed);

    let err = h.executor.rollback(failed.deployment_id).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Rollback(RollbackError::NotRollbackable { .. })
    ));
}

#[tokio::test]
async fn test_unknown_deployment_is_not_found() {
    let h = Harness::new().await;
    let err = h.executor.rollback(42).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));
}
