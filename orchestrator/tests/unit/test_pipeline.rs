//! Deploy pipeline against the in-memory host

use std::time::Duration;

use api_models::models::DeployRequest;

use shipwright::deploy::executor::{ExecutorSettings, PipelineOutcome};
use shipwright::deploy::fsm::DeploymentStatus;
use shipwright::errors::{FailureClass, OrchestratorError};
use shipwright::store::{NewPackage, NewProject, StepRecord};

use crate::harness::{fast_settings, Harness, ROOT};

const PIPELINE: [&str; 8] = [
    "validate", "connect", "mkdirs", "upload", "extract", "symlink", "start", "verify",
];

fn request(project_id: i64, package_id: i64, target_id: i64) -> DeployRequest {
    DeployRequest {
        system_id: None,
        project_id,
        package_id,
        target_id,
    }
}

fn keys(steps: &[StepRecord]) -> Vec<&str> {
    steps.iter().map(|s| s.key.as_str()).collect()
}

/// At most one failed step, and only as the last entry
fn assert_step_log_shape(steps: &[StepRecord]) {
    let failures: Vec<usize> = steps
        .iter()
        .enumerate()
        .filter(|(_, s)| !s.ok)
        .map(|(i, _)| i)
        .collect();
    assert!(failures.len() <= 1, "more than one failed step: {:?}", keys(steps));
    if let Some(i) = failures.first() {
        assert_eq!(*i, steps.len() - 1, "failed step is not last: {:?}", keys(steps));
    }
}

#[tokio::test]
async fn test_deploy_jar_end_to_end() {
    let h = Harness::new().await;
    let project = h.project("demo").await;
    let package = h.package(project, "app-1.0.0.jar", b"jar bytes").await;
    let target = h.target("host-a").await;

    let outcome = h.executor.deploy(&request(project, package, target)).await.unwrap();

    assert!(outcome.error.is_none(), "{:?}", outcome.error);
    assert_eq!(outcome.status, DeploymentStatus::Success);
    assert_eq!(keys(&outcome.steps), PIPELINE.to_vec());
    assert!(outcome.steps.iter().all(|s| s.ok));

    let release = outcome.release_path.clone().unwrap();
    assert!(release.starts_with(&format!("{}/demo/releases/", ROOT)));
    assert_eq!(outcome.current_link.as_deref(), Some("/srv/apps/demo/current"));
    assert_eq!(h.fake.read_link("/srv/apps/demo/current"), Some(release.clone()));
    assert_eq!(
        h.fake.file_contents(&format!("{}/app-1.0.0.jar", release)),
        Some(b"jar bytes".to_vec())
    );

    let record = h.store.get_deployment(outcome.deployment_id).await.unwrap().unwrap();
    assert_eq!(record.status, "success");
    assert_eq!(record.kind, "deploy");
    assert_eq!(record.release_path.as_deref(), Some(release.as_str()));
    assert!(record.finished_at.is_some());

    let pid = u32::try_from(record.pid.unwrap()).unwrap();
    assert!(h.fake.is_running(pid));
    let process = h.fake.processes().into_iter().find(|p| p.pid == pid).unwrap();
    assert!(process.cmdline.contains("java -jar app-1.0.0.jar"));
    assert_eq!(process.cwd, release);

    assert_eq!(h.fake.open_sessions(), 0);
    assert_eq!(h.fake.closed_sessions(), 1);
}

#[tokio::test]
async fn test_second_deploy_replaces_running_process() {
    let h = Harness::new().await;
    let project = h.project("demo").await;
    let first_pkg = h.package(project, "app-1.0.0.jar", b"v1").await;
    let second_pkg = h.package(project, "app-1.0.1.jar", b"v2").await;
    let target = h.target("host-a").await;

    let first = h.executor.deploy(&request(project, first_pkg, target)).await.unwrap();
    let second = h.executor.deploy(&request(project, second_pkg, target)).await.unwrap();
    assert!(second.is_success(), "{:?}", second.error);
    assert_ne!(first.release_path, second.release_path);

    let first_pid = h.store.get_deployment(first.deployment_id).await.unwrap().unwrap().pid;
    let second_pid = h.store.get_deployment(second.deployment_id).await.unwrap().unwrap().pid;
    assert!(!h.fake.is_running(first_pid.unwrap() as u32));
    assert!(h.fake.is_running(second_pid.unwrap() as u32));

    // current points only at the newest release
    assert_eq!(h.fake.read_link("/srv/apps/demo/current"), second.release_path);
    assert!(!h.fake.exists("/srv/apps/demo/current.next"));

    let start = second.steps.iter().find(|s| s.key == "start").unwrap();
    assert!(start.log.as_deref().unwrap().contains("previous process stopped"));
}

#[tokio::test]
async fn test_archive_with_start_script() {
    let h = Harness::new().await;
    let project = h
        .project_with(NewProject {
            name: "web".to_string(),
            start_script: Some("bin/start.sh".to_string()),
            stop_script: Some("bin/stop.sh".to_string()),
            ..Default::default()
        })
        .await;
    h.fake.set_archive(
        "web-2.tgz",
        &[("bin/start.sh", "echo starting"), ("bin/stop.sh", "echo stopping")],
    );
    let package = h.package(project, "web-2.tgz", b"gzip bytes").await;
    let target = h.target("host-a").await;

    let outcome = h.executor.deploy(&request(project, package, target)).await.unwrap();
    assert!(outcome.is_success(), "{:?}", outcome.error);

    let release = outcome.release_path.unwrap();
    assert!(h.fake.file_contents(&format!("{}/bin/start.sh", release)).is_some());

    let record = h.store.get_deployment(outcome.deployment_id).await.unwrap().unwrap();
    assert!(record.pid.is_none());
    assert!(h.fake.commands().iter().any(|c| c.contains("sh bin/start.sh")));
}

#[tokio::test]
async fn test_archive_without_script_deploys_files_only() {
    let h = Harness::new().await;
    let project = h.project("static").await;
    h.fake.set_archive("site.zip", &[("index.html", "<html/>")]);
    let package = h.package(project, "site.zip", b"zip bytes").await;
    let target = h.target("host-a").await;

    let outcome = h.executor.deploy(&request(project, package, target)).await.unwrap();
    assert!(outcome.is_success(), "{:?}", outcome.error);
    let start = outcome.steps.iter().find(|s| s.key == "start").unwrap();
    assert!(start.log.as_deref().unwrap().contains("files deployed"));
    assert!(h.fake.processes().is_empty());
}

#[tokio::test]
async fn test_connect_timeout_fails_at_connect() {
    let h = Harness::new().await;
    let project = h.project("demo").await;
    let package = h.package(project, "app.jar", b"jar").await;
    let target = h.target("host-b").await;
    h.fake.set_timeout("host-b");

    let outcome = h.executor.deploy(&request(project, package, target)).await.unwrap();

    assert_eq!(outcome.status, DeploymentStatus::Failed);
    assert_eq!(keys(&outcome.steps), vec!["validate", "connect"]);
    assert!(!outcome.steps[1].ok);
    assert_step_log_shape(&outcome.steps);
    assert_eq!(outcome.error.as_ref().unwrap().class(), FailureClass::Remote);

    let record = h.store.get_deployment(outcome.deployment_id).await.unwrap().unwrap();
    assert_eq!(record.status, "failed");
    assert!(record.release_path.is_none());
    assert!(record.current_link.is_none());
    assert!(record.error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_checksum_mismatch_fails_upload() {
    let h = Harness::new().await;
    let project = h.project("demo").await;
    let path = h.artifact("app.jar", b"real bytes");
    let package = h
        .store
        .insert_package(&NewPackage {
            project_id: project,
            name: "app.jar".to_string(),
            file_url: path.display().to_string(),
            checksum: Some("0".repeat(64)),
            size: None,
        })
        .await
        .unwrap();
    let target = h.target("host-a").await;

    let outcome = h.executor.deploy(&request(project, package, target)).await.unwrap();

    assert_eq!(outcome.status, DeploymentStatus::Failed);
    assert_eq!(outcome.steps.last().unwrap().key, "upload");
    assert_step_log_shape(&outcome.steps);
    assert!(h.fake.uploads().is_empty());
    assert_eq!(h.fake.open_sessions(), 0);
}

#[tokio::test]
async fn test_corrupt_archive_fails_extract() {
    let h = Harness::new().await;
    let project = h.project("demo").await;
    let package = h.package(project, "bundle.tar.gz", b"corrupt data").await;
    let target = h.target("host-a").await;

    let outcome = h.executor.deploy(&request(project, package, target)).await.unwrap();

    assert_eq!(outcome.status, DeploymentStatus::Failed);
    assert_eq!(outcome.steps.last().unwrap().key, "extract");
    assert!(!h.fake.exists("/srv/apps/demo/current"));
}

#[tokio::test]
async fn test_missing_key_fails_before_network() {
    let h = Harness::with_vault(false).await;
    let project = h.project("demo").await;
    let package = h.package(project, "app.jar", b"jar").await;
    let target = h.target("host-a").await;

    let outcome = h.executor.deploy(&request(project, package, target)).await.unwrap();

    assert_eq!(outcome.status, DeploymentStatus::Failed);
    assert_eq!(keys(&outcome.steps), vec!["validate"]);
    assert_eq!(outcome.error.as_ref().unwrap().class(), FailureClass::Crypto);
    assert_eq!(h.fake.connect_attempts("host-a"), 0);
}

#[tokio::test]
async fn test_link_missing_is_reported() {
    let h = Harness::new().await;
    h.fake.without_mv_t().fail_link("/srv/apps/demo/current");
    let project = h.project("demo").await;
    let package = h.package(project, "app.jar", b"jar").await;
    let target = h.target("host-a").await;

    let outcome = h.executor.deploy(&request(project, package, target)).await.unwrap();

    assert_eq!(outcome.status, DeploymentStatus::Failed);
    assert_eq!(outcome.steps.last().unwrap().key, "symlink");
    assert_eq!(outcome.error.as_ref().unwrap().code(), "link_missing");
    // the application is never started against the release
    assert!(h.fake.processes().is_empty());
}

#[tokio::test]
async fn test_fallback_activation_without_mv_t() {
    let h = Harness::new().await;
    h.fake.without_mv_t();
    let project = h.project("demo").await;
    let package = h.package(project, "app.jar", b"jar").await;
    let target = h.target("host-a").await;

    let outcome = h.executor.deploy(&request(project, package, target)).await.unwrap();

    assert!(outcome.is_success(), "{:?}", outcome.error);
    let symlink = outcome.steps.iter().find(|s| s.key == "symlink").unwrap();
    assert!(symlink.log.as_deref().unwrap().contains("remove then link"));
}

#[tokio::test]
async fn test_process_dying_fails_verify() {
    let h = Harness::new().await;
    h.fake.processes_exit_immediately(true);
    let project = h.project("demo").await;
    let package = h.package(project, "app.jar", b"jar").await;
    let target = h.target("host-a").await;

    let outcome = h.executor.deploy(&request(project, package, target)).await.unwrap();

    assert_eq!(outcome.status, DeploymentStatus::Failed);
    assert_eq!(outcome.steps.last().unwrap().key, "verify");
    assert_step_log_shape(&outcome.steps);
    let record = h.store.get_deployment(outcome.deployment_id).await.unwrap().unwrap();
    assert!(record.release_path.is_none());
}

#[tokio::test]
async fn test_unknown_catalog_ids_create_no_record() {
    let h = Harness::new().await;
    let project = h.project("demo").await;
    let target = h.target("host-a").await;

    let err = h.executor.deploy(&request(project, 999, target)).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));
    assert!(h.store.history(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_package_from_other_project_is_rejected() {
    let h = Harness::new().await;
    let demo = h.project("demo").await;
    let other = h.project("other").await;
    let package = h.package(other, "app.jar", b"jar").await;
    let target = h.target("host-a").await;

    let err = h.executor.deploy(&request(demo, package, target)).await.unwrap_err();
    assert_eq!(err.class(), FailureClass::Validation);
}

#[tokio::test]
async fn test_busy_target_is_rejected() {
    let h = Harness::new().await;
    let project = h.project("demo").await;
    let package = h.package(project, "app.jar", b"jar").await;
    let target = h.target("host-a").await;

    let _held = h
        .executor
        .locks()
        .acquire(target, std::time::Duration::from_secs(1))
        .await
        .unwrap();
    let err = h.executor.deploy(&request(project, package, target)).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::TargetBusy(id) if id == target));
    assert!(h.store.history(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_interrupted_deployments_are_failed_on_startup() {
    use shipwright::store::{DeploymentKind, NewDeployment};

    let h = Harness::new().await;
    let project = h.project("demo").await;
    let package = h.package(project, "app.jar", b"jar").await;
    let target = h.target("host-a").await;
    let id = h
        .store
        .create_deployment(&NewDeployment {
            kind: DeploymentKind::Deploy,
            rollback_of: None,
            system_id: None,
            project_id: project,
            package_id: package,
            target_id: target,
        })
        .await
        .unwrap();

    assert_eq!(h.store.fail_interrupted().await.unwrap(), 1);
    let record = h.store.get_deployment(id).await.unwrap().unwrap();
    assert_eq!(record.status, "failed");
    assert_eq!(record.error.as_deref(), Some("interrupted before completion"));
}

#[tokio::test]
async fn test_queued_deploy_stops_the_process_started_ahead_of_it() {
    let h = Harness::with_settings(ExecutorSettings {
        lock_wait: Duration::from_secs(10),
        ..fast_settings()
    })
    .await;
    let project = h.project("demo").await;
    let package = h.package(project, "app-1.0.0.jar", b"jar bytes").await;
    let target = h.target("host-a").await;

    let first = tokio::spawn({
        let executor = h.executor.clone();
        async move { executor.deploy(&request(project, package, target)).await }
    });
    let second = tokio::spawn({
        let executor = h.executor.clone();
        async move { executor.deploy(&request(project, package, target)).await }
    });
    let a = first.await.unwrap().unwrap();
    let b = second.await.unwrap().unwrap();
    assert!(a.is_success(), "{:?}", a.error);
    assert!(b.is_success(), "{:?}", b.error);

    // records are created under the lock, so the higher id ran last
    let last = a.deployment_id.max(b.deployment_id);
    let record = h.store.get_deployment(last).await.unwrap().unwrap();
    let pid = u32::try_from(record.pid.unwrap()).unwrap();

    let running: Vec<u32> = h
        .fake
        .processes()
        .into_iter()
        .filter(|p| p.cmdline.contains("app-1.0.0.jar"))
        .map(|p| p.pid)
        .collect();
    assert_eq!(running, vec![pid]);

    let (earlier, later) = if a.deployment_id < b.deployment_id {
        (&a, &b)
    } else {
        (&b, &a)
    };
    let start_log = |outcome: &PipelineOutcome| {
        outcome
            .steps
            .iter()
            .find(|s| s.key == "start")
            .and_then(|s| s.log.clone())
            .unwrap()
    };
    assert!(start_log(earlier).starts_with("previous process not_running"));
    assert!(start_log(later).starts_with("previous process stopped"));
}
