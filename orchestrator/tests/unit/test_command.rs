//! Command building and the in-memory host

use std::collections::BTreeMap;
use std::time::Duration;

use secrecy::SecretString;

use shipwright::app::options::SupervisorOptions;
use shipwright::errors::{CommandError, ConnectError};
use shipwright::release::{ActivationMode, ReleaseLayout, ReleaseManager};
use shipwright::remote::command::{check_path, CommandOutput, RemoteCommand};
use shipwright::remote::fake::FakeHost;
use shipwright::remote::session::{ConnectParams, Credential, RemoteConnector, RemoteSession};
use shipwright::supervisor::{LaunchPlan, StopOutcome, StopTarget, Supervisor};

fn params(host: &str) -> ConnectParams {
    ConnectParams {
        host: host.to_string(),
        port: 22,
        user: "deploy".to_string(),
        credential: Credential::Password(SecretString::from("pw".to_string())),
        timeout: Duration::from_secs(1),
    }
}

async fn session(fake: &FakeHost) -> Box<dyn RemoteSession> {
    fake.connect(&params("host-a")).await.unwrap()
}

#[test]
fn test_user_supplied_names_cannot_inject() {
    for name in ["demo; rm -rf /", "demo$(reboot)", "demo`id`", "../../etc", "demo\nx"] {
        assert!(ReleaseLayout::new("/srv/apps", name).is_err(), "{name:?}");
    }
    let cmd = RemoteCommand::new("pkill").arg("-f").value("app'; reboot; '");
    assert_eq!(cmd.render().unwrap(), r"pkill -f 'app'\''; reboot; '\'''");

    let cmd = RemoteCommand::new("ls").path("/srv/a b");
    assert!(matches!(cmd.render(), Err(CommandError::UnsafeArgument(_))));
    assert!(check_path("/srv/apps/../../root").is_err());
    assert!(check_path("-rf").is_err());
    assert!(check_path("/srv/apps/demo/releases/20240501T101500123Z").is_ok());
}

#[test]
fn test_failed_output_check() {
    let cmd = RemoteCommand::new("false");
    let output = CommandOutput {
        stdout: String::new(),
        stderr: "boom".to_string(),
        exit_code: 3,
    };
    match output.check(&cmd) {
        Err(CommandError::Failed { code, stderr, .. }) => {
            assert_eq!(code, 3);
            assert_eq!(stderr, "boom");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_connect_failures_are_classified() {
    let fake = FakeHost::new();
    fake.set_unreachable("down").set_timeout("slow");

    let err = fake.connect(&params("down")).await.err().unwrap();
    assert_eq!(err.kind(), "unreachable");
    let err = fake.connect(&params("slow")).await.err().unwrap();
    assert_eq!(err.kind(), "timeout");

    fake.reject_auth(true);
    let err = fake.connect(&params("host-a")).await.err().unwrap();
    assert!(err.is_auth());

    let mut blank = params("host-a");
    blank.credential = Credential::Password(SecretString::from(String::new()));
    let err = FakeHost::new().connect(&blank).await.err().unwrap();
    assert!(matches!(err, ConnectError::InvalidCredential(_)));
}

#[tokio::test]
async fn test_activation_switches_between_releases() {
    let fake = FakeHost::new();
    let session = session(&fake).await;
    let releases = ReleaseManager::new(session.as_ref());
    let layout = ReleaseLayout::new("/srv/apps", "demo").unwrap();

    let r1 = releases.allocate(&layout).await.unwrap();
    releases.prepare_dirs(&layout, &r1).await.unwrap();
    let r2 = releases.allocate(&layout).await.unwrap();
    releases.prepare_dirs(&layout, &r2).await.unwrap();
    assert_ne!(r1, r2);

    assert_eq!(releases.activate(&layout, &r1).await.unwrap(), ActivationMode::Atomic);
    assert_eq!(releases.activate(&layout, &r2).await.unwrap(), ActivationMode::Atomic);
    assert_eq!(releases.current_target(&layout).await.unwrap(), Some(r2.clone()));
    assert!(!fake.exists("/srv/apps/demo/current.next"));
    session.close().await;
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let fake = FakeHost::new();
    let session = session(&fake).await;
    let options = SupervisorOptions {
        settle_delay: Duration::ZERO,
        verify_delay: Duration::ZERO,
    };
    let supervisor = Supervisor::new(session.as_ref(), &options);

    let pid = fake.spawn_process("java -jar app.jar", "/srv");
    assert_eq!(supervisor.stop(&StopTarget::Pid(pid)).await.unwrap(), StopOutcome::Stopped);
    assert_eq!(supervisor.stop(&StopTarget::Pid(pid)).await.unwrap(), StopOutcome::NotRunning);
    assert_eq!(
        supervisor
            .stop(&StopTarget::Pattern("app.jar".to_string()))
            .await
            .unwrap(),
        StopOutcome::NotRunning
    );
}

#[tokio::test]
async fn test_background_start_reports_pid_and_log() {
    let fake = FakeHost::new();
    fake.mkdir_all("/srv/apps/demo/releases/r1/logs");
    let session = session(&fake).await;
    let options = SupervisorOptions {
        settle_delay: Duration::ZERO,
        verify_delay: Duration::ZERO,
    };
    let supervisor = Supervisor::new(session.as_ref(), &options);
    let plan = LaunchPlan::Jar {
        jar: "app.jar".to_string(),
        java_opts: vec!["-Xmx256m".to_string()],
        args: vec![],
    };
    let mut env = BTreeMap::new();
    env.insert("PORT".to_string(), "8080".to_string());

    let started = supervisor
        .start(&plan, "/srv/apps/demo/releases/r1", &env, "logs/app.log")
        .await
        .unwrap();
    let pid = started.pid().unwrap();
    assert!(fake.is_running(pid));
    supervisor.verify_alive(pid).await.unwrap();
    assert!(fake
        .file_contents("/srv/apps/demo/releases/r1/logs/app.log")
        .is_some());
    assert!(fake
        .commands()
        .iter()
        .any(|c| c.contains("PORT=8080 nohup java -Xmx256m -jar app.jar")));

    let processes = supervisor.list_processes(Some("app.jar")).await.unwrap();
    assert_eq!(processes.len(), 1);
    assert_eq!(processes[0].pid, pid);
}

#[tokio::test]
async fn test_restart_replaces_the_running_process() {
    let fake = FakeHost::new();
    fake.mkdir_all("/srv/apps/demo/releases/r2/logs");
    let session = session(&fake).await;
    let options = SupervisorOptions {
        settle_delay: Duration::ZERO,
        verify_delay: Duration::ZERO,
    };
    let supervisor = Supervisor::new(session.as_ref(), &options);
    let plan = LaunchPlan::Jar {
        jar: "app.jar".to_string(),
        java_opts: vec![],
        args: vec![],
    };
    let old = fake.spawn_process("java -jar app.jar", "/srv/apps/demo/releases/r1");

    let (stopped, started) = supervisor
        .restart(
            &StopTarget::Pid(old),
            &plan,
            "/srv/apps/demo/releases/r2",
            &BTreeMap::new(),
            "logs/app.log",
        )
        .await
        .unwrap();
    assert_eq!(stopped, StopOutcome::Stopped);
    let new = started.pid().unwrap();
    assert_ne!(new, old);
    assert!(!fake.is_running(old));
    assert!(fake.is_running(new));

    // a stale pid still restarts
    let (stopped, started) = supervisor
        .restart(
            &StopTarget::Pid(old),
            &plan,
            "/srv/apps/demo/releases/r2",
            &BTreeMap::new(),
            "logs/app.log",
        )
        .await
        .unwrap();
    assert_eq!(stopped, StopOutcome::NotRunning);
    assert!(started.pid().is_some());
}
