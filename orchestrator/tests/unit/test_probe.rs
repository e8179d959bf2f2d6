//! SSH reachability probes against the in-memory host

use std::time::Duration;

use api_models::models::SshTestTarget;

use shipwright::remote::fake::FakeHost;
use shipwright::remote::probe::{probe_many, probe_one, ProbeOptions};
use shipwright::utils::Backoff;

fn target(host: &str) -> SshTestTarget {
    SshTestTarget {
        host: host.to_string(),
        ssh_user: "deploy".to_string(),
        ssh_port: 22,
        auth_type: "password".to_string(),
        password: Some("hunter2".to_string()),
        private_key: None,
        passphrase: None,
        timeout: None,
    }
}

fn options(retries: u32) -> ProbeOptions {
    ProbeOptions {
        timeout: Duration::from_secs(1),
        retries,
        backoff: Backoff {
            base: Duration::from_millis(1),
            max: Duration::from_millis(2),
            factor: 2,
        },
    }
}

#[tokio::test]
async fn test_reachable_host_reports_latency() {
    let fake = FakeHost::new();
    let result = probe_one(&fake, &target("10.0.0.5"), &options(0)).await;
    assert!(result.ok, "{:?}", result);
    assert!(result.latency_ms.is_some());
    assert_eq!(result.error_kind, None);
    assert_eq!(fake.open_sessions(), 0);
}

#[tokio::test]
async fn test_auth_failure_is_not_retried() {
    let fake = FakeHost::new();
    fake.reject_auth(true);
    let result = probe_one(&fake, &target("10.0.0.5"), &options(3)).await;
    assert!(!result.ok);
    assert_eq!(result.error_kind.as_deref(), Some("auth"));
    assert_eq!(fake.connect_attempts("10.0.0.5"), 1);
}

#[tokio::test]
async fn test_timeouts_are_retried() {
    let fake = FakeHost::new();
    fake.set_timeout("10.0.0.9");
    let result = probe_one(&fake, &target("10.0.0.9"), &options(2)).await;
    assert_eq!(result.error_kind.as_deref(), Some("timeout"));
    assert_eq!(fake.connect_attempts("10.0.0.9"), 3);
}

#[tokio::test]
async fn test_empty_private_key_is_an_auth_error() {
    let fake = FakeHost::new();
    let mut t = target("10.0.0.5");
    t.auth_type = "key".to_string();
    t.password = None;
    t.private_key = Some(String::new());

    let result = probe_one(&fake, &t, &options(0)).await;
    assert!(!result.ok);
    assert_eq!(result.error_kind.as_deref(), Some("auth"));
    assert_eq!(fake.connect_attempts("10.0.0.5"), 0);
}

#[tokio::test]
async fn test_invalid_input_is_rejected_before_connecting() {
    let fake = FakeHost::new();
    let mut t = target("  ");
    let result = probe_one(&fake, &t, &options(0)).await;
    assert_eq!(result.error_kind.as_deref(), Some("invalid"));

    t.host = "10.0.0.5".to_string();
    t.ssh_port = 70_000;
    let result = probe_one(&fake, &t, &options(0)).await;
    assert_eq!(result.error_kind.as_deref(), Some("invalid"));
    assert_eq!(fake.connect_attempts("10.0.0.5"), 0);
}

#[tokio::test]
async fn test_batch_keeps_order_and_summarises() {
    let fake = FakeHost::new();
    fake.set_unreachable("10.0.0.2").set_timeout("10.0.0.3");
    let targets = vec![target("10.0.0.1"), target("10.0.0.2"), target("10.0.0.3")];

    let batch = probe_many(&fake, &targets, &options(0), 2).await;
    let hosts: Vec<&str> = batch.results.iter().map(|r| r.host.as_str()).collect();
    assert_eq!(hosts, ["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    assert_eq!(batch.results[1].error_kind.as_deref(), Some("unreachable"));
    assert_eq!(batch.results[2].error_kind.as_deref(), Some("timeout"));
    assert_eq!(batch.summary.total, 3);
    assert_eq!(batch.summary.success, 1);
    assert_eq!(batch.summary.failed, 2);
}

#[test]
fn test_defaults() {
    let opts = ProbeOptions::default();
    assert_eq!(opts.timeout, Duration::from_millis(6000));
    assert_eq!(opts.retries, 0);
}
