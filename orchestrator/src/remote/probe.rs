//! SSH reachability probes

use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tracing::debug;

use api_models::models::{SshBatchResponse, SshTestResult, SshTestSummary, SshTestTarget};

use crate::errors::ConnectError;
use crate::remote::command::RemoteCommand;
use crate::remote::credential::credential_from_plain;
use crate::remote::session::{ConnectParams, RemoteConnector};
use crate::utils::Backoff;

pub const DEFAULT_TIMEOUT_MS: u64 = 6000;
pub const MIN_TIMEOUT_MS: u64 = 1000;
pub const MAX_TIMEOUT_MS: u64 = 30_000;
pub const MAX_CONCURRENCY: usize = 10;
pub const MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub timeout: Duration,
    pub retries: u32,
    pub backoff: Backoff,
}

impl ProbeOptions {
    /// Clamp caller-supplied values into supported ranges
    pub fn new(timeout_ms: u64, retries: u32) -> Self {
        Self {
            timeout: Duration::from_millis(timeout_ms.clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS)),
            retries: retries.min(MAX_RETRIES),
            backoff: Backoff::default(),
        }
    }
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT_MS, 0)
    }
}

fn failed(host: &str, error: String, kind: &str) -> SshTestResult {
    SshTestResult {
        host: host.to_string(),
        ok: false,
        latency_ms: None,
        error: Some(error),
        error_kind: Some(kind.to_string()),
    }
}

/// Probe one host. Retries stop early on authentication errors.
pub async fn probe_one(
    connector: &dyn RemoteConnector,
    target: &SshTestTarget,
    options: &ProbeOptions,
) -> SshTestResult {
    let host = target.host.trim();
    if host.is_empty() {
        return failed(host, "host is required".to_string(), "invalid");
    }
    let port = match u16::try_from(target.ssh_port) {
        Ok(port) if port > 0 => port,
        _ => {
            return failed(
                host,
                format!("invalid ssh port {}", target.ssh_port),
                "invalid",
            )
        }
    };

    let credential = match credential_from_plain(
        &target.auth_type,
        target.password.as_deref(),
        target.private_key.as_deref(),
        target.passphrase.as_deref(),
    ) {
        Ok(credential) => credential,
        Err(e) => return failed(host, e.to_string(), e.kind()),
    };

    let mut last_error: Option<ConnectError> = None;
    for attempt in 0..=options.retries {
        if attempt > 0 {
            tokio::time::sleep(options.backoff.delay(attempt - 1)).await;
        }

        let params = ConnectParams {
            host: host.to_string(),
            port,
            user: target.ssh_user.clone(),
            credential: credential.duplicate(),
            timeout: options.timeout,
        };
        let started = Instant::now();
        match connector.connect(&params).await {
            Ok(session) => {
                let echo = session.run(&RemoteCommand::new("echo").arg("ok")).await;
                session.close().await;
                return match echo {
                    Ok(out) if out.success() => SshTestResult {
                        host: host.to_string(),
                        ok: true,
                        latency_ms: Some(started.elapsed().as_millis() as u64),
                        error: None,
                        error_kind: None,
                    },
                    Ok(out) => failed(
                        host,
                        format!("shell check exited with {}", out.exit_code),
                        "unreachable",
                    ),
                    Err(e) => failed(host, e.to_string(), "unreachable"),
                };
            }
            Err(e) => {
                debug!("Probe of {} attempt {} failed: {}", host, attempt + 1, e);
                let stop = e.is_auth();
                last_error = Some(e);
                if stop {
                    break;
                }
            }
        }
    }

    match last_error {
        Some(e) => failed(host, e.to_string(), e.kind()),
        None => failed(host, "probe did not run".to_string(), "unreachable"),
    }
}

/// Probe many hosts with bounded concurrency; results keep request order
pub async fn probe_many(
    connector: &dyn RemoteConnector,
    targets: &[SshTestTarget],
    options: &ProbeOptions,
    concurrency: usize,
) -> SshBatchResponse {
    let concurrency = concurrency.clamp(1, MAX_CONCURRENCY);
    let probes: Vec<_> = targets
        .iter()
        .map(|target| probe_one(connector, target, options))
        .collect();
    let results: Vec<SshTestResult> = stream::iter(probes)
    .buffered(concurrency)
    .collect()
    .await;

    let success = results.iter().filter(|r| r.ok).count();
    SshBatchResponse {
        summary: SshTestSummary {
            total: results.len(),
            success,
            failed: results.len() - success,
        },
        results,
    }
}
