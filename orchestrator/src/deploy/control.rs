//! Direct process control, log tailing and credential rotation on a target

use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use api_models::models::{
    ControlStartRequest, ControlStartResponse, ControlStopRequest, ControlStopResponse, LogsQuery,
    ProcessInfo, TargetCredentialsRequest,
};

use crate::deploy::executor::DeploymentExecutor;
use crate::errors::{ConnectError, OrchestratorError};
use crate::remote::command::{check_path, split_words, RemoteCommand};
use crate::remote::credential::{
    credential_from_plain, resolve_target_credential, target_connect_params, AUTH_KEY,
    AUTH_PASSWORD,
};
use crate::remote::session::{Credential, RemoteSession};
use crate::store::TargetRecord;
use crate::supervisor::{LaunchPlan, StartOutcome, StopTarget, Supervisor, APP_LOG};

/// How long a followed log stays open
pub const FOLLOW_WINDOW: Duration = Duration::from_secs(300);

const LOG_CHANNEL_DEPTH: usize = 64;

/// How long a tail may stay silent before the response starts without output
const FIRST_CHUNK_WAIT: Duration = Duration::from_secs(5);

/// Output of a running tail
#[derive(Debug)]
pub struct LogTail {
    /// Already received, sent ahead of `rest`
    pub first: Option<String>,
    pub rest: mpsc::Receiver<String>,
}

impl LogTail {
    /// All chunks as one stream
    pub fn into_stream(self) -> impl Stream<Item = String> + Send {
        let rest = stream::unfold(self.rest, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        });
        stream::iter(self.first).chain(rest)
    }
}

impl DeploymentExecutor {
    async fn load_target(&self, target_id: i64) -> Result<TargetRecord, OrchestratorError> {
        self.store
            .get_target(target_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("target {}", target_id)))
    }

    /// Decrypt the target's credential and open a session to it
    pub async fn open_session(
        &self,
        target: &TargetRecord,
    ) -> Result<Box<dyn RemoteSession>, OrchestratorError> {
        let credential = resolve_target_credential(self.vault()?, target)?;
        let params = target_connect_params(target, credential, self.settings.connect_timeout)?;
        Ok(self.connector.connect(&params).await?)
    }

    pub async fn control_start(
        &self,
        request: &ControlStartRequest,
    ) -> Result<ControlStartResponse, OrchestratorError> {
        check_path(&request.workdir)?;
        let plan = match (&request.jar_path, &request.start_script) {
            (Some(jar), None) => LaunchPlan::Jar {
                jar: jar.clone(),
                java_opts: split_words(request.java_opts.as_deref()),
                args: Vec::new(),
            },
            (None, Some(script)) => LaunchPlan::Script {
                start_script: script.clone(),
                stop_script: None,
            },
            _ => {
                return Err(OrchestratorError::ValidationError(
                    "exactly one of jar_path or start_script is required".to_string(),
                ))
            }
        };
        let log_file = request.log_file.as_deref().unwrap_or(APP_LOG);

        let target = self.load_target(request.target_id).await?;
        let _guard = self.locks.acquire(target.id, self.settings.lock_wait).await?;
        let session = self.open_session(&target).await?;
        let supervisor = Supervisor::new(session.as_ref(), &self.settings.supervisor);
        let result = supervisor
            .start(&plan, &request.workdir, &request.env, log_file)
            .await;
        session.close().await;

        let started = result?;
        info!("Control start on {}: {}", target.name, started.describe());
        Ok(match started {
            StartOutcome::Background { pid, log_file } => ControlStartResponse {
                pid: Some(pid),
                status: "started".to_string(),
                log_file: Some(log_file),
            },
            StartOutcome::Script { .. } => ControlStartResponse {
                pid: None,
                status: "script_started".to_string(),
                log_file: None,
            },
            StartOutcome::NothingToStart => ControlStartResponse {
                pid: None,
                status: "nothing_to_start".to_string(),
                log_file: None,
            },
        })
    }

    pub async fn control_stop(
        &self,
        request: &ControlStopRequest,
    ) -> Result<ControlStopResponse, OrchestratorError> {
        let stop = match (
            request.pid,
            &request.workdir,
            &request.stop_script,
            &request.pattern,
        ) {
            (Some(pid), ..) => StopTarget::Pid(pid),
            (None, Some(workdir), Some(script), _) => StopTarget::Script {
                workdir: workdir.clone(),
                script: script.clone(),
            },
            (None, _, _, Some(pattern)) if !pattern.trim().is_empty() => {
                StopTarget::Pattern(pattern.clone())
            }
            _ => {
                return Err(OrchestratorError::ValidationError(
                    "pid, workdir with stop_script, or pattern is required".to_string(),
                ))
            }
        };

        let target = self.load_target(request.target_id).await?;
        let _guard = self.locks.acquire(target.id, self.settings.lock_wait).await?;
        let session = self.open_session(&target).await?;
        let result = Supervisor::new(session.as_ref(), &self.settings.supervisor)
            .stop(&stop)
            .await;
        session.close().await;

        let outcome = result?;
        info!("Control stop on {} ({:?}): {}", target.name, stop, outcome.as_str());
        Ok(ControlStopResponse {
            ok: true,
            outcome: outcome.as_str().to_string(),
        })
    }

    pub async fn list_processes(
        &self,
        target_id: i64,
        filter: Option<&str>,
    ) -> Result<Vec<ProcessInfo>, OrchestratorError> {
        let target = self.load_target(target_id).await?;
        let session = self.open_session(&target).await?;
        let result = Supervisor::new(session.as_ref(), &self.settings.supervisor)
            .list_processes(filter)
            .await;
        session.close().await;
        Ok(result?)
    }

    /// Tail a remote file. Chunks arrive on the returned channel until the
    /// file is read (or the follow window ends) and the sender is dropped.
    ///
    /// A tail that fails before producing any output, such as a missing
    /// file, is returned as an error instead of an empty stream.
    pub async fn tail_logs(&self, query: &LogsQuery) -> Result<LogTail, OrchestratorError> {
        check_path(&query.path)?;
        if !query.path.starts_with('/') {
            return Err(OrchestratorError::ValidationError(format!(
                "log path must be absolute: {}",
                query.path
            )));
        }
        let mut cmd = RemoteCommand::new("tail");
        if query.follow {
            cmd = cmd.arg("-F");
        }
        let cmd = cmd
            .arg("-n")
            .value(query.lines.max(1).to_string())
            .path(query.path.as_str());
        let window = if query.follow {
            FOLLOW_WINDOW
        } else {
            self.settings.command_timeout
        };

        let target = self.load_target(query.target_id).await?;
        let session = self.open_session(&target).await?;
        let (tx, mut rx) = mpsc::channel(LOG_CHANNEL_DEPTH);
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = session.stream(&cmd, tx, window).await;
            let host = session.host().to_string();
            session.close().await;
            // nobody is waiting once the first chunk went out
            if let Err(Err(e)) = done_tx.send(result) {
                warn!("Log stream from {} ended with error: {}", host, e);
            }
            debug!("Log stream closed");
        });

        let first = match tokio::time::timeout(FIRST_CHUNK_WAIT, rx.recv()).await {
            Ok(Some(chunk)) => Some(chunk),
            // sender dropped, so the stream already finished
            Ok(None) => {
                if let Ok(Err(e)) = done_rx.await {
                    return Err(e.into());
                }
                None
            }
            Err(_) => None,
        };
        Ok(LogTail { first, rest: rx })
    }

    /// Encrypt and store new credentials for a target
    pub async fn set_credentials(
        &self,
        target_id: i64,
        request: &TargetCredentialsRequest,
    ) -> Result<TargetRecord, OrchestratorError> {
        let credential = credential_from_plain(
            &request.auth_type,
            request.password.as_deref(),
            request.private_key.as_deref(),
            request.passphrase.as_deref(),
        )
        .map_err(|e| match e {
            ConnectError::InvalidCredential(reason) => OrchestratorError::ValidationError(reason),
            other => other.into(),
        })?;

        let vault = self.vault()?;
        let (auth_type, password, private_key, passphrase) = match &credential {
            Credential::Password(password) => (AUTH_PASSWORD, Some(vault.encrypt(password)?), None, None),
            Credential::PrivateKey { key, passphrase } => (
                AUTH_KEY,
                None,
                Some(vault.encrypt(key)?),
                vault.encrypt_optional(passphrase.as_ref())?,
            ),
        };

        if !self
            .store
            .set_target_credentials(target_id, auth_type, password, private_key, passphrase)
            .await?
        {
            return Err(OrchestratorError::NotFound(format!("target {}", target_id)));
        }
        info!("Credentials for target {} rotated ({})", target_id, auth_type);
        self.load_target(target_id).await
    }

    pub async fn clear_credentials(&self, target_id: i64) -> Result<TargetRecord, OrchestratorError> {
        if !self.store.clear_target_credentials(target_id).await? {
            return Err(OrchestratorError::NotFound(format!("target {}", target_id)));
        }
        info!("Credentials for target {} cleared", target_id);
        self.load_target(target_id).await
    }
}
