//! Deployment executor
//!
//! Runs the deploy pipeline against one target:
//!
//! ```text
//! validate -> connect -> mkdirs -> upload -> extract -> symlink -> start -> verify
//! ```
//!
//! Each stage appends one step. The first failure ends the pipeline and the
//! record is finalized `failed`; the remote session is closed on every path.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use api_models::models::DeployRequest;

use crate::app::options::{AppOptions, SupervisorOptions};
use crate::deploy::fsm::DeploymentStatus;
use crate::deploy::locks::TargetLocks;
use crate::deploy::steps::StepRecorder;
use crate::errors::{ActivationError, CryptoError, OrchestratorError};
use crate::filesys::staging::{ArtifactStager, StagedArtifact};
use crate::release::{check_component, ActivationMode, ArtifactKind, ReleaseLayout, ReleaseManager};
use crate::remote::credential::{resolve_target_credential, target_connect_params, valid_port};
use crate::remote::session::{Credential, RemoteConnector, RemoteSession};
use crate::store::{
    DeploymentKind, DeploymentRecord, NewDeployment, PackageRecord, ProjectRecord, StepRecord,
    Store, TargetRecord,
};
use crate::supervisor::{LaunchPlan, StopTarget, Supervisor, APP_LOG};
use crate::vault::Vault;

/// Executor tuning taken from the application options
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub supervisor: SupervisorOptions,
    pub lock_wait: Duration,
    pub rollback_search_limit: i64,
}

impl ExecutorSettings {
    pub fn from_options(options: &AppOptions) -> Self {
        Self {
            connect_timeout: options.remote.connect_timeout,
            command_timeout: options.remote.command_timeout,
            supervisor: options.supervisor.clone(),
            lock_wait: options.lifecycle.target_lock_wait,
            rollback_search_limit: options.lifecycle.rollback_search_limit,
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(60),
            supervisor: SupervisorOptions::default(),
            lock_wait: Duration::from_secs(30),
            rollback_search_limit: 5,
        }
    }
}

/// Result of a pipeline that got as far as creating its record
#[derive(Debug)]
pub struct PipelineOutcome {
    pub deployment_id: i64,
    pub status: DeploymentStatus,
    pub release_path: Option<String>,
    pub current_link: Option<String>,
    pub error: Option<OrchestratorError>,
    pub steps: Vec<StepRecord>,
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        self.status == DeploymentStatus::Success
    }
}

/// What a successful pipeline activated
pub(crate) struct Activated {
    pub release_dir: String,
    pub current_link: String,
}

/// Catalog rows a deploy request resolves to
pub(crate) struct DeployContext {
    pub system_id: Option<i64>,
    pub project: ProjectRecord,
    pub package: PackageRecord,
    pub target: TargetRecord,
    /// Latest successful deployment on this project and target, with its package.
    /// Filled in once the target lock is held.
    pub running: Option<(DeploymentRecord, PackageRecord)>,
}

/// Runs deployments, rollbacks and process control against targets
pub struct DeploymentExecutor {
    pub(crate) store: Store,
    pub(crate) vault: Option<Vault>,
    pub(crate) connector: Arc<dyn RemoteConnector>,
    pub(crate) stager: ArtifactStager,
    pub(crate) locks: TargetLocks,
    pub(crate) settings: ExecutorSettings,
}

impl DeploymentExecutor {
    pub fn new(
        store: Store,
        vault: Option<Vault>,
        connector: Arc<dyn RemoteConnector>,
        stager: ArtifactStager,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            store,
            vault,
            connector,
            stager,
            locks: TargetLocks::new(),
            settings,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn connector(&self) -> &dyn RemoteConnector {
        self.connector.as_ref()
    }

    pub fn locks(&self) -> &TargetLocks {
        &self.locks
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub fn vault(&self) -> Result<&Vault, CryptoError> {
        self.vault.as_ref().ok_or(CryptoError::MissingKey)
    }

    /// Deploy a package to a target.
    ///
    /// Unknown catalog ids and a busy target are returned as errors before any
    /// record exists. Anything later is reported through the outcome.
    pub async fn deploy(&self, request: &DeployRequest) -> Result<PipelineOutcome, OrchestratorError> {
        let mut ctx = self.load_context(request).await?;
        let _guard = self
            .locks
            .acquire(ctx.target.id, self.settings.lock_wait)
            .await?;
        // read under the lock so a deploy queued behind another sees its process
        ctx.running = self.running_deployment(ctx.project.id, ctx.target.id).await?;

        let deployment_id = self
            .store
            .create_deployment(&NewDeployment {
                kind: DeploymentKind::Deploy,
                rollback_of: None,
                system_id: ctx.system_id,
                project_id: ctx.project.id,
                package_id: ctx.package.id,
                target_id: ctx.target.id,
            })
            .await?;
        info!(
            "Deployment {} started: {} / {} -> {}",
            deployment_id, ctx.project.name, ctx.package.name, ctx.target.name
        );

        let mut recorder = StepRecorder::new(&self.store, deployment_id);
        let mut session: Option<Box<dyn RemoteSession>> = None;
        let mut staged: Option<StagedArtifact> = None;

        let result = self
            .deploy_pipeline(&mut recorder, &ctx, &mut session, &mut staged)
            .await;

        if let Some(session) = session.take() {
            session.close().await;
        }
        if let Some(artifact) = staged.take() {
            self.stager.cleanup(&artifact).await;
        }

        Ok(self.finalize(recorder, result).await)
    }

    async fn load_context(&self, request: &DeployRequest) -> Result<DeployContext, OrchestratorError> {
        let project = self
            .store
            .get_project(request.project_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("project {}", request.project_id)))?;
        let package = self
            .store
            .get_package(request.package_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("package {}", request.package_id)))?;
        let target = self
            .store
            .get_target(request.target_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("target {}", request.target_id)))?;

        if package.project_id != project.id {
            return Err(OrchestratorError::ValidationError(format!(
                "package {} does not belong to project {}",
                package.id, project.id
            )));
        }

        Ok(DeployContext {
            system_id: request.system_id,
            project,
            package,
            target,
            running: None,
        })
    }

    /// Newest successful deployment for a project and target, with its package
    pub(crate) async fn running_deployment(
        &self,
        project_id: i64,
        target_id: i64,
    ) -> Result<Option<(DeploymentRecord, PackageRecord)>, OrchestratorError> {
        let Some(latest) = self
            .store
            .recent_successes(project_id, target_id, 1)
            .await?
            .into_iter()
            .next()
        else {
            return Ok(None);
        };
        Ok(self
            .store
            .get_package(latest.package_id)
            .await?
            .map(|package| (latest, package)))
    }

    async fn deploy_pipeline(
        &self,
        recorder: &mut StepRecorder<'_>,
        ctx: &DeployContext,
        session_slot: &mut Option<Box<dyn RemoteSession>>,
        staged_slot: &mut Option<StagedArtifact>,
    ) -> Result<Activated, OrchestratorError> {
        let deployment_id = recorder.deployment_id();
        let file_name = ctx.package.name.as_str();

        let (layout, kind, credential) = recorder
            .step("validate", "Validate request", async {
                let layout = ReleaseLayout::new(&ctx.target.root_path, &ctx.project.name)?;
                check_component(file_name)?;
                valid_port(ctx.target.ssh_port)?;
                let kind = ArtifactKind::detect(file_name);
                let credential = resolve_target_credential(self.vault()?, &ctx.target)?;
                let log = format!(
                    "{} ({:?}) to {}@{}:{} [{}], {} auth",
                    file_name,
                    kind,
                    ctx.target.ssh_user,
                    ctx.target.host,
                    ctx.target.ssh_port,
                    ctx.target.env,
                    credential.mode()
                );
                Ok(((layout, kind, credential), log))
            })
            .await?;

        let session = self.connect_step(recorder, &ctx.target, credential).await?;
        let session: &dyn RemoteSession = &**session_slot.insert(session);
        let releases = ReleaseManager::new(session);

        let release_dir = recorder
            .step("mkdirs", "Prepare release directories", async {
                let dir = releases.allocate(&layout).await?;
                releases.prepare_dirs(&layout, &dir).await?;
                let log = format!("created {}", dir);
                Ok((dir, log))
            })
            .await?;

        recorder
            .step("upload", "Upload artifact", async {
                let artifact: &StagedArtifact = staged_slot.insert(self.stager.stage(&ctx.package).await?);
                let bytes = releases.upload(&artifact.path, &release_dir, file_name).await?;
                let log = format!(
                    "{} -> {}/{} ({} bytes, sha256 {})",
                    ctx.package.file_url, release_dir, file_name, bytes, artifact.sha256
                );
                Ok(((), log))
            })
            .await?;

        recorder
            .step("extract", "Extract artifact", async {
                let log = releases.extract(&release_dir, file_name, kind).await?;
                Ok(((), log))
            })
            .await?;

        let current_link = layout.current_link();
        recorder
            .step("symlink", "Activate release", async {
                let mode = releases.activate(&layout, &release_dir).await?;
                Ok(((), activation_log(&current_link, &release_dir, mode)))
            })
            .await?;

        let supervisor = Supervisor::new(session, &self.settings.supervisor);
        let plan = LaunchPlan::resolve(&ctx.project, file_name, kind);
        let stop = stop_target_for(&ctx.project, ctx.running.as_ref());
        let started = recorder
            .step("start", "Start application", async {
                let (stopped, started) = supervisor
                    .restart(&stop, &plan, &release_dir, &BTreeMap::new(), APP_LOG)
                    .await?;
                if let Some(pid) = started.pid() {
                    self.store.set_deployment_pid(deployment_id, pid).await?;
                }
                let log = format!("previous process {}; {}", stopped.as_str(), started.describe());
                Ok((started, log))
            })
            .await?;

        recorder
            .step("verify", "Verify deployment", async {
                let log = verify_activation(&releases, &supervisor, &layout, &release_dir, started.pid())
                    .await?;
                Ok(((), log))
            })
            .await?;

        Ok(Activated {
            release_dir,
            current_link,
        })
    }

    /// The `connect` stage, shared by deploy and rollback
    pub(crate) async fn connect_step(
        &self,
        recorder: &mut StepRecorder<'_>,
        target: &TargetRecord,
        credential: Credential,
    ) -> Result<Box<dyn RemoteSession>, OrchestratorError> {
        recorder
            .step("connect", "Connect to target", async {
                let params = target_connect_params(target, credential, self.settings.connect_timeout)?;
                let session = self.connector.connect(&params).await?;
                let log = format!(
                    "connected to {}:{} as {}",
                    params.host, params.port, params.user
                );
                Ok((session, log))
            })
            .await
    }

    /// Single terminal write and outcome assembly
    pub(crate) async fn finalize(
        &self,
        mut recorder: StepRecorder<'_>,
        result: Result<Activated, OrchestratorError>,
    ) -> PipelineOutcome {
        let deployment_id = recorder.deployment_id();
        let (error, release_path, current_link) = match result {
            Ok(activated) => {
                match recorder
                    .complete(&activated.release_dir, &activated.current_link)
                    .await
                {
                    Ok(()) => (
                        None,
                        Some(activated.release_dir),
                        Some(activated.current_link),
                    ),
                    Err(e) => {
                        if let Err(store_err) = recorder.fail(&e).await {
                            error!("Deployment {} could not be finalized: {}", deployment_id, store_err);
                        }
                        (Some(e), None, None)
                    }
                }
            }
            Err(e) => {
                if let Err(store_err) = recorder.fail(&e).await {
                    error!("Deployment {} could not be finalized: {}", deployment_id, store_err);
                }
                (Some(e), None, None)
            }
        };

        let status = if error.is_none() {
            DeploymentStatus::Success
        } else {
            DeploymentStatus::Failed
        };
        PipelineOutcome {
            deployment_id,
            status,
            release_path,
            current_link,
            error,
            steps: recorder.into_steps(),
        }
    }
}

pub(crate) fn activation_log(current_link: &str, release_dir: &str, mode: ActivationMode) -> String {
    let how = match mode {
        ActivationMode::Atomic => "atomic rename",
        ActivationMode::RemoveThenLink => "remove then link",
    };
    format!("{} -> {} ({})", current_link, release_dir, how)
}

/// Confirm `current` resolves to the release and a background process survived
pub(crate) async fn verify_activation(
    releases: &ReleaseManager<'_>,
    supervisor: &Supervisor<'_>,
    layout: &ReleaseLayout,
    release_dir: &str,
    pid: Option<u32>,
) -> Result<String, OrchestratorError> {
    let target = releases.current_target(layout).await?;
    if target.as_deref() != Some(release_dir) {
        return Err(ActivationError::Failed(format!(
            "{} points to {}, expected {}",
            layout.current_link(),
            target.as_deref().unwrap_or("nothing"),
            release_dir
        ))
        .into());
    }
    match pid {
        Some(pid) => {
            supervisor.verify_alive(pid).await?;
            Ok(format!("current -> {}; pid {} alive", release_dir, pid))
        }
        None => Ok(format!("current -> {}", release_dir)),
    }
}

/// How to stop whatever a previous successful deployment started
pub(crate) fn stop_target_for(
    project: &ProjectRecord,
    running: Option<&(DeploymentRecord, PackageRecord)>,
) -> StopTarget {
    let Some((deployment, package)) = running else {
        return StopTarget::Nothing;
    };
    if let Some(pid) = deployment.pid.and_then(|p| u32::try_from(p).ok()) {
        return StopTarget::Pid(pid);
    }
    let plan = LaunchPlan::resolve(project, &package.name, ArtifactKind::detect(&package.name));
    match (&plan, deployment.release_path.as_ref()) {
        (
            LaunchPlan::Script {
                stop_script: Some(script),
                ..
            },
            Some(workdir),
        ) => StopTarget::Script {
            workdir: workdir.clone(),
            script: script.clone(),
        },
        _ => plan
            .match_pattern()
            .map(StopTarget::Pattern)
            .unwrap_or(StopTarget::Nothing),
    }
}
