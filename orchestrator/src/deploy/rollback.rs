//! Rollback engine
//!
//! Re-points `current` at the release of an earlier successful deployment and
//! restarts the application from it. Every rollback is recorded as a new
//! deployment row (`kind = rollback`, `rollback_of = <original>`); the original
//! row is never modified.

use std::collections::BTreeMap;

use tracing::info;

use crate::deploy::executor::{
    activation_log, stop_target_for, verify_activation, Activated, DeploymentExecutor,
    PipelineOutcome,
};
use crate::deploy::fsm::DeploymentStatus;
use crate::deploy::steps::StepRecorder;
use crate::errors::{OrchestratorError, RollbackError};
use crate::release::{ArtifactKind, ReleaseLayout, ReleaseManager};
use crate::remote::credential::resolve_target_credential;
use crate::remote::session::RemoteSession;
use crate::store::{
    DeploymentKind, DeploymentRecord, NewDeployment, PackageRecord, ProjectRecord, TargetRecord,
};
use crate::supervisor::{LaunchPlan, StopOutcome, Supervisor, APP_LOG};

/// Outcome of a rollback that got as far as creating its record
#[derive(Debug)]
pub struct RollbackOutcome {
    pub original_deployment_id: i64,
    pub previous_release_path: String,
    pub pipeline: PipelineOutcome,
}

struct RollbackContext {
    original: DeploymentRecord,
    from_release: String,
    project: ProjectRecord,
    target: TargetRecord,
    previous: DeploymentRecord,
    previous_release: String,
    previous_package: PackageRecord,
    running: Option<(DeploymentRecord, PackageRecord)>,
}

impl DeploymentExecutor {
    /// Roll back from a successful deployment to the release before it.
    ///
    /// A missing or non-successful original, or no earlier release, is
    /// returned as an error without creating a record.
    pub async fn rollback(&self, deployment_id: i64) -> Result<RollbackOutcome, OrchestratorError> {
        let original = self
            .store
            .get_deployment(deployment_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("deployment {}", deployment_id)))?;
        check_rollbackable(&original)?;

        let _guard = self
            .locks
            .acquire(original.target_id, self.settings.lock_wait)
            .await?;
        let ctx = self.load_rollback_context(original).await?;

        let rollback_id = self
            .store
            .create_deployment(&NewDeployment {
                kind: DeploymentKind::Rollback,
                rollback_of: Some(ctx.original.id),
                system_id: ctx.original.system_id,
                project_id: ctx.project.id,
                package_id: ctx.previous_package.id,
                target_id: ctx.target.id,
            })
            .await?;
        info!(
            "Rollback {} started: deployment {} from {} to {}",
            rollback_id, ctx.original.id, ctx.from_release, ctx.previous_release
        );

        let mut recorder = StepRecorder::new(&self.store, rollback_id);
        let mut session: Option<Box<dyn RemoteSession>> = None;
        let result = self.rollback_pipeline(&mut recorder, &ctx, &mut session).await;
        if let Some(session) = session.take() {
            session.close().await;
        }

        let pipeline = self.finalize(recorder, result).await;
        Ok(RollbackOutcome {
            original_deployment_id: ctx.original.id,
            previous_release_path: ctx.previous_release,
            pipeline,
        })
    }

    async fn load_rollback_context(
        &self,
        original: DeploymentRecord,
    ) -> Result<RollbackContext, OrchestratorError> {
        let from_release = original.release_path.clone().unwrap_or_default();
        let project = self
            .store
            .get_project(original.project_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("project {}", original.project_id)))?;
        let target = self
            .store
            .get_target(original.target_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("target {}", original.target_id)))?;

        let recent = self
            .store
            .recent_successes(project.id, target.id, self.settings.rollback_search_limit)
            .await?;
        let previous = select_previous(&recent, &original)
            .cloned()
            .ok_or_else(|| RollbackError::NoPreviousRelease(from_release.clone()))?;
        let previous_release = previous.release_path.clone().unwrap_or_default();
        let previous_package = self
            .store
            .get_package(previous.package_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("package {}", previous.package_id)))?;

        let running = self.running_deployment(project.id, target.id).await?;
        Ok(RollbackContext {
            original,
            from_release,
            project,
            target,
            previous,
            previous_release,
            previous_package,
            running,
        })
    }

    async fn rollback_pipeline(
        &self,
        recorder: &mut StepRecorder<'_>,
        ctx: &RollbackContext,
        session_slot: &mut Option<Box<dyn RemoteSession>>,
    ) -> Result<Activated, OrchestratorError> {
        let rollback_id = recorder.deployment_id();
        let release_dir = ctx.previous_release.as_str();

        let (layout, credential) = recorder
            .step("validate", "Select previous release", async {
                let layout = ReleaseLayout::new(&ctx.target.root_path, &ctx.project.name)?;
                let credential = resolve_target_credential(self.vault()?, &ctx.target)?;
                let log = format!(
                    "rolling back deployment {} from {} to {} (deployment {}, {})",
                    ctx.original.id,
                    ctx.from_release,
                    release_dir,
                    ctx.previous.id,
                    ctx.previous_package.name
                );
                Ok(((layout, credential), log))
            })
            .await?;

        let session = self.connect_step(recorder, &ctx.target, credential).await?;
        let session: &dyn RemoteSession = &**session_slot.insert(session);
        let releases = ReleaseManager::new(session);
        let supervisor = Supervisor::new(session, &self.settings.supervisor);

        recorder
            .step("verify_release", "Verify previous release", async {
                if !releases.release_exists(release_dir).await? {
                    return Err(RollbackError::ReleaseMissing(release_dir.to_string()).into());
                }
                Ok(((), format!("{} present", release_dir)))
            })
            .await?;

        let stop = stop_target_for(&ctx.project, ctx.running.as_ref());
        recorder
            .step("stop", "Stop running application", async {
                let stopped = supervisor.stop(&stop).await?;
                if stopped == StopOutcome::Stopped {
                    supervisor.settle().await;
                }
                Ok(((), format!("{:?}: {}", stop, stopped.as_str())))
            })
            .await?;

        let current_link = layout.current_link();
        recorder
            .step("symlink", "Activate previous release", async {
                let mode = releases.activate(&layout, release_dir).await?;
                Ok(((), activation_log(&current_link, release_dir, mode)))
            })
            .await?;

        let plan = LaunchPlan::resolve(
            &ctx.project,
            &ctx.previous_package.name,
            ArtifactKind::detect(&ctx.previous_package.name),
        );
        let started = recorder
            .step("start", "Start application", async {
                let started = supervisor
                    .start(&plan, release_dir, &BTreeMap::new(), APP_LOG)
                    .await?;
                if let Some(pid) = started.pid() {
                    self.store.set_deployment_pid(rollback_id, pid).await?;
                }
                let log = started.describe();
                Ok((started, log))
            })
            .await?;

        recorder
            .step("verify", "Verify rollback", async {
                let log =
                    verify_activation(&releases, &supervisor, &layout, release_dir, started.pid())
                        .await?;
                Ok(((), log))
            })
            .await?;

        Ok(Activated {
            release_dir: release_dir.to_string(),
            current_link,
        })
    }
}

fn check_rollbackable(original: &DeploymentRecord) -> Result<(), RollbackError> {
    let not_rollbackable = |reason: String| RollbackError::NotRollbackable {
        id: original.id,
        reason,
    };
    if original.status != DeploymentStatus::Success.as_str() {
        return Err(not_rollbackable(format!("status is {}", original.status)));
    }
    if original.release_path.is_none() || original.current_link.is_none() {
        return Err(not_rollbackable("no release path recorded".to_string()));
    }
    Ok(())
}

/// First successful deployment, newest first, whose release differs from the original's
fn select_previous<'a>(
    recent: &'a [DeploymentRecord],
    original: &DeploymentRecord,
) -> Option<&'a DeploymentRecord> {
    recent.iter().find(|d| {
        d.id != original.id && d.release_path.is_some() && d.release_path != original.release_path
    })
}
