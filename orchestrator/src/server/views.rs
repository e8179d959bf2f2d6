//! Store records to response bodies

use api_models::models::{DeploymentView, StepView, TargetSummary};

use crate::store::{DeploymentDetailRecord, StepRecord, TargetRecord};

pub fn step_view(step: &StepRecord) -> StepView {
    StepView {
        key: step.key.clone(),
        label: step.label.clone(),
        ok: step.ok,
        log: step.log.clone(),
        created_at: step.created_at,
    }
}

pub fn step_views(steps: &[StepRecord]) -> Vec<StepView> {
    steps.iter().map(step_view).collect()
}

pub fn deployment_view(detail: DeploymentDetailRecord, steps: &[StepRecord]) -> DeploymentView {
    let d = detail.deployment;
    DeploymentView {
        id: d.id,
        kind: d.kind,
        rollback_of: d.rollback_of,
        status: d.status,
        started_at: d.started_at,
        finished_at: d.finished_at,
        error: d.error,
        release_path: d.release_path,
        current_link: d.current_link,
        system_id: d.system_id,
        project_id: d.project_id,
        project_name: detail.project_name,
        package_id: d.package_id,
        package_name: detail.package_name,
        target_id: d.target_id,
        target_name: detail.target_name,
        steps: step_views(steps),
    }
}

/// Target without credential material
pub fn target_summary(target: &TargetRecord) -> TargetSummary {
    TargetSummary {
        id: target.id,
        name: target.name.clone(),
        host: target.host.clone(),
        ssh_user: target.ssh_user.clone(),
        ssh_port: u16::try_from(target.ssh_port).unwrap_or_default(),
        root_path: target.root_path.clone(),
        env: target.env.clone(),
        auth_type: target.auth_type.clone(),
        has_password: target.has_password,
        has_private_key: target.has_private_key,
    }
}
