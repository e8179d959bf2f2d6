//! HTTP request handlers

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use tracing::error;

use api_models::models::{
    ControlStartRequest, ControlStopRequest, DeployRequest, DeployResponse, DeploymentView,
    HealthResponse, LogsQuery, ProcessQuery, RollbackResponse, SshTestRequest,
    TargetCredentialsRequest, VersionResponse,
};

use crate::errors::OrchestratorError;
use crate::remote::probe::{probe_many, probe_one, ProbeOptions, DEFAULT_TIMEOUT_MS};
use crate::server::state::ServerState;
use crate::server::views::{deployment_view, step_views, target_summary};
use crate::utils::version_info;

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "shipwright".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

/// Run a pipeline in its own task so an abandoned request still finalizes it
async fn detached<T, F>(work: F) -> Result<T, OrchestratorError>
where
    T: Send + 'static,
    F: std::future::Future<Output = Result<T, OrchestratorError>> + Send + 'static,
{
    tokio::spawn(work).await.map_err(|e| {
        error!("Pipeline task failed: {}", e);
        OrchestratorError::Internal(e.to_string())
    })?
}

// ================================ DEPLOYMENTS ==================================== //

pub async fn deploy_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<DeployRequest>,
) -> Result<Response, OrchestratorError> {
    let executor = state.executor.clone();
    let outcome = detached(async move { executor.deploy(&request).await }).await?;

    let status = match &outcome.error {
        None => StatusCode::CREATED,
        Some(e) => e.status_code(),
    };
    let body = DeployResponse {
        ok: outcome.is_success(),
        deployment_id: outcome.deployment_id,
        status: outcome.status.as_str().to_string(),
        release_path: outcome.release_path.clone(),
        error: outcome.error.as_ref().map(|e| e.to_string()),
        steps: step_views(&outcome.steps),
    };
    Ok((status, Json(body)).into_response())
}

pub async fn rollback_handler(
    State(state): State<Arc<ServerState>>,
    Path(deployment_id): Path<i64>,
) -> Response {
    let executor = state.executor.clone();
    match detached(async move { executor.rollback(deployment_id).await }).await {
        Ok(outcome) => {
            let pipeline = outcome.pipeline;
            let status = match &pipeline.error {
                None => StatusCode::OK,
                Some(e) => e.status_code(),
            };
            let body = RollbackResponse {
                ok: pipeline.is_success(),
                rollback_deployment_id: Some(pipeline.deployment_id),
                original_deployment_id: outcome.original_deployment_id,
                previous_release_path: Some(outcome.previous_release_path),
                error: pipeline.error.as_ref().map(|e| e.to_string()),
                code: pipeline.error.as_ref().map(|e| e.code().to_string()),
                steps: step_views(&pipeline.steps),
            };
            (status, Json(body)).into_response()
        }
        Err(e) => {
            let body = RollbackResponse {
                ok: false,
                rollback_deployment_id: None,
                original_deployment_id: deployment_id,
                previous_release_path: None,
                error: Some(e.to_string()),
                code: Some(e.code().to_string()),
                steps: Vec::new(),
            };
            (e.status_code(), Json(body)).into_response()
        }
    }
}

pub async fn history_handler(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Vec<DeploymentView>>, OrchestratorError> {
    let history = state.executor.store().history(state.history_limit).await?;
    Ok(Json(
        history
            .into_iter()
            .map(|(detail, steps)| deployment_view(detail, &steps))
            .collect(),
    ))
}

pub async fn deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path(deployment_id): Path<i64>,
) -> Result<Json<DeploymentView>, OrchestratorError> {
    let store = state.executor.store();
    let detail = store
        .get_deployment_detail(deployment_id)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("deployment {}", deployment_id)))?;
    let steps = store.steps(deployment_id).await?;
    Ok(Json(deployment_view(detail, &steps)))
}

// ================================== CONTROL ====================================== //

pub async fn control_start_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<ControlStartRequest>,
) -> Result<impl IntoResponse, OrchestratorError> {
    Ok(Json(state.executor.control_start(&request).await?))
}

pub async fn control_stop_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<ControlStopRequest>,
) -> Result<impl IntoResponse, OrchestratorError> {
    Ok(Json(state.executor.control_stop(&request).await?))
}

/// Streams the remote file as `text/plain`
pub async fn control_logs_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<LogsQuery>,
) -> Result<Response, OrchestratorError> {
    let tail = state.executor.tail_logs(&query).await?;
    let chunks = tail.into_stream().map(Ok::<_, Infallible>);
    Response::builder()
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from_stream(chunks))
        .map_err(|e| OrchestratorError::Internal(e.to_string()))
}

// ================================== TARGETS ====================================== //

pub async fn test_ssh_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<SshTestRequest>,
) -> Response {
    let connector = state.executor.connector();
    match request {
        SshTestRequest::Single(target) => {
            let options = ProbeOptions::new(target.timeout.unwrap_or(DEFAULT_TIMEOUT_MS), 0);
            Json(probe_one(connector, &target, &options).await).into_response()
        }
        SshTestRequest::Batch(batch) => {
            let options = ProbeOptions::new(batch.timeout_ms, batch.retries);
            Json(probe_many(connector, &batch.targets, &options, batch.concurrency).await)
                .into_response()
        }
    }
}

pub async fn processes_handler(
    State(state): State<Arc<ServerState>>,
    Path(target_id): Path<i64>,
    Query(query): Query<ProcessQuery>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let filter = query.filter.as_deref().filter(|f| !f.is_empty());
    Ok(Json(state.executor.list_processes(target_id, filter).await?))
}

pub async fn set_credentials_handler(
    State(state): State<Arc<ServerState>>,
    Path(target_id): Path<i64>,
    Json(request): Json<TargetCredentialsRequest>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let target = state.executor.set_credentials(target_id, &request).await?;
    Ok(Json(target_summary(&target)))
}

pub async fn clear_credentials_handler(
    State(state): State<Arc<ServerState>>,
    Path(target_id): Path<i64>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let target = state.executor.clear_credentials(target_id).await?;
    Ok(Json(target_summary(&target)))
}
