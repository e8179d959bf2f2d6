//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::OrchestratorError;
use crate::server::auth::require_bearer;
use crate::server::handlers::{
    clear_credentials_handler, control_logs_handler, control_start_handler, control_stop_handler,
    deploy_handler, deployment_handler, health_handler, history_handler, processes_handler,
    rollback_handler, set_credentials_handler, test_ssh_handler, version_handler,
};
use crate::server::state::ServerState;

/// Build the router; everything except health and version requires a bearer token
pub fn router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        // Deployments
        .route("/deployments", post(deploy_handler))
        .route("/deployments/history", get(history_handler))
        .route("/deployments/{id}", get(deployment_handler))
        .route("/deployments/{id}/rollback", post(rollback_handler))
        // Process control
        .route("/control/start", post(control_start_handler))
        .route("/control/stop", post(control_stop_handler))
        .route("/control/logs", get(control_logs_handler))
        // Targets
        .route("/targets/test-ssh", post(test_ssh_handler))
        .route("/targets/{id}/processes", get(processes_handler))
        .route(
            "/targets/{id}/credentials",
            put(set_credentials_handler).delete(clear_credentials_handler),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .merge(protected)
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), OrchestratorError>>, OrchestratorError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| OrchestratorError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| OrchestratorError::ServerError(e.to_string()))
    });

    Ok(handle)
}
