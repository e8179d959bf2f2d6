//! Server state

use std::sync::Arc;

use crate::deploy::executor::DeploymentExecutor;
use crate::server::auth::TokenPolicy;

/// Server state shared across handlers
pub struct ServerState {
    pub executor: Arc<DeploymentExecutor>,
    pub tokens: TokenPolicy,
    pub history_limit: i64,
}

impl ServerState {
    pub fn new(executor: Arc<DeploymentExecutor>, tokens: TokenPolicy, history_limit: i64) -> Self {
        Self {
            executor,
            tokens,
            history_limit,
        }
    }
}
