//! Bearer token middleware

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::errors::OrchestratorError;
use crate::server::state::ServerState;

/// Accepted bearer tokens, kept as digests
pub struct TokenPolicy {
    digests: Vec<[u8; 32]>,
}

impl TokenPolicy {
    pub fn new(tokens: &[SecretString]) -> Self {
        let digests: Vec<[u8; 32]> = tokens
            .iter()
            .map(|t| digest(t.expose_secret()))
            .collect();
        if digests.is_empty() {
            warn!("No api_tokens configured; any non-empty bearer token is accepted");
        }
        Self { digests }
    }

    /// Any non-empty token passes
    pub fn open() -> Self {
        Self::new(&[])
    }

    pub fn is_open(&self) -> bool {
        self.digests.is_empty()
    }

    /// Check an `Authorization` header value
    pub fn check(&self, header: Option<&str>) -> Result<(), OrchestratorError> {
        let token = header
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(OrchestratorError::Unauthorized)?;
        if self.is_open() {
            return Ok(());
        }
        let presented = digest(token);
        if self.digests.iter().any(|d| *d == presented) {
            Ok(())
        } else {
            Err(OrchestratorError::Forbidden)
        }
    }
}

fn digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

/// Reject requests without an accepted bearer token
pub async fn require_bearer(
    State(state): State<Arc<ServerState>>,
    request: Request,
    next: Next,
) -> Result<Response, OrchestratorError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if let Err(e) = state.tokens.check(header) {
        debug!("Rejected {} {}: {}", request.method(), request.uri().path(), e);
        return Err(e);
    }
    Ok(next.run(request).await)
}
