//! Error types for the orchestrator

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use api_models::models::ErrorResponse;

/// Credential vault failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption key is not configured")]
    MissingKey,

    #[error("encryption key is invalid: {0}")]
    InvalidKey(String),

    #[error("refusing to encrypt an empty secret")]
    EmptyPlaintext,

    #[error("secret failed authentication (tampered blob or wrong key)")]
    AuthenticationFailed,

    #[error("malformed secret blob: {0}")]
    InvalidFormat(String),

    #[error("unsupported secret blob version: {0}")]
    UnsupportedVersion(u64),
}

/// Failures while opening a remote session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("connection to {host} timed out")]
    Timeout { host: String },

    #[error("authentication rejected by {host}: {reason}")]
    AuthFailed { host: String, reason: String },

    #[error("host {host} unreachable: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("invalid credential: {0}")]
    InvalidCredential(String),
}

impl ConnectError {
    /// Short class name used in probe results
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectError::Timeout { .. } => "timeout",
            ConnectError::AuthFailed { .. } => "auth",
            ConnectError::Unreachable { .. } => "unreachable",
            ConnectError::InvalidCredential(_) => "auth",
        }
    }

    pub fn is_auth(&self) -> bool {
        self.kind() == "auth"
    }
}

/// Failures while running a remote command
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("command timed out after {secs}s: {command}")]
    Timeout { command: String, secs: u64 },

    #[error("command `{command}` exited with {code}: {stderr}")]
    Failed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("channel error: {0}")]
    Channel(String),

    #[error("unsafe argument rejected: {0:?}")]
    UnsafeArgument(String),
}

/// Upload, staging or extraction failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("artifact not available: {0}")]
    Source(String),

    #[error("checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("extraction failed: {0}")]
    Extract(String),

    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Failures switching the `current` link
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActivationError {
    #[error("activation failed: {0}")]
    Failed(String),

    /// The old link was removed but the new one could not be created
    #[error("current link {link} is missing after a failed switch: {reason}")]
    LinkMissing { link: String, reason: String },
}

/// Start or stop failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessControlError {
    #[error("start failed: {0}")]
    StartFailed(String),

    #[error("stop failed: {0}")]
    StopFailed(String),

    #[error("process {pid} is not running after start")]
    NotAlive { pid: u32 },

    #[error(transparent)]
    Command(#[from] CommandError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RollbackError {
    #[error("no previous successful release differs from {0}")]
    NoPreviousRelease(String),

    #[error("previous release {0} no longer exists on the target")]
    ReleaseMissing(String),

    #[error("deployment {id} cannot be rolled back: {reason}")]
    NotRollbackable { id: i64, reason: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("deployment {0} is already finalized")]
    AlreadyFinalized(i64),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Activation(#[from] ActivationError),

    #[error(transparent)]
    Process(#[from] ProcessControlError),

    #[error(transparent)]
    Rollback(#[from] RollbackError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("target {0} is busy with another deployment")]
    TargetBusy(i64),

    #[error("missing or malformed bearer token")]
    Unauthorized,

    #[error("bearer token not accepted")]
    Forbidden,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for OrchestratorError {
    fn from(err: sqlx::Error) -> Self {
        OrchestratorError::Store(StoreError::Database(err))
    }
}

/// Coarse failure class an error maps onto
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Validation,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    Crypto,
    Remote,
    Internal,
}

impl OrchestratorError {
    pub fn class(&self) -> FailureClass {
        match self {
            OrchestratorError::ValidationError(_)
            | OrchestratorError::JsonError(_)
            | OrchestratorError::Rollback(RollbackError::NoPreviousRelease(_))
            | OrchestratorError::Rollback(RollbackError::NotRollbackable { .. }) => {
                FailureClass::Validation
            }
            OrchestratorError::Command(CommandError::UnsafeArgument(_)) => FailureClass::Validation,
            OrchestratorError::Unauthorized => FailureClass::Unauthorized,
            OrchestratorError::Forbidden => FailureClass::Forbidden,
            OrchestratorError::NotFound(_) => FailureClass::NotFound,
            OrchestratorError::TargetBusy(_)
            | OrchestratorError::Rollback(RollbackError::ReleaseMissing(_))
            | OrchestratorError::Store(StoreError::AlreadyFinalized(_)) => FailureClass::Conflict,
            OrchestratorError::Crypto(_) => FailureClass::Crypto,
            OrchestratorError::Connect(_)
            | OrchestratorError::Command(_)
            | OrchestratorError::Transfer(_)
            | OrchestratorError::Activation(_)
            | OrchestratorError::Process(_) => FailureClass::Remote,
            _ => FailureClass::Internal,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.class() {
            FailureClass::Validation => StatusCode::BAD_REQUEST,
            FailureClass::Unauthorized => StatusCode::UNAUTHORIZED,
            FailureClass::Forbidden => StatusCode::FORBIDDEN,
            FailureClass::NotFound => StatusCode::NOT_FOUND,
            FailureClass::Conflict => StatusCode::CONFLICT,
            FailureClass::Crypto | FailureClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            FailureClass::Remote => StatusCode::BAD_GATEWAY,
        }
    }

    /// Stable machine-readable code for response bodies
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::Crypto(_) => "crypto_error",
            OrchestratorError::Connect(_) => "connect_error",
            OrchestratorError::Command(CommandError::UnsafeArgument(_)) => "unsafe_argument",
            OrchestratorError::Command(_) => "command_error",
            OrchestratorError::Transfer(_) => "transfer_error",
            OrchestratorError::Activation(ActivationError::LinkMissing { .. }) => "link_missing",
            OrchestratorError::Activation(_) => "activation_error",
            OrchestratorError::Process(_) => "process_control_error",
            OrchestratorError::Rollback(RollbackError::NoPreviousRelease(_)) => {
                "no_previous_release"
            }
            OrchestratorError::Rollback(RollbackError::ReleaseMissing(_)) => "release_missing",
            OrchestratorError::Rollback(RollbackError::NotRollbackable { .. }) => {
                "not_rollbackable"
            }
            OrchestratorError::Store(StoreError::AlreadyFinalized(_)) => "already_finalized",
            OrchestratorError::Store(_) => "store_error",
            OrchestratorError::ValidationError(_) | OrchestratorError::JsonError(_) => {
                "validation_error"
            }
            OrchestratorError::NotFound(_) => "not_found",
            OrchestratorError::TargetBusy(_) => "target_busy",
            OrchestratorError::Unauthorized => "unauthorized",
            OrchestratorError::Forbidden => "forbidden",
            _ => "internal_error",
        }
    }
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            ok: false,
            error: self.to_string(),
            code: self.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}
