//! Settings file management

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::OrchestratorError;
use crate::logs::LogLevel;

/// Environment variable that overrides `encryption_key`
pub const ENCRYPTION_KEY_ENV: &str = "SHIPWRIGHT_ENCRYPTION_KEY";

/// Orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON logs on stdout
    #[serde(default)]
    pub log_json: bool,

    /// Also write a daily rolling log file under `<base>/logs`
    #[serde(default)]
    pub log_to_file: bool,

    #[serde(default)]
    pub server: ServerSettings,

    /// SQLite database file; relative paths resolve against the base directory
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Vault key material (64 hex chars, base64 of 32 bytes, or a passphrase)
    #[serde(default)]
    pub encryption_key: Option<String>,

    /// Accepted bearer tokens; empty accepts any non-empty token
    #[serde(default)]
    pub api_tokens: Vec<String>,

    #[serde(default)]
    pub ssh: SshSettings,

    #[serde(default)]
    pub supervisor: SupervisorSettings,

    /// How long a request waits for another pipeline on the same target
    #[serde(default = "default_target_lock_wait")]
    pub target_lock_wait_secs: u64,

    /// How many recent successes a rollback searches
    #[serde(default = "default_rollback_search_limit")]
    pub rollback_search_limit: i64,

    /// Where downloaded artifacts are staged before upload
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("shipwright.db")
}

fn default_target_lock_wait() -> u64 {
    30
}

fn default_rollback_search_limit() -> i64 {
    5
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("staging")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_to_file: false,
            server: ServerSettings::default(),
            database_path: default_database_path(),
            encryption_key: None,
            api_tokens: Vec::new(),
            ssh: SshSettings::default(),
            supervisor: SupervisorSettings::default(),
            target_lock_wait_secs: default_target_lock_wait(),
            rollback_search_limit: default_rollback_search_limit(),
            staging_dir: default_staging_dir(),
        }
    }
}

impl Settings {
    /// Read settings from `path`; a missing file yields the defaults
    pub async fn load(path: &Path) -> Result<Self, OrchestratorError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Key material with the environment override applied
    pub fn resolved_encryption_key(&self) -> Option<String> {
        std::env::var(ENCRYPTION_KEY_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.encryption_key.clone())
    }

    /// Resolve a configured path against the base directory
    pub fn resolve_path(base_dir: &Path, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        }
    }
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8680
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

/// Remote shell timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_command_timeout() -> u64 {
    60
}

fn default_transfer_timeout() -> u64 {
    600
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
            transfer_timeout_secs: default_transfer_timeout(),
        }
    }
}

/// Process supervision delays
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSettings {
    /// Pause between stop and start
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,

    /// Pause before checking that a started process is still alive
    #[serde(default = "default_verify_delay")]
    pub verify_delay_ms: u64,
}

fn default_settle_delay() -> u64 {
    1000
}

fn default_verify_delay() -> u64 {
    2000
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay(),
            verify_delay_ms: default_verify_delay(),
        }
    }
}
