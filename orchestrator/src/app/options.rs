//! Application configuration options

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;

use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;

/// Main application options
#[derive(Debug)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage configuration
    pub storage: StorageOptions,

    /// Server configuration
    pub server: ServerOptions,

    /// Remote shell timeouts
    pub remote: RemoteOptions,

    /// Process supervision delays
    pub supervisor: SupervisorOptions,

    /// Vault key material
    pub encryption_key: Option<SecretString>,

    /// Accepted bearer tokens
    pub api_tokens: Vec<SecretString>,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            storage: StorageOptions::default(),
            server: ServerOptions::default(),
            remote: RemoteOptions::default(),
            supervisor: SupervisorOptions::default(),
            encryption_key: None,
            api_tokens: Vec::new(),
        }
    }
}

impl AppOptions {
    /// Build options from a settings file loaded under `layout`
    pub fn from_settings(settings: &Settings, layout: StorageLayout) -> Self {
        let base_dir = layout.base_dir.clone();
        Self {
            lifecycle: LifecycleOptions {
                target_lock_wait: Duration::from_secs(settings.target_lock_wait_secs),
                rollback_search_limit: settings.rollback_search_limit.max(1),
                ..Default::default()
            },
            storage: StorageOptions {
                database_path: Settings::resolve_path(&base_dir, &settings.database_path),
                staging_dir: Settings::resolve_path(&base_dir, &settings.staging_dir),
                layout,
            },
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            remote: RemoteOptions {
                connect_timeout: Duration::from_secs(settings.ssh.connect_timeout_secs),
                command_timeout: Duration::from_secs(settings.ssh.command_timeout_secs),
                transfer_timeout: Duration::from_secs(settings.ssh.transfer_timeout_secs),
            },
            supervisor: SupervisorOptions {
                settle_delay: Duration::from_millis(settings.supervisor.settle_delay_ms),
                verify_delay: Duration::from_millis(settings.supervisor.verify_delay_ms),
            },
            encryption_key: settings
                .resolved_encryption_key()
                .map(SecretString::from),
            api_tokens: settings
                .api_tokens
                .iter()
                .filter(|t| !t.trim().is_empty())
                .map(|t| SecretString::from(t.clone()))
                .collect(),
        }
    }
}

/// Lifecycle options for the orchestrator
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,

    /// How long a pipeline waits for the target lock
    pub target_lock_wait: Duration,

    /// Recent successes searched for a previous release
    pub rollback_search_limit: i64,

    /// Deployments returned by the history endpoint
    pub history_limit: i64,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
            target_lock_wait: Duration::from_secs(30),
            rollback_search_limit: 5,
            history_limit: 50,
        }
    }
}

/// Storage configuration options
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Storage layout paths
    pub layout: StorageLayout,

    /// SQLite database file
    pub database_path: PathBuf,

    /// Artifact staging directory
    pub staging_dir: PathBuf,
}

impl StorageOptions {
    pub fn under(base_dir: &Path) -> Self {
        Self {
            layout: StorageLayout::new(base_dir),
            database_path: base_dir.join("shipwright.db"),
            staging_dir: base_dir.join("staging"),
        }
    }
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self::under(&StorageLayout::default().base_dir)
    }
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8680,
        }
    }
}

/// Remote shell timeouts
#[derive(Debug, Clone)]
pub struct RemoteOptions {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub transfer_timeout: Duration,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(60),
            transfer_timeout: Duration::from_secs(600),
        }
    }
}

/// Process supervision delays
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Pause between stop and start
    pub settle_delay: Duration,

    /// Pause before checking a started process is alive
    pub verify_delay: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(1),
            verify_delay: Duration::from_secs(2),
        }
    }
}
