//! Application state management

use std::sync::Arc;

use secrecy::ExposeSecret;
use tracing::{info, warn};

use crate::app::options::AppOptions;
use crate::deploy::executor::{DeploymentExecutor, ExecutorSettings};
use crate::errors::OrchestratorError;
use crate::filesys::staging::ArtifactStager;
use crate::remote::session::RemoteConnector;
use crate::store::Store;
use crate::vault::Vault;

/// Main application state
pub struct AppState {
    /// Deployment database
    pub store: Store,

    /// Pipeline runner shared by every request
    pub executor: Arc<DeploymentExecutor>,
}

impl AppState {
    /// Open the store, recover interrupted deployments and build the executor
    pub async fn init(
        options: &AppOptions,
        connector: Arc<dyn RemoteConnector>,
    ) -> Result<Self, OrchestratorError> {
        info!("Initializing application state...");

        let store = Store::from_path(&options.storage.database_path).await?;
        Self::with_store(options, store, connector).await
    }

    /// Same as [`AppState::init`] with an already opened store
    pub async fn with_store(
        options: &AppOptions,
        store: Store,
        connector: Arc<dyn RemoteConnector>,
    ) -> Result<Self, OrchestratorError> {
        let interrupted = store.fail_interrupted().await?;
        if interrupted > 0 {
            warn!("Marked {} interrupted deployment(s) as failed", interrupted);
        }

        let vault = match options.encryption_key.as_ref() {
            Some(key) => Some(Vault::from_key_material(Some(key.expose_secret()))?),
            None => {
                warn!("No encryption key configured; deployments will fail until one is set");
                None
            }
        };

        let stager = ArtifactStager::new(
            options.storage.staging_dir.clone(),
            options.remote.transfer_timeout,
        )?;
        let executor = Arc::new(DeploymentExecutor::new(
            store.clone(),
            vault,
            connector,
            stager,
            ExecutorSettings::from_options(options),
        ));

        Ok(Self { store, executor })
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), OrchestratorError> {
        info!("Shutting down application state...");
        self.store.pool().close().await;
        Ok(())
    }
}
