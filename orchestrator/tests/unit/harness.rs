//! Shared fixtures: a temp SQLite store, a vault and an in-memory host

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use tempfile::TempDir;

use shipwright::app::options::SupervisorOptions;
use shipwright::deploy::executor::{DeploymentExecutor, ExecutorSettings};
use shipwright::filesys::staging::ArtifactStager;
use shipwright::remote::fake::FakeHost;
use shipwright::store::{NewPackage, NewProject, NewTarget, Store};
use shipwright::utils::sha256_hash;
use shipwright::vault::Vault;

pub const KEY: &str = "integration-test-key";
pub const ROOT: &str = "/srv/apps";

pub struct Harness {
    pub dir: TempDir,
    pub store: Store,
    pub fake: FakeHost,
    pub vault: Vault,
    pub executor: Arc<DeploymentExecutor>,
}

pub fn fast_settings() -> ExecutorSettings {
    ExecutorSettings {
        supervisor: SupervisorOptions {
            settle_delay: Duration::ZERO,
            verify_delay: Duration::ZERO,
        },
        lock_wait: Duration::from_millis(200),
        ..Default::default()
    }
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_vault(true).await
    }

    pub async fn with_vault(configured: bool) -> Self {
        Self::build(configured, fast_settings()).await
    }

    pub async fn with_settings(settings: ExecutorSettings) -> Self {
        Self::build(true, settings).await
    }

    async fn build(configured: bool, settings: ExecutorSettings) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::from_path(dir.path().join("shipwright.db")).await.unwrap();
        let fake = FakeHost::new();
        let vault = Vault::from_key_material(Some(KEY)).unwrap();
        let stager =
            ArtifactStager::new(dir.path().join("staging"), Duration::from_secs(5)).unwrap();
        let executor = Arc::new(DeploymentExecutor::new(
            store.clone(),
            configured.then(|| vault.clone()),
            Arc::new(fake.clone()),
            stager,
            settings,
        ));
        Self {
            dir,
            store,
            fake,
            vault,
            executor,
        }
    }

    pub async fn project(&self, name: &str) -> i64 {
        self.store
            .insert_project(&NewProject {
                name: name.to_string(),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    pub async fn project_with(&self, project: NewProject) -> i64 {
        self.store.insert_project(&project).await.unwrap()
    }

    /// Write an artifact to disk and register it as a package
    pub async fn package(&self, project_id: i64, name: &str, contents: &[u8]) -> i64 {
        let path = self.artifact(name, contents);
        self.store
            .insert_package(&NewPackage {
                project_id,
                name: name.to_string(),
                file_url: path.display().to_string(),
                checksum: Some(format!("sha256:{}", sha256_hash(contents))),
                size: Some(contents.len() as i64),
            })
            .await
            .unwrap()
    }

    pub fn artifact(&self, name: &str, contents: &[u8]) -> PathBuf {
        let dir = self.dir.path().join("artifacts");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    pub async fn target(&self, host: &str) -> i64 {
        let password = self
            .vault
            .encrypt(&SecretString::from("hunter2".to_string()))
            .unwrap();
        self.store
            .insert_target(&NewTarget {
                name: host.to_string(),
                host: host.to_string(),
                ssh_port: 22,
                ssh_user: "deploy".to_string(),
                root_path: ROOT.to_string(),
                env: "staging".to_string(),
                auth_type: "password".to_string(),
                password_encrypted: Some(password),
                ..Default::default()
            })
            .await
            .unwrap()
    }
}
