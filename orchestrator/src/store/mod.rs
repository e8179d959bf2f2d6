//! SQLite-backed deployment store
//!
//! Holds the catalog rows the pipelines read (projects, packages, targets) and
//! the deployment records and step logs they write.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::errors::StoreError;
use crate::utils::now_millis;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Error text written by the startup compensating pass
pub const INTERRUPTED_ERROR: &str = "interrupted before completion";

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ProjectRecord {
    pub id: i64,
    pub name: String,
    pub start_script: Option<String>,
    pub stop_script: Option<String>,
    pub java_opts: Option<String>,
    pub app_args: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct PackageRecord {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub file_url: String,
    pub checksum: Option<String>,
    pub size: Option<i64>,
}

/// Target row; the `*_encrypted` columns only ever hold vault blobs
#[derive(Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TargetRecord {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub ssh_port: i64,
    pub ssh_user: String,
    pub root_path: String,
    pub env: String,
    pub auth_type: String,
    pub password_encrypted: Option<String>,
    pub private_key_encrypted: Option<String>,
    pub passphrase_encrypted: Option<String>,
    pub has_password: bool,
    pub has_private_key: bool,
}

impl std::fmt::Debug for TargetRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("host", &self.host)
            .field("ssh_port", &self.ssh_port)
            .field("ssh_user", &self.ssh_user)
            .field("auth_type", &self.auth_type)
            .field("has_password", &self.has_password)
            .field("has_private_key", &self.has_private_key)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct DeploymentRecord {
    pub id: i64,
    pub kind: String,
    pub rollback_of: Option<i64>,
    pub system_id: Option<i64>,
    pub project_id: i64,
    pub package_id: i64,
    pub target_id: i64,
    pub status: String,
    pub release_path: Option<String>,
    pub current_link: Option<String>,
    pub pid: Option<i64>,
    pub error: Option<String>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

/// Deployment joined with catalog names
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct DeploymentDetailRecord {
    #[sqlx(flatten)]
    pub deployment: DeploymentRecord,
    pub project_name: String,
    pub package_name: String,
    pub target_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct StepRecord {
    pub id: i64,
    pub deployment_id: i64,
    pub seq: i64,
    pub key: String,
    pub label: String,
    pub ok: bool,
    pub log: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Default)]
pub struct NewProject {
    pub name: String,
    pub start_script: Option<String>,
    pub stop_script: Option<String>,
    pub java_opts: Option<String>,
    pub app_args: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewPackage {
    pub project_id: i64,
    pub name: String,
    pub file_url: String,
    pub checksum: Option<String>,
    pub size: Option<i64>,
}

/// New target; credential fields must already be vault blobs
#[derive(Clone, Default)]
pub struct NewTarget {
    pub name: String,
    pub host: String,
    pub ssh_port: i64,
    pub ssh_user: String,
    pub root_path: String,
    pub env: String,
    pub auth_type: String,
    pub password_encrypted: Option<String>,
    pub private_key_encrypted: Option<String>,
    pub passphrase_encrypted: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentKind {
    Deploy,
    Rollback,
}

impl DeploymentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentKind::Deploy => "deploy",
            DeploymentKind::Rollback => "rollback",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewDeployment {
    pub kind: DeploymentKind,
    pub rollback_of: Option<i64>,
    pub system_id: Option<i64>,
    pub project_id: i64,
    pub package_id: i64,
    pub target_id: i64,
}

const DEPLOYMENT_COLUMNS: &str = "d.id, d.kind, d.rollback_of, d.system_id, d.project_id, \
     d.package_id, d.target_id, d.status, d.release_path, d.current_link, d.pid, d.error, \
     d.started_at, d.finished_at";

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database file and run migrations
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StoreError::Database(sqlx::Error::Io(e)))?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        MIGRATOR.run(&pool).await?;
        info!("Opened deployment store at {}", path.display());
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ============================== CATALOG =============================== //

    pub async fn insert_project(&self, project: &NewProject) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO projects (name, start_script, stop_script, java_opts, app_args, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&project.name)
        .bind(&project.start_script)
        .bind(&project.stop_script)
        .bind(&project.java_opts)
        .bind(&project.app_args)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_project(&self, id: i64) -> Result<Option<ProjectRecord>, StoreError> {
        let record = sqlx::query_as::<_, ProjectRecord>(
            "SELECT id, name, start_script, stop_script, java_opts, app_args FROM projects WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn insert_package(&self, package: &NewPackage) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO packages (project_id, name, file_url, checksum, size, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(package.project_id)
        .bind(&package.name)
        .bind(&package.file_url)
        .bind(&package.checksum)
        .bind(package.size)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_package(&self, id: i64) -> Result<Option<PackageRecord>, StoreError> {
        let record = sqlx::query_as::<_, PackageRecord>(
            "SELECT id, project_id, name, file_url, checksum, size FROM packages WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn insert_target(&self, target: &NewTarget) -> Result<i64, StoreError> {
        let now = now_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO targets (name, host, ssh_port, ssh_user, root_path, env, auth_type,
                                 password_encrypted, private_key_encrypted, passphrase_encrypted,
                                 has_password, has_private_key, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&target.name)
        .bind(&target.host)
        .bind(target.ssh_port)
        .bind(&target.ssh_user)
        .bind(&target.root_path)
        .bind(&target.env)
        .bind(&target.auth_type)
        .bind(&target.password_encrypted)
        .bind(&target.private_key_encrypted)
        .bind(&target.passphrase_encrypted)
        .bind(target.password_encrypted.is_some())
        .bind(target.private_key_encrypted.is_some())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_target(&self, id: i64) -> Result<Option<TargetRecord>, StoreError> {
        let record = sqlx::query_as::<_, TargetRecord>(
            r#"
            SELECT id, name, host, ssh_port, ssh_user, root_path, env, auth_type,
                   password_encrypted, private_key_encrypted, passphrase_encrypted,
                   has_password, has_private_key
            FROM targets
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Replace a target's credentials with new blobs. Returns false if the
    /// target does not exist.
    pub async fn set_target_credentials(
        &self,
        id: i64,
        auth_type: &str,
        password_encrypted: Option<String>,
        private_key_encrypted: Option<String>,
        passphrase_encrypted: Option<String>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE targets
            SET auth_type = ?, password_encrypted = ?, private_key_encrypted = ?,
                passphrase_encrypted = ?, has_password = ?, has_private_key = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(auth_type)
        .bind(&password_encrypted)
        .bind(&private_key_encrypted)
        .bind(&passphrase_encrypted)
        .bind(password_encrypted.is_some())
        .bind(private_key_encrypted.is_some())
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn clear_target_credentials(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE targets
            SET password_encrypted = NULL, private_key_encrypted = NULL,
                passphrase_encrypted = NULL, has_password = 0, has_private_key = 0,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ============================ DEPLOYMENTS ============================= //

    pub async fn create_deployment(&self, new: &NewDeployment) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO deployments (kind, rollback_of, system_id, project_id, package_id,
                                     target_id, status, started_at)
            VALUES (?, ?, ?, ?, ?, ?, 'pending', ?)
            "#,
        )
        .bind(new.kind.as_str())
        .bind(new.rollback_of)
        .bind(new.system_id)
        .bind(new.project_id)
        .bind(new.package_id)
        .bind(new.target_id)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Append the next step; `seq` is assigned in insertion order
    pub async fn append_step(
        &self,
        deployment_id: i64,
        key: &str,
        label: &str,
        ok: bool,
        log: Option<&str>,
    ) -> Result<StepRecord, StoreError> {
        let record = sqlx::query_as::<_, StepRecord>(
            r#"
            INSERT INTO deployment_steps (deployment_id, seq, key, label, ok, log, created_at)
            VALUES (?,
                    (SELECT COALESCE(MAX(seq), 0) + 1 FROM deployment_steps WHERE deployment_id = ?),
                    ?, ?, ?, ?, ?)
            RETURNING id, deployment_id, seq, key, label, ok, log, created_at
            "#,
        )
        .bind(deployment_id)
        .bind(deployment_id)
        .bind(key)
        .bind(label)
        .bind(ok)
        .bind(log)
        .bind(now_millis())
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn set_deployment_pid(&self, id: i64, pid: u32) -> Result<(), StoreError> {
        sqlx::query("UPDATE deployments SET pid = ? WHERE id = ? AND status = 'pending'")
            .bind(i64::from(pid))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The single permitted terminal write for a successful run
    pub async fn finish_success(
        &self,
        id: i64,
        release_path: &str,
        current_link: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE deployments
            SET status = 'success', release_path = ?, current_link = ?, error = NULL,
                finished_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(release_path)
        .bind(current_link)
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyFinalized(id));
        }
        Ok(())
    }

    /// The single permitted terminal write for a failed run
    pub async fn finish_failed(&self, id: i64, error: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE deployments
            SET status = 'failed', release_path = NULL, current_link = NULL, error = ?,
                finished_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(error)
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyFinalized(id));
        }
        Ok(())
    }

    /// Mark every still-pending deployment failed; run once at startup
    pub async fn fail_interrupted(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE deployments
            SET status = 'failed', error = ?, finished_at = ?
            WHERE status = 'pending'
            "#,
        )
        .bind(INTERRUPTED_ERROR)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_deployment(&self, id: i64) -> Result<Option<DeploymentRecord>, StoreError> {
        let record = sqlx::query_as::<_, DeploymentRecord>(&format!(
            "SELECT {} FROM deployments d WHERE d.id = ?",
            DEPLOYMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn get_deployment_detail(
        &self,
        id: i64,
    ) -> Result<Option<DeploymentDetailRecord>, StoreError> {
        let record = sqlx::query_as::<_, DeploymentDetailRecord>(&format!(
            r#"
            SELECT {}, p.name AS project_name, k.name AS package_name, t.name AS target_name
            FROM deployments d
            JOIN projects p ON p.id = d.project_id
            JOIN packages k ON k.id = d.package_id
            JOIN targets t ON t.id = d.target_id
            WHERE d.id = ?
            "#,
            DEPLOYMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn steps(&self, deployment_id: i64) -> Result<Vec<StepRecord>, StoreError> {
        let records = sqlx::query_as::<_, StepRecord>(
            r#"
            SELECT id, deployment_id, seq, key, label, ok, log, created_at
            FROM deployment_steps
            WHERE deployment_id = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(deployment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Successful deployments for a project and target, newest first
    pub async fn recent_successes(
        &self,
        project_id: i64,
        target_id: i64,
        limit: i64,
    ) -> Result<Vec<DeploymentRecord>, StoreError> {
        let records = sqlx::query_as::<_, DeploymentRecord>(&format!(
            r#"
            SELECT {}
            FROM deployments d
            WHERE d.project_id = ? AND d.target_id = ? AND d.status = 'success'
              AND d.release_path IS NOT NULL
            ORDER BY d.id DESC
            LIMIT ?
            "#,
            DEPLOYMENT_COLUMNS
        ))
        .bind(project_id)
        .bind(target_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Latest deployments with catalog names and their steps
    pub async fn history(
        &self,
        limit: i64,
    ) -> Result<Vec<(DeploymentDetailRecord, Vec<StepRecord>)>, StoreError> {
        let deployments = sqlx::query_as::<_, DeploymentDetailRecord>(&format!(
            r#"
            SELECT {}, p.name AS project_name, k.name AS package_name, t.name AS target_name
            FROM deployments d
            JOIN projects p ON p.id = d.project_id
            JOIN packages k ON k.id = d.package_id
            JOIN targets t ON t.id = d.target_id
            ORDER BY d.id DESC
            LIMIT ?
            "#,
            DEPLOYMENT_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let steps = sqlx::query_as::<_, StepRecord>(
            r#"
            SELECT id, deployment_id, seq, key, label, ok, log, created_at
            FROM deployment_steps
            WHERE deployment_id IN (SELECT id FROM deployments ORDER BY id DESC LIMIT ?)
            ORDER BY deployment_id, seq ASC
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut by_deployment: HashMap<i64, Vec<StepRecord>> = HashMap::new();
        for step in steps {
            by_deployment.entry(step.deployment_id).or_default().push(step);
        }

        Ok(deployments
            .into_iter()
            .map(|d| {
                let steps = by_deployment.remove(&d.deployment.id).unwrap_or_default();
                (d, steps)
            })
            .collect())
    }
}
