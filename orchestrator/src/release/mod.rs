//! Release directories and activation on a target
//!
//! ```text
//! {root}/{project}/releases/{release_id}/   one per deployment
//! {root}/{project}/current -> releases/...  activation pointer
//! ```

use std::path::Path;

use chrono::Utc;
use tracing::{info, warn};

use crate::errors::{ActivationError, CommandError, TransferError};
use crate::remote::command::{check_path, RemoteCommand};
use crate::remote::session::RemoteSession;

/// Paths for one project on one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseLayout {
    project_dir: String,
}

impl ReleaseLayout {
    pub fn new(root_path: &str, project: &str) -> Result<Self, CommandError> {
        check_component(project)?;
        let root = root_path.trim_end_matches('/');
        let root = if root.is_empty() { "/" } else { root };
        check_path(root)?;
        let project_dir = if root == "/" {
            format!("/{}", project)
        } else {
            format!("{}/{}", root, project)
        };
        Ok(Self { project_dir })
    }

    pub fn project_dir(&self) -> &str {
        &self.project_dir
    }

    pub fn releases_root(&self) -> String {
        format!("{}/releases", self.project_dir)
    }

    pub fn release_dir(&self, release_id: &str) -> String {
        format!("{}/releases/{}", self.project_dir, release_id)
    }

    pub fn current_link(&self) -> String {
        format!("{}/current", self.project_dir)
    }

    fn staged_link(&self) -> String {
        format!("{}/current.next", self.project_dir)
    }
}

/// A single path component such as a project or file name
pub fn check_component(name: &str) -> Result<(), CommandError> {
    if name.contains('/') || name == "." {
        return Err(CommandError::UnsafeArgument(name.to_string()));
    }
    check_path(name)
}

/// Sortable timestamp id, e.g. `20240501T101500123Z`
pub fn new_release_id() -> String {
    Utc::now().format("%Y%m%dT%H%M%S%3fZ").to_string()
}

/// How an uploaded artifact is positioned inside its release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    TarGz,
    Zip,
    Jar,
    Binary,
}

impl ArtifactKind {
    pub fn detect(file_name: &str) -> Self {
        let lower = file_name.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            ArtifactKind::TarGz
        } else if lower.ends_with(".zip") {
            ArtifactKind::Zip
        } else if lower.ends_with(".jar") {
            ArtifactKind::Jar
        } else {
            ArtifactKind::Binary
        }
    }

    pub fn is_archive(&self) -> bool {
        matches!(self, ArtifactKind::TarGz | ArtifactKind::Zip)
    }
}

/// How the `current` link was switched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationMode {
    /// `ln -s` to a staged name then a single `rename(2)`
    Atomic,
    /// remove then link; briefly no link exists
    RemoveThenLink,
}

/// Release operations over one open session
pub struct ReleaseManager<'a> {
    session: &'a dyn RemoteSession,
}

impl<'a> ReleaseManager<'a> {
    pub fn new(session: &'a dyn RemoteSession) -> Self {
        Self { session }
    }

    /// Pick a release directory that does not exist yet
    pub async fn allocate(&self, layout: &ReleaseLayout) -> Result<String, CommandError> {
        let base = new_release_id();
        let mut candidate = layout.release_dir(&base);
        let mut suffix = 1;
        while self.exists(&candidate).await? {
            candidate = layout.release_dir(&format!("{}-{}", base, suffix));
            suffix += 1;
        }
        Ok(candidate)
    }

    /// Create the releases root, the release directory and its `logs/`
    pub async fn prepare_dirs(
        &self,
        layout: &ReleaseLayout,
        release_dir: &str,
    ) -> Result<(), CommandError> {
        let cmd = RemoteCommand::new("mkdir")
            .arg("-p")
            .path(layout.releases_root())
            .path(release_dir)
            .path(format!("{}/logs", release_dir));
        self.session.run_checked(&cmd).await?;
        Ok(())
    }

    /// Copy the staged artifact into the release directory
    pub async fn upload(
        &self,
        local: &Path,
        release_dir: &str,
        file_name: &str,
    ) -> Result<u64, TransferError> {
        check_component(file_name)?;
        let remote = format!("{}/{}", release_dir, file_name);
        let bytes = self.session.put_file(local, &remote).await?;
        info!("Uploaded {} ({} bytes) to {}", file_name, bytes, self.session.host());
        Ok(bytes)
    }

    /// Unpack archives in place; runnable artifacts stay as uploaded.
    /// Returns a short description for the step log.
    pub async fn extract(
        &self,
        release_dir: &str,
        file_name: &str,
        kind: ArtifactKind,
    ) -> Result<String, TransferError> {
        let cmd = match kind {
            ArtifactKind::TarGz => RemoteCommand::new("tar")
                .arg("-xzf")
                .path(file_name)
                .arg("-C")
                .path(release_dir),
            ArtifactKind::Zip => RemoteCommand::new("unzip")
                .arg("-q")
                .arg("-o")
                .path(file_name)
                .arg("-d")
                .path(release_dir),
            ArtifactKind::Binary => RemoteCommand::new("chmod").arg("+x").path(file_name),
            ArtifactKind::Jar => return Ok(format!("{} kept as uploaded", file_name)),
        }
        .cwd(release_dir);

        let output = self.session.run(&cmd).await?;
        if !output.success() {
            return Err(TransferError::Extract(format!(
                "{} exited with {}: {}",
                cmd.program(),
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(match kind {
            ArtifactKind::Binary => format!("{} marked executable", file_name),
            _ => format!("{} extracted", file_name),
        })
    }

    /// Point `current` at `release_dir`.
    ///
    /// Prefers a staged link plus `mv -T`, which replaces the link in one
    /// rename. Hosts whose `mv` lacks `-T` fall back to remove-then-link; if the
    /// link cannot be recreated after the remove, no `current` exists and
    /// [`ActivationError::LinkMissing`] is returned.
    pub async fn activate(
        &self,
        layout: &ReleaseLayout,
        release_dir: &str,
    ) -> Result<ActivationMode, ActivationError> {
        let current = layout.current_link();
        let staged = layout.staged_link();
        let failed = |e: CommandError| ActivationError::Failed(e.to_string());

        self.session
            .run_checked(&RemoteCommand::new("rm").arg("-f").path(&staged))
            .await
            .map_err(failed)?;
        self.session
            .run_checked(
                &RemoteCommand::new("ln")
                    .arg("-s")
                    .path(release_dir)
                    .path(&staged),
            )
            .await
            .map_err(failed)?;

        let swap = RemoteCommand::new("mv").arg("-T").path(&staged).path(&current);
        let output = self.session.run(&swap).await.map_err(failed)?;
        if output.success() {
            return Ok(ActivationMode::Atomic);
        }

        warn!(
            "Atomic link swap unavailable on {} ({}), falling back to remove-then-link",
            self.session.host(),
            output.stderr.trim()
        );
        let _ = self
            .session
            .run(&RemoteCommand::new("rm").arg("-f").path(&staged))
            .await;

        self.session
            .run_checked(&RemoteCommand::new("rm").arg("-f").path(&current))
            .await
            .map_err(failed)?;

        let link = RemoteCommand::new("ln").arg("-s").path(release_dir).path(&current);
        match self.session.run_checked(&link).await {
            Ok(_) => Ok(ActivationMode::RemoveThenLink),
            Err(e) => Err(ActivationError::LinkMissing {
                link: current,
                reason: e.to_string(),
            }),
        }
    }

    /// Where `current` points, if it exists
    pub async fn current_target(&self, layout: &ReleaseLayout) -> Result<Option<String>, CommandError> {
        let output = self
            .session
            .run(&RemoteCommand::new("readlink").path(layout.current_link()))
            .await?;
        if output.success() {
            let target = output.stdout.trim();
            Ok((!target.is_empty()).then(|| target.to_string()))
        } else {
            Ok(None)
        }
    }

    pub async fn release_exists(&self, release_dir: &str) -> Result<bool, CommandError> {
        let output = self
            .session
            .run(&RemoteCommand::new("test").arg("-d").path(release_dir))
            .await?;
        Ok(output.success())
    }

    async fn exists(&self, path: &str) -> Result<bool, CommandError> {
        let output = self
            .session
            .run(&RemoteCommand::new("test").arg("-e").path(path))
            .await?;
        Ok(output.success())
    }
}
