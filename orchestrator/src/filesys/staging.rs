//! Local staging of package artifacts before upload

use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

use crate::errors::TransferError;
use crate::store::PackageRecord;
use crate::utils::{generate_uuid, hex, sha256_file};

/// An artifact ready to upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArtifact {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
    /// Downloaded into the staging directory and removed after upload
    pub temporary: bool,
}

/// Resolves a package's `file_url` to a verified local file
#[derive(Debug, Clone)]
pub struct ArtifactStager {
    staging_dir: PathBuf,
    client: reqwest::Client,
}

impl ArtifactStager {
    pub fn new(staging_dir: impl Into<PathBuf>, timeout: Duration) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransferError::Source(e.to_string()))?;
        Ok(Self {
            staging_dir: staging_dir.into(),
            client,
        })
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Local path or download, then checksum verification when the package has one
    pub async fn stage(&self, package: &PackageRecord) -> Result<StagedArtifact, TransferError> {
        let staged = match Url::parse(&package.file_url) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {
                self.download(url, &package.name).await?
            }
            Ok(url) if url.scheme() == "file" => {
                let path = url.to_file_path().map_err(|_| {
                    TransferError::Source(format!("invalid file url {}", package.file_url))
                })?;
                self.local(&path).await?
            }
            Ok(url) if url.scheme().len() > 1 => {
                return Err(TransferError::Source(format!(
                    "unsupported artifact scheme {}",
                    url.scheme()
                )))
            }
            // plain paths (and Windows drive letters) are local files
            _ => self.local(Path::new(&package.file_url)).await?,
        };

        if let Some(expected) = package.checksum.as_deref().map(normalize_checksum) {
            if !expected.is_empty() && expected != staged.sha256 {
                self.cleanup(&staged).await;
                return Err(TransferError::ChecksumMismatch {
                    file: package.name.clone(),
                    expected,
                    actual: staged.sha256,
                });
            }
        }
        if let Some(size) = package.size {
            if size >= 0 && size as u64 != staged.size {
                warn!(
                    "Package {} declares {} bytes but artifact has {}",
                    package.name, size, staged.size
                );
            }
        }
        Ok(staged)
    }

    /// Remove a downloaded artifact; local sources are left alone
    pub async fn cleanup(&self, staged: &StagedArtifact) {
        if staged.temporary {
            if let Err(e) = fs::remove_file(&staged.path).await {
                debug!("Could not remove staged {}: {}", staged.path.display(), e);
            }
        }
    }

    async fn local(&self, path: &Path) -> Result<StagedArtifact, TransferError> {
        let meta = fs::metadata(path)
            .await
            .map_err(|e| TransferError::Source(format!("{}: {}", path.display(), e)))?;
        if !meta.is_file() {
            return Err(TransferError::Source(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let sha256 = sha256_file(path)
            .await
            .map_err(|e| TransferError::Source(e.to_string()))?;
        Ok(StagedArtifact {
            path: path.to_path_buf(),
            size: meta.len(),
            sha256,
            temporary: false,
        })
    }

    async fn download(&self, url: Url, name: &str) -> Result<StagedArtifact, TransferError> {
        let source_err = |e: reqwest::Error| TransferError::Source(e.to_string());
        info!("Downloading artifact {}", url);

        fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|e| TransferError::Source(e.to_string()))?;
        let file_name = name.rsplit('/').next().unwrap_or(name);
        let path = self
            .staging_dir
            .join(format!("{}-{}", generate_uuid(), file_name));

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(source_err)?;

        let mut file = fs::File::create(&path)
            .await
            .map_err(|e| TransferError::Source(e.to_string()))?;
        let mut hasher = Sha256::new();
        let mut size = 0u64;

        let result: Result<(), TransferError> = async {
            while let Some(chunk) = response.chunk().await.map_err(source_err)? {
                hasher.update(&chunk);
                size += chunk.len() as u64;
                file.write_all(&chunk)
                    .await
                    .map_err(|e| TransferError::Source(e.to_string()))?;
            }
            file.flush()
                .await
                .map_err(|e| TransferError::Source(e.to_string()))
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&path).await;
            return Err(e);
        }

        Ok(StagedArtifact {
            path,
            size,
            sha256: hex::encode(hasher.finalize()),
            temporary: true,
        })
    }
}

fn normalize_checksum(raw: &str) -> String {
    let raw = raw.trim();
    raw.strip_prefix("sha256:")
        .unwrap_or(raw)
        .to_ascii_lowercase()
}
