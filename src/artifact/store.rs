//! Filesystem artifact store
//!
//! Layout under the root directory:
//!
//! ```text
//! blobs/<sha256>               file contents, shared by every run
//! runs/<run_id>/<name>.json    one manifest per published artifact
//! ```

use crate::artifact::{
    digest_bytes, validate_name, ArtifactEntry, ArtifactError, ArtifactManifest, ArtifactResult,
    ArtifactStore,
};
use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Content-addressed artifact store on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store under the platform data directory
    pub fn with_default_path() -> anyhow::Result<Self> {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        let root = data_dir.join("stagecoach").join("artifacts");
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create artifact directory {}", root.display()))?;
        Ok(Self::new(root))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        self.root.join("blobs").join(digest)
    }

    fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join("runs").join(run_id.to_string())
    }

    fn manifest_path(&self, run_id: Uuid, name: &str) -> PathBuf {
        self.run_dir(run_id).join(format!("{}.json", name))
    }

    /// Store a blob unless identical content is already present
    async fn put_blob(&self, digest: &str, data: &[u8]) -> ArtifactResult<()> {
        let path = self.blob_path(digest);
        if tokio::fs::try_exists(&path).await? {
            debug!("Blob {} already stored", &digest[..12]);
            return Ok(());
        }

        let blobs = self.root.join("blobs");
        write_atomic(blobs, path, data.to_vec()).await
    }

    /// Files below `source` with their `/`-separated relative paths, sorted
    async fn collect_files(source: &Path) -> ArtifactResult<Vec<(String, PathBuf)>> {
        let metadata = tokio::fs::metadata(source)
            .await
            .map_err(|_| ArtifactError::SourceNotFound(source.to_path_buf()))?;

        if metadata.is_file() {
            let name = source
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| ArtifactError::SourceNotFound(source.to_path_buf()))?;
            return Ok(vec![(name, source.to_path_buf())]);
        }

        let mut files = Vec::new();
        let mut pending = vec![(String::new(), source.to_path_buf())];

        while let Some((prefix, dir)) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                let relative = if prefix.is_empty() {
                    name
                } else {
                    format!("{}/{}", prefix, name)
                };
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push((relative, path));
                } else if file_type.is_symlink() {
                    // links to files are published by content, links to directories are not followed
                    match tokio::fs::metadata(&path).await {
                        Ok(target) if target.is_file() => files.push((relative, path)),
                        Ok(_) => warn!("Skipping symlinked directory {}", path.display()),
                        Err(_) => warn!("Skipping dangling symlink {}", path.display()),
                    }
                } else {
                    files.push((relative, path));
                }
            }
        }

        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files)
    }

    async fn read_manifest(path: &Path) -> ArtifactResult<ArtifactManifest> {
        let content = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&content)?)
    }
}

/// Write `data` to a temp file in `dir`, then persist it as `path`
async fn write_atomic(dir: PathBuf, path: PathBuf, data: Vec<u8>) -> ArtifactResult<()> {
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        std::fs::create_dir_all(&dir)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&data)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(std::io::Error::other)??;
    Ok(())
}

/// Reject entry paths that would escape the download directory
fn safe_relative_path(path: &str) -> ArtifactResult<PathBuf> {
    let relative = PathBuf::from(path);
    let safe = !path.is_empty()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if safe {
        Ok(relative)
    } else {
        Err(ArtifactError::UnsafePath(path.to_string()))
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn publish(
        &self,
        run_id: Uuid,
        name: &str,
        source: &Path,
    ) -> ArtifactResult<ArtifactManifest> {
        validate_name(name)?;

        let manifest_path = self.manifest_path(run_id, name);
        if tokio::fs::try_exists(&manifest_path).await? {
            return Err(ArtifactError::AlreadyPublished {
                run_id,
                name: name.to_string(),
            });
        }

        let files = Self::collect_files(source).await?;
        let mut entries = Vec::with_capacity(files.len());

        for (relative, path) in files {
            let data = tokio::fs::read(&path).await?;
            let digest = digest_bytes(&data);
            self.put_blob(&digest, &data).await?;
            entries.push(ArtifactEntry {
                path: relative,
                digest,
                size: data.len() as u64,
            });
        }

        let manifest = ArtifactManifest {
            name: name.to_string(),
            run_id,
            created_at: Utc::now(),
            entries,
        };

        write_atomic(
            self.run_dir(run_id),
            manifest_path,
            serde_json::to_vec_pretty(&manifest)?,
        )
        .await?;

        info!(
            "Published artifact '{}' ({} files, {} bytes)",
            name,
            manifest.entries.len(),
            manifest.total_size()
        );
        Ok(manifest)
    }

    async fn download(
        &self,
        run_id: Uuid,
        name: &str,
        dest: &Path,
    ) -> ArtifactResult<ArtifactManifest> {
        let manifest = self
            .manifest(run_id, name)
            .await?
            .ok_or_else(|| ArtifactError::NotFound {
                run_id,
                name: name.to_string(),
            })?;

        tokio::fs::create_dir_all(dest).await?;

        for entry in &manifest.entries {
            let relative = safe_relative_path(&entry.path)?;
            let data = tokio::fs::read(self.blob_path(&entry.digest)).await?;

            let actual = digest_bytes(&data);
            if actual != entry.digest {
                return Err(ArtifactError::DigestMismatch {
                    path: entry.path.clone(),
                    expected: entry.digest.clone(),
                    actual,
                });
            }

            let target = dest.join(relative);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, &data).await?;
        }

        info!(
            "Downloaded artifact '{}' to {} ({} files)",
            name,
            dest.display(),
            manifest.entries.len()
        );
        Ok(manifest)
    }

    async fn manifest(&self, run_id: Uuid, name: &str) -> ArtifactResult<Option<ArtifactManifest>> {
        validate_name(name)?;
        let path = self.manifest_path(run_id, name);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        Ok(Some(Self::read_manifest(&path).await?))
    }

    async fn list(&self, run_id: Uuid) -> ArtifactResult<Vec<ArtifactManifest>> {
        let run_dir = self.run_dir(run_id);
        if !tokio::fs::try_exists(&run_dir).await? {
            return Ok(Vec::new());
        }

        let mut manifests = Vec::new();
        let mut entries = tokio::fs::read_dir(&run_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                manifests.push(Self::read_manifest(&path).await?);
            }
        }

        manifests.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(manifests)
    }
}
