use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{StorageTier, StoredObject};
use crate::storage::{sanitize_name, StorageBackend};

pub const GENERATED_DIR: &str = "generated-images";

/// Filesystem tier. Files land in `<public_dir>/generated-images/` and are
/// addressed by the caller as `/generated-images/<name>`.
pub struct LocalFileBackend {
    dir: PathBuf,
}

impl LocalFileBackend {
    pub fn new(public_dir: &Path) -> Self {
        Self {
            dir: public_dir.join(GENERATED_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        let name = sanitize_name(name);
        if name.is_empty() {
            anyhow::bail!("artifact name is empty after sanitizing");
        }
        Ok(self.dir.join(name))
    }

    /// Make sure the target directory exists and accepts writes.
    async fn ensure_writable(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let probe = self.dir.join(format!(".write-test-{}", Uuid::new_v4().simple()));
        tokio::fs::write(&probe, b"")
            .await
            .with_context(|| format!("Directory {} is not writable", self.dir.display()))?;
        if let Err(e) = tokio::fs::remove_file(&probe).await {
            tracing::debug!("Failed to remove write probe {}: {}", probe.display(), e);
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for LocalFileBackend {
    fn tier(&self) -> StorageTier {
        StorageTier::LocalFile
    }

    async fn probe(&self) -> Result<()> {
        self.ensure_writable().await
    }

    async fn write(&self, bytes: &[u8], name: &str, _content_type: &str) -> Result<StoredObject> {
        let path = self.path_for(name)?;
        self.ensure_writable().await?;

        // Write to a sibling temp file first so readers never see a partial image.
        let tmp_path = path.with_extension("part");
        tokio::fs::write(&tmp_path, bytes)
            .await
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e).with_context(|| format!("Failed to move artifact into {}", path.display()));
        }

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        tracing::debug!("Stored {} bytes at {}", bytes.len(), path.display());

        Ok(StoredObject {
            tier: StorageTier::LocalFile,
            canonical_uri: format!("/{}/{}", GENERATED_DIR, file_name),
            key: format!("{}/{}", GENERATED_DIR, file_name),
            size_bytes: bytes.len() as u64,
        })
    }

    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let path = self.path_for(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
        }
    }
}
