use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::models::catalog::validate_entry;
use crate::models::CatalogEntry;
use crate::storage::CatalogStore;

const SNAPSHOT_FILE: &str = "projects.json";

/// Snapshot-file catalog. Every write first copies the current snapshot to
/// `projects.json.backup.<unix-millis>`, then replaces the snapshot via a
/// temp file and rename.
pub struct JsonCatalogStore {
    dir: PathBuf,
    file_path: PathBuf,
    max_backups: usize,
    cache: RwLock<Vec<CatalogEntry>>,
}

impl JsonCatalogStore {
    /// Load `projects.json` from `dir`, creating the directory if needed.
    ///
    /// A corrupted snapshot is copied to `projects.json.bak` and the store
    /// starts empty.
    pub async fn new(dir: PathBuf, max_backups: usize) -> Result<Self> {
        tokio::fs::create_dir_all(&dir)
            .await
            .context("Failed to create catalog directory")?;

        let file_path = dir.join(SNAPSHOT_FILE);
        let entries = load_snapshot(&file_path).await?;

        Ok(Self {
            dir,
            file_path,
            max_backups,
            cache: RwLock::new(entries),
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// Backup files oldest first.
    pub async fn list_backups(&self) -> Result<Vec<PathBuf>> {
        let prefix = format!("{}.backup.", SNAPSHOT_FILE);
        let mut backups: Vec<(u64, PathBuf)> = Vec::new();

        let mut dir = tokio::fs::read_dir(&self.dir)
            .await
            .context("Failed to read catalog directory")?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(millis) = name.strip_prefix(&prefix).and_then(|s| s.parse::<u64>().ok()) {
                backups.push((millis, entry.path()));
            }
        }

        backups.sort_by_key(|(millis, _)| *millis);
        Ok(backups.into_iter().map(|(_, path)| path).collect())
    }

    async fn backup_current(&self) -> Result<Option<PathBuf>> {
        if !tokio::fs::try_exists(&self.file_path).await.unwrap_or(false) {
            return Ok(None);
        }

        let mut millis = Utc::now().timestamp_millis();
        let mut backup_path;
        loop {
            backup_path = self.dir.join(format!("{}.backup.{}", SNAPSHOT_FILE, millis));
            if !tokio::fs::try_exists(&backup_path).await.unwrap_or(false) {
                break;
            }
            millis += 1;
        }

        tokio::fs::copy(&self.file_path, &backup_path)
            .await
            .context("Failed to copy catalog snapshot")?;
        Ok(Some(backup_path))
    }

    async fn prune_backups(&self) -> Result<()> {
        let backups = self.list_backups().await?;
        if backups.len() <= self.max_backups {
            return Ok(());
        }
        let excess = backups.len() - self.max_backups;
        for old in backups.into_iter().take(excess) {
            if let Err(e) = tokio::fs::remove_file(&old).await {
                tracing::warn!("Failed to prune backup {}: {}", old.display(), e);
            }
        }
        Ok(())
    }

    async fn write_snapshot(&self, entries: &[CatalogEntry]) -> Result<()> {
        let tmp_path = self.file_path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(entries).context("Failed to serialize catalog")?;

        tokio::fs::write(&tmp_path, json.as_bytes())
            .await
            .context("Failed to write temporary catalog file")?;

        tokio::fs::rename(&tmp_path, &self.file_path)
            .await
            .context("Failed to rename temporary catalog file")?;

        Ok(())
    }

    /// Back up, then atomically replace the snapshot. The primary file is
    /// only touched by the final rename, so a failed write leaves it as it was.
    async fn persist(&self, entries: &[CatalogEntry]) -> Result<()> {
        match self.backup_current().await {
            Ok(_) => {
                if let Err(e) = self.prune_backups().await {
                    tracing::warn!("Backup pruning failed: {:#}", e);
                }
            }
            // Backups are best effort; the write itself still proceeds.
            Err(e) => tracing::warn!("Catalog backup failed: {:#}", e),
        }

        if let Err(e) = self.write_snapshot(entries).await {
            tracing::error!("Catalog write failed, snapshot left unchanged: {:#}", e);
            return Err(e);
        }
        Ok(())
    }
}

async fn load_snapshot(file_path: &Path) -> Result<Vec<CatalogEntry>> {
    if !tokio::fs::try_exists(file_path).await.unwrap_or(false) {
        return Ok(Vec::new());
    }

    let content = tokio::fs::read_to_string(file_path)
        .await
        .context("Failed to read projects.json")?;
    match serde_json::from_str::<Vec<CatalogEntry>>(&content) {
        Ok(parsed) => Ok(parsed),
        Err(e) => {
            tracing::warn!(
                "projects.json is corrupted ({}), creating backup and starting empty",
                e
            );
            let backup_path = file_path.with_extension("json.bak");
            if let Err(backup_err) = tokio::fs::copy(file_path, &backup_path).await {
                tracing::error!(
                    "Failed to create backup of corrupted projects.json: {}",
                    backup_err
                );
            }
            Ok(Vec::new())
        }
    }
}

/// Accepts either a bare array of entries or `{"projects": [...]}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ImportPayload {
    Entries(Vec<CatalogEntry>),
    Wrapped { projects: Vec<CatalogEntry> },
}

fn parse_import(json: &str) -> Result<Vec<CatalogEntry>> {
    let payload: ImportPayload =
        serde_json::from_str(json).context("Import payload is not a catalog export")?;
    let entries = match payload {
        ImportPayload::Entries(entries) => entries,
        ImportPayload::Wrapped { projects } => projects,
    };
    for entry in &entries {
        validate_entry(entry)?;
    }
    Ok(entries)
}

/// Adds entries whose id is not yet present; returns how many were added.
fn merge_new(cache: &mut Vec<CatalogEntry>, incoming: Vec<CatalogEntry>) -> usize {
    let mut added = 0;
    for entry in incoming {
        if !cache.iter().any(|e| e.id == entry.id) {
            cache.push(entry);
            added += 1;
        }
    }
    added
}

fn upsert_into(cache: &mut Vec<CatalogEntry>, entry: CatalogEntry) {
    match cache.iter().position(|e| e.id == entry.id) {
        Some(idx) => cache[idx] = entry,
        None => cache.push(entry),
    }
}

#[async_trait]
impl CatalogStore for JsonCatalogStore {
    async fn list(&self) -> Result<Vec<CatalogEntry>> {
        let cache = self.cache.read().await;
        Ok(cache.clone())
    }

    async fn get(&self, id: &str) -> Result<Option<CatalogEntry>> {
        let cache = self.cache.read().await;
        Ok(cache.iter().find(|e| e.id == id).cloned())
    }

    async fn upsert(&self, entry: CatalogEntry) -> Result<CatalogEntry> {
        validate_entry(&entry)?;

        let mut cache = self.cache.write().await;
        let mut next = cache.clone();
        upsert_into(&mut next, entry.clone());
        self.persist(&next).await?;
        *cache = next;

        Ok(entry)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut cache = self.cache.write().await;
        let Some(idx) = cache.iter().position(|e| e.id == id) else {
            return Ok(false);
        };

        let mut next = cache.clone();
        next.remove(idx);
        self.persist(&next).await?;
        *cache = next;

        Ok(true)
    }

    async fn import_json(&self, json: &str) -> Result<usize> {
        let incoming = parse_import(json)?;

        let mut cache = self.cache.write().await;
        let mut next = cache.clone();
        let added = merge_new(&mut next, incoming);
        if added > 0 {
            self.persist(&next).await?;
            *cache = next;
        }

        tracing::info!("Imported {} catalog entries", added);
        Ok(added)
    }

    async fn export_json(&self) -> Result<String> {
        let cache = self.cache.read().await;
        serde_json::to_string_pretty(&*cache).context("Failed to serialize catalog")
    }

    /// Make the newest backup current again. The snapshot being replaced is
    /// itself backed up first, so a restore can be undone.
    async fn restore_latest_backup(&self) -> Result<Option<String>> {
        let mut cache = self.cache.write().await;
        let Some(latest) = self.list_backups().await?.pop() else {
            return Ok(None);
        };

        let content = tokio::fs::read_to_string(&latest)
            .await
            .with_context(|| format!("Failed to read backup {}", latest.display()))?;
        let restored: Vec<CatalogEntry> = serde_json::from_str(&content)
            .with_context(|| format!("Backup {} is not a valid catalog", latest.display()))?;

        self.persist(&restored).await?;
        *cache = restored;

        tracing::info!("Catalog restored from {}", latest.display());
        Ok(Some(latest.display().to_string()))
    }

    fn is_persistent(&self) -> bool {
        true
    }
}

/// Degraded catalog used when no snapshot directory is usable.
#[derive(Default)]
pub struct MemoryCatalogStore {
    entries: RwLock<Vec<CatalogEntry>>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn list(&self) -> Result<Vec<CatalogEntry>> {
        Ok(self.entries.read().await.clone())
    }

    async fn get(&self, id: &str) -> Result<Option<CatalogEntry>> {
        Ok(self.entries.read().await.iter().find(|e| e.id == id).cloned())
    }

    async fn upsert(&self, entry: CatalogEntry) -> Result<CatalogEntry> {
        validate_entry(&entry)?;
        upsert_into(&mut *self.entries.write().await, entry.clone());
        Ok(entry)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| e.id != id);
        Ok(entries.len() != before)
    }

    async fn import_json(&self, json: &str) -> Result<usize> {
        let incoming = parse_import(json)?;
        Ok(merge_new(&mut *self.entries.write().await, incoming))
    }

    async fn export_json(&self) -> Result<String> {
        let entries = self.entries.read().await;
        serde_json::to_string_pretty(&*entries).context("Failed to serialize catalog")
    }

    async fn restore_latest_backup(&self) -> Result<Option<String>> {
        Ok(None)
    }

    fn is_persistent(&self) -> bool {
        false
    }
}

/// Open the JSON catalog under `dir`, falling back to memory when the
/// directory cannot be used.
pub async fn open_catalog(dir: PathBuf, max_backups: usize) -> Arc<dyn CatalogStore> {
    let usable = match JsonCatalogStore::new(dir.clone(), max_backups).await {
        Ok(store) => match probe_writable(&dir).await {
            Ok(()) => Some(store),
            Err(e) => {
                tracing::warn!("{:#}", e);
                None
            }
        },
        Err(e) => {
            tracing::warn!("{:#}", e);
            None
        }
    };

    match usable {
        Some(store) => Arc::new(store),
        None => {
            tracing::warn!(
                "Catalog directory {} is unusable, using in-memory catalog (data will not persist)",
                dir.display()
            );
            Arc::new(MemoryCatalogStore::new())
        }
    }
}

async fn probe_writable(dir: &Path) -> Result<()> {
    let probe = dir.join(".write-test");
    tokio::fs::write(&probe, b"")
        .await
        .with_context(|| format!("Catalog directory {} is not writable", dir.display()))?;
    let _ = tokio::fs::remove_file(&probe).await;
    Ok(())
}
