//! Moves artifacts from ephemeral references into tiered storage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Serialize;
use uuid::Uuid;

use crate::classifier::{extension_of, filename_hint, UrlClassifier};
use crate::clock::Clock;
use crate::errors::VaultError;
use crate::models::{ArtifactReference, CatalogEntry, DurableRecord};
use crate::storage::{sanitize_name, CatalogStore, TieredStorage};

const DEFAULT_EXTENSION: &str = "png";

#[derive(Debug, Clone)]
pub struct FetchedArtifact {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Retrieves artifact bytes over the network.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(&self, uri: &str) -> Result<FetchedArtifact, VaultError>;
    /// Whether `uri` currently answers a HEAD request with success.
    async fn head(&self, uri: &str) -> Result<bool, VaultError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
    max_bytes: u64,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, max_bytes: u64) -> Result<Self, VaultError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VaultError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, max_bytes })
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, uri: &str) -> Result<FetchedArtifact, VaultError> {
        let resp = self
            .client
            .get(uri)
            .send()
            .await
            .map_err(|e| VaultError::Download(format!("request to {} failed: {}", uri, e)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(VaultError::Download(format!(
                "HTTP {} fetching {}",
                status, uri
            )));
        }

        if let Some(len) = resp.content_length() {
            if len > self.max_bytes {
                return Err(VaultError::Download(format!(
                    "artifact is {} bytes, limit is {}",
                    len, self.max_bytes
                )));
            }
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or_default().trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty());

        let mut bytes = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| VaultError::Download(format!("reading {} failed: {}", uri, e)))?;
            if (bytes.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(VaultError::Download(format!(
                    "artifact exceeds {} bytes",
                    self.max_bytes
                )));
            }
            bytes.extend_from_slice(&chunk);
        }

        Ok(FetchedArtifact {
            bytes,
            content_type,
        })
    }

    async fn head(&self, uri: &str) -> Result<bool, VaultError> {
        match self.client.head(uri).send().await {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(e) if e.is_connect() || e.is_timeout() => Ok(false),
            Err(e) => Err(VaultError::Transport(e.to_string())),
        }
    }
}

/// Per-entry result of a catalog migration.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMigration {
    pub id: String,
    pub migrated: Vec<DurableRecord>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationSummary {
    pub updated: usize,
    pub failed: usize,
    pub skipped: usize,
    pub results: Vec<EntryMigration>,
}

pub struct ArtifactMigrator {
    classifier: UrlClassifier,
    fetcher: Arc<dyn ArtifactFetcher>,
    storage: Arc<TieredStorage>,
    clock: Arc<dyn Clock>,
}

impl ArtifactMigrator {
    pub fn new(
        classifier: UrlClassifier,
        fetcher: Arc<dyn ArtifactFetcher>,
        storage: Arc<TieredStorage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            classifier,
            fetcher,
            storage,
            clock,
        }
    }

    pub fn classifier(&self) -> &UrlClassifier {
        &self.classifier
    }

    pub fn storage(&self) -> &Arc<TieredStorage> {
        &self.storage
    }

    pub fn classify(&self, uri: &str) -> ArtifactReference {
        ArtifactReference {
            uri: uri.to_string(),
            is_ephemeral: self.classifier.is_ephemeral(uri),
        }
    }

    /// Make `reference` durable. References that are not ephemeral are
    /// wrapped as-is without touching the network.
    pub async fn migrate(
        &self,
        reference: &str,
        suggested_name: Option<&str>,
    ) -> Result<DurableRecord, VaultError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(VaultError::Validation("artifact reference is empty".to_string()));
        }
        if !self.classifier.is_ephemeral(reference) {
            tracing::debug!("{} is already durable", reference);
            return Ok(DurableRecord::already_durable(reference, self.clock.now()));
        }

        let fetched = self.fetcher.fetch(reference).await?;
        let ext = self.pick_extension(reference, fetched.content_type.as_deref());
        let name = match suggested_name.map(sanitize_name).filter(|n| !n.is_empty()) {
            Some(name) if extension_of(&name).is_some() => name,
            Some(name) => format!("{}.{}", name, ext),
            None => self.generate_filename(&ext),
        };
        let content_type = match fetched.content_type.as_deref() {
            Some(ct) if ct != "application/octet-stream" => ct.to_string(),
            _ => content_type_for(&name),
        };

        let record = self.storage.write(&fetched.bytes, &name, &content_type).await?;
        tracing::info!(
            "Migrated {} to {} ({})",
            reference,
            record.canonical_uri,
            record.tier
        );
        Ok(record)
    }

    /// HEAD probe of an absolute URI.
    pub async fn check_accessible(&self, uri: &str) -> Result<bool, VaultError> {
        if reqwest::Url::parse(uri).is_err() {
            return Err(VaultError::Validation(format!("'{}' is not an absolute URL", uri)));
        }
        self.fetcher.head(uri).await
    }

    /// Image references in `entry` that still need migrating.
    pub fn ephemeral_images(&self, entry: &CatalogEntry) -> Vec<String> {
        let mut found: Vec<String> = Vec::new();
        let candidates = entry.image_url.iter().chain(entry.generated_images.iter());
        for uri in candidates {
            if self.classifier.is_ephemeral(uri) && !found.contains(uri) {
                found.push(uri.clone());
            }
        }
        found
    }

    /// Migrate every ephemeral image of one catalog entry and store the
    /// updated entry.
    pub async fn migrate_entry(
        &self,
        catalog: &dyn CatalogStore,
        id: &str,
    ) -> Result<EntryMigration, VaultError> {
        let mut entry = catalog
            .get(id)
            .await
            .map_err(|e| VaultError::Storage(format!("{:#}", e)))?
            .ok_or_else(|| VaultError::NotFound(format!("Catalog entry '{}' not found", id)))?;

        let mut result = EntryMigration {
            id: id.to_string(),
            migrated: Vec::new(),
            errors: Vec::new(),
        };

        for uri in self.ephemeral_images(&entry) {
            match self.migrate(&uri, None).await {
                Ok(record) => {
                    entry.replace_image(&uri, &record.canonical_uri, record.tier, self.clock.now());
                    result.migrated.push(record);
                }
                Err(e) => {
                    tracing::warn!("Failed to migrate {} for entry {}: {}", uri, id, e);
                    result.errors.push(format!("{}: {}", uri, e));
                }
            }
        }

        if !result.migrated.is_empty() {
            catalog
                .upsert(entry)
                .await
                .map_err(|e| VaultError::Storage(format!("{:#}", e)))?;
        }
        Ok(result)
    }

    /// Migrate all entries with ephemeral images. An entry counts as updated
    /// when at least one image moved, and as failed when any image did not.
    pub async fn migrate_catalog(
        &self,
        catalog: &dyn CatalogStore,
    ) -> Result<MigrationSummary, VaultError> {
        let entries = catalog
            .list()
            .await
            .map_err(|e| VaultError::Storage(format!("{:#}", e)))?;

        let mut summary = MigrationSummary::default();
        for entry in entries {
            if self.ephemeral_images(&entry).is_empty() {
                summary.skipped += 1;
                continue;
            }
            let result = self.migrate_entry(catalog, &entry.id).await?;
            if !result.migrated.is_empty() {
                summary.updated += 1;
            }
            if !result.errors.is_empty() {
                summary.failed += 1;
            }
            summary.results.push(result);
        }

        tracing::info!(
            "Catalog migration finished: {} updated, {} failed, {} skipped",
            summary.updated,
            summary.failed,
            summary.skipped
        );
        Ok(summary)
    }

    fn pick_extension(&self, reference: &str, content_type: Option<&str>) -> String {
        filename_hint(reference)
            .and_then(|name| extension_of(&name))
            .or_else(|| content_type.and_then(extension_for))
            .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
    }

    /// `<unix-millis>-<8 hex>.<ext>`
    fn generate_filename(&self, ext: &str) -> String {
        let millis = self.clock.now().timestamp_millis();
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}-{}.{}", millis, &suffix[..8], ext)
    }
}

fn extension_for(content_type: &str) -> Option<String> {
    let ext = match content_type {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        other => return mime_guess::get_mime_extensions_str(other)?.first().map(|e| e.to_string()),
    };
    Some(ext.to_string())
}

/// MIME type from a file name, defaulting to octet-stream.
pub fn content_type_for(name: &str) -> String {
    mime_guess::from_path(name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}
