pub mod catalog;
pub mod local;
pub mod memory;
pub mod remote;
pub mod tiered;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{CatalogEntry, StorageTier, StoredObject};

pub use catalog::{open_catalog, JsonCatalogStore, MemoryCatalogStore};
pub use local::LocalFileBackend;
pub use memory::MemoryBackend;
pub use remote::RemoteObjectBackend;
pub use tiered::{TierInfo, TieredStorage};

/// Uniform contract every durable storage tier implements.
///
/// `name` is the flat artifact file name chosen by the caller. Each backend
/// places it inside its own namespace and reports the internal key back in
/// [`StoredObject::key`].
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn tier(&self) -> StorageTier;
    async fn probe(&self) -> Result<()>;
    async fn write(&self, bytes: &[u8], name: &str, content_type: &str) -> Result<StoredObject>;
    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>>;
    async fn delete(&self, name: &str) -> Result<bool>;
}

/// Record store for the project catalog snapshot.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn list(&self) -> Result<Vec<CatalogEntry>>;
    async fn get(&self, id: &str) -> Result<Option<CatalogEntry>>;
    async fn upsert(&self, entry: CatalogEntry) -> Result<CatalogEntry>;
    async fn delete(&self, id: &str) -> Result<bool>;
    /// Merge entries from a JSON export, skipping ids already present.
    /// Returns the number of entries added.
    async fn import_json(&self, json: &str) -> Result<usize>;
    async fn export_json(&self) -> Result<String>;
    /// Replace the current snapshot with the newest backup. Returns a
    /// description of the backup used, or None when there is nothing to restore.
    async fn restore_latest_backup(&self) -> Result<Option<String>>;
    fn is_persistent(&self) -> bool;
}

/// Sanitize an artifact name to prevent path traversal. Keeps ASCII
/// alphanumerics, `-`, `_` and `.`; everything else becomes `_`.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();
    cleaned.trim_start_matches('.').to_string()
}
