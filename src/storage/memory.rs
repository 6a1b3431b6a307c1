use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::models::{StorageTier, StoredObject};
use crate::storage::{sanitize_name, StorageBackend};

/// URL prefix under which the server exposes memory-held artifacts.
pub const MEMORY_URI_PREFIX: &str = "/api/artifacts/memory";

/// Degraded backstop tier. Writes always succeed but vanish with the process.
#[derive(Default)]
pub struct MemoryBackend {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn tier(&self) -> StorageTier {
        StorageTier::Memory
    }

    async fn probe(&self) -> Result<()> {
        Ok(())
    }

    async fn write(&self, bytes: &[u8], name: &str, _content_type: &str) -> Result<StoredObject> {
        let mut key = sanitize_name(name);
        if key.is_empty() {
            key = uuid::Uuid::new_v4().simple().to_string();
        }
        self.objects.write().await.insert(key.clone(), bytes.to_vec());
        tracing::warn!(
            "Artifact '{}' held in process memory only, it will not survive a restart",
            key
        );
        Ok(StoredObject {
            tier: StorageTier::Memory,
            canonical_uri: format!("{}/{}", MEMORY_URI_PREFIX, key),
            key,
            size_bytes: bytes.len() as u64,
        })
    }

    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.read().await.get(&sanitize_name(name)).cloned())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        Ok(self
            .objects
            .write()
            .await
            .remove(&sanitize_name(name))
            .is_some())
    }
}
