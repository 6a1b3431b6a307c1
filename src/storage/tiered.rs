use std::sync::Arc;

use serde::Serialize;

use crate::clock::Clock;
use crate::errors::VaultError;
use crate::models::{DurableRecord, StorageTier};
use crate::storage::{MemoryBackend, StorageBackend};

/// Summary of one configured tier, reported by the health endpoint.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TierInfo {
    pub tier: StorageTier,
    pub durable: bool,
}

/// Result of probing one tier at startup.
#[derive(Debug, Clone, Serialize)]
pub struct TierProbe {
    pub tier: StorageTier,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Ordered chain of storage backends, most durable first.
///
/// A write goes to the first tier that accepts it. Failures are logged and
/// the next tier is tried; an in-memory tier is always last so valid bytes
/// are never lost outright.
pub struct TieredStorage {
    tiers: Vec<Arc<dyn StorageBackend>>,
    clock: Arc<dyn Clock>,
}

impl TieredStorage {
    pub fn new(mut tiers: Vec<Arc<dyn StorageBackend>>, clock: Arc<dyn Clock>) -> Self {
        if !tiers.iter().any(|t| t.tier() == StorageTier::Memory) {
            tiers.push(Arc::new(MemoryBackend::new()));
        }
        Self { tiers, clock }
    }

    pub fn describe(&self) -> Vec<TierInfo> {
        self.tiers
            .iter()
            .map(|t| TierInfo {
                tier: t.tier(),
                durable: t.tier().is_durable(),
            })
            .collect()
    }

    pub async fn probe_all(&self) -> Vec<TierProbe> {
        let mut results = Vec::with_capacity(self.tiers.len());
        for backend in &self.tiers {
            let probe = match backend.probe().await {
                Ok(()) => TierProbe {
                    tier: backend.tier(),
                    ok: true,
                    error: None,
                },
                Err(e) => TierProbe {
                    tier: backend.tier(),
                    ok: false,
                    error: Some(format!("{:#}", e)),
                },
            };
            results.push(probe);
        }
        results
    }

    pub async fn write(
        &self,
        bytes: &[u8],
        name: &str,
        content_type: &str,
    ) -> Result<DurableRecord, VaultError> {
        if bytes.is_empty() {
            return Err(VaultError::Validation("artifact is empty".to_string()));
        }

        let mut last_error = None;
        for backend in &self.tiers {
            match backend.write(bytes, name, content_type).await {
                Ok(stored) => {
                    if !stored.tier.is_durable() {
                        tracing::warn!(
                            "Artifact '{}' stored in degraded tier '{}', data may not persist",
                            name,
                            stored.tier
                        );
                    }
                    return Ok(DurableRecord::from_stored(stored, content_type, self.clock.now()));
                }
                Err(e) => {
                    tracing::warn!(
                        "Storage tier '{}' failed for '{}', trying next: {:#}",
                        backend.tier(),
                        name,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(VaultError::Storage(match last_error {
            Some(e) => format!("all storage tiers failed: {:#}", e),
            None => "no storage tiers configured".to_string(),
        }))
    }

    /// First tier holding `name` wins.
    pub async fn read(&self, name: &str) -> Result<Option<(StorageTier, Vec<u8>)>, VaultError> {
        for backend in &self.tiers {
            match backend.read(name).await {
                Ok(Some(bytes)) => return Ok(Some((backend.tier(), bytes))),
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Read from tier '{}' failed: {:#}", backend.tier(), e);
                }
            }
        }
        Ok(None)
    }

    /// Removes `name` from every tier; true when any tier held it.
    pub async fn delete(&self, name: &str) -> Result<bool, VaultError> {
        let mut removed = false;
        for backend in &self.tiers {
            match backend.delete(name).await {
                Ok(existed) => removed |= existed,
                Err(e) => {
                    tracing::warn!("Delete from tier '{}' failed: {:#}", backend.tier(), e);
                }
            }
        }
        Ok(removed)
    }
}
