use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which backend ultimately holds an artifact.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum StorageTier {
    RemoteObject,
    LocalFile,
    Memory,
    /// The reference was never ephemeral; nothing was stored.
    AlreadyDurable,
    /// Migration failed; the record still points at the ephemeral URI.
    Unmigrated,
}

impl StorageTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageTier::RemoteObject => "remote-object",
            StorageTier::LocalFile => "local-file",
            StorageTier::Memory => "memory",
            StorageTier::AlreadyDurable => "already-durable",
            StorageTier::Unmigrated => "unmigrated",
        }
    }

    /// False for tiers that cannot promise the artifact survives a restart.
    pub fn is_durable(&self) -> bool {
        !matches!(self, StorageTier::Memory | StorageTier::Unmigrated)
    }

    /// The `storageType` value of the migration endpoint.
    pub fn storage_type(&self) -> Option<&'static str> {
        match self {
            StorageTier::RemoteObject => Some("s3"),
            StorageTier::LocalFile => Some("local"),
            StorageTier::Memory => Some("memory"),
            StorageTier::AlreadyDurable | StorageTier::Unmigrated => None,
        }
    }
}

impl std::fmt::Display for StorageTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactReference {
    pub uri: String,
    pub is_ephemeral: bool,
}

/// What a single backend reports after accepting a write.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub tier: StorageTier,
    pub canonical_uri: String,
    pub key: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DurableRecord {
    pub tier: StorageTier,
    pub canonical_uri: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl DurableRecord {
    pub fn from_stored(stored: StoredObject, content_type: &str, now: DateTime<Utc>) -> Self {
        Self {
            tier: stored.tier,
            canonical_uri: stored.canonical_uri,
            key: stored.key,
            content_type: Some(content_type.to_string()),
            size_bytes: stored.size_bytes,
            created_at: now,
        }
    }

    pub fn already_durable(uri: &str, now: DateTime<Utc>) -> Self {
        Self::wrapping(StorageTier::AlreadyDurable, uri, now)
    }

    pub fn unmigrated(uri: &str, now: DateTime<Utc>) -> Self {
        Self::wrapping(StorageTier::Unmigrated, uri, now)
    }

    fn wrapping(tier: StorageTier, uri: &str, now: DateTime<Utc>) -> Self {
        Self {
            tier,
            canonical_uri: uri.to_string(),
            key: uri.to_string(),
            content_type: None,
            size_bytes: 0,
            created_at: now,
        }
    }

    pub fn is_durable(&self) -> bool {
        self.tier.is_durable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_tier_serde_kebab_case() {
        let json = serde_json::to_string(&StorageTier::LocalFile).expect("serialize");
        assert_eq!(json, "\"local-file\"");
        let tier: StorageTier = serde_json::from_str("\"remote-object\"").expect("deserialize");
        assert_eq!(tier, StorageTier::RemoteObject);
    }

    #[test]
    fn test_storage_tier_display_matches_serde() {
        for tier in [
            StorageTier::RemoteObject,
            StorageTier::LocalFile,
            StorageTier::Memory,
            StorageTier::AlreadyDurable,
            StorageTier::Unmigrated,
        ] {
            let json = serde_json::to_string(&tier).expect("serialize");
            assert_eq!(json, format!("\"{}\"", tier));
        }
    }

    #[test]
    fn test_degraded_tiers_are_not_durable() {
        assert!(StorageTier::RemoteObject.is_durable());
        assert!(StorageTier::LocalFile.is_durable());
        assert!(StorageTier::AlreadyDurable.is_durable());
        assert!(!StorageTier::Memory.is_durable());
        assert!(!StorageTier::Unmigrated.is_durable());
    }

    #[test]
    fn test_storage_type_mapping() {
        assert_eq!(StorageTier::RemoteObject.storage_type(), Some("s3"));
        assert_eq!(StorageTier::LocalFile.storage_type(), Some("local"));
        assert_eq!(StorageTier::Memory.storage_type(), Some("memory"));
        assert_eq!(StorageTier::AlreadyDurable.storage_type(), None);
    }

    #[test]
    fn test_unmigrated_record_wraps_original_uri() {
        let uri = "https://delivery-eu1.bfl.ai/results/x.png";
        let record = DurableRecord::unmigrated(uri, Utc::now());
        assert_eq!(record.canonical_uri, uri);
        assert_eq!(record.tier, StorageTier::Unmigrated);
        assert!(!record.is_durable());
    }
}
