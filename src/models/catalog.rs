use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::VaultError;
use crate::models::artifact::StorageTier;

/// A project record as far as artifact durability is concerned. Fields owned
/// by the rest of the application are carried through `extra` untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub generated_images: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_tier: Option<StorageTier>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CatalogEntry {
    /// Point the entry at a new image location, replacing `old` in
    /// `generated_images` or appending when it was not listed.
    pub fn replace_image(&mut self, old: &str, new_uri: &str, tier: StorageTier, now: DateTime<Utc>) {
        if self.image_url.as_deref() == Some(old) || self.image_url.is_none() {
            self.image_url = Some(new_uri.to_string());
        }
        match self.generated_images.iter().position(|img| img == old) {
            Some(idx) => self.generated_images[idx] = new_uri.to_string(),
            None => self.generated_images.push(new_uri.to_string()),
        }
        self.storage_tier = Some(tier);
        self.updated_at = now;
    }
}

pub fn validate_entry(entry: &CatalogEntry) -> Result<(), VaultError> {
    if entry.id.trim().is_empty() {
        return Err(VaultError::Validation("Entry id cannot be empty".to_string()));
    }
    if entry.name.trim().is_empty() {
        return Err(VaultError::Validation(
            "Entry name cannot be empty".to_string(),
        ));
    }
    Ok(())
}
