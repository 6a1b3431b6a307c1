//! Decides whether an artifact reference is time-limited.
//!
//! A reference is ephemeral when its host belongs to a known generation
//! provider or when its query string carries presigned-URL expiry markers.
//! References this crate produced itself (local canonical prefixes, the
//! remote tier's public base URL) are always durable, so re-migrating an
//! already migrated artifact is a no-op.

use reqwest::Url;

use crate::models::ClassifierConfig;

#[derive(Debug, Clone)]
pub struct UrlClassifier {
    ephemeral_hosts: Vec<String>,
    expiry_markers: Vec<String>,
    durable_prefixes: Vec<String>,
}

impl UrlClassifier {
    pub fn new(config: &ClassifierConfig) -> Self {
        Self {
            ephemeral_hosts: config
                .ephemeral_hosts
                .iter()
                .map(|h| h.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
            expiry_markers: config
                .expiry_markers
                .iter()
                .map(|m| m.trim().to_ascii_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
            durable_prefixes: config
                .durable_prefixes
                .iter()
                .filter_map(|p| directory_prefix(p))
                .collect(),
        }
    }

    /// Also treat URIs under `base` as durable. Used for the remote tier's
    /// public URL so its own canonical URIs never look ephemeral.
    pub fn with_durable_prefix(mut self, base: impl Into<String>) -> Self {
        if let Some(prefix) = directory_prefix(&base.into()) {
            self.durable_prefixes.push(prefix);
        }
        self
    }

    pub fn is_ephemeral(&self, uri: &str) -> bool {
        let uri = uri.trim();
        if uri.is_empty() || self.is_durable(uri) {
            return false;
        }

        // Relative references cannot expire.
        let Ok(url) = Url::parse(uri) else {
            return false;
        };

        self.host_is_provider(&url) || self.has_expiry_marker(&url)
    }

    fn is_durable(&self, uri: &str) -> bool {
        self.durable_prefixes
            .iter()
            .any(|prefix| uri.starts_with(prefix.as_str()))
    }

    fn host_is_provider(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        self.ephemeral_hosts.iter().any(|allowed| {
            host == *allowed
                || host
                    .strip_suffix(allowed.as_str())
                    .is_some_and(|rest| rest.ends_with('.'))
        })
    }

    fn has_expiry_marker(&self, url: &Url) -> bool {
        url.query_pairs().any(|(name, _)| {
            let name = name.to_ascii_lowercase();
            self.expiry_markers.iter().any(|marker| {
                if marker.ends_with('-') {
                    name.starts_with(marker.as_str())
                } else {
                    name == *marker
                }
            })
        })
    }
}

/// Prefixes match whole path segments: `/media` covers `/media/a.png` but
/// not `/media-other/a.png`.
fn directory_prefix(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.ends_with('/') {
        Some(trimmed.to_string())
    } else {
        Some(format!("{}/", trimmed))
    }
}

impl Default for UrlClassifier {
    fn default() -> Self {
        Self::new(&ClassifierConfig::default())
    }
}

/// Last path segment of a URI, if it looks like a file name.
pub fn filename_hint(uri: &str) -> Option<String> {
    let path = match Url::parse(uri) {
        Ok(url) => url.path().to_string(),
        Err(_) => uri.split(['?', '#']).next().unwrap_or_default().to_string(),
    };
    path.rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .map(|segment| segment.to_string())
}

/// Lowercased extension of a file name, when it has a short alphanumeric one.
pub fn extension_of(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > 5 {
        return None;
    }
    if !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
