use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;

use crate::errors::VaultError;
use crate::models::{GenerationRequest, ProviderConfig, ProviderStatus, RawPollResponse, SubmitResponse};

/// Client side of the external generation provider.
///
/// Implementations return the raw status document; decoding into the closed
/// [`ProviderStatus`] enum happens once, in [`GenerationProvider::poll_status`].
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Start a job. Returns the polling handle.
    async fn submit(&self, request: &GenerationRequest) -> Result<String, VaultError>;

    /// One status query, undecoded.
    async fn fetch_status(&self, handle: &str) -> Result<serde_json::Value, VaultError>;

    async fn poll_status(&self, handle: &str) -> Result<ProviderStatus, VaultError> {
        let raw = self.fetch_status(handle).await?;
        let raw: RawPollResponse = serde_json::from_value(raw)
            .map_err(|e| VaultError::Transport(format!("malformed status response: {}", e)))?;
        ProviderStatus::try_from(raw)
    }
}

/// Whether `handle` points at the provider: the `api_base` host or one of
/// `handle_hosts`, over http(s).
pub fn is_provider_handle(config: &ProviderConfig, handle: &str) -> bool {
    let Ok(url) = Url::parse(handle.trim()) else {
        return false;
    };
    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }
    let Some(host) = url.host_str().map(|h| h.to_ascii_lowercase()) else {
        return false;
    };

    if let Ok(base) = Url::parse(&config.api_base) {
        let same_origin = base.host_str().map(|h| h.to_ascii_lowercase()).as_deref()
            == Some(host.as_str())
            && base.port_or_known_default() == url.port_or_known_default();
        if same_origin {
            return true;
        }
    }

    config.handle_hosts.iter().any(|allowed| {
        let allowed = allowed.trim().trim_start_matches('.').to_ascii_lowercase();
        !allowed.is_empty()
            && (host == allowed
                || host
                    .strip_suffix(allowed.as_str())
                    .is_some_and(|rest| rest.ends_with('.')))
    })
}

pub struct HttpProvider {
    client: reqwest::Client,
    config: ProviderConfig,
}

impl HttpProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, VaultError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| VaultError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn api_key(&self) -> Result<&str, VaultError> {
        self.config
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| VaultError::Config("provider API key is not configured".to_string()))
    }

    fn submit_url(&self) -> String {
        format!(
            "{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.model.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl GenerationProvider for HttpProvider {
    async fn submit(&self, request: &GenerationRequest) -> Result<String, VaultError> {
        let api_key = self.api_key()?;
        let url = self.submit_url();
        tracing::debug!("Submitting generation request to {}", url);

        let resp = self
            .client
            .post(&url)
            .header("x-key", api_key)
            .json(&request.0)
            .send()
            .await
            .map_err(|e| VaultError::Submission(format!("request to {} failed: {}", url, e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(VaultError::Submission(format!(
                "provider rejected submission (HTTP {}): {}",
                status,
                body.trim()
            )));
        }

        let parsed: SubmitResponse = resp
            .json()
            .await
            .map_err(|e| VaultError::Submission(format!("unreadable submit response: {}", e)))?;
        let handle = parsed.into_handle()?;
        tracing::info!("Generation started, polling handle {}", handle);
        Ok(handle)
    }

    async fn fetch_status(&self, handle: &str) -> Result<serde_json::Value, VaultError> {
        if !is_provider_handle(&self.config, handle) {
            return Err(VaultError::Validation(format!(
                "polling handle '{}' is not a provider URL",
                handle
            )));
        }
        let api_key = self.api_key()?;
        let resp = self
            .client
            .get(handle)
            .header("x-key", api_key)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(VaultError::Transport(format!(
                "status query failed (HTTP {}): {}",
                status,
                body.trim()
            )));
        }

        Ok(resp.json().await?)
    }
}
