use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    #[serde(default = "default_max_download_bytes")]
    pub max_download_bytes: u64,
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
    /// Finished server-side jobs kept for status lookups.
    #[serde(default = "default_max_finished_jobs")]
    pub max_finished_jobs: usize,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8390
}

fn default_poll_interval_ms() -> u64 {
    4000
}

fn default_max_poll_attempts() -> u32 {
    150
}

fn default_download_timeout_secs() -> u64 {
    30
}

fn default_max_download_bytes() -> u64 {
    26_214_400 // 25MB
}

fn default_max_backups() -> usize {
    20
}

fn default_max_finished_jobs() -> usize {
    100
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: None,
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_attempts: default_max_poll_attempts(),
            download_timeout_secs: default_download_timeout_secs(),
            max_download_bytes: default_max_download_bytes(),
            max_backups: default_max_backups(),
            max_finished_jobs: default_max_finished_jobs(),
            provider: ProviderConfig::default(),
            remote: RemoteConfig::default(),
            classifier: ClassifierConfig::default(),
        }
    }
}

impl VaultConfig {
    /// Fill secrets and remote-tier settings from the environment.
    ///
    /// Values already present in the config file win over the environment.
    pub fn apply_env_overrides(&mut self) {
        if self.provider.api_key.is_none() {
            self.provider.api_key = env_non_empty("PROVIDER_API_KEY");
        }
        let remote = &mut self.remote;
        if remote.bucket.is_none() {
            remote.bucket = env_non_empty("AWS_S3_BUCKET_NAME");
        }
        if remote.region.is_none() {
            remote.region = env_non_empty("AWS_REGION");
        }
        if remote.public_base_url.is_none() {
            remote.public_base_url = env_non_empty("AWS_S3_PUBLIC_URL");
        }
        if remote.access_key_id.is_none() {
            remote.access_key_id = env_non_empty("AWS_ACCESS_KEY_ID");
        }
        if remote.secret_access_key.is_none() {
            remote.secret_access_key = env_non_empty("AWS_SECRET_ACCESS_KEY");
        }
        if remote.session_token.is_none() {
            remote.session_token = env_non_empty("AWS_SESSION_TOKEN");
        }
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Connection settings for the external generation provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Hosts besides the `api_base` host that may appear in polling handles.
    /// Matched exactly or as a dot-suffix. The API key is only ever sent to
    /// these hosts.
    #[serde(default = "default_handle_hosts")]
    pub handle_hosts: Vec<String>,
}

fn default_api_base() -> String {
    "https://api.bfl.ai/v1".to_string()
}

fn default_model() -> String {
    "flux-kontext-pro".to_string()
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_handle_hosts() -> Vec<String> {
    vec!["bfl.ai".to_string()]
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            model: default_model(),
            api_key: None,
            request_timeout_secs: default_request_timeout_secs(),
            handle_hosts: default_handle_hosts(),
        }
    }
}

/// S3-compatible object storage. The tier is enabled only when
/// [`RemoteConfig::is_configured`] holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    /// Custom endpoint for MinIO/LocalStack.
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// CDN or custom domain; defaults to the virtual-hosted bucket URL.
    #[serde(default)]
    pub public_base_url: Option<String>,
    #[serde(default = "default_remote_prefix")]
    pub prefix: String,
    /// Whole-request timeout; a stalled endpoint falls through to the next tier.
    #[serde(default = "default_remote_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default, skip_serializing)]
    pub access_key_id: Option<String>,
    #[serde(default, skip_serializing)]
    pub secret_access_key: Option<String>,
    #[serde(default, skip_serializing)]
    pub session_token: Option<String>,
}

fn default_remote_prefix() -> String {
    "generated-images".to_string()
}

fn default_remote_timeout_secs() -> u64 {
    20
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            region: None,
            endpoint_url: None,
            public_base_url: None,
            prefix: default_remote_prefix(),
            request_timeout_secs: default_remote_timeout_secs(),
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
        }
    }
}

impl RemoteConfig {
    pub fn is_configured(&self) -> bool {
        self.bucket.is_some()
            && self.region.is_some()
            && self.access_key_id.is_some()
            && self.secret_access_key.is_some()
    }
}

/// Inputs for ephemeral-URL detection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassifierConfig {
    /// Provider delivery hosts. Matched exactly or as a dot-suffix.
    #[serde(default = "default_ephemeral_hosts")]
    pub ephemeral_hosts: Vec<String>,
    /// Query parameter names marking a presigned URL. A trailing `-` makes
    /// the entry a prefix match.
    #[serde(default = "default_expiry_markers")]
    pub expiry_markers: Vec<String>,
    /// Path prefixes this crate hands out for stored artifacts.
    #[serde(default = "default_durable_prefixes")]
    pub durable_prefixes: Vec<String>,
}

fn default_ephemeral_hosts() -> Vec<String> {
    vec![
        "bfl.ai".to_string(),
        "delivery-us1.bfl.ai".to_string(),
        "delivery-eu1.bfl.ai".to_string(),
    ]
}

fn default_expiry_markers() -> Vec<String> {
    ["se", "sig", "sv", "expires", "signature", "x-amz-", "x-goog-"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_durable_prefixes() -> Vec<String> {
    vec!["/generated-images/".to_string(), "/uploads/".to_string()]
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            ephemeral_hosts: default_ephemeral_hosts(),
            expiry_markers: default_expiry_markers(),
            durable_prefixes: default_durable_prefixes(),
        }
    }
}
