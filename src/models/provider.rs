use serde::{Deserialize, Serialize};

use crate::errors::VaultError;

/// Opaque request payload forwarded to the provider as-is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(transparent)]
pub struct GenerationRequest(pub serde_json::Value);

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    #[serde(default, alias = "pollingHandle", alias = "pollingUrl")]
    pub polling_url: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

impl SubmitResponse {
    /// The polling handle, or a submission error when the provider gave none.
    pub fn into_handle(self) -> Result<String, VaultError> {
        match self.polling_url {
            Some(url) if !url.trim().is_empty() => Ok(url),
            _ => Err(VaultError::Submission(
                "provider response did not include a polling handle".to_string(),
            )),
        }
    }
}

/// Provider job status after decoding. Closed: anything the provider sends
/// that is not listed here is rejected at the boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ProviderStatus {
    Queued,
    Processing,
    Ready { sample: String },
    Failed { detail: String },
}

impl ProviderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProviderStatus::Ready { .. } | ProviderStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawPollResponse {
    pub status: String,
    #[serde(default)]
    pub result: Option<RawPollResult>,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawPollResult {
    #[serde(default)]
    pub sample: Option<String>,
}

impl TryFrom<RawPollResponse> for ProviderStatus {
    type Error = VaultError;

    fn try_from(raw: RawPollResponse) -> Result<Self, Self::Error> {
        match raw.status.as_str() {
            "Queued" | "Pending" => Ok(ProviderStatus::Queued),
            "Processing" => Ok(ProviderStatus::Processing),
            "Ready" => {
                let sample = raw
                    .result
                    .and_then(|r| r.sample)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        VaultError::Transport("Ready status without result.sample".to_string())
                    })?;
                Ok(ProviderStatus::Ready { sample })
            }
            "Failed" | "Error" | "Content Moderated" | "Request Moderated" | "Task not found" => {
                let detail = match raw.details {
                    Some(serde_json::Value::String(s)) => s,
                    Some(serde_json::Value::Null) | None => {
                        format!("Generation failed on provider ({})", raw.status)
                    }
                    Some(other) => other.to_string(),
                };
                Ok(ProviderStatus::Failed { detail })
            }
            other => Err(VaultError::Transport(format!(
                "unknown provider status '{}'",
                other
            ))),
        }
    }
}
