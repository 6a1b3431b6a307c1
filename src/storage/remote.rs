//! S3-compatible object storage tier.
//!
//! Requests are signed with AWS Signature Version 4 directly over reqwest.
//! With a custom `endpoint_url` (MinIO, LocalStack) path-style addressing is
//! used; otherwise requests go to the virtual-hosted bucket host.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode, Url};
use sha2::{Digest, Sha256};

use crate::models::{RemoteConfig, StorageTier, StoredObject};
use crate::storage::{sanitize_name, StorageBackend};

type HmacSha256 = Hmac<Sha256>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct Credentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

pub struct RemoteObjectBackend {
    client: reqwest::Client,
    bucket: String,
    region: String,
    endpoint: Option<Url>,
    public_base: String,
    prefix: String,
    creds: Credentials,
}

impl RemoteObjectBackend {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.request_timeout_secs.max(1));
        let client = reqwest::Client::builder()
            .connect_timeout(timeout.min(CONNECT_TIMEOUT))
            .timeout(timeout)
            .build()
            .context("Failed to build remote storage client")?;
        Self::with_client(config, client)
    }

    pub fn with_client(config: &RemoteConfig, client: reqwest::Client) -> Result<Self> {
        let (Some(bucket), Some(region), Some(access_key_id), Some(secret_access_key)) = (
            config.bucket.clone(),
            config.region.clone(),
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
        ) else {
            bail!("remote storage requires bucket, region and credentials");
        };

        let endpoint = match config.endpoint_url.as_deref() {
            Some(raw) => Some(
                Url::parse(raw.trim_end_matches('/'))
                    .with_context(|| format!("Invalid endpoint_url '{}'", raw))?,
            ),
            None => None,
        };

        let public_base = match (&config.public_base_url, &endpoint) {
            (Some(base), _) => base.trim_end_matches('/').to_string(),
            (None, Some(ep)) => format!("{}/{}", ep.as_str().trim_end_matches('/'), bucket),
            (None, None) => format!("https://{}.s3.{}.amazonaws.com", bucket, region),
        };

        Ok(Self {
            client,
            bucket,
            region,
            endpoint,
            public_base,
            prefix: config.prefix.trim_matches('/').to_string(),
            creds: Credentials {
                access_key_id,
                secret_access_key,
                session_token: config.session_token.clone(),
            },
        })
    }

    /// Base URL of publicly addressable objects, without trailing slash.
    pub fn public_base(&self) -> &str {
        &self.public_base
    }

    fn object_key(&self, name: &str) -> Result<String> {
        let name = sanitize_name(name);
        if name.is_empty() {
            bail!("artifact name is empty after sanitizing");
        }
        if self.prefix.is_empty() {
            Ok(name)
        } else {
            Ok(format!("{}/{}", self.prefix, name))
        }
    }

    /// Host header value plus the request URL and canonical path for `key`.
    /// An empty key addresses the bucket itself.
    fn locate(&self, key: &str) -> (String, String, String) {
        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        match &self.endpoint {
            Some(ep) => {
                let host = match (ep.host_str(), ep.port()) {
                    (Some(h), Some(p)) => format!("{}:{}", h, p),
                    (Some(h), None) => h.to_string(),
                    (None, _) => String::new(),
                };
                let canonical_uri = if encoded_key.is_empty() {
                    format!("/{}", uri_encode(&self.bucket))
                } else {
                    format!("/{}/{}", uri_encode(&self.bucket), encoded_key)
                };
                let url = format!("{}://{}{}", ep.scheme(), host, canonical_uri);
                (host, url, canonical_uri)
            }
            None => {
                let host = format!("{}.s3.{}.amazonaws.com", self.bucket, self.region);
                let canonical_uri = format!("/{}", encoded_key);
                let url = format!("https://{}{}", host, canonical_uri);
                (host, url, canonical_uri)
            }
        }
    }

    fn signed_request(
        &self,
        method: Method,
        key: &str,
        payload: Vec<u8>,
    ) -> Result<reqwest::RequestBuilder> {
        let (host, url, canonical_uri) = self.locate(key);

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(&payload);

        let mut headers = vec![
            ("host".to_string(), host),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key =
            derive_signing_key(&self.creds.secret_access_key, &date_stamp, &self.region, "s3")?;
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut builder = self
            .client
            .request(method, &url)
            .header("Authorization", authorization)
            .header("x-amz-content-sha256", payload_hash)
            .header("x-amz-date", amz_date);
        if let Some(ref token) = self.creds.session_token {
            builder = builder.header("x-amz-security-token", token);
        }
        if !payload.is_empty() {
            builder = builder.body(payload);
        }
        Ok(builder)
    }

    async fn head(&self, key: &str) -> Result<bool> {
        let resp = self
            .signed_request(Method::HEAD, key, Vec::new())?
            .send()
            .await
            .with_context(|| format!("HEAD s3://{}/{} failed", self.bucket, key))?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => bail!("S3 HeadObject failed (HTTP {}) for key '{}'", s, key),
        }
    }
}

#[async_trait]
impl StorageBackend for RemoteObjectBackend {
    fn tier(&self) -> StorageTier {
        StorageTier::RemoteObject
    }

    async fn probe(&self) -> Result<()> {
        let resp = self
            .signed_request(Method::HEAD, "", Vec::new())?
            .send()
            .await
            .with_context(|| format!("Bucket '{}' unreachable", self.bucket))?;
        if !resp.status().is_success() {
            bail!("S3 HeadBucket failed (HTTP {}) for '{}'", resp.status(), self.bucket);
        }
        Ok(())
    }

    async fn write(&self, bytes: &[u8], name: &str, content_type: &str) -> Result<StoredObject> {
        let key = self.object_key(name)?;
        let resp = self
            .signed_request(Method::PUT, &key, bytes.to_vec())?
            .header("Content-Type", content_type)
            .send()
            .await
            .with_context(|| format!("Failed to put s3://{}/{}", self.bucket, key))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("S3 PutObject failed (HTTP {}) for key '{}': {}", status, key, body.trim());
        }

        tracing::info!("Uploaded {} bytes to s3://{}/{}", bytes.len(), self.bucket, key);

        Ok(StoredObject {
            tier: StorageTier::RemoteObject,
            canonical_uri: format!("{}/{}", self.public_base, key),
            key,
            size_bytes: bytes.len() as u64,
        })
    }

    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let key = self.object_key(name)?;
        let resp = self
            .signed_request(Method::GET, &key, Vec::new())?
            .send()
            .await
            .with_context(|| format!("Failed to get s3://{}/{}", self.bucket, key))?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(resp.bytes().await?.to_vec())),
            s => bail!("S3 GetObject failed (HTTP {}) for key '{}'", s, key),
        }
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let key = self.object_key(name)?;
        // DeleteObject answers 204 whether or not the key existed.
        if !self.head(&key).await? {
            return Ok(false);
        }
        let resp = self
            .signed_request(Method::DELETE, &key, Vec::new())?
            .send()
            .await
            .with_context(|| format!("Failed to delete s3://{}/{}", self.bucket, key))?;
        if !resp.status().is_success() {
            bail!("S3 DeleteObject failed (HTTP {}) for key '{}'", resp.status(), key);
        }
        Ok(true)
    }
}

// ============ AWS SigV4 Helpers ============

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).context("invalid HMAC key")?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// kSigning = HMAC(HMAC(HMAC(HMAC("AWS4" + secret, date), region), service), "aws4_request")
fn derive_signing_key(
    secret_key: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>> {
    let k_date = hmac_sha256(format!("AWS4{}", secret_key).as_bytes(), date_stamp.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding, leaving only `A-Z a-z 0-9 - _ . ~` untouched.
fn uri_encode(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char)
            }
            _ => result.push_str(&format!("%{:02X}", byte)),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::{
        body::Bytes,
        extract::State,
        http::{HeaderMap, StatusCode as AxumStatus},
        routing::put,
        Router,
    };

    fn config() -> RemoteConfig {
        RemoteConfig {
            bucket: Some("art".to_string()),
            region: Some("eu-central-1".to_string()),
            access_key_id: Some("AKIDEXAMPLE".to_string()),
            secret_access_key: Some("wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_derive_signing_key_matches_aws_reference() {
        // Reference vector from the AWS SigV4 documentation
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        )
        .unwrap();
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn test_uri_encode() {
        assert_eq!(uri_encode("a-b_c.d~e"), "a-b_c.d~e");
        assert_eq!(uri_encode("a b"), "a%20b");
        assert_eq!(uri_encode("a/b"), "a%2Fb");
    }

    #[test]
    fn test_new_requires_credentials() {
        let mut cfg = config();
        cfg.secret_access_key = None;
        assert!(RemoteObjectBackend::new(&cfg).is_err());
    }

    #[test]
    fn test_default_public_base_is_virtual_hosted() {
        let backend = RemoteObjectBackend::new(&config()).unwrap();
        assert_eq!(backend.public_base(), "https://art.s3.eu-central-1.amazonaws.com");
        let (host, url, canonical) = backend.locate("generated-images/a.png");
        assert_eq!(host, "art.s3.eu-central-1.amazonaws.com");
        assert_eq!(url, "https://art.s3.eu-central-1.amazonaws.com/generated-images/a.png");
        assert_eq!(canonical, "/generated-images/a.png");
    }

    #[test]
    fn test_custom_endpoint_uses_path_style() {
        let mut cfg = config();
        cfg.endpoint_url = Some("http://localhost:9000/".to_string());
        let backend = RemoteObjectBackend::new(&cfg).unwrap();
        let (host, url, canonical) = backend.locate("generated-images/a.png");
        assert_eq!(host, "localhost:9000");
        assert_eq!(url, "http://localhost:9000/art/generated-images/a.png");
        assert_eq!(canonical, "/art/generated-images/a.png");
        assert_eq!(backend.public_base(), "http://localhost:9000/art");
    }

    #[test]
    fn test_public_base_override() {
        let mut cfg = config();
        cfg.public_base_url = Some("https://cdn.example.com/".to_string());
        let backend = RemoteObjectBackend::new(&cfg).unwrap();
        assert_eq!(backend.public_base(), "https://cdn.example.com");
    }

    #[derive(Default)]
    struct Captured {
        path: Option<String>,
        authorization: Option<String>,
        content_type: Option<String>,
        body: Vec<u8>,
    }

    async fn fake_put(
        State(seen): State<Arc<Mutex<Captured>>>,
        uri: axum::http::Uri,
        headers: HeaderMap,
        body: Bytes,
    ) -> AxumStatus {
        let mut seen = seen.lock().unwrap();
        seen.path = Some(uri.path().to_string());
        seen.authorization = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        seen.content_type = headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        seen.body = body.to_vec();
        AxumStatus::OK
    }

    #[tokio::test]
    async fn test_write_puts_signed_object() {
        let seen = Arc::new(Mutex::new(Captured::default()));
        let app = Router::new()
            .route("/{*path}", put(fake_put))
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut cfg = config();
        cfg.endpoint_url = Some(format!("http://{}", addr));
        let backend = RemoteObjectBackend::new(&cfg).unwrap();

        let stored = backend.write(b"img", "x.png", "image/png").await.unwrap();
        assert_eq!(stored.tier, StorageTier::RemoteObject);
        assert_eq!(stored.key, "generated-images/x.png");
        assert_eq!(
            stored.canonical_uri,
            format!("http://{}/art/generated-images/x.png", addr)
        );

        let seen = seen.lock().unwrap();
        assert_eq!(seen.path.as_deref(), Some("/art/generated-images/x.png"));
        assert_eq!(seen.content_type.as_deref(), Some("image/png"));
        assert_eq!(seen.body, b"img");
        let auth = seen.authorization.clone().unwrap();
        assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
        assert!(auth.contains("/eu-central-1/s3/aws4_request"));
        assert!(auth.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date"));
    }

    #[tokio::test]
    async fn test_stalled_endpoint_falls_back_to_local_tier() {
        use crate::clock::SystemClock;
        use crate::storage::{LocalFileBackend, TieredStorage};

        // Accepts connections and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let mut cfg = config();
        cfg.endpoint_url = Some(format!("http://{}", addr));
        cfg.request_timeout_secs = 1;
        let tmp = tempfile::TempDir::new().unwrap();
        let tiers: Vec<Arc<dyn StorageBackend>> = vec![
            Arc::new(RemoteObjectBackend::new(&cfg).unwrap()),
            Arc::new(LocalFileBackend::new(tmp.path())),
        ];
        let storage = TieredStorage::new(tiers, Arc::new(SystemClock));

        let record = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            storage.write(b"img", "stalled.png", "image/png"),
        )
        .await
        .expect("write should not hang on a silent remote")
        .unwrap();
        assert_eq!(record.tier, StorageTier::LocalFile);
        assert!(tmp.path().join("generated-images").join("stalled.png").exists());
    }

    #[tokio::test]
    async fn test_write_fails_on_rejected_put() {
        let app = Router::new().route("/{*path}", put(|| async { AxumStatus::FORBIDDEN }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut cfg = config();
        cfg.endpoint_url = Some(format!("http://{}", addr));
        let backend = RemoteObjectBackend::new(&cfg).unwrap();
        let err = backend.write(b"img", "x.png", "image/png").await.unwrap_err();
        assert!(err.to_string().contains("403"));
    }
}
