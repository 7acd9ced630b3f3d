//! Package delivery over HTTP(S)
//!
//! The encoded package is uploaded in chunks
//! (`PUT {base}packages/{id}/chunks/{n}`) and then committed
//! (`POST {base}packages/{id}/commit`) with the manifest as JSON.

use std::time::Duration;

use contracts::ServerConfig;
use reqwest::header::CONTENT_TYPE;
use reqwest::{RequestBuilder, StatusCode, Url};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::{PackagerError, Result};
use crate::package::{Package, PackageManifest};

/// Host of the hosted collector
pub const DEFAULT_HUB: &str = "hub.beacon.dev";

const CHUNK_COUNT_HEADER: &str = "X-Beacon-Chunk-Count";

/// Resolved collector base URL (always ends in `/`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    base: Url,
}

impl Endpoint {
    /// Resolve the destination named by `config`
    ///
    /// A customer key wins over an explicit host. Fails with
    /// `Configuration` when neither is usable.
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let base = match (config.customer_key.as_deref(), config.host.as_deref()) {
            (Some(key), _) if !key.is_empty() => {
                if !valid_customer_key(key) {
                    return Err(PackagerError::configuration(format!(
                        "invalid customer key '{key}'"
                    )));
                }
                format!("https://{DEFAULT_HUB}/customers/{key}/")
            }
            (_, Some(host)) if !host.is_empty() => {
                let scheme = if config.use_ssl { "https" } else { "http" };
                let port = match config.port {
                    Some(0) => return Err(PackagerError::configuration("server port must be non-zero")),
                    Some(port) => port,
                    None if config.use_ssl => 443,
                    None => 80,
                };
                let path = config
                    .base_path
                    .as_deref()
                    .map(|p| p.trim_matches('/'))
                    .filter(|p| !p.is_empty())
                    .map(|p| format!("{p}/"))
                    .unwrap_or_default();
                format!("{scheme}://{host}:{port}/{path}")
            }
            _ => {
                return Err(PackagerError::configuration(
                    "no server configured: set server.customer_key or server.host",
                ))
            }
        };
        let base = Url::parse(&base)
            .map_err(|e| PackagerError::configuration(format!("invalid server address '{base}': {e}")))?;
        Ok(Self { base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn join(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| PackagerError::configuration(format!("invalid request path '{path}': {e}")))
    }

    pub fn chunk_url(&self, package_id: Uuid, chunk: usize) -> Result<Url> {
        self.join(&format!("packages/{package_id}/chunks/{chunk}"))
    }

    pub fn commit_url(&self, package_id: Uuid) -> Result<Url> {
        self.join(&format!("packages/{package_id}/commit"))
    }
}

fn valid_customer_key(key: &str) -> bool {
    key.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Exponential backoff for recoverable failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt + 1`
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// One package ready to upload
#[derive(Debug, Clone)]
pub struct Upload {
    pub package_id: Uuid,
    pub manifest: PackageManifest,
    /// Encoded package file
    pub payload: Vec<u8>,
    pub chunk_size: usize,
}

impl Upload {
    pub fn new(package: &Package, chunk_size: usize) -> Result<Self> {
        Ok(Self {
            package_id: package.id(),
            manifest: package.manifest().clone(),
            payload: package.encode()?,
            chunk_size: chunk_size.max(1),
        })
    }

    pub fn chunks(&self) -> impl ExactSizeIterator<Item = &[u8]> {
        self.payload.chunks(self.chunk_size)
    }
}

/// Delivers an upload to an endpoint
///
/// Implementations must check `cancel` between chunks and retries and
/// return `PackagerError::Canceled` once it fires.
#[trait_variant::make(Transport: Send)]
pub trait LocalTransport {
    async fn deliver(
        &self,
        endpoint: &Endpoint,
        upload: &Upload,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// reqwest-backed transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpTransport {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("beacon/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PackagerError::configuration(format!("http client: {e}")))?;
        Ok(Self {
            client,
            retry: RetryPolicy::from_config(config),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Send one request, retrying recoverable failures
    async fn send_with_retry<F>(&self, what: &str, cancel: &CancellationToken, request: F) -> Result<()>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(PackagerError::Canceled);
            }
            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(PackagerError::Canceled),
                response = request().send() => response,
            };
            let error = match response {
                Ok(response) => match classify_status(response.status()) {
                    Ok(()) => return Ok(()),
                    Err(e) => e,
                },
                Err(e) => classify_error(&e),
            };
            if !error.is_recoverable() || attempt >= self.retry.max_retries {
                return Err(error);
            }

            let delay = self.retry.delay(attempt);
            attempt += 1;
            warn!(request = what, attempt, delay_ms = delay.as_millis() as u64, error = %error, "Retrying");
            tokio::select! {
                _ = cancel.cancelled() => return Err(PackagerError::Canceled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

impl Transport for HttpTransport {
    #[instrument(
        name = "http_deliver",
        skip(self, endpoint, upload, cancel),
        fields(package_id = %upload.package_id, bytes = upload.payload.len())
    )]
    async fn deliver(
        &self,
        endpoint: &Endpoint,
        upload: &Upload,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let total = upload.chunks().len();
        for (n, chunk) in upload.chunks().enumerate() {
            if cancel.is_cancelled() {
                return Err(PackagerError::Canceled);
            }
            let url = endpoint.chunk_url(upload.package_id, n)?;
            self.send_with_retry("chunk", cancel, || {
                self.client
                    .put(url.clone())
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .header(CHUNK_COUNT_HEADER, total)
                    .body(chunk.to_vec())
            })
            .await?;
            debug!(chunk = n, total, "Chunk uploaded");
        }

        if cancel.is_cancelled() {
            return Err(PackagerError::Canceled);
        }
        let url = endpoint.commit_url(upload.package_id)?;
        let commit = json!({
            "package_id": upload.package_id,
            "chunks": total,
            "bytes": upload.payload.len(),
            "manifest": &upload.manifest,
        });
        self.send_with_retry("commit", cancel, || self.client.post(url.clone()).json(&commit))
            .await?;
        debug!("Package committed");
        Ok(())
    }
}

fn classify_status(status: StatusCode) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    let code = Some(status.as_u16());
    let message = format!("collector answered {status}");
    match status.as_u16() {
        408 | 429 | 500..=599 => Err(PackagerError::recoverable(message, code)),
        _ => Err(PackagerError::permanent(message, code)),
    }
}

fn classify_error(error: &reqwest::Error) -> PackagerError {
    if error.is_builder() {
        PackagerError::permanent(error.to_string(), None)
    } else {
        PackagerError::recoverable(error.to_string(), None)
    }
}
