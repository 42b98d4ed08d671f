//! Internet Archive adapter for [ArchiveClient].
//!
//! This module provides:
//! 1. A pooled HTTP client shared by every worker
//! 2. Retries with exponential backoff, honouring `Retry-After` on 429
//! 3. Adaptive spacing of requests through [AdaptiveRateLimiter]
//! 4. Streaming downloads into a `.part` file that is renamed on completion

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::StreamExt;
use reqwest::header::{AUTHORIZATION, HeaderValue, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::archive::client::{
    ArchiveClient, ArchiveError, ArchiveResult, FetchOutcome, FileEntry, FileManifest,
    MetadataRecord, local_path,
};
use crate::archive::rate_limiter::{AdaptiveRateLimiter, RateLimiterConfig};
use crate::archive::search::{SearchClient, SearchPage};

/// Longest backoff between two attempts.
const MAX_BACKOFF_MS: u64 = 60_000;

/// Everything the HTTP client needs; built from the app config, never read from globals.
#[derive(Debug, Clone)]
pub struct ArchiveClientConfig {
    /// Scheme and host without a trailing slash, e.g. `https://archive.org`.
    pub base_url: String,
    pub user_agent: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Total tries per request, including the first one.
    pub retry_attempts: usize,
    pub base_retry_delay_ms: u64,
    /// Access and secret key for the `LOW` authorization scheme.
    pub credentials: Option<(String, String)>,
    pub rate: RateLimiterConfig,
}

impl Default for ArchiveClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://archive.org".to_string(),
            user_agent: format!("archive_fetch/{}", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(30),
            retry_attempts: 3,
            base_retry_delay_ms: 1000,
            credentials: None,
            rate: RateLimiterConfig::default(),
        }
    }
}

#[derive(Deserialize)]
struct ResultEnvelope<T> {
    result: Option<T>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct SearchEnvelope {
    response: SearchResponse,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    num_found: Option<u64>,
    #[serde(default)]
    docs: Vec<SearchDoc>,
}

#[derive(Deserialize)]
struct SearchDoc {
    identifier: Option<Value>,
}

/// [ArchiveClient] backed by the public archive.org HTTP API.
pub struct ArchiveOrgClient {
    config: ArchiveClientConfig,
    client: Client,
    limiter: AdaptiveRateLimiter,
    authorization: Option<HeaderValue>,
}

impl ArchiveOrgClient {
    pub fn new(config: ArchiveClientConfig) -> ArchiveResult<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .gzip(true)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .tcp_nodelay(true)
            .build()?;

        let authorization = match &config.credentials {
            Some((access, secret)) => {
                let mut value = HeaderValue::from_str(&format!("LOW {}:{}", access, secret))
                    .map_err(|e| ArchiveError::Config(format!("invalid credentials: {}", e)))?;
                value.set_sensitive(true);
                Some(value)
            }
            None => None,
        };

        info!(
            base_url = %config.base_url,
            authenticated = authorization.is_some(),
            "Initialized archive client"
        );

        Ok(Self {
            limiter: AdaptiveRateLimiter::with_config(config.rate.clone()),
            config,
            client,
            authorization,
        })
    }

    fn metadata_url(&self, identifier: &str, sub_path: &str) -> String {
        format!(
            "{}/metadata/{}/{}",
            self.config.base_url,
            urlencoding::encode(identifier),
            sub_path
        )
    }

    fn download_url(&self, identifier: &str, file_name: &str) -> String {
        let encoded: Vec<String> = file_name
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!(
            "{}/download/{}/{}",
            self.config.base_url,
            urlencoding::encode(identifier),
            encoded.join("/")
        )
    }

    fn request(&self, url: &str) -> RequestBuilder {
        let builder = self.client.get(url);
        match &self.authorization {
            Some(value) => builder.header(AUTHORIZATION, value.clone()),
            None => builder,
        }
    }

    /// Sends a GET built by `build`, retrying transient failures.
    ///
    /// 401, 403, 404 and 451 fail at once. Every other non-success status, transport
    /// error and 429 uses up one attempt.
    async fn send_with_retry(
        &self,
        identifier: &str,
        build: impl Fn() -> RequestBuilder,
    ) -> ArchiveResult<Response> {
        let max_attempts = self.config.retry_attempts.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            if attempts > 1 {
                debug!("Retry attempt {}/{}", attempts, max_attempts);
            }

            self.limiter.wait_for_request().await;
            let started = Instant::now();
            let sent = build().send().await;
            self.limiter.record_response_time(started.elapsed());

            let response = match sent {
                Ok(response) => response,
                Err(e) => {
                    warn!("Request error: {}", e);
                    if attempts >= max_attempts {
                        return Err(ArchiveError::Request(e));
                    }
                    self.back_off(attempts).await;
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                self.limiter.penalize();
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|h| h.to_str().ok())
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .map(|secs| Duration::from_secs(secs).min(Duration::from_millis(MAX_BACKOFF_MS)));
                if attempts >= max_attempts {
                    return Err(invalid(identifier, "Rate limit exceeded (429 Too Many Requests)"));
                }
                match retry_after {
                    Some(wait) => {
                        info!("Rate limited, backing off for {:?}", wait);
                        sleep(wait).await;
                    }
                    None => self.back_off(attempts).await,
                }
                continue;
            }

            let message = match status.as_u16() {
                401 => Some("Authentication failed (401 Unauthorized). Check the archive access keys."),
                403 => Some("Access forbidden (403 Forbidden)"),
                404 => Some("Resource not found (404 Not Found)"),
                451 => Some("Content unavailable for legal reasons (451)"),
                _ => None,
            };
            if let Some(message) = message {
                warn!("{}", message);
                return Err(invalid(identifier, message));
            }

            warn!("HTTP error: {}", status);
            if attempts >= max_attempts {
                return Err(invalid(identifier, &format!("HTTP error: {}", status)));
            }
            self.back_off(attempts).await;
        }
    }

    async fn back_off(&self, attempt: usize) {
        let backoff = calculate_backoff(attempt, self.config.base_retry_delay_ms);
        debug!("Backing off for {}ms before retry", backoff);
        sleep(Duration::from_millis(backoff)).await;
    }

    /// Fetches one `/metadata/{id}/{sub_path}` envelope and returns its `result`.
    async fn fetch_envelope<T: for<'de> Deserialize<'de>>(
        &self,
        identifier: &str,
        sub_path: &str,
        what: &'static str,
    ) -> ArchiveResult<T> {
        let url = self.metadata_url(identifier, sub_path);
        let response = self.send_with_retry(identifier, || self.request(&url)).await?;
        let envelope: ResultEnvelope<T> = response
            .json()
            .await
            .map_err(|e| invalid(identifier, &format!("undecodable {}: {}", what, e)))?;

        if let Some(error) = envelope.error {
            return Err(invalid(identifier, &error));
        }
        envelope.result.ok_or_else(|| ArchiveError::MissingDescriptor {
            identifier: identifier.to_string(),
            what,
        })
    }

    /// Streams a response to `path`.
    async fn stream_to_file(response: Response, path: &Path) -> ArchiveResult<u64> {
        let mut file = File::create(path).await?;
        let mut stream = response.bytes_stream();
        let mut bytes_downloaded = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            bytes_downloaded += chunk.len() as u64;
        }

        file.flush().await?;
        Ok(bytes_downloaded)
    }
}

#[async_trait]
impl ArchiveClient for ArchiveOrgClient {
    #[instrument(skip(self))]
    async fn fetch_manifest(&self, identifier: &str) -> ArchiveResult<FileManifest> {
        let files: Vec<FileEntry> = self.fetch_envelope(identifier, "files", "file list").await?;
        debug!(files = files.len(), "Fetched manifest");
        Ok(FileManifest::new(files))
    }

    #[instrument(skip(self))]
    async fn fetch_metadata(&self, identifier: &str) -> ArchiveResult<MetadataRecord> {
        self.fetch_envelope(identifier, "metadata", "metadata").await
    }

    #[instrument(skip(self, dest_dir))]
    async fn fetch_file(
        &self,
        identifier: &str,
        file_name: &str,
        dest_dir: &Path,
    ) -> ArchiveResult<FetchOutcome> {
        let target = local_path(dest_dir, file_name)?;
        if fs::try_exists(&target).await? {
            debug!("File already exists: {}", target.display());
            return Ok(FetchOutcome::AlreadyPresent);
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let url = self.download_url(identifier, file_name);
        let temp_path = part_path(&target);
        let max_attempts = self.config.retry_attempts.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            let response = self.send_with_retry(identifier, || self.request(&url)).await?;
            match Self::stream_to_file(response, &temp_path).await {
                Ok(bytes) => {
                    fs::rename(&temp_path, &target).await?;
                    return Ok(FetchOutcome::Fetched { bytes });
                }
                Err(e) => {
                    warn!("Download error: {}", e);
                    let _ = fs::remove_file(&temp_path).await;
                    if attempts >= max_attempts {
                        return Err(e);
                    }
                    self.back_off(attempts).await;
                }
            }
        }
    }
}

#[async_trait]
impl SearchClient for ArchiveOrgClient {
    #[instrument(skip(self, query))]
    async fn search_page(&self, query: &str, rows: usize, page: usize) -> ArchiveResult<SearchPage> {
        let url = format!("{}/advancedsearch.php", self.config.base_url);
        let rows = rows.to_string();
        let page_number = page.to_string();
        let response = self
            .send_with_retry("search", || {
                self.request(&url).query(&[
                    ("q", query),
                    ("fl[]", "identifier"),
                    ("rows", rows.as_str()),
                    ("page", page_number.as_str()),
                    ("output", "json"),
                ])
            })
            .await?;

        let envelope: SearchEnvelope = response
            .json()
            .await
            .map_err(|e| invalid("search", &format!("undecodable search page: {}", e)))?;
        let identifiers = envelope
            .response
            .docs
            .into_iter()
            .filter_map(|doc| match doc.identifier {
                Some(Value::String(identifier)) => Some(identifier),
                _ => None,
            })
            .collect();

        Ok(SearchPage {
            identifiers,
            num_found: envelope.response.num_found,
        })
    }
}

fn invalid(identifier: &str, message: &str) -> ArchiveError {
    ArchiveError::InvalidResponse {
        identifier: identifier.to_string(),
        message: message.to_string(),
    }
}

/// The temporary download path next to `target`.
fn part_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

/// Exponential backoff, `base * 2^(attempt - 1)`, capped at one minute.
fn calculate_backoff(attempt: usize, base_delay_ms: u64) -> u64 {
    let exponent = attempt.saturating_sub(1).min(32) as u32;
    base_delay_ms
        .saturating_mul(1u64 << exponent)
        .min(MAX_BACKOFF_MS)
}
