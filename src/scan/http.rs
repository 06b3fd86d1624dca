//! HTTP probing with caching and bounded retries.
//!
//! Probe responses are cached by `method + full URL` for the lifetime of a
//! scan (entries expire after five minutes) so that many fingerprint rules
//! sharing a path cost one request. Transient failures (transport errors,
//! 5xx) are retried with exponential backoff; 4xx responses are returned
//! as-is since matchers may legitimately match error pages.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use reqwest::Method;
use tokio::sync::Mutex;
use tracing::{debug, trace};
use url::Url;

use super::favicon::favicon_hash;
use super::ScanError;

/// Cache entry lifetime within one scan.
const CACHE_TTL: Duration = Duration::from_secs(300);

/// Base backoff delay between probe retries.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// HTTP client options for a scan.
#[derive(Debug, Clone)]
pub struct HttpOptions {
    /// Per-request timeout.
    pub timeout: Duration,
    /// Retry budget for transient failures.
    pub retries: u32,
    /// Optional proxy URL (http, https, or socks5).
    pub proxy: Option<String>,
    /// Accept invalid TLS certificates.
    pub insecure_skip_verify: bool,
    /// User-Agent header sent with probes.
    pub user_agent: String,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retries: 3,
            proxy: None,
            insecure_skip_verify: true,
            user_agent: "armitage-scanner/0.3".to_owned(),
        }
    }
}

/// An immutable snapshot of a probe response shared across rule workers.
#[derive(Debug, Clone)]
pub struct ProbeResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body text (lossy UTF-8).
    pub body: String,
    /// Concatenated `"Name: value\n"` header block.
    pub header: String,
}

struct CacheEntry {
    response: Arc<ProbeResponse>,
    fetched_at: Instant,
}

/// Caching probe client used by the scan engine.
pub struct ProbeClient {
    client: reqwest::Client,
    retries: u32,
    cache: Mutex<HashMap<String, CacheEntry>>,
    icon_cache: Mutex<HashMap<String, i32>>,
}

impl ProbeClient {
    /// Build a client from scan options.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying client cannot be constructed,
    /// e.g. on a malformed proxy URL.
    pub fn new(options: &HttpOptions) -> Result<Self, ScanError> {
        let mut builder = reqwest::Client::builder()
            .timeout(options.timeout)
            .danger_accept_invalid_certs(options.insecure_skip_verify)
            .user_agent(options.user_agent.clone());

        if let Some(proxy_url) = &options.proxy {
            let proxy = reqwest::Proxy::all(proxy_url.as_str())
                .map_err(|e| ScanError::Client(format!("invalid proxy {proxy_url}: {e}")))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| ScanError::Client(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            retries: options.retries.max(1),
            cache: Mutex::new(HashMap::new()),
            icon_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Fetch a URL, consulting the scan-lifetime response cache.
    ///
    /// # Errors
    ///
    /// Returns an error when every attempt fails at the transport level.
    /// Non-2xx responses are not errors.
    pub async fn fetch(
        &self,
        method: &str,
        url: &Url,
        body: Option<&str>,
    ) -> Result<Arc<ProbeResponse>, ScanError> {
        let key = format!("{method} {url}");

        {
            let mut cache = self.cache.lock().await;
            if let Some(entry) = cache.get(&key) {
                if entry.fetched_at.elapsed() < CACHE_TTL {
                    trace!(%url, "probe cache hit");
                    return Ok(Arc::clone(&entry.response));
                }
                cache.remove(&key);
            }
        }

        let response = self.fetch_uncached(method, url, body).await?;
        let shared = Arc::new(response);

        let mut cache = self.cache.lock().await;
        cache.insert(
            key,
            CacheEntry {
                response: Arc::clone(&shared),
                fetched_at: Instant::now(),
            },
        );
        Ok(shared)
    }

    async fn fetch_uncached(
        &self,
        method: &str,
        url: &Url,
        body: Option<&str>,
    ) -> Result<ProbeResponse, ScanError> {
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| ScanError::Client(format!("invalid http method {method:?}")))?;

        let mut last_error: Option<reqwest::Error> = None;

        for attempt in 0..self.retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }

            let mut request = self.client.request(method.clone(), url.clone());
            if let Some(data) = body {
                request = request.body(data.to_owned());
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let header = header_block(response.headers());
                    let text = response.text().await.unwrap_or_default();
                    let probe = ProbeResponse {
                        status,
                        body: text,
                        header,
                    };
                    // 5xx is transient: retry unless this was the last shot.
                    if status >= 500 && attempt.saturating_add(1) < self.retries {
                        debug!(%url, status, attempt, "retrying after server error");
                        continue;
                    }
                    return Ok(probe);
                }
                Err(err) => {
                    debug!(%url, attempt, error = %err, "probe transport error");
                    last_error = Some(err);
                }
            }
        }

        Err(ScanError::Probe {
            url: url.to_string(),
            detail: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "request failed".to_owned()),
        })
    }

    /// Fetch and hash the target's favicon. Returns 0 when unavailable.
    pub async fn favicon(&self, base: &Url) -> i32 {
        let key = base.to_string();
        {
            let cache = self.icon_cache.lock().await;
            if let Some(&hash) = cache.get(&key) {
                return hash;
            }
        }

        let hash = match base.join("/favicon.ico") {
            Ok(icon_url) => match self.client.get(icon_url).send().await {
                Ok(response) if response.status().is_success() => response
                    .bytes()
                    .await
                    .map(|bytes| favicon_hash(&bytes))
                    .unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0,
        };

        let mut cache = self.icon_cache.lock().await;
        cache.insert(key, hash);
        hash
    }

    /// Drop all cached responses. Called when a scan ends.
    pub async fn clear(&self) {
        self.cache.lock().await.clear();
        self.icon_cache.lock().await.clear();
    }
}

/// Exponential backoff with jitter: `base * 2^(attempt-1) + 0..100ms`.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(6);
    let base = RETRY_BASE_DELAY.saturating_mul(1u32 << exp);
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..100));
    base.saturating_add(jitter)
}

/// Render headers as a `"Name: v1 v2\n"` block for matcher evaluation.
fn header_block(headers: &reqwest::header::HeaderMap) -> String {
    let mut block = String::new();
    let mut current: Option<String> = None;
    for (name, value) in headers {
        let name = name.as_str();
        let value = String::from_utf8_lossy(value.as_bytes());
        match current.as_deref() {
            // Repeated headers collapse onto one space-joined line.
            Some(prev) if prev == name => {
                block.pop();
                block.push(' ');
                block.push_str(&value);
                block.push('\n');
            }
            _ => {
                block.push_str(name);
                block.push_str(": ");
                block.push_str(&value);
                block.push('\n');
                current = Some(name.to_owned());
            }
        }
    }
    block
}
