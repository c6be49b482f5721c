//! Host capability surface
//!
//! The only objects an extension can reach: an HTTP client behind the domain
//! allowlist and a per-instance rate limiter, regex markup extraction, the
//! namespaced store, a log sink and the read-only host version. Each loaded
//! instance gets a fresh surface.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::logger::ExtensionLogger;
use super::sandbox::{Permission, Sandbox};
use super::storage::ExtensionStorage;
use crate::core::error::{ExtensionError, Result};

/// Default User-Agent for extension requests
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

lazy_static! {
    static ref TAG_PATTERN: Regex = Regex::new(r"(?s)<[^>]*>").unwrap();
}

/// Minimum-interval limiter for one instance.
///
/// Callers reserve the next free slot under a fair lock and then sleep until
/// it arrives, so waiters are released in arrival order without holding the
/// lock while they wait.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for this caller's slot
    pub async fn acquire(&self) {
        if self.interval.is_zero() {
            return;
        }

        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(reserved) if reserved > now => reserved,
                _ => now,
            };
            *next = Some(slot + self.interval);
            slot
        };

        tokio::time::sleep_until(slot).await;
    }
}

/// Outbound request issued by an extension
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequest {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Response handed back to an extension; non-2xx statuses are not errors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    pub status: u16,
    /// URL after redirects
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Redirect hops followed for one extension request
pub const MAX_REDIRECTS: usize = 10;

/// Allowlisted, rate-limited HTTP access for one instance.
///
/// Redirects are followed here rather than by the client so that every hop
/// passes the allowlist; the client must be built with [`HttpContext::build_client`].
pub struct HttpContext {
    client: reqwest::Client,
    limiter: RateLimiter,
}

impl HttpContext {
    pub fn new(client: reqwest::Client, min_interval: Duration) -> Self {
        Self {
            client,
            limiter: RateLimiter::new(min_interval),
        }
    }

    /// Shared client for extension traffic; it never follows redirects itself
    pub fn build_client(timeout: Duration) -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?)
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Issue `request` after the allowlist check and the rate limit wait.
    ///
    /// Each redirect target is checked against the allowlist before it is
    /// requested. 307/308 keep method and body, other redirects become a
    /// bodiless GET.
    pub async fn send(&self, sandbox: &Sandbox, request: HttpRequest) -> Result<HttpResponse> {
        let method = request
            .method
            .as_deref()
            .unwrap_or("GET")
            .to_ascii_uppercase();
        let mut method = reqwest::Method::from_bytes(method.as_bytes()).map_err(|_| {
            ExtensionError::ValidationError(format!("invalid HTTP method '{}'", method))
        })?;
        let mut url = request.url.clone();
        let mut body = request.body.clone();

        for _ in 0..=MAX_REDIRECTS {
            sandbox.check_network_access(&url)?;
            self.limiter.acquire().await;

            let mut builder = self
                .client
                .request(method.clone(), &url)
                .header(reqwest::header::USER_AGENT, DEFAULT_USER_AGENT);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = &body {
                builder = builder.body(body.clone());
            }
            if let Some(timeout) = request.timeout_ms {
                builder = builder.timeout(Duration::from_millis(timeout));
            }

            let response = builder.send().await?;
            let status = response.status();

            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .filter(|_| status.is_redirection());
            if let Some(location) = location {
                url = response
                    .url()
                    .join(location)
                    .map_err(|e| ExtensionError::NetworkError(format!("bad redirect target '{}': {}", location, e)))?
                    .to_string();
                if !matches!(status.as_u16(), 307 | 308) {
                    method = reqwest::Method::GET;
                    body = None;
                }
                continue;
            }

            let final_url = response.url().to_string();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
                .collect();
            let text = response.text().await?;

            return Ok(HttpResponse {
                status: status.as_u16(),
                url: final_url,
                headers,
                body: text,
            });
        }

        Err(ExtensionError::NetworkError(format!(
            "{} exceeded {} redirects",
            request.url, MAX_REDIRECTS
        )))
    }
}

/// Regex-based markup extraction exposed to extensions as `html`
pub struct MarkupExtractor;

impl MarkupExtractor {
    fn compile(pattern: &str) -> Result<Regex> {
        Regex::new(pattern)
            .map_err(|e| ExtensionError::ValidationError(format!("invalid pattern '{}': {}", pattern, e)))
    }

    /// First match; the first capture group when the pattern has one
    pub fn extract(body: &str, pattern: &str) -> Result<Option<String>> {
        let re = Self::compile(pattern)?;
        Ok(re.captures(body).and_then(|caps| {
            caps.get(1)
                .or_else(|| caps.get(0))
                .map(|m| m.as_str().to_string())
        }))
    }

    pub fn extract_all(body: &str, pattern: &str) -> Result<Vec<String>> {
        let re = Self::compile(pattern)?;
        Ok(re
            .captures_iter(body)
            .filter_map(|caps| caps.get(1).or_else(|| caps.get(0)))
            .map(|m| m.as_str().to_string())
            .collect())
    }

    /// Text content with tags removed and whitespace collapsed
    pub fn strip_tags(body: &str) -> String {
        TAG_PATTERN
            .replace_all(body, " ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Everything one instance may touch
pub struct HostSurface {
    extension_id: String,
    host_version: String,
    config: Value,
    sandbox: Sandbox,
    http: HttpContext,
    storage: ExtensionStorage,
    logger: ExtensionLogger,
}

impl HostSurface {
    pub fn new(
        extension_id: impl Into<String>,
        host_version: impl Into<String>,
        config: Value,
        sandbox: Sandbox,
        http: HttpContext,
        storage: ExtensionStorage,
    ) -> Self {
        let extension_id = extension_id.into();
        Self {
            logger: ExtensionLogger::new(extension_id.clone()),
            extension_id,
            host_version: host_version.into(),
            config,
            sandbox,
            http,
            storage,
        }
    }

    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }

    pub fn host_version(&self) -> &str {
        &self.host_version
    }

    /// Manifest `config` block
    pub fn config(&self) -> &Value {
        &self.config
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn logger(&self) -> &ExtensionLogger {
        &self.logger
    }

    pub fn rate_limit(&self) -> Duration {
        self.http.limiter().interval()
    }

    pub async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse> {
        tracing::debug!(extension = %self.extension_id, url = %request.url, "extension request");
        self.http.send(&self.sandbox, request).await
    }

    /// Namespaced storage; requires the `storage` permission
    pub fn storage(&self) -> Result<&ExtensionStorage> {
        self.sandbox.require(Permission::Storage)?;
        Ok(&self.storage)
    }

    /// Object describing the host, exposed to extensions as `host`
    pub fn host_info(&self) -> Value {
        serde_json::json!({
            "version": self.host_version,
            "extensionId": self.extension_id,
            "config": self.config,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::plugin::sandbox::ResourceLimits;
    use crate::plugin::storage::{KvStore, MemoryKvStore};
    use axum::http::{header, StatusCode};
    use axum::routing::get;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) fn surface(id: &str, permissions: Vec<Permission>, domains: Option<Vec<&str>>) -> HostSurface {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        HostSurface::new(
            id,
            "0.4.2",
            Value::Null,
            Sandbox::new(
                id,
                permissions,
                domains.map(|d| d.into_iter().map(String::from).collect()),
                ResourceLimits::default(),
            ),
            HttpContext::new(HttpContext::build_client(Duration::from_secs(5)).unwrap(), Duration::ZERO),
            ExtensionStorage::new(id, store, 4096),
        )
    }

    #[tokio::test]
    async fn test_rate_limiter_spaces_calls() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(40)));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move { limiter.acquire().await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_rate_limiter_zero_is_unthrottled() {
        let limiter = RateLimiter::new(Duration::ZERO);
        let start = Instant::now();
        for _ in 0..100 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_fetch_refused_before_network() {
        let surface = surface("sample", vec![Permission::Network], Some(vec!["example.com"]));
        // Unroutable host: a network attempt would fail with NetworkError instead
        let err = surface
            .fetch(HttpRequest::get("http://blocked.invalid/"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtensionError::PermissionDenied(_)));
    }

    pub(crate) async fn serve(router: axum::Router) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    /// Target server answering "secret" on `/x` and counting its hits
    pub(crate) async fn counting_target() -> (std::net::SocketAddr, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = axum::Router::new().route(
            "/x",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    "secret"
                }
            }),
        );
        (serve(router).await, hits)
    }

    async fn redirecting_to(location: String) -> std::net::SocketAddr {
        let router = axum::Router::new()
            .route(
                "/",
                get(move || {
                    let location = location.clone();
                    async move { (StatusCode::FOUND, [(header::LOCATION, location)]) }
                }),
            )
            .route(
                "/loop",
                get(|| async { (StatusCode::FOUND, [(header::LOCATION, "/loop")]) }),
            );
        serve(router).await
    }

    #[tokio::test]
    async fn test_redirect_to_disallowed_host_is_refused() {
        let (target, hits) = counting_target().await;
        let origin = redirecting_to(format!("http://localhost:{}/x", target.port())).await;
        let surface = surface("sample", vec![Permission::Network], Some(vec!["127.0.0.1"]));

        let direct = surface
            .fetch(HttpRequest::get(format!("http://localhost:{}/x", target.port())))
            .await
            .unwrap_err();
        assert!(matches!(direct, ExtensionError::PermissionDenied(_)));

        let redirected = surface
            .fetch(HttpRequest::get(format!("http://127.0.0.1:{}/", origin.port())))
            .await
            .unwrap_err();
        assert!(matches!(redirected, ExtensionError::PermissionDenied(_)));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_redirect_within_allowlist_is_followed() {
        let (target, hits) = counting_target().await;
        let origin = redirecting_to(format!("http://127.0.0.1:{}/x", target.port())).await;
        let surface = surface("sample", vec![Permission::Network], Some(vec!["127.0.0.1"]));

        let response = surface
            .fetch(HttpRequest::get(format!("http://127.0.0.1:{}/", origin.port())))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "secret");
        assert!(response.url.ends_with("/x"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_redirect_loop_is_cut_off() {
        let origin = redirecting_to("/".to_string()).await;
        let surface = surface("sample", vec![Permission::Network], Some(vec!["127.0.0.1"]));

        let err = surface
            .fetch(HttpRequest::get(format!("http://127.0.0.1:{}/loop", origin.port())))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtensionError::NetworkError(_)));
    }

    #[tokio::test]
    async fn test_storage_requires_permission() {
        let surface = surface("sample", vec![Permission::Network], None);
        assert!(matches!(surface.storage(), Err(ExtensionError::PermissionDenied(_))));
    }

    #[test]
    fn test_markup_extraction() {
        let html = r#"<a class="item" href="/a/1">One</a><a class="item" href="/a/2">Two</a>"#;
        assert_eq!(
            MarkupExtractor::extract(html, r#"href="([^"]+)""#).unwrap(),
            Some("/a/1".to_string())
        );
        assert_eq!(
            MarkupExtractor::extract_all(html, r#"href="([^"]+)""#).unwrap(),
            vec!["/a/1".to_string(), "/a/2".to_string()]
        );
        assert_eq!(MarkupExtractor::strip_tags("<p>Hello <b>world</b></p>"), "Hello world");
        assert!(MarkupExtractor::extract(html, "(").is_err());
    }
}
