//! # Paginated Source
//!
//! Fetches one page of one collection at a time.
//!
//! ## Layering
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Orchestrator ──fetch_page(entity, n, filter)──►  RetryingSource        │
//! │                                                     │ 429 / 5xx /       │
//! │                                                     │ connect / timeout │
//! │                                                     │ → sleep, retry    │
//! │                                                     ▼                   │
//! │                                                   PacedSource           │
//! │                                                     │ min gap between   │
//! │                                                     │ requests          │
//! │                                                     ▼                   │
//! │                                                   HttpPageSource        │
//! │                                                     │                   │
//! │  GET {base_url}/{endpoint}?page=N[&since_updated_at=YYYY-MM-DD]         │
//! │  Authorization: Bearer <token>                                          │
//! │                                                                         │
//! │  { "meta": { "total_pages": 5, "total_entries": 123 },                  │
//! │    "<collection>": [ {...}, {...} ] }                                   │
//! │                                                                         │
//! │  Unpaged entities: no `page` parameter, `meta` optional, one page.      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Sources never touch storage and hold at most the page being returned.

use async_trait::async_trait;
use backoff::backoff::{Backoff, Constant};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use mirror_core::{transform, EntityType};

use crate::config::MirrorConfig;
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Page Types
// =============================================================================

/// Server-side filter for `SinceFilter` entities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFilter {
    /// `YYYY-MM-DD`, UTC.
    pub since_updated_at: String,
}

impl PageFilter {
    /// Filter for records updated on or after the day containing `boundary`.
    pub fn since(boundary: i64) -> Self {
        PageFilter {
            since_updated_at: transform::format_since_date(boundary),
        }
    }
}

/// One fetched page.
///
/// Records stay raw JSON; the reconciler rejects the ones that are not
/// usable so they are counted instead of failing the page.
#[derive(Debug, Clone)]
pub struct Page {
    /// 1-based page number.
    pub number: u32,
    pub records: Vec<Value>,
    pub total_pages: u32,
    pub total_entries: u64,
}

impl Page {
    /// Parses a response body.
    ///
    /// ## Errors
    /// * `SyncError::MalformedResponse` - not an object, `meta` or its
    ///   totals missing on a paged entity, or the collection field
    ///   missing / not an array
    pub fn from_body(entity: &EntityType, number: u32, body: Value) -> SyncResult<Self> {
        let mut object = match body {
            Value::Object(map) => map,
            _ => {
                return Err(SyncError::MalformedResponse(format!(
                    "{} page {}: body is not a JSON object",
                    entity.name, number
                )))
            }
        };

        let totals = if entity.paged {
            let meta = object
                .get("meta")
                .and_then(Value::as_object)
                .ok_or_else(|| {
                    SyncError::MalformedResponse(format!(
                        "{} page {}: missing meta",
                        entity.name, number
                    ))
                })?;
            Some(Self::totals(entity, number, meta)?)
        } else {
            None
        };

        let records = match object.remove(&entity.collection) {
            Some(Value::Array(records)) => records,
            Some(_) => {
                return Err(SyncError::MalformedResponse(format!(
                    "{} page {}: {} is not an array",
                    entity.name, number, entity.collection
                )))
            }
            None => {
                return Err(SyncError::MalformedResponse(format!(
                    "{} page {}: missing {}",
                    entity.name, number, entity.collection
                )))
            }
        };

        let records: Vec<Value> = records.into_iter().map(|r| entity.shape(r)).collect();
        let (total_pages, total_entries) = totals.unwrap_or((1, records.len() as u64));

        Ok(Page {
            number,
            records,
            total_pages,
            total_entries,
        })
    }

    fn totals(
        entity: &EntityType,
        number: u32,
        meta: &serde_json::Map<String, Value>,
    ) -> SyncResult<(u32, u64)> {
        let total_pages = meta
            .get("total_pages")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| {
                SyncError::MalformedResponse(format!(
                    "{} page {}: missing meta.total_pages",
                    entity.name, number
                ))
            })?;

        let total_entries = meta
            .get("total_entries")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                SyncError::MalformedResponse(format!(
                    "{} page {}: missing meta.total_entries",
                    entity.name, number
                ))
            })?;

        Ok((total_pages, total_entries))
    }

    /// The last page number to walk; an empty collection still has page 1.
    pub fn last_page(&self) -> u32 {
        self.total_pages.max(1)
    }
}

// =============================================================================
// PageSource Trait
// =============================================================================

/// Anything that can hand out pages of a collection.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(
        &self,
        entity: &EntityType,
        page: u32,
        filter: Option<&PageFilter>,
    ) -> SyncResult<Page>;
}

#[async_trait]
impl<S: PageSource + ?Sized> PageSource for Arc<S> {
    async fn fetch_page(
        &self,
        entity: &EntityType,
        page: u32,
        filter: Option<&PageFilter>,
    ) -> SyncResult<Page> {
        (**self).fetch_page(entity, page, filter).await
    }
}

/// Builds the production stack: retry around pacing around HTTP.
pub fn from_config(config: &MirrorConfig) -> SyncResult<Arc<dyn PageSource>> {
    let http = HttpPageSource::from_config(config)?;
    let paced = PacedSource::new(http, config.retry.page_interval());
    Ok(Arc::new(RetryingSource::new(paced, config.retry.policy())))
}

// =============================================================================
// HTTP Source
// =============================================================================

/// [`PageSource`] over the remote REST API.
#[derive(Debug, Clone)]
pub struct HttpPageSource {
    client: Client,
    base_url: String,
    token: Option<String>,
    entity_tokens: HashMap<String, String>,
}

impl HttpPageSource {
    /// Creates a source for `base_url` with a per-request timeout.
    ///
    /// ## Errors
    /// * `SyncError::InvalidConfig` - empty base URL
    pub fn new(base_url: &str, timeout: Duration) -> SyncResult<Self> {
        if base_url.trim().is_empty() {
            return Err(SyncError::InvalidConfig(
                "api.base_url is not configured".into(),
            ));
        }

        let client = Client::builder().timeout(timeout).build()?;

        Ok(HttpPageSource {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            entity_tokens: HashMap::new(),
        })
    }

    /// Creates a source from `[api]` and the per-entity token overrides.
    pub fn from_config(config: &MirrorConfig) -> SyncResult<Self> {
        let mut source = Self::new(&config.api.base_url, config.api.timeout())?;
        source.token = config.api.token.clone();
        for (name, settings) in &config.entities {
            if let Some(token) = &settings.token {
                source.entity_tokens.insert(name.clone(), token.clone());
            }
        }
        Ok(source)
    }

    /// Sets the bearer token used by every entity without its own.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Sets the bearer token for one entity.
    pub fn with_entity_token(mut self, entity: &str, token: impl Into<String>) -> Self {
        self.entity_tokens.insert(entity.to_string(), token.into());
        self
    }

    fn token_for(&self, entity: &str) -> Option<&str> {
        self.entity_tokens
            .get(entity)
            .map(String::as_str)
            .or(self.token.as_deref())
    }

    fn url(&self, entity: &EntityType) -> String {
        format!("{}/{}", self.base_url, entity.endpoint.trim_start_matches('/'))
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn fetch_page(
        &self,
        entity: &EntityType,
        page: u32,
        filter: Option<&PageFilter>,
    ) -> SyncResult<Page> {
        let mut request = self.client.get(self.url(entity));
        if entity.paged {
            request = request.query(&[("page", page)]);
        }
        if let Some(filter) = filter {
            request = request.query(&[("since_updated_at", filter.since_updated_at.as_str())]);
        }
        if let Some(token) = self.token_for(&entity.name) {
            request = request.bearer_auth(token);
        }

        debug!(entity = %entity.name, page, "GET page");
        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SyncError::RateLimited);
        }

        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::ServerError {
                status: status.as_u16(),
                body,
            });
        }

        // Fail fast on the rest of 4xx
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| SyncError::MalformedResponse(e.to_string()))?;

        Page::from_body(entity, page, body)
    }
}

// =============================================================================
// Retry Wrapper
// =============================================================================

/// Attempts and fixed backoff for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per page, at least 1.
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}

/// Retries [`SyncError::is_retryable`] failures of the inner source.
///
/// ## When This Occurs
/// - 429: the API budget for the minute is spent
/// - connect / timeout: the network blinked
/// - 5xx: the API is briefly unhealthy
///
/// Every other failure is returned on the first attempt. Running out of
/// attempts yields `SyncError::MaxRetriesExceeded`.
pub struct RetryingSource<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: PageSource> RetryingSource<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        RetryingSource { inner, policy }
    }
}

#[async_trait]
impl<S: PageSource> PageSource for RetryingSource<S> {
    async fn fetch_page(
        &self,
        entity: &EntityType,
        page: u32,
        filter: Option<&PageFilter>,
    ) -> SyncResult<Page> {
        let mut backoff = Constant::new(self.policy.backoff);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.inner.fetch_page(entity, page, filter).await {
                Ok(fetched) => return Ok(fetched),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= self.policy.max_attempts => {
                    return Err(SyncError::MaxRetriesExceeded {
                        attempts: attempt,
                        last_error: e.to_string(),
                    })
                }
                Err(e) => {
                    let wait = backoff.next_backoff().unwrap_or(self.policy.backoff);
                    warn!(
                        entity = %entity.name,
                        page,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "Retrying page after backoff"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

// =============================================================================
// Pacing Wrapper
// =============================================================================

/// Keeps at least `interval` between the starts of two requests.
///
/// One instance shared by every entity task paces them together, which is
/// what a per-token API budget needs.
pub struct PacedSource<S> {
    inner: S,
    interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl<S: PageSource> PacedSource<S> {
    pub fn new(inner: S, interval: Duration) -> Self {
        PacedSource {
            inner,
            interval,
            last_request: Mutex::new(None),
        }
    }
}

#[async_trait]
impl<S: PageSource> PageSource for PacedSource<S> {
    async fn fetch_page(
        &self,
        entity: &EntityType,
        page: u32,
        filter: Option<&PageFilter>,
    ) -> SyncResult<Page> {
        if !self.interval.is_zero() {
            let mut last = self.last_request.lock().await;
            if let Some(previous) = *last {
                let elapsed = previous.elapsed();
                if elapsed < self.interval {
                    tokio::time::sleep(self.interval - elapsed).await;
                }
            }
            *last = Some(Instant::now());
        }

        self.inner.fetch_page(entity, page, filter).await
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_core::ColumnSpec;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn widgets() -> EntityType {
        EntityType::new("widgets")
            .column(ColumnSpec::text("name"))
            .column(ColumnSpec::timestamp("updated_at"))
    }

    fn body(ids: &[i64], total_pages: u32, total_entries: u64) -> Value {
        let records: Vec<Value> = ids.iter().map(|id| json!({"id": id, "name": "w"})).collect();
        json!({
            "widgets": records,
            "meta": {"total_pages": total_pages, "total_entries": total_entries}
        })
    }

    fn http(server: &MockServer) -> HttpPageSource {
        HttpPageSource::new(&server.uri(), Duration::from_secs(5))
            .unwrap()
            .with_token("secret")
    }

    /// Fails with `error` for the first `failures` calls, then serves one page.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        error: fn() -> SyncError,
    }

    #[async_trait]
    impl PageSource for Flaky {
        async fn fetch_page(
            &self,
            entity: &EntityType,
            page: u32,
            _filter: Option<&PageFilter>,
        ) -> SyncResult<Page> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err((self.error)());
            }
            Page::from_body(entity, page, body(&[1], 1, 1))
        }
    }

    #[test]
    fn test_page_from_body() {
        let page = Page::from_body(&widgets(), 1, body(&[1, 2], 3, 7)).unwrap();
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.total_entries, 7);

        let empty = Page::from_body(&widgets(), 1, body(&[], 0, 0)).unwrap();
        assert_eq!(empty.last_page(), 1);
    }

    #[test]
    fn test_page_from_malformed_body() {
        let entity = widgets();
        for bad in [
            json!([1, 2]),
            json!({"widgets": []}),
            json!({"meta": {"total_pages": 1, "total_entries": 0}}),
            json!({"widgets": {}, "meta": {"total_pages": 1, "total_entries": 0}}),
            json!({"widgets": [], "meta": {"total_pages": 1}}),
        ] {
            assert!(matches!(
                Page::from_body(&entity, 1, bad),
                Err(SyncError::MalformedResponse(_))
            ));
        }
    }

    #[test]
    fn test_unpaged_positional_body_is_one_page() {
        let users = mirror_core::catalog::users();
        let page = Page::from_body(&users, 1, json!({"users": [[1, "Ada"], [2, "Bo"]]})).unwrap();

        assert_eq!(page.total_pages, 1);
        assert_eq!(page.total_entries, 2);
        assert_eq!(page.last_page(), 1);
        assert_eq!(page.records[0], json!({"id": 1, "name": "Ada"}));
        assert_eq!(page.records[1], json!({"id": 2, "name": "Bo"}));

        // a paged entity still needs its totals
        assert!(matches!(
            Page::from_body(&widgets(), 1, json!({"widgets": []})),
            Err(SyncError::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_http_unpaged_fetch_omits_page_parameter() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/users"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"users": [[7, "Cy"]]})),
            )
            .mount(&server)
            .await;

        let page = http(&server)
            .fetch_page(&mirror_core::catalog::users(), 1, None)
            .await
            .unwrap();
        assert_eq!(page.records, vec![json!({"id": 7, "name": "Cy"})]);

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].url.query_pairs().all(|(key, _)| key != "page"));
    }

    #[test]
    fn test_page_filter_format() {
        // 2024-05-29 16:26:40 UTC
        let filter = PageFilter::since(1_717_000_000);
        assert_eq!(filter.since_updated_at, "2024-05-29");
    }

    #[tokio::test]
    async fn test_http_fetch_sends_page_filter_and_token() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/widgets"))
            .and(query_param("page", "2"))
            .and(query_param("since_updated_at", "2024-05-29"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body(&[3, 4], 2, 4)))
            .mount(&server)
            .await;

        let page = http(&server)
            .fetch_page(&widgets(), 2, Some(&PageFilter::since(1_717_000_000)))
            .await
            .unwrap();

        assert_eq!(page.number, 2);
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.records[0]["id"], 3);
    }

    #[tokio::test]
    async fn test_http_entity_token_wins() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/widgets"))
            .and(header("authorization", "Bearer widgets-only"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body(&[1], 1, 1)))
            .mount(&server)
            .await;

        let source = http(&server).with_entity_token("widgets", "widgets-only");
        assert!(source.fetch_page(&widgets(), 1, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_http_status_classification() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("page", "3"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("page", "4"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let source = http(&server);
        let entity = widgets();

        assert!(matches!(
            source.fetch_page(&entity, 1, None).await,
            Err(SyncError::RateLimited)
        ));
        assert!(matches!(
            source.fetch_page(&entity, 2, None).await,
            Err(SyncError::ServerError { status: 503, .. })
        ));
        match source.fetch_page(&entity, 3, None).await {
            Err(SyncError::Http { status, body }) => {
                assert_eq!(status, 401);
                assert_eq!(body, "bad token");
            }
            other => panic!("expected Http error, got {:?}", other),
        }
        assert!(matches!(
            source.fetch_page(&entity, 4, None).await,
            Err(SyncError::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_recovers_after_rate_limit() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/widgets"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/widgets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body(&[1], 1, 1)))
            .mount(&server)
            .await;

        let source = RetryingSource::new(
            http(&server),
            RetryPolicy::new(3, Duration::from_millis(5)),
        );
        let page = source.fetch_page(&widgets(), 1, None).await.unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_retry_does_not_repeat_client_errors() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let source = RetryingSource::new(
            http(&server),
            RetryPolicy::new(5, Duration::from_millis(5)),
        );
        assert!(matches!(
            source.fetch_page(&widgets(), 1, None).await,
            Err(SyncError::Http { status: 404, .. })
        ));
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_waits_fixed_backoff() {
        let flaky = Flaky {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
            error: || SyncError::Transport("connection reset".into()),
        };
        let source = RetryingSource::new(flaky, RetryPolicy::new(4, Duration::from_secs(60)));

        let started = Instant::now();
        let result = source.fetch_page(&widgets(), 1, None).await;

        match result {
            Err(SyncError::MaxRetriesExceeded { attempts, last_error }) => {
                assert_eq!(attempts, 4);
                assert!(last_error.contains("connection reset"));
            }
            other => panic!("expected MaxRetriesExceeded, got {:?}", other),
        }
        assert_eq!(source.inner.calls.load(Ordering::SeqCst), 4);
        // three sleeps between four attempts
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(180) && elapsed < Duration::from_secs(181));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_within_bound() {
        let flaky = Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
            error: || SyncError::ServerError { status: 502, body: String::new() },
        };
        let source = RetryingSource::new(flaky, RetryPolicy::new(3, Duration::from_secs(1)));

        assert!(source.fetch_page(&widgets(), 1, None).await.is_ok());
        assert_eq!(source.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paced_source_spaces_requests() {
        let flaky = Flaky {
            failures: 0,
            calls: AtomicU32::new(0),
            error: || SyncError::RateLimited,
        };
        let source = PacedSource::new(flaky, Duration::from_millis(334));
        let entity = widgets();

        let started = Instant::now();
        for page in 1..=3 {
            source.fetch_page(&entity, page, None).await.unwrap();
        }
        // the first request goes out immediately
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(668) && elapsed < Duration::from_millis(700));
    }

    #[test]
    fn test_empty_base_url_is_rejected() {
        assert!(matches!(
            HttpPageSource::new("  ", Duration::from_secs(1)),
            Err(SyncError::InvalidConfig(_))
        ));
    }
}
