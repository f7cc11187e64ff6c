//! Remote record sources: an HTTP client with retry/backoff and per-entity list endpoints.
//!
//! Fetching fails soft. Once retries are spent the caller gets an empty list and a warning in
//! the log, never an error; only a malformed endpoint url is reported as [`SourceError`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use csync_core::EntityKind;
use reqwest::{StatusCode, Url};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "csync-sources";

pub const DEFAULT_API_BASE_URL: &str = "https://jsonplaceholder.typicode.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(300),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not valid JSON: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("cannot build endpoint url from {base} and {path}: {reason}")]
    InvalidUrl {
        base: String,
        path: String,
        reason: String,
    },
}

#[derive(Debug)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    backoff: BackoffPolicy,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, config: HttpClientConfig) -> anyhow::Result<Self> {
        let user_agent = config
            .user_agent
            .unwrap_or_else(|| format!("{CRATE_NAME}/{}", env!("CARGO_PKG_VERSION")));
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(user_agent)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            backoff: config.backoff,
        })
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, SourceError> {
        let joined = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(&joined).map_err(|err| SourceError::InvalidUrl {
            base: self.base_url.clone(),
            path: path.to_string(),
            reason: err.to_string(),
        })
    }

    /// GET `url` as JSON, retrying transient failures per the backoff policy.
    pub async fn fetch_json(&self, url: Url) -> Result<JsonValue, FetchError> {
        let mut attempt = 0;
        loop {
            let can_retry = attempt < self.backoff.max_retries;
            match self.client.get(url.clone()).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return resp.json::<JsonValue>().await.map_err(|source| {
                            FetchError::Decode {
                                url: final_url,
                                source,
                            }
                        });
                    }

                    if !can_retry || classify_status(status) != RetryDisposition::Retryable {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    let delay = self.backoff.delay_for_attempt(attempt);
                    debug!(attempt, status = status.as_u16(), ?delay, "retrying after status");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if !can_retry || classify_reqwest_error(&err) != RetryDisposition::Retryable {
                        return Err(FetchError::Request(err));
                    }
                    let delay = self.backoff.delay_for_attempt(attempt);
                    debug!(attempt, error = %err, ?delay, "retrying after request error");
                    tokio::time::sleep(delay).await;
                }
            }
            attempt += 1;
        }
    }

    /// Fetch a collection endpoint, downgrading any fetch failure to an empty list.
    pub async fn list(&self, path: &str) -> Result<JsonValue, SourceError> {
        let url = self.endpoint(path)?;
        let span = info_span!("http_fetch", url = %url);
        let result = self.fetch_json(url.clone()).instrument(span).await;
        match result {
            Ok(payload) => Ok(payload),
            Err(err) => {
                warn!(%url, error = %err, "no data retrieved");
                Ok(JsonValue::Array(Vec::new()))
            }
        }
    }
}

/// Something that can produce the full remote collection for one entity kind.
#[async_trait]
pub trait RecordSource: Send + Sync {
    fn kind(&self) -> EntityKind;

    /// The raw payload, unvalidated. An unreachable remote yields an empty list.
    async fn list(&self) -> Result<JsonValue, SourceError>;
}

/// A list endpoint under the shared API client, e.g. `/posts`.
#[derive(Debug, Clone)]
pub struct EndpointSource {
    client: Arc<ApiClient>,
    kind: EntityKind,
    path: String,
}

impl EndpointSource {
    pub fn new(client: Arc<ApiClient>, kind: EntityKind, path: impl Into<String>) -> Self {
        Self {
            client,
            kind,
            path: path.into(),
        }
    }

    pub fn for_kind(client: Arc<ApiClient>, kind: EntityKind) -> Self {
        Self::new(client, kind, kind.default_path())
    }
}

#[async_trait]
impl RecordSource for EndpointSource {
    fn kind(&self) -> EntityKind {
        self.kind
    }

    async fn list(&self) -> Result<JsonValue, SourceError> {
        self.client.list(&self.path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::State;
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    fn fast_client(base_url: &str, max_retries: usize) -> ApiClient {
        ApiClient::new(
            base_url,
            HttpClientConfig {
                timeout: Duration::from_secs(5),
                user_agent: None,
                backoff: BackoffPolicy {
                    max_retries,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                },
            },
        )
        .expect("client")
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn flaky_posts(State(hits): State<Arc<AtomicUsize>>) -> Response {
        if hits.fetch_add(1, Ordering::SeqCst) < 2 {
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        } else {
            Json(json!([{"userId": 1, "id": 1, "title": "t", "body": "b"}])).into_response()
        }
    }

    async fn missing(State(hits): State<Arc<AtomicUsize>>) -> Response {
        hits.fetch_add(1, Ordering::SeqCst);
        StatusCode::NOT_FOUND.into_response()
    }

    async fn always_down(State(hits): State<Arc<AtomicUsize>>) -> Response {
        hits.fetch_add(1, Ordering::SeqCst);
        StatusCode::BAD_GATEWAY.into_response()
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(classify_status(StatusCode::SERVICE_UNAVAILABLE), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::INTERNAL_SERVER_ERROR), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), RetryDisposition::NonRetryable);
    }

    #[test]
    fn endpoint_joins_base_and_path() {
        let client = fast_client("https://api.example.test/", 0);
        assert_eq!(
            client.endpoint("/posts").unwrap().as_str(),
            "https://api.example.test/posts"
        );
        let broken = fast_client("not a url", 0);
        assert!(matches!(broken.endpoint("posts"), Err(SourceError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(Router::new().route("/posts", get(flaky_posts)).with_state(hits.clone())).await;
        let client = Arc::new(fast_client(&base, 3));

        let source = EndpointSource::for_kind(client, EntityKind::Post);
        let payload = source.list().await.unwrap();

        assert_eq!(payload.as_array().map(Vec::len), Some(1));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_soft_to_empty_list() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(Router::new().route("/posts", get(always_down)).with_state(hits.clone())).await;
        let client = fast_client(&base, 2);

        let payload = client.list("posts").await.unwrap();

        assert_eq!(payload, json!([]));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn last_attempt_reports_the_real_status() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(Router::new().route("/posts", get(always_down)).with_state(hits.clone())).await;
        let client = fast_client(&base, 1);

        let err = client.fetch_json(client.endpoint("posts").unwrap()).await.unwrap_err();

        assert!(matches!(err, FetchError::HttpStatus { status: 502, .. }), "{err}");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(Router::new().route("/comments", get(missing)).with_state(hits.clone())).await;
        let client = fast_client(&base, 3);

        let payload = client.list("comments").await.unwrap();

        assert_eq!(payload, json!([]));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreachable_host_fails_soft() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = fast_client(&format!("http://{addr}"), 1);

        assert_eq!(client.list("posts").await.unwrap(), json!([]));
    }

    #[tokio::test]
    async fn non_list_json_is_passed_through_for_validation() {
        let base = serve(Router::new().route("/posts", get(|| async { Json(json!("oops")) }))).await;
        let client = fast_client(&base, 0);

        assert_eq!(client.list("posts").await.unwrap(), json!("oops"));
    }

    #[tokio::test]
    async fn undecodable_body_fails_soft() {
        let base = serve(Router::new().route("/posts", get(|| async { "<html>maintenance</html>" }))).await;
        let client = fast_client(&base, 0);

        assert_eq!(client.list("posts").await.unwrap(), json!([]));
    }
}
