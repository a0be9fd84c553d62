//! Remote page sources, the retrying page fetcher, and record normalization.

use async_trait::async_trait;
use cvehist_core::{RawPage, RawValue};
use cvehist_storage::{FetchError, HttpClientConfig, HttpFetcher, RetryPolicy};
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

mod normalize;

pub use normalize::{fallback_change_id, normalize, normalize_page, parse_timestamp, NormalizedPage};

pub const CRATE_NAME: &str = "cvehist-adapters";

pub const NVD_CVE_HISTORY_URL: &str = "https://services.nvd.nist.gov/rest/json/cvehistory/2.0";

/// Largest `resultsPerPage` the NVD change history API accepts.
pub const NVD_MAX_PAGE_SIZE: u32 = 5000;

/// Failure of a single fetch attempt.
#[derive(Debug, Error)]
pub enum TransientFetchError {
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error("undecodable page body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unexpected page shape: {0}")]
    Shape(&'static str),
    #[error("{0}")]
    Other(String),
}

/// Every attempt for one page failed; carries the last cause.
#[derive(Debug, Error)]
#[error("fetching page at startIndex={start_index} failed after {attempts} attempts: {source}")]
pub struct FetchExhausted {
    pub start_index: u64,
    pub attempts: u32,
    #[source]
    pub source: TransientFetchError,
}

/// One request against a paginated feed, no retrying.
#[async_trait]
pub trait PageSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_page(&self, start_index: u64, page_size: u32) -> Result<RawPage, TransientFetchError>;
}

/// Wraps a [`PageSource`] with bounded, linearly backed-off retries.
pub struct PageFetcher<S> {
    source: S,
    retry: RetryPolicy,
}

impl<S: PageSource> PageFetcher<S> {
    pub fn new(source: S, retry: RetryPolicy) -> Self {
        Self { source, retry }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// An empty page is a successful end-of-stream, not an error.
    pub async fn fetch(&self, start_index: u64, page_size: u32) -> Result<RawPage, FetchExhausted> {
        let attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            let span = info_span!(
                "fetch_page",
                source = self.source.source_id(),
                start_index,
                page_size,
                attempt = attempt + 1
            );
            let result = self
                .source
                .fetch_page(start_index, page_size)
                .instrument(span)
                .await;

            match result {
                Ok(page) => return Ok(page),
                Err(err) if attempt + 1 < attempts => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        start_index,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "page fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(FetchExhausted {
                        start_index,
                        attempts,
                        source: err,
                    })
                }
            }
        }
    }
}

/// NVD CVE Change History API.
#[derive(Debug, Clone)]
pub struct NvdSource {
    http: HttpFetcher,
    api_url: String,
}

impl NvdSource {
    pub fn new(http: HttpFetcher, api_url: impl Into<String>) -> Self {
        Self {
            http,
            api_url: api_url.into(),
        }
    }

    pub fn from_config(config: HttpClientConfig, api_url: impl Into<String>) -> anyhow::Result<Self> {
        Ok(Self::new(HttpFetcher::new(config)?, api_url))
    }
}

#[async_trait]
impl PageSource for NvdSource {
    fn source_id(&self) -> &str {
        "nvd-cve-history"
    }

    async fn fetch_page(&self, start_index: u64, page_size: u32) -> Result<RawPage, TransientFetchError> {
        let query = [
            ("startIndex", start_index.to_string()),
            ("resultsPerPage", page_size.to_string()),
        ];
        let response = self.http.get(&self.api_url, &query).await?;
        decode_page(&response.body)
    }
}

/// Decode a `{"cveChanges": [...], "totalResults": n}` body.
pub fn decode_page(body: &[u8]) -> Result<RawPage, TransientFetchError> {
    let value: RawValue = serde_json::from_slice(body)?;
    let RawValue::Mapping(mut envelope) = value else {
        return Err(TransientFetchError::Shape("response body is not a JSON object"));
    };
    let total = envelope.get("totalResults").and_then(RawValue::as_u64);
    let entries = match envelope.remove("cveChanges") {
        Some(RawValue::Sequence(entries)) => entries,
        _ => Vec::new(),
    };
    Ok(RawPage { entries, total })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Fails the first `failures` calls, then returns a one-entry page.
    struct FlakySource {
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakySource {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl PageSource for FlakySource {
        fn source_id(&self) -> &str {
            "flaky"
        }

        async fn fetch_page(&self, _start: u64, _size: u32) -> Result<RawPage, TransientFetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(TransientFetchError::Other(format!("boom #{}", call + 1)));
            }
            Ok(RawPage {
                entries: vec![RawValue::from(json!({"change": {"cveChangeId": "a"}}))],
                total: Some(1),
            })
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            delay_unit: Duration::ZERO,
            ..RetryPolicy::with_max_attempts(max_attempts)
        }
    }

    #[tokio::test]
    async fn succeeds_after_max_attempts_minus_one_failures() {
        let fetcher = PageFetcher::new(FlakySource::new(2), fast_retry(3));
        let page = fetcher.fetch(0, 10).await.expect("third attempt succeeds");
        assert_eq!(page.len(), 1);
        assert_eq!(fetcher.source().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_exactly_max_attempts() {
        let fetcher = PageFetcher::new(FlakySource::new(u32::MAX), fast_retry(3));
        let err = fetcher.fetch(4000, 10).await.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.start_index, 4000);
        assert!(err.source.to_string().contains("boom #3"));
        assert_eq!(fetcher.source().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_five_then_ten_units_between_attempts() {
        let fetcher = PageFetcher::new(FlakySource::new(u32::MAX), RetryPolicy::default());
        let started = tokio::time::Instant::now();
        let _ = fetcher.fetch(0, 10).await.unwrap_err();
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(15) && waited < Duration::from_secs(16), "{waited:?}");
    }

    #[test]
    fn decode_page_reads_entries_and_total() {
        let body = json!({
            "resultsPerPage": 2,
            "startIndex": 0,
            "totalResults": 2500,
            "cveChanges": [{"change": {"cveId": "CVE-1"}}, {"change": {"cveId": "CVE-2"}}]
        });
        let page = decode_page(body.to_string().as_bytes()).expect("decode");
        assert_eq!(page.len(), 2);
        assert_eq!(page.total, Some(2500));
    }

    #[test]
    fn decode_page_without_changes_is_empty() {
        let page = decode_page(br#"{"totalResults": 10}"#).expect("decode");
        assert!(page.is_empty());
        assert_eq!(page.total, Some(10));
    }

    #[test]
    fn decode_page_rejects_non_objects() {
        assert!(matches!(decode_page(b"[1,2]"), Err(TransientFetchError::Shape(_))));
        assert!(matches!(decode_page(b"{not json"), Err(TransientFetchError::Decode(_))));
    }

    #[tokio::test]
    async fn nvd_source_sends_pagination_params_and_api_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/json/cvehistory/2.0"))
            .and(query_param("startIndex", "5000"))
            .and(query_param("resultsPerPage", "2000"))
            .and(header("apikey", "secret-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "totalResults": 5001,
                "cveChanges": [{"change": {"cveChangeId": "last"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let source = NvdSource::from_config(
            HttpClientConfig {
                api_key: Some("secret-key".into()),
                user_agent: Some("cve-history-importer/1.0".into()),
                ..Default::default()
            },
            format!("{}/rest/json/cvehistory/2.0", server.uri()),
        )
        .expect("client");

        let page = source.fetch_page(5000, 2000).await.expect("page");
        assert_eq!(page.len(), 1);
        assert_eq!(page.total, Some(5001));
    }

    #[tokio::test]
    async fn nvd_source_retries_server_errors_through_fetcher() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "totalResults": 0,
                "cveChanges": []
            })))
            .mount(&server)
            .await;

        let source = NvdSource::from_config(HttpClientConfig::default(), server.uri()).expect("client");
        let fetcher = PageFetcher::new(source, fast_retry(3));
        let page = fetcher.fetch(0, 100).await.expect("second attempt succeeds");
        assert!(page.is_empty());
    }

    #[tokio::test]
    async fn nvd_source_reports_http_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let source = NvdSource::from_config(HttpClientConfig::default(), server.uri()).expect("client");
        let err = source.fetch_page(0, 10).await.unwrap_err();
        assert!(matches!(
            err,
            TransientFetchError::Http(FetchError::HttpStatus { status: 403, .. })
        ));
    }
}
