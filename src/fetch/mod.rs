//! HTTP fetch layer.
//!
//! The fetcher consults the fingerprint cache before going to the network
//! and writes successful live responses back through it. Every fetch is an
//! async suspension point; nothing here blocks the scheduler.

mod request;
mod response;

pub use request::{FetchRequest, MergeMeta, DEFAULT_ENCODING};
pub use response::FetchResponse;

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::cache::{CacheError, FingerprintCache};

/// User agent presented on live fetches.
pub const USER_AGENT: &str = concat!("shelfcrawl/", env!("CARGO_PKG_VERSION"));

/// Errors from a single fetch.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),
    /// Propagated from the cache: a past-dated snapshot that was never
    /// captured. Not retried and never downgraded to a live fetch.
    #[error("No cached snapshot exists for the requested past crawl date")]
    ExpiredSnapshot,
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// HTTP client with transparent cache consultation.
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    cache: Option<Arc<FingerprintCache>>,
}

impl Fetcher {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .gzip(true)
            .brotli(true)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            cache: None,
        }
    }

    /// Attach a fingerprint cache. Only requests carrying a cache policy
    /// consult it.
    pub fn with_cache(mut self, cache: Arc<FingerprintCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn cache(&self) -> Option<&Arc<FingerprintCache>> {
        self.cache.as_ref()
    }

    /// Execute one fetch: cache first, then the network.
    ///
    /// Successful (200) live responses for cacheable requests are stored
    /// back; store failures are non-fatal.
    pub async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        if let Some(cache) = &self.cache {
            if request.cache.is_some() {
                match cache.get(request).await {
                    Ok(Some(cached)) => return Ok(cached),
                    Ok(None) => {}
                    Err(CacheError::ExpiredSnapshot) => return Err(FetchError::ExpiredSnapshot),
                    Err(err) => {
                        // FingerprintCache degrades backend failures itself;
                        // anything else is unexpected but still just a miss.
                        tracing::warn!("Unexpected cache error, fetching live: {}", err);
                    }
                }
            }
        }

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let started = Instant::now();
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();

        let mut headers = Vec::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let body = response.bytes().await?.to_vec();
        tracing::debug!(
            url = %request.url,
            status,
            bytes = body.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Fetched"
        );

        let fetched = FetchResponse {
            url: final_url,
            status,
            headers,
            body,
            from_cache: false,
        };

        if fetched.status == 200 && request.cache.is_some() {
            if let Some(cache) = &self.cache {
                cache.put(request, &fetched).await;
            }
        }

        Ok(fetched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CachePolicy, MemoryCacheBackend};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cached_fetcher() -> (Fetcher, Arc<FingerprintCache>) {
        let cache = Arc::new(FingerprintCache::new(
            Arc::new(MemoryCacheBackend::new()),
            Duration::from_secs(3600),
        ));
        let fetcher = Fetcher::new(Duration::from_secs(5)).with_cache(cache.clone());
        (fetcher, cache)
    }

    #[tokio::test]
    async fn test_live_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/p/1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>widget</html>"))
            .mount(&server)
            .await;

        let fetcher = Fetcher::new(Duration::from_secs(5));
        let request = FetchRequest::get(&format!("{}/p/1", server.uri())).unwrap();
        let response = fetcher.fetch(&request).await.unwrap();
        assert_eq!(response.status, 200);
        assert!(!response.from_cache);
        assert_eq!(response.body, b"<html>widget</html>");
    }

    #[tokio::test]
    async fn test_second_fetch_served_from_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/p/1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("body"))
            .expect(1)
            .mount(&server)
            .await;

        let (fetcher, cache) = cached_fetcher();
        let request = FetchRequest::get(&format!("{}/p/1", server.uri()))
            .unwrap()
            .with_cache(CachePolicy::default());

        let first = fetcher.fetch(&request).await.unwrap();
        assert!(!first.from_cache);

        let second = fetcher.fetch(&request).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(second.body, b"body");
        assert_eq!(cache.stats().put_count, 1);
        assert_eq!(cache.stats().get_count, 1);
    }

    #[tokio::test]
    async fn test_expired_snapshot_propagates() {
        let (fetcher, _cache) = cached_fetcher();
        let yesterday = chrono::Utc::now().date_naive() - chrono::Duration::days(1);
        let request = FetchRequest::get("https://acme.test/p/1")
            .unwrap()
            .with_cache(CachePolicy::for_date(Some(yesterday)));

        assert!(matches!(
            fetcher.fetch(&request).await,
            Err(FetchError::ExpiredSnapshot)
        ));
    }

    #[tokio::test]
    async fn test_non_200_not_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/p/404"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let (fetcher, cache) = cached_fetcher();
        let request = FetchRequest::get(&format!("{}/p/404", server.uri()))
            .unwrap()
            .with_cache(CachePolicy::default());
        let response = fetcher.fetch(&request).await.unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(cache.stats().put_count, 0);
    }
}
