//! Fingerprint cache: serve fetches from previously captured responses.
//!
//! Responses are stored under a deterministic request fingerprint scoped by
//! an optional logical "as-of" date, so historical crawls can be replayed
//! reproducibly. The cache is an optimization, never a hard dependency:
//! backend failures degrade to misses. The one fatal condition is asking
//! for a past date that was never captured — that snapshot can never be
//! created consistently, so the fetch fails rather than silently going
//! live.

mod fingerprint;
mod memory;
#[cfg(feature = "redis-backend")]
mod redis;

pub use fingerprint::{request_fingerprint, CRAWL_DATE_FORMAT};
pub use memory::MemoryCacheBackend;
#[cfg(feature = "redis-backend")]
pub use redis::RedisCacheBackend;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fetch::{FetchRequest, FetchResponse};

/// Errors from cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A past-dated snapshot was requested but never captured. Fatal to the
    /// calling fetch; falling through to a live fetch would break historical
    /// reproducibility.
    #[error("No cached snapshot exists for the requested past crawl date")]
    ExpiredSnapshot,
    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("Cache entry serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Backend(String),
}

/// Entry time-to-live policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TtlPolicy {
    /// Use the cache's configured default TTL.
    #[default]
    Default,
    Seconds(u64),
    /// Entries never expire, and fingerprints exclude the crawl date so the
    /// same fetch is cache-stable across days.
    Never,
}

/// Per-request caching parameters, attached to cacheable fetches.
#[derive(Debug, Clone, Default)]
pub struct CachePolicy {
    pub ttl: TtlPolicy,
    /// Logical crawl date. Absent means "today".
    pub as_of: Option<NaiveDate>,
    /// Explicit fingerprint override; replaces computation entirely.
    pub fingerprint: Option<String>,
}

impl CachePolicy {
    pub fn for_date(as_of: Option<NaiveDate>) -> Self {
        Self {
            as_of,
            ..Default::default()
        }
    }

    pub fn never_expire() -> Self {
        Self {
            ttl: TtlPolicy::Never,
            ..Default::default()
        }
    }
}

/// Raw entry storage keyed by fingerprint.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn connect(&self) -> Result<(), CacheError>;
    async fn close(&self) -> Result<(), CacheError>;
    async fn get(&self, fingerprint: &str) -> Result<Option<Vec<u8>>, CacheError>;
    /// Store an entry. `ttl` of `None` means never expire.
    async fn put(
        &self,
        fingerprint: &str,
        entry: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError>;
}

/// Stored representation of a cached response.
#[derive(Debug, Serialize, Deserialize)]
struct CachedEntry {
    url: String,
    status: u16,
    headers: Vec<(String, String)>,
    /// Base64-encoded body.
    body: String,
}

/// Byte-accounting counters. Operational visibility, not correctness.
#[derive(Debug, Default)]
pub struct CacheStats {
    get_count: AtomicU64,
    get_bytes: AtomicU64,
    put_count: AtomicU64,
    put_bytes: AtomicU64,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub get_count: u64,
    pub get_bytes: u64,
    pub put_count: u64,
    pub put_bytes: u64,
}

impl CacheStats {
    fn record_get(&self, bytes: u64) {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        self.get_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn record_put(&self, bytes: u64) {
        self.put_count.fetch_add(1, Ordering::Relaxed);
        self.put_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            get_count: self.get_count.load(Ordering::Relaxed),
            get_bytes: self.get_bytes.load(Ordering::Relaxed),
            put_count: self.put_count.load(Ordering::Relaxed),
            put_bytes: self.put_bytes.load(Ordering::Relaxed),
        }
    }
}

/// The cache front: computes fingerprints, applies the as-of-date rules,
/// and degrades backend failures to misses.
pub struct FingerprintCache {
    backend: Arc<dyn CacheBackend>,
    default_ttl: Duration,
    stats: CacheStats,
}

impl FingerprintCache {
    pub fn new(backend: Arc<dyn CacheBackend>, default_ttl: Duration) -> Self {
        Self {
            backend,
            default_ttl,
            stats: CacheStats::default(),
        }
    }

    pub async fn connect(&self) -> Result<(), CacheError> {
        self.backend.connect().await
    }

    pub async fn close(&self) -> Result<(), CacheError> {
        self.backend.close().await
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Fingerprint for a cacheable request under its policy.
    ///
    /// The crawl date is included unless the TTL policy is `Never`. An
    /// explicit override on the policy wins outright.
    pub fn fingerprint_for(request: &FetchRequest, policy: &CachePolicy) -> String {
        if let Some(fingerprint) = &policy.fingerprint {
            return fingerprint.clone();
        }
        let date = match policy.ttl {
            TtlPolicy::Never => None,
            _ => Some(policy.as_of.unwrap_or_else(|| Utc::now().date_naive())),
        };
        request_fingerprint(
            request.url.as_str(),
            request.method.as_str(),
            &request.encoding,
            request.body.as_deref(),
            date,
        )
    }

    /// Look up a cached response for a request.
    ///
    /// Returns `Ok(None)` on an ordinary miss (including backend failures,
    /// which are logged and degraded). The only error that escapes is
    /// `ExpiredSnapshot`: an explicit past as-of date with no stored entry,
    /// no fingerprint override, and an expiring TTL policy.
    pub async fn get(&self, request: &FetchRequest) -> Result<Option<FetchResponse>, CacheError> {
        let Some(policy) = &request.cache else {
            return Ok(None);
        };
        let fingerprint = Self::fingerprint_for(request, policy);

        let raw = match self.backend.get(&fingerprint).await {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!("Error while retrieving cache entry: {}", err);
                return Ok(None);
            }
        };

        let Some(raw) = raw else {
            let today = Utc::now().date_naive();
            if policy.as_of.map_or(false, |as_of| as_of < today)
                && policy.fingerprint.is_none()
                && policy.ttl != TtlPolicy::Never
            {
                return Err(CacheError::ExpiredSnapshot);
            }
            tracing::debug!(url = %request.url, "Cache miss");
            return Ok(None);
        };

        let entry: CachedEntry = match serde_json::from_slice(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!("Discarding undecodable cache entry: {}", err);
                return Ok(None);
            }
        };
        let body = match BASE64.decode(&entry.body) {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!("Discarding cache entry with invalid body encoding: {}", err);
                return Ok(None);
            }
        };

        self.stats.record_get(Self::entry_bytes(&entry, &body));
        tracing::debug!(url = %request.url, "Cache hit");
        Ok(Some(FetchResponse {
            url: entry.url,
            status: entry.status,
            headers: entry.headers,
            body,
            from_cache: true,
        }))
    }

    /// Store a response. Returns whether the write succeeded; failures are
    /// logged and non-fatal.
    pub async fn put(&self, request: &FetchRequest, response: &FetchResponse) -> bool {
        let Some(policy) = &request.cache else {
            return false;
        };
        if response.status != 200 || response.from_cache {
            return false;
        }

        let fingerprint = Self::fingerprint_for(request, policy);
        let entry = CachedEntry {
            url: response.url.clone(),
            status: response.status,
            headers: response.headers.clone(),
            body: BASE64.encode(&response.body),
        };
        let raw = match serde_json::to_vec(&entry) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!("Error while encoding cache entry: {}", err);
                return false;
            }
        };
        let ttl = match policy.ttl {
            TtlPolicy::Never => None,
            TtlPolicy::Seconds(secs) => Some(Duration::from_secs(secs)),
            TtlPolicy::Default => Some(self.default_ttl),
        };

        match self.backend.put(&fingerprint, raw, ttl).await {
            Ok(()) => {
                self.stats
                    .record_put(Self::entry_bytes(&entry, &response.body));
                tracing::debug!(url = %request.url, "Stored response in cache");
                true
            }
            Err(err) => {
                tracing::warn!("Error while storing cache entry: {}", err);
                false
            }
        }
    }

    fn entry_bytes(entry: &CachedEntry, body: &[u8]) -> u64 {
        let header_bytes: usize = entry
            .headers
            .iter()
            .map(|(name, value)| name.len() + value.len())
            .sum();
        (entry.url.len() + header_bytes + body.len()) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    struct FailingBackend;

    #[async_trait]
    impl CacheBackend for FailingBackend {
        async fn connect(&self) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("down".to_string()))
        }
        async fn close(&self) -> Result<(), CacheError> {
            Ok(())
        }
        async fn get(&self, _fingerprint: &str) -> Result<Option<Vec<u8>>, CacheError> {
            Err(CacheError::Unavailable("down".to_string()))
        }
        async fn put(
            &self,
            _fingerprint: &str,
            _entry: Vec<u8>,
            _ttl: Option<Duration>,
        ) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("down".to_string()))
        }
    }

    fn cache() -> FingerprintCache {
        FingerprintCache::new(
            Arc::new(MemoryCacheBackend::new()),
            Duration::from_secs(3600),
        )
    }

    fn request(policy: CachePolicy) -> FetchRequest {
        FetchRequest::get("https://acme.test/p/1")
            .unwrap()
            .with_cache(policy)
    }

    fn response() -> FetchResponse {
        FetchResponse {
            url: "https://acme.test/p/1".to_string(),
            status: 200,
            headers: vec![("content-type".to_string(), "text/html".to_string())],
            body: b"<html>widget</html>".to_vec(),
            from_cache: false,
        }
    }

    #[tokio::test]
    async fn test_put_then_get_roundtrip() {
        let cache = cache();
        let req = request(CachePolicy::default());
        assert!(cache.put(&req, &response()).await);

        let hit = cache.get(&req).await.unwrap().unwrap();
        assert!(hit.from_cache);
        assert_eq!(hit.status, 200);
        assert_eq!(hit.body, b"<html>widget</html>");

        let stats = cache.stats();
        assert_eq!(stats.put_count, 1);
        assert_eq!(stats.get_count, 1);
        assert!(stats.get_bytes > 0);
    }

    #[tokio::test]
    async fn test_miss_for_today_is_not_an_error() {
        let cache = cache();
        let req = request(CachePolicy::for_date(Some(Utc::now().date_naive())));
        assert!(cache.get(&req).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_miss_for_past_date_is_expired_snapshot() {
        let cache = cache();
        let yesterday = Utc::now().date_naive() - ChronoDuration::days(1);
        let req = request(CachePolicy::for_date(Some(yesterday)));
        assert!(matches!(
            cache.get(&req).await,
            Err(CacheError::ExpiredSnapshot)
        ));
    }

    #[tokio::test]
    async fn test_past_date_with_never_ttl_is_ordinary_miss() {
        let cache = cache();
        let yesterday = Utc::now().date_naive() - ChronoDuration::days(1);
        let req = request(CachePolicy {
            ttl: TtlPolicy::Never,
            as_of: Some(yesterday),
            fingerprint: None,
        });
        assert!(cache.get(&req).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_past_date_with_fingerprint_override_is_ordinary_miss() {
        let cache = cache();
        let yesterday = Utc::now().date_naive() - ChronoDuration::days(1);
        let req = request(CachePolicy {
            ttl: TtlPolicy::Default,
            as_of: Some(yesterday),
            fingerprint: Some("explicit".to_string()),
        });
        assert!(cache.get(&req).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_never_expire_fingerprint_is_date_independent() {
        let cache = cache();
        let stored = request(CachePolicy {
            ttl: TtlPolicy::Never,
            as_of: Some(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()),
            fingerprint: None,
        });
        assert!(cache.put(&stored, &response()).await);

        let fetched = request(CachePolicy {
            ttl: TtlPolicy::Never,
            as_of: Some(NaiveDate::from_ymd_opt(2099, 12, 31).unwrap()),
            fingerprint: None,
        });
        assert!(cache.get(&fetched).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_dated_fingerprints_are_scoped_per_day() {
        let cache = cache();
        let req_put = request(CachePolicy::for_date(Some(Utc::now().date_naive())));
        assert!(cache.put(&req_put, &response()).await);

        // Same request fetched under TTL=Never hashes differently.
        let req_never = request(CachePolicy::never_expire());
        assert!(cache.get(&req_never).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_non_200_responses_are_not_stored() {
        let cache = cache();
        let req = request(CachePolicy::default());
        let mut resp = response();
        resp.status = 404;
        assert!(!cache.put(&req, &resp).await);
        assert_eq!(cache.stats().put_count, 0);
    }

    #[tokio::test]
    async fn test_backend_failure_degrades_to_miss() {
        let cache = FingerprintCache::new(Arc::new(FailingBackend), Duration::from_secs(60));
        let req = request(CachePolicy::default());
        assert!(cache.get(&req).await.unwrap().is_none());
        assert!(!cache.put(&req, &response()).await);
    }
}
