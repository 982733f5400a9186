//! Fetch request type carrying cache and merge metadata.

use reqwest::Method;
use url::Url;
use uuid::Uuid;

use crate::cache::{request_fingerprint, CachePolicy};
use crate::record::SharedRecord;

/// Default text encoding assumed for request bodies.
pub const DEFAULT_ENCODING: &str = "utf-8";

/// Merge metadata attached to sub-fetches of a larger record.
///
/// `initial` is explicit, caller-supplied state captured when the fetch is
/// bound to its record; it is never inferred from dispatch order.
#[derive(Debug, Clone)]
pub struct MergeMeta {
    pub record: SharedRecord,
    pub group_id: Uuid,
    /// Whether this was the first fetch issued against the record. Only the
    /// initial fetch's failure may fail the whole record.
    pub initial: bool,
}

/// One network fetch, possibly cacheable and possibly contributing to a
/// merged record.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: Url,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub encoding: String,
    pub cache: Option<CachePolicy>,
    pub merge: Option<MergeMeta>,
    /// Immutable original identity, captured at request creation when a
    /// prior layer rewrites the request (redirects, rendering proxies).
    /// Merge dedup fingerprints this, not the rewritten identity.
    pub original_fingerprint: Option<String>,
}

impl FetchRequest {
    pub fn new(method: Method, url: &str) -> Result<Self, url::ParseError> {
        Ok(Self {
            url: Url::parse(url)?,
            method,
            headers: Vec::new(),
            body: None,
            encoding: DEFAULT_ENCODING.to_string(),
            cache: None,
            merge: None,
            original_fingerprint: None,
        })
    }

    pub fn get(url: &str) -> Result<Self, url::ParseError> {
        Self::new(Method::GET, url)
    }

    pub fn post(url: &str, body: Vec<u8>) -> Result<Self, url::ParseError> {
        let mut request = Self::new(Method::POST, url)?;
        request.body = Some(body);
        Ok(request)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_cache(mut self, policy: CachePolicy) -> Self {
        self.cache = Some(policy);
        self
    }

    pub fn with_original_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.original_fingerprint = Some(fingerprint.into());
        self
    }

    /// Bind this fetch to a record, making it a merge sub-fetch.
    ///
    /// Assigns the record's group id if it has none; that first binding is
    /// the record's initial fetch. Idempotent on the record side.
    pub async fn bind_record(mut self, record: &SharedRecord) -> Self {
        let (group_id, initial) = record.lock().await.ensure_group_id();
        self.merge = Some(MergeMeta {
            record: record.clone(),
            group_id,
            initial,
        });
        self
    }

    pub fn is_merge(&self) -> bool {
        self.merge.is_some()
    }

    pub fn is_initial(&self) -> bool {
        self.merge.as_ref().map_or(false, |m| m.initial)
    }

    /// Fingerprint used for merge-group deduplication.
    ///
    /// Uses the explicit original identity when present so rewritten and
    /// redirected requests still match their registration. Date-free: merge
    /// identity does not vary by crawl day.
    pub fn merge_fingerprint(&self) -> String {
        if let Some(fingerprint) = &self.original_fingerprint {
            return fingerprint.clone();
        }
        request_fingerprint(
            self.url.as_str(),
            self.method.as_str(),
            &self.encoding,
            self.body.as_deref(),
            None,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{shared, ProductRecord};

    #[tokio::test]
    async fn test_first_binding_is_initial() {
        let record = shared(ProductRecord::new("acme"));
        let first = FetchRequest::get("https://acme.test/p/1")
            .unwrap()
            .bind_record(&record)
            .await;
        let second = FetchRequest::get("https://acme.test/p/1/reviews")
            .unwrap()
            .bind_record(&record)
            .await;

        assert!(first.is_initial());
        assert!(!second.is_initial());
        assert_eq!(
            first.merge.as_ref().unwrap().group_id,
            second.merge.as_ref().unwrap().group_id
        );
    }

    #[test]
    fn test_merge_fingerprint_prefers_original_identity() {
        let rewritten = FetchRequest::get("https://render-proxy.internal/acme.test/p/1")
            .unwrap()
            .with_original_fingerprint("abc123");
        assert_eq!(rewritten.merge_fingerprint(), "abc123");

        let plain = FetchRequest::get("https://acme.test/p/1").unwrap();
        assert_eq!(
            plain.merge_fingerprint(),
            request_fingerprint("https://acme.test/p/1", "GET", "utf-8", None, None)
        );
    }
}
