//! Deterministic request fingerprints for caching and merge deduplication.

use chrono::NaiveDate;
use sha2::{Digest, Sha256};

/// Date format used inside fingerprints and on records.
pub const CRAWL_DATE_FORMAT: &str = "%Y-%m-%d";

/// Compute the fingerprint of a request identity.
///
/// The body is canonicalized by byte-sorting so parameter reorderings of
/// form-encoded payloads hash identically. `date` scopes the fingerprint to
/// a logical crawl day; pass `None` for date-independent fingerprints.
pub fn request_fingerprint(
    url: &str,
    method: &str,
    encoding: &str,
    body: Option<&[u8]>,
    date: Option<NaiveDate>,
) -> String {
    let mut canonical_body = body.unwrap_or_default().to_vec();
    canonical_body.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(method.as_bytes());
    hasher.update(encoding.as_bytes());
    hasher.update(&canonical_body);
    if let Some(date) = date {
        hasher.update(date.format(CRAWL_DATE_FORMAT).to_string().as_bytes());
    }
    hex::encode(hasher.finalize())
}
