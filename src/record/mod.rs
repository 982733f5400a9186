//! Product records under assembly and the per-site extractor interface.
//!
//! The runtime does not interpret field semantics. Extractors return opaque
//! field maps and further fetch requests; the crawl driver owns all
//! record/request plumbing.

mod extract;

pub use extract::HtmlProductExtractor;

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::fetch::{FetchRequest, FetchResponse};

/// One logical output record, populated by one or more fetches.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ProductRecord {
    pub site: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_term: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crawl_date: Option<NaiveDate>,
    /// Extracted fields. Opaque to the runtime.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    /// Merge group identifier. Assigned once, on the first merge-capable
    /// fetch issued against this record.
    #[serde(skip)]
    group_id: Option<Uuid>,
}

impl ProductRecord {
    pub fn new(site: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            ..Default::default()
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_search_term(mut self, term: impl Into<String>) -> Self {
        self.search_term = Some(term.into());
        self
    }

    pub fn group_id(&self) -> Option<Uuid> {
        self.group_id
    }

    /// Assign the merge group id if absent. Returns `(id, assigned_now)`.
    ///
    /// Idempotent: a record that already carries a group id keeps it, and
    /// the caller learns the fetch being bound is not the initial one.
    pub(crate) fn ensure_group_id(&mut self) -> (Uuid, bool) {
        match self.group_id {
            Some(id) => (id, false),
            None => {
                let id = Uuid::new_v4();
                self.group_id = Some(id);
                (id, true)
            }
        }
    }

    /// Merge extracted fields into the record. Later values win.
    pub fn merge_fields(&mut self, fields: Map<String, Value>) {
        for (key, value) in fields {
            self.fields.insert(key, value);
        }
    }

    /// Stamp the crawl date if not already set.
    pub fn stamp_crawl_date(&mut self, date: NaiveDate) {
        if self.crawl_date.is_none() {
            self.crawl_date = Some(date);
        }
    }
}

/// A record shared between the merge group and its in-flight sub-fetches.
pub type SharedRecord = Arc<Mutex<ProductRecord>>;

pub fn shared(record: ProductRecord) -> SharedRecord {
    Arc::new(Mutex::new(record))
}

/// What an extractor produced from one fetched page.
#[derive(Debug, Default)]
pub struct Extraction {
    /// Fields to merge into the current record.
    pub fields: Map<String, Value>,
    /// Further sub-fetches contributing to the current record.
    pub sub_fetches: Vec<FetchRequest>,
    /// New records discovered on a listing page, each with the fetch that
    /// will populate it.
    pub item_seeds: Vec<(FetchRequest, ProductRecord)>,
    /// Plain follow-up fetches (pagination). Never merge-bound.
    pub next_pages: Vec<FetchRequest>,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
            && self.sub_fetches.is_empty()
            && self.item_seeds.is_empty()
            && self.next_pages.is_empty()
    }
}

/// Per-site page parser. Pure transformation: page content in, field
/// values and further fetch requests out. No orchestration logic.
pub trait SiteExtractor: Send + Sync {
    /// Parse one fetched page. `record` is the record the page belongs to,
    /// or `None` for pages not bound to a record (listing pages).
    fn parse(&self, response: &FetchResponse, record: Option<&ProductRecord>) -> Extraction;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_group_id_is_idempotent() {
        let mut record = ProductRecord::new("acme");
        let (first, assigned) = record.ensure_group_id();
        assert!(assigned);
        let (second, assigned_again) = record.ensure_group_id();
        assert!(!assigned_again);
        assert_eq!(first, second);
    }

    #[test]
    fn test_merge_fields_later_values_win() {
        let mut record = ProductRecord::new("acme");
        let mut first = Map::new();
        first.insert("title".to_string(), Value::String("Widget".to_string()));
        record.merge_fields(first);

        let mut second = Map::new();
        second.insert("title".to_string(), Value::String("Widget v2".to_string()));
        second.insert("price".to_string(), Value::String("9.99".to_string()));
        record.merge_fields(second);

        assert_eq!(record.fields["title"], "Widget v2");
        assert_eq!(record.fields["price"], "9.99");
    }

    #[test]
    fn test_stamp_crawl_date_only_once() {
        let mut record = ProductRecord::new("acme");
        let first = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let second = NaiveDate::from_ymd_opt(2021, 6, 15).unwrap();
        record.stamp_crawl_date(first);
        record.stamp_crawl_date(second);
        assert_eq!(record.crawl_date, Some(first));
    }

    #[test]
    fn test_serialization_skips_group_id() {
        let mut record = ProductRecord::new("acme").with_url("https://acme.test/p/1");
        record.ensure_group_id();
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("group_id").is_none());
        assert_eq!(json["site"], "acme");
        assert_eq!(json["url"], "https://acme.test/p/1");
    }
}
