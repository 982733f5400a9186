//! Generic site support: standard-markup extraction over direct URL
//! fetches.
//!
//! Sites with conventional product markup need no custom code; the generic
//! factory wires the reference extractor to a direct fetch of the task URL.
//! Search listings require site knowledge, so a search URL template is the
//! one thing callers supply.

use std::sync::Arc;

use crate::fetch::FetchRequest;
use crate::messages::{JobSpec, JobTarget};
use crate::record::HtmlProductExtractor;

use super::{CrawlJob, Job, JobError, JobFactory, PaginatedFetcher, SingleFetcher};

/// Fetches the task URL as-is.
struct DirectFetcher;

impl SingleFetcher for DirectFetcher {
    fn start_request(&self, _spec: &JobSpec, url: &str) -> Result<FetchRequest, JobError> {
        Ok(FetchRequest::get(url)?)
    }
}

/// Builds listing fetches: shelf URLs directly, search terms through the
/// site's URL template.
struct TemplateListingFetcher {
    search_url_template: String,
}

impl PaginatedFetcher for TemplateListingFetcher {
    fn listing_request(&self, spec: &JobSpec) -> Result<FetchRequest, JobError> {
        let url = match &spec.target {
            JobTarget::ShelfUrl(url) => url.clone(),
            JobTarget::SearchTerm(term) => self
                .search_url_template
                .replace("{query}", &urlencoding::encode(term)),
            JobTarget::Url(url) => url.clone(),
        };
        Ok(FetchRequest::get(&url)?)
    }
}

/// Job factory for sites served by the reference extractor.
pub struct GenericSiteFactory {
    /// Search listing URL with a `{query}` placeholder. Sites without one
    /// only support single-product tasks.
    pub search_url_template: Option<String>,
}

impl GenericSiteFactory {
    pub fn new() -> Self {
        Self {
            search_url_template: None,
        }
    }

    pub fn with_search_template(template: impl Into<String>) -> Self {
        Self {
            search_url_template: Some(template.into()),
        }
    }
}

impl Default for GenericSiteFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl JobFactory for GenericSiteFactory {
    fn build(&self, _spec: &JobSpec) -> Result<Box<dyn Job>, JobError> {
        let mut job =
            CrawlJob::new(Arc::new(HtmlProductExtractor)).with_single(Arc::new(DirectFetcher));
        if let Some(template) = &self.search_url_template {
            job = job.with_paginated(Arc::new(TemplateListingFetcher {
                search_url_template: template.clone(),
            }));
        }
        Ok(Box::new(job))
    }
}
