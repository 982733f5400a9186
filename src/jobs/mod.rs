//! Crawl jobs: typed registry, capability composition, and the fetch
//! driver.
//!
//! A site registers a `JobFactory`; the factory builds a `CrawlJob` holding
//! the site's extractor plus whichever fetch capabilities it supports
//! (single product, paginated listing). The driver dispatches fetches as
//! concurrent tasks, routes completions through the extractor, and lets the
//! merge engine decide when records are whole.

mod generic;

pub use generic::GenericSiteFactory;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;

use crate::cache::CachePolicy;
use crate::fetch::{FetchError, FetchRequest, FetchResponse, Fetcher};
use crate::merge::{MergeEngine, MergeError};
use crate::messages::{JobSpec, JobTarget};
use crate::record::{shared, ProductRecord, SiteExtractor};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Unsupported site {0}")]
    UnknownSite(String),
    #[error("Job for site {site} lacks the {capability} capability")]
    MissingCapability {
        site: String,
        capability: &'static str,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Everything a job needs to execute: its parameters and the shared
/// runtime services.
pub struct JobContext {
    pub spec: JobSpec,
    pub fetcher: Arc<Fetcher>,
    pub merge: Arc<MergeEngine>,
    /// Cache policy applied to this job's fetches; `None` when caching is
    /// disabled for the site (or the job is a summary).
    pub cache_policy: Option<CachePolicy>,
}

impl JobContext {
    /// Apply the job's cache policy to a request that doesn't carry its own.
    fn with_job_cache(&self, request: FetchRequest) -> FetchRequest {
        if request.cache.is_none() {
            if let Some(policy) = &self.cache_policy {
                return request.with_cache(policy.clone());
            }
        }
        request
    }
}

/// A runnable crawl job. Returns the records it emitted.
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self, ctx: &JobContext) -> Result<Vec<ProductRecord>, JobError>;
}

/// Builds jobs for one site.
pub trait JobFactory: Send + Sync {
    fn build(&self, spec: &JobSpec) -> Result<Box<dyn Job>, JobError>;
}

/// Site-keyed job registry, fixed at startup.
#[derive(Clone, Default)]
pub struct JobRegistry {
    factories: HashMap<String, Arc<dyn JobFactory>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, site: impl Into<String>, factory: Arc<dyn JobFactory>) {
        self.factories.insert(site.into(), factory);
    }

    pub fn supports(&self, site: &str) -> bool {
        self.factories.contains_key(site)
    }

    pub fn build(&self, spec: &JobSpec) -> Result<Box<dyn Job>, JobError> {
        self.factories
            .get(&spec.site)
            .ok_or_else(|| JobError::UnknownSite(spec.site.clone()))?
            .build(spec)
    }
}

/// Capability: build the seed fetch for a single-product task.
pub trait SingleFetcher: Send + Sync {
    fn start_request(&self, spec: &JobSpec, url: &str) -> Result<FetchRequest, JobError>;
}

/// Capability: build the first listing fetch for search and shelf tasks.
pub trait PaginatedFetcher: Send + Sync {
    fn listing_request(&self, spec: &JobSpec) -> Result<FetchRequest, JobError>;
}

/// A site's crawl job: an extractor plus optional fetch capabilities.
///
/// Composition instead of inheritance: the job invokes whichever
/// capabilities are present for the task at hand.
pub struct CrawlJob {
    extractor: Arc<dyn SiteExtractor>,
    single: Option<Arc<dyn SingleFetcher>>,
    paginated: Option<Arc<dyn PaginatedFetcher>>,
}

impl CrawlJob {
    pub fn new(extractor: Arc<dyn SiteExtractor>) -> Self {
        Self {
            extractor,
            single: None,
            paginated: None,
        }
    }

    pub fn with_single(mut self, single: Arc<dyn SingleFetcher>) -> Self {
        self.single = Some(single);
        self
    }

    pub fn with_paginated(mut self, paginated: Arc<dyn PaginatedFetcher>) -> Self {
        self.paginated = Some(paginated);
        self
    }
}

#[async_trait]
impl Job for CrawlJob {
    async fn run(&self, ctx: &JobContext) -> Result<Vec<ProductRecord>, JobError> {
        let seeds = match &ctx.spec.target {
            JobTarget::Url(url) => {
                let single =
                    self.single
                        .as_ref()
                        .ok_or_else(|| JobError::MissingCapability {
                            site: ctx.spec.site.clone(),
                            capability: "single-product",
                        })?;
                let mut record = ProductRecord::new(&ctx.spec.site).with_url(url.clone());
                if let Some(date) = ctx.spec.as_of {
                    record.stamp_crawl_date(date);
                }
                let record = shared(record);
                let request = ctx
                    .with_job_cache(single.start_request(&ctx.spec, url)?)
                    .bind_record(&record)
                    .await;
                vec![request]
            }
            JobTarget::SearchTerm(_) | JobTarget::ShelfUrl(_) => {
                let paginated =
                    self.paginated
                        .as_ref()
                        .ok_or_else(|| JobError::MissingCapability {
                            site: ctx.spec.site.clone(),
                            capability: "paginated-listing",
                        })?;
                vec![ctx.with_job_cache(paginated.listing_request(&ctx.spec)?)]
            }
        };

        drive(ctx, self.extractor.as_ref(), seeds).await
    }
}

type FetchFuture =
    Pin<Box<dyn Future<Output = (FetchRequest, Result<FetchResponse, FetchError>)> + Send>>;

fn dispatch(fetcher: Arc<Fetcher>, request: FetchRequest) -> FetchFuture {
    Box::pin(async move {
        let result = fetcher.fetch(&request).await;
        (request, result)
    })
}

/// Drive a set of seed fetches to completion.
///
/// Every completion runs through the extractor; new sub-fetches join the
/// in-flight set as they are discovered. Records surface through the merge
/// engine exactly once each. Item and page counts are bounded by the job
/// spec's `quantity` and `pages`.
pub(crate) async fn drive(
    ctx: &JobContext,
    extractor: &dyn SiteExtractor,
    seeds: Vec<FetchRequest>,
) -> Result<Vec<ProductRecord>, JobError> {
    let mut in_flight: FuturesUnordered<FetchFuture> = FuturesUnordered::new();
    let mut emitted = Vec::new();
    let mut items_seeded: u32 = 0;
    let mut pages_fetched: u32 = 0;

    for request in seeds {
        if request.is_merge() {
            ctx.merge.register(&request).await?;
            items_seeded += 1;
        } else {
            pages_fetched += 1;
        }
        in_flight.push(dispatch(ctx.fetcher.clone(), request));
    }

    while let Some((request, result)) = in_flight.next().await {
        let response = match result {
            Ok(response) => response,
            Err(error) => match ctx.merge.abandon_on_http_error(&request, error).await {
                Ok(Some(record)) => {
                    emitted.push(record);
                    continue;
                }
                Ok(None) => continue,
                Err(error) => {
                    // Initial-fetch or listing failure sinks the job.
                    ctx.merge.shutdown().await;
                    return Err(error.into());
                }
            },
        };

        let mut extraction = match &request.merge {
            Some(meta) => {
                let record = meta.record.lock().await;
                extractor.parse(&response, Some(&*record))
            }
            None => extractor.parse(&response, None),
        };

        if let Some(meta) = &request.merge {
            let fields = std::mem::take(&mut extraction.fields);
            if !fields.is_empty() {
                meta.record.lock().await.merge_fields(fields);
            }

            for sub in extraction.sub_fetches.drain(..) {
                let sub = ctx
                    .with_job_cache(sub)
                    .bind_record(&meta.record)
                    .await;
                ctx.merge.register(&sub).await?;
                in_flight.push(dispatch(ctx.fetcher.clone(), sub));
            }
        } else if !extraction.sub_fetches.is_empty() {
            tracing::warn!(
                url = %request.url,
                "Extractor returned sub-fetches for a fetch with no record; dropping them"
            );
        }

        for (item_request, mut record) in extraction.item_seeds.drain(..) {
            if let Some(quantity) = ctx.spec.quantity {
                if items_seeded >= quantity {
                    tracing::debug!(quantity, "Item quantity reached, skipping further seeds");
                    break;
                }
            }
            items_seeded += 1;
            if let Some(date) = ctx.spec.as_of {
                record.stamp_crawl_date(date);
            }
            let record = shared(record);
            let item_request = ctx
                .with_job_cache(item_request)
                .bind_record(&record)
                .await;
            ctx.merge.register(&item_request).await?;
            in_flight.push(dispatch(ctx.fetcher.clone(), item_request));
        }

        for page_request in extraction.next_pages.drain(..) {
            if let Some(pages) = ctx.spec.pages {
                if pages_fetched >= pages {
                    tracing::debug!(pages, "Page bound reached, skipping pagination");
                    break;
                }
            }
            pages_fetched += 1;
            in_flight.push(dispatch(
                ctx.fetcher.clone(),
                ctx.with_job_cache(page_request),
            ));
        }

        if let Some(record) = ctx.merge.resolve(&request).await {
            emitted.push(record);
        }
    }

    // All fetches completed; anything still open is leaked work.
    ctx.merge.shutdown().await;
    Ok(emitted)
}
