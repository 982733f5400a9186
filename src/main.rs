//! shelfcrawl - e-commerce product crawl orchestration runtime.
//!
//! Pulls crawl tasks from a durable queue, runs them with bounded
//! concurrency, and uploads assembled product records to object storage.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shelfcrawl::cache::{CacheBackend, FingerprintCache, MemoryCacheBackend};
use shelfcrawl::config::{BackendKind, Settings};
use shelfcrawl::fetch::Fetcher;
use shelfcrawl::jobs::{GenericSiteFactory, JobRegistry};
use shelfcrawl::messages::ResolverRegistry;
use shelfcrawl::output::FsObjectStore;
use shelfcrawl::queue::{MemoryQueueBackend, QueueBackend};
use shelfcrawl::runner::Runner;

/// Timeout applied to individual page fetches.
const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "shelf", version, about = "Queue-driven product crawl runner")]
struct Cli {
    /// Path to the TOML settings file.
    #[arg(short, long, env = "SHELFCRAWL_CONFIG")]
    config: Option<PathBuf>,

    /// Override the input queue name.
    #[arg(long)]
    input_queue: Option<String>,

    /// Override the maximum number of concurrent tasks.
    #[arg(long)]
    max_tasks: Option<usize>,

    /// Increase log verbosity.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before anything else)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "shelfcrawl=debug"
    } else {
        "shelfcrawl=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(queue) = cli.input_queue {
        settings.queue.input_queue = queue;
    }
    if let Some(max_tasks) = cli.max_tasks {
        settings.runner.max_tasks = max_tasks;
    }

    let queue = build_queue(&settings).await?;
    let fetcher = Arc::new(build_fetcher(&settings).await?);
    let store = Arc::new(FsObjectStore::new(&settings.output.bucket));

    let resolvers = ResolverRegistry::standard();
    let mut jobs = JobRegistry::new();
    if settings.sites.is_empty() {
        tracing::warn!("No sites configured; every task will be rejected as unsupported");
    }
    for (site, site_settings) in &settings.sites {
        let factory = match &site_settings.search_url {
            Some(template) => GenericSiteFactory::with_search_template(template.clone()),
            None => GenericSiteFactory::new(),
        };
        jobs.register(site.clone(), Arc::new(factory));
    }

    Runner::new(settings, queue, store, fetcher, resolvers, jobs)
        .run()
        .await
}

async fn build_queue(settings: &Settings) -> anyhow::Result<Arc<dyn QueueBackend>> {
    match settings.queue.backend {
        BackendKind::Memory => Ok(Arc::new(MemoryQueueBackend::new(
            settings.queue.input_queue.clone(),
        ))),
        BackendKind::Redis => build_redis_queue(settings).await,
    }
}

#[cfg(feature = "redis-backend")]
async fn build_redis_queue(settings: &Settings) -> anyhow::Result<Arc<dyn QueueBackend>> {
    let url = settings
        .queue
        .redis_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("queue.redis_url must be set for the redis backend"))?;
    let backend =
        shelfcrawl::queue::RedisQueueBackend::new(url, &settings.queue.input_queue).await?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "redis-backend"))]
async fn build_redis_queue(_settings: &Settings) -> anyhow::Result<Arc<dyn QueueBackend>> {
    anyhow::bail!("This build does not include the redis-backend feature")
}

async fn build_fetcher(settings: &Settings) -> anyhow::Result<Fetcher> {
    let fetcher = Fetcher::new(FETCH_TIMEOUT);
    if !settings.cache.enabled {
        return Ok(fetcher);
    }

    let backend: Arc<dyn CacheBackend> = match settings.cache.backend {
        BackendKind::Memory => Arc::new(MemoryCacheBackend::new()),
        BackendKind::Redis => build_redis_cache(settings).await?,
    };
    let cache = FingerprintCache::new(
        backend,
        Duration::from_secs(settings.cache.default_ttl_secs),
    );
    if let Err(err) = cache.connect().await {
        // The cache is an optimization; an unreachable backend just means
        // every lookup misses.
        tracing::warn!("Cache backend connection failed: {}", err);
    }
    Ok(fetcher.with_cache(Arc::new(cache)))
}

#[cfg(feature = "redis-backend")]
async fn build_redis_cache(
    settings: &Settings,
) -> anyhow::Result<Arc<dyn CacheBackend>> {
    let url = settings
        .cache
        .redis_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("cache.redis_url must be set for the redis backend"))?;
    let backend = shelfcrawl::cache::RedisCacheBackend::new(url).await?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "redis-backend"))]
async fn build_redis_cache(
    _settings: &Settings,
) -> anyhow::Result<Arc<dyn CacheBackend>> {
    anyhow::bail!("This build does not include the redis-backend feature")
}
