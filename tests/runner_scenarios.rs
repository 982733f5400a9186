//! End-to-end runner scenarios over the in-memory queue and object store.
//!
//! Pages come from a local mock server; the queue, cache, and object store
//! are the in-memory backends, so every lifecycle transition is observable.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use shelfcrawl::config::Settings;
use shelfcrawl::fetch::{FetchRequest, FetchResponse, Fetcher};
use shelfcrawl::jobs::{
    CrawlJob, GenericSiteFactory, Job, JobContext, JobError, JobFactory, JobRegistry,
    SingleFetcher,
};
use shelfcrawl::messages::{JobSpec, ResolverRegistry};
use shelfcrawl::output::MemoryObjectStore;
use shelfcrawl::queue::{MemoryQueueBackend, QueueBackend};
use shelfcrawl::record::{Extraction, ProductRecord, SiteExtractor};
use shelfcrawl::runner::Runner;

const RESULT_QUEUE: &str = "results";

fn test_settings(max_tasks: usize) -> Settings {
    let mut settings = Settings::default();
    settings.runner.max_tasks = max_tasks;
    settings.runner.visibility_timeout_secs = 30;
    settings.runner.visibility_timeout_offset_secs = 10;
    settings.runner.grace_period_secs = Some(1);
    settings.runner.long_poll_wait_secs = 1;
    settings.queue.input_queue = "input".to_string();
    settings.output.bucket = "test-bucket".to_string();
    settings
}

struct Harness {
    queue: MemoryQueueBackend,
    store: MemoryObjectStore,
    runner: Arc<Runner>,
}

fn harness(settings: Settings, jobs: JobRegistry) -> Harness {
    let queue = MemoryQueueBackend::new(settings.queue.input_queue.clone());
    let store = MemoryObjectStore::new();
    let runner = Runner::new(
        settings,
        Arc::new(queue.clone()),
        Arc::new(store.clone()),
        Arc::new(Fetcher::new(Duration::from_secs(5))),
        ResolverRegistry::standard(),
        jobs,
    );
    Harness {
        queue,
        store,
        runner,
    }
}

fn generic_registry(site: &str) -> JobRegistry {
    let mut jobs = JobRegistry::new();
    jobs.register(site, Arc::new(GenericSiteFactory::new()));
    jobs
}

fn product_message(url: &str) -> String {
    json!({
        "url": url,
        "site": "acme",
        "result_queue": RESULT_QUEUE,
        "response_format": "sc",
        "task_id": "t-1",
    })
    .to_string()
}

async fn results(queue: &MemoryQueueBackend) -> Vec<Value> {
    queue
        .peek(RESULT_QUEUE)
        .await
        .iter()
        .map(|body| serde_json::from_str(body).unwrap())
        .collect()
}

async fn mount_product(server: &MockServer, route: &str, title: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(format!("<html><head><title>{}</title></head></html>", title)),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_completed_task_uploads_and_acknowledges() {
    let server = MockServer::start().await;
    mount_product(&server, "/p/1", "Widget Deluxe").await;

    let h = harness(test_settings(10), generic_registry("acme"));
    h.queue
        .send("input", product_message(&format!("{}/p/1", server.uri())))
        .await
        .unwrap();

    h.runner.clone().run().await.unwrap();

    // One object, written before the result message was sent.
    let keys = h.store.keys().await;
    assert_eq!(keys.len(), 1);
    let object = String::from_utf8(h.store.get(&keys[0]).await.unwrap()).unwrap();
    let record: Value = serde_json::from_str(object.trim_end()).unwrap();
    assert_eq!(record["title"], "Widget Deluxe");
    assert_eq!(record["site"], "acme");

    let results = results(&h.queue).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["status"], "success");
    assert_eq!(results[0]["msg_id"], "t-1");
    assert_eq!(results[0]["bucket_name"], "test-bucket");
    assert_eq!(results[0]["s3_key_data"], keys[0].as_str());

    // Acknowledged: the input message is gone.
    assert!(h.queue.is_empty("input").await);
}

// Scenario A: the in-flight set never exceeds max_tasks, and freed capacity
// lets the remaining messages through.
#[tokio::test]
async fn test_in_flight_never_exceeds_max_tasks() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/p/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("<html><head><title>Slow</title></head></html>")
                .set_delay(Duration::from_millis(250)),
        )
        .mount(&server)
        .await;

    let h = harness(test_settings(2), generic_registry("acme"));
    for _ in 0..5 {
        h.queue
            .send("input", product_message(&format!("{}/p/slow", server.uri())))
            .await
            .unwrap();
    }

    let watcher = h.runner.clone();
    let watch = tokio::spawn(async move {
        let mut max_seen = 0;
        for _ in 0..200 {
            max_seen = max_seen.max(watcher.in_flight_len().await);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        max_seen
    });

    h.runner.clone().run().await.unwrap();

    let max_seen = watch.await.unwrap();
    assert!(max_seen <= 2, "in-flight set grew to {}", max_seen);
    assert!(max_seen > 0);

    let results = results(&h.queue).await;
    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| r["status"] == "success"));
    assert!(h.queue.is_empty("input").await);
}

// Scenario C: an idle runner long-polls ceil(grace / wait) times, then
// shuts down.
#[tokio::test]
async fn test_grace_period_poll_count_then_shutdown() {
    let mut settings = test_settings(10);
    settings.runner.grace_period_secs = Some(3);
    settings.runner.long_poll_wait_secs = 1;
    let h = harness(settings, generic_registry("acme"));

    h.runner.clone().run().await.unwrap();

    // One empty short poll plus ceil(3/1) = 3 long-poll attempts.
    assert_eq!(h.queue.receive_calls().await, 4);
}

// Scenario C, continued: a message arriving mid-grace-period cancels
// shutdown and gets processed.
#[tokio::test]
async fn test_grace_period_absorbs_late_message() {
    let server = MockServer::start().await;
    mount_product(&server, "/p/1", "Late Widget").await;

    let mut settings = test_settings(10);
    settings.runner.grace_period_secs = Some(3);
    settings.runner.long_poll_wait_secs = 1;
    let h = harness(settings, generic_registry("acme"));

    let producer = h.queue.clone();
    let url = format!("{}/p/1", server.uri());
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        producer.send("input", product_message(&url)).await.unwrap();
    });

    h.runner.clone().run().await.unwrap();

    let results = results(&h.queue).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["status"], "success");
}

#[tokio::test]
async fn test_disabled_grace_period_shuts_down_immediately() {
    let mut settings = test_settings(10);
    settings.runner.grace_period_enabled = false;
    let h = harness(settings, generic_registry("acme"));

    h.runner.clone().run().await.unwrap();
    assert_eq!(h.queue.receive_calls().await, 1);
}

// Poison-message policy: anything unresolvable is deleted without retry
// and produces no result.
#[tokio::test]
async fn test_poison_messages_are_deleted_without_retry() {
    let h = harness(test_settings(10), generic_registry("acme"));
    h.queue.send("input", "{not json".to_string()).await.unwrap();
    h.queue
        .send(
            "input",
            json!({
                "url": "https://acme.test/p/1",
                "site": "acme",
                "result_queue": RESULT_QUEUE,
                "response_format": "unknown-format",
            })
            .to_string(),
        )
        .await
        .unwrap();

    h.runner.clone().run().await.unwrap();

    assert!(h.queue.is_empty("input").await);
    assert!(h.queue.peek(RESULT_QUEUE).await.is_empty());
    assert!(h.store.is_empty().await);
}

// Messages for sites with no registered factory are acknowledged with a
// failure result instead of being retried forever.
#[tokio::test]
async fn test_unsupported_site_fails_and_acknowledges() {
    let h = harness(test_settings(10), JobRegistry::new());
    h.queue
        .send("input", product_message("https://acme.test/p/1"))
        .await
        .unwrap();

    h.runner.clone().run().await.unwrap();

    let results = results(&h.queue).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["status"], "failure");
    assert!(results[0].get("s3_key_data").is_none());
    assert!(h.queue.is_empty("input").await);
}

struct EmptyJob;

#[async_trait]
impl Job for EmptyJob {
    async fn run(&self, _ctx: &JobContext) -> Result<Vec<ProductRecord>, JobError> {
        Ok(Vec::new())
    }
}

struct EmptyJobFactory;

impl JobFactory for EmptyJobFactory {
    fn build(&self, _spec: &JobSpec) -> Result<Box<dyn Job>, JobError> {
        Ok(Box::new(EmptyJob))
    }
}

// A job that emits nothing is still acknowledged, but its result is a
// failure so it stays visible to operators.
#[tokio::test]
async fn test_empty_job_acknowledged_as_failure() {
    let mut jobs = JobRegistry::new();
    jobs.register("acme", Arc::new(EmptyJobFactory));
    let h = harness(test_settings(10), jobs);
    h.queue
        .send("input", product_message("https://acme.test/p/1"))
        .await
        .unwrap();

    h.runner.clone().run().await.unwrap();

    let results = results(&h.queue).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["status"], "failure");
    assert!(h.store.is_empty().await);
    assert!(h.queue.is_empty("input").await);
}

// Lease liveness: a job outliving its lease stays invisible to other
// consumers because renewal keeps firing until completion.
#[tokio::test]
async fn test_lease_renewal_prevents_redelivery() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/p/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("<html><head><title>Slow</title></head></html>")
                .set_delay(Duration::from_millis(1500)),
        )
        .mount(&server)
        .await;

    let mut settings = test_settings(1);
    // Lease shorter than the job; the offset pushes renewal to the floor
    // interval, so renewals fire repeatedly during the fetch.
    settings.runner.visibility_timeout_secs = 1;
    settings.runner.visibility_timeout_offset_secs = 1;
    let h = harness(settings, generic_registry("acme"));
    h.queue
        .send("input", product_message(&format!("{}/p/slow", server.uri())))
        .await
        .unwrap();

    // A competing consumer polls throughout the job. If any renewal gap
    // lets the lease lapse, it grabs the message.
    let competitor = h.queue.clone();
    let hijack = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        for _ in 0..15 {
            let stolen = competitor
                .receive(1, Duration::from_secs(30), Duration::ZERO)
                .await
                .unwrap();
            if !stolen.is_empty() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    });

    h.runner.clone().run().await.unwrap();

    assert!(!hijack.await.unwrap(), "lease lapsed and the message was redelivered");
    let results = results(&h.queue).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["status"], "success");
}

struct DirectStart;

impl SingleFetcher for DirectStart {
    fn start_request(&self, _spec: &JobSpec, url: &str) -> Result<FetchRequest, JobError> {
        Ok(FetchRequest::get(url)?)
    }
}

/// Product pages fan out into reviews and pricing sub-fetches; each
/// completion contributes fields to the same record.
struct FanOutExtractor {
    base: String,
}

impl SiteExtractor for FanOutExtractor {
    fn parse(&self, response: &FetchResponse, _record: Option<&ProductRecord>) -> Extraction {
        let mut extraction = Extraction::default();
        if response.url.ends_with("/p/1") {
            extraction
                .fields
                .insert("title".to_string(), json!("Widget"));
            for endpoint in ["reviews", "pricing"] {
                extraction.sub_fetches.push(
                    FetchRequest::get(&format!("{}/p/1/{}", self.base, endpoint)).unwrap(),
                );
            }
        } else if response.url.ends_with("/reviews") {
            extraction
                .fields
                .insert("review_count".to_string(), json!(12));
        } else if response.url.ends_with("/pricing") {
            extraction
                .fields
                .insert("price".to_string(), json!("9.99"));
        }
        extraction
    }
}

struct FanOutFactory {
    base: String,
}

impl JobFactory for FanOutFactory {
    fn build(&self, _spec: &JobSpec) -> Result<Box<dyn Job>, JobError> {
        Ok(Box::new(
            CrawlJob::new(Arc::new(FanOutExtractor {
                base: self.base.clone(),
            }))
            .with_single(Arc::new(DirectStart)),
        ))
    }
}

// Merge completeness through the whole stack: one record assembled from
// three fetches, uploaded exactly once with all fields present.
#[tokio::test]
async fn test_sub_fetches_merge_into_one_record() {
    let server = MockServer::start().await;
    for route in ["/p/1", "/p/1/reviews", "/p/1/pricing"] {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;
    }

    let mut jobs = JobRegistry::new();
    jobs.register(
        "acme",
        Arc::new(FanOutFactory {
            base: server.uri(),
        }),
    );
    let h = harness(test_settings(10), jobs);
    h.queue
        .send("input", product_message(&format!("{}/p/1", server.uri())))
        .await
        .unwrap();

    h.runner.clone().run().await.unwrap();

    let keys = h.store.keys().await;
    assert_eq!(keys.len(), 1);
    let object = String::from_utf8(h.store.get(&keys[0]).await.unwrap()).unwrap();
    let lines: Vec<&str> = object.trim_end().split('\n').collect();
    assert_eq!(lines.len(), 1, "record must be emitted exactly once");

    let record: Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(record["title"], "Widget");
    assert_eq!(record["review_count"], 12);
    assert_eq!(record["price"], "9.99");
}
