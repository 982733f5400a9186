//! Task runner: bounded-concurrency consumption of the input queue.
//!
//! The control loop tops the in-flight set up to `max_tasks`, dispatches
//! each resolvable message as a concurrent job, and keeps every in-flight
//! message's lease renewed until its job settles. An idle runner long-polls
//! through a bounded grace period before shutting down cleanly; an empty
//! queue with no work left is a legitimate terminal state, not an error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::cache::CachePolicy;
use crate::config::Settings;
use crate::fetch::Fetcher;
use crate::jobs::{JobContext, JobError, JobRegistry};
use crate::merge::MergeEngine;
use crate::messages::{JobSpec, ResolverRegistry};
use crate::output::{object_key, to_json_lines, ObjectStore, OutputError};
use crate::queue::{MessageHandle, QueueBackend, QueueMessage};
use crate::record::ProductRecord;

/// Most messages one receive call may return.
const RECEIVE_BATCH_LIMIT: usize = 10;
/// Delay before retrying after a failed receive.
const RECEIVE_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Floor for the lease renewal interval, guarding degenerate configs where
/// the offset swallows the whole lease.
const MIN_RENEWAL_INTERVAL: Duration = Duration::from_millis(50);

enum PollOutcome {
    /// At capacity, or the queue is empty while work remains in flight.
    /// Completions re-enter the loop.
    Busy,
    /// Queue and in-flight set both drained through the grace period.
    Shutdown,
}

struct InFlightTask {
    renewal: JoinHandle<()>,
}

/// The scheduler. One per process.
pub struct Runner {
    settings: Settings,
    queue: Arc<dyn QueueBackend>,
    store: Arc<dyn ObjectStore>,
    fetcher: Arc<Fetcher>,
    resolvers: ResolverRegistry,
    jobs: JobRegistry,
    in_flight: Mutex<HashMap<String, InFlightTask>>,
    completions: Notify,
}

impl Runner {
    pub fn new(
        settings: Settings,
        queue: Arc<dyn QueueBackend>,
        store: Arc<dyn ObjectStore>,
        fetcher: Arc<Fetcher>,
        resolvers: ResolverRegistry,
        jobs: JobRegistry,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            queue,
            store,
            fetcher,
            resolvers,
            jobs,
            in_flight: Mutex::new(HashMap::new()),
            completions: Notify::new(),
        })
    }

    /// Number of tasks currently executing.
    pub async fn in_flight_len(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Run until the queue drains. Returns when the grace period yields
    /// nothing and no tasks remain in flight.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        tracing::info!(
            max_tasks = self.settings.runner.max_tasks,
            queue = %self.settings.queue.input_queue,
            "Runner starting"
        );
        loop {
            match Arc::clone(&self).poll_input_queue().await {
                PollOutcome::Busy => self.completions.notified().await,
                PollOutcome::Shutdown => break,
            }
        }
        tracing::info!("No messages in queue and no in-progress tasks. Shutting down");
        Ok(())
    }

    /// Top the in-flight set up to `max_tasks`.
    ///
    /// Each round requests only the remaining capacity. Queue errors are
    /// logged and retried on the next iteration; they never kill the
    /// process.
    async fn poll_input_queue(self: Arc<Self>) -> PollOutcome {
        loop {
            let in_flight = self.in_flight_len().await;
            let capacity = self.settings.runner.max_tasks.saturating_sub(in_flight);
            if capacity == 0 {
                return PollOutcome::Busy;
            }

            let batch = capacity.min(RECEIVE_BATCH_LIMIT);
            tracing::debug!(batch, "Requesting messages");
            let messages = match self
                .queue
                .receive(
                    batch,
                    self.settings.runner.visibility_timeout(),
                    Duration::ZERO,
                )
                .await
            {
                Ok(messages) => messages,
                Err(err) => {
                    tracing::warn!("Error while receiving messages, will retry: {}", err);
                    tokio::time::sleep(RECEIVE_RETRY_DELAY).await;
                    continue;
                }
            };

            if messages.is_empty() {
                if self.in_flight_len().await > 0 {
                    return PollOutcome::Busy;
                }
                match self.grace_period_poll().await {
                    Some(messages) => {
                        Arc::clone(&self).process_messages(messages).await;
                        continue;
                    }
                    None => return PollOutcome::Shutdown,
                }
            }

            tracing::debug!(count = messages.len(), "Got messages");
            Arc::clone(&self).process_messages(messages).await;
        }
    }

    /// Bounded idle drain: repeated long polls absorbing
    /// work-ready-but-not-yet-visible races before shutdown.
    async fn grace_period_poll(&self) -> Option<Vec<QueueMessage>> {
        if !self.settings.runner.grace_period_enabled {
            tracing::debug!("Grace period is disabled");
            return None;
        }

        let grace = self.settings.runner.grace_period();
        let wait = self.settings.runner.long_poll_wait();
        let grace_ms = grace.as_millis() as u64;
        let wait_ms = (wait.as_millis() as u64).max(1);
        let mut attempts = (grace_ms + wait_ms - 1) / wait_ms;
        tracing::info!(
            grace_secs = grace.as_secs(),
            wait_secs = wait.as_secs(),
            attempts,
            "Start long-polling for messages"
        );

        while attempts > 0 {
            tracing::debug!(attempts, "Long-polling attempts left");
            attempts -= 1;
            match self
                .queue
                .receive(
                    RECEIVE_BATCH_LIMIT,
                    self.settings.runner.visibility_timeout(),
                    wait,
                )
                .await
            {
                Ok(messages) if !messages.is_empty() => {
                    tracing::info!(
                        count = messages.len(),
                        "Got messages while long-polling. Continue crawling"
                    );
                    return Some(messages);
                }
                Ok(_) => {}
                Err(err) => tracing::warn!("Error while long-polling: {}", err),
            }
        }
        None
    }

    /// Resolve and dispatch a batch. Unresolvable messages are poison:
    /// deleted immediately, never retried.
    async fn process_messages(self: Arc<Self>, messages: Vec<QueueMessage>) {
        for message in messages {
            let spec = match self.resolvers.resolve(&message.body) {
                Ok(spec) => spec,
                Err(err) => {
                    tracing::warn!(
                        body = %message.body,
                        "Cannot handle message format, deleting: {}",
                        err
                    );
                    self.delete_message(&message.handle).await;
                    continue;
                }
            };

            if !self.jobs.supports(&spec.site) {
                tracing::warn!(site = %spec.site, "Unsupported site");
                self.send_result(&spec, None).await;
                self.delete_message(&message.handle).await;
                continue;
            }

            Arc::clone(&self).start_task(message, spec).await;
        }
    }

    /// Insert into the in-flight set, start lease renewal, dispatch the job.
    async fn start_task(self: Arc<Self>, message: QueueMessage, spec: JobSpec) {
        let renewal = self.spawn_renewal(message.handle.clone());
        self.in_flight
            .lock()
            .await
            .insert(message.handle.id.clone(), InFlightTask { renewal });

        tracing::debug!(
            message_id = %message.handle.id,
            site = %spec.site,
            format = %spec.format,
            "Dispatching task"
        );
        let runner = self.clone();
        tokio::spawn(async move {
            let outcome = runner.execute_job(&spec).await;
            runner.finish_task(message, spec, outcome).await;
        });
    }

    /// Periodic lease renewal for one message. Runs until aborted when the
    /// task leaves the in-flight set; never after.
    fn spawn_renewal(&self, handle: MessageHandle) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let lease = self.settings.runner.visibility_timeout();
        let interval = lease
            .saturating_sub(self.settings.runner.visibility_timeout_offset())
            .max(MIN_RENEWAL_INTERVAL);

        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                tracing::debug!(message_id = %handle.id, "Renewing message lease");
                if let Err(err) = queue.extend_visibility(&handle, lease).await {
                    tracing::warn!(
                        message_id = %handle.id,
                        "Error while renewing lease: {}",
                        err
                    );
                }
            }
        })
    }

    async fn execute_job(&self, spec: &JobSpec) -> Result<Vec<ProductRecord>, JobError> {
        let job = self.jobs.build(spec)?;
        let cache_policy = self
            .settings
            .cache
            .applies_to(&spec.site, spec.summary)
            .then(|| CachePolicy::for_date(spec.as_of));
        let ctx = JobContext {
            spec: spec.clone(),
            fetcher: self.fetcher.clone(),
            merge: Arc::new(MergeEngine::new()),
            cache_policy,
        };
        job.run(&ctx).await
    }

    /// Completion handling: leave the in-flight set, stop renewal, upload,
    /// send the result message, delete the input message.
    ///
    /// A job that produced nothing is acknowledged like a failure: the
    /// message is still deleted so a silently-empty job is not redelivered
    /// forever, but the result records a failure.
    async fn finish_task(
        &self,
        message: QueueMessage,
        spec: JobSpec,
        outcome: Result<Vec<ProductRecord>, JobError>,
    ) {
        if let Some(task) = self.in_flight.lock().await.remove(&message.handle.id) {
            // Wait the cancellation out so no renewal call can interleave
            // with the deletion below.
            task.renewal.abort();
            let _ = task.renewal.await;
        } else {
            tracing::warn!(
                message_id = %message.handle.id,
                "Finished task was not in the in-flight set"
            );
        }

        let uploaded = match &outcome {
            Ok(records) if !records.is_empty() => match self.upload(records).await {
                Ok(key) => Some(key),
                Err(err) => {
                    tracing::error!("Error while uploading output object: {}", err);
                    None
                }
            },
            Ok(_) => {
                tracing::warn!(
                    message_id = %message.handle.id,
                    "Job finished without emitting records, recording failure"
                );
                None
            }
            Err(err) => {
                tracing::warn!(message_id = %message.handle.id, "Job failed: {}", err);
                None
            }
        };

        self.send_result(&spec, uploaded.as_deref()).await;
        self.delete_message(&message.handle).await;
        self.completions.notify_one();
    }

    async fn upload(&self, records: &[ProductRecord]) -> Result<String, OutputError> {
        let key = object_key(&self.settings.output.prefix);
        let body = to_json_lines(records)?;
        self.store.put(&key, body).await?;
        tracing::debug!(key = %key, records = records.len(), "Output object stored");
        Ok(key)
    }

    /// Build and send the result message. Send failures are logged but do
    /// not block input-message deletion: at-least-once delivery is
    /// preferred over stuck-forever tasks.
    async fn send_result(&self, spec: &JobSpec, uploaded_key: Option<&str>) {
        let Some(resolver) = self.resolvers.for_format(&spec.format) else {
            tracing::warn!(format = %spec.format, "No resolver to build result message");
            return;
        };
        let body = match uploaded_key {
            Some(key) => resolver.success(spec, &self.settings.output.bucket, key),
            None => resolver.failure(spec),
        };

        let queue_name = self
            .settings
            .queue
            .output_queue
            .clone()
            .or_else(|| spec.result_queue.clone());
        let Some(queue_name) = queue_name else {
            tracing::warn!("There is no output queue name in task message");
            return;
        };

        if let Err(err) = self.queue.send(&queue_name, body.to_string()).await {
            tracing::error!(queue = %queue_name, "Error while sending result message: {}", err);
        }
    }

    async fn delete_message(&self, handle: &MessageHandle) {
        if let Err(err) = self.queue.delete(handle).await {
            tracing::warn!(
                message_id = %handle.id,
                "Error while deleting input message: {}",
                err
            );
        }
    }
}
