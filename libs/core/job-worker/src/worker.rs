//! Job worker engine
//!
//! Keeps the local buffer topped up from the poller and the streamer, drains
//! it into the handler dispatcher, and re-arms polling as jobs finish.
//!
//! Lifecycle: acquiring -> closing (after [`JobWorker::close`]) -> closed
//! (no poll in flight and the buffer is empty).

use crate::backoff::{BackoffSupplier, ExponentialBackoff, whole_millis};
use crate::channel::{ActivateJobsRequest, ActivationChannel, StreamJobsRequest, StreamingChannel};
use crate::config::WorkerConfig;
use crate::dispatcher::{HandlerDispatcher, JobHandler, JobOutcomeSink};
use crate::error::{ChannelError, WorkerError};
use crate::job::ActivatedJob;
use crate::metrics::{StatsSnapshot, WorkerMetrics};
use crate::poller::{JobPoller, PollOutcome, RetryPredicate, default_retry_predicate};
use crate::queue::JobQueue;
use crate::streamer::{JobConsumer, JobStreamer};
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Handle to a running job worker.
///
/// Dropping the handle closes the worker; jobs already buffered still run to
/// completion.
pub struct JobWorker {
    inner: Arc<Inner>,
}

impl JobWorker {
    pub fn builder(config: WorkerConfig) -> JobWorkerBuilder {
        JobWorkerBuilder::new(config)
    }

    /// Stop acquiring jobs. Idempotent and non-blocking; poll
    /// [`is_closed`](Self::is_closed) to wait for the drain.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// True once closed, with no poll in flight and nothing buffered or running
    pub fn is_closed(&self) -> bool {
        !self.inner.is_open() && self.inner.poller.is_available() && self.inner.queue.size() == 0
    }

    /// Current delay between polls
    pub fn poll_interval(&self) -> Duration {
        self.inner.poll_interval()
    }

    pub fn queue_size(&self) -> usize {
        self.inner.queue.size()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }
}

impl Drop for JobWorker {
    fn drop(&mut self) {
        self.inner.close();
    }
}

/// Builder for [`JobWorker`]
pub struct JobWorkerBuilder {
    config: WorkerConfig,
    activation_channel: Option<Arc<dyn ActivationChannel>>,
    streaming_channel: Option<Arc<dyn StreamingChannel>>,
    outcome_sink: Option<Arc<dyn JobOutcomeSink>>,
    handler: Option<Arc<dyn JobHandler>>,
    backoff: Arc<dyn BackoffSupplier>,
    stream_backoff: Arc<dyn BackoffSupplier>,
    retry_predicate: RetryPredicate,
}

impl JobWorkerBuilder {
    fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            activation_channel: None,
            streaming_channel: None,
            outcome_sink: None,
            handler: None,
            backoff: Arc::new(ExponentialBackoff::default()),
            stream_backoff: Arc::new(ExponentialBackoff::default()),
            retry_predicate: default_retry_predicate(),
        }
    }

    pub fn activation_channel(mut self, channel: Arc<dyn ActivationChannel>) -> Self {
        self.activation_channel = Some(channel);
        self
    }

    /// Required when streaming is enabled in the config
    pub fn streaming_channel(mut self, channel: Arc<dyn StreamingChannel>) -> Self {
        self.streaming_channel = Some(channel);
        self
    }

    pub fn outcome_sink(mut self, sink: Arc<dyn JobOutcomeSink>) -> Self {
        self.outcome_sink = Some(sink);
        self
    }

    pub fn handler(mut self, handler: impl JobHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Backoff applied to the poll interval
    pub fn backoff(mut self, backoff: impl BackoffSupplier + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Backoff applied between stream reconnects
    pub fn stream_backoff(mut self, backoff: impl BackoffSupplier + 'static) -> Self {
        self.stream_backoff = Arc::new(backoff);
        self
    }

    /// Decide which activation failures are re-issued without backoff
    pub fn retry_predicate(
        mut self,
        predicate: impl Fn(&ChannelError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_predicate = Arc::new(predicate);
        self
    }

    /// Start the worker on the current Tokio runtime.
    pub fn open(self) -> Result<JobWorker, WorkerError> {
        self.config.validate()?;
        let runtime = Handle::try_current()?;

        let activation_channel = self
            .activation_channel
            .ok_or(WorkerError::MissingCollaborator("activation channel"))?;
        let outcome_sink = self
            .outcome_sink
            .ok_or(WorkerError::MissingCollaborator("outcome sink"))?;
        let handler = self
            .handler
            .ok_or(WorkerError::MissingCollaborator("job handler"))?;

        let config = self.config;
        let streamer = match (config.stream_enabled, self.streaming_channel) {
            (false, _) => None,
            (true, None) => return Err(WorkerError::MissingCollaborator("streaming channel")),
            (true, Some(channel)) => Some(JobStreamer::new(
                channel,
                StreamJobsRequest::from_config(&config),
                self.stream_backoff,
                config.poll_interval,
                runtime.clone(),
            )),
        };

        let metrics = WorkerMetrics::new(config.job_type.clone(), config.worker_name.clone());
        let poller = JobPoller::new(
            activation_channel,
            ActivateJobsRequest::from_config(&config),
            self.retry_predicate,
        );

        let inner = Arc::new(Inner {
            activation_threshold: config.activation_threshold(),
            queue: JobQueue::new(config.max_jobs_active),
            poller: PollerSlot::new(poller),
            streamer,
            dispatcher: HandlerDispatcher::new(handler, outcome_sink, metrics.clone()),
            backoff: self.backoff,
            poll_interval_ms: AtomicU64::new(whole_millis(config.poll_interval)),
            poll_scheduled: AtomicBool::new(false),
            acquiring: AtomicBool::new(true),
            metrics,
            runtime,
            config,
        });

        info!(
            job_type = %inner.config.job_type,
            worker = %inner.config.worker_name,
            max_jobs_active = inner.config.max_jobs_active,
            streaming = inner.streamer.is_some(),
            "Opened job worker"
        );

        inner.open_stream();
        inner.try_poll();

        Ok(JobWorker { inner })
    }
}

/// The one poller, claimable by a single poll at a time
struct PollerSlot {
    poller: JobPoller,
    claimed: AtomicBool,
}

impl PollerSlot {
    fn new(poller: JobPoller) -> Self {
        Self {
            poller,
            claimed: AtomicBool::new(false),
        }
    }

    fn try_claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self) {
        self.claimed.store(false, Ordering::Release);
    }

    fn is_available(&self) -> bool {
        !self.claimed.load(Ordering::Acquire)
    }
}

/// Exclusive ownership of the poller; dropping it makes the poller available again
struct PollerLease {
    inner: Arc<Inner>,
}

impl PollerLease {
    fn poller(&self) -> &JobPoller {
        &self.inner.poller.poller
    }
}

impl Drop for PollerLease {
    fn drop(&mut self) {
        self.inner.poller.release();
    }
}

struct Inner {
    config: WorkerConfig,
    activation_threshold: usize,
    queue: JobQueue,
    poller: PollerSlot,
    streamer: Option<JobStreamer>,
    dispatcher: HandlerDispatcher,
    backoff: Arc<dyn BackoffSupplier>,
    poll_interval_ms: AtomicU64,
    // Set while a delayed poll is pending; at most one is armed at a time
    poll_scheduled: AtomicBool,
    acquiring: AtomicBool,
    metrics: WorkerMetrics,
    runtime: Handle,
}

impl Inner {
    fn is_open(&self) -> bool {
        self.acquiring.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.acquiring.swap(false, Ordering::AcqRel) {
            info!(
                job_type = %self.config.job_type,
                worker = %self.config.worker_name,
                buffered = self.queue.size(),
                "Closing job worker"
            );
        }
        if let Some(streamer) = &self.streamer {
            streamer.close();
        }
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.load(Ordering::Acquire))
    }

    fn should_poll(&self) -> bool {
        self.is_open() && self.queue.size() <= self.activation_threshold
    }

    fn stream_is_open(&self) -> bool {
        self.streamer.as_ref().is_some_and(JobStreamer::is_open)
    }

    fn open_stream(self: &Arc<Self>) {
        let Some(streamer) = &self.streamer else {
            return;
        };
        let weak: Weak<Inner> = Arc::downgrade(self);
        let consumer: JobConsumer = Arc::new(move |job| {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_streamed_job(job).await;
                }
            }
            .boxed()
        });
        streamer.open(consumer);
    }

    fn try_poll(self: &Arc<Self>) {
        if !self.poller.try_claim() {
            return;
        }
        let lease = PollerLease {
            inner: Arc::clone(self),
        };
        if !self.should_poll() {
            return;
        }

        let max_jobs = self.queue.remaining_space();
        let inner = Arc::clone(self);
        self.runtime.spawn(async move { inner.poll(lease, max_jobs).await });
    }

    async fn poll(self: Arc<Self>, lease: PollerLease, max_jobs: usize) {
        debug!(
            job_type = %self.config.job_type,
            max_jobs,
            "Polling for jobs"
        );

        let outcome = lease
            .poller()
            .poll(
                max_jobs,
                |job| {
                    let inner = Arc::clone(&self);
                    async move { inner.handle_job(job).await }
                },
                || self.is_open(),
            )
            .await;
        drop(lease);

        match outcome {
            PollOutcome::Activated(count) => self.handle_polling_success(count),
            PollOutcome::Failed(_) => self.handle_polling_failure(),
            PollOutcome::Suppressed => {}
        }
    }

    fn handle_polling_success(self: &Arc<Self>, count: usize) {
        if count == 0 && self.stream_is_open() {
            // The stream is carrying the load, poll less often
            self.backoff_poll_interval();
            self.schedule_poll();
            return;
        }

        self.reset_poll_interval();
        if count == 0 {
            self.schedule_poll();
        } else if self.should_poll() {
            self.try_poll();
        }
    }

    fn handle_polling_failure(self: &Arc<Self>) {
        self.backoff_poll_interval();
        self.schedule_poll();
    }

    fn backoff_poll_interval(&self) {
        let next = self.backoff.supply_retry_delay(self.poll_interval());
        self.poll_interval_ms
            .store(whole_millis(next), Ordering::Release);
        debug!(
            job_type = %self.config.job_type,
            poll_interval_ms = whole_millis(next),
            "Backing off polling"
        );
    }

    fn reset_poll_interval(&self) {
        self.poll_interval_ms
            .store(whole_millis(self.config.poll_interval), Ordering::Release);
    }

    fn schedule_poll(self: &Arc<Self>) {
        if !self.is_open() {
            return;
        }
        if self
            .poll_scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let delay = self.poll_interval();
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            inner.poll_scheduled.store(false, Ordering::Release);
            inner.try_poll();
        });
    }

    fn is_poll_scheduled(&self) -> bool {
        self.poll_scheduled.load(Ordering::Acquire)
    }

    async fn handle_streamed_job(self: &Arc<Self>, job: ActivatedJob) {
        if let Some(streamer) = &self.streamer {
            streamer.reset_retry_delay();
        }
        self.handle_job(job).await;
    }

    async fn handle_job(self: &Arc<Self>, job: ActivatedJob) {
        let timeout = self.config.job_timeout.min(job.time_until_deadline());
        let job_key = job.key;

        if !self.queue.offer(job, timeout).await {
            warn!(
                job_key,
                job_type = %self.config.job_type,
                timeout_ms = whole_millis(timeout),
                "Dropping job, buffer stayed full until the job timed out"
            );
            self.metrics.job_dropped();
            return;
        }

        self.metrics.job_activated();
        self.metrics.set_queue_occupancy(self.queue.size());
        self.dispatch_ready_jobs();
    }

    fn dispatch_ready_jobs(self: &Arc<Self>) {
        while let Some(mut claim) = self.queue.try_claim() {
            let job = claim.peek().clone();
            let inner = Arc::clone(self);
            let work = self.dispatcher.dispatch(job, move || {
                claim.consume();
                inner.handle_job_finished();
            });
            self.runtime.spawn(work);
        }
    }

    fn handle_job_finished(self: &Arc<Self>) {
        self.metrics.set_queue_occupancy(self.queue.size());
        // A pending delayed poll already covers this completion
        if self.should_poll() && !self.is_poll_scheduled() {
            self.try_poll();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::JobStream;
    use crate::dispatcher::{MockJobOutcomeSink, handler_fn};
    use crate::job::JobOutcome;
    use futures::{StreamExt, stream};
    use std::sync::atomic::AtomicUsize;

    struct EmptyChannel;

    #[derive(Default)]
    struct CountingChannel {
        calls: AtomicUsize,
    }

    impl ActivationChannel for CountingChannel {
        fn activate(&self, _request: ActivateJobsRequest) -> JobStream {
            self.calls.fetch_add(1, Ordering::SeqCst);
            stream::empty().boxed()
        }
    }

    impl ActivationChannel for EmptyChannel {
        fn activate(&self, _request: ActivateJobsRequest) -> JobStream {
            stream::empty().boxed()
        }
    }

    fn builder(config: WorkerConfig) -> JobWorkerBuilder {
        JobWorker::builder(config)
            .activation_channel(Arc::new(EmptyChannel))
            .outcome_sink(Arc::new(MockJobOutcomeSink::new()))
            .handler(handler_fn(|_job| async { Ok(JobOutcome::complete()) }))
    }

    #[test]
    fn test_open_requires_runtime() {
        let err = builder(WorkerConfig::new("payment")).open().err().unwrap();
        assert!(matches!(err, WorkerError::NoRuntime(_)));
    }

    #[tokio::test]
    async fn test_open_requires_activation_channel() {
        let err = JobWorker::builder(WorkerConfig::new("payment"))
            .outcome_sink(Arc::new(MockJobOutcomeSink::new()))
            .handler(handler_fn(|_job| async { Ok(JobOutcome::complete()) }))
            .open()
            .err()
            .unwrap();
        assert!(matches!(err, WorkerError::MissingCollaborator("activation channel")));
    }

    #[tokio::test]
    async fn test_streaming_requires_streaming_channel() {
        let err = builder(WorkerConfig::new("payment").with_streaming(true))
            .open()
            .err()
            .unwrap();
        assert!(matches!(err, WorkerError::MissingCollaborator("streaming channel")));
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let err = builder(WorkerConfig::new("payment").with_max_jobs_active(0))
            .open()
            .err()
            .unwrap();
        assert!(matches!(err, WorkerError::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent() {
        let worker = builder(WorkerConfig::new("payment")).open().unwrap();
        assert!(worker.is_open());

        worker.close();
        worker.close();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(!worker.is_open());
        assert!(worker.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_polls_keep_initial_interval_without_stream() {
        let worker = builder(
            WorkerConfig::new("payment").with_poll_interval(Duration::from_millis(100)),
        )
        .open()
        .unwrap();

        tokio::time::sleep(Duration::from_millis(350)).await;

        assert_eq!(worker.poll_interval(), Duration::from_millis(100));
        assert_eq!(worker.stats(), StatsSnapshot::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_delayed_poll_is_armed() {
        let channel = Arc::new(CountingChannel::default());
        let worker = builder(
            WorkerConfig::new("payment").with_poll_interval(Duration::from_millis(100)),
        )
        .activation_channel(channel.clone())
        .open()
        .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(worker.inner.is_poll_scheduled());

        worker.inner.schedule_poll();
        worker.inner.schedule_poll();
        let before = channel.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1_000)).await;

        let polls = channel.calls.load(Ordering::SeqCst) - before;
        assert!((9..=11).contains(&polls), "{polls} polls in 1s");
    }
}
