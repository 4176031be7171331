//! Long-lived push subscription that re-establishes itself until closed.

use crate::backoff::{BackoffSupplier, whole_millis};
use crate::channel::{JobStream, StreamJobsRequest, StreamingChannel};
use crate::error::ChannelError;
use crate::job::ActivatedJob;
use futures::StreamExt;
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

/// Receives every job pushed through the stream
pub type JobConsumer = Arc<dyn Fn(ActivatedJob) -> BoxFuture<'static, ()> + Send + Sync>;

/// Keeps one job stream open for a job type.
///
/// Every state transition happens under a single lock. Stream completion is
/// handled on a freshly spawned task, never inline in the task driving the
/// transport stream.
///
/// Closing stops the stream between items: a job already received is always
/// handed to the consumer in full.
pub struct JobStreamer {
    shared: Arc<Shared>,
}

struct Shared {
    channel: Arc<dyn StreamingChannel>,
    request: StreamJobsRequest,
    backoff: Arc<dyn BackoffSupplier>,
    initial_retry_delay: Duration,
    runtime: Handle,
    state: Mutex<StreamState>,
}

struct StreamState {
    closed: bool,
    // Stops the established stream before its next item
    control: Option<oneshot::Sender<()>>,
    retry_delay: Duration,
    consumer: Option<JobConsumer>,
    // Incremented per established stream so a stale completion is ignored
    generation: u64,
}

impl JobStreamer {
    pub fn new(
        channel: Arc<dyn StreamingChannel>,
        request: StreamJobsRequest,
        backoff: Arc<dyn BackoffSupplier>,
        initial_retry_delay: Duration,
        runtime: Handle,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                channel,
                request,
                backoff,
                initial_retry_delay,
                runtime,
                state: Mutex::new(StreamState {
                    closed: false,
                    control: None,
                    retry_delay: initial_retry_delay,
                    consumer: None,
                    generation: 0,
                }),
            }),
        }
    }

    /// Open the stream, forwarding jobs to `consumer`.
    ///
    /// No-op once closed or while a stream is already established.
    pub fn open(&self, consumer: JobConsumer) {
        let mut state = self.shared.lock();
        if state.closed || state.control.is_some() {
            return;
        }
        state.consumer = Some(consumer);
        Shared::establish(&self.shared, &mut state);
    }

    /// Close the stream for good. Idempotent.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.consumer = None;
        if let Some(control) = state.control.take() {
            // The stream may have ended on its own already
            let _ = control.send(());
        }
        info!(
            job_type = %self.shared.request.job_type,
            worker = %self.shared.request.worker,
            "Closed job stream"
        );
    }

    /// True while not closed and a stream is currently established
    pub fn is_open(&self) -> bool {
        let state = self.shared.lock();
        !state.closed && state.control.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Delay before the next reconnect attempt after a failure
    pub fn retry_delay(&self) -> Duration {
        self.shared.lock().retry_delay
    }

    /// Forget accumulated backoff once jobs flow again
    pub fn reset_retry_delay(&self) {
        self.shared.lock().retry_delay = self.shared.initial_retry_delay;
    }
}

/// Forward jobs until the stream ends or `stop` fires
async fn drive(
    mut jobs: JobStream,
    consumer: JobConsumer,
    mut stop: oneshot::Receiver<()>,
) -> Result<(), ChannelError> {
    loop {
        let next = tokio::select! {
            biased;
            _ = &mut stop => return Ok(()),
            next = jobs.next() => next,
        };
        match next {
            Some(job) => consumer(job?).await,
            None => return Ok(()),
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn establish(this: &Arc<Self>, state: &mut StreamState) {
        let Some(consumer) = state.consumer.clone() else {
            return;
        };
        state.generation += 1;
        let generation = state.generation;

        let jobs = this.channel.open_stream(this.request.clone());
        let (control, stop) = oneshot::channel();
        let shared = Arc::clone(this);
        this.runtime.spawn(async move {
            let result = drive(jobs, consumer, stop).await;
            let runtime = shared.runtime.clone();
            runtime.spawn(shared.handle_complete(generation, result));
        });
        state.control = Some(control);

        debug!(
            job_type = %this.request.job_type,
            worker = %this.request.worker,
            generation,
            "Opened job stream"
        );
    }

    async fn handle_complete(self: Arc<Self>, generation: u64, result: Result<(), ChannelError>) {
        let retry_in = {
            let mut state = self.lock();
            if state.closed || state.generation != generation {
                return;
            }
            state.control = None;

            match result {
                Ok(()) => {
                    debug!(
                        job_type = %self.request.job_type,
                        "Job stream completed, reopening"
                    );
                    None
                }
                Err(err) => {
                    state.retry_delay = self.backoff.supply_retry_delay(state.retry_delay);
                    self.log_failure(&err, state.retry_delay);
                    Some(state.retry_delay)
                }
            }
        };

        if let Some(delay) = retry_in {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.closed || state.control.is_some() {
            return;
        }
        Shared::establish(&self, &mut state);
    }

    fn log_failure(&self, err: &ChannelError, retry_in: Duration) {
        if err.is_backpressure() {
            trace!(
                job_type = %self.request.job_type,
                worker = %self.request.worker,
                retry_in_ms = whole_millis(retry_in),
                "Job stream rejected due to backpressure"
            );
        } else {
            warn!(
                job_type = %self.request.job_type,
                worker = %self.request.worker,
                retry_in_ms = whole_millis(retry_in),
                error = %err,
                "Job stream failed, reopening after backoff"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ExponentialBackoff;
    use crate::config::WorkerConfig;
    use chrono::Utc;
    use futures::{FutureExt, stream};
    use std::collections::{HashMap, VecDeque};

    enum Script {
        /// Yield the items, then end the stream
        End(Vec<Result<ActivatedJob, ChannelError>>),
        /// Yield the items, then stay open
        Hold(Vec<ActivatedJob>),
    }

    struct ScriptedStreams {
        scripts: Mutex<VecDeque<Script>>,
        opened: Mutex<usize>,
    }

    impl ScriptedStreams {
        fn with(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                opened: Mutex::new(0),
            })
        }

        fn opened(&self) -> usize {
            *self.opened.lock().unwrap()
        }
    }

    impl StreamingChannel for ScriptedStreams {
        fn open_stream(&self, _request: StreamJobsRequest) -> JobStream {
            *self.opened.lock().unwrap() += 1;
            match self.scripts.lock().unwrap().pop_front() {
                Some(Script::End(items)) => stream::iter(items).boxed(),
                Some(Script::Hold(jobs)) => stream::iter(jobs.into_iter().map(Ok))
                    .chain(stream::pending())
                    .boxed(),
                None => stream::pending().boxed(),
            }
        }
    }

    fn job(key: i64) -> ActivatedJob {
        ActivatedJob {
            key,
            job_type: "payment".to_string(),
            worker: "worker-1".to_string(),
            retries: 3,
            deadline: Utc::now(),
            variables: serde_json::Value::Null,
            custom_headers: HashMap::new(),
            process_instance_key: 0,
            bpmn_process_id: String::new(),
            element_id: String::new(),
            tenant_id: String::new(),
        }
    }

    const INITIAL_DELAY: Duration = Duration::from_millis(100);

    fn streamer(channel: Arc<ScriptedStreams>) -> JobStreamer {
        let config = WorkerConfig::new("payment");
        JobStreamer::new(
            channel,
            StreamJobsRequest::from_config(&config),
            Arc::new(ExponentialBackoff::new().with_jitter_factor(0.0)),
            INITIAL_DELAY,
            Handle::current(),
        )
    }

    fn collecting_consumer() -> (JobConsumer, Arc<Mutex<Vec<i64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let consumer: JobConsumer = Arc::new(move |job: ActivatedJob| {
            sink.lock().unwrap().push(job.key);
            async {}.boxed()
        });
        (consumer, seen)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_forwards_jobs() {
        let channel = ScriptedStreams::with(vec![Script::Hold(vec![job(1), job(2)])]);
        let streamer = streamer(channel.clone());
        let (consumer, seen) = collecting_consumer();

        streamer.open(consumer);
        settle().await;

        assert!(streamer.is_open());
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(channel.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_twice_is_noop() {
        let channel = ScriptedStreams::with(vec![]);
        let streamer = streamer(channel.clone());

        streamer.open(collecting_consumer().0);
        streamer.open(collecting_consumer().0);
        settle().await;

        assert_eq!(channel.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent_and_final() {
        let channel = ScriptedStreams::with(vec![]);
        let streamer = streamer(channel.clone());
        streamer.open(collecting_consumer().0);
        settle().await;

        streamer.close();
        streamer.close();
        assert!(streamer.is_closed());
        assert!(!streamer.is_open());

        streamer.open(collecting_consumer().0);
        settle().await;
        assert_eq!(channel.opened(), 1);
        assert!(!streamer.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_stream_reopens_immediately() {
        let channel = ScriptedStreams::with(vec![Script::End(vec![Ok(job(1))])]);
        let streamer = streamer(channel.clone());

        streamer.open(collecting_consumer().0);
        settle().await;

        assert_eq!(channel.opened(), 2);
        assert!(streamer.is_open());
        assert_eq!(streamer.retry_delay(), INITIAL_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_stream_reopens_after_backoff() {
        let channel = ScriptedStreams::with(vec![
            Script::End(vec![Err(ChannelError::unavailable("gone"))]),
            Script::End(vec![Err(ChannelError::resource_exhausted("busy"))]),
        ]);
        let streamer = streamer(channel.clone());

        streamer.open(collecting_consumer().0);
        settle().await;
        assert_eq!(channel.opened(), 1);
        assert!(!streamer.is_open());
        assert_eq!(streamer.retry_delay(), Duration::from_millis(160));

        tokio::time::sleep(Duration::from_millis(160)).await;
        assert_eq!(channel.opened(), 2);
        assert_eq!(streamer.retry_delay(), Duration::from_millis(256));

        tokio::time::sleep(Duration::from_millis(256)).await;
        assert_eq!(channel.opened(), 3);
        assert!(streamer.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_backoff_prevents_reopen() {
        let channel =
            ScriptedStreams::with(vec![Script::End(vec![Err(ChannelError::internal("boom"))])]);
        let streamer = streamer(channel.clone());

        streamer.open(collecting_consumer().0);
        settle().await;
        streamer.close();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(channel.opened(), 1);
        assert!(!streamer.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_retry_delay() {
        let channel =
            ScriptedStreams::with(vec![Script::End(vec![Err(ChannelError::internal("boom"))])]);
        let streamer = streamer(channel);

        streamer.open(collecting_consumer().0);
        settle().await;
        assert_eq!(streamer.retry_delay(), Duration::from_millis(160));

        streamer.reset_retry_delay();
        assert_eq!(streamer.retry_delay(), INITIAL_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_lets_job_in_hand_finish_and_stops_reading() {
        let channel = ScriptedStreams::with(vec![Script::Hold(vec![job(1), job(2)])]);
        let streamer = streamer(channel.clone());
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let consumer: JobConsumer = {
            let gate = gate.clone();
            let seen = seen.clone();
            Arc::new(move |job: ActivatedJob| {
                let gate = gate.clone();
                let seen = seen.clone();
                async move {
                    gate.acquire().await.expect("gate closed").forget();
                    seen.lock().unwrap().push(job.key);
                }
                .boxed()
            })
        };

        streamer.open(consumer);
        settle().await;
        streamer.close();

        gate.add_permits(2);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(*seen.lock().unwrap(), vec![1]);
        assert_eq!(channel.opened(), 1);
    }
}
