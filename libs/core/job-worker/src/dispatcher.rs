//! Handler invocation and outcome delivery.
//!
//! A handler failure, whether an `Err` or a panic, never escapes the
//! dispatch: it is turned into a fail command that spends one retry.

use crate::error::ChannelError;
use crate::job::{ActivatedJob, JobOutcome};
use crate::metrics::WorkerMetrics;
use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// User code that processes one job
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &ActivatedJob) -> eyre::Result<JobOutcome>;
}

/// Adapts an async closure into a [`JobHandler`]
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(ActivatedJob) -> Fut + Send + Sync,
    Fut: Future<Output = eyre::Result<JobOutcome>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(ActivatedJob) -> Fut + Send + Sync,
    Fut: Future<Output = eyre::Result<JobOutcome>> + Send + 'static,
{
    async fn handle(&self, job: &ActivatedJob) -> eyre::Result<JobOutcome> {
        (self.0)(job.clone()).await
    }
}

/// Sends job outcomes back to the broker
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobOutcomeSink: Send + Sync {
    /// Complete a job
    async fn complete(&self, job_key: i64, variables: Value) -> Result<(), ChannelError>;

    /// Fail a job with the remaining retries
    async fn fail(
        &self,
        job_key: i64,
        retries: i32,
        message: String,
        retry_backoff: Duration,
    ) -> Result<(), ChannelError>;

    /// Throw a business error for a job
    async fn throw_error(
        &self,
        job_key: i64,
        code: String,
        message: String,
    ) -> Result<(), ChannelError>;
}

/// Runs `done` when dropped, so it fires on every exit path
struct DoneGuard<D: FnOnce()>(Option<D>);

impl<D: FnOnce()> Drop for DoneGuard<D> {
    fn drop(&mut self) {
        if let Some(done) = self.0.take() {
            done();
        }
    }
}

/// Wraps handler invocations for one worker
#[derive(Clone)]
pub struct HandlerDispatcher {
    handler: Arc<dyn JobHandler>,
    sink: Arc<dyn JobOutcomeSink>,
    metrics: WorkerMetrics,
}

impl HandlerDispatcher {
    pub fn new(
        handler: Arc<dyn JobHandler>,
        sink: Arc<dyn JobOutcomeSink>,
        metrics: WorkerMetrics,
    ) -> Self {
        Self {
            handler,
            sink,
            metrics,
        }
    }

    /// Build the unit of work for one job.
    ///
    /// The handler runs in its own task. `done` runs exactly once after the
    /// outcome was delivered, or when the returned future is dropped.
    pub fn dispatch<D>(
        &self,
        job: ActivatedJob,
        done: D,
    ) -> impl Future<Output = ()> + Send + use<D>
    where
        D: FnOnce() + Send + 'static,
    {
        let handler = Arc::clone(&self.handler);
        let sink = Arc::clone(&self.sink);
        let metrics = self.metrics.clone();
        let done = DoneGuard(Some(done));

        async move {
            let _done = done;
            let job = Arc::new(job);
            let started = Instant::now();

            let handled = tokio::spawn({
                let job = Arc::clone(&job);
                async move { handler.handle(&job).await }
            })
            .await;

            let outcome = match handled {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(report)) => {
                    warn!(
                        job_key = job.key,
                        job_type = %job.job_type,
                        error = %report,
                        "Failed to handle job, sending fail command"
                    );
                    metrics.job_failed("error");
                    fail_outcome(&job, format!("{report:?}"))
                }
                Err(join_err) if join_err.is_panic() => {
                    let message = panic_message(join_err.into_panic());
                    warn!(
                        job_key = job.key,
                        job_type = %job.job_type,
                        panic = %message,
                        "Job handler panicked, sending fail command"
                    );
                    metrics.job_failed("panic");
                    fail_outcome(&job, message)
                }
                Err(_cancelled) => {
                    warn!(job_key = job.key, "Job handler was cancelled");
                    return;
                }
            };

            deliver(sink.as_ref(), &job, outcome).await;
            metrics.job_handled(started.elapsed());
        }
    }
}

fn fail_outcome(job: &ActivatedJob, message: String) -> JobOutcome {
    JobOutcome::Fail {
        retries: job.retries - 1,
        message,
        retry_backoff: Duration::ZERO,
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("job handler panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("job handler panicked: {message}")
    } else {
        "job handler panicked".to_string()
    }
}

async fn deliver(sink: &dyn JobOutcomeSink, job: &ActivatedJob, outcome: JobOutcome) {
    let (command, result) = match outcome {
        JobOutcome::Complete { variables } => ("complete", sink.complete(job.key, variables).await),
        JobOutcome::Fail {
            retries,
            message,
            retry_backoff,
        } => (
            "fail",
            sink.fail(job.key, retries, message, retry_backoff).await,
        ),
        JobOutcome::ThrowError { code, message } => (
            "throw_error",
            sink.throw_error(job.key, code, message).await,
        ),
    };

    match result {
        Ok(()) => {}
        // Timed out and reassigned at the broker while we were handling it
        Err(err) if err.is_stale_job() => {
            debug!(job_key = job.key, command, error = %err, "Job outcome rejected as stale");
        }
        Err(err) => {
            warn!(job_key = job.key, command, error = %err, "Failed to send job outcome");
        }
    }
}
