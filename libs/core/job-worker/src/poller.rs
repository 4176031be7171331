//! Single activation request with invisible retries.

use crate::channel::{ActivateJobsRequest, ActivationChannel};
use crate::error::ChannelError;
use crate::job::ActivatedJob;
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Decides whether a failed activation request may be re-issued as is
pub type RetryPredicate = Arc<dyn Fn(&ChannelError) -> bool + Send + Sync>;

/// Retry transient transport failures only
pub fn default_retry_predicate() -> RetryPredicate {
    Arc::new(|err: &ChannelError| err.category().is_retryable())
}

/// Upper bound on invisible re-issues within one poll
const MAX_INVISIBLE_RETRIES: u32 = 3;

/// Added to the long-polling timeout to get the client-side deadline
const REQUEST_DEADLINE_OFFSET: Duration = Duration::from_secs(10);

/// Terminal result of one poll
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The request completed; number of jobs handed to `on_job`, possibly zero
    Activated(usize),
    /// The request failed while the worker was still open
    Failed(ChannelError),
    /// The request failed after the worker was closed; nothing to report
    Suppressed,
}

/// Issues activation requests for one job type.
///
/// The poller itself does not enforce single flight; the worker owns it
/// through an exclusive lease.
pub struct JobPoller {
    channel: Arc<dyn ActivationChannel>,
    request: ActivateJobsRequest,
    retry_predicate: RetryPredicate,
}

impl JobPoller {
    pub fn new(
        channel: Arc<dyn ActivationChannel>,
        request: ActivateJobsRequest,
        retry_predicate: RetryPredicate,
    ) -> Self {
        Self {
            channel,
            request,
            retry_predicate,
        }
    }

    pub fn request(&self) -> &ActivateJobsRequest {
        &self.request
    }

    /// Activate up to `max_jobs` jobs, forwarding each to `on_job` in arrival order.
    ///
    /// Jobs received before a retried failure count toward the final total.
    pub async fn poll<F, Fut, P>(&self, max_jobs: usize, mut on_job: F, is_open: P) -> PollOutcome
    where
        F: FnMut(ActivatedJob) -> Fut,
        Fut: Future<Output = ()>,
        P: Fn() -> bool,
    {
        let mut request = self.request.clone();
        request.max_jobs_to_activate = max_jobs;

        let mut activated = 0;
        let mut retries = 0;
        loop {
            let result = self
                .activate_once(request.clone(), &mut on_job, &mut activated)
                .await;

            match result {
                Ok(()) => return PollOutcome::Activated(activated),
                Err(err) if retries < MAX_INVISIBLE_RETRIES && (self.retry_predicate)(&err) => {
                    retries += 1;
                    debug!(
                        job_type = %self.request.job_type,
                        worker = %self.request.worker,
                        attempt = retries,
                        error = %err,
                        "Retrying job activation"
                    );
                }
                Err(err) => {
                    if !is_open() {
                        debug!(
                            job_type = %self.request.job_type,
                            error = %err,
                            "Ignoring activation failure after close"
                        );
                        return PollOutcome::Suppressed;
                    }
                    self.log_failure(&err);
                    return PollOutcome::Failed(err);
                }
            }
        }
    }

    async fn activate_once<F, Fut>(
        &self,
        request: ActivateJobsRequest,
        on_job: &mut F,
        activated: &mut usize,
    ) -> Result<(), ChannelError>
    where
        F: FnMut(ActivatedJob) -> Fut,
        Fut: Future<Output = ()>,
    {
        let deadline = Instant::now() + request.request_timeout + REQUEST_DEADLINE_OFFSET;
        let mut jobs = self.channel.activate(request);

        // Only reads from the channel are bounded; a job already received is
        // always handed over.
        loop {
            let next = tokio::time::timeout_at(deadline, jobs.next())
                .await
                .map_err(|_| ChannelError::deadline_exceeded("activation request deadline elapsed"))?;

            match next {
                Some(job) => {
                    let job = job?;
                    *activated += 1;
                    on_job(job).await;
                }
                None => return Ok(()),
            }
        }
    }

    fn log_failure(&self, err: &ChannelError) {
        if err.is_backpressure() {
            trace!(
                job_type = %self.request.job_type,
                worker = %self.request.worker,
                "Failed to activate jobs due to exhausted resources, will retry"
            );
        } else {
            warn!(
                job_type = %self.request.job_type,
                worker = %self.request.worker,
                error = %err,
                "Failed to activate jobs"
            );
        }
    }
}
