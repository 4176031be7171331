//! Broker-facing channel contracts.
//!
//! The engine is transport agnostic: a transport plugs in by turning requests
//! into a [`JobStream`]. Stream end means the request completed, an `Err` item
//! is a terminal failure.

use crate::config::WorkerConfig;
use crate::error::ChannelError;
use crate::job::ActivatedJob;
use futures::stream::BoxStream;
use std::time::Duration;

/// Jobs arriving from the broker, in arrival order.
pub type JobStream = BoxStream<'static, Result<ActivatedJob, ChannelError>>;

/// One-shot "give me up to N jobs" request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateJobsRequest {
    pub job_type: String,
    pub worker: String,
    /// Job timeout the broker applies to each activated job
    pub timeout: Duration,
    pub max_jobs_to_activate: usize,
    pub fetch_variables: Option<Vec<String>>,
    /// Long-polling timeout the broker may hold the request for
    pub request_timeout: Duration,
    pub tenant_ids: Vec<String>,
}

impl ActivateJobsRequest {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            job_type: config.job_type.clone(),
            worker: config.worker_name.clone(),
            timeout: config.job_timeout,
            max_jobs_to_activate: config.max_jobs_active,
            fetch_variables: config.fetch_variables.clone(),
            request_timeout: config.request_timeout,
            tenant_ids: config.tenant_ids.clone(),
        }
    }
}

/// Long-lived push subscription request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamJobsRequest {
    pub job_type: String,
    pub worker: String,
    pub timeout: Duration,
    pub fetch_variables: Option<Vec<String>>,
    pub tenant_ids: Vec<String>,
    pub stream_timeout: Option<Duration>,
}

impl StreamJobsRequest {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            job_type: config.job_type.clone(),
            worker: config.worker_name.clone(),
            timeout: config.job_timeout,
            fetch_variables: config.fetch_variables.clone(),
            tenant_ids: config.tenant_ids.clone(),
            stream_timeout: config.stream_timeout,
        }
    }
}

/// Request/response activation, used by the poller.
pub trait ActivationChannel: Send + Sync {
    fn activate(&self, request: ActivateJobsRequest) -> JobStream;
}

/// Server-push activation, used by the streamer.
///
/// The returned stream stays open until the broker ends it, fails it, or the
/// streamer drops it on close.
pub trait StreamingChannel: Send + Sync {
    fn open_stream(&self, request: StreamJobsRequest) -> JobStream;
}
