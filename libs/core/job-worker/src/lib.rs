//! Job Worker Engine
//!
//! Client-side activation and dispatch of jobs handed out by a workflow broker.
//!
//! ## Features
//!
//! - **Bounded buffer**: occupancy (queued + in-flight) never exceeds `max_jobs_active`
//! - **Single-flight polling**: at most one activation request in flight, re-armed as jobs finish
//! - **Push streaming**: optional long-lived stream, reconnected with backoff until closed
//! - **Failure isolation**: handler errors and panics become fail commands
//! - **Metrics**: counters through the `metrics` facade
//!
//! ## Example
//!
//! ```ignore
//! use job_worker::{handler_fn, JobOutcome, JobWorker, WorkerConfig};
//!
//! let config = WorkerConfig::new("payment").with_max_jobs_active(16);
//!
//! let worker = JobWorker::builder(config)
//!     .activation_channel(gateway.clone())
//!     .outcome_sink(gateway)
//!     .handler(handler_fn(|job| async move {
//!         let payment: Payment = job.variables_as()?;
//!         charge(&payment).await?;
//!         Ok(JobOutcome::complete())
//!     }))
//!     .open()?;
//!
//! // ...
//! worker.close();
//! while !worker.is_closed() {
//!     tokio::time::sleep(Duration::from_millis(50)).await;
//! }
//! ```
//!
//! Transports plug in by implementing [`ActivationChannel`], [`StreamingChannel`]
//! and [`JobOutcomeSink`].

mod backoff;
mod channel;
mod config;
mod dispatcher;
mod error;
mod job;
pub mod metrics;
mod poller;
mod queue;
mod streamer;
mod worker;

// Re-export main types
pub use backoff::{BackoffSupplier, ExponentialBackoff};
pub use channel::{
    ActivateJobsRequest, ActivationChannel, JobStream, StreamJobsRequest, StreamingChannel,
};
pub use config::{DEFAULT_TENANT_ID, WorkerConfig};
pub use dispatcher::{FnHandler, HandlerDispatcher, JobHandler, JobOutcomeSink, handler_fn};
pub use error::{ChannelError, ChannelErrorKind, ErrorCategory, QueueError, WorkerError};
pub use job::{ActivatedJob, JobOutcome};
pub use metrics::{StatsSnapshot, WorkerMetrics};
pub use poller::{JobPoller, PollOutcome, RetryPredicate, default_retry_predicate};
pub use queue::{Claim, JobQueue};
pub use streamer::{JobConsumer, JobStreamer};
pub use worker::{JobWorker, JobWorkerBuilder};
