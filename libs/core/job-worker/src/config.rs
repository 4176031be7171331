//! Worker configuration
//!
//! This module provides `WorkerConfig` for configuring a job worker.

use crate::backoff::whole_millis;
use core_config::{ConfigError, FromEnv, env_list, env_parse_opt, env_parse_or, env_required};
use std::time::Duration;
use uuid::Uuid;

/// Share of `max_jobs_active` below which a new activation request is warranted
const ACTIVATION_THRESHOLD_RATIO: f64 = 0.3;

pub const DEFAULT_TENANT_ID: &str = "<default>";

/// Configuration for a job worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Job type to activate
    pub job_type: String,

    /// Worker name reported to the broker (auto-generated if not provided)
    pub worker_name: String,

    /// Capacity of the local job buffer (queued + in-flight)
    pub max_jobs_active: usize,

    /// Initial delay between polls; backoff grows it and a productive poll resets it
    pub poll_interval: Duration,

    /// Long-polling timeout sent with each activation request
    pub request_timeout: Duration,

    /// How long the broker keeps an activated job reserved for this worker
    pub job_timeout: Duration,

    /// Variables to fetch with each job (None = all)
    pub fetch_variables: Option<Vec<String>>,

    /// Tenants to activate jobs for
    pub tenant_ids: Vec<String>,

    /// Open a push stream in addition to polling
    pub stream_enabled: bool,

    /// Lifetime of one push stream before it is re-established (None = unbounded)
    pub stream_timeout: Option<Duration>,
}

impl WorkerConfig {
    /// Create a new WorkerConfig for a job type with default values
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            worker_name: format!("worker-{}", Uuid::new_v4()),
            max_jobs_active: 32,
            poll_interval: Duration::from_millis(100),
            request_timeout: Duration::from_secs(10),
            job_timeout: Duration::from_secs(300),
            fetch_variables: None,
            tenant_ids: vec![DEFAULT_TENANT_ID.to_string()],
            stream_enabled: false,
            stream_timeout: None,
        }
    }

    /// Set the worker name
    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    /// Set the buffer capacity
    pub fn with_max_jobs_active(mut self, max_jobs_active: usize) -> Self {
        self.max_jobs_active = max_jobs_active;
        self
    }

    /// Set the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the activation request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the job timeout
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Restrict the variables fetched with each job
    pub fn with_fetch_variables<I, S>(mut self, variables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fetch_variables = Some(variables.into_iter().map(Into::into).collect());
        self
    }

    /// Set the tenants to activate jobs for
    pub fn with_tenant_ids<I, S>(mut self, tenant_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tenant_ids = tenant_ids.into_iter().map(Into::into).collect();
        self
    }

    /// Enable or disable job streaming
    pub fn with_streaming(mut self, enable: bool) -> Self {
        self.stream_enabled = enable;
        self
    }

    /// Set the stream timeout
    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = Some(timeout);
        self
    }

    /// Occupancy at or below which the worker asks for more jobs.
    pub fn activation_threshold(&self) -> usize {
        (self.max_jobs_active as f64 * ACTIVATION_THRESHOLD_RATIO).round() as usize
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.job_type.trim().is_empty() {
            return Err(ConfigError::Invalid("job type must not be empty".into()));
        }
        if self.worker_name.trim().is_empty() {
            return Err(ConfigError::Invalid("worker name must not be empty".into()));
        }
        if self.max_jobs_active == 0 {
            return Err(ConfigError::Invalid(
                "max jobs active must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl FromEnv for WorkerConfig {
    /// Requires JOB_WORKER_TYPE; every other setting falls back to its default.
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = WorkerConfig::new(env_required("JOB_WORKER_TYPE")?);

        let mut config = WorkerConfig {
            worker_name: env_parse_or("JOB_WORKER_NAME", defaults.worker_name.clone())?,
            max_jobs_active: env_parse_or("JOB_WORKER_MAX_JOBS_ACTIVE", defaults.max_jobs_active)?,
            poll_interval: millis_or("JOB_WORKER_POLL_INTERVAL_MS", defaults.poll_interval)?,
            request_timeout: millis_or("JOB_WORKER_REQUEST_TIMEOUT_MS", defaults.request_timeout)?,
            job_timeout: millis_or("JOB_WORKER_TIMEOUT_MS", defaults.job_timeout)?,
            stream_enabled: env_parse_or("JOB_WORKER_STREAM_ENABLED", defaults.stream_enabled)?,
            stream_timeout: env_parse_opt::<u64>("JOB_WORKER_STREAM_TIMEOUT_MS")?
                .map(Duration::from_millis),
            fetch_variables: env_list("JOB_WORKER_FETCH_VARIABLES"),
            ..defaults
        };

        if let Some(tenant_ids) = env_list("JOB_WORKER_TENANT_IDS") {
            config.tenant_ids = tenant_ids;
        }

        config.validate()?;
        Ok(config)
    }
}

fn millis_or(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse_or(key, whole_millis(default)).map(Duration::from_millis)
}
