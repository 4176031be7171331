//! Activated jobs and handler outcomes.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// A unit of work handed out by the broker.
///
/// The broker owns the job; the worker only holds it while it is buffered or
/// being handled. Once `deadline` passes the broker may hand the job to
/// another worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivatedJob {
    /// Unique, broker-assigned key
    pub key: i64,
    #[serde(rename = "type")]
    pub job_type: String,
    /// Name of the worker that activated the job
    pub worker: String,
    /// Remaining attempt budget
    pub retries: i32,
    pub deadline: DateTime<Utc>,
    #[serde(default)]
    pub variables: Value,
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,
    #[serde(default)]
    pub process_instance_key: i64,
    #[serde(default)]
    pub bpmn_process_id: String,
    #[serde(default)]
    pub element_id: String,
    #[serde(default)]
    pub tenant_id: String,
}

impl ActivatedJob {
    /// Time left before the broker may reassign the job, zero if already past.
    pub fn time_until_deadline(&self) -> Duration {
        (self.deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    /// Deserialize the job variables into a typed payload.
    pub fn variables_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.variables)
    }
}

/// What a handler decided to do with a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Complete the job, merging `variables` into the process instance
    Complete { variables: Value },
    /// Fail the job with an explicit remaining retry count
    Fail {
        retries: i32,
        message: String,
        retry_backoff: Duration,
    },
    /// Raise a business error that the process model can catch
    ThrowError { code: String, message: String },
}

impl JobOutcome {
    /// Complete without variables
    pub fn complete() -> Self {
        JobOutcome::Complete {
            variables: Value::Null,
        }
    }

    pub fn complete_with(variables: Value) -> Self {
        JobOutcome::Complete { variables }
    }

    /// Fail the job, spending one retry
    pub fn fail(job: &ActivatedJob, message: impl Into<String>) -> Self {
        JobOutcome::Fail {
            retries: job.retries - 1,
            message: message.into(),
            retry_backoff: Duration::ZERO,
        }
    }

    pub fn throw_error(code: impl Into<String>, message: impl Into<String>) -> Self {
        JobOutcome::ThrowError {
            code: code.into(),
            message: message.into(),
        }
    }
}
