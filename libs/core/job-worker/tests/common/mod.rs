//! In-memory broker fakes shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use futures::{StreamExt, stream};
use job_worker::{
    ActivateJobsRequest, ActivatedJob, ActivationChannel, ChannelError, JobOutcomeSink, JobStream,
    StreamJobsRequest, StreamingChannel,
};
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn job(key: i64) -> ActivatedJob {
    ActivatedJob {
        key,
        job_type: "payment".to_string(),
        worker: "test-worker".to_string(),
        retries: 3,
        deadline: Utc::now() + chrono::Duration::minutes(5),
        variables: json!({ "orderId": key }),
        custom_headers: HashMap::new(),
        process_instance_key: 1,
        bpmn_process_id: "order-process".to_string(),
        element_id: "charge".to_string(),
        tenant_id: "<default>".to_string(),
    }
}

pub fn jobs(keys: std::ops::RangeInclusive<i64>) -> Vec<ActivatedJob> {
    keys.map(job).collect()
}

/// Wait until `condition` holds, checking every few milliseconds
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting until {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Scripted answer to one activation request
pub enum Activation {
    Jobs(Vec<ActivatedJob>),
    Error(ChannelError),
    /// Never answers
    Hang,
}

/// Decrements the in-flight count when the response stream is dropped
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Activation channel answering from a script; unscripted requests get no jobs
#[derive(Default)]
pub struct FakeActivationChannel {
    script: Mutex<VecDeque<Activation>>,
    requests: Mutex<Vec<ActivateJobsRequest>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: AtomicUsize,
}

impl FakeActivationChannel {
    pub fn new(script: Vec<Activation>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ActivateJobsRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl ActivationChannel for FakeActivationChannel {
    fn activate(&self, request: ActivateJobsRequest) -> JobStream {
        self.requests.lock().unwrap().push(request);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(self.in_flight.clone());

        let response = match self.script.lock().unwrap().pop_front() {
            Some(Activation::Jobs(jobs)) => stream::iter(jobs.into_iter().map(Ok)).boxed(),
            Some(Activation::Error(err)) => stream::iter(vec![Err(err)]).boxed(),
            Some(Activation::Hang) => stream::pending().boxed(),
            None => stream::empty().boxed(),
        };

        response
            .map(move |item| {
                let _held = &guard;
                item
            })
            .boxed()
    }
}

/// Scripted behaviour of one established stream
pub enum Push {
    /// Push the jobs, then stay open
    Jobs(Vec<ActivatedJob>),
    /// Fail the stream immediately
    Error(ChannelError),
}

/// Streaming channel answering from a script; unscripted streams stay open and idle
#[derive(Default)]
pub struct FakeStreamingChannel {
    script: Mutex<VecDeque<Push>>,
    opened: AtomicUsize,
}

impl FakeStreamingChannel {
    pub fn new(script: Vec<Push>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            opened: AtomicUsize::new(0),
        })
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl StreamingChannel for FakeStreamingChannel {
    fn open_stream(&self, _request: StreamJobsRequest) -> JobStream {
        self.opened.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().unwrap().pop_front() {
            Some(Push::Jobs(jobs)) => stream::iter(jobs.into_iter().map(Ok))
                .chain(stream::pending())
                .boxed(),
            Some(Push::Error(err)) => stream::iter(vec![Err(err)]).boxed(),
            None => stream::pending().boxed(),
        }
    }
}

/// An outcome as the broker would have received it
#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Complete {
        key: i64,
        variables: Value,
    },
    Fail {
        key: i64,
        retries: i32,
        message: String,
    },
    ThrowError {
        key: i64,
        code: String,
    },
}

impl Sent {
    pub fn key(&self) -> i64 {
        match self {
            Sent::Complete { key, .. } | Sent::Fail { key, .. } | Sent::ThrowError { key, .. } => {
                *key
            }
        }
    }
}

#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<Sent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn completed_keys(&self) -> Vec<i64> {
        let mut keys: Vec<i64> = self
            .sent()
            .iter()
            .filter(|sent| matches!(sent, Sent::Complete { .. }))
            .map(Sent::key)
            .collect();
        keys.sort_unstable();
        keys
    }
}

#[async_trait]
impl JobOutcomeSink for RecordingSink {
    async fn complete(&self, job_key: i64, variables: Value) -> Result<(), ChannelError> {
        self.sent.lock().unwrap().push(Sent::Complete {
            key: job_key,
            variables,
        });
        Ok(())
    }

    async fn fail(
        &self,
        job_key: i64,
        retries: i32,
        message: String,
        _retry_backoff: Duration,
    ) -> Result<(), ChannelError> {
        self.sent.lock().unwrap().push(Sent::Fail {
            key: job_key,
            retries,
            message,
        });
        Ok(())
    }

    async fn throw_error(
        &self,
        job_key: i64,
        code: String,
        _message: String,
    ) -> Result<(), ChannelError> {
        self.sent.lock().unwrap().push(Sent::ThrowError { key: job_key, code });
        Ok(())
    }
}
