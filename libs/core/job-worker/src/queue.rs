//! Bounded job buffer with a claim/consume protocol.
//!
//! Occupancy counts jobs waiting in the buffer plus jobs claimed for handling
//! whose claim has not been consumed yet. Capacity is a semaphore: a permit is
//! acquired on `offer`, travels with the job into its [`Claim`], and is only
//! returned when the claim is consumed (or dropped).

use crate::error::QueueError;
use crate::job::ActivatedJob;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

struct QueuedJob {
    job: ActivatedJob,
    permit: OwnedSemaphorePermit,
}

/// Capacity-bounded buffer between job intake and dispatch
pub struct JobQueue {
    capacity: usize,
    permits: Arc<Semaphore>,
    ready: Mutex<VecDeque<QueuedJob>>,
    job_ready: Notify,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
            ready: Mutex::new(VecDeque::with_capacity(capacity)),
            job_ready: Notify::new(),
        }
    }

    /// Add a job, waiting up to `timeout` for space.
    ///
    /// Returns `false` if no space was released in time; the caller abandons
    /// the job.
    pub async fn offer(&self, job: ActivatedJob, timeout: Duration) -> bool {
        let acquire = self.permits.clone().acquire_owned();
        let permit = match tokio::time::timeout(timeout, acquire).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => return false,
            Err(_elapsed) => return false,
        };

        self.lock().push_back(QueuedJob { job, permit });
        self.job_ready.notify_one();
        true
    }

    /// Claim the oldest queued job without waiting
    pub fn try_claim(&self) -> Option<Claim> {
        self.lock().pop_front().map(|queued| Claim {
            job: Some(queued.job),
            permit: Some(queued.permit),
        })
    }

    /// Claim the oldest queued job, waiting up to `timeout` for one to arrive
    pub async fn claim_next(&self, timeout: Duration) -> Result<Claim, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.job_ready.notified();
            tokio::pin!(notified);
            // Register before checking so an offer in between is not missed
            notified.as_mut().enable();

            if let Some(claim) = self.try_claim() {
                return Ok(claim);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(QueueError::Empty(timeout));
            }
        }
    }

    /// Queued jobs plus unconsumed claims
    pub fn size(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    pub fn remaining_space(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QueuedJob>> {
        self.ready.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("capacity", &self.capacity)
            .field("size", &self.size())
            .finish()
    }
}

/// A job taken out of the queue whose capacity is still held.
///
/// `peek` may be called any number of times before `consume`; `consume`
/// exactly once. Misuse panics.
#[derive(Debug)]
pub struct Claim {
    job: Option<ActivatedJob>,
    permit: Option<OwnedSemaphorePermit>,
}

impl Claim {
    /// Read the claimed job.
    ///
    /// # Panics
    ///
    /// If the claim was already consumed.
    pub fn peek(&self) -> &ActivatedJob {
        self.job
            .as_ref()
            .unwrap_or_else(|| panic!("peek on a consumed job claim"))
    }

    /// Release the job and its queue capacity.
    ///
    /// # Panics
    ///
    /// If the claim was already consumed.
    pub fn consume(&mut self) {
        if self.job.take().is_none() {
            panic!("job claim consumed twice");
        }
        self.permit.take();
    }

    pub fn is_consumed(&self) -> bool {
        self.job.is_none()
    }
}
