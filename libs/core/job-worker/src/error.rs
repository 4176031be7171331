//! Error types and error categorization
//!
//! Channel errors are categorized to decide how the engine reacts:
//! - **Transient**: transport hiccup, the poller may re-issue the request invisibly
//! - **Permanent**: surfaced to the engine, which backs off before the next poll
//! - **RateLimited**: broker backpressure, an expected signal logged at trace level

use std::time::Duration;
use thiserror::Error;

/// Category of error for determining retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary failure, safe to re-issue the same request
    Transient,
    /// Not worth retrying right away
    Permanent,
    /// Broker asked us to slow down
    RateLimited,
}

impl ErrorCategory {
    /// Whether a request failing with this category may be re-issued without backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Transient)
    }
}

/// Failure kinds reported by the activation, streaming and outcome channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelErrorKind {
    /// Broker or gateway unreachable
    Unavailable,
    /// Broker backpressure ("try later")
    ResourceExhausted,
    /// The client-side deadline for the request elapsed
    DeadlineExceeded,
    /// The job no longer exists, usually because it timed out and was reassigned
    NotFound,
    /// The broker rejected the command
    Rejected,
    /// Anything else
    Internal,
}

impl ChannelErrorKind {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ChannelErrorKind::Unavailable => ErrorCategory::Transient,
            ChannelErrorKind::ResourceExhausted => ErrorCategory::RateLimited,
            ChannelErrorKind::DeadlineExceeded
            | ChannelErrorKind::NotFound
            | ChannelErrorKind::Rejected
            | ChannelErrorKind::Internal => ErrorCategory::Permanent,
        }
    }
}

/// Error raised by a broker channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct ChannelError {
    kind: ChannelErrorKind,
    message: String,
}

impl ChannelError {
    pub fn new(kind: ChannelErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ChannelErrorKind::Unavailable, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(ChannelErrorKind::ResourceExhausted, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(ChannelErrorKind::DeadlineExceeded, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ChannelErrorKind::NotFound, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ChannelErrorKind::Rejected, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ChannelErrorKind::Internal, message)
    }

    pub fn kind(&self) -> ChannelErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Explicit "try later" from the broker
    pub fn is_backpressure(&self) -> bool {
        self.category() == ErrorCategory::RateLimited
    }

    /// The job was already timed out or completed elsewhere; a normal outcome for late handlers
    pub fn is_stale_job(&self) -> bool {
        matches!(
            self.kind,
            ChannelErrorKind::NotFound | ChannelErrorKind::Rejected
        )
    }
}

/// Bounded job queue errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// No job became available before the timeout elapsed
    #[error("no job available within {0:?}")]
    Empty(Duration),
}

/// Errors raised while opening a job worker
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A required collaborator was not supplied to the builder
    #[error("Missing collaborator: {0}")]
    MissingCollaborator(&'static str),

    /// No Tokio runtime to schedule polls and handlers on
    #[error("No Tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

impl From<core_config::ConfigError> for WorkerError {
    fn from(err: core_config::ConfigError) -> Self {
        WorkerError::Config(err.to_string())
    }
}
