use std::time::Duration;
use thiserror::Error;

/// Errors raised by the queue machinery itself.
///
/// Failures of an individual job are reported through [`JobFailure`] and
/// never surface as a `JobError` from the worker loop.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Could not decode payload for job type `{job_type}`: {reason}")]
    Deserialization { job_type: String, reason: String },

    #[error("Queue store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid batch: {0}")]
    InvalidBatch(String),
}

impl JobError {
    pub fn store(err: impl std::fmt::Display) -> Self {
        Self::StoreUnavailable(err.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, JobError>;

/// Why a single job attempt did not succeed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobFailure {
    /// The handler failed; the attempt counts against `max_tries`.
    #[error("{0}")]
    Handler(String),

    /// The handler failed in a way retrying cannot fix.
    #[error("{0}")]
    Fatal(String),

    #[error("Job exceeded its time budget of {0:?}")]
    Timeout(Duration),

    #[error("Payload could not be decoded: {0}")]
    Deserialization(String),
}

impl JobFailure {
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }

    /// Short label stored with failed jobs and emitted in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Handler(_) => "HandlerError",
            Self::Fatal(_) => "FatalError",
            Self::Timeout(_) => "Timeout",
            Self::Deserialization(_) => "DeserializationError",
        }
    }

    pub fn summary(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}

impl From<JobError> for JobFailure {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Deserialization { reason, .. } => Self::Deserialization(reason),
            other => Self::Handler(other.to_string()),
        }
    }
}
