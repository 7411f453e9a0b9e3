//! Error types for the contextualization pipeline.
//!
//! [`ApiError`] covers the transport to the external service. [`PipelineError`]
//! is the taxonomy surfaced by the orchestration layers: errors scoped to one
//! chunk or one file are collected into job state rather than propagated, and
//! only command-level failures reach the caller.

use thiserror::Error;

use crate::models::FileId;

/// Failure talking to the external detection / annotation / file service.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Network-level failure (connect, timeout, TLS).
    #[error("transport error: {0}")]
    Transport(String),

    /// The service answered with a non-success status.
    #[error("service returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body did not have the expected shape.
    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl ApiError {
    /// Rate limits, server errors and network failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Transport(_) => true,
            ApiError::Status { status, .. } => *status == 429 || *status >= 500,
            ApiError::Decode(_) | ApiError::NotFound(_) => false,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ApiError::Decode(e.to_string())
        } else {
            ApiError::Transport(e.to_string())
        }
    }
}

/// Errors raised by the job, reconciliation and review layers.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Creating a detection job failed; only that chunk is aborted.
    #[error("failed to submit chunk {chunk}: {source}")]
    Submission {
        chunk: usize,
        #[source]
        source: ApiError,
    },

    /// A poll request failed; retried with backoff until the timeout.
    #[error("poll of job {job_id} failed: {source}")]
    PollTransport {
        job_id: u64,
        #[source]
        source: ApiError,
    },

    /// The poll loop gave up waiting. The job is presumed stuck, not lost.
    #[error("job {job_id} still running after {waited_secs}s; check back later")]
    PollTimeout { job_id: u64, waited_secs: u64 },

    /// The detection service reported the job as failed.
    #[error("job {job_id} failed: {message}")]
    JobFailed { job_id: u64, message: String },

    /// Reconciling one file's results failed; siblings are unaffected.
    #[error("reconciliation of file {file_id} failed: {source}")]
    FileReconciliation {
        file_id: FileId,
        #[source]
        source: ApiError,
    },

    /// A bulk review command finished with at least one failed file.
    #[error("{command} failed for {failed} of {total} file(s): {message}")]
    ReviewCommand {
        command: &'static str,
        failed: usize,
        total: usize,
        message: String,
    },

    /// Creating or tracking an export job for one file failed.
    #[error("export of file {file_id} failed: {source}")]
    Export {
        file_id: FileId,
        #[source]
        source: ApiError,
    },

    /// Destructive command invoked without user confirmation.
    #[error("{0} requires explicit confirmation")]
    NotConfirmed(&'static str),

    #[error("operation cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Recoverable errors leave state intact and can be resumed later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::PollTransport { .. }
                | PipelineError::PollTimeout { .. }
                | PipelineError::Cancelled
        )
    }
}
