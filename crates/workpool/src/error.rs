//! Error types
//!
//! Two families live here:
//! - [`PoolError`] is returned synchronously by control operations
//!   (`start`, `submit`, `shutdown`).
//! - [`JobError`] is data carried inside a [`JobResult`](crate::JobResult);
//!   it is never raised out of the pool.

use thiserror::Error;

/// Why a [`CancellationScope`](crate::CancellationScope) is done
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ScopeError {
    /// `cancel()` was called on the scope or one of its ancestors
    #[error("operation cancelled")]
    Cancelled,

    /// The scope's deadline (or an ancestor's) elapsed
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Errors returned by pool control operations
#[derive(Debug, Error)]
pub enum PoolError {
    /// The queue no longer accepts submissions
    #[error("queue is closed")]
    QueueClosed,

    /// Non-blocking submit found no free slot
    #[error("queue is full")]
    QueueFull,

    /// The caller's scope was cancelled while waiting
    #[error("operation cancelled")]
    Cancelled,

    /// The caller's scope deadline elapsed while waiting
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The pool has not been started yet
    #[error("worker pool is not started")]
    NotStarted,

    /// `start` was called on a running pool
    #[error("worker pool is already running")]
    AlreadyStarted,

    /// The pool reached its terminal state
    #[error("worker pool is already stopped")]
    AlreadyStopped,

    /// Another `shutdown` call is draining the pool
    #[error("worker pool shutdown is already in progress")]
    ShutdownInProgress,

    /// `start` was called outside of a tokio runtime
    #[error("no tokio runtime available to spawn workers")]
    NoRuntime,

    /// Configuration rejected by `PoolConfig::validate`
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

impl From<ScopeError> for PoolError {
    fn from(err: ScopeError) -> Self {
        match err {
            ScopeError::Cancelled => PoolError::Cancelled,
            ScopeError::DeadlineExceeded => PoolError::DeadlineExceeded,
        }
    }
}

/// Error returned by a non-blocking submit; hands the job back
#[derive(Debug, Error)]
pub enum TrySubmitError<J> {
    /// No free slot right now
    #[error("queue is full")]
    Full(J),

    /// The queue no longer accepts submissions
    #[error("queue is closed")]
    Closed(J),

    /// The pool has not been started yet
    #[error("worker pool is not started")]
    NotStarted(J),
}

impl<J> TrySubmitError<J> {
    /// Recover the job that was not enqueued
    pub fn into_inner(self) -> J {
        match self {
            TrySubmitError::Full(job)
            | TrySubmitError::Closed(job)
            | TrySubmitError::NotStarted(job) => job,
        }
    }
}

impl<J> From<TrySubmitError<J>> for PoolError {
    fn from(err: TrySubmitError<J>) -> Self {
        match err {
            TrySubmitError::Full(_) => PoolError::QueueFull,
            TrySubmitError::Closed(_) => PoolError::QueueClosed,
            TrySubmitError::NotStarted(_) => PoolError::NotStarted,
        }
    }
}

/// Classified failure of a single job
///
/// Job errors are values: workers put them into the job's result and keep
/// running.
#[derive(Debug, Error)]
pub enum JobError {
    /// The action returned an error
    #[error("job failed: {source}")]
    Failed {
        source: anyhow::Error,
        /// Whether resubmitting the job may succeed
        retryable: bool,
    },

    /// The job's scope was cancelled before the action finished
    #[error("job cancelled")]
    Cancelled,

    /// The job's deadline elapsed before the action finished
    #[error("job deadline exceeded")]
    DeadlineExceeded,

    /// The action panicked; the panic was contained by the worker
    #[error("job panicked: {message}")]
    Panicked { message: String },
}

impl JobError {
    /// A failure that may succeed when resubmitted
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        JobError::Failed {
            source: err.into(),
            retryable: true,
        }
    }

    /// A failure that will not succeed when resubmitted
    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        JobError::Failed {
            source: err.into(),
            retryable: false,
        }
    }

    /// Whether a caller-side retry policy should consider resubmitting
    pub fn is_retryable(&self) -> bool {
        match self {
            JobError::Failed { retryable, .. } => *retryable,
            JobError::DeadlineExceeded => true,
            JobError::Cancelled | JobError::Panicked { .. } => false,
        }
    }

    /// Whether the job was stopped by its scope rather than failing on its own
    pub fn is_cancellation(&self) -> bool {
        matches!(self, JobError::Cancelled | JobError::DeadlineExceeded)
    }

    /// Short stable label, used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Failed { .. } => "failed",
            JobError::Cancelled => "cancelled",
            JobError::DeadlineExceeded => "deadline_exceeded",
            JobError::Panicked { .. } => "panicked",
        }
    }
}

impl From<ScopeError> for JobError {
    fn from(err: ScopeError) -> Self {
        match err {
            ScopeError::Cancelled => JobError::Cancelled,
            ScopeError::DeadlineExceeded => JobError::DeadlineExceeded,
        }
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        Self::failed(err)
    }
}
