//! Job and result types

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;
use crate::scope::CancellationScope;

/// Opaque job identifier used to correlate results and log lines
///
/// Callers may assign their own (`JobId::from(42)`, `JobId::from("import-7")`)
/// or let the pool generate a time-ordered one with [`JobId::new`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a new time-ordered identifier
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<u64> for JobId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<Uuid> for JobId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

/// Boxed future returned by a job action
pub type JobFuture<T> = Pin<Box<dyn Future<Output = Result<T, JobError>> + Send>>;

pub(crate) type Action<T> = Box<dyn FnOnce(CancellationScope) -> JobFuture<T> + Send>;

/// A unit of work
///
/// The action receives the job's [`CancellationScope`] and should observe it at
/// its own blocking points. The worker also races the action against the scope
/// and drops it once the scope is done.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use workpool::{Job, JobError};
///
/// let job = Job::new(1u64, |scope| async move {
///     tokio::select! {
///         _ = tokio::time::sleep(Duration::from_millis(50)) => Ok(1u64),
///         _ = scope.cancelled() => Err(JobError::Cancelled),
///     }
/// })
/// .with_timeout(Duration::from_secs(1));
///
/// assert_eq!(job.id().as_str(), "1");
/// ```
pub struct Job<T> {
    id: JobId,
    timeout: Option<Duration>,
    action: Action<T>,
}

impl<T: Send + 'static> Job<T> {
    /// Create a job with a caller-assigned id
    pub fn new<F, Fut>(id: impl Into<JobId>, action: F) -> Self
    where
        F: FnOnce(CancellationScope) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, JobError>> + Send + 'static,
    {
        Self {
            id: id.into(),
            timeout: None,
            action: Box::new(move |scope| Box::pin(action(scope))),
        }
    }

    /// Create a job with a generated id
    pub fn anonymous<F, Fut>(action: F) -> Self
    where
        F: FnOnce(CancellationScope) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, JobError>> + Send + 'static,
    {
        Self::new(JobId::new(), action)
    }
}

impl<T> Job<T> {
    /// Bound the action's run time; the worker derives a child scope with this timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) fn into_parts(self) -> (JobId, Option<Duration>, Action<T>) {
        (self.id, self.timeout, self.action)
    }
}

impl<T> std::fmt::Debug for Job<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Outcome of executing one job
///
/// Holds exactly one of a payload or an error. Built by the worker and never
/// modified afterwards.
#[derive(Debug)]
pub struct JobResult<T> {
    job_id: JobId,
    seq: u64,
    worker: Option<usize>,
    outcome: Result<T, JobError>,
    duration: Duration,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

impl<T> JobResult<T> {
    pub(crate) fn new(
        job_id: JobId,
        seq: u64,
        worker: Option<usize>,
        outcome: Result<T, JobError>,
        duration: Duration,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            seq,
            worker,
            outcome,
            duration,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Submission sequence number, for caller-side collation
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Index of the worker that ran the job; `None` if it never started
    pub fn worker(&self) -> Option<usize> {
        self.worker
    }

    /// Wall-clock execution time
    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn payload(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&JobError> {
        self.outcome.as_ref().err()
    }

    pub fn outcome(&self) -> &Result<T, JobError> {
        &self.outcome
    }

    pub fn into_outcome(self) -> Result<T, JobError> {
        self.outcome
    }
}
