//! Pool event observers
//!
//! Observers are the pool's logging/metrics collaborator. The pool calls them
//! at job start, job end, worker exit and on state transitions. Calls are
//! fire-and-forget: a panicking observer is contained and ignored. Calls run
//! inline on the worker's task, so observers must not block.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::JobError;
use crate::job::JobId;
use crate::pool::PoolState;

/// Why a worker loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// The queue was closed and fully drained
    Drained,
    /// The root scope was cancelled
    Cancelled,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Drained => write!(f, "drained"),
            ExitReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Something that happened inside the pool
#[derive(Debug)]
pub enum PoolEvent<'a> {
    StateChanged {
        pool: &'a str,
        from: PoolState,
        to: PoolState,
    },
    JobStarted {
        job_id: &'a JobId,
        worker: usize,
    },
    JobFinished {
        job_id: &'a JobId,
        worker: usize,
        duration: Duration,
        error: Option<&'a JobError>,
    },
    WorkerExited {
        worker: usize,
        reason: ExitReason,
    },
}

impl PoolEvent<'_> {
    /// Stable event name
    pub fn name(&self) -> &'static str {
        match self {
            PoolEvent::StateChanged { .. } => "pool.state_changed",
            PoolEvent::JobStarted { .. } => "job.started",
            PoolEvent::JobFinished { .. } => "job.finished",
            PoolEvent::WorkerExited { .. } => "worker.exited",
        }
    }

    /// Event fields as key/value pairs, for sinks that take `(event, fields)`
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        match self {
            PoolEvent::StateChanged { pool, from, to } => vec![
                ("pool", pool.to_string()),
                ("from", from.to_string()),
                ("to", to.to_string()),
            ],
            PoolEvent::JobStarted { job_id, worker } => vec![
                ("job_id", job_id.to_string()),
                ("worker", worker.to_string()),
            ],
            PoolEvent::JobFinished {
                job_id,
                worker,
                duration,
                error,
            } => {
                let mut fields = vec![
                    ("job_id", job_id.to_string()),
                    ("worker", worker.to_string()),
                    ("duration_ms", duration.as_millis().to_string()),
                    ("status", if error.is_some() { "error" } else { "ok" }.to_string()),
                ];
                if let Some(error) = error {
                    fields.push(("error_kind", error.kind().to_string()));
                    fields.push(("error", error.to_string()));
                }
                fields
            }
            PoolEvent::WorkerExited { worker, reason } => vec![
                ("worker", worker.to_string()),
                ("reason", reason.to_string()),
            ],
        }
    }
}

/// Receives pool events
///
/// `on_event` runs inline on the task that produced the event: job and worker
/// events on the worker's task, state changes on the caller of `start` or
/// `shutdown`. A worker does not pick up its next job until every observer has
/// returned, so implementations must not block or await anything slow; hand
/// expensive work to a channel or a spawned task instead. Panics are caught
/// and ignored.
pub trait Observer: Send + Sync {
    fn on_event(&self, event: &PoolEvent<'_>);
}

/// Fan-out to every registered observer, containing panics
#[derive(Clone, Default)]
pub(crate) struct Observers {
    observers: Vec<Arc<dyn Observer>>,
}

impl Observers {
    pub(crate) fn new(observers: Vec<Arc<dyn Observer>>) -> Self {
        Self { observers }
    }

    pub(crate) fn emit(&self, event: PoolEvent<'_>) {
        for observer in &self.observers {
            let _ = catch_unwind(AssertUnwindSafe(|| observer.on_event(&event)));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.observers.len()
    }
}

/// Writes pool events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_event(&self, event: &PoolEvent<'_>) {
        match event {
            PoolEvent::StateChanged { pool, from, to } => {
                info!(pool = %pool, %from, %to, "Pool state changed");
            }
            PoolEvent::JobStarted { job_id, worker } => {
                debug!(%job_id, worker, "Job started");
            }
            PoolEvent::JobFinished {
                job_id,
                worker,
                duration,
                error: None,
            } => {
                debug!(%job_id, worker, duration_ms = duration.as_millis() as u64, "Job completed");
            }
            PoolEvent::JobFinished {
                job_id,
                worker,
                duration,
                error: Some(error),
            } => {
                warn!(
                    %job_id,
                    worker,
                    duration_ms = duration.as_millis() as u64,
                    kind = error.kind(),
                    error = %error,
                    "Job failed"
                );
            }
            PoolEvent::WorkerExited { worker, reason } => {
                debug!(worker, %reason, "Worker exited");
            }
        }
    }
}

/// Counters kept by [`PoolMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub jobs_started: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub jobs_panicked: u64,
    pub workers_exited: u64,
    pub state_transitions: u64,
    pub total_job_time_ms: u64,
}

impl MetricsSnapshot {
    /// Jobs started but not yet finished
    pub fn in_flight(&self) -> u64 {
        let finished =
            self.jobs_succeeded + self.jobs_failed + self.jobs_cancelled + self.jobs_panicked;
        self.jobs_started.saturating_sub(finished)
    }
}

/// Lock-free counters fed by pool events
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use workpool::{PoolConfig, PoolMetrics};
///
/// let metrics = Arc::new(PoolMetrics::new());
/// let config = PoolConfig::new(4, 16).with_observer(metrics.clone());
/// assert_eq!(metrics.snapshot().jobs_started, 0);
/// # let _ = config;
/// ```
#[derive(Debug, Default)]
pub struct PoolMetrics {
    jobs_started: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_cancelled: AtomicU64,
    jobs_panicked: AtomicU64,
    workers_exited: AtomicU64,
    state_transitions: AtomicU64,
    total_job_time_ms: AtomicU64,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_started: self.jobs_started.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
            jobs_panicked: self.jobs_panicked.load(Ordering::Relaxed),
            workers_exited: self.workers_exited.load(Ordering::Relaxed),
            state_transitions: self.state_transitions.load(Ordering::Relaxed),
            total_job_time_ms: self.total_job_time_ms.load(Ordering::Relaxed),
        }
    }
}

impl Observer for PoolMetrics {
    fn on_event(&self, event: &PoolEvent<'_>) {
        match event {
            PoolEvent::StateChanged { .. } => {
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
            }
            PoolEvent::JobStarted { .. } => {
                self.jobs_started.fetch_add(1, Ordering::Relaxed);
            }
            PoolEvent::JobFinished {
                duration, error, ..
            } => {
                let counter = match error {
                    None => &self.jobs_succeeded,
                    Some(JobError::Failed { .. }) => &self.jobs_failed,
                    Some(JobError::Cancelled | JobError::DeadlineExceeded) => &self.jobs_cancelled,
                    Some(JobError::Panicked { .. }) => &self.jobs_panicked,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                self.total_job_time_ms
                    .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
            }
            PoolEvent::WorkerExited { .. } => {
                self.workers_exited.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
