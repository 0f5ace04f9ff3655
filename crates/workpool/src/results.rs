//! Result delivery and aggregation
//!
//! Workers hand every [`JobResult`] to a sink. The sink is either a bounded
//! channel drained through a [`ResultStream`] (pull) or a caller-supplied
//! handler (push).

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::JobError;
use crate::job::JobResult;
use crate::pool::config::duration_millis;
use crate::scope::CancellationScope;

/// Push-style result callback
pub type ResultHandler<T> = Arc<dyn Fn(JobResult<T>) + Send + Sync>;

/// Where workers deliver results
pub(crate) enum ResultSink<T> {
    Channel(mpsc::Sender<JobResult<T>>),
    Handler(ResultHandler<T>),
}

impl<T> Clone for ResultSink<T> {
    fn clone(&self) -> Self {
        match self {
            ResultSink::Channel(tx) => ResultSink::Channel(tx.clone()),
            ResultSink::Handler(handler) => ResultSink::Handler(Arc::clone(handler)),
        }
    }
}

/// What happened to a result handed to a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Delivered,
    /// Nobody is listening: the stream was dropped or the handler panicked
    Discarded,
    /// The channel stayed full until the delivery scope was done
    Dropped,
}

impl<T: Send + 'static> ResultSink<T> {
    /// Bounded channel sink and the stream that drains it
    pub(crate) fn channel(capacity: usize) -> (Self, ResultStream<T>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (ResultSink::Channel(tx), ResultStream { rx })
    }

    /// Hand `result` to the caller
    ///
    /// A full channel blocks only until `scope` is done.
    pub(crate) async fn deliver(&self, result: JobResult<T>, scope: &CancellationScope) -> Delivery {
        match self {
            ResultSink::Handler(handler) => {
                let job_id = result.job_id().clone();
                match catch_unwind(AssertUnwindSafe(|| handler(result))) {
                    Ok(()) => Delivery::Delivered,
                    Err(_) => {
                        warn!(%job_id, "Result handler panicked; result dropped");
                        Delivery::Discarded
                    }
                }
            }
            ResultSink::Channel(tx) => {
                let result = match tx.try_send(result) {
                    Ok(()) => return Delivery::Delivered,
                    Err(mpsc::error::TrySendError::Closed(_)) => return Delivery::Discarded,
                    Err(mpsc::error::TrySendError::Full(result)) => result,
                };

                let job_id = result.job_id().clone();
                tokio::select! {
                    biased;
                    sent = tx.send(result) => match sent {
                        Ok(()) => Delivery::Delivered,
                        Err(_) => Delivery::Discarded,
                    },
                    _ = scope.cancelled() => {
                        warn!(%job_id, cause = ?scope.err(), "Result sink full; result dropped");
                        Delivery::Dropped
                    }
                }
            }
        }
    }
}

/// A sink together with the scope that bounds waiting on it
///
/// The pool cancels the scope once shutdown has waited out its grace period,
/// so a stream nobody reads cannot hold a worker forever. Results dropped on
/// a full channel are counted.
pub(crate) struct Outbox<T> {
    sink: ResultSink<T>,
    scope: CancellationScope,
    dropped: Arc<AtomicUsize>,
}

impl<T> Clone for Outbox<T> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
            scope: self.scope.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }
}

impl<T: Send + 'static> Outbox<T> {
    pub(crate) fn new(sink: ResultSink<T>, scope: CancellationScope, dropped: Arc<AtomicUsize>) -> Self {
        Self {
            sink,
            scope,
            dropped,
        }
    }

    pub(crate) async fn send(&self, result: JobResult<T>) -> Delivery {
        let delivery = self.sink.deliver(result, &self.scope).await;
        if delivery == Delivery::Dropped {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        delivery
    }
}

/// Pull-style stream of results
///
/// Ends (`recv` returns `None`) once the pool has stopped and every worker has
/// exited.
///
/// # Example
///
/// ```
/// use workpool::{CancellationScope, Job, Pool};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), workpool::PoolError> {
/// let pool = Pool::new(2, 4)?;
/// let mut results = pool.results().expect("results already taken");
/// pool.start()?;
///
/// for i in 0..3u64 {
///     pool.submit(Job::new(i, move |_| async move { Ok(i + 1) })).await?;
/// }
/// pool.shutdown(&CancellationScope::new(), true).await?;
///
/// let mut total = 0;
/// while let Some(result) = results.recv().await {
///     assert!(result.is_ok());
///     total += result.payload().copied().unwrap_or_default();
/// }
/// assert_eq!(total, 6);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ResultStream<T> {
    rx: mpsc::Receiver<JobResult<T>>,
}

impl<T> ResultStream<T> {
    /// Next result, or `None` once the stream has ended
    pub async fn recv(&mut self) -> Option<JobResult<T>> {
        self.rx.recv().await
    }

    /// Next result if one is ready right now
    pub fn try_recv(&mut self) -> Option<JobResult<T>> {
        self.rx.try_recv().ok()
    }

    /// Receive up to `n` results and fold them into a summary
    pub async fn collect_summary(&mut self, n: usize) -> ResultSummary {
        let mut summary = ResultSummary::default();
        for _ in 0..n {
            match self.recv().await {
                Some(result) => summary.record(&result),
                None => break,
            }
        }
        summary
    }

    /// Receive up to `n` results, sorted by submission order
    pub async fn collect_ordered(&mut self, n: usize) -> Vec<JobResult<T>> {
        let mut results = Vec::new();
        while results.len() < n {
            match self.recv().await {
                Some(result) => results.push(result),
                None => break,
            }
        }
        results.sort_by_key(JobResult::seq);
        results
    }
}

impl<T> Stream for ResultStream<T> {
    type Item = JobResult<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Counts and timings over a set of results
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResultSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub deadline_exceeded: usize,
    pub panicked: usize,
    #[serde(with = "duration_millis")]
    pub total_duration: Duration,
    #[serde(with = "duration_millis")]
    pub max_duration: Duration,
}

impl ResultSummary {
    pub fn record<T>(&mut self, result: &JobResult<T>) {
        match result.error() {
            None => self.succeeded += 1,
            Some(JobError::Failed { .. }) => self.failed += 1,
            Some(JobError::Cancelled) => self.cancelled += 1,
            Some(JobError::DeadlineExceeded) => self.deadline_exceeded += 1,
            Some(JobError::Panicked { .. }) => self.panicked += 1,
        }
        self.total_duration += result.duration();
        self.max_duration = self.max_duration.max(result.duration());
    }

    /// Number of results recorded
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.cancelled + self.deadline_exceeded + self.panicked
    }

    pub fn all_succeeded(&self) -> bool {
        self.total() == self.succeeded
    }

    /// Mean execution time; zero when nothing was recorded
    pub fn mean_duration(&self) -> Duration {
        match u32::try_from(self.total()) {
            Ok(0) | Err(_) => Duration::ZERO,
            Ok(n) => self.total_duration / n,
        }
    }
}

impl<'a, T: 'a> FromIterator<&'a JobResult<T>> for ResultSummary {
    fn from_iter<I: IntoIterator<Item = &'a JobResult<T>>>(iter: I) -> Self {
        let mut summary = ResultSummary::default();
        for result in iter {
            summary.record(result);
        }
        summary
    }
}
