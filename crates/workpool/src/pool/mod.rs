//! Worker pool orchestration
//!
//! The pool owns the workers, the queue, the result sink and the root
//! cancellation scope, and drives the lifecycle:
//!
//! ```text
//!   Created ──start()──► Running ──shutdown()──► Draining ──► Stopped
//!      │                                                        ▲
//!      └──────────────────────shutdown()────────────────────────┘
//! ```

pub(crate) mod config;

pub use config::PoolConfig;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, instrument, warn};

use crate::error::{JobError, PoolError, TrySubmitError};
use crate::job::{Job, JobId, JobResult};
use crate::observer::{ExitReason, Observer, Observers, PoolEvent, TracingObserver};
use crate::queue::BoundedQueue;
use crate::results::{Outbox, ResultSink, ResultStream};
use crate::scope::CancellationScope;
use crate::worker::{InFlight, Queued, Worker};

/// Pool lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    /// Constructed, workers not spawned yet
    Created,
    /// Workers running and accepting submissions
    Running,
    /// Queue closed, waiting for workers to finish
    Draining,
    /// All workers exited or abandoned; terminal
    Stopped,
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolState::Created => write!(f, "created"),
            PoolState::Running => write!(f, "running"),
            PoolState::Draining => write!(f, "draining"),
            PoolState::Stopped => write!(f, "stopped"),
        }
    }
}

/// What a shutdown did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// A graceful shutdown was requested
    pub graceful: bool,
    /// The caller's scope expired during a graceful drain and the pool forced
    pub escalated: bool,
    /// Queued jobs that never started and were reported as cancelled
    pub cancelled_queued: usize,
    /// Jobs still running when the grace period ran out
    pub abandoned: Vec<JobId>,
    /// Results dropped because the result stream stayed full after shutdown began
    pub dropped_results: usize,
}

impl ShutdownReport {
    /// No job was abandoned and no result was dropped
    pub fn is_clean(&self) -> bool {
        self.abandoned.is_empty() && self.dropped_results == 0
    }
}

type WorkerSet = JoinSet<(usize, ExitReason)>;

/// Fixed-size pool of workers fed by a bounded queue
///
/// # Example
///
/// ```
/// use workpool::{CancellationScope, Job, Pool};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), workpool::PoolError> {
/// let pool = Pool::new(2, 4)?;
/// let mut results = pool.results().expect("results are taken once");
/// pool.start()?;
///
/// for i in 0..4u64 {
///     pool.submit(Job::new(i, move |_| async move { Ok(i * 2) })).await?;
/// }
///
/// let report = pool.shutdown(&CancellationScope::new(), true).await?;
/// assert!(report.is_clean());
///
/// let summary = results.collect_summary(4).await;
/// assert_eq!(summary.succeeded, 4);
/// # Ok(())
/// # }
/// ```
pub struct Pool<T> {
    config: PoolConfig,
    state: RwLock<PoolState>,
    queue: Arc<BoundedQueue<Queued<T>>>,
    scope: CancellationScope,
    /// Bounds how long workers wait on a full result stream; child of `scope`
    delivery: CancellationScope,
    dropped_results: Arc<AtomicUsize>,
    sink: Mutex<Option<ResultSink<T>>>,
    results: Mutex<Option<ResultStream<T>>>,
    workers: Mutex<Option<WorkerSet>>,
    in_flight: InFlight,
    observers: Observers,
    next_seq: AtomicU64,
}

impl<T: Send + 'static> Pool<T> {
    /// Pool with `worker_count` workers and a queue of `queue_capacity`
    pub fn new(worker_count: usize, queue_capacity: usize) -> Result<Self, PoolError> {
        Self::with_config(PoolConfig::new(worker_count, queue_capacity))
    }

    /// Pool whose results are read through [`Pool::results`]
    pub fn with_config(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let (sink, stream) = ResultSink::channel(config.result_capacity);
        Ok(Self::build(config, sink, Some(stream)))
    }

    /// Pool that pushes every result into `handler` on the worker's task
    ///
    /// The handler must not block; a panicking handler loses that result only.
    pub fn with_result_handler<F>(config: PoolConfig, handler: F) -> Result<Self, PoolError>
    where
        F: Fn(JobResult<T>) + Send + Sync + 'static,
    {
        config.validate()?;
        Ok(Self::build(config, ResultSink::Handler(Arc::new(handler)), None))
    }

    fn build(config: PoolConfig, sink: ResultSink<T>, stream: Option<ResultStream<T>>) -> Self {
        let scope = match config.clock() {
            Some(clock) => CancellationScope::with_clock(clock),
            None => CancellationScope::new(),
        };

        let mut observers: Vec<Arc<dyn Observer>> = Vec::new();
        if config.log_events {
            observers.push(Arc::new(TracingObserver));
        }
        observers.extend(config.observers().iter().cloned());

        Self {
            queue: Arc::new(BoundedQueue::new(config.queue_capacity)),
            state: RwLock::new(PoolState::Created),
            delivery: scope.child(),
            dropped_results: Arc::new(AtomicUsize::new(0)),
            scope,
            sink: Mutex::new(Some(sink)),
            results: Mutex::new(stream),
            workers: Mutex::new(None),
            in_flight: Arc::new(DashMap::new()),
            observers: Observers::new(observers),
            next_seq: AtomicU64::new(0),
            config,
        }
    }

    /// Spawn the workers on the current tokio runtime
    #[instrument(skip(self), fields(pool = %self.config.name))]
    pub fn start(&self) -> Result<(), PoolError> {
        let handle = Handle::try_current().map_err(|_| PoolError::NoRuntime)?;

        let mut state = self.state.write();
        match *state {
            PoolState::Created => {}
            PoolState::Running | PoolState::Draining => return Err(PoolError::AlreadyStarted),
            PoolState::Stopped => return Err(PoolError::AlreadyStopped),
        }
        let sink = self.sink.lock().clone().ok_or(PoolError::AlreadyStopped)?;
        if self.results.lock().take().is_some() {
            debug!(pool = %self.config.name, "Result stream not taken; results will be discarded");
        }
        let outbox = Outbox::new(sink, self.delivery.clone(), Arc::clone(&self.dropped_results));

        info!(
            pool = %self.config.name,
            workers = self.config.worker_count,
            queue_capacity = self.queue.capacity(),
            observers = self.observers.len(),
            "Starting worker pool"
        );

        let mut workers = JoinSet::new();
        for id in 0..self.config.worker_count {
            let worker = Worker::new(
                id,
                Arc::clone(&self.queue),
                self.scope.clone(),
                outbox.clone(),
                self.observers.clone(),
                Arc::clone(&self.in_flight),
            );
            workers.spawn_on(
                async move {
                    let id = worker.id();
                    (id, worker.run().await)
                },
                &handle,
            );
        }
        *self.workers.lock() = Some(workers);
        *state = PoolState::Running;
        drop(state);

        self.emit_state(PoolState::Created, PoolState::Running);
        Ok(())
    }

    /// Submit `job`, waiting while the queue is full
    pub async fn submit(&self, job: Job<T>) -> Result<(), PoolError> {
        let scope = self.scope.child();
        self.submit_with(job, &scope).await
    }

    /// Submit `job`, giving up when `scope` is done
    ///
    /// # Errors
    ///
    /// - [`PoolError::NotStarted`] before [`Pool::start`]
    /// - [`PoolError::QueueClosed`] once shutdown has begun
    /// - [`PoolError::Cancelled`] / [`PoolError::DeadlineExceeded`] when
    ///   `scope` finishes while the queue is full
    pub async fn submit_with(&self, job: Job<T>, scope: &CancellationScope) -> Result<(), PoolError> {
        self.check_accepting()?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.queue.submit(Queued { seq, job }, scope).await
    }

    /// Submit `job` only if a queue slot is free right now
    ///
    /// On failure the job is handed back inside the error so it can be
    /// resubmitted; `PoolError::from` turns the error into a plain
    /// [`PoolError`].
    pub fn try_submit(&self, job: Job<T>) -> Result<(), TrySubmitError<Job<T>>> {
        match *self.state.read() {
            PoolState::Created => return Err(TrySubmitError::NotStarted(job)),
            PoolState::Running => {}
            PoolState::Draining | PoolState::Stopped => return Err(TrySubmitError::Closed(job)),
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.queue
            .try_submit(Queued { seq, job })
            .map_err(|err| match err {
                TrySubmitError::Full(queued) => TrySubmitError::Full(queued.job),
                TrySubmitError::Closed(queued) | TrySubmitError::NotStarted(queued) => {
                    TrySubmitError::Closed(queued.job)
                }
            })
    }

    fn check_accepting(&self) -> Result<(), PoolError> {
        match *self.state.read() {
            PoolState::Created => Err(PoolError::NotStarted),
            PoolState::Running => Ok(()),
            PoolState::Draining | PoolState::Stopped => Err(PoolError::QueueClosed),
        }
    }

    /// Take the result stream; `None` if already taken or the pool pushes to a handler
    ///
    /// Take it before [`Pool::start`]: a stream still untaken at start is
    /// dropped and every result is discarded.
    pub fn results(&self) -> Option<ResultStream<T>> {
        self.results.lock().take()
    }

    /// Stop the pool
    ///
    /// Graceful: close the queue and wait for the workers to drain it. If
    /// `scope` finishes first the shutdown escalates to forced.
    ///
    /// Forced: cancel every job, report queued jobs as cancelled, wait up to
    /// `shutdown_grace` for workers and abandon any still running.
    ///
    /// Either way, once shutdown begins a worker waits at most `shutdown_grace`
    /// on a full result stream; later results that do not fit are dropped and
    /// counted in [`ShutdownReport::dropped_results`].
    #[instrument(skip(self, scope), fields(pool = %self.config.name))]
    pub async fn shutdown(
        &self,
        scope: &CancellationScope,
        graceful: bool,
    ) -> Result<ShutdownReport, PoolError> {
        let previous = {
            let mut state = self.state.write();
            let previous = *state;
            *state = match previous {
                PoolState::Draining => return Err(PoolError::ShutdownInProgress),
                PoolState::Stopped => return Err(PoolError::AlreadyStopped),
                PoolState::Created => PoolState::Stopped,
                PoolState::Running => PoolState::Draining,
            };
            previous
        };

        let mut report = ShutdownReport {
            graceful,
            ..Default::default()
        };

        if previous == PoolState::Created {
            self.queue.close();
            self.scope.cancel();
            self.sink.lock().take();
            self.emit_state(PoolState::Created, PoolState::Stopped);
            return Ok(report);
        }
        self.emit_state(PoolState::Running, PoolState::Draining);

        let delivery_expiry = self.expire_delivery();
        let mut workers = self.workers.lock().take().unwrap_or_default();

        if graceful {
            info!(pool = %self.config.name, queued = self.queue.len(), "Initiating graceful shutdown");
            self.queue.close();

            let drained = tokio::select! {
                biased;
                _ = join_workers(&mut workers) => true,
                _ = scope.cancelled() => false,
            };
            if !drained {
                warn!(
                    pool = %self.config.name,
                    cause = ?scope.err(),
                    "Graceful shutdown interrupted, forcing"
                );
                report.escalated = true;
                self.force(&mut workers, &mut report).await;
            }
        } else {
            info!(pool = %self.config.name, "Initiating forced shutdown");
            self.force(&mut workers, &mut report).await;
        }

        delivery_expiry.abort();
        report.dropped_results = self.dropped_results.load(Ordering::Relaxed);

        // Dropping the pool's sink ends the result stream once workers are gone.
        self.sink.lock().take();
        *self.state.write() = PoolState::Stopped;
        self.emit_state(PoolState::Draining, PoolState::Stopped);

        info!(
            pool = %self.config.name,
            escalated = report.escalated,
            cancelled_queued = report.cancelled_queued,
            abandoned = report.abandoned.len(),
            dropped_results = report.dropped_results,
            "Worker pool stopped"
        );
        Ok(report)
    }

    async fn force(&self, workers: &mut WorkerSet, report: &mut ShutdownReport) {
        // Close before cancelling so blocked submitters see QueueClosed.
        self.queue.close();
        self.scope.cancel();

        let outbox = self
            .sink
            .lock()
            .clone()
            .map(|sink| Outbox::new(sink, self.delivery.clone(), Arc::clone(&self.dropped_results)));
        for Queued { seq, job } in self.queue.drain() {
            report.cancelled_queued += 1;
            let (job_id, _, _) = job.into_parts();
            if let Some(outbox) = &outbox {
                let result = JobResult::new(
                    job_id,
                    seq,
                    None,
                    Err(JobError::Cancelled),
                    Duration::ZERO,
                    Utc::now(),
                );
                outbox.send(result).await;
            }
        }

        let clock = self.scope.clock();
        let finished = match clock.now().checked_add(self.config.shutdown_grace) {
            Some(deadline) => tokio::select! {
                biased;
                _ = join_workers(workers) => true,
                _ = clock.sleep_until(deadline) => false,
            },
            None => {
                join_workers(workers).await;
                true
            }
        };

        if !finished {
            let mut abandoned: Vec<(usize, JobId)> = self
                .in_flight
                .iter()
                .map(|entry| (*entry.key(), entry.value().clone()))
                .collect();
            abandoned.sort_by_key(|(worker, _)| *worker);

            warn!(
                pool = %self.config.name,
                grace_ms = self.config.shutdown_grace.as_millis() as u64,
                abandoned = abandoned.len(),
                "Workers still running after grace period, abandoning"
            );
            report.abandoned = abandoned.into_iter().map(|(_, job_id)| job_id).collect();
            workers.abort_all();
        }
    }

    /// Cancel the delivery scope once `shutdown_grace` has elapsed
    fn expire_delivery(&self) -> JoinHandle<()> {
        let delivery = self.delivery.clone();
        let clock = self.scope.clock();
        let grace = self.config.shutdown_grace;
        tokio::spawn(async move {
            if let Some(deadline) = clock.now().checked_add(grace) {
                clock.sleep_until(deadline).await;
                debug!(grace_ms = grace.as_millis() as u64, "Result delivery grace period over");
                delivery.cancel();
            }
        })
    }

    fn emit_state(&self, from: PoolState, to: PoolState) {
        self.observers.emit(PoolEvent::StateChanged {
            pool: &self.config.name,
            from,
            to,
        });
    }
}

impl<T> Pool<T> {
    pub fn state(&self) -> PoolState {
        *self.state.read()
    }

    /// Jobs waiting in the queue
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn worker_count(&self) -> usize {
        self.config.worker_count
    }

    /// Root scope; cancelling it cancels every running job
    pub fn scope(&self) -> &CancellationScope {
        &self.scope
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

impl<T> Drop for Pool<T> {
    fn drop(&mut self) {
        // Workers hold only clones of the queue and scope; make them exit.
        self.queue.close();
        self.scope.cancel();
    }
}

impl<T> std::fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.config.name)
            .field("state", &self.state())
            .field("workers", &self.config.worker_count)
            .field("queue_len", &self.queue.len())
            .finish_non_exhaustive()
    }
}

/// Wait for every worker task; cancel-safe
async fn join_workers(workers: &mut WorkerSet) {
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok((worker, reason)) => debug!(worker, %reason, "Worker joined"),
            Err(err) if err.is_panic() => warn!(error = %err, "Worker task panicked"),
            Err(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::PoolMetrics;

    fn echo(i: u64) -> Job<u64> {
        Job::new(i, move |_| async move { Ok(i) })
    }

    #[test]
    fn test_start_requires_runtime() {
        let pool: Pool<u64> = Pool::new(1, 1).unwrap();
        assert!(matches!(pool.start(), Err(PoolError::NoRuntime)));
        assert_eq!(pool.state(), PoolState::Created);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(matches!(
            Pool::<u64>::new(0, 1),
            Err(PoolError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_state_machine_errors() {
        let pool: Pool<u64> = Pool::new(2, 2).unwrap();
        assert!(matches!(pool.submit(echo(0)).await, Err(PoolError::NotStarted)));
        assert!(matches!(pool.try_submit(echo(0)), Err(TrySubmitError::NotStarted(_))));

        pool.start().unwrap();
        assert_eq!(pool.state(), PoolState::Running);
        assert!(matches!(pool.start(), Err(PoolError::AlreadyStarted)));

        let scope = CancellationScope::new();
        pool.shutdown(&scope, true).await.unwrap();
        assert_eq!(pool.state(), PoolState::Stopped);
        assert!(matches!(pool.start(), Err(PoolError::AlreadyStopped)));
        assert!(matches!(
            pool.shutdown(&scope, true).await,
            Err(PoolError::AlreadyStopped)
        ));
        assert!(matches!(pool.submit(echo(1)).await, Err(PoolError::QueueClosed)));
    }

    #[tokio::test]
    async fn test_shutdown_before_start_stops_directly() {
        let metrics = Arc::new(PoolMetrics::new());
        let config = PoolConfig::new(2, 2)
            .with_log_events(false)
            .with_observer(metrics.clone());
        let pool: Pool<u64> = Pool::with_config(config).unwrap();
        let mut results = pool.results().unwrap();

        let report = pool.shutdown(&CancellationScope::new(), false).await.unwrap();
        assert!(report.is_clean());
        assert_eq!(pool.state(), PoolState::Stopped);
        assert!(results.recv().await.is_none());
        assert_eq!(metrics.snapshot().state_transitions, 1);
    }

    #[tokio::test]
    async fn test_results_taken_once() {
        let pool: Pool<u64> = Pool::new(1, 1).unwrap();
        assert!(pool.results().is_some());
        assert!(pool.results().is_none());

        let pushed: Pool<u64> =
            Pool::with_result_handler(PoolConfig::new(1, 1), |_result| {}).unwrap();
        assert!(pushed.results().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_submit_reports_full() {
        let pool: Pool<u64> = Pool::new(1, 1).unwrap();
        pool.start().unwrap();

        let gate = CancellationScope::new();
        let blocker = {
            let gate = gate.clone();
            Job::new(0u64, move |_| async move {
                gate.cancelled().await;
                Ok(0)
            })
        };
        pool.try_submit(blocker).unwrap();
        // Let the worker pick up the blocker so the queue slot frees.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(pool.queue_len(), 0);

        pool.try_submit(echo(1)).unwrap();
        let rejected = match pool.try_submit(echo(2)) {
            Err(TrySubmitError::Full(job)) => job,
            other => panic!("expected full queue, got {:?}", other),
        };
        assert_eq!(rejected.id(), &JobId::from(2u64));
        assert!(matches!(
            PoolError::from(TrySubmitError::Full(())),
            PoolError::QueueFull
        ));

        gate.cancel();
        // The job handed back can go in once the queue has room.
        tokio::time::sleep(Duration::from_millis(1)).await;
        pool.try_submit(rejected).unwrap();
        pool.shutdown(&CancellationScope::new(), true).await.unwrap();
        assert!(matches!(pool.try_submit(echo(3)), Err(TrySubmitError::Closed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_shutdown_reports_queued_jobs() {
        let pool: Pool<u64> = Pool::new(1, 4).unwrap();
        let mut results = pool.results().unwrap();
        pool.start().unwrap();

        // Cooperative long job: holds the only worker until cancelled.
        pool.submit(Job::new(0u64, |scope| async move {
            scope.cancelled().await;
            Err(JobError::Cancelled)
        }))
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        for i in 1..4 {
            pool.submit(echo(i)).await.unwrap();
        }

        let report = pool.shutdown(&CancellationScope::new(), false).await.unwrap();
        assert!(!report.graceful);
        assert_eq!(report.cancelled_queued, 3);
        assert!(report.is_clean());

        let mut cancelled = 0;
        while let Some(result) = results.recv().await {
            assert!(matches!(result.error(), Some(JobError::Cancelled)));
            if result.worker().is_none() {
                cancelled += 1;
            }
        }
        assert_eq!(cancelled, 3);
        assert!(pool.scope().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_shutdown_escalates_on_caller_deadline() {
        let pool: Pool<u64> = Pool::new(1, 1).unwrap();
        pool.start().unwrap();

        pool.submit(Job::new(0u64, |scope| async move {
            scope.cancelled().await;
            Err(JobError::Cancelled)
        }))
        .await
        .unwrap();

        let caller = CancellationScope::new().with_timeout(Duration::from_millis(50));
        let report = pool.shutdown(&caller, true).await.unwrap();
        assert!(report.graceful);
        assert!(report.escalated);
        assert!(report.is_clean());
        assert_eq!(pool.state(), PoolState::Stopped);
    }
}
