//! Worker loop
//!
//! Each worker pulls jobs from the shared queue, runs them one at a time under
//! a per-job child scope and hands the result to the outbox. A worker exits when
//! the queue is closed and drained, or when the pool's root scope is done.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use tracing::{debug, trace};

use crate::error::JobError;
use crate::job::{Action, Job, JobId, JobResult};
use crate::observer::{ExitReason, Observers, PoolEvent};
use crate::queue::BoundedQueue;
use crate::results::Outbox;
use crate::scope::CancellationScope;

/// A job waiting in the queue, tagged with its submission sequence number
pub(crate) struct Queued<T> {
    pub(crate) seq: u64,
    pub(crate) job: Job<T>,
}

/// Job currently executing on each worker, keyed by worker index
pub(crate) type InFlight = Arc<DashMap<usize, JobId>>;

pub(crate) struct Worker<T> {
    id: usize,
    queue: Arc<BoundedQueue<Queued<T>>>,
    scope: CancellationScope,
    outbox: Outbox<T>,
    observers: Observers,
    in_flight: InFlight,
}

impl<T: Send + 'static> Worker<T> {
    pub(crate) fn new(
        id: usize,
        queue: Arc<BoundedQueue<Queued<T>>>,
        scope: CancellationScope,
        outbox: Outbox<T>,
        observers: Observers,
        in_flight: InFlight,
    ) -> Self {
        Self {
            id,
            queue,
            scope,
            outbox,
            observers,
            in_flight,
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Process jobs until the queue is drained or the root scope is done
    pub(crate) async fn run(self) -> ExitReason {
        debug!(worker = self.id, "Worker started");

        let reason = loop {
            match self.queue.dequeue(&self.scope).await {
                Ok(Some(queued)) => self.execute(queued).await,
                Ok(None) => break ExitReason::Drained,
                Err(cause) => {
                    trace!(worker = self.id, %cause, "Worker stopping on scope");
                    break ExitReason::Cancelled;
                }
            }
        };

        self.observers.emit(PoolEvent::WorkerExited {
            worker: self.id,
            reason,
        });
        reason
    }

    async fn execute(&self, queued: Queued<T>) {
        let Queued { seq, job } = queued;
        let (job_id, timeout, action) = job.into_parts();
        let scope = match timeout {
            Some(timeout) => self.scope.with_timeout(timeout),
            None => self.scope.child(),
        };

        self.in_flight.insert(self.id, job_id.clone());
        self.observers.emit(PoolEvent::JobStarted {
            job_id: &job_id,
            worker: self.id,
        });

        let clock = self.scope.clock();
        let started = clock.now();
        let started_at = Utc::now();
        let outcome = run_action(action, scope).await;
        let duration = clock.now().saturating_duration_since(started);

        self.in_flight.remove(&self.id);
        self.observers.emit(PoolEvent::JobFinished {
            job_id: &job_id,
            worker: self.id,
            duration,
            error: outcome.as_ref().err(),
        });

        let result = JobResult::new(job_id, seq, Some(self.id), outcome, duration, started_at);
        self.outbox.send(result).await;
    }
}

/// Run `action` under `scope`, turning panics and scope expiry into job errors
async fn run_action<T>(action: Action<T>, scope: CancellationScope) -> Result<T, JobError> {
    // The action may panic while building its future, before the first poll.
    let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| action(scope.clone()))) {
        Ok(fut) => fut,
        Err(payload) => return Err(panicked(payload)),
    };

    match scope.run(AssertUnwindSafe(fut).catch_unwind()).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(payload)) => Err(panicked(payload)),
        Err(cause) => Err(cause.into()),
    }
}

fn panicked(payload: Box<dyn Any + Send>) -> JobError {
    let message = if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    };
    JobError::Panicked { message }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use std::sync::atomic::AtomicUsize;

    use parking_lot::Mutex;

    use crate::observer::{Observer, PoolMetrics};
    use crate::results::{ResultSink, ResultStream};

    struct Harness {
        queue: Arc<BoundedQueue<Queued<u64>>>,
        scope: CancellationScope,
        metrics: Arc<PoolMetrics>,
        in_flight: InFlight,
        results: ResultStream<u64>,
        worker: Worker<u64>,
    }

    fn harness(capacity: usize) -> Harness {
        let queue = Arc::new(BoundedQueue::new(capacity));
        let scope = CancellationScope::new();
        let metrics = Arc::new(PoolMetrics::new());
        let in_flight: InFlight = Arc::new(DashMap::new());
        let (sink, results) = ResultSink::channel(16);
        let outbox = Outbox::new(sink, scope.child(), Arc::new(AtomicUsize::new(0)));
        let observers = Observers::new(vec![metrics.clone() as Arc<dyn Observer>]);
        let worker = Worker::new(
            3,
            queue.clone(),
            scope.clone(),
            outbox,
            observers,
            in_flight.clone(),
        );
        Harness {
            queue,
            scope,
            metrics,
            in_flight,
            results,
            worker,
        }
    }

    fn queued(seq: u64, job: Job<u64>) -> Queued<u64> {
        Queued { seq, job }
    }

    #[tokio::test]
    async fn test_worker_drains_queue_then_exits() {
        let mut h = harness(4);
        for i in 0..3u64 {
            h.queue
                .try_submit(queued(i, Job::new(i, move |_| async move { Ok(i * 10) })))
                .unwrap_or_else(|_| panic!("queue full"));
        }
        h.queue.close();

        assert_eq!(h.worker.run().await, ExitReason::Drained);

        let results = h.results.collect_ordered(3).await;
        let payloads: Vec<u64> = results.iter().filter_map(|r| r.payload().copied()).collect();
        assert_eq!(payloads, vec![0, 10, 20]);
        assert!(results.iter().all(|r| r.worker() == Some(3)));
        assert_eq!(h.metrics.snapshot().workers_exited, 1);
        assert!(h.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_panics_become_results() {
        let mut h = harness(4);
        let jobs = vec![
            Job::new(1u64, |_| async move {
                if true {
                    panic!("poll panic");
                }
                Ok(1)
            }),
            Job::new(2u64, |_| -> futures::future::Ready<Result<u64, JobError>> {
                panic!("build panic")
            }),
            Job::new(3u64, |_| async move { Ok(3) }),
        ];
        for (seq, job) in jobs.into_iter().enumerate() {
            h.queue
                .try_submit(queued(seq as u64, job))
                .unwrap_or_else(|_| panic!("queue full"));
        }
        h.queue.close();
        h.worker.run().await;

        let results = h.results.collect_ordered(3).await;
        match results[0].error() {
            Some(JobError::Panicked { message }) => assert_eq!(message, "poll panic"),
            other => panic!("expected panic, got {:?}", other),
        }
        match results[1].error() {
            Some(JobError::Panicked { message }) => assert_eq!(message, "build panic"),
            other => panic!("expected panic, got {:?}", other),
        }
        assert_eq!(results[2].payload(), Some(&3));
        assert_eq!(h.metrics.snapshot().jobs_panicked, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_timeout_drops_action() {
        let mut h = harness(4);
        let job = Job::new(9u64, |_| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(9)
        })
        .with_timeout(Duration::from_millis(100));
        h.queue
            .try_submit(queued(0, job))
            .unwrap_or_else(|_| panic!("queue full"));
        h.queue.close();

        h.worker.run().await;
        let result = h.results.recv().await.unwrap();
        assert!(matches!(result.error(), Some(JobError::DeadlineExceeded)));
        assert!(result.duration() >= Duration::from_millis(100));
        assert!(result.duration() < Duration::from_secs(60));
        // The per-job deadline does not touch the root scope.
        assert!(!h.scope.is_cancelled());
    }

    #[tokio::test]
    async fn test_root_cancel_stops_idle_worker() {
        let h = harness(4);
        let scope = h.scope.clone();
        let handle = tokio::spawn(h.worker.run());

        tokio::task::yield_now().await;
        scope.cancel();
        assert_eq!(handle.await.unwrap(), ExitReason::Cancelled);
        assert_eq!(h.metrics.snapshot().jobs_started, 0);
    }

    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl Observer for Recorder {
        fn on_event(&self, event: &PoolEvent<'_>) {
            self.0.lock().push(event.name().to_string());
        }
    }

    #[tokio::test]
    async fn test_observers_run_inline_around_the_job() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let queue = Arc::new(BoundedQueue::new(1));
        let scope = CancellationScope::new();
        let (sink, _results) = ResultSink::channel(1);
        let worker = Worker::new(
            0,
            queue.clone(),
            scope.clone(),
            Outbox::new(sink, scope.child(), Arc::new(AtomicUsize::new(0))),
            Observers::new(vec![Arc::new(Recorder(log.clone())) as Arc<dyn Observer>]),
            Arc::new(DashMap::new()),
        );

        let job_log = log.clone();
        let job = Job::new(1u64, move |_| async move {
            job_log.lock().push("action".to_string());
            Ok(1)
        });
        queue
            .try_submit(queued(0, job))
            .unwrap_or_else(|_| panic!("queue full"));
        queue.close();
        worker.run().await;

        assert_eq!(
            *log.lock(),
            vec!["job.started", "action", "job.finished", "worker.exited"]
        );
    }
}
