//! Bounded FIFO hand-off between producers and workers
//!
//! The queue is the pool's backpressure mechanism: when `capacity` jobs are
//! waiting, `submit` blocks until a worker takes one, the queue closes, or the
//! caller's scope is done.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{PoolError, ScopeError, TrySubmitError};
use crate::scope::CancellationScope;

/// Fixed-capacity FIFO queue with blocking backpressure
///
/// All check-then-act sequences on the buffer run under one lock. Waiters
/// register with the [`Notify`] before checking state, so no wakeup is lost
/// between the check and the wait.
#[derive(Debug)]
pub struct BoundedQueue<J> {
    capacity: usize,
    state: Mutex<QueueState<J>>,
    not_empty: Notify,
    not_full: Notify,
}

#[derive(Debug)]
struct QueueState<J> {
    items: VecDeque<J>,
    closed: bool,
}

impl<J> BoundedQueue<J> {
    /// Create a queue holding at most `capacity` items (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Enqueue `item`, waiting for a free slot
    ///
    /// # Errors
    ///
    /// - [`PoolError::QueueClosed`] if the queue is or becomes closed
    /// - [`PoolError::Cancelled`] / [`PoolError::DeadlineExceeded`] if `scope`
    ///   finishes first
    pub async fn submit(&self, item: J, scope: &CancellationScope) -> Result<(), PoolError> {
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(PoolError::QueueClosed);
                }
                if let Some(cause) = scope.err() {
                    return Err(cause.into());
                }
                if state.items.len() < self.capacity {
                    state.items.push_back(item);
                    drop(state);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = scope.cancelled() => {
                    return Err(scope.err().unwrap_or(ScopeError::Cancelled).into());
                }
            }
        }
    }

    /// Enqueue `item` only if a slot is free right now
    pub fn try_submit(&self, item: J) -> Result<(), TrySubmitError<J>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TrySubmitError::Closed(item));
        }
        if state.items.len() >= self.capacity {
            return Err(TrySubmitError::Full(item));
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Take the oldest item, waiting while the queue is empty
    ///
    /// Returns `Ok(None)` once the queue is closed and fully drained, and
    /// `Err(cause)` if `scope` is done. A done scope wins over queued items.
    pub async fn dequeue(&self, scope: &CancellationScope) -> Result<Option<J>, ScopeError> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(cause) = scope.err() {
                return Err(cause);
            }

            {
                let mut state = self.state.lock();
                if let Some(item) = state.items.pop_front() {
                    drop(state);
                    self.not_full.notify_one();
                    return Ok(Some(item));
                }
                if state.closed {
                    return Ok(None);
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = scope.cancelled() => {
                    return Err(scope.err().unwrap_or(ScopeError::Cancelled));
                }
            }
        }
    }

    /// Stop accepting items; queued items stay available to `dequeue`
    ///
    /// Returns `true` on the call that closed the queue, `false` afterwards.
    pub fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
        }
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
        true
    }

    /// Remove every queued item at once, oldest first
    pub fn drain(&self) -> Vec<J> {
        let drained: Vec<J> = self.state.lock().items.drain(..).collect();
        if !drained.is_empty() {
            self.not_full.notify_waiters();
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = BoundedQueue::new(8);
        let scope = CancellationScope::new();

        for i in 0..8 {
            queue.submit(i, &scope).await.unwrap();
        }
        for i in 0..8 {
            assert_eq!(queue.dequeue(&scope).await.unwrap(), Some(i));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let queue: BoundedQueue<u8> = BoundedQueue::new(0);
        assert_eq!(queue.capacity(), 1);
    }

    #[test]
    fn test_try_submit_reports_full_and_closed() {
        let queue = BoundedQueue::new(2);
        queue.try_submit(1).unwrap();
        queue.try_submit(2).unwrap();

        match queue.try_submit(3) {
            Err(TrySubmitError::Full(item)) => assert_eq!(item, 3),
            other => panic!("expected Full, got {:?}", other),
        }
        assert_eq!(queue.len(), 2);

        queue.close();
        assert!(matches!(queue.try_submit(4), Err(TrySubmitError::Closed(4))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_blocks_until_slot_frees() {
        let queue = Arc::new(BoundedQueue::new(1));
        let scope = CancellationScope::new();
        queue.submit(1, &scope).await.unwrap();

        let producer = {
            let queue = queue.clone();
            let scope = scope.clone();
            tokio::spawn(async move { queue.submit(2, &scope).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.dequeue(&scope).await.unwrap(), Some(1));
        producer.await.unwrap().unwrap();
        assert_eq!(queue.dequeue(&scope).await.unwrap(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_never_exceeded_under_contention() {
        let queue = Arc::new(BoundedQueue::new(3));
        let scope = CancellationScope::new();

        let producers: Vec<_> = (0..10)
            .map(|i| {
                let queue = queue.clone();
                let scope = scope.clone();
                tokio::spawn(async move { queue.submit(i, &scope).await })
            })
            .collect();

        let mut received = Vec::new();
        while received.len() < 10 {
            assert!(queue.len() <= queue.capacity());
            if let Some(item) = queue.dequeue(&scope).await.unwrap() {
                received.push(item);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        for producer in producers {
            producer.await.unwrap().unwrap();
        }
        received.sort_unstable();
        assert_eq!(received, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_blocked_submit_fails_when_closed() {
        let queue = Arc::new(BoundedQueue::new(1));
        let scope = CancellationScope::new();
        queue.submit("first", &scope).await.unwrap();

        let producer = {
            let queue = queue.clone();
            let scope = scope.clone();
            tokio::spawn(async move { queue.submit("second", &scope).await })
        };

        tokio::task::yield_now().await;
        assert!(queue.close());
        assert!(!queue.close());

        assert!(matches!(
            producer.await.unwrap(),
            Err(PoolError::QueueClosed)
        ));
        // Already-queued items still drain.
        assert_eq!(queue.dequeue(&scope).await.unwrap(), Some("first"));
        assert_eq!(queue.dequeue(&scope).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_blocked_submit_fails_when_scope_cancelled() {
        let queue = Arc::new(BoundedQueue::new(1));
        let scope = CancellationScope::new();
        queue.submit(1, &scope).await.unwrap();

        let caller = scope.child();
        let producer = {
            let queue = queue.clone();
            let caller = caller.clone();
            tokio::spawn(async move { queue.submit(2, &caller).await })
        };

        tokio::task::yield_now().await;
        caller.cancel();

        assert!(matches!(producer.await.unwrap(), Err(PoolError::Cancelled)));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_times_out_with_deadline_scope() {
        let queue = BoundedQueue::new(1);
        let scope = CancellationScope::new();
        queue.submit(1, &scope).await.unwrap();

        let bounded = scope.with_timeout(Duration::from_millis(20));
        let err = queue.submit(2, &bounded).await.unwrap_err();
        assert!(matches!(err, PoolError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_close_and_cancel() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(4));
        let scope = CancellationScope::new();

        let waiter = {
            let queue = queue.clone();
            let scope = scope.clone();
            tokio::spawn(async move { queue.dequeue(&scope).await })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert_eq!(waiter.await.unwrap(), Ok(None));

        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(4));
        let waiter = {
            let queue = queue.clone();
            let scope = scope.clone();
            tokio::spawn(async move { queue.dequeue(&scope).await })
        };
        tokio::task::yield_now().await;
        scope.cancel();
        assert_eq!(waiter.await.unwrap(), Err(ScopeError::Cancelled));
    }

    #[tokio::test]
    async fn test_cancelled_scope_wins_over_queued_items() {
        let queue = BoundedQueue::new(2);
        let scope = CancellationScope::new();
        queue.submit(1, &scope).await.unwrap();

        scope.cancel();
        assert_eq!(queue.dequeue(&scope).await, Err(ScopeError::Cancelled));
        assert_eq!(queue.drain(), vec![1]);
    }
}
