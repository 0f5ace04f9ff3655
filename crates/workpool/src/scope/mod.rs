//! Hierarchical cancellation with deadlines
//!
//! A [`CancellationScope`] is done when it is cancelled by hand, when its
//! deadline passes, or when any ancestor is done. Children never affect their
//! parent. Once done, a scope stays done and keeps reporting the same cause.
//!
//! ```text
//!   root (pool)                  cancel() ──► every descendant
//!    ├── job A  (timeout 1s)     deadline ──► only job A
//!    └── job B
//! ```

mod clock;

pub use clock::{Clock, ManualClock, TokioClock};

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ScopeError;

/// Propagating, monotonic abort/deadline signal
///
/// Cloning is cheap and yields a handle to the same scope.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use workpool::{CancellationScope, ScopeError};
///
/// let root = CancellationScope::new();
/// let child = root.with_timeout(Duration::from_secs(30));
///
/// assert!(root.cancel());
/// assert!(!root.cancel()); // already done
/// assert_eq!(child.err(), Some(ScopeError::Cancelled));
/// ```
#[derive(Clone)]
pub struct CancellationScope {
    inner: Arc<Inner>,
}

struct Inner {
    token: CancellationToken,
    deadline: Option<Instant>,
    cause: OnceLock<ScopeError>,
    parent: Option<CancellationScope>,
    clock: Arc<dyn Clock>,
}

impl CancellationScope {
    /// Root scope on real (tokio) time
    pub fn new() -> Self {
        Self::with_clock(Arc::new(TokioClock))
    }

    /// Root scope on the given clock; descendants share it
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                deadline: None,
                cause: OnceLock::new(),
                parent: None,
                clock,
            }),
        }
    }

    /// Child that is done whenever this scope is, with no deadline of its own
    pub fn child(&self) -> Self {
        self.derive(self.inner.deadline)
    }

    /// Child that is also done once `timeout` has elapsed from now
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        match self.inner.clock.now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self.child(),
        }
    }

    /// Child that is also done at `deadline`
    ///
    /// The effective deadline never exceeds the parent's.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.inner.deadline {
            Some(parent) => parent.min(deadline),
            None => deadline,
        };
        self.derive(Some(deadline))
    }

    fn derive(&self, deadline: Option<Instant>) -> Self {
        Self {
            inner: Arc::new(Inner {
                token: self.inner.token.child_token(),
                deadline,
                cause: OnceLock::new(),
                parent: Some(self.clone()),
                clock: Arc::clone(&self.inner.clock),
            }),
        }
    }

    /// Cancel this scope and all of its descendants
    ///
    /// Returns `true` only for the call that moved the scope to done; later or
    /// concurrent calls return `false`.
    pub fn cancel(&self) -> bool {
        if self.err().is_some() {
            return false;
        }
        let won = self.inner.cause.set(ScopeError::Cancelled).is_ok();
        self.inner.token.cancel();
        won
    }

    /// `None` while live, then the cause that ended the scope
    pub fn err(&self) -> Option<ScopeError> {
        if let Some(cause) = self.inner.cause.get() {
            return Some(*cause);
        }

        let cause = if self.inner.token.is_cancelled() {
            // Token fired without a local cause: an ancestor was done first.
            self.inner
                .parent
                .as_ref()
                .and_then(|parent| parent.err())
                .unwrap_or(ScopeError::Cancelled)
        } else if self.deadline_passed() {
            ScopeError::DeadlineExceeded
        } else {
            return None;
        };

        let cause = *self.inner.cause.get_or_init(|| cause);
        self.inner.token.cancel();
        Some(cause)
    }

    pub fn is_cancelled(&self) -> bool {
        self.err().is_some()
    }

    /// Resolve once the scope is done
    ///
    /// Any number of tasks may await this concurrently; all of them wake.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }

        match self.inner.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.inner.token.cancelled() => {}
                    _ = self.inner.clock.sleep_until(deadline) => {}
                }
            }
            None => self.inner.token.cancelled().await,
        }

        // Records the cause and fires the token so descendants wake too.
        let _ = self.err();
    }

    /// Drive `fut` unless the scope finishes first
    ///
    /// ```
    /// # async fn example() -> Result<(), workpool::JobError> {
    /// use std::time::Duration;
    /// use workpool::CancellationScope;
    ///
    /// let scope = CancellationScope::new().with_timeout(Duration::from_millis(10));
    /// let slow = tokio::time::sleep(Duration::from_secs(60));
    /// assert!(scope.run(slow).await.is_err());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, ScopeError> {
        if let Some(cause) = self.err() {
            return Err(cause);
        }

        tokio::select! {
            biased;
            output = fut => Ok(output),
            _ = self.cancelled() => Err(self.err().unwrap_or(ScopeError::Cancelled)),
        }
    }

    /// Effective deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Time left before the deadline; `None` when there is no deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|deadline| deadline.saturating_duration_since(self.inner.clock.now()))
    }

    /// Clock shared by this scope tree
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.inner.clock)
    }

    fn deadline_passed(&self) -> bool {
        self.inner
            .deadline
            .is_some_and(|deadline| self.inner.clock.now() >= deadline)
    }
}

impl Default for CancellationScope {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationScope")
            .field("deadline", &self.inner.deadline)
            .field("cause", &self.inner.cause.get())
            .field("has_parent", &self.inner.parent.is_some())
            .finish()
    }
}
