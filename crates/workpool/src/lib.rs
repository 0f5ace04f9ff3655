//! # Workpool
//!
//! A bounded, cancellation-aware worker pool for tokio.
//!
//! ## Features
//!
//! - **Bounded concurrency**: a fixed number of long-lived workers, never one task per job
//! - **Backpressure**: `submit` blocks while the queue is full instead of buffering without limit
//! - **Cooperative cancellation**: hierarchical scopes with deadlines interrupt blocked
//!   submits, dequeues, running jobs and result delivery
//! - **Panic isolation**: a panicking job becomes an error result; its worker keeps running
//! - **Graceful and forced shutdown**: drain everything, or cancel and abandon stragglers
//!   after a grace period
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  submit (blocks when full)   ┌──────────────────┐
//! │ Producer │ ───────────────────────────► │   BoundedQueue   │
//! └──────────┘                              │  (FIFO, cap C)   │
//!                                           └──────────────────┘
//!                                                    │ dequeue
//!                                                    ▼
//! ┌──────────────────┐   cancel / deadline  ┌──────────────────┐
//! │ CancellationScope│ ───────────────────► │   Worker × N     │
//! │ (root, per job)  │                      │ (catches panics) │
//! └──────────────────┘                      └──────────────────┘
//!                                                    │ JobResult
//!                                                    ▼
//!                                ┌─────────────────────────────────────┐
//!                                │ ResultStream (pull) / handler (push)│
//!                                └─────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use std::time::Duration;
//! use workpool::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), PoolError> {
//! let pool = Pool::new(2, 1)?;
//! let mut results = pool.results().expect("results are taken once");
//! pool.start()?;
//!
//! for id in 1..=3u64 {
//!     let job = Job::new(id, move |scope| async move {
//!         scope
//!             .run(tokio::time::sleep(Duration::from_millis(10)))
//!             .await?;
//!         Ok::<_, JobError>(id)
//!     });
//!     pool.submit(job).await?;
//! }
//!
//! pool.shutdown(&CancellationScope::new(), true).await?;
//!
//! let ordered = results.collect_ordered(3).await;
//! let ids: Vec<u64> = ordered.iter().filter_map(|r| r.payload().copied()).collect();
//! assert_eq!(ids, vec![1, 2, 3]);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod job;
pub mod observer;
pub mod pool;
pub mod queue;
pub mod results;
pub mod scope;

mod worker;

pub use error::{JobError, PoolError, ScopeError, TrySubmitError};
pub use job::{Job, JobFuture, JobId, JobResult};
pub use observer::{ExitReason, MetricsSnapshot, Observer, PoolEvent, PoolMetrics, TracingObserver};
pub use pool::{Pool, PoolConfig, PoolState, ShutdownReport};
pub use queue::BoundedQueue;
pub use results::{ResultHandler, ResultStream, ResultSummary};
pub use scope::{CancellationScope, Clock, ManualClock, TokioClock};

/// Prelude for common imports
pub mod prelude {
    pub use crate::error::{JobError, PoolError, ScopeError};
    pub use crate::job::{Job, JobId, JobResult};
    pub use crate::observer::{Observer, PoolEvent, PoolMetrics};
    pub use crate::pool::{Pool, PoolConfig, PoolState, ShutdownReport};
    pub use crate::results::{ResultStream, ResultSummary};
    pub use crate::scope::CancellationScope;
}
