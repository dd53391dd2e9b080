//! An in-process job scheduler.
//!
//! Jobs are registered with a [`ScheduleEngine`](engine::ScheduleEngine), which keeps them
//! ordered by when they are next due and decides how a repeating job catches up after falling
//! behind. The engine is driven by one of the loops:
//!
//! - [`BlockingLoop`](blocking::BlockingLoop): a dedicated thread,
//! - [`CooperativeLoop`](cooperative::CooperativeLoop): a task on the tokio runtime,
//!
//! while a [`RoundRobinLoop`](round_robin::RoundRobinLoop) runs plain callbacks, one-shot and
//! recurring, on a thread of its own. A [`ThreadAffinityBridge`](affinity::ThreadAffinityBridge)
//! hands work to a specific loop so that it runs on that loop's worker.
//!
//! Everything is kept in memory; nothing survives the process.
//!
//! # Example
//!
//! ```
//! use reschedule::prelude::*;
//! use chrono::TimeDelta;
//! use std::sync::{
//!     atomic::{AtomicUsize, Ordering},
//!     Arc,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), SchedulerError> {
//! let engine = ScheduleEngine::new(SchedulerConfig::default());
//! let handle = CooperativeLoop::new(engine.clone()).spawn();
//!
//! let runs = Arc::new(AtomicUsize::new(0));
//! let job = Job::builder({
//!     let runs = runs.clone();
//!     move || {
//!         runs.fetch_add(1, Ordering::SeqCst);
//!         Ok(())
//!     }
//! })
//! .with_interval(TimeDelta::milliseconds(10))
//! .can_skip(false)
//! .build();
//! engine.register(&job)?;
//!
//! tokio::time::sleep(std::time::Duration::from_millis(100)).await;
//! engine.unregister(&job);
//! handle.shutdown().await?;
//!
//! assert!(runs.load(Ordering::SeqCst) > 0);
//! # Ok(())
//! # }
//! ```
pub mod affinity;
pub mod blocking;
mod config;
pub mod cooperative;
pub mod engine;
pub mod event;
pub mod job;
mod notifier;
pub mod prelude;
pub mod round_robin;
pub mod state;

pub use config::SchedulerConfig;

use job::JobId;
use thiserror::Error;

/// Errors returned synchronously by the scheduler's API.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Cannot change the first run of a job while it is registered")]
    AlreadyScheduled,
    #[error("Job {0} is already registered")]
    AlreadyRegistered(JobId),
    #[error("Job {0} has a non-positive interval")]
    InvalidInterval(JobId),
    #[error("Loop is already running")]
    AlreadyRunning,
    #[error("Failed to spawn loop thread")]
    Spawn(#[from] std::io::Error),
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
}
