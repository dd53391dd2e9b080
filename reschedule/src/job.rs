use std::{
    fmt::Display,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use chrono::{DateTime, TimeDelta, Utc};
use futures::{future::BoxFuture, FutureExt};
use thiserror::Error;

use crate::{affinity::ThreadAffinityBridge, SchedulerError};

pub mod builder;
pub(crate) mod runner;

use builder::JobBuilder;

/// The error type a job callback can fail with.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The outcome of a single invocation of a job callback.
pub type JobResult = Result<(), BoxError>;

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl JobId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl From<JobId> for u64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// The callback a job runs.
#[derive(Clone)]
pub enum Action {
    /// A plain callback, ran to completion on whichever thread dispatches it.
    Blocking(Arc<dyn Fn() -> JobResult + Send + Sync>),
    /// A callback returning a future that is driven to completion by the dispatcher.
    Suspending(Arc<dyn Fn() -> BoxFuture<'static, JobResult> + Send + Sync>),
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blocking(_) => f.write_str("Action::Blocking"),
            Self::Suspending(_) => f.write_str("Action::Suspending"),
        }
    }
}

/// A schedulable unit of work together with its timing metadata.
///
/// [`Job`] is a handle: cloning it is cheap and every clone refers to the same job. This is what
/// allows a caller to keep hold of a job after registering it in order to later unregister it or
/// inspect whether it is still scheduled.
///
/// Jobs are constructed via [`Job::builder`], [`Job::builder_async`], [`Job::with_state`] or
/// [`Job::once`].
///
/// # Example
///
/// ```
/// # use reschedule::prelude::*;
/// use chrono::TimeDelta;
///
/// let job = Job::builder(|| {
///     println!("tick");
///     Ok(())
/// })
/// .schedule_in(TimeDelta::seconds(5))
/// .with_interval(TimeDelta::seconds(30))
/// .can_skip(false)
/// .build();
///
/// assert_eq!(job.interval(), Some(TimeDelta::seconds(30)));
/// assert!(!job.is_registered());
/// ```
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

struct JobInner {
    id: JobId,
    action: Action,
    first_run: Mutex<DateTime<Utc>>,
    interval: Option<TimeDelta>,
    can_skip: bool,
    run_detached: bool,
    affinity: Option<ThreadAffinityBridge>,
    registered: AtomicBool,
}

impl Job {
    /// Start building a job running a plain callback.
    pub fn builder<F>(work: F) -> JobBuilder
    where
        F: Fn() -> JobResult + Send + Sync + 'static,
    {
        JobBuilder::new(Action::Blocking(Arc::new(work)))
    }

    /// Start building a job whose callback returns a future.
    pub fn builder_async<F, Fut>(work: F) -> JobBuilder
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        JobBuilder::new(Action::Suspending(Arc::new(move || work().boxed())))
    }

    /// Start building a job that receives a reference to `state` on every run.
    pub fn with_state<T, F>(state: T, work: F) -> JobBuilder
    where
        T: Send + Sync + 'static,
        F: Fn(&T) -> JobResult + Send + Sync + 'static,
    {
        JobBuilder::new(Action::Blocking(Arc::new(move || work(&state))))
    }

    /// A job that runs `work` a single time as soon as it is registered.
    pub fn once<F>(work: F) -> Self
    where
        F: FnOnce() -> JobResult + Send + 'static,
    {
        let work = Mutex::new(Some(work));
        Self::builder(move || {
            let work = work.lock().unwrap_or_else(PoisonError::into_inner).take();
            work.map_or(Ok(()), |work| work())
        })
        .build()
    }

    pub(crate) fn from_builder(
        action: Action,
        first_run: DateTime<Utc>,
        interval: Option<TimeDelta>,
        can_skip: bool,
        run_detached: bool,
        affinity: Option<ThreadAffinityBridge>,
    ) -> Self {
        Self {
            inner: Arc::new(JobInner {
                id: JobId::next(),
                action,
                first_run: Mutex::new(first_run),
                interval,
                can_skip,
                run_detached,
                affinity,
                registered: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> JobId {
        self.inner.id
    }

    /// The time of the first intended execution.
    pub fn first_run(&self) -> DateTime<Utc> {
        *self.lock_first_run()
    }

    /// Change the time of the first intended execution.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::AlreadyScheduled`] if the job is currently registered with a
    /// [`crate::engine::ScheduleEngine`].
    pub fn set_first_run(&self, first_run: DateTime<Utc>) -> Result<(), SchedulerError> {
        let mut current = self.lock_first_run();
        if self.is_registered() {
            return Err(SchedulerError::AlreadyScheduled);
        }
        *current = first_run;
        Ok(())
    }

    /// The time between successive runs, [`None`] for a job that runs once.
    pub fn interval(&self) -> Option<TimeDelta> {
        self.inner.interval
    }

    pub fn can_skip(&self) -> bool {
        self.inner.can_skip
    }

    pub fn is_detached(&self) -> bool {
        self.inner.run_detached
    }

    pub fn affinity(&self) -> Option<&ThreadAffinityBridge> {
        self.inner.affinity.as_ref()
    }

    /// Whether the job is currently owned by an engine.
    pub fn is_registered(&self) -> bool {
        self.inner.registered.load(Ordering::SeqCst)
    }

    pub(crate) fn action(&self) -> &Action {
        &self.inner.action
    }

    /// Marks the job as registered, returning the first run time it was registered with.
    pub(crate) fn claim(&self) -> Result<DateTime<Utc>, SchedulerError> {
        let first_run = self.lock_first_run();
        if self.inner.interval.is_some_and(|interval| interval <= TimeDelta::zero()) {
            return Err(SchedulerError::InvalidInterval(self.id()));
        }
        if self.inner.registered.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRegistered(self.id()));
        }
        Ok(*first_run)
    }

    pub(crate) fn release(&self) {
        let _first_run = self.lock_first_run();
        self.inner.registered.store(false, Ordering::SeqCst);
    }

    fn lock_first_run(&self) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
        self.inner
            .first_run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Job {}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.inner.id)
            .field("action", &self.inner.action)
            .field("first_run", &self.first_run())
            .field("interval", &self.inner.interval)
            .field("can_skip", &self.inner.can_skip)
            .field("run_detached", &self.inner.run_detached)
            .field("has_affinity", &self.inner.affinity.is_some())
            .field("registered", &self.is_registered())
            .finish()
    }
}

impl Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.interval {
            Some(interval) => write!(f, "{} every {interval}", self.inner.id),
            None => write!(f, "{} once", self.inner.id),
        }
    }
}

/// Why an invocation failed.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ErrorType {
    /// The callback panicked.
    Panic,
    /// The callback returned an error.
    Failed,
    /// The callback was dropped before it could run, e.g. because its loop was torn down.
    Cancelled,
}

impl Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Panic => "panic",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        })
    }
}

/// The error recorded for a failed invocation of a job or loop callback.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error("{error_type}: {message}")]
pub struct ExecutionError {
    pub error_type: ErrorType,
    pub message: String,
}

impl ExecutionError {
    pub(crate) fn cancelled() -> Self {
        Self {
            error_type: ErrorType::Cancelled,
            message: "Callback was dropped before it completed".to_owned(),
        }
    }
}
