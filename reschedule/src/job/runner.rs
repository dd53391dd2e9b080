use std::{any::Any, panic::AssertUnwindSafe, thread};

use futures::{future::BoxFuture, FutureExt};
use tokio::task::JoinError;
use tracing::instrument;

use crate::engine::ScheduleEngine;

use super::{Action, BoxError, ErrorType, ExecutionError, Job, JobId};

/// Run `work`, converting both a returned error and a panic into an [`ExecutionError`].
pub(crate) fn run_isolated<T, F>(work: F) -> Result<T, ExecutionError>
where
    F: FnOnce() -> Result<T, BoxError>,
{
    match std::panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(result) => result.map_err(ExecutionError::from),
        Err(panic) => Err(ExecutionError::from_panic(panic)),
    }
}

pub(crate) async fn run_isolated_async<T>(
    future: BoxFuture<'static, Result<T, BoxError>>,
) -> Result<T, ExecutionError> {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result.map_err(ExecutionError::from),
        Err(panic) => Err(ExecutionError::from_panic(panic)),
    }
}

fn suspending(action: &Action) -> Option<BoxFuture<'static, Result<(), BoxError>>> {
    match action {
        Action::Blocking(_) => None,
        Action::Suspending(work) => {
            let work = work.clone();
            // Calling the factory inside the future means a panic while creating it is caught too.
            Some(async move { work().await }.boxed())
        }
    }
}

fn run_action_blocking(action: &Action) -> Result<(), ExecutionError> {
    match action {
        Action::Blocking(work) => run_isolated(|| work()),
        Action::Suspending(_) => match suspending(action) {
            Some(future) => futures::executor::block_on(run_isolated_async(future)),
            None => Ok(()),
        },
    }
}

async fn run_action(action: &Action) -> Result<(), ExecutionError> {
    match suspending(action) {
        Some(future) => run_isolated_async(future).await,
        None => run_action_blocking(action),
    }
}

/// Dispatches due jobs on behalf of a loop and reschedules them afterwards.
///
/// Every failure is reported through [`ScheduleEngine::report_error`]; nothing a job does can
/// unwind into the loop calling the runner.
#[derive(Clone)]
pub(crate) struct JobRunner {
    engine: ScheduleEngine,
}

impl JobRunner {
    pub(crate) fn new(engine: ScheduleEngine) -> Self {
        Self { engine }
    }

    /// Execute `job` from a loop running on a dedicated thread.
    #[instrument(skip(self, job), fields(job_id = %job.id()))]
    pub(crate) fn execute_blocking(&self, job: Job) {
        let job_id = job.id();
        match (job.affinity(), job.is_detached()) {
            (Some(bridge), true) => {
                tracing::trace!(%job_id, "Posting job {job_id} to its affinity target");
                let engine = self.engine.clone();
                match suspending(job.action()) {
                    Some(future) => bridge.spawn_with(future, move |result| {
                        engine.report_result(job_id, result)
                    }),
                    None => {
                        let action = job.action().clone();
                        bridge.post(move || {
                            engine.report_result(job_id, run_action_blocking(&action));
                            Ok(())
                        })
                    }
                }
            }
            (Some(bridge), false) => {
                tracing::trace!(%job_id, "Sending job {job_id} to its affinity target");
                let result = match suspending(job.action()) {
                    Some(future) => futures::executor::block_on(bridge.spawn(future)),
                    None => {
                        let action = job.action().clone();
                        bridge.send(move || {
                            run_action_blocking(&action).map_err(BoxError::from)
                        })
                    }
                };
                self.engine.report_result(job_id, result);
            }
            (None, true) => {
                tracing::trace!(%job_id, "Executing detached job {job_id}");
                let engine = self.engine.clone();
                let action = job.action().clone();
                if let Err(err) = thread::Builder::new()
                    .name(format!("reschedule-job-{}", u64::from(job_id)))
                    .spawn(move || engine.report_result(job_id, run_action_blocking(&action)))
                {
                    tracing::error!(?err, %job_id, "Failed to spawn worker for job {job_id}");
                    self.engine.report_error(job_id, err.into());
                }
            }
            (None, false) => {
                tracing::trace!(%job_id, "Executing job {job_id}");
                self.engine
                    .report_result(job_id, run_action_blocking(job.action()));
            }
        }
        self.engine.reschedule(&job);
    }

    /// Execute `job` from a loop running as a task on the tokio runtime.
    #[instrument(skip(self, job), fields(job_id = %job.id()))]
    pub(crate) async fn execute(&self, job: Job) {
        let job_id = job.id();
        match (job.affinity(), job.is_detached()) {
            (Some(bridge), true) => {
                tracing::trace!(%job_id, "Posting job {job_id} to its affinity target");
                let engine = self.engine.clone();
                match suspending(job.action()) {
                    Some(future) => bridge.spawn_with(future, move |result| {
                        engine.report_result(job_id, result)
                    }),
                    None => {
                        let action = job.action().clone();
                        bridge.post(move || {
                            engine.report_result(job_id, run_action_blocking(&action));
                            Ok(())
                        })
                    }
                }
            }
            (Some(bridge), false) => {
                tracing::trace!(%job_id, "Sending job {job_id} to its affinity target");
                let result = match suspending(job.action()) {
                    Some(future) => bridge.spawn(future).await,
                    None => {
                        let action = job.action().clone();
                        bridge
                            .send_async(move || {
                                run_action_blocking(&action).map_err(BoxError::from)
                            })
                            .await
                    }
                };
                self.engine.report_result(job_id, result);
            }
            (None, true) => {
                tracing::trace!(%job_id, "Executing detached job {job_id}");
                let engine = self.engine.clone();
                let handle = match suspending(job.action()) {
                    Some(future) => tokio::spawn(future),
                    None => {
                        let action = job.action().clone();
                        tokio::task::spawn_blocking(move || match action {
                            Action::Blocking(work) => work(),
                            Action::Suspending(work) => futures::executor::block_on(work()),
                        })
                    }
                };
                tokio::spawn(async move {
                    let result = match handle.await {
                        Ok(result) => result.map_err(ExecutionError::from),
                        Err(error) => Err(ExecutionError::from(error)),
                    };
                    engine.report_result(job_id, result);
                });
            }
            (None, false) => {
                tracing::trace!(%job_id, "Executing job {job_id}");
                self.engine
                    .report_result(job_id, run_action(job.action()).await);
            }
        }
        self.engine.reschedule(&job);
    }
}

impl ScheduleEngine {
    pub(crate) fn report_result(&self, job_id: JobId, result: Result<(), ExecutionError>) {
        if let Err(error) = result {
            self.report_error(job_id, error);
        }
    }
}

impl ExecutionError {
    pub(crate) fn from_panic(panic: Box<dyn Any + Send>) -> Self {
        let message = panic
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "Job panicked".to_owned());
        Self {
            error_type: ErrorType::Panic,
            message,
        }
    }
}

impl From<BoxError> for ExecutionError {
    fn from(value: BoxError) -> Self {
        // Errors that already passed through an isolation boundary keep their classification.
        match value.downcast::<ExecutionError>() {
            Ok(error) => *error,
            Err(value) => Self {
                error_type: ErrorType::Failed,
                message: value.to_string(),
            },
        }
    }
}

impl From<JoinError> for ExecutionError {
    fn from(value: JoinError) -> Self {
        let message = value.to_string();
        match value.try_into_panic() {
            Ok(panic) => Self::from_panic(panic),
            Err(_) => Self {
                error_type: ErrorType::Cancelled,
                message,
            },
        }
    }
}

impl From<std::io::Error> for ExecutionError {
    fn from(value: std::io::Error) -> Self {
        Self {
            error_type: ErrorType::Failed,
            message: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use assert_matches::assert_matches;
    use chrono::TimeDelta;

    use super::*;
    use crate::{event::SchedulerEvent, SchedulerConfig};

    fn counting_job(counter: &Arc<AtomicUsize>) -> Job {
        let counter = counter.clone();
        Job::builder(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .build()
    }

    async fn explode() -> crate::job::JobResult {
        panic!("async job panicked")
    }

    #[test]
    fn run_isolated_passes_through_values() {
        assert_eq!(run_isolated(|| Ok::<_, BoxError>(7)).unwrap(), 7);
    }

    #[test]
    fn run_isolated_catches_string_panics() {
        let result = run_isolated::<(), _>(|| panic!("{} went wrong", "something"));

        assert_matches!(result, Err(ExecutionError { error_type: ErrorType::Panic, message }) if message == "something went wrong");
    }

    #[test]
    fn execution_errors_keep_their_type_when_boxed() {
        let boxed: BoxError = Box::new(ExecutionError::cancelled());

        assert_eq!(ExecutionError::from(boxed).error_type, ErrorType::Cancelled);
    }

    #[test]
    fn suspending_jobs_run_inline_on_a_thread() {
        let engine = ScheduleEngine::new(SchedulerConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));
        let job = Job::builder_async({
            let counter = counter.clone();
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        })
        .build();
        engine.register(&job).unwrap();

        JobRunner::new(engine.clone()).execute_blocking(job.clone());

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!job.is_registered());
        assert!(engine.is_empty());
    }

    #[test]
    fn failures_are_reported_and_recurring_jobs_rescheduled() {
        let engine = ScheduleEngine::new(SchedulerConfig::default());
        let mut events = engine.subscribe();
        let job = Job::builder(|| Err("boom".into()))
            .with_interval(TimeDelta::minutes(1))
            .build();
        engine.register(&job).unwrap();
        let first = engine.next_run_of(&job).unwrap();

        JobRunner::new(engine.clone()).execute_blocking(job.clone());

        assert_matches!(
            events.try_recv(),
            Ok(SchedulerEvent::JobFailed { job_id, error }) if job_id == job.id() && error.message == "boom"
        );
        assert!(job.is_registered());
        assert_eq!(engine.next_run_of(&job), Some(first + TimeDelta::minutes(1)));
    }

    #[test]
    fn detached_jobs_do_not_block_the_caller() {
        let engine = ScheduleEngine::new(SchedulerConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));
        let slow = Job::builder(|| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        })
        .detached()
        .build();
        engine.register(&slow).unwrap();

        let started = std::time::Instant::now();
        JobRunner::new(engine.clone()).execute_blocking(slow);
        assert!(started.elapsed() < Duration::from_millis(200));

        let quick = counting_job(&counter);
        engine.register(&quick).unwrap();
        JobRunner::new(engine.clone()).execute_blocking(quick);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn async_dispatch_reports_panics() {
        let engine = ScheduleEngine::new(SchedulerConfig::default());
        let mut events = engine.subscribe();
        let job = Job::builder_async(explode).build();
        engine.register(&job).unwrap();

        JobRunner::new(engine.clone()).execute(job).await;

        assert_matches!(
            events.try_recv(),
            Ok(SchedulerEvent::JobFailed { error: ExecutionError { error_type: ErrorType::Panic, .. }, .. })
        );
        assert!(engine.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn async_detached_blocking_jobs_report_to_the_engine() {
        let engine = ScheduleEngine::new(SchedulerConfig::default());
        let mut events = engine.subscribe();
        let job = Job::builder(|| Err("detached failure".into()))
            .detached()
            .build();
        engine.register(&job).unwrap();

        JobRunner::new(engine.clone()).execute(job).await;

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap();
        assert_matches!(event, Some(SchedulerEvent::JobFailed { error, .. }) if error.message == "detached failure");
    }
}
