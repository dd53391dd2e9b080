//! Driving an engine from a task on the tokio runtime.
use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    engine::ScheduleEngine,
    job::runner::JobRunner,
    state::{LoopState, LoopStatus},
    SchedulerError,
};

/// How long to wait for the next due job.
///
/// The time until `next_run`, less `precision` since jobs are already due within one precision
/// of their time, clamped to `[precision / 128, precision * 128]`. With nothing scheduled this is
/// the upper bound.
pub fn adaptive_delay(
    next_run: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    precision: Duration,
) -> Duration {
    let ceiling = precision.saturating_mul(128);
    let Some(next_run) = next_run else {
        return ceiling;
    };
    (next_run - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
        .saturating_sub(precision)
        .clamp(precision / 128, ceiling)
}

struct Shared {
    engine: ScheduleEngine,
    runner: JobRunner,
    status: LoopStatus,
    wake: Arc<Notify>,
}

struct StoppedOnDrop<'a>(&'a LoopStatus);

impl Drop for StoppedOnDrop<'_> {
    fn drop(&mut self) {
        self.0.set(LoopState::Stopped);
    }
}

/// Runs due jobs of a [`ScheduleEngine`] from a single task, suspending between jobs instead of
/// blocking a thread.
///
/// Between checks the loop waits for the [adaptive delay](adaptive_delay), or for exactly
/// `precision` when `use_adaptive_delay` is off. The wait ends early on [`CooperativeLoop::stop`],
/// on cancellation and, with `interrupt_on_change`, when the engine's jobs change.
///
/// # Example
///
/// ```
/// # use reschedule::prelude::*;
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), SchedulerError> {
/// let engine = ScheduleEngine::default();
/// let handle = CooperativeLoop::new(engine.clone()).spawn();
///
/// let (sender, receiver) = tokio::sync::oneshot::channel();
/// engine.register(&Job::once(move || sender.send(()).map_err(|_| "receiver dropped".into())))?;
///
/// receiver.await.unwrap();
/// handle.shutdown().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct CooperativeLoop {
    shared: Arc<Shared>,
}

impl CooperativeLoop {
    pub fn new(engine: ScheduleEngine) -> Self {
        let wake = Arc::new(Notify::new());
        engine.enroll(wake.clone());
        Self {
            shared: Arc::new(Shared {
                runner: JobRunner::new(engine.clone()),
                engine,
                status: LoopStatus::default(),
                wake,
            }),
        }
    }

    /// Run the loop until `token` is cancelled or [`CooperativeLoop::stop`] is called.
    ///
    /// Cancellation is observed between jobs; a job that is running is not interrupted.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::AlreadyRunning`] if the loop is already active.
    pub async fn run(&self, token: CancellationToken) -> Result<(), SchedulerError> {
        let Shared {
            engine,
            runner,
            status,
            wake,
        } = &*self.shared;
        if !status.try_start() {
            return Err(SchedulerError::AlreadyRunning);
        }
        let _stopped = StoppedOnDrop(status);
        if !status.enter_running() {
            return Ok(());
        }
        tracing::debug!("Cooperative loop started");

        let config = *engine.config();
        let precision = config.precision();
        while !token.is_cancelled() && !status.is_stop_requested() {
            if let Some(job) = engine.take_due(precision) {
                runner.execute(job).await;
                continue;
            }
            let delay = if config.use_adaptive_delay {
                adaptive_delay(engine.next_run(), Utc::now(), precision)
            } else {
                precision
            };
            tokio::select! {
                _ = wake.notified() => {},
                _ = tokio::time::sleep(delay) => {},
                _ = token.cancelled() => {},
            }
        }
        tracing::debug!("Cooperative loop stopped");
        Ok(())
    }

    /// Run the loop as a task on the current tokio runtime.
    pub fn spawn(&self) -> CooperativeHandle {
        let token = CancellationToken::new();
        let handle = tokio::spawn({
            let scheduler = self.clone();
            let token = token.clone();
            async move { scheduler.run(token).await }
        });
        CooperativeHandle {
            token,
            handle: Some(handle),
        }
    }

    /// Ask the loop to stop after the job it is currently running.
    pub fn stop(&self) {
        if self.shared.status.request_stop() {
            tracing::debug!("Stop requested for cooperative loop");
        }
        self.shared.wake.notify_one();
    }

    pub fn state(&self) -> LoopState {
        self.shared.status.get()
    }

    pub fn is_running(&self) -> bool {
        self.state() == LoopState::Running
    }

    pub fn engine(&self) -> &ScheduleEngine {
        &self.shared.engine
    }
}

/// A [`CooperativeLoop`] running as a tokio task.
#[derive(Debug)]
pub struct CooperativeHandle {
    token: CancellationToken,
    handle: Option<JoinHandle<Result<(), SchedulerError>>>,
}

impl CooperativeHandle {
    /// Request cancellation without waiting for the loop to exit.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Cancel the loop and wait for the task to finish.
    pub async fn shutdown(mut self) -> Result<(), SchedulerError> {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|_| SchedulerError::GracefulShutdownFailed)??;
        }
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }
}
