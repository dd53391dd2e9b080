//! Driving an engine from a dedicated thread.
use std::{
    sync::{Arc, Mutex, PoisonError},
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{
    engine::ScheduleEngine,
    job::runner::JobRunner,
    notifier::Signal,
    state::{LoopState, LoopStatus},
    SchedulerError,
};

struct Shared {
    engine: ScheduleEngine,
    runner: JobRunner,
    status: LoopStatus,
    signal: Arc<Signal>,
}

impl Shared {
    fn run(&self) {
        if !self.status.enter_running() {
            self.status.set(LoopState::Stopped);
            return;
        }
        tracing::debug!("Blocking loop started");
        let precision = self.engine.config().precision();
        while !self.status.is_stop_requested() {
            match self.engine.take_due(precision) {
                Some(job) => self.runner.execute_blocking(job),
                None => {
                    self.signal.wait_timeout(precision);
                }
            }
        }
        self.status.set(LoopState::Stopped);
        tracing::debug!("Blocking loop stopped");
    }
}

/// Runs due jobs of a [`ScheduleEngine`] on a single thread, checking for work at least every
/// `precision`.
///
/// Jobs run inline one after the other unless they are detached or have an affinity. The wait
/// between checks ends early when the loop is asked to stop and, with `interrupt_on_change`, when
/// the engine's jobs change.
///
/// # Example
///
/// ```
/// # use reschedule::prelude::*;
/// use std::sync::mpsc;
///
/// let engine = ScheduleEngine::default();
/// let scheduler = BlockingLoop::new(engine.clone());
/// scheduler.start().unwrap();
///
/// let (sender, receiver) = mpsc::channel();
/// engine
///     .register(&Job::once(move || Ok(sender.send("done")?)))
///     .unwrap();
///
/// assert_eq!(receiver.recv().unwrap(), "done");
/// scheduler.stop_and_block();
/// ```
pub struct BlockingLoop {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BlockingLoop {
    pub fn new(engine: ScheduleEngine) -> Self {
        let signal = Arc::new(Signal::default());
        engine.enroll(signal.clone());
        Self {
            shared: Arc::new(Shared {
                runner: JobRunner::new(engine.clone()),
                engine,
                status: LoopStatus::default(),
                signal,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start the loop on a new thread. Does nothing if the loop is already running.
    ///
    /// If a stop was requested and the worker is still finishing its current job, waits for the
    /// worker to exit and then starts a fresh one. From a job on the loop itself the pending stop
    /// is withdrawn instead.
    ///
    /// # Errors
    ///
    /// Fails if the operating system refuses to spawn the thread.
    pub fn start(&self) -> Result<(), SchedulerError> {
        loop {
            let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
            if self.shared.status.try_start() {
                // A previous worker has already left its loop; reap it.
                if let Some(previous) = worker.take() {
                    let _ = previous.join();
                }
                return self.spawn(&mut worker);
            }
            if !self.shared.status.is_stop_requested() {
                return Ok(());
            }
            let previous = match worker.as_ref() {
                Some(handle) if handle.thread().id() == thread::current().id() => {
                    self.shared.status.resume();
                    return Ok(());
                }
                _ => worker.take(),
            };
            drop(worker);
            match previous {
                Some(previous) => {
                    if previous.join().is_err() {
                        tracing::error!("Blocking loop thread panicked");
                    }
                }
                None => thread::sleep(Duration::from_millis(1)),
            }
        }
    }

    fn spawn(&self, worker: &mut Option<JoinHandle<()>>) -> Result<(), SchedulerError> {
        let shared = self.shared.clone();
        match thread::Builder::new()
            .name("reschedule-blocking".to_owned())
            .spawn(move || shared.run())
        {
            Ok(handle) => {
                *worker = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.shared.status.set(LoopState::Stopped);
                tracing::error!(?err, "Failed to spawn blocking loop thread");
                Err(SchedulerError::Spawn(err))
            }
        }
    }

    /// Run the loop on the calling thread until it is stopped from elsewhere.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::AlreadyRunning`] if the loop is already active.
    pub fn run(&self) -> Result<(), SchedulerError> {
        if !self.shared.status.try_start() {
            return Err(SchedulerError::AlreadyRunning);
        }
        self.shared.run();
        Ok(())
    }

    /// Ask the loop to stop after the job it is currently running, without waiting for it.
    pub fn signal_stop(&self) {
        if self.shared.status.request_stop() {
            tracing::debug!("Stop requested for blocking loop");
        }
        self.shared.signal.set();
    }

    /// Stop the loop and wait for its thread to exit.
    ///
    /// When called from a job running on the loop itself this only signals the stop.
    pub fn stop_and_block(&self) {
        self.signal_stop();
        let handle = {
            let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
            match worker.as_ref() {
                Some(handle) if handle.thread().id() == thread::current().id() => return,
                _ => worker.take(),
            }
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("Blocking loop thread panicked");
            }
        }
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

impl Drop for BlockingLoop {
    fn drop(&mut self) {
        self.stop_and_block();
    }
}
