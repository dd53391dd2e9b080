//! A single thread shared by one-shot and recurring callbacks.
//!
//! A [`RoundRobinLoop`] has no notion of time. It runs queued one-shot callbacks in the order they
//! were queued and, whenever that queue is empty, the next of its recurring callbacks in turn.
//! Only one callback runs at a time, always on the loop's own thread, which makes the loop a
//! natural [`AffinityTarget`].
use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use tokio::sync::{
    mpsc::{self, error::TryRecvError},
    oneshot,
};

use crate::{
    affinity::{AffinityTarget, ThreadAffinityBridge, Work},
    event::{SchedulerEvent, Subscribers},
    job::{runner::run_isolated, BoxError, ExecutionError, JobResult},
    state::{LoopState, LoopStatus},
    SchedulerError,
};

/// Identifies a recurring callback registered with [`RoundRobinLoop::schedule_loop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopId(u64);

type Callback = Arc<dyn Fn() -> JobResult + Send + Sync>;

enum Message {
    Run(Work),
    Wake,
    Drain(u64),
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Run(_) => f.write_str("Message::Run"),
            Self::Wake => f.write_str("Message::Wake"),
            Self::Drain(generation) => f.debug_tuple("Message::Drain").field(generation).finish(),
        }
    }
}

struct Shared {
    sender: mpsc::UnboundedSender<Message>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    recurring: Mutex<Vec<(LoopId, Callback)>>,
    next_loop_id: AtomicU64,
    /// Bumped each time the worker leaves its loop, so drain markers left over from an earlier
    /// run are ignored.
    generation: AtomicU64,
    pending: AtomicUsize,
    status: LoopStatus,
    events: Subscribers<SchedulerEvent>,
    exit_waiters: Mutex<Vec<oneshot::Sender<()>>>,
}

impl Shared {
    fn run(&self) {
        let receiver = lock(&self.receiver).take();
        match receiver {
            Some(mut receiver) if self.status.enter_running() => {
                tracing::debug!("Round robin loop started");
                self.run_loop(&mut receiver);
                *lock(&self.receiver) = Some(receiver);
                tracing::debug!("Round robin loop stopped");
            }
            Some(receiver) => *lock(&self.receiver) = Some(receiver),
            None => tracing::error!("Round robin loop has lost its queue"),
        }
        let mut waiters = lock(&self.exit_waiters);
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.status.set(LoopState::Stopped);
        waiters.drain(..).for_each(|waiter| {
            let _ = waiter.send(());
        });
    }

    fn run_loop(&self, receiver: &mut mpsc::UnboundedReceiver<Message>) {
        let mut index = 0;
        while !self.status.is_stop_requested() {
            let message = match receiver.try_recv() {
                Ok(message) => message,
                Err(TryRecvError::Empty) => match self.next_recurring(&mut index) {
                    Some(callback) => {
                        self.invoke(|| callback());
                        continue;
                    }
                    None => match receiver.blocking_recv() {
                        Some(message) => message,
                        None => break,
                    },
                },
                Err(TryRecvError::Disconnected) => break,
            };
            match message {
                Message::Run(work) => {
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                    self.invoke(work);
                }
                Message::Wake => {}
                Message::Drain(generation) => {
                    if generation == self.generation.load(Ordering::SeqCst) {
                        self.status.request_stop();
                    }
                }
            }
        }
    }

    /// The recurring callback to run next, if any. The list can change between calls, so the
    /// position is wrapped rather than trusted.
    fn next_recurring(&self, index: &mut usize) -> Option<Callback> {
        let recurring = lock(&self.recurring);
        if recurring.is_empty() {
            return None;
        }
        if *index >= recurring.len() {
            *index = 0;
        }
        let (_, callback) = &recurring[*index];
        *index += 1;
        Some(callback.clone())
    }

    fn invoke<F>(&self, work: F)
    where
        F: FnOnce() -> JobResult,
    {
        if let Err(error) = run_isolated(work) {
            tracing::error!(
                ?error,
                "Round robin callback failed: error type: {}, message: {}",
                error.error_type,
                error.message
            );
            self.events.emit(SchedulerEvent::CallbackFailed { error });
        }
    }

    fn enqueue(&self, work: Work) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(Message::Run(work)).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            tracing::error!("Failed to queue callback on round robin loop");
        }
    }

    fn wake(&self, message: Message) {
        if !self.status.is_active() {
            return;
        }
        if self.sender.send(message).is_err() {
            tracing::error!("Failed to send round robin loop wake message");
        }
    }

    fn request_stop(&self) -> impl Future<Output = ()> {
        let receiver = {
            let mut waiters = lock(&self.exit_waiters);
            if self.status.is_active() {
                if self.status.request_stop() {
                    tracing::debug!("Stop requested for round robin loop");
                }
                self.wake(Message::Wake);
                let (sender, receiver) = oneshot::channel();
                waiters.push(sender);
                Some(receiver)
            } else {
                None
            }
        };
        exited(receiver)
    }

    fn request_stop_after_drain(&self) -> impl Future<Output = ()> {
        let receiver = {
            let mut waiters = lock(&self.exit_waiters);
            if self.status.is_active() {
                tracing::debug!("Drain requested for round robin loop");
                self.wake(Message::Drain(self.generation.load(Ordering::SeqCst)));
                let (sender, receiver) = oneshot::channel();
                waiters.push(sender);
                Some(receiver)
            } else {
                None
            }
        };
        exited(receiver)
    }
}

async fn exited(receiver: Option<oneshot::Receiver<()>>) {
    if let Some(receiver) = receiver {
        let _ = receiver.await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs callbacks one at a time on a dedicated thread.
///
/// One-shot callbacks ([`RoundRobinLoop::schedule_once`]) run first, strictly in the order they
/// were queued. When there are none, the recurring callbacks ([`RoundRobinLoop::schedule_loop`])
/// run in turn. With nothing to do the loop waits without spinning.
///
/// Failing or panicking callbacks are reported as [`SchedulerEvent::CallbackFailed`] and do not
/// affect the loop or any other callback.
///
/// # Example
///
/// ```
/// # use reschedule::prelude::*;
/// use std::sync::{Arc, Mutex};
///
/// let scheduler = RoundRobinLoop::new();
/// scheduler.start().unwrap();
///
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let bridge = scheduler.bridge();
/// bridge
///     .send({
///         let seen = seen.clone();
///         move || {
///             seen.lock().unwrap().push(std::thread::current().name().map(str::to_owned));
///             Ok(())
///         }
///     })
///     .unwrap();
///
/// assert_eq!(*seen.lock().unwrap(), vec![Some("reschedule-round-robin".to_owned())]);
/// scheduler.stop_and_block();
/// ```
pub struct RoundRobinLoop {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for RoundRobinLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundRobinLoop {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                sender,
                receiver: Mutex::new(Some(receiver)),
                recurring: Mutex::new(Vec::new()),
                next_loop_id: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                pending: AtomicUsize::new(0),
                status: LoopStatus::default(),
                events: Subscribers::default(),
                exit_waiters: Mutex::new(Vec::new()),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Queue `work` to run once, after every one-shot callback queued before it.
    pub fn schedule_once<F>(&self, work: F)
    where
        F: FnOnce() -> JobResult + Send + 'static,
    {
        self.shared.enqueue(Box::new(work));
    }

    /// Queue `work` to run once, returning a future that resolves with its outcome.
    ///
    /// The outcome goes to the returned future, not to [`SchedulerEvent::CallbackFailed`].
    pub fn run_once<T, F>(&self, work: F) -> impl Future<Output = Result<T, ExecutionError>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, BoxError> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        self.schedule_once(move || {
            let _ = sender.send(run_isolated(work));
            Ok(())
        });
        async move {
            receiver
                .await
                .unwrap_or_else(|_| Err(ExecutionError::cancelled()))
        }
    }

    /// Add `work` to the recurring callbacks.
    pub fn schedule_loop<F>(&self, work: F) -> LoopId
    where
        F: Fn() -> JobResult + Send + Sync + 'static,
    {
        let id = LoopId(self.shared.next_loop_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.shared.recurring).push((id, Arc::new(work)));
        self.shared.wake(Message::Wake);
        id
    }

    /// Remove a recurring callback. Returns whether it was still registered.
    pub fn unschedule_loop(&self, id: LoopId) -> bool {
        let mut recurring = lock(&self.shared.recurring);
        let before = recurring.len();
        recurring.retain(|(existing, _)| *existing != id);
        recurring.len() != before
    }

    /// The number of one-shot callbacks waiting to run.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Start the loop on a new thread. Does nothing if the loop is already running.
    ///
    /// Callbacks queued while the loop was stopped run once it is started. If a stop was requested
    /// and the worker is still finishing its current callback, waits for the worker to exit and
    /// then starts a fresh one. From a callback on the loop itself the pending stop is withdrawn
    /// instead.
    ///
    /// # Errors
    ///
    /// Fails if the operating system refuses to spawn the thread.
    pub fn start(&self) -> Result<(), SchedulerError> {
        loop {
            let mut worker = lock(&self.worker);
            if self.shared.status.try_start() {
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
                        tracing::error!("Round robin loop thread panicked");
                    }
                }
                None => thread::sleep(Duration::from_millis(1)),
            }
        }
    }

    fn spawn(&self, worker: &mut Option<JoinHandle<()>>) -> Result<(), SchedulerError> {
        let shared = self.shared.clone();
        match thread::Builder::new()
            .name("reschedule-round-robin".to_owned())
            .spawn(move || shared.run())
        {
            Ok(handle) => {
                *worker = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.shared.status.set(LoopState::Stopped);
                tracing::error!(?err, "Failed to spawn round robin loop thread");
                Err(SchedulerError::Spawn(err))
            }
        }
    }

    /// Run the loop on the calling thread until it is stopped from elsewhere.
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous execution context.
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

    /// Ask the loop to stop after the callback it is currently running.
    ///
    /// Returns immediately; the returned future resolves once the loop has exited. Queued
    /// one-shot callbacks are kept for the next start.
    pub fn signal_stop(&self) -> impl Future<Output = ()> {
        self.shared.request_stop()
    }

    /// Stop the loop and wait for its thread to exit.
    pub fn stop_and_block(&self) {
        drop(self.signal_stop());
        self.join();
    }

    /// Ask the loop to stop once every one-shot callback queued so far has run.
    ///
    /// Returns immediately; the returned future resolves once the loop has exited.
    pub fn signal_stop_after_drain(&self) -> impl Future<Output = ()> {
        self.shared.request_stop_after_drain()
    }

    /// Run every one-shot callback queued so far, then stop the loop and wait for its thread to
    /// exit.
    pub fn stop_after_drain_and_block(&self) {
        drop(self.signal_stop_after_drain());
        self.join();
    }

    /// A bridge that queues callbacks as one-shot items on this loop.
    ///
    /// The bridge does not keep the loop alive; once the loop is gone, work sent through the
    /// bridge is dropped and reported as cancelled.
    pub fn bridge(&self) -> ThreadAffinityBridge {
        ThreadAffinityBridge::new(Arc::new(LoopTarget {
            shared: Arc::downgrade(&self.shared),
        }))
    }

    /// Receive the [`SchedulerEvent::CallbackFailed`] events raised from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SchedulerEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> LoopState {
        self.shared.status.get()
    }

    pub fn is_running(&self) -> bool {
        self.state() == LoopState::Running
    }

    fn join(&self) {
        let handle = {
            let mut worker = lock(&self.worker);
            match worker.as_ref() {
                Some(handle) if handle.thread().id() == thread::current().id() => return,
                _ => worker.take(),
            }
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("Round robin loop thread panicked");
            }
        }
    }
}

impl Drop for RoundRobinLoop {
    fn drop(&mut self) {
        self.stop_and_block();
    }
}

impl AffinityTarget for RoundRobinLoop {
    fn post(&self, work: Work) {
        self.shared.enqueue(work);
    }
}

struct LoopTarget {
    shared: Weak<Shared>,
}

impl AffinityTarget for LoopTarget {
    fn post(&self, work: Work) {
        match self.shared.upgrade() {
            Some(shared) => shared.enqueue(work),
            None => tracing::warn!("Dropping work posted to a round robin loop that no longer exists"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::AtomicBool,
        time::Instant,
    };

    use assert_matches::assert_matches;

    use super::*;
    use crate::job::ErrorType;

    fn recorder() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn record(log: &Arc<Mutex<Vec<String>>>, entry: impl Into<String>) -> impl Fn() -> JobResult {
        let log = log.clone();
        let entry = entry.into();
        move || {
            log.lock().unwrap().push(entry.clone());
            Ok(())
        }
    }

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn one_shot_callbacks_run_in_order() {
        let scheduler = RoundRobinLoop::new();
        let log = recorder();
        (0..10).for_each(|i| scheduler.schedule_once(record(&log, i.to_string())));
        assert_eq!(scheduler.pending(), 10);

        scheduler.start().unwrap();
        scheduler.stop_after_drain_and_block();

        let expected: Vec<_> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(*log.lock().unwrap(), expected);
        assert_eq!(scheduler.pending(), 0);
        assert_eq!(scheduler.state(), LoopState::Stopped);
    }

    #[test]
    fn one_shot_callbacks_take_priority_over_recurring_ones() {
        let scheduler = RoundRobinLoop::new();
        let log = recorder();
        scheduler.schedule_loop(record(&log, "loop"));
        scheduler.schedule_once(record(&log, "first"));
        scheduler.schedule_once(record(&log, "second"));

        scheduler.start().unwrap();
        assert!(wait_until(|| log.lock().unwrap().len() >= 4));
        scheduler.stop_and_block();

        assert_eq!(log.lock().unwrap()[..3], ["first", "second", "loop"]);
    }

    #[test]
    fn recurring_callbacks_take_turns() {
        let scheduler = RoundRobinLoop::new();
        let log = recorder();
        let a = scheduler.schedule_loop(record(&log, "a"));
        scheduler.schedule_loop(record(&log, "b"));

        scheduler.start().unwrap();
        assert!(wait_until(|| log.lock().unwrap().len() >= 6));
        assert!(scheduler.unschedule_loop(a));
        assert!(!scheduler.unschedule_loop(a));
        scheduler.stop_and_block();

        let log = log.lock().unwrap();
        assert!(log[..6].windows(2).all(|pair| pair[0] != pair[1]));
    }

    #[test]
    fn failing_callbacks_are_reported_and_the_loop_continues() {
        let scheduler = RoundRobinLoop::new();
        let mut events = scheduler.subscribe();
        let log = recorder();
        scheduler.schedule_once(|| Err("failed".into()));
        scheduler.schedule_once(|| panic!("panicked"));
        scheduler.schedule_once(record(&log, "after"));

        scheduler.start().unwrap();
        scheduler.stop_after_drain_and_block();

        assert_eq!(*log.lock().unwrap(), ["after"]);
        assert_matches!(
            events.try_recv(),
            Ok(SchedulerEvent::CallbackFailed { error: ExecutionError { error_type: ErrorType::Failed, .. } })
        );
        assert_matches!(
            events.try_recv(),
            Ok(SchedulerEvent::CallbackFailed { error: ExecutionError { error_type: ErrorType::Panic, message } }) if message == "panicked"
        );
    }

    #[test]
    fn queued_callbacks_survive_a_restart() {
        let scheduler = RoundRobinLoop::new();
        scheduler.start().unwrap();
        scheduler.stop_and_block();
        scheduler.stop_and_block();

        let log = recorder();
        scheduler.schedule_once(record(&log, "queued"));
        assert_eq!(scheduler.pending(), 1);

        scheduler.start().unwrap();
        scheduler.stop_after_drain_and_block();
        assert_eq!(*log.lock().unwrap(), ["queued"]);
    }

    fn busy(started: &Arc<AtomicBool>) -> impl FnOnce() -> JobResult {
        let started = started.clone();
        move || {
            started.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(200));
            Ok(())
        }
    }

    #[test]
    fn start_while_stopping_starts_a_fresh_worker() {
        let scheduler = RoundRobinLoop::new();
        let started = Arc::new(AtomicBool::new(false));
        scheduler.schedule_once(busy(&started));
        scheduler.start().unwrap();
        assert!(wait_until(|| started.load(Ordering::SeqCst)));

        drop(scheduler.signal_stop());
        scheduler.start().unwrap();
        let log = recorder();
        scheduler.schedule_once(record(&log, "after restart"));

        assert!(wait_until(|| log.lock().unwrap().len() == 1));
        assert!(scheduler.is_running());
    }

    #[test]
    fn start_from_a_callback_withdraws_a_pending_stop() {
        let scheduler = Arc::new(RoundRobinLoop::new());
        let log = recorder();
        scheduler.schedule_once({
            let scheduler = Arc::downgrade(&scheduler);
            move || {
                if let Some(scheduler) = scheduler.upgrade() {
                    drop(scheduler.signal_stop());
                    scheduler.start()?;
                }
                Ok(())
            }
        });
        scheduler.schedule_once(record(&log, "after restart"));
        scheduler.start().unwrap();

        assert!(wait_until(|| log.lock().unwrap().len() == 1));
        assert!(scheduler.is_running());
    }

    #[test]
    fn drain_markers_do_not_outlive_their_run() {
        let scheduler = RoundRobinLoop::new();
        let started = Arc::new(AtomicBool::new(false));
        scheduler.schedule_once(busy(&started));
        scheduler.start().unwrap();
        assert!(wait_until(|| started.load(Ordering::SeqCst)));

        drop(scheduler.signal_stop_after_drain());
        scheduler.stop_and_block();
        assert_eq!(scheduler.state(), LoopState::Stopped);

        scheduler.start().unwrap();
        let log = recorder();
        scheduler.schedule_once(record(&log, "after restart"));

        assert!(wait_until(|| log.lock().unwrap().len() == 1));
        thread::sleep(Duration::from_millis(50));
        assert!(scheduler.is_running());
    }

    #[test]
    fn a_stopped_loop_is_not_sent_wake_ups() {
        let scheduler = RoundRobinLoop::new();
        scheduler.schedule_loop(|| Ok(()));
        drop(scheduler.signal_stop());
        scheduler.stop_and_block();

        let mut receiver = lock(&scheduler.shared.receiver);
        let receiver = receiver.as_mut().unwrap();
        assert_matches!(receiver.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn send_runs_on_the_loop_thread() {
        let scheduler = RoundRobinLoop::new();
        scheduler.start().unwrap();
        let bridge = scheduler.bridge();
        let ran_on = Arc::new(Mutex::new(None));

        bridge
            .send({
                let ran_on = ran_on.clone();
                move || {
                    *ran_on.lock().unwrap() = Some(thread::current().id());
                    Ok(())
                }
            })
            .unwrap();

        let ran_on = ran_on.lock().unwrap().unwrap();
        assert_ne!(ran_on, thread::current().id());
        let worker = scheduler.worker.lock().unwrap();
        assert_eq!(Some(ran_on), worker.as_ref().map(|handle| handle.thread().id()));
    }

    #[test]
    fn bridge_to_a_dropped_loop_is_cancelled() {
        let bridge = RoundRobinLoop::new().bridge();

        assert_matches!(
            bridge.send(|| Ok(())),
            Err(ExecutionError { error_type: ErrorType::Cancelled, .. })
        );
    }

    #[test]
    fn stopping_from_a_callback_does_not_deadlock() {
        let scheduler = Arc::new(RoundRobinLoop::new());
        scheduler.start().unwrap();

        scheduler.schedule_once({
            let scheduler = Arc::downgrade(&scheduler);
            move || {
                if let Some(scheduler) = scheduler.upgrade() {
                    scheduler.stop_and_block();
                }
                Ok(())
            }
        });

        assert!(wait_until(|| scheduler.state() == LoopState::Stopped));
    }

    #[tokio::test]
    async fn run_once_resolves_with_the_outcome() {
        let scheduler = RoundRobinLoop::new();
        scheduler.start().unwrap();

        assert_eq!(scheduler.run_once(|| Ok(42)).await.unwrap(), 42);
        assert_matches!(
            scheduler.run_once(|| Err::<(), _>("nope".into())).await,
            Err(ExecutionError { error_type: ErrorType::Failed, .. })
        );

        scheduler.signal_stop().await;
        assert_eq!(scheduler.state(), LoopState::Stopped);
        // Stopping a stopped loop resolves straight away.
        scheduler.signal_stop().await;
        scheduler.signal_stop_after_drain().await;
    }
}
