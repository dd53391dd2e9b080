//! Running callbacks on a specific loop.
//!
//! A [`ThreadAffinityBridge`] lets code running anywhere hand a callback to a loop so that it
//! executes on that loop's own worker. This is what allows callbacks that share state with the
//! loop to touch that state without any further synchronisation.
//!
//! Any type implementing [`AffinityTarget`] can sit behind a bridge. Both
//! [`crate::round_robin::RoundRobinLoop`] (via [`crate::round_robin::RoundRobinLoop::bridge`])
//! and [`crate::engine::ScheduleEngine`] (via [`crate::engine::ScheduleEngine::bridge`]) are
//! targets.
//!
//! # Deadlocks
//!
//! [`ThreadAffinityBridge::send`] blocks the calling thread until the callback has run on the
//! target. Calling it from a callback that is itself running on the target loop waits on an item
//! queued behind the caller, which never runs. This is not detected, avoiding it is the
//! responsibility of the caller; use [`ThreadAffinityBridge::post`] from within the loop instead.
use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, PoisonError},
    task::{Context, Poll},
};

use futures::{
    future::BoxFuture,
    task::{waker_ref, ArcWake},
    FutureExt,
};
use tokio::sync::oneshot;

use crate::job::{runner::run_isolated, ExecutionError, JobResult};

/// A unit of work handed to an [`AffinityTarget`].
pub type Work = Box<dyn FnOnce() -> JobResult + Send>;

/// A loop that can accept callbacks to run on its own worker.
#[cfg_attr(test, mockall::automock)]
pub trait AffinityTarget: Send + Sync {
    /// Queue `work` to run on the target. Must not block waiting for it to run.
    fn post(&self, work: Work);
}

/// Marshals callbacks and futures onto an [`AffinityTarget`].
#[derive(Clone)]
pub struct ThreadAffinityBridge {
    target: Arc<dyn AffinityTarget>,
}

impl std::fmt::Debug for ThreadAffinityBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadAffinityBridge").finish_non_exhaustive()
    }
}

impl ThreadAffinityBridge {
    pub fn new(target: Arc<dyn AffinityTarget>) -> Self {
        Self { target }
    }

    /// Queue `work` on the target and return immediately.
    ///
    /// Failures are reported by the target, not to the caller.
    pub fn post<F>(&self, work: F)
    where
        F: FnOnce() -> JobResult + Send + 'static,
    {
        self.target.post(Box::new(work));
    }

    /// Queue `work` on the target and block until it has finished running there.
    ///
    /// The outcome of `work` is returned to the caller and is not reported by the target.
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous execution context; use
    /// [`ThreadAffinityBridge::send_async`] there. See the [module level docs](self) for the
    /// deadlock hazard of calling this from the target loop itself.
    pub fn send<F>(&self, work: F) -> Result<(), ExecutionError>
    where
        F: FnOnce() -> JobResult + Send + 'static,
    {
        self.queue_with_completion(work)
            .blocking_recv()
            .unwrap_or_else(|_| Err(ExecutionError::cancelled()))
    }

    /// Queue `work` on the target and return a future that resolves once it has run there.
    pub fn send_async<F>(&self, work: F) -> impl Future<Output = Result<(), ExecutionError>>
    where
        F: FnOnce() -> JobResult + Send + 'static,
    {
        let receiver = self.queue_with_completion(work);
        async move {
            receiver
                .await
                .unwrap_or_else(|_| Err(ExecutionError::cancelled()))
        }
    }

    /// Drive `future` on the target.
    ///
    /// The first poll, and every poll following a wake-up, is posted to the target, so each step
    /// of the future between suspension points runs on the target's worker. The returned future
    /// resolves with the outcome once `future` completes.
    pub fn spawn<Fut>(&self, future: Fut) -> impl Future<Output = Result<(), ExecutionError>>
    where
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        self.spawn_with(future.boxed(), move |result| {
            let _ = sender.send(result);
        });
        async move {
            receiver
                .await
                .unwrap_or_else(|_| Err(ExecutionError::cancelled()))
        }
    }

    /// Drive `future` on the target, handing its outcome to `on_complete` on the target's worker.
    pub(crate) fn spawn_with<C>(&self, future: BoxFuture<'static, JobResult>, on_complete: C)
    where
        C: FnOnce(Result<(), ExecutionError>) + Send + 'static,
    {
        let task = Arc::new(MarshaledTask {
            future: Mutex::new(Some(future)),
            on_complete: Mutex::new(Some(Box::new(on_complete))),
            target: self.target.clone(),
        });
        task.schedule();
    }

    fn queue_with_completion<F>(&self, work: F) -> oneshot::Receiver<Result<(), ExecutionError>>
    where
        F: FnOnce() -> JobResult + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        self.target.post(Box::new(move || {
            let _ = sender.send(run_isolated(work));
            Ok(())
        }));
        receiver
    }
}

type Completion = Box<dyn FnOnce(Result<(), ExecutionError>) + Send>;

struct MarshaledTask {
    future: Mutex<Option<BoxFuture<'static, JobResult>>>,
    on_complete: Mutex<Option<Completion>>,
    target: Arc<dyn AffinityTarget>,
}

impl MarshaledTask {
    fn schedule(self: &Arc<Self>) {
        let task = self.clone();
        self.target.post(Box::new(move || {
            task.poll();
            Ok(())
        }));
    }

    fn poll(self: &Arc<Self>) {
        let mut slot = self.future.lock().unwrap_or_else(PoisonError::into_inner);
        // Empty once complete; stray wake-ups after that are ignored.
        let Some(mut future) = slot.take() else {
            return;
        };
        let waker = waker_ref(self);
        let mut context = Context::from_waker(&waker);
        let result = match std::panic::catch_unwind(AssertUnwindSafe(|| {
            future.as_mut().poll(&mut context)
        })) {
            Ok(Poll::Pending) => {
                *slot = Some(future);
                return;
            }
            Ok(Poll::Ready(result)) => result.map_err(ExecutionError::from),
            Err(panic) => Err(ExecutionError::from_panic(panic)),
        };
        drop(slot);
        if let Some(on_complete) = self
            .on_complete
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            on_complete(result);
        }
    }
}

impl ArcWake for MarshaledTask {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.schedule();
    }
}
