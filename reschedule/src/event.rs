//! Notifications raised by engines and loops.
use std::sync::{Mutex, PoisonError};

use chrono::TimeDelta;
use tokio::sync::mpsc;

use crate::job::{ExecutionError, JobId};

/// Something host code may want to know about that is not returned from any call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// A job failed. Emitted once per failing invocation.
    JobFailed { job_id: JobId, error: ExecutionError },
    /// A job started more than the configured minimum precision after it was due.
    RunningBehind { job_id: JobId, lateness: TimeDelta },
    /// A callback run by a [`crate::round_robin::RoundRobinLoop`] failed.
    CallbackFailed { error: ExecutionError },
}

/// Fan-out of events to every live subscriber.
pub(crate) struct Subscribers<T> {
    senders: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> Subscribers<T> {
    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.lock().push(sender);
        receiver
    }

    /// Deliver `event` to every subscriber, forgetting those that have hung up.
    pub(crate) fn emit(&self, event: T) {
        self.lock()
            .retain(|sender| sender.send(event.clone()).is_ok());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<T>>> {
        self.senders.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
