use std::{
    sync::{Condvar, Mutex, PoisonError},
    time::Duration,
};

/// Something that can be woken when the set of scheduled jobs changes.
pub(crate) trait Notify: Send + Sync {
    fn notify(&self);
}

impl Notify for tokio::sync::Notify {
    fn notify(&self) {
        self.notify_one();
    }
}

/// A wake signal for loops running on a dedicated thread.
///
/// Auto-resetting: a wait consumes the signal, and a signal set while nobody is waiting is
/// consumed by the next wait.
#[derive(Default)]
pub(crate) struct Signal {
    set: Mutex<bool>,
    condvar: Condvar,
}

impl Signal {
    pub(crate) fn set(&self) {
        *self.set.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.condvar.notify_all();
    }

    /// Wait until the signal is set or `timeout` elapses. Returns whether the signal was set.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.set.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut set, _) = self
            .condvar
            .wait_timeout_while(guard, timeout, |set| !*set)
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *set)
    }
}

impl Notify for Signal {
    fn notify(&self) {
        self.set();
    }
}
