use std::sync::atomic::{AtomicU8, Ordering};

/// The lifecycle of a loop.
///
/// `Stopped → Starting → Running → StopRequested → Stopped`. A loop only becomes
/// [`LoopState::Running`] once its worker has actually entered the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LoopState {
    Stopped,
    Starting,
    Running,
    StopRequested,
}

impl LoopState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::StopRequested,
            _ => Self::Stopped,
        }
    }
}

#[derive(Debug)]
pub(crate) struct LoopStatus(AtomicU8);

impl Default for LoopStatus {
    fn default() -> Self {
        Self(AtomicU8::new(LoopState::Stopped as u8))
    }
}

impl LoopStatus {
    pub(crate) fn get(&self) -> LoopState {
        LoopState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn set(&self, state: LoopState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Move from stopped to starting. Returns false if the loop was not stopped.
    pub(crate) fn try_start(&self) -> bool {
        self.transition(LoopState::Stopped, LoopState::Starting)
    }

    /// Called by the worker once it has entered its loop. Returns false if a stop was requested
    /// before the worker got going.
    pub(crate) fn enter_running(&self) -> bool {
        self.transition(LoopState::Starting, LoopState::Running)
    }

    /// Ask an active loop to stop. Returns false if the loop was not active.
    pub(crate) fn request_stop(&self) -> bool {
        self.transition(LoopState::Running, LoopState::StopRequested)
            || self.transition(LoopState::Starting, LoopState::StopRequested)
    }

    /// Withdraw a pending stop so the worker keeps going. Returns false if no stop was pending.
    pub(crate) fn resume(&self) -> bool {
        self.transition(LoopState::StopRequested, LoopState::Running)
    }

    pub(crate) fn is_stop_requested(&self) -> bool {
        self.get() == LoopState::StopRequested
    }

    pub(crate) fn is_active(&self) -> bool {
        self.get() != LoopState::Stopped
    }

    fn transition(&self, from: LoopState, to: LoopState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}
