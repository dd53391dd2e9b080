use chrono::{DateTime, TimeDelta, Utc};

use crate::affinity::ThreadAffinityBridge;

use super::{Action, Job};

/// Configures a [`Job`] before it is registered.
///
/// Obtained via [`Job::builder`], [`Job::builder_async`] or [`Job::with_state`]. By default a job
/// runs once, as soon as it is registered, inline on the loop driving its engine, and is allowed
/// to skip runs when it falls behind.
#[derive(Debug)]
pub struct JobBuilder {
    action: Action,
    first_run: DateTime<Utc>,
    interval: Option<TimeDelta>,
    can_skip: bool,
    run_detached: bool,
    affinity: Option<ThreadAffinityBridge>,
}

impl JobBuilder {
    pub(crate) fn new(action: Action) -> Self {
        Self {
            action,
            first_run: Utc::now(),
            interval: None,
            can_skip: true,
            run_detached: false,
            affinity: None,
        }
    }

    pub fn schedule_at(self, first_run: DateTime<Utc>) -> Self {
        Self { first_run, ..self }
    }

    pub fn schedule_in(self, delay: TimeDelta) -> Self {
        Self {
            first_run: Utc::now() + delay,
            ..self
        }
    }

    /// Run the job repeatedly, `interval` apart.
    pub fn with_interval(self, interval: TimeDelta) -> Self {
        Self {
            interval: Some(interval),
            ..self
        }
    }

    /// Whether the job may jump ahead to the next interval boundary when it falls behind.
    ///
    /// When `false` every missed run is executed, back to back, until the job has caught up.
    pub fn can_skip(self, can_skip: bool) -> Self {
        Self { can_skip, ..self }
    }

    /// Dispatch the job onto its own worker instead of running it inline on the loop.
    pub fn detached(self) -> Self {
        Self {
            run_detached: true,
            ..self
        }
    }

    /// Run the job on the loop behind `bridge` instead of on the loop that schedules it.
    ///
    /// Combined with [`JobBuilder::detached`] the job is posted to the bridge, otherwise the
    /// scheduling loop waits for the job to complete on the bridged loop.
    pub fn with_affinity(self, bridge: ThreadAffinityBridge) -> Self {
        Self {
            affinity: Some(bridge),
            ..self
        }
    }

    pub fn build(self) -> Job {
        Job::from_builder(
            self.action,
            self.first_run,
            self.interval,
            self.can_skip,
            self.run_detached,
            self.affinity,
        )
    }
}
