//! Tuning options shared by an engine and the loops driving it.
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

/// Configuration for a [`crate::engine::ScheduleEngine`] and its loops.
///
/// Every field falls back to its default when missing from a serialized configuration.
///
/// ```
/// # use reschedule::SchedulerConfig;
/// use std::time::Duration;
///
/// let config = SchedulerConfig::default()
///     .with_precision(Duration::from_millis(10))
///     .with_interrupt_on_change(false);
///
/// assert_eq!(config.precision(), Duration::from_millis(10));
/// assert!(!config.interrupt_on_change);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Polling and wake granularity of the loops, in milliseconds.
    pub precision_ms: u64,
    /// How late a job may start before a running-behind event is raised, in milliseconds.
    pub min_precision_ms: u64,
    /// Whether registering or removing a job wakes a waiting loop immediately.
    pub interrupt_on_change: bool,
    /// Whether the cooperative loop sizes its waits by the next due job instead of always
    /// waiting for `precision`.
    pub use_adaptive_delay: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            precision_ms: 100,
            min_precision_ms: 2000,
            interrupt_on_change: true,
            use_adaptive_delay: true,
        }
    }
}

/// Whole milliseconds in `duration`, rounded up and saturating at `u64::MAX`.
const fn millis_ceil(duration: Duration) -> u64 {
    let mut millis = duration.as_millis();
    if duration.subsec_nanos() % 1_000_000 != 0 {
        millis += 1;
    }
    if millis > u64::MAX as u128 {
        u64::MAX
    } else {
        millis as u64
    }
}

impl SchedulerConfig {
    /// Sub-millisecond precisions are rounded up; the loops never poll more often than once a
    /// millisecond.
    pub const fn with_precision(self, precision: Duration) -> Self {
        Self {
            precision_ms: millis_ceil(precision),
            ..self
        }
    }

    pub const fn with_min_precision(self, min_precision: Duration) -> Self {
        Self {
            min_precision_ms: millis_ceil(min_precision),
            ..self
        }
    }

    pub const fn with_interrupt_on_change(self, interrupt_on_change: bool) -> Self {
        Self {
            interrupt_on_change,
            ..self
        }
    }

    pub const fn with_adaptive_delay(self, use_adaptive_delay: bool) -> Self {
        Self {
            use_adaptive_delay,
            ..self
        }
    }

    pub fn precision(&self) -> Duration {
        Duration::from_millis(self.precision_ms.max(1))
    }

    pub fn min_precision(&self) -> TimeDelta {
        TimeDelta::milliseconds(i64::try_from(self.min_precision_ms).unwrap_or(i64::MAX))
    }
}
