//! The purpose of this module is to alleviate the need to import many of the `[reschedule]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use reschedule::prelude::*;
//! ```
pub use crate::affinity::{AffinityTarget, ThreadAffinityBridge};
pub use crate::blocking::BlockingLoop;
pub use crate::cooperative::{CooperativeHandle, CooperativeLoop};
pub use crate::engine::ScheduleEngine;
pub use crate::event::SchedulerEvent;
pub use crate::job::{builder::JobBuilder, ErrorType, ExecutionError, Job, JobId, JobResult};
pub use crate::round_robin::{LoopId, RoundRobinLoop};
pub use crate::state::LoopState;
pub use crate::{SchedulerConfig, SchedulerError};
