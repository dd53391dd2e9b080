//! The ordered collection of pending jobs.
//!
//! A [`ScheduleEngine`] does not run anything by itself, it only knows what is due and when.
//! One of the loops ([`crate::blocking::BlockingLoop`] or [`crate::cooperative::CooperativeLoop`])
//! drives it.
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::mpsc;

use crate::{
    affinity::{AffinityTarget, ThreadAffinityBridge, Work},
    event::{SchedulerEvent, Subscribers},
    job::{ExecutionError, Job, JobId},
    notifier::Notify,
    SchedulerConfig, SchedulerError,
};

/// Compute the run following `last` for a job repeating every `interval`.
///
/// Without `skip` this is always `last + interval`, even when that is already in the past, so a
/// job that fell behind runs back to back until it has caught up. With `skip` it is the first
/// boundary `last + k * interval` strictly after `now`, so missed runs are dropped.
///
/// ```
/// # use reschedule::engine::catch_up;
/// use chrono::{TimeDelta, TimeZone, Utc};
///
/// let last = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
/// let now = last + TimeDelta::seconds(35);
///
/// assert_eq!(catch_up(last, TimeDelta::seconds(10), true, now), last + TimeDelta::seconds(40));
/// assert_eq!(catch_up(last, TimeDelta::seconds(10), false, now), last + TimeDelta::seconds(10));
/// ```
pub fn catch_up(
    last: DateTime<Utc>,
    interval: TimeDelta,
    skip: bool,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let offset = if skip && now >= last {
        let interval_us = interval.num_microseconds().unwrap_or(i64::MAX).max(1);
        let elapsed_us = (now - last).num_microseconds().unwrap_or(i64::MAX);
        TimeDelta::microseconds((elapsed_us / interval_us + 1).saturating_mul(interval_us))
    } else {
        interval
    };
    last.checked_add_signed(offset)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

struct Entry {
    job: Job,
    next_run: DateTime<Utc>,
    sequence: u64,
}

impl Entry {
    fn key(&self) -> (DateTime<Utc>, u64) {
        (self.next_run, self.sequence)
    }
}

struct Inner {
    entries: Mutex<Vec<Entry>>,
    sequence: AtomicU64,
    config: SchedulerConfig,
    events: Subscribers<SchedulerEvent>,
    wakers: Mutex<Vec<Weak<dyn Notify>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let entries = self
            .entries
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        entries.drain(..).for_each(|entry| entry.job.release());
    }
}

/// Owns registered [`Job`]s, ordered by when they are next due.
///
/// Cloning the engine is cheap, every clone refers to the same collection. When the last clone is
/// dropped every job it still owns is released and may be registered elsewhere.
///
/// # Example
///
/// ```
/// # use reschedule::prelude::*;
/// use std::time::Duration;
///
/// let engine = ScheduleEngine::new(SchedulerConfig::default());
/// let job = Job::builder(|| Ok(())).build();
///
/// engine.register(&job).unwrap();
/// assert_eq!(engine.peek_due(Duration::from_millis(100)), Some(job.clone()));
///
/// engine.unregister(&job);
/// assert!(engine.is_empty());
/// assert!(!job.is_registered());
/// ```
#[derive(Clone)]
pub struct ScheduleEngine {
    inner: Arc<Inner>,
}

impl Default for ScheduleEngine {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl std::fmt::Debug for ScheduleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleEngine")
            .field("config", &self.inner.config)
            .field("jobs", &self.len())
            .finish()
    }
}

impl ScheduleEngine {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(Vec::new()),
                sequence: AtomicU64::new(0),
                config,
                events: Subscribers::default(),
                wakers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Take ownership of `job` and schedule its first run.
    ///
    /// A repeating job that may skip and whose first run is already in the past is moved forward
    /// to its next interval boundary after now.
    ///
    /// # Errors
    ///
    /// Fails if the job is already registered with any engine or has a non-positive interval.
    pub fn register(&self, job: &Job) -> Result<(), SchedulerError> {
        let first_run = job.claim()?;
        let entry = self.entry(job, first_run, Utc::now());
        let job_id = job.id();
        let next_run = entry.next_run;
        insert_sorted(&mut self.lock(), entry);
        tracing::debug!(%job_id, %next_run, "Registered job {job_id} to run at {next_run}");
        self.notify_change();
        Ok(())
    }

    /// Register every job in `jobs` with a single update of the collection.
    ///
    /// # Errors
    ///
    /// If any job cannot be registered none of them are.
    pub fn register_many(&self, jobs: &[Job]) -> Result<(), SchedulerError> {
        let mut first_runs = Vec::with_capacity(jobs.len());
        for job in jobs {
            match job.claim() {
                Ok(first_run) => first_runs.push(first_run),
                Err(error) => {
                    jobs[..first_runs.len()].iter().for_each(Job::release);
                    return Err(error);
                }
            }
        }
        let now = Utc::now();
        {
            let mut entries = self.lock();
            entries.extend(
                jobs.iter()
                    .zip(first_runs)
                    .map(|(job, first_run)| self.entry(job, first_run, now)),
            );
            entries.sort_by_key(Entry::key);
        }
        tracing::debug!("Registered {} jobs", jobs.len());
        self.notify_change();
        Ok(())
    }

    /// Remove `job` from the engine. Has no effect if this engine does not own the job.
    pub fn unregister(&self, job: &Job) {
        self.unregister_many(std::slice::from_ref(job));
    }

    pub fn unregister_many(&self, jobs: &[Job]) {
        let removed = {
            let mut entries = self.lock();
            let before = entries.len();
            entries.retain(|entry| {
                let remove = jobs.contains(&entry.job);
                if remove {
                    entry.job.release();
                }
                !remove
            });
            before - entries.len()
        };
        if removed > 0 {
            tracing::debug!("Unregistered {removed} jobs");
            self.notify_change();
        }
    }

    /// Unregister every job.
    pub fn clear(&self) {
        let entries = std::mem::take(&mut *self.lock());
        if !entries.is_empty() {
            entries.iter().for_each(|entry| entry.job.release());
            self.notify_change();
        }
    }

    /// Re-sort the collection.
    pub fn reload(&self) {
        self.lock().sort_by_key(Entry::key);
        self.notify_change();
    }

    /// The earliest job, if it is due before `now + window`.
    pub fn peek_due(&self, window: Duration) -> Option<Job> {
        self.peek_due_at(window, Utc::now())
            .map(|(job, _)| job)
    }

    /// The job a loop should dispatch now, raising running-behind for it if it is late.
    pub(crate) fn take_due(&self, window: Duration) -> Option<Job> {
        let now = Utc::now();
        let (job, next_run) = self.peek_due_at(window, now)?;
        let lateness = now - next_run;
        if lateness > self.inner.config.min_precision() {
            let job_id = job.id();
            tracing::warn!(%job_id, %lateness, "Job {job_id} is running {lateness} behind");
            self.inner
                .events
                .emit(SchedulerEvent::RunningBehind { job_id, lateness });
        }
        Some(job)
    }

    /// Update `job` after it ran: schedule its next run, or retire it if it does not repeat.
    ///
    /// The next run is computed from the run that was due, not from when the job finished, so
    /// the cadence does not drift.
    pub fn reschedule(&self, job: &Job) {
        let now = Utc::now();
        let mut entries = self.lock();
        let Some(index) = entries.iter().position(|entry| entry.job == *job) else {
            return;
        };
        let mut entry = entries.remove(index);
        match job.interval() {
            Some(interval) => {
                entry.next_run = catch_up(entry.next_run, interval, job.can_skip(), now);
                tracing::trace!(job_id = %job.id(), next_run = %entry.next_run, "Rescheduled job");
                insert_sorted(&mut entries, entry);
            }
            None => {
                tracing::trace!(job_id = %job.id(), "Retired job");
                entry.job.release();
            }
        }
    }

    /// When the earliest job is due.
    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        self.lock().first().map(|entry| entry.next_run)
    }

    pub fn next_run_of(&self, job: &Job) -> Option<DateTime<Utc>> {
        self.lock()
            .iter()
            .find(|entry| entry.job == *job)
            .map(|entry| entry.next_run)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// A snapshot of the registered jobs, in the order they are due.
    pub fn jobs(&self) -> Vec<Job> {
        self.lock().iter().map(|entry| entry.job.clone()).collect()
    }

    /// Receive the [`SchedulerEvent`]s raised from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    /// A bridge that runs callbacks as one-shot jobs on whichever loop drives this engine.
    ///
    /// The bridge does not keep the engine alive; once the engine is gone, work sent through the
    /// bridge is dropped and reported as cancelled.
    pub fn bridge(&self) -> ThreadAffinityBridge {
        ThreadAffinityBridge::new(Arc::new(EngineTarget {
            inner: Arc::downgrade(&self.inner),
        }))
    }

    pub(crate) fn enroll(&self, waker: Arc<dyn Notify>) {
        self.inner
            .wakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&waker));
    }

    pub(crate) fn report_error(&self, job_id: JobId, error: ExecutionError) {
        tracing::error!(
            %job_id,
            ?error,
            "Job {job_id} failed: error type: {}, message: {}",
            error.error_type,
            error.message
        );
        self.inner
            .events
            .emit(SchedulerEvent::JobFailed { job_id, error });
    }

    fn peek_due_at(&self, window: Duration, now: DateTime<Utc>) -> Option<(Job, DateTime<Utc>)> {
        let deadline = TimeDelta::from_std(window)
            .ok()
            .and_then(|window| now.checked_add_signed(window))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.lock()
            .first()
            .filter(|entry| entry.next_run < deadline)
            .map(|entry| (entry.job.clone(), entry.next_run))
    }

    fn entry(&self, job: &Job, first_run: DateTime<Utc>, now: DateTime<Utc>) -> Entry {
        let next_run = match job.interval() {
            Some(interval) if job.can_skip() && first_run < now => {
                catch_up(first_run, interval, true, now)
            }
            _ => first_run,
        };
        Entry {
            job: job.clone(),
            next_run,
            sequence: self.inner.sequence.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn notify_change(&self) {
        if !self.inner.config.interrupt_on_change {
            return;
        }
        self.inner
            .wakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|waker| match waker.upgrade() {
                Some(waker) => {
                    waker.notify();
                    true
                }
                None => false,
            });
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn insert_sorted(entries: &mut Vec<Entry>, entry: Entry) {
    let key = entry.key();
    let index = entries.partition_point(|existing| existing.key() <= key);
    entries.insert(index, entry);
}

impl AffinityTarget for ScheduleEngine {
    fn post(&self, work: Work) {
        let job = Job::once(work);
        if let Err(err) = self.register(&job) {
            tracing::error!(?err, "Failed to register posted work: {err}");
        }
    }
}

struct EngineTarget {
    inner: Weak<Inner>,
}

impl AffinityTarget for EngineTarget {
    fn post(&self, work: Work) {
        match self.inner.upgrade() {
            Some(inner) => ScheduleEngine { inner }.post(work),
            None => tracing::warn!("Dropping work posted to an engine that no longer exists"),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    use super::*;
    use crate::{job::ErrorType, notifier::Signal};

    fn noop() -> Job {
        Job::builder(|| Ok(())).build()
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + TimeDelta::seconds(seconds)
    }

    #[test]
    fn catch_up_skips_to_the_first_boundary_after_now() {
        let interval = TimeDelta::seconds(10);

        assert_eq!(catch_up(at(0), interval, true, at(35)), at(40));
        assert_eq!(catch_up(at(0), interval, true, at(30)), at(40));
        assert_eq!(catch_up(at(0), interval, true, at(3)), at(10));
        assert_eq!(catch_up(at(20), interval, true, at(3)), at(30));
    }

    #[test]
    fn catch_up_without_skip_drains_every_interval() {
        let interval = TimeDelta::seconds(10);

        assert_eq!(catch_up(at(0), interval, false, at(35)), at(10));
        assert_eq!(catch_up(at(10), interval, false, at(35)), at(20));
    }

    #[test]
    fn registration_catches_up_skippable_jobs_in_the_past() {
        let engine = ScheduleEngine::default();
        let first_run = Utc::now() - TimeDelta::seconds(25);
        let interval = TimeDelta::seconds(10);
        let skipping = Job::builder(|| Ok(()))
            .schedule_at(first_run)
            .with_interval(interval)
            .build();
        let draining = Job::builder(|| Ok(()))
            .schedule_at(first_run)
            .with_interval(interval)
            .can_skip(false)
            .build();
        let once = Job::builder(|| Ok(())).schedule_at(first_run).build();

        engine
            .register_many(&[skipping.clone(), draining.clone(), once.clone()])
            .unwrap();

        assert_eq!(
            engine.next_run_of(&skipping),
            Some(first_run + TimeDelta::seconds(30))
        );
        assert_eq!(engine.next_run_of(&draining), Some(first_run));
        assert_eq!(engine.next_run_of(&once), Some(first_run));
    }

    #[test]
    fn jobs_are_ordered_by_next_run_then_registration() {
        let engine = ScheduleEngine::default();
        let soon = Utc::now() + TimeDelta::minutes(1);
        let later = Job::builder(|| Ok(()))
            .schedule_at(soon + TimeDelta::minutes(1))
            .build();
        let first = Job::builder(|| Ok(())).schedule_at(soon).build();
        let second = Job::builder(|| Ok(())).schedule_at(soon).build();

        engine.register(&later).unwrap();
        engine.register(&first).unwrap();
        engine.register(&second).unwrap();
        engine.reload();

        assert_eq!(engine.jobs(), vec![first, second, later]);
        assert_eq!(engine.next_run(), Some(soon));
    }

    #[test]
    fn peek_due_respects_the_window() {
        let engine = ScheduleEngine::default();
        let job = Job::builder(|| Ok(()))
            .schedule_in(TimeDelta::milliseconds(500))
            .build();
        engine.register(&job).unwrap();

        assert_eq!(engine.peek_due(Duration::from_millis(10)), None);
        assert_eq!(engine.peek_due(Duration::from_secs(5)), Some(job));
    }

    #[test]
    fn one_shot_jobs_are_retired_after_running() {
        let engine = ScheduleEngine::default();
        let job = noop();
        engine.register(&job).unwrap();

        let due = engine.take_due(Duration::from_millis(100)).unwrap();
        engine.reschedule(&due);

        assert_eq!(engine.peek_due(Duration::from_secs(60)), None);
        assert!(!job.is_registered());
        // Rescheduling a job the engine no longer owns does nothing.
        engine.reschedule(&job);
        assert!(engine.is_empty());
    }

    #[test]
    fn recurring_jobs_are_rescheduled_from_their_due_time() {
        let engine = ScheduleEngine::default();
        let first_run = Utc::now() + TimeDelta::hours(1);
        let job = Job::builder(|| Ok(()))
            .schedule_at(first_run)
            .with_interval(TimeDelta::minutes(5))
            .build();
        engine.register(&job).unwrap();

        engine.reschedule(&job);
        engine.reschedule(&job);

        assert_eq!(
            engine.next_run_of(&job),
            Some(first_run + TimeDelta::minutes(10))
        );
        assert!(job.is_registered());
    }

    #[test]
    fn unregister_is_idempotent() {
        let engine = ScheduleEngine::default();
        let other = ScheduleEngine::default();
        let job = noop();
        engine.register(&job).unwrap();

        other.unregister(&job);
        assert!(job.is_registered());

        engine.unregister(&job);
        engine.unregister(&job);
        assert!(!job.is_registered());
        assert!(engine.is_empty());
    }

    #[test]
    fn a_job_belongs_to_one_engine_at_a_time() {
        let engine = ScheduleEngine::default();
        let other = ScheduleEngine::default();
        let job = noop();
        engine.register(&job).unwrap();

        assert_matches!(engine.register(&job), Err(SchedulerError::AlreadyRegistered(id)) if id == job.id());
        assert_matches!(other.register(&job), Err(SchedulerError::AlreadyRegistered(_)));

        engine.unregister(&job);
        assert!(other.register(&job).is_ok());
    }

    #[test]
    fn failed_batch_registration_registers_nothing() {
        let engine = ScheduleEngine::default();
        let taken = noop();
        engine.register(&taken).unwrap();
        let fresh = noop();

        let result = ScheduleEngine::default().register_many(&[fresh.clone(), taken]);

        assert_matches!(result, Err(SchedulerError::AlreadyRegistered(_)));
        assert!(!fresh.is_registered());
    }

    #[test]
    fn clear_and_drop_release_jobs() {
        let engine = ScheduleEngine::default();
        let first = noop();
        let second = noop();
        engine.register_many(&[first.clone(), second.clone()]).unwrap();

        engine.clear();
        assert!(!first.is_registered());
        assert!(engine.is_empty());

        engine.register(&second).unwrap();
        drop(engine);
        assert!(!second.is_registered());
    }

    #[test]
    fn late_jobs_raise_running_behind() {
        let engine =
            ScheduleEngine::new(SchedulerConfig::default().with_min_precision(Duration::ZERO));
        let mut events = engine.subscribe();
        let job = Job::builder(|| Ok(()))
            .schedule_at(Utc::now() - TimeDelta::seconds(1))
            .build();
        engine.register(&job).unwrap();

        assert_eq!(engine.take_due(Duration::from_millis(100)), Some(job.clone()));

        assert_matches!(
            events.try_recv(),
            Ok(SchedulerEvent::RunningBehind { job_id, lateness })
                if job_id == job.id() && lateness >= TimeDelta::seconds(1)
        );
    }

    #[test]
    fn changes_wake_enrolled_loops() {
        let engine = ScheduleEngine::default();
        let signal = Arc::new(Signal::default());
        engine.enroll(signal.clone());

        engine.register(&noop()).unwrap();

        assert!(signal.wait_timeout(Duration::ZERO));
    }

    #[test]
    fn changes_do_not_wake_loops_when_interrupts_are_disabled() {
        let engine =
            ScheduleEngine::new(SchedulerConfig::default().with_interrupt_on_change(false));
        let signal = Arc::new(Signal::default());
        engine.enroll(signal.clone());

        engine.register(&noop()).unwrap();

        assert!(!signal.wait_timeout(Duration::ZERO));
    }

    #[test]
    fn work_posted_through_the_bridge_becomes_a_one_shot_job() {
        let engine = ScheduleEngine::default();
        let ran = Arc::new(AtomicU64::new(0));

        engine.bridge().post({
            let ran = ran.clone();
            move || {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let job = engine.take_due(Duration::from_millis(100)).unwrap();
        assert_eq!(job.interval(), None);
        crate::job::runner::JobRunner::new(engine.clone()).execute_blocking(job);

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(engine.is_empty());
    }

    #[test]
    fn sending_to_a_dropped_engine_is_cancelled() {
        let bridge = ScheduleEngine::default().bridge();

        assert_matches!(
            bridge.send(|| Ok(())),
            Err(ExecutionError { error_type: ErrorType::Cancelled, .. })
        );
    }
}
