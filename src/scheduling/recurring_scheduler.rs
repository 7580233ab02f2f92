use std::collections::{BTreeMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace};

use crate::scheduling::task_queue::{TaskQueue, panic_message};
use crate::scheduling::types::{Job, Token};

/// Fire-time collisions are pushed forward by this much until the key is free.
pub const COLLISION_STEP: Duration = Duration::from_millis(1);

/// Pending jobs keyed by fire time. Keys are unique, so iteration order is the
/// firing order.
#[derive(Debug, Default)]
pub struct ScheduleMap {
    jobs: BTreeMap<Instant, Job>,
}

impl ScheduleMap {
    /// Stores `job` at the first free instant at or after `at` and returns it.
    pub fn insert_at(&mut self, at: Instant, job: Job) -> Instant {
        let mut at = at;

        while self.jobs.contains_key(&at) {
            at += COLLISION_STEP;
        }

        self.jobs.insert(at, job);

        at
    }

    pub fn earliest(&self) -> Option<Instant> {
        self.jobs.keys().next().copied()
    }

    pub fn pop_earliest(&mut self) -> Option<Job> {
        self.jobs.pop_first().map(|(_, job)| job)
    }

    /// Linear scan; job counts are small.
    pub fn remove(&mut self, token: Token) -> Option<Job> {
        let at = self
            .jobs
            .iter()
            .find(|(_, job)| job.token == token)
            .map(|(at, _)| *at)?;

        self.jobs.remove(&at)
    }

    pub fn contains(&self, token: Token) -> bool {
        self.jobs.values().any(|job| job.token == token)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[derive(Default)]
struct ScheduleState {
    jobs: ScheduleMap,
    in_flight: HashSet<Token>,
    cancelled: HashSet<Token>,
}

/// Periodic job timer. `run` owns one dedicated thread; due jobs execute on
/// the task queue and are rescheduled from the time they finish.
pub struct RecurringScheduler {
    queue: Arc<TaskQueue>,
    state: Mutex<ScheduleState>,
    wakeup: Condvar,
    next_id: AtomicU64,
    done: AtomicBool,
    running: AtomicBool,
}

impl RecurringScheduler {
    pub fn new(queue: Arc<TaskQueue>) -> Arc<Self> {
        Arc::new(Self {
            queue,
            state: Mutex::new(ScheduleState::default()),
            wakeup: Condvar::new(),
            next_id: AtomicU64::new(0),
            done: AtomicBool::new(false),
            running: AtomicBool::new(true),
        })
    }

    pub fn insert<F>(&self, interval: Duration, function: F) -> Token
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.insert_job_at(Instant::now() + interval, interval, function)
    }

    fn insert_job_at<F>(&self, at: Instant, interval: Duration, function: F) -> Token
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        let token = Token::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let job = Job {
            token,
            interval,
            function: Arc::new(function),
        };

        let mut state = self.state.lock();
        state.jobs.insert_at(at, job);
        self.wakeup.notify_one();

        token
    }

    /// Fires the job now, out of band, and restarts its cadence from when it
    /// finishes. Unknown or in-flight tokens are ignored.
    pub fn invoke(self: &Arc<Self>, token: Token) {
        let job = {
            let mut state = self.state.lock();
            let Some(job) = state.jobs.remove(token) else {
                return;
            };

            state.in_flight.insert(token);
            self.wakeup.notify_one();

            job
        };

        self.dispatch(job);
    }

    /// Removes the job permanently. A job that is executing right now is not
    /// put back once it finishes.
    pub fn erase(&self, token: Token) {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.jobs.remove(token);

            if removed.is_none() && state.in_flight.contains(&token) {
                state.cancelled.insert(token);
            }

            self.wakeup.notify_one();

            removed
        };

        drop(removed);
    }

    /// Idempotent; safe from any thread, including a job body. Jobs already
    /// handed to the queue still run but are not rescheduled.
    pub fn terminate(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("recurring scheduler terminating");

        let _state = self.state.lock();
        self.wakeup.notify_all();
    }

    /// Stops firing without touching due times; on resume every job whose time
    /// passed is due at once.
    pub fn pause(&self) {
        let _state = self.state.lock();

        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.wakeup.notify_one();
    }

    pub fn resume(&self) {
        let _state = self.state.lock();

        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        self.wakeup.notify_one();
    }

    pub fn done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_scheduled(&self, token: Token) -> bool {
        self.state.lock().jobs.contains(token)
    }

    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn run(self: &Arc<Self>) {
        debug!("recurring scheduler loop started");

        loop {
            let job = {
                let mut state = self.state.lock();

                if self.done() {
                    break;
                }

                match self.next_wakeup(&state) {
                    Some(deadline) => {
                        self.wakeup.wait_until(&mut state, deadline);
                    }
                    None => self.wakeup.wait(&mut state),
                }

                if self.done() {
                    break;
                }

                let due = match state.jobs.earliest() {
                    Some(earliest) => self.running() && earliest <= Instant::now(),
                    None => false,
                };

                if !due {
                    continue;
                }

                let Some(job) = state.jobs.pop_earliest() else {
                    continue;
                };

                state.in_flight.insert(job.token);

                job
            };

            self.dispatch(job);
        }

        debug!("recurring scheduler loop finished");
    }

    fn next_wakeup(&self, state: &ScheduleState) -> Option<Instant> {
        if !self.running() {
            return None;
        }

        state.jobs.earliest()
    }

    fn dispatch(self: &Arc<Self>, job: Job) {
        let scheduler: Weak<Self> = Arc::downgrade(self);

        trace!(token = %job.token, "dispatching job");

        self.queue.push(move || {
            execute(&job);

            if let Some(scheduler) = scheduler.upgrade() {
                scheduler.reschedule(job);
            }

            Ok(())
        });
    }

    fn reschedule(&self, job: Job) {
        let dropped = {
            let mut state = self.state.lock();

            state.in_flight.remove(&job.token);

            if state.cancelled.remove(&job.token) || self.done() {
                Some(job)
            } else {
                state.jobs.insert_at(Instant::now() + job.interval, job);
                self.wakeup.notify_one();

                None
            }
        };

        drop(dropped);
    }
}

impl Drop for RecurringScheduler {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn execute(job: &Job) {
    match panic::catch_unwind(AssertUnwindSafe(|| (job.function)())) {
        Ok(Ok(())) => {}
        Ok(Err(error)) => error!(token = %job.token, "job failed: {error:#}"),
        Err(payload) => {
            error!(token = %job.token, panic = %panic_message(payload.as_ref()), "job panicked")
        }
    }
}
