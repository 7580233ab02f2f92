use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, ensure};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

pub type Task = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

struct QueueState {
    deque: VecDeque<Task>,
    done: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    available: Condvar,
}

/// FIFO dispatcher over a fixed pool of worker threads.
pub struct TaskQueue {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pool_size: usize,
}

impl TaskQueue {
    pub fn new(pool_size: usize) -> Result<Self> {
        ensure!(pool_size > 0, "task queue needs at least one worker");

        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                deque: VecDeque::new(),
                done: false,
            }),
            available: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(pool_size);

        for index in 0..pool_size {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{index}"))
                .spawn(move || worker_loop(shared))
                .with_context(|| format!("failed to spawn worker {index}"))?;

            workers.push(handle);
        }

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            pool_size,
        })
    }

    /// Appends to the tail and wakes one idle worker. Never blocks beyond the
    /// queue lock; after shutdown the task is dropped unexecuted.
    pub fn push<F>(&self, task: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let mut state = self.shared.state.lock();

        if state.done {
            drop(state);
            debug!("task queue is shut down; dropping task");

            return;
        }

        state.deque.push_back(Box::new(task));
        drop(state);

        self.shared.available.notify_one();
    }

    /// One-time signal. Queued tasks that have not started are discarded;
    /// tasks already running finish.
    pub fn shutdown(&self) {
        let discarded = {
            let mut state = self.shared.state.lock();

            if state.done {
                return;
            }

            state.done = true;
            std::mem::take(&mut state.deque)
        };

        self.shared.available.notify_all();

        if !discarded.is_empty() {
            debug!(discarded = discarded.len(), "task queue shut down with pending tasks");
        }
    }

    /// Joins every worker. A worker never joins itself.
    pub fn join(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();

        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }

            if handle.join().is_err() {
                error!("task queue worker exited by panic");
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.state.lock().done
    }

    pub fn pending(&self) -> usize {
        self.shared.state.lock().deque.len()
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.shutdown();
        self.join();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut state = shared.state.lock();

            while !state.done && state.deque.is_empty() {
                shared.available.wait(&mut state);
            }

            if state.done {
                return;
            }

            match state.deque.pop_front() {
                Some(task) => task,
                None => continue,
            }
        };

        run_task(task);
    }
}

fn run_task(task: Task) {
    match panic::catch_unwind(AssertUnwindSafe(task)) {
        Ok(Ok(())) => {}
        Ok(Err(error)) => error!("task failed: {error:#}"),
        Err(payload) => error!(panic = %panic_message(payload.as_ref()), "task panicked"),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return message.to_string();
    }

    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }

    "unknown".to_string()
}
