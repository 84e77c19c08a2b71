//! Bounded thread pool for blocking connection work.
//!
//! Admission follows the classic core/queue/max policy: a job starts a new thread
//! while fewer than `core_threads` exist, otherwise it is queued (handed straight
//! to an idle thread when there is one), and only when the queue is full does the
//! pool grow towards `max_threads`. Beyond that the job is rejected. Threads above
//! the core count exit after `keep_alive` without work.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

use crate::error::RejectedError;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Prefix of the worker thread names.
    pub name: String,
    pub core_threads: usize,
    pub max_threads: usize,
    pub queue_capacity: usize,
    pub keep_alive: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "sockkit-worker".into(),
            core_threads: 10,
            max_threads: 100,
            queue_capacity: 100,
            keep_alive: Duration::from_secs(60),
        }
    }
}

/// A cloneable handle to a bounded worker pool.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

struct Shared {
    config: PoolConfig,
    state: Mutex<State>,
    available: Condvar,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Job>,
    threads: usize,
    idle: usize,
    spawned: usize,
    shutdown: bool,
    handles: Vec<JoinHandle<()>>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("WorkerPool")
            .field("config", &self.shared.config)
            .field("threads", &state.threads)
            .field("queued", &state.queue.len())
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        let config = PoolConfig { max_threads: config.max_threads.max(config.core_threads).max(1), ..config };
        Self { shared: Arc::new(Shared { config, state: Mutex::new(State::default()), available: Condvar::new() }) }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Submits `job`, failing with [`RejectedError`] when the pool is saturated or shut down.
    pub fn execute<F>(&self, job: F) -> Result<(), RejectedError>
    where
        F: FnOnce() + Send + 'static,
    {
        let config = &self.shared.config;
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(RejectedError::Shutdown);
        }

        let job: Job = Box::new(job);
        if state.threads < config.core_threads {
            return self.spawn(&mut state, job);
        }

        if state.idle > state.queue.len() || state.queue.len() < config.queue_capacity {
            state.queue.push_back(job);
            drop(state);
            self.shared.available.notify_one();
            return Ok(());
        }

        if state.threads < config.max_threads {
            return self.spawn(&mut state, job);
        }

        Err(RejectedError::Saturated { threads: state.threads, queued: state.queue.len() })
    }

    /// Number of live worker threads.
    pub fn threads(&self) -> usize {
        self.shared.state.lock().threads
    }

    /// Number of jobs waiting for a thread.
    pub fn queued(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Stops admitting jobs, lets the queued ones finish and joins the workers.
    pub fn shutdown(&self) {
        let handles = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            std::mem::take(&mut state.handles)
        };
        self.shared.available.notify_all();

        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!(pool = %self.shared.config.name, "worker thread panicked");
            }
        }
        debug!(pool = %self.shared.config.name, "worker pool shut down");
    }

    fn spawn(&self, state: &mut State, first: Job) -> Result<(), RejectedError> {
        let shared = Arc::clone(&self.shared);
        let name = format!("{}-{}", self.shared.config.name, state.spawned);

        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || work(&shared, Some(first)))
            .map_err(|source| RejectedError::Spawn { source })?;

        state.threads += 1;
        state.spawned += 1;
        state.handles.retain(|handle| !handle.is_finished());
        state.handles.push(handle);
        trace!(pool = %self.shared.config.name, threads = state.threads, "worker thread started");
        Ok(())
    }
}

fn work(shared: &Shared, mut next: Option<Job>) {
    loop {
        if let Some(job) = next.take() {
            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                error!(pool = %shared.config.name, "job panicked");
            }
        }

        let mut state = shared.state.lock();
        loop {
            if let Some(job) = state.queue.pop_front() {
                next = Some(job);
                break;
            }
            if state.shutdown {
                state.threads -= 1;
                return;
            }

            state.idle += 1;
            let timed_out = if state.threads > shared.config.core_threads {
                shared.available.wait_for(&mut state, shared.config.keep_alive).timed_out()
            } else {
                shared.available.wait(&mut state);
                false
            };
            state.idle -= 1;

            if timed_out && state.queue.is_empty() && state.threads > shared.config.core_threads {
                state.threads -= 1;
                trace!(pool = %shared.config.name, threads = state.threads, "idle worker thread exited");
                return;
            }
        }
    }
}
