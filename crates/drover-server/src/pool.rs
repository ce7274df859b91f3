//! Bounded thread pool that executes application work inside one process.
//!
//! Work is dispatched FIFO. The pool keeps `min_threads` threads alive, grows
//! lazily up to `max_threads` when work is queued faster than idle threads can
//! take it, and lets threads above the minimum exit after sitting idle for
//! `idle_timeout`.
//!
//! All counters live under one mutex so [`ThreadPool::status`] always sees a
//! consistent snapshot.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use drover_types::{DroverError, PoolStatus};

/// A unit of work. Errors are logged by the pool thread.
pub type Job = Box<dyn FnOnce() -> Result<(), String> + Send + 'static>;

/// Thread pool sizing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_threads: usize,
    pub max_threads: usize,
    pub idle_timeout: Duration,
    /// Thread name prefix.
    pub name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_threads: 0,
            max_threads: 16,
            idle_timeout: Duration::from_secs(60),
            name: "drover-pool".into(),
        }
    }
}

struct PoolState {
    queue: VecDeque<Job>,
    /// Threads alive.
    spawned: usize,
    /// Threads parked waiting for work.
    waiting: usize,
    /// Threads executing a job.
    busy: usize,
    min_threads: usize,
    max_threads: usize,
    shutdown: bool,
    handles: Vec<JoinHandle<()>>,
    next_id: usize,
}

struct Shared {
    state: Mutex<PoolState>,
    /// Signalled when work is queued or the pool closes.
    work_ready: Condvar,
    /// Signalled when a job finishes or a thread exits.
    changed: Condvar,
    idle_timeout: Duration,
    name: String,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // A panicking job never holds this lock, so poisoning can only come
        // from a bug in the pool itself; keep serving with the inner state.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Fixed-but-resizable pool of worker threads draining a FIFO queue.
pub struct ThreadPool {
    shared: Arc<Shared>,
}

impl ThreadPool {
    /// Create a pool and eagerly spawn `min_threads` threads.
    pub fn new(config: PoolConfig) -> Result<Self, DroverError> {
        if config.max_threads == 0 || config.min_threads > config.max_threads {
            return Err(DroverError::Config(format!(
                "invalid pool bounds {}:{}",
                config.min_threads, config.max_threads
            )));
        }

        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                spawned: 0,
                waiting: 0,
                busy: 0,
                min_threads: config.min_threads,
                max_threads: config.max_threads,
                shutdown: false,
                handles: Vec::new(),
                next_id: 0,
            }),
            work_ready: Condvar::new(),
            changed: Condvar::new(),
            idle_timeout: config.idle_timeout,
            name: config.name,
        });

        {
            let mut state = shared.lock();
            for _ in 0..config.min_threads {
                spawn_thread(&shared, &mut state)?;
            }
        }

        Ok(Self { shared })
    }

    /// Enqueue a unit of work.
    ///
    /// Returns [`DroverError::Rejected`] once the pool is draining.
    pub fn submit(&self, job: Job) -> Result<(), DroverError> {
        let mut state = self.shared.lock();
        if state.shutdown {
            return Err(DroverError::Rejected);
        }
        state.queue.push_back(job);

        if state.waiting < state.queue.len() && state.spawned < state.max_threads {
            if let Err(e) = spawn_thread(&self.shared, &mut state) {
                // Existing threads will still drain the queue.
                error!(error = %e, "failed to spawn pool thread");
            }
        }
        drop(state);
        self.shared.work_ready.notify_one();
        Ok(())
    }

    /// Block while every thread is busy and work is already queued.
    ///
    /// Acceptors call this before taking another connection so that excess
    /// connections stay in the kernel backlog, where a less loaded process can
    /// accept them. Returns `false` if `timeout` elapsed while still full.
    pub fn wait_for_capacity(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        while !state.shutdown && is_full(&state) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
        true
    }

    /// Adjust the thread bounds. Extra threads are trimmed as they go idle.
    pub fn resize(&self, min_threads: usize, max_threads: usize) -> Result<(), DroverError> {
        if max_threads == 0 || min_threads > max_threads {
            return Err(DroverError::Config(format!(
                "invalid pool bounds {min_threads}:{max_threads}"
            )));
        }
        let mut state = self.shared.lock();
        state.min_threads = min_threads;
        state.max_threads = max_threads;
        while state.spawned < min_threads && !state.shutdown {
            spawn_thread(&self.shared, &mut state)?;
        }
        drop(state);
        // Wake idle threads so surplus ones re-check the new bounds.
        self.shared.work_ready.notify_all();
        self.shared.changed.notify_all();
        Ok(())
    }

    /// Current load snapshot.
    pub fn status(&self) -> PoolStatus {
        let state = self.shared.lock();
        PoolStatus::new(state.queue.len(), state.busy, state.max_threads)
    }

    /// Number of live threads.
    pub fn spawned(&self) -> usize {
        self.shared.lock().spawned
    }

    /// Stop accepting work, finish queued and in-flight work, and join every
    /// thread.
    pub fn drain_and_stop(&self) {
        let handles = {
            let mut state = self.shared.lock();
            state.shutdown = true;
            std::mem::take(&mut state.handles)
        };
        self.shared.work_ready.notify_all();
        self.shared.changed.notify_all();

        for handle in handles {
            if handle.join().is_err() {
                error!(pool = %self.shared.name, "pool thread panicked during drain");
            }
        }
        debug!(pool = %self.shared.name, "thread pool drained");
    }

    /// Whether [`drain_and_stop`](Self::drain_and_stop) has been called.
    pub fn is_shutdown(&self) -> bool {
        self.shared.lock().shutdown
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if !state.shutdown {
            // Let threads exit once the queue is empty; do not block the drop.
            state.shutdown = true;
            drop(state);
            self.shared.work_ready.notify_all();
            self.shared.changed.notify_all();
        }
    }
}

fn is_full(state: &PoolState) -> bool {
    state.busy >= state.max_threads && !state.queue.is_empty()
}

fn spawn_thread(shared: &Arc<Shared>, state: &mut PoolState) -> Result<(), DroverError> {
    state.handles.retain(|h| !h.is_finished());

    let id = state.next_id;
    let worker_shared = Arc::clone(shared);
    let handle = std::thread::Builder::new()
        .name(format!("{}-{id}", shared.name))
        .spawn(move || run_thread(worker_shared))
        .map_err(|e| DroverError::Spawn(format!("pool thread: {e}")))?;

    state.next_id += 1;
    state.spawned += 1;
    state.handles.push(handle);
    Ok(())
}

fn run_thread(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut state = shared.lock();
            loop {
                if let Some(job) = state.queue.pop_front() {
                    state.busy += 1;
                    break job;
                }
                if state.shutdown || state.spawned > state.max_threads {
                    state.spawned -= 1;
                    drop(state);
                    shared.changed.notify_all();
                    return;
                }

                state.waiting += 1;
                let (guard, timeout) = shared
                    .work_ready
                    .wait_timeout(state, shared.idle_timeout)
                    .unwrap_or_else(|e| e.into_inner());
                state = guard;
                state.waiting -= 1;

                if timeout.timed_out()
                    && state.queue.is_empty()
                    && state.spawned > state.min_threads
                {
                    state.spawned -= 1;
                    drop(state);
                    shared.changed.notify_all();
                    return;
                }
            }
        };

        match catch_unwind(AssertUnwindSafe(job)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(pool = %shared.name, error = %e, "unhandled error in work item"),
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                error!(pool = %shared.name, panic = %msg, "work item panicked");
            }
        }

        shared.lock().busy -= 1;
        shared.changed.notify_all();
    }
}
