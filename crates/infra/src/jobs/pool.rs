//! Bounded worker pool running job executions.
//!
//! Up to `core` workers are started on demand and stay alive; further tasks
//! queue up to `queue_size`; when the queue is full extra workers are started
//! up to `max`, and those exit after `keep_alive` without work. Beyond that,
//! `submit` blocks until a worker frees a queue slot. Once the pool is closed
//! every submission is rejected and left to the caller.

use std::collections::{BTreeMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::JobExecutorConfig;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("worker pool '{pool}' rejected task '{label}'")]
pub struct Rejected {
    pub pool: String,
    pub label: String,
}

/// Outcome of [`ThreadPool::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every worker exited within the timeout.
    pub terminated: bool,
    /// Labels of tasks still running when the timeout expired.
    pub still_running: Vec<String>,
    /// Tasks still queued when the timeout expired.
    pub queued: usize,
}

struct QueuedTask {
    label: String,
    task: Task,
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<QueuedTask>,
    workers: usize,
    running: BTreeMap<u64, String>,
    next_task_id: u64,
    accepting: bool,
}

struct Shared {
    name: String,
    core: usize,
    max: usize,
    queue_size: usize,
    keep_alive: Duration,
    state: Mutex<PoolState>,
    work_available: Condvar,
    space_available: Condvar,
    workers_changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next task for a worker, or `None` once the worker should exit. A
    /// worker that gets `None` has already been removed from the count.
    fn next_task(&self) -> Option<QueuedTask> {
        let mut state = self.lock();
        loop {
            if let Some(task) = state.queue.pop_front() {
                self.space_available.notify_one();
                return Some(task);
            }
            if !state.accepting {
                break;
            }
            if state.workers > self.core {
                let (guard, timeout) = self
                    .work_available
                    .wait_timeout(state, self.keep_alive)
                    .unwrap_or_else(PoisonError::into_inner);
                state = guard;
                if timeout.timed_out() && state.queue.is_empty() && state.workers > self.core {
                    debug!(pool = %self.name, "idle worker above core size exits");
                    break;
                }
            } else {
                state = self
                    .work_available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
        state.workers -= 1;
        self.workers_changed.notify_all();
        None
    }
}

pub struct ThreadPool {
    shared: Arc<Shared>,
}

impl ThreadPool {
    pub fn new(name: impl Into<String>, core: usize, max: usize, queue_size: usize, keep_alive: Duration) -> Self {
        let core = core.max(1);
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                core,
                max: max.max(core),
                queue_size,
                keep_alive,
                state: Mutex::new(PoolState {
                    accepting: true,
                    ..Default::default()
                }),
                work_available: Condvar::new(),
                space_available: Condvar::new(),
                workers_changed: Condvar::new(),
            }),
        }
    }

    pub fn from_config(config: &JobExecutorConfig) -> Self {
        Self::new(
            config.name.as_str(),
            config.core_pool_size,
            config.max_pool_size,
            config.queue_size,
            config.keep_alive,
        )
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Submit a task, blocking while every worker is busy and the queue is
    /// full. Fails only once the pool is closed.
    pub fn submit(&self, label: impl Into<String>, task: Task) -> Result<(), Rejected> {
        let queued = QueuedTask {
            label: label.into(),
            task,
        };
        let mut state = self.shared.lock();
        loop {
            if !state.accepting {
                return Err(self.rejected(queued.label));
            }
            if state.workers < self.shared.core {
                return self.spawn_worker(&mut state, queued);
            }
            if state.queue.len() < self.shared.queue_size {
                state.queue.push_back(queued);
                self.shared.work_available.notify_one();
                return Ok(());
            }
            if state.workers < self.shared.max {
                return self.spawn_worker(&mut state, queued);
            }
            debug!(pool = %self.shared.name, task = %queued.label, "pool saturated, waiting");
            state = self
                .shared
                .space_available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn rejected(&self, label: String) -> Rejected {
        Rejected {
            pool: self.shared.name.clone(),
            label,
        }
    }

    fn spawn_worker(&self, state: &mut PoolState, first: QueuedTask) -> Result<(), Rejected> {
        let shared = Arc::clone(&self.shared);
        let label = first.label.clone();
        let worker_name = format!("{}-worker-{}", self.shared.name, state.workers);
        match thread::Builder::new()
            .name(worker_name)
            .spawn(move || worker_loop(shared, first))
        {
            Ok(_) => {
                state.workers += 1;
                Ok(())
            }
            Err(err) => {
                error!(pool = %self.shared.name, error = %err, "failed to spawn worker");
                Err(self.rejected(label))
            }
        }
    }

    pub fn pool_size(&self) -> usize {
        self.shared.lock().workers
    }

    pub fn active_count(&self) -> usize {
        self.shared.lock().running.len()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.lock().accepting
    }

    /// Stop accepting tasks. Blocked submitters are released with an error;
    /// queued tasks still run.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        state.accepting = false;
        self.shared.work_available.notify_all();
        self.shared.space_available.notify_all();
    }

    /// Close the pool, let queued and running tasks finish, and wait up to
    /// `timeout` for the workers to exit.
    pub fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        self.close();
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();

        while state.workers > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            state = self
                .shared
                .workers_changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        let report = ShutdownReport {
            terminated: state.workers == 0,
            still_running: state.running.values().cloned().collect(),
            queued: state.queue.len(),
        };
        if report.terminated {
            info!(pool = %self.shared.name, "worker pool terminated");
        } else {
            warn!(
                pool = %self.shared.name,
                timeout_ms = timeout.as_millis() as u64,
                still_running = ?report.still_running,
                queued = report.queued,
                "worker pool did not terminate in time"
            );
        }
        report
    }
}

impl core::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("ThreadPool")
            .field("name", &self.shared.name)
            .field("workers", &state.workers)
            .field("running", &state.running.len())
            .field("queued", &state.queue.len())
            .finish()
    }
}

fn worker_loop(shared: Arc<Shared>, first: QueuedTask) {
    let mut next = Some(first);
    while let Some(QueuedTask { label, task }) = next.take().or_else(|| shared.next_task()) {
        let task_id = {
            let mut state = shared.lock();
            let id = state.next_task_id;
            state.next_task_id += 1;
            state.running.insert(id, label.clone());
            id
        };

        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!(pool = %shared.name, task = %label, "task panicked");
        }

        shared.lock().running.remove(&task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    fn blocking_task(release: &Arc<(Mutex<bool>, Condvar)>) -> Task {
        let release = Arc::clone(release);
        Box::new(move || {
            let (lock, cvar) = &*release;
            let mut open = lock.lock().unwrap();
            while !*open {
                open = cvar.wait(open).unwrap();
            }
        })
    }

    fn open(release: &Arc<(Mutex<bool>, Condvar)>) {
        let (lock, cvar) = &**release;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    #[test]
    fn runs_submitted_tasks() {
        let pool = ThreadPool::new("test", 2, 2, 10, Duration::from_secs(1));
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..8 {
            let counter = Arc::clone(&counter);
            pool.submit(format!("t{i}"), Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }

        let report = pool.shutdown(Duration::from_secs(5));

        assert!(report.terminated);
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn submission_blocks_while_the_pool_is_saturated() {
        let pool = Arc::new(ThreadPool::new("test", 1, 2, 1, Duration::from_secs(1)));
        let release = Arc::new((Mutex::new(false), Condvar::new()));

        pool.submit("core", blocking_task(&release)).unwrap();
        pool.submit("queued", blocking_task(&release)).unwrap();
        pool.submit("extra", blocking_task(&release)).unwrap();
        assert_eq!(pool.pool_size(), 2);

        let (done_tx, done_rx) = mpsc::channel();
        let submitter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let result = pool.submit("overflow", Box::new(|| {}));
                done_tx.send(result).unwrap();
            })
        };
        assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());

        open(&release);
        assert!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap().is_ok());
        submitter.join().unwrap();
        assert!(pool.shutdown(Duration::from_secs(5)).terminated);
    }

    #[test]
    fn closing_releases_blocked_submitters() {
        let pool = Arc::new(ThreadPool::new("test", 1, 1, 1, Duration::from_secs(1)));
        let release = Arc::new((Mutex::new(false), Condvar::new()));
        pool.submit("running", blocking_task(&release)).unwrap();
        pool.submit("queued", blocking_task(&release)).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                done_tx.send(pool.submit("blocked", Box::new(|| {}))).unwrap();
            });
        }
        assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());

        pool.close();
        let rejected = done_rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap_err();
        assert_eq!(rejected.label, "blocked");
        assert!(pool.submit("late", Box::new(|| {})).is_err());

        open(&release);
        let report = pool.shutdown(Duration::from_secs(5));
        assert!(report.terminated);
        assert_eq!(report.queued, 0);
    }

    #[test]
    fn shutdown_reports_tasks_that_outlive_the_timeout() {
        let pool = ThreadPool::new("test", 1, 1, 1, Duration::from_secs(1));
        let release = Arc::new((Mutex::new(false), Condvar::new()));
        let (started_tx, started_rx) = mpsc::channel();
        let blocked = blocking_task(&release);
        pool.submit("slow-job", Box::new(move || {
            started_tx.send(()).unwrap();
            blocked();
        }))
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let report = pool.shutdown(Duration::from_millis(50));

        assert!(!report.terminated);
        assert_eq!(report.still_running, vec!["slow-job".to_string()]);
        open(&release);
        assert!(pool.shutdown(Duration::from_secs(5)).terminated);
    }

    #[test]
    fn a_panicking_task_does_not_kill_the_worker() {
        let pool = ThreadPool::new("test", 1, 1, 4, Duration::from_secs(1));
        let counter = Arc::new(AtomicUsize::new(0));
        pool.submit("panics", Box::new(|| panic!("job bug"))).unwrap();
        let after = Arc::clone(&counter);
        pool.submit("after", Box::new(move || {
            after.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        assert!(pool.shutdown(Duration::from_secs(5)).terminated);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn extra_workers_exit_after_keep_alive() {
        let pool = ThreadPool::new("test", 1, 2, 1, Duration::from_millis(20));
        let release = Arc::new((Mutex::new(false), Condvar::new()));
        for label in ["core", "queued", "extra"] {
            pool.submit(label, blocking_task(&release)).unwrap();
        }
        assert_eq!(pool.pool_size(), 2);
        open(&release);

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.pool_size() > 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.pool_size(), 1);
        assert!(pool.shutdown(Duration::from_secs(5)).terminated);
    }
}
