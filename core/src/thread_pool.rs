//! Queueing bulkhead backed by a bounded worker pool
//!
//! Calls are handed to a fixed set of worker threads through a bounded queue.
//! Once every worker is busy and the queue is full, further submissions are
//! rejected immediately, without waiting.

use crate::callbacks::{ComponentKind, Decision, EventSinks};
use crate::errors::{ConfigError, Rejection};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Thread pool bulkhead configuration
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ThreadPoolBulkheadConfig {
    /// Number of worker threads (maximum concurrently running calls)
    pub max_thread_pool_size: usize,
    /// Calls that may wait for a free worker
    pub queue_capacity: usize,
}

impl Default for ThreadPoolBulkheadConfig {
    fn default() -> Self {
        Self {
            max_thread_pool_size: thread::available_parallelism().map_or(4, |n| n.get()),
            queue_capacity: 100,
        }
    }
}

impl ThreadPoolBulkheadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_thread_pool_size == 0 {
            return Err(ConfigError::Zero {
                field: "max_thread_pool_size",
            });
        }
        Ok(())
    }
}

/// Point-in-time pool usage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadPoolBulkheadMetrics {
    pub thread_pool_size: usize,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    /// Calls queued or running
    pub occupied: usize,
}

/// Why a submitted call produced no value
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    #[error("Call did not complete within the wait")]
    TimedOut,
    #[error("Thread pool shut down before the call completed")]
    Abandoned,
}

#[derive(Default)]
struct Queue {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

/// Bulkhead running calls on its own bounded pool of threads
pub struct ThreadPoolBulkhead {
    name: String,
    config: ThreadPoolBulkheadConfig,
    shared: Arc<Shared>,
    occupied: Arc<AtomicUsize>,
    workers: Vec<JoinHandle<()>>,
    sinks: EventSinks,
}

impl ThreadPoolBulkhead {
    /// Spawn the worker threads
    ///
    /// # Panics
    ///
    /// Panics if `config` fails [`ThreadPoolBulkheadConfig::validate`].
    pub fn with_config(
        name: impl Into<String>,
        config: ThreadPoolBulkheadConfig,
    ) -> std::io::Result<Self> {
        if let Err(e) = config.validate() {
            panic!("Invalid thread pool bulkhead configuration: {}", e);
        }
        let name = name.into();
        let shared = Arc::new(Shared::default());

        let workers = (0..config.max_thread_pool_size)
            .map(|i| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("{}-bulkhead-{}", name, i))
                    .spawn(move || worker_loop(&shared))
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        Ok(Self {
            name,
            config,
            shared,
            occupied: Arc::new(AtomicUsize::new(0)),
            workers,
            sinks: EventSinks::new(),
        })
    }

    /// Attach event sinks for admission decisions
    pub fn with_sinks(mut self, sinks: EventSinks) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Calls the pool accepts at once: running plus queued
    pub fn capacity(&self) -> usize {
        self.config.max_thread_pool_size + self.config.queue_capacity
    }

    /// Queue `f` for execution, or reject it if the pool and queue are full
    pub fn submit<F, T>(&self, f: F) -> Result<CallHandle<T>, Rejection>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if !self.try_occupy() {
            tracing::event!(
                name: "resilience.thread_pool_bulkhead.rejected",
                tracing::Level::WARN,
                bulkhead.name = %self.name,
                bulkhead.capacity = self.capacity(),
            );
            self.sinks.admission(
                ComponentKind::ThreadPoolBulkhead,
                &self.name,
                Decision::Rejected,
                Some("pool and queue full".to_string()),
            );
            return Err(Rejection::BulkheadFull {
                bulkhead: self.name.clone(),
                limit: self.capacity(),
            });
        }

        let slot = OccupiedSlot {
            occupied: Arc::clone(&self.occupied),
        };
        let (tx, rx) = mpsc::sync_channel(1);
        let job: Job = Box::new(move || {
            let _slot = slot;
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
            // The caller may have stopped waiting
            let _ = tx.send(result);
        });

        {
            let mut queue = self
                .shared
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            queue.jobs.push_back(job);
        }
        self.shared.available.notify_one();

        self.sinks.admission(
            ComponentKind::ThreadPoolBulkhead,
            &self.name,
            Decision::Permitted,
            None,
        );
        Ok(CallHandle { rx })
    }

    fn try_occupy(&self) -> bool {
        let capacity = self.capacity();
        self.occupied
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(n + 1)
            })
            .is_ok()
    }

    pub fn metrics(&self) -> ThreadPoolBulkheadMetrics {
        let queue_depth = self
            .shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .jobs
            .len();
        ThreadPoolBulkheadMetrics {
            thread_pool_size: self.config.max_thread_pool_size,
            queue_depth,
            queue_capacity: self.config.queue_capacity,
            occupied: self.occupied.load(Ordering::Acquire),
        }
    }
}

impl Drop for ThreadPoolBulkhead {
    fn drop(&mut self) {
        {
            let mut queue = self
                .shared
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            queue.shutdown = true;
        }
        self.shared.available.notify_all();

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for ThreadPoolBulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPoolBulkhead")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("occupied", &self.occupied.load(Ordering::Relaxed))
            .finish()
    }
}

/// Workers drain the queue before honouring shutdown
fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if queue.shutdown {
                    return;
                }
                queue = shared
                    .available
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        job();
    }
}

/// Frees one unit of pool capacity when the job finishes or is dropped
struct OccupiedSlot {
    occupied: Arc<AtomicUsize>,
}

impl Drop for OccupiedSlot {
    fn drop(&mut self) {
        self.occupied.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Handle to the result of a submitted call
#[derive(Debug)]
pub struct CallHandle<T> {
    rx: Receiver<thread::Result<T>>,
}

impl<T> CallHandle<T> {
    /// Block until the call finishes
    ///
    /// A panic inside the call is resumed on the waiting thread.
    pub fn join(self) -> Result<T, JoinError> {
        match self.rx.recv() {
            Ok(result) => Ok(unwind(result)),
            Err(_) => Err(JoinError::Abandoned),
        }
    }

    /// Block up to `timeout` for the call to finish
    ///
    /// On timeout the call keeps running on its worker and keeps its slot.
    pub fn join_timeout(&self, timeout: Duration) -> Result<T, JoinError> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Ok(unwind(result)),
            Err(RecvTimeoutError::Timeout) => Err(JoinError::TimedOut),
            Err(RecvTimeoutError::Disconnected) => Err(JoinError::Abandoned),
        }
    }
}

fn unwind<T>(result: thread::Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}
