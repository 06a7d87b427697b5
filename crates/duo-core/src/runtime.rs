//! Deferred-flush runtime
//!
//! Writes that must not happen inside the current evaluation are queued with
//! [`Runtime::defer`] and applied at the next [`Runtime::flush`]. The runtime
//! never runs a task inline.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::{DuoError, DuoResult};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runtime configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Maximum number of drain passes a single flush may run.
    /// Tasks enqueued by tasks run in the next pass.
    pub max_flush_passes: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            max_flush_passes: 100,
        }
    }
}

impl RuntimeConfig {
    /// Single pass: any follow-up work enqueued during a flush is an error
    pub fn strict() -> Self {
        RuntimeConfig {
            max_flush_passes: 1,
        }
    }
}

/// Runtime counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub flushes: u64,
    pub tasks_run: u64,
    pub tasks_deferred: u64,
    pub limit_hits: u64,
}

struct RuntimeInner {
    queue: Mutex<VecDeque<Task>>,
    flushing: AtomicBool,
    stats: Mutex<RuntimeStats>,
    config: RuntimeConfig,
}

/// Deferred task queue with explicit flush points
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

/// Clears the flushing flag even if a task panics
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Runtime {
            inner: Arc::new(RuntimeInner {
                queue: Mutex::new(VecDeque::new()),
                flushing: AtomicBool::new(false),
                stats: Mutex::new(RuntimeStats::default()),
                config,
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Queue a task for the next flush
    pub fn defer<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.queue.lock().push_back(Box::new(task));
        self.inner.stats.lock().tasks_deferred += 1;
    }

    /// Number of queued tasks
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    pub fn stats(&self) -> RuntimeStats {
        self.inner.stats.lock().clone()
    }

    /// Run queued tasks in FIFO order until the queue is empty.
    ///
    /// Returns the number of tasks executed. If tasks are still being
    /// enqueued after `max_flush_passes` passes, the remainder stays queued
    /// and `FlushLimitExceeded` is returned.
    pub fn flush(&self) -> DuoResult<usize> {
        if self.inner.flushing.swap(true, Ordering::AcqRel) {
            return Err(DuoError::ReentrantFlush);
        }
        let _guard = FlushGuard(&self.inner.flushing);

        let max_passes = self.inner.config.max_flush_passes;
        let mut executed = 0usize;
        let mut passes = 0usize;

        loop {
            let batch = std::mem::take(&mut *self.inner.queue.lock());
            if batch.is_empty() {
                break;
            }

            if passes >= max_passes {
                let pending = {
                    let mut queue = self.inner.queue.lock();
                    for task in batch.into_iter().rev() {
                        queue.push_front(task);
                    }
                    queue.len()
                };
                self.record(executed, true);
                warn!(passes, pending, "flush pass limit exceeded");
                return Err(DuoError::FlushLimitExceeded { passes, pending });
            }

            passes += 1;
            for task in batch {
                task();
                executed += 1;
            }
        }

        self.record(executed, false);
        trace!(executed, passes, "flush complete");
        Ok(executed)
    }

    fn record(&self, executed: usize, limit_hit: bool) {
        let mut stats = self.inner.stats.lock();
        stats.flushes += 1;
        stats.tasks_run += executed as u64;
        if limit_hit {
            stats.limit_hits += 1;
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("pending", &self.pending())
            .field("config", &self.inner.config)
            .finish()
    }
}
