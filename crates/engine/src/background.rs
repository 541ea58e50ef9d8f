//! Background work scheduling.
//!
//! A priority task queue with a fixed pool of worker threads, plus the
//! [`Ticker`] that feeds it on a period. Garbage collection,
//! checkpointing, pool health and healing scans all run through here so
//! each engine owns its own, independently shut down, workers.

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::warn;

/// Priority levels for background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    /// GC, version collection, healing scans
    Low = 0,
    /// Checkpointing, WAL trimming
    Normal = 1,
    /// User-initiated flushes
    High = 2,
}

/// Scheduler counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerStats {
    pub queue_depth: usize,
    pub active_tasks: usize,
    pub tasks_completed: u64,
    pub worker_count: usize,
}

struct TaskEnvelope {
    priority: TaskPriority,
    sequence: u64,
    work: Box<dyn FnOnce() + Send>,
}

impl Eq for TaskEnvelope {}

impl PartialEq for TaskEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

// Higher priority first; within a priority, older first
impl Ord for TaskEnvelope {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for TaskEnvelope {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct SchedulerInner {
    queue: Mutex<BinaryHeap<TaskEnvelope>>,
    work_ready: Condvar,
    shutdown: AtomicBool,
    sequence: AtomicU64,
    queue_depth: AtomicUsize,
    active_tasks: AtomicUsize,
    max_queue_depth: usize,
    tasks_completed: AtomicU64,
}

/// Fixed-pool background scheduler. Tasks that would overflow the queue
/// are dropped with a warning; background work is always re-issued by
/// its ticker.
pub struct BackgroundScheduler {
    inner: Arc<SchedulerInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl BackgroundScheduler {
    /// Workers are named `loam-bg-<n>`.
    pub fn new(worker_count: usize, max_queue_depth: usize) -> Self {
        let inner = Arc::new(SchedulerInner {
            queue: Mutex::new(BinaryHeap::new()),
            work_ready: Condvar::new(),
            shutdown: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            queue_depth: AtomicUsize::new(0),
            active_tasks: AtomicUsize::new(0),
            max_queue_depth,
            tasks_completed: AtomicU64::new(0),
        });

        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let inner_clone = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("loam-bg-{}", i))
                .spawn(move || worker_loop(&inner_clone))
                .expect("failed to spawn background worker thread");
            workers.push(handle);
        }

        BackgroundScheduler {
            inner,
            workers: Mutex::new(workers),
            worker_count,
        }
    }

    /// Submit a task. Returns false if the queue is full or the
    /// scheduler is shut down.
    pub fn submit(&self, priority: TaskPriority, work: impl FnOnce() + Send + 'static) -> bool {
        if self.inner.shutdown.load(AtomicOrdering::Acquire) {
            return false;
        }
        if self.inner.queue_depth.load(AtomicOrdering::Acquire) >= self.inner.max_queue_depth {
            warn!("background queue full, dropping task");
            return false;
        }

        let sequence = self.inner.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        let envelope = TaskEnvelope {
            priority,
            sequence,
            work: Box::new(work),
        };
        {
            let mut queue = self.inner.queue.lock();
            queue.push(envelope);
            self.inner.queue_depth.fetch_add(1, AtomicOrdering::Release);
        }
        self.inner.work_ready.notify_one();
        true
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            queue_depth: self.inner.queue_depth.load(AtomicOrdering::Acquire),
            active_tasks: self.inner.active_tasks.load(AtomicOrdering::Acquire),
            tasks_completed: self.inner.tasks_completed.load(AtomicOrdering::Relaxed),
            worker_count: self.worker_count,
        }
    }

    /// Signal workers to finish queued work and exit, then join them.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, AtomicOrdering::Release);
        // Take the queue lock before notifying so a worker between its
        // shutdown check and its wait cannot miss the wakeup
        {
            let _queue = self.inner.queue.lock();
            self.inner.work_ready.notify_all();
        }
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for BackgroundScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: &SchedulerInner) {
    loop {
        let envelope = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(envelope) = queue.pop() {
                    inner.queue_depth.fetch_sub(1, AtomicOrdering::Release);
                    break envelope;
                }
                if inner.shutdown.load(AtomicOrdering::Acquire) {
                    return;
                }
                inner.work_ready.wait(&mut queue);
            }
        };

        inner.active_tasks.fetch_add(1, AtomicOrdering::Release);
        (envelope.work)();
        inner.active_tasks.fetch_sub(1, AtomicOrdering::Release);
        inner.tasks_completed.fetch_add(1, AtomicOrdering::Relaxed);
    }
}

/// Periodic trigger. Runs `tick` every `period` on its own thread until
/// stopped; the closure usually just submits into the scheduler.
pub struct Ticker {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Ticker {
    pub fn spawn(name: &str, period: Duration, tick: impl Fn() + Send + 'static) -> Self {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let stop_clone = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name(format!("loam-tick-{}", name))
            .spawn(move || {
                let (lock, cv) = &*stop_clone;
                let mut stopped = lock.lock();
                loop {
                    if *stopped {
                        return;
                    }
                    cv.wait_for(&mut stopped, period);
                    if *stopped {
                        return;
                    }
                    tick();
                }
            })
            .expect("failed to spawn ticker thread");

        Ticker {
            stop,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn stop(&self) {
        {
            let (lock, cv) = &*self.stop;
            *lock.lock() = true;
            cv.notify_all();
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn executes_submitted_tasks() {
        let scheduler = BackgroundScheduler::new(2, 16);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let c = Arc::clone(&counter);
            assert!(scheduler.submit(TaskPriority::Normal, move || {
                c.fetch_add(1, AtomicOrdering::SeqCst);
            }));
        }
        // Wait for completion
        for _ in 0..100 {
            if counter.load(AtomicOrdering::SeqCst) == 8 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 8);
        scheduler.shutdown();
        assert!(!scheduler.submit(TaskPriority::Low, || {}));
    }

    #[test]
    fn ticker_fires_until_stopped() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let ticker = Ticker::spawn("test", Duration::from_millis(10), move || {
            c.fetch_add(1, AtomicOrdering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(100));
        ticker.stop();
        let after_stop = counter.load(AtomicOrdering::SeqCst);
        assert!(after_stop >= 2, "ticked {} times", after_stop);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(counter.load(AtomicOrdering::SeqCst), after_stop);
    }
}
