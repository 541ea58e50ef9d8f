//! Group-commit flusher.
//!
//! A dedicated thread drains commit intents from a queue and answers
//! each batch with a single fsync. A batch is flushed when it reaches
//! the configured size, when the queue runs dry (keeps tail latency flat
//! for single-writer workloads), or when the batch timeout elapses.

use parking_lot::{Condvar, Mutex};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use loam_core::{Error, Result};
use tracing::error;

/// One waiter's slot in a group-commit batch.
pub struct FlushTicket {
    done: Mutex<Option<std::result::Result<(), String>>>,
    cv: Condvar,
}

impl FlushTicket {
    fn new() -> Arc<Self> {
        Arc::new(FlushTicket {
            done: Mutex::new(None),
            cv: Condvar::new(),
        })
    }

    fn complete(&self, result: std::result::Result<(), String>) {
        let mut done = self.done.lock();
        *done = Some(result);
        self.cv.notify_all();
    }

    /// Block until the batch containing this ticket has been fsynced.
    pub fn wait(&self) -> Result<()> {
        let mut done = self.done.lock();
        while done.is_none() {
            self.cv.wait(&mut done);
        }
        match done.take().expect("ticket completed") {
            Ok(()) => Ok(()),
            Err(msg) => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                msg,
            ))),
        }
    }
}

/// Handle on the flusher thread. Dropping it drains and joins.
pub struct GroupFlusher {
    tx: Mutex<Option<Sender<Arc<FlushTicket>>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl GroupFlusher {
    /// Spawn the flusher. `sync` performs the actual fsync; it is called
    /// once per batch from the flusher thread only.
    pub fn spawn(
        name: &str,
        max_batch: usize,
        batch_interval: Duration,
        sync: impl Fn() -> Result<()> + Send + 'static,
    ) -> Self {
        let (tx, rx) = std::sync::mpsc::channel::<Arc<FlushTicket>>();
        let thread_name = format!("loam-wal-flush-{}", name);
        let handle = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || flusher_loop(rx, max_batch, batch_interval, sync))
            .expect("failed to spawn WAL flusher thread");

        GroupFlusher {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Enqueue a commit intent and wait for its batch to reach disk.
    pub fn flush_and_wait(&self) -> Result<()> {
        let ticket = FlushTicket::new();
        {
            let tx = self.tx.lock();
            let tx = tx.as_ref().ok_or(Error::EngineClosed)?;
            tx.send(Arc::clone(&ticket)).map_err(|_| Error::EngineClosed)?;
        }
        ticket.wait()
    }

    /// Stop the flusher: close the queue and join the thread. Pending
    /// intents are flushed before the thread exits.
    pub fn shutdown(&self) {
        self.tx.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for GroupFlusher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn flusher_loop(
    rx: Receiver<Arc<FlushTicket>>,
    max_batch: usize,
    batch_interval: Duration,
    sync: impl Fn() -> Result<()>,
) {
    loop {
        // Block for the first intent of the next batch
        let first = match rx.recv() {
            Ok(ticket) => ticket,
            Err(_) => return,
        };

        let mut batch = vec![first];
        let deadline = Instant::now() + batch_interval;
        while batch.len() < max_batch && Instant::now() < deadline {
            match rx.try_recv() {
                Ok(ticket) => batch.push(ticket),
                // Queue dry: flush now rather than hold the batch open
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }

        let result = match sync() {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(error = %e, "group-commit fsync failed");
                Err(e.to_string())
            }
        };
        for ticket in batch {
            ticket.complete(result.clone());
        }
    }
}

/// Periodic fsync ticker for the `Interval` fsync mode.
pub struct IntervalFlusher {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl IntervalFlusher {
    pub fn spawn(name: &str, interval: Duration, sync: impl Fn() -> Result<()> + Send + 'static) -> Self {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let stop_clone = Arc::clone(&stop);
        let thread_name = format!("loam-wal-tick-{}", name);
        let handle = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let (lock, cv) = &*stop_clone;
                let mut stopped = lock.lock();
                loop {
                    if *stopped {
                        return;
                    }
                    cv.wait_for(&mut stopped, interval);
                    if *stopped {
                        return;
                    }
                    if let Err(e) = sync() {
                        error!(error = %e, "interval fsync failed");
                    }
                }
            })
            .expect("failed to spawn WAL interval thread");

        IntervalFlusher {
            stop,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn shutdown(&self) {
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

impl Drop for IntervalFlusher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn single_waiter_flushes_immediately() {
        let syncs = Arc::new(AtomicUsize::new(0));
        let syncs_clone = Arc::clone(&syncs);
        let flusher = GroupFlusher::spawn("t", 100, Duration::from_millis(50), move || {
            syncs_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        flusher.flush_and_wait().unwrap();
        assert_eq!(syncs.load(Ordering::SeqCst), 1);
        flusher.shutdown();
    }

    #[test]
    fn concurrent_waiters_share_fsyncs() {
        let syncs = Arc::new(AtomicUsize::new(0));
        let syncs_clone = Arc::clone(&syncs);
        let flusher = Arc::new(GroupFlusher::spawn(
            "t",
            100,
            Duration::from_millis(20),
            move || {
                // Make batching likely by slowing the fsync down
                std::thread::sleep(Duration::from_millis(5));
                syncs_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        ));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let f = Arc::clone(&flusher);
            handles.push(std::thread::spawn(move || f.flush_and_wait().unwrap()));
        }
        for h in handles {
            h.join().unwrap();
        }

        // Every waiter was answered, with far fewer fsyncs than waiters
        assert!(syncs.load(Ordering::SeqCst) < 32);
        flusher.shutdown();
    }

    #[test]
    fn flush_after_shutdown_errors() {
        let flusher = GroupFlusher::spawn("t", 10, Duration::from_millis(5), || Ok(()));
        flusher.shutdown();
        assert!(flusher.flush_and_wait().is_err());
    }

    #[test]
    fn fsync_failure_propagates_to_waiters() {
        let flusher = GroupFlusher::spawn("t", 10, Duration::from_millis(5), || {
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk gone",
            )))
        });
        let err = flusher.flush_and_wait().unwrap_err();
        assert!(err.to_string().contains("disk gone"));
        flusher.shutdown();
    }
}
